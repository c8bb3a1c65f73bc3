// SPDX-License-Identifier: MIT OR Apache-2.0

//! Immutable activation cache for a single forward pass.

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::Tensor;

use crate::backend::ModelSignature;
use crate::error::{MIError, Result};
use crate::hooks::{HookCache, HookPoint};

/// Snapshot of one forward pass: the output logits and every captured
/// activation, keyed by [`HookPoint`].
///
/// The cache is never mutated after capture. Cloning is cheap (the capture
/// map is shared), so a clean run's cache can be handed to every patching
/// iteration by reference or by clone.
///
/// Each cache remembers the [`ModelSignature`] of the model that produced
/// it; analyses call [`ensure_compatible`](Self::ensure_compatible) before
/// reading from it.
#[derive(Debug, Clone)]
pub struct ActivationCache {
    /// Output logits, `[batch, seq, vocab]`.
    logits: Tensor,
    /// Captured activations keyed by hook point.
    captures: Arc<HashMap<HookPoint, Tensor>>,
    /// Configuration of the producing model.
    signature: ModelSignature,
}

impl ActivationCache {
    /// Freeze a backend's [`HookCache`].
    pub(crate) fn from_hook_cache(cache: HookCache, signature: ModelSignature) -> Self {
        let (logits, captures) = cache.into_parts();
        Self {
            logits,
            captures: Arc::new(captures),
            signature,
        }
    }

    /// Output logits, `[batch, seq, vocab]`.
    #[must_use]
    pub const fn logits(&self) -> &Tensor {
        &self.logits
    }

    /// Consume the cache and return the logits.
    #[must_use]
    pub fn into_logits(self) -> Tensor {
        self.logits
    }

    /// Configuration of the model that produced this cache.
    #[must_use]
    pub const fn signature(&self) -> ModelSignature {
        self.signature
    }

    /// Fail fast if this cache came from a differently configured model.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::ConfigMismatch`] on mismatch.
    pub fn ensure_compatible(&self, model: &ModelSignature) -> Result<()> {
        model.ensure_matches(&self.signature)
    }

    /// Retrieve a captured tensor by hook point.
    #[must_use]
    pub fn get(&self, hook: &HookPoint) -> Option<&Tensor> {
        self.captures.get(hook)
    }

    /// Retrieve a captured tensor, returning an error if not found.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Hook`] if the hook point was not captured.
    pub fn require(&self, hook: &HookPoint) -> Result<&Tensor> {
        self.captures
            .get(hook)
            .ok_or_else(|| MIError::Hook(format!("hook point `{hook}` was not captured")))
    }

    /// Residual-stream activation of the first batch element.
    ///
    /// # Shapes
    /// - returns: `[seq, d_model]`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Hook`] if the hook was not captured or is not
    /// residual-shaped.
    pub fn residual(&self, hook: &HookPoint) -> Result<Tensor> {
        if !hook.is_residual_shaped() {
            return Err(MIError::Hook(format!(
                "hook point `{hook}` is not in the residual stream"
            )));
        }
        Ok(self.require(hook)?.get(0)?)
    }

    /// Residual-stream activation at one position.
    ///
    /// # Shapes
    /// - returns: `[d_model]`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Hook`] if the hook is missing or the position is
    /// out of range.
    pub fn residual_at(&self, hook: &HookPoint, position: usize) -> Result<Tensor> {
        let resid = self.residual(hook)?;
        let seq_len = resid.dim(0)?;
        if position >= seq_len {
            return Err(MIError::Hook(format!(
                "position {position} out of range (seq_len={seq_len})"
            )));
        }
        Ok(resid.get(position)?)
    }

    /// Number of captured tensors (excludes the logits).
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }

    /// Captured hook points, sorted by kind then layer.
    #[must_use]
    pub fn hook_points(&self) -> Vec<HookPoint> {
        let mut points: Vec<HookPoint> = self.captures.keys().copied().collect();
        points.sort();
        points
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

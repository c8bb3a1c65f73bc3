// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core backend trait and model wrapper.
//!
//! [`MIBackend`] is the trait that every model backend implements.
//! [`MIModel`] wraps a backend with device metadata and the three forward
//! entry points the analyses need: plain logits, run-with-cache and
//! run-with-hooks.

use std::fmt;
use std::path::Path;

use candle_core::{DType, Device, Tensor};

use crate::cache::ActivationCache;
use crate::config::GraphTransformerConfig;
use crate::error::{MIError, Result};
use crate::hooks::{HookCache, HookPoint, HookSpec};
use crate::transformer::GraphTransformer;

// ---------------------------------------------------------------------------
// ModelSignature
// ---------------------------------------------------------------------------

/// The configuration axes that must agree between a model and any cache
/// or lens used with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ModelSignature {
    /// Number of layers.
    pub num_layers: usize,
    /// Hidden dimension (`d_model`).
    pub hidden_size: usize,
    /// Vocabulary size.
    pub vocab_size: usize,
}

impl ModelSignature {
    /// Fail fast when `found` was produced by a different configuration.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::ConfigMismatch`] if the signatures differ.
    pub fn ensure_matches(&self, found: &Self) -> Result<()> {
        if self == found {
            Ok(())
        } else {
            Err(MIError::ConfigMismatch {
                expected: *self,
                found: *found,
            })
        }
    }
}

impl fmt::Display for ModelSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} layers, d_model={}, d_vocab={}",
            self.num_layers, self.hidden_size, self.vocab_size
        )
    }
}

// ---------------------------------------------------------------------------
// MIBackend trait
// ---------------------------------------------------------------------------

/// Unified interface for model backends with hook-aware forward passes.
///
/// The single [`forward`](Self::forward) method serves every analysis:
/// the caller specifies captures and interventions via [`HookSpec`], and
/// the backend returns a [`HookCache`] containing the logits plus any
/// requested activations.
pub trait MIBackend: Send + Sync {
    // --- Metadata --------------------------------------------------------

    /// Number of layers (transformer blocks).
    fn num_layers(&self) -> usize;

    /// Hidden dimension (`d_model`).
    fn hidden_size(&self) -> usize;

    /// Vocabulary size.
    fn vocab_size(&self) -> usize;

    /// Number of attention heads.
    fn num_heads(&self) -> usize;

    /// Maximum supported sequence length.
    fn max_seq_len(&self) -> usize;

    // --- Core forward pass -----------------------------------------------

    /// Unified forward pass with optional hook capture and interventions.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]` -- token IDs
    /// - returns: [`HookCache`] containing `logits` at `[batch, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Model`] on tensor operation failures and
    /// [`MIError::Intervention`] if an intervention is invalid for
    /// the current model dimensions.
    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache>;

    // --- Logit projection ------------------------------------------------

    /// The output unembedding matrix `W_U`.
    ///
    /// # Shapes
    /// - returns: `[hidden_size, vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Model`] on tensor operation failure.
    fn unembedding(&self) -> Result<Tensor>;
}

// ---------------------------------------------------------------------------
// MIModel
// ---------------------------------------------------------------------------

/// High-level model wrapper combining a backend with device metadata.
pub struct MIModel {
    /// The underlying model backend.
    // TRAIT_OBJECT: heterogeneous model backends require dynamic dispatch
    backend: Box<dyn MIBackend>,
    /// The device this model lives on.
    device: Device,
}

impl MIModel {
    /// Load a [`GraphTransformer`] checkpoint.
    ///
    /// `config_path` is the JSON form of the model's
    /// `HookedTransformerConfig`; `weights_path` a safetensors file whose
    /// tensor names follow the `TransformerLens` state dict
    /// (`embed.W_E`, `blocks.0.attn.W_Q`, ...).
    ///
    /// # `DType` selection
    ///
    /// - **CUDA**: `BF16`
    /// - **CPU**: `F32` for full precision
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Config`] if the config is invalid,
    /// [`MIError::Io`] if the weights file cannot be read, or
    /// [`MIError::Model`] if weight loading fails.
    pub fn from_safetensors(config_path: &Path, weights_path: &Path, device: &Device) -> Result<Self> {
        let config = GraphTransformerConfig::from_file(config_path)?;
        let dtype = if device.is_cuda() {
            DType::BF16
        } else {
            DType::F32
        };

        let vb = create_var_builder(weights_path, dtype, device)?;
        let transformer = GraphTransformer::load(config, vb)?;

        tracing::info!(
            layers = transformer.config().num_layers,
            d_model = transformer.config().hidden_size,
            d_vocab = transformer.config().vocab_size,
            "loaded graph transformer from {}",
            weights_path.display()
        );

        Ok(Self::new(Box::new(transformer), device.clone()))
    }

    /// Wrap an existing backend.
    // TRAIT_OBJECT: heterogeneous model backends require dynamic dispatch
    #[must_use]
    pub fn new(backend: Box<dyn MIBackend>, device: Device) -> Self {
        Self { backend, device }
    }

    /// The device this model lives on.
    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// Number of layers.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.backend.num_layers()
    }

    /// Hidden dimension.
    #[must_use]
    pub fn hidden_size(&self) -> usize {
        self.backend.hidden_size()
    }

    /// Vocabulary size.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.backend.vocab_size()
    }

    /// Number of attention heads.
    #[must_use]
    pub fn num_heads(&self) -> usize {
        self.backend.num_heads()
    }

    /// Configuration signature used for cache and lens compatibility checks.
    #[must_use]
    pub fn signature(&self) -> ModelSignature {
        ModelSignature {
            num_layers: self.num_layers(),
            hidden_size: self.hidden_size(),
            vocab_size: self.vocab_size(),
        }
    }

    /// Run a forward pass over a single token sequence with the given hook
    /// specification.
    ///
    /// # Shapes
    /// - `tokens`: `[seq]` -- token IDs (batch of one)
    /// - returns: [`ActivationCache`] with `logits` at `[1, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Intervention`] for an empty or over-long sequence
    /// and propagates errors from the underlying backend.
    pub fn forward(&self, tokens: &[u32], hooks: &HookSpec) -> Result<ActivationCache> {
        let input_ids = self.input_ids(tokens)?;
        let cache = self.backend.forward(&input_ids, hooks)?;
        Ok(ActivationCache::from_hook_cache(cache, self.signature()))
    }

    /// Plain forward pass returning logits.
    ///
    /// # Shapes
    /// - returns: `[1, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying backend.
    pub fn logits(&self, tokens: &[u32]) -> Result<Tensor> {
        Ok(self.forward(tokens, &HookSpec::new())?.into_logits())
    }

    /// Forward pass capturing the activations at `hooks`.
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying backend.
    pub fn run_with_cache(&self, tokens: &[u32], hooks: &[HookPoint]) -> Result<ActivationCache> {
        let mut spec = HookSpec::new();
        for hook in hooks {
            spec.capture(*hook);
        }
        self.forward(tokens, &spec)
    }

    /// Forward pass with interventions, returning logits.
    ///
    /// # Shapes
    /// - returns: `[1, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying backend and interventions.
    pub fn run_with_hooks(&self, tokens: &[u32], hooks: &HookSpec) -> Result<Tensor> {
        Ok(self.forward(tokens, hooks)?.into_logits())
    }

    /// The unembedding matrix `W_U`, the native logit-lens decoder.
    ///
    /// # Shapes
    /// - returns: `[hidden_size, vocab_size]`
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying backend.
    pub fn unembedding(&self) -> Result<Tensor> {
        self.backend.unembedding()
    }

    /// Access the underlying backend (e.g., for backend-specific methods).
    // TRAIT_OBJECT: caller needs dynamic dispatch for backend-specific methods
    #[must_use]
    pub fn backend(&self) -> &dyn MIBackend {
        &*self.backend
    }

    /// Validate and upload a token sequence as a `[1, seq]` tensor.
    fn input_ids(&self, tokens: &[u32]) -> Result<Tensor> {
        if tokens.is_empty() {
            return Err(MIError::Intervention("empty token sequence".into()));
        }
        let max = self.backend.max_seq_len();
        if tokens.len() > max {
            return Err(MIError::Intervention(format!(
                "sequence length {} exceeds n_ctx={max}",
                tokens.len()
            )));
        }
        let vocab = self.vocab_size();
        if let Some(bad) = tokens.iter().find(|&&t| usize::try_from(t).map_or(true, |t| t >= vocab)) {
            return Err(MIError::Intervention(format!(
                "token id {bad} out of range (d_vocab={vocab})"
            )));
        }
        Ok(Tensor::new(tokens, &self.device)?.unsqueeze(0)?)
    }
}

// ---------------------------------------------------------------------------
// Weight loading helpers (used by from_safetensors)
// ---------------------------------------------------------------------------

/// Create a `VarBuilder` from a safetensors checkpoint.
///
/// Uses buffered (safe) loading by default. With the `mmap` feature,
/// uses memory-mapped loading for reduced memory overhead.
fn create_var_builder(
    path: &Path,
    dtype: DType,
    device: &Device,
) -> Result<candle_nn::VarBuilder<'static>> {
    #[cfg(feature = "mmap")]
    {
        mmap_var_builder(path, dtype, device)
    }
    #[cfg(not(feature = "mmap"))]
    {
        buffered_var_builder(path, dtype, device)
    }
}

/// Load weights via buffered (safe) reading; reads all data into RAM.
///
/// A file that cannot be read is an [`MIError::Io`].
#[cfg(not(feature = "mmap"))]
fn buffered_var_builder(
    path: &Path,
    dtype: DType,
    device: &Device,
) -> Result<candle_nn::VarBuilder<'static>> {
    let data = std::fs::read(path)?;
    let vb = candle_nn::VarBuilder::from_buffered_safetensors(data, dtype, device)?;
    Ok(vb)
}

/// Load weights via memory-mapped files.
///
/// # Safety
///
/// The safetensors file must not be modified while the model is loaded.
/// This is the standard invariant for memory-mapped files.
#[cfg(feature = "mmap")]
#[allow(unsafe_code)]
fn mmap_var_builder(
    path: &Path,
    dtype: DType,
    device: &Device,
) -> Result<candle_nn::VarBuilder<'static>> {
    // SAFETY: the safetensors file must not be modified while loaded.
    let vb = unsafe { candle_nn::VarBuilder::from_mmaped_safetensors(&[path], dtype, device)? };
    Ok(vb)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

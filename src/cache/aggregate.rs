// SPDX-License-Identifier: MIT OR Apache-2.0

//! Host-side accumulation of activations across many task instances.

use std::collections::BTreeMap;

use candle_core::{Device, Tensor};

use crate::cache::ActivationCache;
use crate::error::{MIError, Result};
use crate::hooks::HookPoint;

/// Activations for a fixed set of hook points, accumulated over accepted
/// task instances.
///
/// `activations[hook][i]` belongs to `instances[i]`. Every stored tensor
/// lives on the CPU, detached from the producing computation.
#[derive(Debug, Clone)]
pub struct AggregatedActivations<I> {
    /// Per-hook-point tensors, in acceptance order.
    activations: BTreeMap<HookPoint, Vec<Tensor>>,
    /// Accepted instances, parallel to each activation list.
    instances: Vec<I>,
    /// Total generated instances, accepted or not.
    attempts: usize,
    /// Instances rejected by the correctness oracle.
    rejected: usize,
}

impl<I> AggregatedActivations<I> {
    /// Create an empty accumulator for the given hook points.
    #[must_use]
    pub fn new(hooks: &[HookPoint]) -> Self {
        Self {
            activations: hooks.iter().map(|h| (*h, Vec::new())).collect(),
            instances: Vec::new(),
            attempts: 0,
            rejected: 0,
        }
    }

    /// Record an accepted instance and copy its activations to host memory.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Hook`] if the cache lacks a tracked hook point,
    /// or [`MIError::Model`] if the device transfer fails. Nothing is
    /// recorded on error.
    pub fn push(&mut self, instance: I, cache: &ActivationCache) -> Result<()> {
        let mut host = Vec::with_capacity(self.activations.len());
        for hook in self.activations.keys() {
            let tensor = cache.require(hook)?.detach().to_device(&Device::Cpu)?;
            host.push(tensor);
        }
        for (list, tensor) in self.activations.values_mut().zip(host) {
            list.push(tensor);
        }
        self.instances.push(instance);
        self.attempts += 1;
        Ok(())
    }

    /// Count an instance the oracle rejected.
    pub fn record_rejection(&mut self) {
        self.attempts += 1;
        self.rejected += 1;
    }

    /// Tensors collected for `hook`, one per accepted instance.
    #[must_use]
    pub fn get(&self, hook: &HookPoint) -> Option<&[Tensor]> {
        self.activations.get(hook).map(Vec::as_slice)
    }

    /// Tensors collected for `hook`, or an error if it was not tracked.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Hook`] if `hook` was not requested.
    pub fn require(&self, hook: &HookPoint) -> Result<&[Tensor]> {
        self.get(hook)
            .ok_or_else(|| MIError::Hook(format!("hook point `{hook}` was not aggregated")))
    }

    /// Tracked hook points.
    pub fn hook_points(&self) -> impl Iterator<Item = &HookPoint> {
        self.activations.keys()
    }

    /// Accepted instances, in the same order as every activation list.
    #[must_use]
    pub fn instances(&self) -> &[I] {
        &self.instances
    }

    /// Number of accepted instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether no instance was accepted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Total instances generated.
    #[must_use]
    pub const fn attempts(&self) -> usize {
        self.attempts
    }

    /// Instances rejected by the oracle.
    #[must_use]
    pub const fn rejected(&self) -> usize {
        self.rejected
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::test_util::tiny_model;

    #[test]
    fn push_keeps_lists_parallel() {
        let model = tiny_model(2, 3);
        let hooks = [HookPoint::Ln1Normalized(1), HookPoint::FinalNorm];
        let mut agg: AggregatedActivations<&str> = AggregatedActivations::new(&hooks);
        assert!(agg.is_empty());

        let a = model.run_with_cache(&[1, 2, 3], &hooks).unwrap();
        let b = model.run_with_cache(&[3, 2], &hooks).unwrap();
        agg.push("a", &a).unwrap();
        agg.record_rejection();
        agg.push("b", &b).unwrap();

        assert_eq!(agg.len(), 2);
        assert_eq!(agg.attempts(), 3);
        assert_eq!(agg.rejected(), 1);
        assert_eq!(agg.instances(), &["a", "b"]);
        let finals = agg.require(&HookPoint::FinalNorm).unwrap();
        assert_eq!(finals.len(), 2);
        assert_eq!(finals[1].dims(), &[1, 2, model.hidden_size()]);
        assert!(finals[0].device().is_cpu());
    }

    #[test]
    fn push_fails_atomically_on_missing_hook() {
        let model = tiny_model(2, 3);
        let mut agg: AggregatedActivations<u8> =
            AggregatedActivations::new(&[HookPoint::FinalNorm, HookPoint::ResidPre(0)]);
        let cache = model.run_with_cache(&[1, 2], &[HookPoint::FinalNorm]).unwrap();
        assert!(agg.push(7, &cache).is_err());
        assert!(agg.is_empty());
        assert!(agg.require(&HookPoint::FinalNorm).unwrap().is_empty());
        assert!(agg.require(&HookPoint::ResidMid(0)).is_err());
    }
}

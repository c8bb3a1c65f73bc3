// SPDX-License-Identifier: MIT OR Apache-2.0

//! Activation caches.
//!
//! - [`ActivationCache`]: immutable snapshot of one forward pass
//!   (logits plus captured hook points).
//! - [`AggregatedActivations`]: per-hook-point activations accumulated
//!   on host memory across many accepted task instances.

mod activation;
mod aggregate;

pub use activation::ActivationCache;
pub use aggregate::AggregatedActivations;

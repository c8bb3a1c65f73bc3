// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interpretability tools: activation patching, logit lens, tuned-lens
//! calibration.
//!
//! - [`patching`]: Causal activation patching over layers and positions.
//! - [`logit_lens`]: Per-layer vocabulary projection (native or tuned).
//! - [`aggregate`]: Activation collection over correctly solved instances.
//! - [`probe`]: Linear classifiers fitted on activations.
//! - [`tuned_lens`]: Per-layer lens calibration, save and load.

pub mod aggregate;
pub mod logit_lens;
pub mod patching;
pub mod probe;
pub mod tuned_lens;

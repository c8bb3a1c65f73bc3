// SPDX-License-Identifier: MIT OR Apache-2.0

//! # graphcot-mi
//!
//! Mechanistic interpretability for small graph-traversal transformers, built
//! on [candle](https://github.com/huggingface/candle).
//!
//! The model forward pass exposes `TransformerLens`-style hook points, on
//! top of which the crate provides:
//!
//! - **Activation patching**: restore one clean residual position at a
//!   time into a corrupted run and score how much of the clean logit
//!   difference comes back ([`activation_patching`]).
//! - **Logit lens**: decode every layer's normalized residual through the
//!   unembedding ([`LensDecoder::native`]).
//! - **Tuned lens**: decode through per-layer matrices calibrated on
//!   activations of correctly solved task instances ([`calibrate`]).
//!
//! Graph generation and tokenization stay outside the crate, behind the
//! [`GraphDataset`], [`TaskGenerator`] and [`CorrectnessOracle`] traits.
//!
//! ## Hook points
//!
//! ```
//! use graphcot_mi::{HookPoint, HookSpec, Intervention};
//!
//! let mut hooks = HookSpec::new();
//! hooks.capture(HookPoint::ResidPre(1));
//! let hook: HookPoint = "blocks.0.hook_resid_post".parse().unwrap();
//! assert_eq!(hook, HookPoint::ResidPost(0));
//! # let _ = Intervention::Zero;
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod hooks;
pub mod interp;
pub mod task;
pub mod transformer;

#[cfg(test)]
mod test_util;

// --- Core re-exports ---------------------------------------------------

pub use backend::{MIBackend, MIModel, ModelSignature};
pub use cache::{ActivationCache, AggregatedActivations};
pub use config::{Activation, GraphTransformerConfig, NormType};
pub use error::{MIError, Result};
pub use hooks::{ActivationOverride, HookCache, HookPoint, HookSpec, Intervention, PositionPatch};
pub use transformer::{GraphTransformer, init_weights};

// --- Task interfaces ---------------------------------------------------

pub use task::{
    AnswerSpanOracle, CorrectnessOracle, GraphDataset, PathOrder, TaskGenerator, TaskSpec,
    answer_end, answer_span, prompt_tokens, start_position, token_label, token_labels,
};

// --- Interpretability --------------------------------------------------

pub use interp::aggregate::{AggregateConfig, SampleBudget, aggregate_activations};
pub use interp::logit_lens::{
    LensDecoder, LensTable, LogitLensAnalysis, LogitLensResult, StateProbabilities,
    TokenPrediction, correct_token_probabilities, decode_predictions_with, lens_hook_point,
    lens_hook_points, logit_lens_table, neighbor_probabilities,
};
pub use interp::patching::{
    PatchTarget, PatchingContext, PatchingResult, activation_patching, activation_patching_at,
    logit_diff,
};
pub use interp::probe::{LinearProbe, ProbeConfig, SoftmaxProbe, classifier_accuracy};
pub use interp::tuned_lens::{
    CalibrationConfig, CalibrationSet, LensMatrix, TunedLens, build_calibration_set, calibrate,
    calibrate_with, fit_lenses, lens_accuracy,
};

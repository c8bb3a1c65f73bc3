// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for graphcot-mi.

use crate::backend::ModelSignature;

/// Errors that can occur during MI operations.
#[derive(Debug, thiserror::Error)]
pub enum MIError {
    /// Model loading or forward pass error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Hook capture or lookup error.
    #[error("hook error: {0}")]
    Hook(String),

    /// Intervention validation or application error.
    #[error("intervention error: {0}")]
    Intervention(String),

    /// Model configuration parsing error.
    #[error("config error: {0}")]
    Config(String),

    /// An activation cache or lens was produced by a different model
    /// configuration than the one it is being used with.
    #[error("model configuration mismatch: expected {expected}, found {found}")]
    ConfigMismatch {
        /// Signature of the model performing the lookup.
        expected: ModelSignature,
        /// Signature attached to the cache or lens.
        found: ModelSignature,
    },

    /// Dataset, tokenizer or task generator failure.
    #[error("task error: {0}")]
    Task(String),

    /// Tuned-lens calibration error.
    #[error("calibration error: {0}")]
    Calibration(String),

    /// JSON (de)serialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for graphcot-mi operations.
pub type Result<T> = std::result::Result<T, MIError>;

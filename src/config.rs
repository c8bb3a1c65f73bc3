// SPDX-License-Identifier: MIT OR Apache-2.0

//! Graph-transformer configuration and `TransformerLens` config parsing.
//!
//! [`GraphTransformerConfig`] captures the handful of axes the analysed
//! models vary along: depth, width, head layout, MLP width, vocabulary,
//! context length, activation and normalization. It is parsed from the
//! JSON form of a `HookedTransformerConfig` (`n_layers`, `d_model`, ...).
//!
//! # Usage
//!
//! ```
//! use graphcot_mi::GraphTransformerConfig;
//!
//! let json = serde_json::json!({
//!     "n_layers": 6, "d_model": 256, "n_heads": 1, "d_head": 256,
//!     "d_mlp": 1024, "d_vocab": 48, "n_ctx": 160, "act_fn": "gelu"
//! });
//! let config = GraphTransformerConfig::from_tl_config(&json).unwrap();
//! assert_eq!(config.num_layers, 6);
//! ```

use std::fmt;
use std::path::Path;

use serde_json::Value;

use crate::error::{MIError, Result};

// ---------------------------------------------------------------------------
// Configuration enums
// ---------------------------------------------------------------------------

/// Layer normalization variant.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormType {
    /// Standard layer normalization (weight `w` + bias `b`).
    LayerNorm,
    /// RMS normalization (weight `w` only).
    RmsNorm,
    /// Layer normalization with the affine map folded into the next layer;
    /// loads no `ln*` tensors.
    LayerNormPre,
    /// RMS normalization with the weight folded into the next layer; loads
    /// no `ln*` tensors.
    RmsNormPre,
}

impl NormType {
    /// Whether this variant reads `w` (and `b`) tensors from the checkpoint.
    #[must_use]
    pub const fn has_weights(self) -> bool {
        matches!(self, Self::LayerNorm | Self::RmsNorm)
    }
}

impl fmt::Display for NormType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LayerNorm => write!(f, "LN"),
            Self::RmsNorm => write!(f, "RMS"),
            Self::LayerNormPre => write!(f, "LNPre"),
            Self::RmsNormPre => write!(f, "RMSPre"),
        }
    }
}

/// Activation function used in the MLP.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Gaussian Error Linear Unit, exact (erf) variant (`"gelu"`).
    Gelu,
    /// Gaussian Error Linear Unit, tanh approximation (`"gelu_new"`).
    GeluNew,
    /// Rectified linear unit (`"relu"`).
    Relu,
    /// Sigmoid Linear Unit (`"silu"`).
    Silu,
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gelu => write!(f, "gelu"),
            Self::GeluNew => write!(f, "gelu_new"),
            Self::Relu => write!(f, "relu"),
            Self::Silu => write!(f, "silu"),
        }
    }
}

impl Activation {
    /// Parse a `TransformerLens` `act_fn` name.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Config`] for unsupported activations.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "gelu" => Ok(Self::Gelu),
            "gelu_new" | "gelu_fast" | "gelu_pytorch_tanh" => Ok(Self::GeluNew),
            "relu" => Ok(Self::Relu),
            "silu" => Ok(Self::Silu),
            other => Err(MIError::Config(format!("unsupported act_fn: '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// GraphTransformerConfig
// ---------------------------------------------------------------------------

/// Configuration for the hooked graph-traversal transformer.
///
/// The analysed models were trained with 6 layers, `d_model = 256`, a
/// single 256-wide head, `d_mlp = 1024`, GELU, `LayerNorm` and causal
/// attention; vocabulary and context length come from the dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphTransformerConfig {
    // --- Dimensions ----------------------------------------------------------
    /// Number of transformer blocks (`n_layers`).
    pub num_layers: usize,
    /// Residual stream width (`d_model`).
    pub hidden_size: usize,
    /// Number of attention heads (`n_heads`).
    pub num_heads: usize,
    /// Dimension per head (`d_head`).
    pub head_dim: usize,
    /// MLP hidden width (`d_mlp`).
    pub intermediate_size: usize,
    /// Vocabulary size (`d_vocab`).
    pub vocab_size: usize,
    /// Maximum sequence length (`n_ctx`).
    pub max_seq_len: usize,

    // --- Architecture axes ---------------------------------------------------
    /// MLP activation function.
    pub activation: Activation,
    /// Normalization variant.
    pub norm_type: NormType,
    /// Epsilon for normalization layers.
    pub norm_eps: f64,
}

impl GraphTransformerConfig {
    /// Parse from the JSON form of a `HookedTransformerConfig`.
    ///
    /// `d_head` defaults to `d_model / n_heads`, `d_mlp` to `4 * d_model`.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Config`] if required fields are missing or the
    /// dimensions are inconsistent.
    pub fn from_tl_config(config: &Value) -> Result<Self> {
        let hidden_size = get_usize(config, "d_model")?;
        let num_heads = get_usize(config, "n_heads")?;
        if num_heads == 0 {
            return Err(MIError::Config("n_heads is 0".into()));
        }
        let head_dim = get_usize_or(config, "d_head", hidden_size / num_heads);

        let activation = match config.get("act_fn").and_then(Value::as_str) {
            Some(name) => Activation::from_name(name)?,
            None => Activation::Gelu,
        };
        let norm_type = match config.get("normalization_type").and_then(Value::as_str) {
            None | Some("LN") => NormType::LayerNorm,
            Some("RMS") => NormType::RmsNorm,
            Some("LNPre") => NormType::LayerNormPre,
            Some("RMSPre") => NormType::RmsNormPre,
            Some(other) => {
                return Err(MIError::Config(format!(
                    "unsupported normalization_type: '{other}'"
                )));
            }
        };

        if let Some(dir) = config.get("attention_dir").and_then(Value::as_str) {
            if dir != "causal" {
                return Err(MIError::Config(format!(
                    "unsupported attention_dir: '{dir}' (only causal models are analysed)"
                )));
            }
        }

        let parsed = Self {
            num_layers: get_usize(config, "n_layers")?,
            hidden_size,
            num_heads,
            head_dim,
            intermediate_size: get_usize_or(config, "d_mlp", 4 * hidden_size),
            vocab_size: get_usize(config, "d_vocab")?,
            max_seq_len: get_usize(config, "n_ctx")?,
            activation,
            norm_type,
            norm_eps: get_f64_or(config, "eps", 1e-5),
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Read and parse a `config.json` file.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Io`] / [`MIError::Json`] on read or parse
    /// failures, and [`MIError::Config`] on invalid contents.
    pub fn from_file(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)?;
        let json: Value = serde_json::from_str(&config_str)?;
        Self::from_tl_config(&json)
    }

    /// Check dimension consistency.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Config`] when any dimension is zero.
    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("n_layers", self.num_layers),
            ("d_model", self.hidden_size),
            ("n_heads", self.num_heads),
            ("d_head", self.head_dim),
            ("d_mlp", self.intermediate_size),
            ("d_vocab", self.vocab_size),
            ("n_ctx", self.max_seq_len),
        ];
        for (name, value) in dims {
            if value == 0 {
                return Err(MIError::Config(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSON extraction helpers
// ---------------------------------------------------------------------------

/// Extract a required `usize` field from a JSON object.
fn get_usize(config: &Value, key: &str) -> Result<usize> {
    let val = config
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| MIError::Config(format!("missing or invalid field '{key}'")))?;
    usize::try_from(val)
        .map_err(|_| MIError::Config(format!("field '{key}' value {val} overflows usize")))
}

/// Extract an optional `usize` field, returning a default if absent.
fn get_usize_or(config: &Value, key: &str, default: usize) -> usize {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
        .unwrap_or(default)
}

/// Extract an `f64` field, returning a default if absent.
fn get_f64_or(config: &Value, key: &str, default: f64) -> f64 {
    config.get(key).and_then(Value::as_f64).unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// Minimal config matching the training script.
    fn training_config_json() -> Value {
        serde_json::json!({
            "n_layers": 6,
            "d_model": 256,
            "n_ctx": 159,
            "n_heads": 1,
            "d_mlp": 1024,
            "d_head": 256,
            "d_vocab": 70,
            "attention_dir": "causal",
            "act_fn": "gelu"
        })
    }

    #[test]
    fn parse_training_config() {
        let config = GraphTransformerConfig::from_tl_config(&training_config_json()).unwrap();
        assert_eq!(config.num_layers, 6);
        assert_eq!(config.hidden_size, 256);
        assert_eq!(config.num_heads, 1);
        assert_eq!(config.head_dim, 256);
        assert_eq!(config.intermediate_size, 1024);
        assert_eq!(config.vocab_size, 70);
        assert_eq!(config.max_seq_len, 159);
        assert_eq!(config.activation, Activation::Gelu);
        assert_eq!(config.norm_type, NormType::LayerNorm);
        assert!((config.norm_eps - 1e-5).abs() < f64::EPSILON);
    }

    #[test]
    fn derived_defaults() {
        let json = serde_json::json!({
            "n_layers": 2, "d_model": 64, "n_heads": 4,
            "d_vocab": 10, "n_ctx": 16, "normalization_type": "RMS"
        });
        let config = GraphTransformerConfig::from_tl_config(&json).unwrap();
        assert_eq!(config.head_dim, 16);
        assert_eq!(config.intermediate_size, 256);
        assert_eq!(config.norm_type, NormType::RmsNorm);
    }

    #[test]
    fn folded_norms_are_unweighted() {
        let mut json = training_config_json();
        json["normalization_type"] = serde_json::json!("LNPre");
        let config = GraphTransformerConfig::from_tl_config(&json).unwrap();
        assert_eq!(config.norm_type, NormType::LayerNormPre);
        assert!(!config.norm_type.has_weights());
        assert_eq!(config.norm_type.to_string(), "LNPre");

        json["normalization_type"] = serde_json::json!("RMSPre");
        let config = GraphTransformerConfig::from_tl_config(&json).unwrap();
        assert_eq!(config.norm_type, NormType::RmsNormPre);
        assert!(NormType::LayerNorm.has_weights());
    }

    #[test]
    fn unknown_normalization_rejected() {
        let mut json = training_config_json();
        json["normalization_type"] = serde_json::json!("LNFold");
        assert!(GraphTransformerConfig::from_tl_config(&json).is_err());
    }

    #[test]
    fn bidirectional_attention_rejected() {
        let mut json = training_config_json();
        json["attention_dir"] = serde_json::json!("bidirectional");
        assert!(GraphTransformerConfig::from_tl_config(&json).is_err());
    }

    #[test]
    fn unsupported_activation_errors() {
        let mut json = training_config_json();
        json["act_fn"] = serde_json::json!("solu_ln");
        assert!(GraphTransformerConfig::from_tl_config(&json).is_err());
    }

    #[test]
    fn missing_field_errors() {
        let json = serde_json::json!({ "d_model": 256, "n_heads": 1 });
        assert!(GraphTransformerConfig::from_tl_config(&json).is_err());
    }
}

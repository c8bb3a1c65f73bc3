// SPDX-License-Identifier: MIT OR Apache-2.0

//! Normalization layers for the graph transformer.
//!
//! Supports [`LayerNorm`](NormType::LayerNorm) and
//! [`RmsNorm`](NormType::RmsNorm), loaded from `TransformerLens` weight
//! names (`w`, `b`), and their folded `Pre` forms, which carry no weights.

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use crate::config::NormType;
use crate::error::Result;

// ---------------------------------------------------------------------------
// Norm: enum-dispatched normalization
// ---------------------------------------------------------------------------

/// A normalization layer, selected at load time by [`NormType`].
// EXHAUSTIVE: internal dispatch enum; crate owns both norm variants and matches exhaustively
#[allow(clippy::exhaustive_enums)]
pub enum Norm {
    /// Layer normalization (weight + bias).
    Layer(candle_nn::LayerNorm),
    /// RMS normalization (weight only).
    Rms(candle_nn::RmsNorm),
}

impl Norm {
    /// Apply normalization to the input tensor.
    ///
    /// The result includes the learned affine map, matching what
    /// `TransformerLens` exposes at its `hook_normalized` points.
    ///
    /// # Shapes
    /// - `xs`: `[batch, seq, hidden_size]`
    /// - returns: `[batch, seq, hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Model`](crate::MIError::Model) on tensor operation failures.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Layer(norm) => Ok(norm.forward(xs)?),
            Self::Rms(norm) => Ok(norm.forward(xs)?),
        }
    }
}

/// Create a [`Norm`] layer from the given configuration.
///
/// # Errors
///
/// Returns [`MIError::Model`](crate::MIError::Model) if weight loading fails.
/// The `Pre` variants read nothing from `vb`; they use a unit weight and a
/// zero bias in `vb`'s dtype.
#[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
pub fn create_norm(
    norm_type: NormType,
    hidden_size: usize,
    eps: f64,
    vb: VarBuilder<'_>,
) -> Result<Norm> {
    let unit = || Tensor::ones(hidden_size, vb.dtype(), vb.device());
    match norm_type {
        NormType::LayerNorm => {
            let weight = vb.get(hidden_size, "w")?;
            let bias = vb.get(hidden_size, "b")?;
            Ok(Norm::Layer(candle_nn::LayerNorm::new(weight, bias, eps)))
        }
        NormType::RmsNorm => {
            let weight = vb.get(hidden_size, "w")?;
            Ok(Norm::Rms(candle_nn::RmsNorm::new(weight, eps)))
        }
        NormType::LayerNormPre => {
            let bias = Tensor::zeros(hidden_size, vb.dtype(), vb.device())?;
            Ok(Norm::Layer(candle_nn::LayerNorm::new(unit()?, bias, eps)))
        }
        NormType::RmsNormPre => Ok(Norm::Rms(candle_nn::RmsNorm::new(unit()?, eps))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::collections::HashMap;

    #[test]
    fn folded_layer_norm_reads_no_tensors() {
        let vb = VarBuilder::from_tensors(HashMap::new(), DType::F32, &Device::Cpu);
        let norm = create_norm(NormType::LayerNormPre, 4, 1e-5, vb).unwrap();
        let xs = Tensor::new(&[[[1.0_f32, 2.0, 3.0, 6.0]]], &Device::Cpu).unwrap();
        let out: Vec<f32> = norm.forward(&xs).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let mean: f32 = out.iter().sum::<f32>() / 4.0;
        let var: f32 = out.iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn folded_rms_norm_reads_no_tensors() {
        let vb = VarBuilder::from_tensors(HashMap::new(), DType::F32, &Device::Cpu);
        let norm = create_norm(NormType::RmsNormPre, 2, 1e-6, vb).unwrap();
        let xs = Tensor::new(&[[[3.0_f32, 4.0]]], &Device::Cpu).unwrap();
        let out: Vec<f32> = norm.forward(&xs).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let rms = (12.5_f32).sqrt();
        assert!((out[0] - 3.0 / rms).abs() < 1e-4);
        assert!((out[1] - 4.0 / rms).abs() < 1e-4);
    }

    #[test]
    fn weighted_norm_needs_its_tensors() {
        let vb = VarBuilder::from_tensors(HashMap::new(), DType::F32, &Device::Cpu);
        assert!(create_norm(NormType::LayerNorm, 4, 1e-5, vb).is_err());
    }
}

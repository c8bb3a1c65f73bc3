// SPDX-License-Identifier: MIT OR Apache-2.0

//! Plain (non-gated) MLP: `W_out(act(W_in x + b_in)) + b_out`.

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::config::{Activation, GraphTransformerConfig};
use crate::error::Result;
use crate::hooks::{HookCache, HookPoint, HookSpec};

// ---------------------------------------------------------------------------
// Mlp
// ---------------------------------------------------------------------------

/// Feed-forward block of one transformer layer.
pub struct Mlp {
    /// Input projection: `[hidden_size, d_mlp]`.
    w_in: Tensor,
    /// Input bias: `[d_mlp]`.
    b_in: Tensor,
    /// Output projection: `[d_mlp, hidden_size]`.
    w_out: Tensor,
    /// Output bias: `[hidden_size]`.
    b_out: Tensor,
    /// Activation function.
    activation: Activation,
}

impl Mlp {
    /// Load MLP weights (`W_in`, `b_in`, `W_out`, `b_out`).
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Model`](crate::MIError::Model) if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: &GraphTransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let hidden = config.hidden_size;
        let inter = config.intermediate_size;
        Ok(Self {
            w_in: vb.get((hidden, inter), "W_in")?,
            b_in: vb.get(inter, "b_in")?,
            w_out: vb.get((inter, hidden), "W_out")?,
            b_out: vb.get(hidden, "b_out")?,
            activation: config.activation,
        })
    }

    /// Run the MLP forward pass with `MlpPre` / `MlpPost` hooks.
    ///
    /// # Shapes
    /// - `x`: `[batch, seq, hidden_size]`
    /// - returns: `[batch, seq, hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Model`](crate::MIError::Model) on tensor operation failures.
    pub fn forward(
        &self,
        x: &Tensor,
        layer_idx: usize,
        hooks: &HookSpec,
        cache: &mut HookCache,
    ) -> Result<Tensor> {
        let pre = x.broadcast_matmul(&self.w_in)?.broadcast_add(&self.b_in)?;
        let pre = hooks.apply(HookPoint::MlpPre(layer_idx), pre, cache)?;

        let post = apply_activation(&pre, self.activation)?;
        let post = hooks.apply(HookPoint::MlpPost(layer_idx), post, cache)?;

        Ok(post.broadcast_matmul(&self.w_out)?.broadcast_add(&self.b_out)?)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Apply the selected activation function.
fn apply_activation(x: &Tensor, activation: Activation) -> Result<Tensor> {
    match activation {
        Activation::Gelu => Ok(x.gelu_erf()?),
        Activation::GeluNew => Ok(x.gelu()?),
        Activation::Relu => Ok(x.relu()?),
        Activation::Silu => Ok(candle_nn::ops::silu(x)?),
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Causal multi-head attention with `TransformerLens` weight layout.
//!
//! Weights are stored per head (`W_Q: [n_heads, d_model, d_head]`,
//! `W_O: [n_heads, d_head, d_model]`) and flattened to plain matrices at
//! load time so the forward pass is two batched matmuls per projection.

use candle_core::{DType, Tensor};
use candle_nn::VarBuilder;

use crate::config::GraphTransformerConfig;
use crate::error::Result;
use crate::hooks::{HookCache, HookPoint, HookSpec};

// ---------------------------------------------------------------------------
// Attention
// ---------------------------------------------------------------------------

/// Multi-head self-attention layer with hook points.
pub struct Attention {
    /// Query projection, flattened to `[d_model, n_heads * d_head]`.
    w_q: Tensor,
    /// Query bias, `[n_heads * d_head]`.
    b_q: Tensor,
    /// Key projection, `[d_model, n_heads * d_head]`.
    w_k: Tensor,
    /// Key bias.
    b_k: Tensor,
    /// Value projection, `[d_model, n_heads * d_head]`.
    w_v: Tensor,
    /// Value bias.
    b_v: Tensor,
    /// Output projection, `[n_heads * d_head, d_model]`.
    w_o: Tensor,
    /// Output bias, `[d_model]`.
    b_o: Tensor,
    /// Number of heads.
    num_heads: usize,
    /// Dimension per head.
    head_dim: usize,
    /// `1 / sqrt(d_head)`.
    scale: f64,
}

impl Attention {
    /// Load attention weights from a [`VarBuilder`] rooted at
    /// `blocks.{i}.attn`.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Model`](crate::MIError::Model) if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: &GraphTransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let heads = config.num_heads;
        let d_head = config.head_dim;
        let d_model = config.hidden_size;
        let proj_dim = heads * d_head;

        // [h, d, dh] -> [d, h, dh] -> [d, h * dh]
        let in_proj = |name: &str| -> Result<Tensor> {
            Ok(vb
                .get((heads, d_model, d_head), name)?
                .transpose(0, 1)?
                .contiguous()?
                .reshape((d_model, proj_dim))?)
        };
        let bias = |name: &str| -> Result<Tensor> {
            Ok(vb.get((heads, d_head), name)?.reshape(proj_dim)?)
        };

        let w_o = vb
            .get((heads, d_head, d_model), "W_O")?
            .reshape((proj_dim, d_model))?;

        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let scale = 1.0 / (d_head as f64).sqrt();

        Ok(Self {
            w_q: in_proj("W_Q")?,
            b_q: bias("b_Q")?,
            w_k: in_proj("W_K")?,
            b_k: bias("b_K")?,
            w_v: in_proj("W_V")?,
            b_v: bias("b_V")?,
            w_o,
            b_o: vb.get(d_model, "b_O")?,
            num_heads: heads,
            head_dim: d_head,
            scale,
        })
    }

    /// Run the attention forward pass with hook capture and intervention.
    ///
    /// # Shapes
    /// - `x`: `[batch, seq, hidden_size]` -- the `ln1`-normalized residual
    /// - `mask`: `[1, 1, seq, seq]` -- additive causal mask
    /// - returns: `[batch, seq, hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Model`](crate::MIError::Model) on tensor operation
    /// failures, or propagates intervention errors.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: &Tensor,
        layer_idx: usize,
        hooks: &HookSpec,
        cache: &mut HookCache,
    ) -> Result<Tensor> {
        let (batch, seq_len, _hidden) = x.dims3()?;

        let split_heads = |t: Tensor| -> Result<Tensor> {
            // [batch, seq, h * dh] -> [batch, h, seq, dh]
            Ok(t.reshape((batch, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split_heads(x.broadcast_matmul(&self.w_q)?.broadcast_add(&self.b_q)?)?;
        let k = split_heads(x.broadcast_matmul(&self.w_k)?.broadcast_add(&self.b_k)?)?;
        let v = split_heads(x.broadcast_matmul(&self.w_v)?.broadcast_add(&self.b_v)?)?;

        // --- Attention scores ---
        // CONTIGUOUS: transpose produces non-unit strides; matmul requires contiguous layout
        let k_t = k.transpose(2, 3)?.contiguous()?;
        let scores = (q.matmul(&k_t)? * self.scale)?;
        let scores = scores.broadcast_add(&mask.to_dtype(scores.dtype())?)?;
        let scores = hooks.apply(HookPoint::AttnScores(layer_idx), scores, cache)?;

        // PROMOTE: softmax over F16/BF16 can produce NaN; compute in F32
        let original_dtype = scores.dtype();
        let pattern = candle_nn::ops::softmax_last_dim(&scores.to_dtype(DType::F32)?)?
            .to_dtype(original_dtype)?;
        let pattern = hooks.apply(HookPoint::AttnPattern(layer_idx), pattern, cache)?;

        // --- Attention output ---
        let z = pattern.matmul(&v)?;
        let z = z
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, self.num_heads * self.head_dim))?;

        Ok(z.broadcast_matmul(&self.w_o)?.broadcast_add(&self.b_o)?)
    }
}

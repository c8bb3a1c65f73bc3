// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decoder-only graph transformer with `TransformerLens` hook points.
//!
//! The forward pass reproduces a `HookedTransformer` with learned
//! absolute position embeddings, pre-norm blocks and an untied
//! unembedding, parameterized by
//! [`GraphTransformerConfig`]. Weight names follow
//! the `TransformerLens` state dict (`embed.W_E`, `pos_embed.W_pos`,
//! `blocks.{i}.attn.W_Q`, `unembed.W_U`, ...) so checkpoints exported from
//! the training pipeline load unchanged.

pub(crate) mod attention;
pub(crate) mod mlp;
pub(crate) mod norm;

use std::collections::HashMap;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, VarBuilder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::backend::MIBackend;
use crate::config::{GraphTransformerConfig, NormType};
use crate::error::Result;
use crate::hooks::{HookCache, HookPoint, HookSpec};

use self::attention::Attention;
use self::mlp::Mlp;
use self::norm::{Norm, create_norm};

// ---------------------------------------------------------------------------
// TransformerBlock
// ---------------------------------------------------------------------------

/// A single pre-norm transformer block.
struct TransformerBlock {
    /// Norm before attention (`ln1`).
    ln1: Norm,
    /// Self-attention.
    attention: Attention,
    /// Norm before the MLP (`ln2`).
    ln2: Norm,
    /// Feed-forward block.
    mlp: Mlp,
}

impl TransformerBlock {
    /// Load one block from a [`VarBuilder`] rooted at `blocks.{i}`.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    fn load(config: &GraphTransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let norm = |name: &str| {
            create_norm(
                config.norm_type,
                config.hidden_size,
                config.norm_eps,
                vb.pp(name),
            )
        };
        Ok(Self {
            ln1: norm("ln1")?,
            attention: Attention::load(config, vb.pp("attn"))?,
            ln2: norm("ln2")?,
            mlp: Mlp::load(config, vb.pp("mlp"))?,
        })
    }

    /// Run the block, applying hooks at every residual-stream point.
    ///
    /// # Shapes
    /// - `resid_pre`: `[batch, seq, hidden_size]`
    /// - returns: `[batch, seq, hidden_size]` -- `resid_post`
    fn forward(
        &self,
        resid_pre: Tensor,
        mask: &Tensor,
        layer_idx: usize,
        hooks: &HookSpec,
        cache: &mut HookCache,
    ) -> Result<Tensor> {
        let resid_pre = hooks.apply(HookPoint::ResidPre(layer_idx), resid_pre, cache)?;

        let normed = self.ln1.forward(&resid_pre)?;
        let normed = hooks.apply(HookPoint::Ln1Normalized(layer_idx), normed, cache)?;
        let attn_out = self
            .attention
            .forward(&normed, mask, layer_idx, hooks, cache)?;
        let attn_out = hooks.apply(HookPoint::AttnOut(layer_idx), attn_out, cache)?;

        let resid_mid = (resid_pre + attn_out)?;
        let resid_mid = hooks.apply(HookPoint::ResidMid(layer_idx), resid_mid, cache)?;

        let normed = self.ln2.forward(&resid_mid)?;
        let normed = hooks.apply(HookPoint::Ln2Normalized(layer_idx), normed, cache)?;
        let mlp_out = self.mlp.forward(&normed, layer_idx, hooks, cache)?;
        let mlp_out = hooks.apply(HookPoint::MlpOut(layer_idx), mlp_out, cache)?;

        let resid_post = (resid_mid + mlp_out)?;
        hooks.apply(HookPoint::ResidPost(layer_idx), resid_post, cache)
    }
}

// ---------------------------------------------------------------------------
// GraphTransformer
// ---------------------------------------------------------------------------

/// Hook-instrumented transformer backend for graph-traversal models.
pub struct GraphTransformer {
    /// Token embedding (`embed.W_E`, `[d_vocab, d_model]`).
    embed: Embedding,
    /// Learned position embedding (`pos_embed.W_pos`, `[n_ctx, d_model]`).
    pos_embed: Tensor,
    /// Transformer blocks.
    blocks: Vec<TransformerBlock>,
    /// Final normalization (`ln_final`).
    ln_final: Norm,
    /// Unembedding matrix (`unembed.W_U`, `[d_model, d_vocab]`).
    w_u: Tensor,
    /// Unembedding bias (`unembed.b_U`, `[d_vocab]`).
    b_u: Tensor,
    /// Model configuration.
    config: GraphTransformerConfig,
}

impl GraphTransformer {
    /// Load a graph transformer from a [`VarBuilder`].
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Config`](crate::MIError::Config) if the config is
    /// inconsistent, or [`MIError::Model`](crate::MIError::Model) if a
    /// weight is missing or has the wrong shape.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: GraphTransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        config.validate()?;
        let d_model = config.hidden_size;

        let w_e = vb.pp("embed").get((config.vocab_size, d_model), "W_E")?;
        let embed = Embedding::new(w_e, d_model);
        let pos_embed = vb
            .pp("pos_embed")
            .get((config.max_seq_len, d_model), "W_pos")?;

        let mut blocks = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            blocks.push(TransformerBlock::load(&config, vb.pp(format!("blocks.{i}")))?);
        }

        let ln_final = create_norm(config.norm_type, d_model, config.norm_eps, vb.pp("ln_final"))?;

        let vb_unembed = vb.pp("unembed");
        let w_u = vb_unembed.get((d_model, config.vocab_size), "W_U")?;
        let b_u = vb_unembed.get(config.vocab_size, "b_U")?;

        Ok(Self {
            embed,
            pos_embed,
            blocks,
            ln_final,
            w_u,
            b_u,
            config,
        })
    }

    /// Build a model from named tensors (see [`init_weights`]).
    ///
    /// # Errors
    ///
    /// Same as [`load`](Self::load).
    pub fn from_tensors(
        config: GraphTransformerConfig,
        tensors: HashMap<String, Tensor>,
        device: &Device,
    ) -> Result<Self> {
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        Self::load(config, vb)
    }

    /// Build a randomly initialized (untrained) model.
    ///
    /// # Errors
    ///
    /// Same as [`load`](Self::load).
    pub fn random(config: GraphTransformerConfig, seed: u64, device: &Device) -> Result<Self> {
        let tensors = init_weights(&config, seed, device)?;
        Self::from_tensors(config, tensors, device)
    }

    /// Access the model configuration.
    #[must_use]
    pub const fn config(&self) -> &GraphTransformerConfig {
        &self.config
    }
}

// ---------------------------------------------------------------------------
// MIBackend implementation
// ---------------------------------------------------------------------------

impl MIBackend for GraphTransformer {
    fn num_layers(&self) -> usize {
        self.config.num_layers
    }

    fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn num_heads(&self) -> usize {
        self.config.num_heads
    }

    fn max_seq_len(&self) -> usize {
        self.config.max_seq_len
    }

    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        let device = input_ids.device();
        let (batch, seq_len) = input_ids.dims2()?;

        // Capture cache; output set at the end.
        let mut cache = HookCache::new(Tensor::zeros(1, DType::F32, device)?);

        // --- Embedding ---
        let embed = self.embed.forward(input_ids)?;
        let embed = hooks.apply(HookPoint::Embed, embed, &mut cache)?;

        let pos = self
            .pos_embed
            .narrow(0, 0, seq_len)?
            .unsqueeze(0)?
            .broadcast_as((batch, seq_len, self.config.hidden_size))?
            .contiguous()?;
        let pos = hooks.apply(HookPoint::PosEmbed, pos, &mut cache)?;

        let mut hidden = (embed + pos)?;

        // --- Blocks ---
        let mask = create_causal_mask(seq_len, device)?;
        for (layer_idx, block) in self.blocks.iter().enumerate() {
            hidden = block.forward(hidden, &mask, layer_idx, hooks, &mut cache)?;
        }

        // --- Final norm ---
        let hidden = self.ln_final.forward(&hidden)?;
        let hidden = hooks.apply(HookPoint::FinalNorm, hidden, &mut cache)?;

        // --- Unembed ---
        let logits = hidden
            .broadcast_matmul(&self.w_u)?
            .broadcast_add(&self.b_u)?;
        cache.set_output(logits);

        Ok(cache)
    }

    fn unembedding(&self) -> Result<Tensor> {
        Ok(self.w_u.clone())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Additive causal mask: `0` on and below the diagonal, `-inf` above.
///
/// # Shapes
/// - returns: `[1, 1, seq_len, seq_len]`
fn create_causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Ok(Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?)
}

/// Generate a full set of named weights for `config`, deterministically
/// from `seed`.
///
/// Matrices are drawn uniformly from `[-1/sqrt(fan_in), 1/sqrt(fan_in)]`;
/// norm weights start at one and every bias at zero. The returned map
/// feeds [`GraphTransformer::from_tensors`] or can be written to a
/// safetensors checkpoint.
///
/// # Errors
///
/// Returns [`MIError::Config`](crate::MIError::Config) if the config is
/// inconsistent, or [`MIError::Model`](crate::MIError::Model) on tensor
/// allocation failure.
pub fn init_weights(
    config: &GraphTransformerConfig,
    seed: u64,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    config.validate()?;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tensors = HashMap::new();

    let d = config.hidden_size;
    let h = config.num_heads;
    let dh = config.head_dim;
    let d_mlp = config.intermediate_size;
    let vocab = config.vocab_size;

    let mut uniform = |dims: &[usize], fan_in: usize| -> Result<Tensor> {
        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
        let n: usize = dims.iter().product();
        let data: Vec<f32> = (0..n).map(|_| rng.gen_range(-bound..bound)).collect();
        Ok(Tensor::from_vec(data, dims, device)?)
    };
    let ones = |dims: &[usize]| Tensor::ones(dims, DType::F32, device);
    let zeros = |dims: &[usize]| Tensor::zeros(dims, DType::F32, device);

    tensors.insert("embed.W_E".to_owned(), uniform(&[vocab, d], d)?);
    tensors.insert("pos_embed.W_pos".to_owned(), uniform(&[config.max_seq_len, d], d)?);

    let norm = |tensors: &mut HashMap<String, Tensor>, prefix: &str| -> Result<()> {
        if !config.norm_type.has_weights() {
            return Ok(());
        }
        tensors.insert(format!("{prefix}.w"), ones(&[d])?);
        if config.norm_type == NormType::LayerNorm {
            tensors.insert(format!("{prefix}.b"), zeros(&[d])?);
        }
        Ok(())
    };

    for i in 0..config.num_layers {
        norm(&mut tensors, &format!("blocks.{i}.ln1"))?;
        norm(&mut tensors, &format!("blocks.{i}.ln2"))?;

        let attn = format!("blocks.{i}.attn");
        for name in ["W_Q", "W_K", "W_V"] {
            tensors.insert(format!("{attn}.{name}"), uniform(&[h, d, dh], d)?);
        }
        for name in ["b_Q", "b_K", "b_V"] {
            tensors.insert(format!("{attn}.{name}"), zeros(&[h, dh])?);
        }
        tensors.insert(format!("{attn}.W_O"), uniform(&[h, dh, d], h * dh)?);
        tensors.insert(format!("{attn}.b_O"), zeros(&[d])?);

        let mlp = format!("blocks.{i}.mlp");
        tensors.insert(format!("{mlp}.W_in"), uniform(&[d, d_mlp], d)?);
        tensors.insert(format!("{mlp}.b_in"), zeros(&[d_mlp])?);
        tensors.insert(format!("{mlp}.W_out"), uniform(&[d_mlp, d], d_mlp)?);
        tensors.insert(format!("{mlp}.b_out"), zeros(&[d])?);
    }

    norm(&mut tensors, "ln_final")?;
    tensors.insert("unembed.W_U".to_owned(), uniform(&[d, vocab], d)?);
    tensors.insert("unembed.b_U".to_owned(), zeros(&[vocab])?);

    Ok(tensors)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::hooks::Intervention;
    use crate::test_util::tiny_config;

    fn model(seed: u64) -> GraphTransformer {
        GraphTransformer::random(tiny_config(2), seed, &Device::Cpu).unwrap()
    }

    fn ids(tokens: &[u32]) -> Tensor {
        Tensor::new(tokens, &Device::Cpu).unwrap().unsqueeze(0).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    #[test]
    fn causal_mask_layout() {
        let mask: Vec<Vec<f32>> = create_causal_mask(3, &Device::Cpu)
            .unwrap()
            .squeeze(0)
            .unwrap()
            .squeeze(0)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(mask[0][0], 0.0);
        assert!(mask[0][1].is_infinite());
        assert_eq!(mask[2][1], 0.0);
    }

    #[test]
    fn init_is_deterministic() {
        let a = init_weights(&tiny_config(2), 5, &Device::Cpu).unwrap();
        let b = init_weights(&tiny_config(2), 5, &Device::Cpu).unwrap();
        assert_eq!(a.len(), b.len());
        let w = "blocks.1.attn.W_Q";
        assert!(max_abs_diff(&a[w], &b[w]) < 1e-9);
    }

    #[test]
    fn every_hook_point_is_captured() {
        let model = model(1);
        let spec = HookSpec::capture_all(2);
        let cache = model.forward(&ids(&[1, 2, 3]), &spec).unwrap();
        for hook in HookPoint::all(2) {
            assert!(cache.get(&hook).is_some(), "missing capture for {hook}");
        }
        let pattern = cache.get(&HookPoint::AttnPattern(0)).unwrap();
        assert_eq!(pattern.dims(), &[1, tiny_config(2).num_heads, 3, 3]);
        // Causal: first query attends only to itself.
        let first_row: Vec<f32> = pattern.get(0).unwrap().get(0).unwrap().get(0).unwrap().to_vec1().unwrap();
        assert!((first_row[0] - 1.0).abs() < 1e-5);
        assert!(first_row[1].abs() < 1e-6);
    }

    #[test]
    fn folded_norm_checkpoint_loads_without_ln_tensors() {
        let folded = GraphTransformerConfig {
            norm_type: NormType::LayerNormPre,
            ..tiny_config(2)
        };
        let tensors = init_weights(&folded, 9, &Device::Cpu).unwrap();
        assert!(tensors.keys().all(|k| !k.contains("ln")));
        let folded_model = GraphTransformer::from_tensors(folded, tensors, &Device::Cpu).unwrap();

        // Unit-weight LayerNorm computes the same function.
        let weighted = GraphTransformer::random(tiny_config(2), 9, &Device::Cpu).unwrap();
        let input = ids(&[1, 5, 2, 7]);
        let a = folded_model.forward(&input, &HookSpec::new()).unwrap();
        let b = weighted.forward(&input, &HookSpec::new()).unwrap();
        assert!(max_abs_diff(a.output(), b.output()) < 1e-5);
    }

    #[test]
    fn residual_decomposition_holds() {
        let model = model(2);
        let cache = model
            .forward(&ids(&[4, 0, 2]), &HookSpec::capture_all(2))
            .unwrap();
        let get = |h: HookPoint| cache.get(&h).unwrap().clone();
        let mid = (get(HookPoint::ResidPre(1)) + get(HookPoint::AttnOut(1))).unwrap();
        assert!(max_abs_diff(&mid, &get(HookPoint::ResidMid(1))) < 1e-5);
        let post = (get(HookPoint::ResidMid(1)) + get(HookPoint::MlpOut(1))).unwrap();
        assert!(max_abs_diff(&post, &get(HookPoint::ResidPost(1))) < 1e-5);
        assert!(max_abs_diff(&get(HookPoint::ResidPost(0)), &get(HookPoint::ResidPre(1))) < 1e-6);
    }

    #[test]
    fn later_positions_do_not_affect_earlier_logits() {
        let model = model(3);
        let a = model.forward(&ids(&[1, 2, 3]), &HookSpec::new()).unwrap();
        let b = model.forward(&ids(&[1, 2, 4]), &HookSpec::new()).unwrap();
        let a = a.output().narrow(1, 0, 2).unwrap();
        let b = b.output().narrow(1, 0, 2).unwrap();
        assert!(max_abs_diff(&a, &b) < 1e-5);
    }

    #[test]
    fn intervention_changes_downstream_only() {
        let model = model(4);
        let clean = model.forward(&ids(&[1, 2, 3]), &HookSpec::new()).unwrap();
        let mut spec = HookSpec::new();
        spec.intervene(HookPoint::ResidPost(1), Intervention::Zero);
        let zeroed = model.forward(&ids(&[1, 2, 3]), &spec).unwrap();
        // Zeroed residual normalizes to the ln_final bias, so every position
        // produces the same logits.
        let logits = zeroed.output().squeeze(0).unwrap();
        assert!(max_abs_diff(&logits.get(0).unwrap(), &logits.get(2).unwrap()) < 1e-5);
        assert!(max_abs_diff(clean.output(), zeroed.output()) > 1e-4);
    }
}

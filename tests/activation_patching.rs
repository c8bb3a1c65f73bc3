// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests: activation patching on seeded two-layer toy models.
//!
//! Run:
//!   `cargo test --test activation_patching`

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    missing_docs
)]

use candle_core::{DType, Device, Tensor};
use graphcot_mi::{
    Activation, GraphTransformer, GraphTransformerConfig, HookPoint, MIModel, NormType,
    PatchTarget, PatchingContext, activation_patching, activation_patching_at, init_weights,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const A: u32 = 1;
const B: u32 = 2;
const C: u32 = 3;
const D: u32 = 4;
const X: u32 = 5;
const E: u32 = 6;

fn config() -> GraphTransformerConfig {
    GraphTransformerConfig {
        num_layers: 2,
        hidden_size: 32,
        num_heads: 2,
        head_dim: 16,
        intermediate_size: 64,
        vocab_size: 8,
        max_seq_len: 8,
        activation: Activation::Gelu,
        norm_type: NormType::LayerNorm,
        norm_eps: 1e-5,
    }
}

fn model(seed: u64) -> MIModel {
    let transformer = GraphTransformer::random(config(), seed, &Device::Cpu).unwrap();
    MIModel::new(Box::new(transformer), Device::Cpu)
}

/// Toy model whose second attention layer writes nothing position-dependent,
/// so layer 1 cannot move information between positions.
fn model_without_layer1_mixing(seed: u64) -> MIModel {
    let cfg = config();
    let mut tensors = init_weights(&cfg, seed, &Device::Cpu).unwrap();
    let w_o = Tensor::zeros(
        (cfg.num_heads, cfg.head_dim, cfg.hidden_size),
        DType::F32,
        &Device::Cpu,
    )
    .unwrap();
    tensors.insert("blocks.1.attn.W_O".into(), w_o);
    let transformer = GraphTransformer::from_tensors(cfg, tensors, &Device::Cpu).unwrap();
    MIModel::new(Box::new(transformer), Device::Cpu)
}

fn assert_close(actual: f32, expected: f32, tol: f32, what: &str) {
    assert!(
        (actual - expected).abs() <= tol,
        "{what}: expected {expected}, got {actual}"
    );
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn toy_scenario_with_shared_final_token() {
    // clean [A,B,C,D] vs corrupted [A,X,C,D]: both runs compare D against
    // D, so every logit difference is zero and the normalizer falls back
    // to 1.
    let model = model(11);
    let result = activation_patching(&model, &[A, B, C, D], &[A, X, C, D], 3).unwrap();

    assert_eq!(result.num_layers(), 2);
    assert_eq!(result.seq_len(), 4);
    assert_eq!(result.correct_token, D);
    assert_eq!(result.incorrect_token, D);
    assert!(result.clean_diff.abs() < f32::EPSILON);
    for layer in 0..2 {
        for pos in 0..4 {
            let score = result.get(layer, pos).unwrap();
            assert!(score.is_finite());
            assert!(score.abs() < f32::EPSILON, "cell ({layer},{pos}) = {score}");
        }
    }
}

#[test]
fn toy_scenario_restores_the_corrupted_position() {
    let model = model(11);
    let clean = [A, B, C, D];
    let corrupted = [A, X, C, E];
    let result = activation_patching(&model, &clean, &corrupted, 3).unwrap();

    assert_eq!(result.num_layers(), 2);
    assert_eq!(result.seq_len(), 4);
    assert!((result.clean_diff - result.corrupted_diff).abs() > 1e-4);

    // Layer 0 resid_pre is the embedding: restoring position 1 restores
    // every input the comparison row can see.
    assert_close(result.get(0, 1).unwrap(), 1.0, 1e-3, "cell (0,1)");
    for pos in [0, 2, 3] {
        assert_close(result.get(0, pos).unwrap(), 0.0, 1e-4, "layer-0 cell");
    }
    // Position 3 lies after the comparison row at every layer.
    assert_close(result.get(1, 3).unwrap(), 0.0, 1e-4, "cell (1,3)");
}

#[test]
fn toy_scenario_peaks_at_layer0_position1() {
    let model = model_without_layer1_mixing(5);
    let result = activation_patching(&model, &[A, B, C, D], &[A, X, C, E], 3).unwrap();

    let peak = result.get(0, 1).unwrap();
    assert_close(peak, 1.0, 1e-3, "cell (0,1)");
    for layer in 0..2 {
        for pos in 0..4 {
            let score = result.get(layer, pos).unwrap();
            assert!(score <= peak + 1e-3, "cell ({layer},{pos}) = {score} above peak");
        }
    }
    // Layer 1 cannot carry position 1 forward.
    assert_close(result.get(1, 1).unwrap(), 0.0, 1e-4, "cell (1,1)");
    let (layer, pos, _) = result.max_cell().unwrap();
    assert!((layer, pos) == (0, 1) || (layer, pos) == (1, 2));
}

#[test]
fn identical_pair_is_well_defined() {
    let model = model(3);
    let tokens = [A, B, C, D, E];
    let ctx = PatchingContext::new(&model, &tokens, &tokens, 2).unwrap();
    assert!(ctx.clean_diff().abs() < f32::EPSILON);
    assert!((ctx.normalizer() - 1.0).abs() < f32::EPSILON);

    let corrupted_logits = model.logits(&tokens).unwrap();
    let patched = ctx
        .patched_logits(&model, HookPoint::ResidPre(1), 1)
        .unwrap();
    let delta = (patched - corrupted_logits)
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    assert!(delta < 1e-5);

    let result = ctx.scan(&model, PatchTarget::ResidPre).unwrap();
    assert!(result.scores.iter().flatten().all(|s| s.abs() < 1e-5));
}

#[test]
fn final_residual_patch_restores_clean_diff() {
    let model = model(17);
    let clean = [A, B, C, D];
    let corrupted = [A, X, C, E];
    let ctx = PatchingContext::new(&model, &clean, &corrupted, 3).unwrap();
    let score = ctx
        .score_at(&model, HookPoint::ResidPost(1), 2)
        .unwrap();
    assert_close(score, 1.0, 1e-3, "final-layer patch at comparison row");
}

#[test]
fn other_targets_have_the_same_grid() {
    let model = model(23);
    for target in [
        PatchTarget::ResidMid,
        PatchTarget::ResidPost,
        PatchTarget::AttnOut,
        PatchTarget::MlpOut,
    ] {
        let result =
            activation_patching_at(&model, &[A, B, C, D], &[A, X, C, E], 3, target).unwrap();
        assert_eq!(result.target, target);
        assert_eq!(result.num_layers(), 2);
        assert_eq!(result.seq_len(), 4);
        assert!(result.scores.iter().flatten().all(|s| s.is_finite()));
    }
}

#[test]
fn invalid_inputs_are_rejected() {
    let model = model(1);
    assert!(activation_patching(&model, &[A, B, C], &[A, X], 1).is_err());
    assert!(activation_patching(&model, &[A, B, C], &[A, X, C], 0).is_err());
    assert!(activation_patching(&model, &[A, B, C], &[A, X, C], 3).is_err());
}

#[test]
fn result_serializes_to_json() {
    let model = model(2);
    let result = activation_patching(&model, &[A, B, C, D], &[A, X, C, E], 3).unwrap();
    let json = serde_json::to_string(&result).unwrap();
    let back: graphcot_mi::PatchingResult = serde_json::from_str(&json).unwrap();
    assert_eq!(back, result);
    let grid = result.to_tensor(&Device::Cpu).unwrap();
    assert_eq!(grid.dims(), &[2, 4]);
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Small deterministic models for unit tests.

use candle_core::Device;

use crate::backend::MIModel;
use crate::config::{Activation, GraphTransformerConfig, NormType};
use crate::transformer::GraphTransformer;

/// A 16-wide, two-head configuration with an 8-token vocabulary.
pub(crate) fn tiny_config(num_layers: usize) -> GraphTransformerConfig {
    GraphTransformerConfig {
        num_layers,
        hidden_size: 16,
        num_heads: 2,
        head_dim: 8,
        intermediate_size: 32,
        vocab_size: 8,
        max_seq_len: 16,
        activation: Activation::Gelu,
        norm_type: NormType::LayerNorm,
        norm_eps: 1e-5,
    }
}

/// Randomly initialized [`tiny_config`] model on the CPU.
#[allow(clippy::expect_used)]
pub(crate) fn tiny_model(num_layers: usize, seed: u64) -> MIModel {
    let transformer = GraphTransformer::random(tiny_config(num_layers), seed, &Device::Cpu)
        .expect("tiny model weights");
    MIModel::new(Box::new(transformer), Device::Cpu)
}

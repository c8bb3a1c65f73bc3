// SPDX-License-Identifier: MIT OR Apache-2.0

//! Logit lens and tuned lens: decode each layer's normalized residual
//! stream into vocabulary space.
//!
//! Lens layers are numbered `1..=N` for an `N`-layer model. Lens layer
//! `l < N` reads the `ln1`-normalized input of block `l`
//! ([`HookPoint::Ln1Normalized`]), and lens layer `N` reads the final
//! normalized stream ([`HookPoint::FinalNorm`]). Each is projected with
//! a `[d_model, d_vocab]` matrix and no bias: the model's own unembedding
//! for the native lens, one calibrated matrix per layer for a tuned lens
//! (see [`TunedLens`]).
//!
//! The decoder only reads an [`ActivationCache`]; it never re-runs the
//! model.

use std::ops::Range;

use candle_core::{D, DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::backend::{MIModel, ModelSignature};
use crate::cache::ActivationCache;
use crate::error::{MIError, Result};
use crate::hooks::HookPoint;
use crate::interp::tuned_lens::TunedLens;
use crate::task::{
    GraphDataset, TaskGenerator, answer_end, prompt_tokens, start_position, token_label,
    token_labels,
};

// ---------------------------------------------------------------------------
// Lens hook points
// ---------------------------------------------------------------------------

/// Hook point decoded by lens layer `lens_layer` (`1..=num_layers`).
///
/// # Errors
///
/// Returns [`MIError::Hook`] if `lens_layer` is outside `1..=num_layers`.
pub fn lens_hook_point(lens_layer: usize, num_layers: usize) -> Result<HookPoint> {
    match lens_layer {
        l if l == num_layers && l > 0 => Ok(HookPoint::FinalNorm),
        l if (1..num_layers).contains(&l) => Ok(HookPoint::Ln1Normalized(l)),
        l => Err(MIError::Hook(format!(
            "lens layer {l} out of range (1..={num_layers})"
        ))),
    }
}

/// Every lens hook point of an `num_layers`-layer model, in lens-layer
/// order.
#[must_use]
pub fn lens_hook_points(num_layers: usize) -> Vec<HookPoint> {
    let mut points: Vec<HookPoint> = (1..num_layers).map(HookPoint::Ln1Normalized).collect();
    if num_layers > 0 {
        points.push(HookPoint::FinalNorm);
    }
    points
}

// ---------------------------------------------------------------------------
// LensDecoder
// ---------------------------------------------------------------------------

/// Projects cached lens activations through one matrix per lens layer.
#[derive(Debug, Clone)]
pub struct LensDecoder {
    /// `(hook, [d_model, d_vocab] matrix)` per lens layer, in order.
    layers: Vec<(HookPoint, Tensor)>,
    /// Model the matrices belong to.
    signature: ModelSignature,
    /// Whether the matrices are calibrated rather than `W_U`.
    tuned: bool,
}

impl LensDecoder {
    /// The native logit lens: the model's unembedding at every layer.
    ///
    /// # Errors
    ///
    /// Propagates errors reading the unembedding.
    pub fn native(model: &MIModel) -> Result<Self> {
        let w_u = model.unembedding()?.to_dtype(DType::F32)?;
        let layers = lens_hook_points(model.num_layers())
            .into_iter()
            .map(|hook| (hook, w_u.clone()))
            .collect();
        Ok(Self {
            layers,
            signature: model.signature(),
            tuned: false,
        })
    }

    /// A tuned lens calibrated for `model`.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::ConfigMismatch`] if the lens was calibrated for a
    /// different configuration, or [`MIError::Calibration`] if it lacks a
    /// lens hook point.
    pub fn tuned(model: &MIModel, lens: &TunedLens) -> Result<Self> {
        let signature = model.signature();
        signature.ensure_matches(&lens.signature())?;
        let layers = lens_hook_points(model.num_layers())
            .into_iter()
            .map(|hook| -> Result<(HookPoint, Tensor)> {
                let matrix = lens.require(&hook)?;
                let weight = matrix
                    .weight()
                    .to_dtype(DType::F32)?
                    .to_device(model.device())?;
                Ok((hook, weight))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            layers,
            signature,
            tuned: true,
        })
    }

    /// Native lens when `lens` is `None`, tuned lens otherwise.
    ///
    /// # Errors
    ///
    /// See [`native`](Self::native) and [`tuned`](Self::tuned).
    pub fn for_model(model: &MIModel, lens: Option<&TunedLens>) -> Result<Self> {
        match lens {
            Some(lens) => Self::tuned(model, lens),
            None => Self::native(model),
        }
    }

    /// Number of lens layers.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Hook points the decoder reads, in lens-layer order.
    pub fn hook_points(&self) -> impl Iterator<Item = HookPoint> + '_ {
        self.layers.iter().map(|(hook, _)| *hook)
    }

    /// Whether this is a calibrated lens.
    #[must_use]
    pub const fn is_tuned(&self) -> bool {
        self.tuned
    }

    /// Lens logits of every position at lens layer `lens_layer`.
    ///
    /// # Shapes
    /// - returns: `[seq, d_vocab]`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::ConfigMismatch`] for a cache from another model
    /// and [`MIError::Hook`] for a missing capture or bad layer.
    pub fn project(&self, cache: &ActivationCache, lens_layer: usize) -> Result<Tensor> {
        cache.ensure_compatible(&self.signature)?;
        let (hook, matrix) = lens_layer
            .checked_sub(1)
            .and_then(|i| self.layers.get(i))
            .ok_or_else(|| {
                MIError::Hook(format!(
                    "lens layer {lens_layer} out of range (1..={})",
                    self.layers.len()
                ))
            })?;
        let resid = cache.residual(hook)?.to_dtype(DType::F32)?;
        Ok(resid.matmul(matrix)?)
    }

    /// Argmax token of every lens layer at every position of `window`.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Hook`] if the window exceeds the sequence, and
    /// propagates [`project`](Self::project) errors.
    pub fn argmax_table(&self, cache: &ActivationCache, window: Range<usize>) -> Result<LensTable> {
        let seq_len = cache.logits().dim(1)?;
        if window.start > window.end || window.end > seq_len {
            return Err(MIError::Hook(format!(
                "lens window {window:?} out of range (seq_len={seq_len})"
            )));
        }
        let mut tokens = Vec::with_capacity(self.num_layers());
        for lens_layer in 1..=self.num_layers() {
            if window.is_empty() {
                tokens.push(Vec::new());
                continue;
            }
            let argmax: Vec<u32> = self
                .project(cache, lens_layer)?
                .narrow(0, window.start, window.len())?
                .argmax(D::Minus1)?
                .to_vec1()?;
            tokens.push(argmax);
        }
        Ok(LensTable {
            window_start: window.start,
            tokens,
            input_labels: Vec::new(),
            labels: Vec::new(),
        })
    }

    /// Lens probability distribution at one position, per lens layer.
    ///
    /// # Shapes
    /// - returns: `[num_lens_layers, d_vocab]`
    fn distributions(&self, cache: &ActivationCache, position: usize) -> Result<Vec<Vec<f32>>> {
        let seq_len = cache.logits().dim(1)?;
        if position >= seq_len {
            return Err(MIError::Hook(format!(
                "position {position} out of range (seq_len={seq_len})"
            )));
        }
        (1..=self.num_layers())
            .map(|lens_layer| -> Result<Vec<f32>> {
                let row = self.project(cache, lens_layer)?.get(position)?;
                Ok(candle_nn::ops::softmax(&row, D::Minus1)?.to_vec1()?)
            })
            .collect()
    }

    /// Probability of each of `targets` at `position`, per lens layer.
    ///
    /// `result[layer][i]` is the probability of `targets[i]` at lens layer
    /// `layer + 1`.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Hook`] if `position` is out of range and
    /// [`MIError::Intervention`] if a target is outside the vocabulary.
    pub fn token_probabilities(
        &self,
        cache: &ActivationCache,
        position: usize,
        targets: &[u32],
    ) -> Result<Vec<Vec<f32>>> {
        self.distributions(cache, position)?
            .into_iter()
            .map(|probs| {
                targets
                    .iter()
                    .map(|&t| {
                        usize::try_from(t)
                            .ok()
                            .and_then(|i| probs.get(i).copied())
                            .ok_or_else(|| {
                                MIError::Intervention(format!("token id {t} out of range"))
                            })
                    })
                    .collect()
            })
            .collect()
    }

    /// Probability of `target` at `position`, one value per lens layer.
    ///
    /// # Errors
    ///
    /// See [`token_probabilities`](Self::token_probabilities).
    pub fn target_probabilities(
        &self,
        cache: &ActivationCache,
        position: usize,
        target: u32,
    ) -> Result<Vec<f32>> {
        Ok(self
            .token_probabilities(cache, position, &[target])?
            .into_iter()
            .filter_map(|row| row.first().copied())
            .collect())
    }

    /// Top-`k` tokens at `position` for every lens layer.
    ///
    /// # Errors
    ///
    /// See [`token_probabilities`](Self::token_probabilities).
    pub fn top_k(
        &self,
        cache: &ActivationCache,
        position: usize,
        k: usize,
        decode_fn: impl Fn(u32) -> String,
    ) -> Result<LogitLensAnalysis> {
        let mut analysis = LogitLensAnalysis::new(position, self.num_layers());
        for (i, probs) in self.distributions(cache, position)?.into_iter().enumerate() {
            let mut ranked: Vec<(u32, f32)> = probs
                .into_iter()
                .enumerate()
                .filter_map(|(id, p)| u32::try_from(id).ok().map(|id| (id, p)))
                .collect();
            ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
            ranked.truncate(k);
            analysis.push(LogitLensResult {
                layer: i + 1,
                predictions: decode_predictions_with(&ranked, &decode_fn),
            });
        }
        Ok(analysis)
    }
}

// ---------------------------------------------------------------------------
// LensTable
// ---------------------------------------------------------------------------

/// Argmax lens predictions: one token per lens layer per window position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LensTable {
    /// Sequence position of the first column.
    pub window_start: usize,
    /// `tokens[layer][column]`, lens layer `layer + 1`.
    pub tokens: Vec<Vec<u32>>,
    /// Input label of every column (empty until labelled).
    pub input_labels: Vec<String>,
    /// Decoded `tokens` (empty until labelled).
    pub labels: Vec<Vec<String>>,
}

impl LensTable {
    /// Number of lens layers (rows).
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.tokens.len()
    }

    /// Number of window positions (columns).
    #[must_use]
    pub fn width(&self) -> usize {
        self.tokens.first().map_or(0, Vec::len)
    }

    /// Predictions of lens layer `lens_layer` (`1..=N`).
    #[must_use]
    pub fn layer(&self, lens_layer: usize) -> Option<&[u32]> {
        self.tokens
            .get(lens_layer.checked_sub(1)?)
            .map(Vec::as_slice)
    }

    /// Attach labels for the inputs and the predictions.
    ///
    /// `inputs` is the full prompt; only the window's columns are kept.
    #[must_use]
    pub fn with_labels(mut self, inputs: &[u32], decode_fn: impl Fn(u32) -> String) -> Self {
        self.input_labels = inputs
            .iter()
            .skip(self.window_start)
            .take(self.width())
            .map(|&t| decode_fn(t))
            .collect();
        self.labels = self
            .tokens
            .iter()
            .map(|row| row.iter().map(|&t| decode_fn(t)).collect())
            .collect();
        self
    }

    /// Print one row per lens layer under the input labels.
    pub fn print_summary(&self) {
        let cell = |s: &str| format!("{s:>6}");
        let header: String = if self.input_labels.is_empty() {
            (0..self.width()).map(|c| cell(&(self.window_start + c).to_string())).collect()
        } else {
            self.input_labels.iter().map(|l| cell(l)).collect()
        };
        println!("{:<12}{header}", "Input");
        for (i, row) in self.tokens.iter().enumerate() {
            let cells: String = match self.labels.get(i) {
                Some(labels) => labels.iter().map(|l| cell(l)).collect(),
                None => row.iter().map(|t| cell(&t.to_string())).collect(),
            };
            println!("{:<12}{cells}", format!("Layer {} LL", i + 1));
        }
    }
}

// ---------------------------------------------------------------------------
// Top-k analysis
// ---------------------------------------------------------------------------

/// Top-k lens predictions at a single lens layer.
#[derive(Debug, Clone)]
pub struct LogitLensResult {
    /// Lens layer (`1..=N`).
    pub layer: usize,
    /// Predictions, most probable first.
    pub predictions: Vec<TokenPrediction>,
}

/// A single token prediction.
#[derive(Debug, Clone)]
pub struct TokenPrediction {
    /// Token id.
    pub token_id: u32,
    /// Token label.
    pub token: String,
    /// Probability (0.0 to 1.0).
    pub probability: f32,
}

/// Top-k lens predictions at one position across all lens layers.
///
/// # Example
///
/// ```
/// use graphcot_mi::{LogitLensAnalysis, LogitLensResult, TokenPrediction};
///
/// let mut analysis = LogitLensAnalysis::new(12, 2);
/// analysis.push(LogitLensResult {
///     layer: 1,
///     predictions: vec![TokenPrediction { token_id: 4, token: ">2".into(), probability: 0.3 }],
/// });
/// analysis.push(LogitLensResult {
///     layer: 2,
///     predictions: vec![TokenPrediction { token_id: 5, token: ">3".into(), probability: 0.9 }],
/// });
/// assert_eq!(analysis.first_appearance(">3", 1), Some(2));
/// ```
#[derive(Debug)]
pub struct LogitLensAnalysis {
    /// Analysed sequence position.
    pub position: usize,
    /// Results for each lens layer.
    pub layer_results: Vec<LogitLensResult>,
    /// Number of lens layers.
    pub n_layers: usize,
}

impl LogitLensAnalysis {
    /// Create an empty analysis for `position`.
    #[must_use]
    pub fn new(position: usize, n_layers: usize) -> Self {
        Self {
            position,
            layer_results: Vec::with_capacity(n_layers),
            n_layers,
        }
    }

    /// Add a layer's result.
    pub fn push(&mut self, result: LogitLensResult) {
        self.layer_results.push(result);
    }

    /// `(token, probability)` of the top prediction at each layer.
    #[must_use]
    pub fn top_predictions(&self) -> Vec<(&str, f32)> {
        self.layer_results
            .iter()
            .filter_map(|r| r.predictions.first())
            .map(|p| (p.token.as_str(), p.probability))
            .collect()
    }

    /// First lens layer whose top-`k` contains exactly `token`.
    #[must_use]
    pub fn first_appearance(&self, token: &str, k: usize) -> Option<usize> {
        self.layer_results
            .iter()
            .find(|r| r.predictions.iter().take(k).any(|p| p.token == token))
            .map(|r| r.layer)
    }

    /// Print the top prediction at each layer.
    pub fn print_summary(&self) {
        println!("=== Logit Lens at position {} ===", self.position);
        for result in &self.layer_results {
            if let Some(top) = result.predictions.first() {
                println!(
                    "  Layer {:2}: {:>8} ({:.1}%)",
                    result.layer,
                    top.token,
                    top.probability * 100.0
                );
            }
        }
    }
}

/// Attach labels to `(token_id, probability)` pairs.
pub fn decode_predictions_with(
    predictions: &[(u32, f32)],
    decode_fn: impl Fn(u32) -> String,
) -> Vec<TokenPrediction> {
    predictions
        .iter()
        .map(|&(token_id, probability)| TokenPrediction {
            token_id,
            token: decode_fn(token_id),
            probability,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Task-level helpers
// ---------------------------------------------------------------------------

/// Per-layer probability of one graph state's token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateProbabilities {
    /// Graph state.
    pub state: usize,
    /// Token naming the state.
    pub token: u32,
    /// Probability at each lens layer.
    pub probabilities: Vec<f32>,
}

/// Run an instance's prompt, capturing the lens hook points.
fn lens_cache<G: GraphDataset>(
    model: &MIModel,
    dataset: &G,
    instance: &G::Instance,
) -> Result<(Vec<u32>, ActivationCache)> {
    let tokens = prompt_tokens(dataset, instance)?;
    let cache = model.run_with_cache(&tokens, &lens_hook_points(model.num_layers()))?;
    Ok((tokens, cache))
}

/// Labelled argmax lens table over an instance's answer, from just after
/// the start marker to the last non-pad token.
///
/// # Errors
///
/// Returns [`MIError::Task`] if the prompt has no start marker, and
/// propagates model and lens errors.
pub fn logit_lens_table<G: GraphDataset>(
    model: &MIModel,
    dataset: &G,
    instance: &G::Instance,
    lens: Option<&TunedLens>,
) -> Result<LensTable> {
    let decoder = LensDecoder::for_model(model, lens)?;
    let (tokens, cache) = lens_cache(model, dataset, instance)?;
    let start = start_position(dataset, &tokens)? + 1;
    let end = answer_end(dataset, &tokens).max(start);
    Ok(decoder
        .argmax_table(&cache, start..end)?
        .with_labels(&tokens, |t| token_label(dataset, t)))
}

/// Per-layer probability of the token that follows `position`.
///
/// # Errors
///
/// Returns [`MIError::Task`] if `position` is the last prompt position, and
/// propagates model and lens errors.
pub fn correct_token_probabilities<G: GraphDataset>(
    model: &MIModel,
    dataset: &G,
    instance: &G::Instance,
    position: usize,
    lens: Option<&TunedLens>,
) -> Result<Vec<f32>> {
    let decoder = LensDecoder::for_model(model, lens)?;
    let (tokens, cache) = lens_cache(model, dataset, instance)?;
    let target = *tokens.get(position + 1).ok_or_else(|| {
        MIError::Task(format!(
            "no token follows position {position} (prompt length {})",
            tokens.len()
        ))
    })?;
    tracing::debug!(
        position,
        target = %token_label(dataset, target),
        "lens probability of the correct token"
    );
    decoder.target_probabilities(&cache, position, target)
}

/// Per-layer probability of every graph neighbour of the state at
/// `position`.
///
/// # Errors
///
/// Returns [`MIError::Task`] if the token at `position` is not a state
/// token or the adjacency matrix does not cover it, and propagates model
/// and lens errors.
pub fn neighbor_probabilities<G, T>(
    model: &MIModel,
    dataset: &G,
    generator: &T,
    instance: &G::Instance,
    position: usize,
    lens: Option<&TunedLens>,
) -> Result<Vec<StateProbabilities>>
where
    G: GraphDataset,
    T: TaskGenerator<G::Instance>,
{
    let decoder = LensDecoder::for_model(model, lens)?;
    let (tokens, cache) = lens_cache(model, dataset, instance)?;

    let labels = token_labels(dataset, &tokens);
    let current = tokens
        .get(position)
        .and_then(|&t| dataset.token_state(t))
        .ok_or_else(|| {
            MIError::Task(format!(
                "token `{}` at position {position} is not a graph state",
                labels.get(position).map_or("<none>", String::as_str)
            ))
        })?;

    let adjacency = generator.extract_adjacency(instance)?;
    let edges = adjacency.get(current).ok_or_else(|| {
        MIError::Task(format!(
            "adjacency matrix has no row for state {current} ({} rows)",
            adjacency.len()
        ))
    })?;

    let neighbours = (0..dataset.n_states())
        .filter(|&s| edges.get(s).copied().unwrap_or(false))
        .map(|s| {
            dataset
                .state_token(s)
                .map(|token| (s, token))
                .ok_or_else(|| MIError::Task(format!("vocabulary has no token for state {s}")))
        })
        .collect::<Result<Vec<(usize, u32)>>>()?;

    let targets: Vec<u32> = neighbours.iter().map(|&(_, token)| token).collect();
    let per_layer = decoder.token_probabilities(&cache, position, &targets)?;

    Ok(neighbours
        .into_iter()
        .enumerate()
        .map(|(i, (state, token))| StateProbabilities {
            state,
            token,
            probabilities: per_layer
                .iter()
                .filter_map(|row| row.get(i).copied())
                .collect(),
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

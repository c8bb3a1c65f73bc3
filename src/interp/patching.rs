// SPDX-License-Identifier: MIT OR Apache-2.0

//! Activation patching: locate the (layer, position) cells whose clean
//! activation restores a correct prediction on a corrupted prompt.
//!
//! The metric is the logit difference at the comparison position,
//! `logit[cp - 1, clean[cp]] - logit[cp - 1, corrupted[cp]]`. For every
//! cell, one corrupted forward pass runs with the clean activation
//! substituted at that single position, and the recovered difference is
//! normalized so the clean run scores `1` and the corrupted run `0`:
//!
//! ```text
//! score = (patched - corrupted) / (clean - corrupted)
//! ```
//!
//! When the clean and corrupted differences are equal the denominator is
//! replaced by `1`.

use std::fmt;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::backend::MIModel;
use crate::cache::ActivationCache;
use crate::error::{MIError, Result};
use crate::hooks::{HookPoint, HookSpec, Intervention};

// ---------------------------------------------------------------------------
// PatchTarget
// ---------------------------------------------------------------------------

/// Which residual-shaped activation of each layer a scan patches.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchTarget {
    /// Residual stream entering the layer.
    #[default]
    ResidPre,
    /// Residual stream between attention and MLP.
    ResidMid,
    /// Residual stream leaving the layer.
    ResidPost,
    /// Attention output.
    AttnOut,
    /// MLP output.
    MlpOut,
}

impl PatchTarget {
    /// Hook point of this target in `layer`.
    #[must_use]
    pub const fn hook(self, layer: usize) -> HookPoint {
        match self {
            Self::ResidPre => HookPoint::ResidPre(layer),
            Self::ResidMid => HookPoint::ResidMid(layer),
            Self::ResidPost => HookPoint::ResidPost(layer),
            Self::AttnOut => HookPoint::AttnOut(layer),
            Self::MlpOut => HookPoint::MlpOut(layer),
        }
    }
}

impl fmt::Display for PatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResidPre => write!(f, "resid_pre"),
            Self::ResidMid => write!(f, "resid_mid"),
            Self::ResidPost => write!(f, "resid_post"),
            Self::AttnOut => write!(f, "attn_out"),
            Self::MlpOut => write!(f, "mlp_out"),
        }
    }
}

// ---------------------------------------------------------------------------
// Metric
// ---------------------------------------------------------------------------

/// Logit difference between the clean and corrupted tokens at
/// `comparison_position`, read from the row that predicts it.
///
/// # Shapes
/// - `logits`: `[1, seq, vocab]`
///
/// # Errors
///
/// Returns [`MIError::Intervention`] if `comparison_position` is `0` or
/// outside either sequence, or a token id is outside the vocabulary.
pub fn logit_diff(
    logits: &Tensor,
    clean: &[u32],
    corrupted: &[u32],
    comparison_position: usize,
) -> Result<f32> {
    let (correct, incorrect) = comparison_tokens(clean, corrupted, comparison_position)?;
    let row: Vec<f32> = logits
        .get(0)?
        .get(comparison_position - 1)?
        .to_dtype(DType::F32)?
        .to_vec1()?;
    let logit = |token: u32| {
        usize::try_from(token)
            .ok()
            .and_then(|i| row.get(i).copied())
            .ok_or_else(|| {
                MIError::Intervention(format!("token id {token} out of range (d_vocab={})", row.len()))
            })
    };
    Ok(logit(correct)? - logit(incorrect)?)
}

/// The `(correct, incorrect)` token pair at the comparison position.
fn comparison_tokens(
    clean: &[u32],
    corrupted: &[u32],
    comparison_position: usize,
) -> Result<(u32, u32)> {
    if comparison_position == 0 {
        return Err(MIError::Intervention(
            "comparison position must be at least 1".into(),
        ));
    }
    match (clean.get(comparison_position), corrupted.get(comparison_position)) {
        (Some(&correct), Some(&incorrect)) => Ok((correct, incorrect)),
        _ => Err(MIError::Intervention(format!(
            "comparison position {comparison_position} out of range (seq_len={})",
            clean.len().min(corrupted.len())
        ))),
    }
}

// ---------------------------------------------------------------------------
// PatchingContext
// ---------------------------------------------------------------------------

/// The clean run and both baselines of one (clean, corrupted, position)
/// triple.
///
/// Built once, then shared read-only by every patched forward pass.
#[derive(Debug, Clone)]
pub struct PatchingContext {
    /// Clean prompt.
    clean: Vec<u32>,
    /// Corrupted prompt, same length as `clean`.
    corrupted: Vec<u32>,
    /// Position whose prediction is compared.
    comparison_position: usize,
    /// `clean[comparison_position]`.
    correct_token: u32,
    /// `corrupted[comparison_position]`.
    incorrect_token: u32,
    /// Every residual-shaped activation of the clean run.
    clean_cache: ActivationCache,
    /// Metric on the clean run.
    clean_diff: f32,
    /// Metric on the corrupted run.
    corrupted_diff: f32,
}

impl PatchingContext {
    /// Run the clean prompt with cache and the corrupted prompt without,
    /// and record both baselines.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Intervention`] if the prompts differ in length or
    /// the comparison position is not in `1..len`, and propagates model
    /// errors.
    #[allow(clippy::float_cmp)] // same exact test as `normalizer`
    pub fn new(
        model: &MIModel,
        clean: &[u32],
        corrupted: &[u32],
        comparison_position: usize,
    ) -> Result<Self> {
        if clean.len() != corrupted.len() {
            return Err(MIError::Intervention(format!(
                "clean and corrupted prompts differ in length ({} vs {})",
                clean.len(),
                corrupted.len()
            )));
        }
        let (correct, incorrect) = comparison_tokens(clean, corrupted, comparison_position)?;

        let residual_hooks: Vec<HookPoint> = HookPoint::all(model.num_layers())
            .into_iter()
            .filter(HookPoint::is_residual_shaped)
            .collect();
        let clean_cache = model.run_with_cache(clean, &residual_hooks)?;
        let clean_diff = logit_diff(clean_cache.logits(), clean, corrupted, comparison_position)?;

        let corrupted_logits = model.logits(corrupted)?;
        let corrupted_diff = logit_diff(&corrupted_logits, clean, corrupted, comparison_position)?;

        tracing::info!(
            clean_diff,
            corrupted_diff,
            positive = correct,
            negative = incorrect,
            "patching baselines at position {comparison_position}"
        );
        if clean_diff == corrupted_diff {
            tracing::debug!("clean and corrupted logit differences are equal, normalizing by 1");
        }

        Ok(Self {
            clean: clean.to_vec(),
            corrupted: corrupted.to_vec(),
            comparison_position,
            correct_token: correct,
            incorrect_token: incorrect,
            clean_cache,
            clean_diff,
            corrupted_diff,
        })
    }

    /// Metric on the clean run.
    #[must_use]
    pub const fn clean_diff(&self) -> f32 {
        self.clean_diff
    }

    /// Metric on the corrupted run.
    #[must_use]
    pub const fn corrupted_diff(&self) -> f32 {
        self.corrupted_diff
    }

    /// Position whose prediction is compared.
    #[must_use]
    pub const fn comparison_position(&self) -> usize {
        self.comparison_position
    }

    /// Cached clean-run activations.
    #[must_use]
    pub const fn clean_cache(&self) -> &ActivationCache {
        &self.clean_cache
    }

    /// Sequence length of both prompts.
    #[must_use]
    pub fn seq_len(&self) -> usize {
        self.clean.len()
    }

    /// `clean - corrupted`, or `1` when the two are equal.
    #[must_use]
    #[allow(clippy::float_cmp)] // only the exactly-degenerate case is replaced
    pub fn normalizer(&self) -> f32 {
        let denom = self.clean_diff - self.corrupted_diff;
        if denom == 0.0 {
            1.0
        } else {
            denom
        }
    }

    /// Logits of the corrupted prompt with the clean activation at
    /// (`hook`, `position`) patched in.
    ///
    /// # Shapes
    /// - returns: `[1, seq, vocab]`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::ConfigMismatch`] if `model` differs from the one
    /// that built this context, [`MIError::Hook`] if `hook` is not a
    /// residual-shaped point, or [`MIError::Intervention`] if `position`
    /// is out of range.
    pub fn patched_logits(&self, model: &MIModel, hook: HookPoint, position: usize) -> Result<Tensor> {
        self.clean_cache.ensure_compatible(&model.signature())?;
        if !hook.is_residual_shaped() {
            return Err(MIError::Hook(format!(
                "cannot position-patch `{hook}`: not in the residual stream"
            )));
        }
        let source = self.clean_cache.require(&hook)?.clone();
        let mut spec = HookSpec::new();
        spec.intervene(hook, Intervention::patch_position(position, source));
        model.run_with_hooks(&self.corrupted, &spec)
    }

    /// Normalized score of patching the clean activation at (`hook`,
    /// `position`) into the corrupted run.
    ///
    /// # Errors
    ///
    /// Same as [`patched_logits`](Self::patched_logits).
    pub fn score_at(&self, model: &MIModel, hook: HookPoint, position: usize) -> Result<f32> {
        let logits = self.patched_logits(model, hook, position)?;
        let patched = logit_diff(&logits, &self.clean, &self.corrupted, self.comparison_position)?;
        Ok((patched - self.corrupted_diff) / self.normalizer())
    }

    /// Score every (layer, position) cell of `target`.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`score_at`](Self::score_at).
    pub fn scan(&self, model: &MIModel, target: PatchTarget) -> Result<PatchingResult> {
        let num_layers = model.num_layers();
        let seq_len = self.seq_len();
        let mut scores = Vec::with_capacity(num_layers);
        for layer in 0..num_layers {
            tracing::debug!(layer, %target, "patching layer");
            let row = (0..seq_len)
                .map(|position| self.score_at(model, target.hook(layer), position))
                .collect::<Result<Vec<f32>>>()?;
            scores.push(row);
        }

        Ok(PatchingResult {
            scores,
            target,
            comparison_position: self.comparison_position,
            correct_token: self.correct_token,
            incorrect_token: self.incorrect_token,
            clean_diff: self.clean_diff,
            corrupted_diff: self.corrupted_diff,
        })
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Patch the residual stream entering each layer, one position at a time.
///
/// # Errors
///
/// See [`PatchingContext::new`] and [`PatchingContext::score_at`].
pub fn activation_patching(
    model: &MIModel,
    clean: &[u32],
    corrupted: &[u32],
    comparison_position: usize,
) -> Result<PatchingResult> {
    activation_patching_at(model, clean, corrupted, comparison_position, PatchTarget::ResidPre)
}

/// Patch the chosen activation of each layer, one position at a time.
///
/// # Errors
///
/// See [`PatchingContext::new`] and [`PatchingContext::score_at`].
pub fn activation_patching_at(
    model: &MIModel,
    clean: &[u32],
    corrupted: &[u32],
    comparison_position: usize,
    target: PatchTarget,
) -> Result<PatchingResult> {
    PatchingContext::new(model, clean, corrupted, comparison_position)?.scan(model, target)
}

// ---------------------------------------------------------------------------
// PatchingResult
// ---------------------------------------------------------------------------

/// Normalized patching scores over a `[num_layers, seq_len]` grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchingResult {
    /// `scores[layer][position]`.
    pub scores: Vec<Vec<f32>>,
    /// Patched activation kind.
    pub target: PatchTarget,
    /// Position whose prediction was compared.
    pub comparison_position: usize,
    /// Clean token at the comparison position (positive direction).
    pub correct_token: u32,
    /// Corrupted token at the comparison position (negative direction).
    pub incorrect_token: u32,
    /// Metric on the clean run.
    pub clean_diff: f32,
    /// Metric on the corrupted run.
    pub corrupted_diff: f32,
}

impl PatchingResult {
    /// Number of layers (rows).
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.scores.len()
    }

    /// Sequence length (columns).
    #[must_use]
    pub fn seq_len(&self) -> usize {
        self.scores.first().map_or(0, Vec::len)
    }

    /// Score of one cell.
    #[must_use]
    pub fn get(&self, layer: usize, position: usize) -> Option<f32> {
        self.scores.get(layer)?.get(position).copied()
    }

    /// `(layer, position, score)` of the highest-scoring cell; the first
    /// in row-major order on ties.
    #[must_use]
    pub fn max_cell(&self) -> Option<(usize, usize, f32)> {
        let mut best: Option<(usize, usize, f32)> = None;
        for (layer, row) in self.scores.iter().enumerate() {
            for (position, &score) in row.iter().enumerate() {
                if best.is_none_or(|(_, _, b)| score > b) {
                    best = Some((layer, position, score));
                }
            }
        }
        best
    }

    /// Scores as a tensor.
    ///
    /// # Shapes
    /// - returns: `[num_layers, seq_len]`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Model`] on tensor allocation failure.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let flat: Vec<f32> = self.scores.iter().flatten().copied().collect();
        Ok(Tensor::from_vec(flat, (self.num_layers(), self.seq_len()), device)?)
    }

    /// Print the grid with one row per layer.
    ///
    /// `labels` annotates the columns; positions are used when it is
    /// shorter than the sequence.
    pub fn print_summary(&self, labels: &[String]) {
        println!("=== Activation Patching ({}) ===", self.target);
        println!(
            "comparison position {}: clean diff {:.3}, corrupted diff {:.3}",
            self.comparison_position, self.clean_diff, self.corrupted_diff
        );
        let header: Vec<String> = (0..self.seq_len())
            .map(|p| labels.get(p).map_or_else(|| p.to_string(), |l| format!("{l}_{p}")))
            .collect();
        println!("         {}", header.iter().map(|h| format!("{h:>8}")).collect::<String>());
        for (layer, row) in self.scores.iter().enumerate() {
            let cells: String = row.iter().map(|s| format!("{s:>8.3}")).collect();
            println!("Layer {layer:2} {cells}");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

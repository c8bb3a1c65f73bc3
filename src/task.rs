// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces to the graph-traversal task: dataset vocabulary, instance
//! generation and correctness checking.
//!
//! Graph generation and tokenization live outside this crate; analyses
//! consume them through [`GraphDataset`] and [`TaskGenerator`]. A prompt
//! is a token sequence that contains a start marker, followed by the
//! traversal the model must produce, right-padded with the dataset's pad
//! token:
//!
//! ```text
//! <graph description> ... <start> <source> >3 >7 >1 , , ,
//!                                          ^ answer span ^
//! ```
//!
//! The *answer span* starts two tokens after the start marker and ends
//! after the last non-pad token.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use candle_core::D;
use serde::{Deserialize, Serialize};

use crate::backend::MIModel;
use crate::error::{MIError, Result};

// ---------------------------------------------------------------------------
// GraphDataset
// ---------------------------------------------------------------------------

/// Vocabulary and tokenization of a graph-traversal dataset.
///
/// State tokens are spelled `>{i}` for state `i`; the default
/// [`state_token`](Self::state_token) and
/// [`token_state`](Self::token_state) follow that convention.
pub trait GraphDataset {
    /// A task instance (one graph plus its query).
    type Instance;

    /// Number of graph states (nodes).
    fn n_states(&self) -> usize;

    /// Human-readable label of a token id.
    fn id_to_token(&self, id: u32) -> Option<&str>;

    /// Token id of a label.
    fn token_to_id(&self, token: &str) -> Option<u32>;

    /// Id of the marker that precedes the answer.
    fn start_token(&self) -> u32;

    /// Id used to right-pad prompts.
    fn pad_token(&self) -> u32;

    /// Full token sequence of an instance, including its final token.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Task`] if the instance cannot be tokenized.
    fn tokenize(&self, instance: &Self::Instance) -> Result<Vec<u32>>;

    /// Token id naming graph state `state`.
    fn state_token(&self, state: usize) -> Option<u32> {
        self.token_to_id(&format!(">{state}"))
    }

    /// Graph state named by token `id`, if it is a state token.
    fn token_state(&self, id: u32) -> Option<usize> {
        let label = self.id_to_token(id)?;
        let (_, state) = label.rsplit_once('>')?;
        state.parse().ok()
    }
}

/// Label of `id`, falling back to `<id>` for unknown ids.
pub fn token_label<G: GraphDataset + ?Sized>(dataset: &G, id: u32) -> String {
    dataset
        .id_to_token(id)
        .map_or_else(|| format!("<{id}>"), str::to_owned)
}

// ---------------------------------------------------------------------------
// Instance generation
// ---------------------------------------------------------------------------

/// Order in which the traversal visits the path.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathOrder {
    /// Source to goal.
    Forward,
    /// Goal back to source.
    #[default]
    Backward,
    /// Either direction, chosen per instance.
    Random,
}

impl fmt::Display for PathOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forward => write!(f, "forward"),
            Self::Backward => write!(f, "backward"),
            Self::Random => write!(f, "random"),
        }
    }
}

impl FromStr for PathOrder {
    type Err = MIError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "forward" => Ok(Self::Forward),
            "backward" => Ok(Self::Backward),
            "random" => Ok(Self::Random),
            other => Err(MIError::Config(format!("unknown path order `{other}`"))),
        }
    }
}

/// Parameters of one generated instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Number of graph states.
    pub n_states: usize,
    /// Fixed path length, or `None` to let the generator choose.
    pub path_length: Option<usize>,
    /// Traversal order.
    pub order: PathOrder,
}

/// Source of synthetic task instances.
pub trait TaskGenerator<I> {
    /// Generate one instance deterministically from `seed`.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Task`] if no instance can be generated for `spec`.
    fn generate(&self, spec: &TaskSpec, seed: u64) -> Result<I>;

    /// Adjacency matrix of the instance's graph: `adjacency[i][j]` is true
    /// when state `i` has an edge to state `j`.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Task`] if the graph cannot be recovered.
    fn extract_adjacency(&self, instance: &I) -> Result<Vec<Vec<bool>>>;
}

// ---------------------------------------------------------------------------
// Correctness
// ---------------------------------------------------------------------------

/// Decides whether the model solves a task instance.
pub trait CorrectnessOracle<G: GraphDataset> {
    /// Whether `model` answers `instance` correctly.
    ///
    /// # Errors
    ///
    /// Propagates model and tokenization errors. An incorrect answer is
    /// `Ok(false)`, never an error.
    fn is_correct(&self, model: &MIModel, dataset: &G, instance: &G::Instance) -> Result<bool>;
}

/// Accepts an instance when the model's greedy next-token prediction
/// matches the reference at every position of the answer span.
///
/// Under teacher forcing this is equivalent to greedy decoding
/// reproducing the whole answer. An instance with an empty answer span
/// is rejected rather than reported as an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnswerSpanOracle;

impl<G: GraphDataset> CorrectnessOracle<G> for AnswerSpanOracle {
    fn is_correct(&self, model: &MIModel, dataset: &G, instance: &G::Instance) -> Result<bool> {
        let tokens = prompt_tokens(dataset, instance)?;
        let start = start_position(dataset, &tokens)? + 2;
        let end = answer_end(dataset, &tokens);
        if start >= end {
            tracing::trace!(start, end, "empty answer span");
            return Ok(false);
        }
        let mut span = start..end;
        let predicted: Vec<u32> = model
            .logits(&tokens)?
            .squeeze(0)?
            .argmax(D::Minus1)?
            .to_vec1()?;
        // predicted[p] is the model's guess for tokens[p + 1].
        Ok(span.all(|p| predicted.get(p - 1) == tokens.get(p)))
    }
}

// ---------------------------------------------------------------------------
// Prompt helpers
// ---------------------------------------------------------------------------

/// Tokenize an instance and drop its final token, giving the sequence the
/// model is run on.
///
/// # Errors
///
/// Returns [`MIError::Task`] if the instance tokenizes to fewer than two
/// tokens.
pub fn prompt_tokens<G: GraphDataset + ?Sized>(
    dataset: &G,
    instance: &G::Instance,
) -> Result<Vec<u32>> {
    let mut tokens = dataset.tokenize(instance)?;
    if tokens.len() < 2 {
        return Err(MIError::Task(format!(
            "instance tokenizes to {} token(s), need at least 2",
            tokens.len()
        )));
    }
    tokens.pop();
    Ok(tokens)
}

/// Labels of a token sequence.
pub fn token_labels<G: GraphDataset + ?Sized>(dataset: &G, tokens: &[u32]) -> Vec<String> {
    tokens.iter().map(|&t| token_label(dataset, t)).collect()
}

/// Position of the first start marker.
///
/// # Errors
///
/// Returns [`MIError::Task`] if the sequence has no start marker.
pub fn start_position<G: GraphDataset + ?Sized>(dataset: &G, tokens: &[u32]) -> Result<usize> {
    let start = dataset.start_token();
    tokens
        .iter()
        .position(|&t| t == start)
        .ok_or_else(|| MIError::Task("token sequence has no start marker".into()))
}

/// One past the last non-pad position (`0` for an all-pad sequence).
pub fn answer_end<G: GraphDataset + ?Sized>(dataset: &G, tokens: &[u32]) -> usize {
    let pad = dataset.pad_token();
    tokens.iter().rposition(|&t| t != pad).map_or(0, |i| i + 1)
}

/// Positions of the answer tokens: from two past the start marker to
/// [`answer_end`].
///
/// # Errors
///
/// Returns [`MIError::Task`] if there is no start marker or the span is
/// empty.
pub fn answer_span<G: GraphDataset + ?Sized>(dataset: &G, tokens: &[u32]) -> Result<Range<usize>> {
    let start = start_position(dataset, tokens)? + 2;
    let end = answer_end(dataset, tokens);
    if start >= end {
        return Err(MIError::Task(format!(
            "empty answer span (start={start}, end={end})"
        )));
    }
    Ok(start..end)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

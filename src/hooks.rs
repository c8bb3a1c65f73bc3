// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hook system for activation capture and intervention.
//!
//! Provides [`HookPoint`] (named locations in a forward pass),
//! [`HookSpec`] (what to capture and where to intervene), and
//! [`HookCache`] (tensors collected while a forward pass runs).
//!
//! Hook points form a closed set: every location the backend exposes is
//! an enum variant, so lookups are checked at compile time and an unknown
//! name is a parse error rather than a silent miss.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use candle_core::Tensor;

use crate::error::{MIError, Result};

// ---------------------------------------------------------------------------
// HookPoint
// ---------------------------------------------------------------------------

/// Named location in a forward pass where activations can be captured
/// or interventions applied.
///
/// Mirrors the `TransformerLens` hook point naming convention via
/// [`Display`](std::fmt::Display) and [`FromStr`].
///
/// # String conversion
///
/// ```
/// use graphcot_mi::HookPoint;
///
/// let hook = HookPoint::Ln1Normalized(3);
/// assert_eq!(hook.to_string(), "blocks.3.ln1.hook_normalized");
///
/// let parsed: HookPoint = "blocks.3.ln1.hook_normalized".parse().unwrap();
/// assert_eq!(parsed, hook);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookPoint {
    // -- Embedding --
    /// After token embedding (`hook_embed`).
    Embed,
    /// After positional embedding (`hook_pos_embed`).
    PosEmbed,

    // -- Per-layer --
    /// Residual stream before layer `i` (`blocks.{i}.hook_resid_pre`).
    ResidPre(usize),
    /// Normalized input to the attention block of layer `i`
    /// (`blocks.{i}.ln1.hook_normalized`).
    Ln1Normalized(usize),
    /// Pre-softmax attention scores in layer `i` (`blocks.{i}.attn.hook_attn_scores`).
    AttnScores(usize),
    /// Post-softmax attention pattern in layer `i` (`blocks.{i}.attn.hook_pattern`).
    ///
    /// Shape: `[batch, heads, seq_query, seq_source]`.
    AttnPattern(usize),
    /// Attention output in layer `i` (`blocks.{i}.hook_attn_out`).
    AttnOut(usize),
    /// Residual stream between attention and MLP in layer `i`
    /// (`blocks.{i}.hook_resid_mid`).
    ResidMid(usize),
    /// Normalized input to the MLP of layer `i` (`blocks.{i}.ln2.hook_normalized`).
    Ln2Normalized(usize),
    /// MLP pre-activation in layer `i` (`blocks.{i}.mlp.hook_pre`).
    MlpPre(usize),
    /// MLP post-activation in layer `i` (`blocks.{i}.mlp.hook_post`).
    MlpPost(usize),
    /// MLP output in layer `i` (`blocks.{i}.hook_mlp_out`).
    MlpOut(usize),
    /// Residual stream after full layer `i` (`blocks.{i}.hook_resid_post`).
    ResidPost(usize),

    // -- Final --
    /// After the final layer norm (`ln_final.hook_normalized`).
    FinalNorm,
}

impl HookPoint {
    /// Layer index of a per-layer hook point, `None` for embedding and
    /// final-norm points.
    #[must_use]
    pub const fn layer(&self) -> Option<usize> {
        match self {
            Self::Embed | Self::PosEmbed | Self::FinalNorm => None,
            Self::ResidPre(i)
            | Self::Ln1Normalized(i)
            | Self::AttnScores(i)
            | Self::AttnPattern(i)
            | Self::AttnOut(i)
            | Self::ResidMid(i)
            | Self::Ln2Normalized(i)
            | Self::MlpPre(i)
            | Self::MlpPost(i)
            | Self::MlpOut(i)
            | Self::ResidPost(i) => Some(*i),
        }
    }

    /// Whether the activation at this point is `[batch, seq, d_model]`,
    /// i.e. lives in the residual stream basis.
    #[must_use]
    pub const fn is_residual_shaped(&self) -> bool {
        matches!(
            self,
            Self::Embed
                | Self::PosEmbed
                | Self::ResidPre(_)
                | Self::Ln1Normalized(_)
                | Self::AttnOut(_)
                | Self::ResidMid(_)
                | Self::Ln2Normalized(_)
                | Self::MlpOut(_)
                | Self::ResidPost(_)
                | Self::FinalNorm
        )
    }

    /// Every hook point exposed by a model with `num_layers` layers, in
    /// forward-pass order.
    #[must_use]
    pub fn all(num_layers: usize) -> Vec<Self> {
        let mut points = Vec::with_capacity(2 + num_layers * 11 + 1);
        points.push(Self::Embed);
        points.push(Self::PosEmbed);
        for i in 0..num_layers {
            points.extend([
                Self::ResidPre(i),
                Self::Ln1Normalized(i),
                Self::AttnScores(i),
                Self::AttnPattern(i),
                Self::AttnOut(i),
                Self::ResidMid(i),
                Self::Ln2Normalized(i),
                Self::MlpPre(i),
                Self::MlpPost(i),
                Self::MlpOut(i),
                Self::ResidPost(i),
            ]);
        }
        points.push(Self::FinalNorm);
        points
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embed => write!(f, "hook_embed"),
            Self::PosEmbed => write!(f, "hook_pos_embed"),
            Self::ResidPre(i) => write!(f, "blocks.{i}.hook_resid_pre"),
            Self::Ln1Normalized(i) => write!(f, "blocks.{i}.ln1.hook_normalized"),
            Self::AttnScores(i) => write!(f, "blocks.{i}.attn.hook_attn_scores"),
            Self::AttnPattern(i) => write!(f, "blocks.{i}.attn.hook_pattern"),
            Self::AttnOut(i) => write!(f, "blocks.{i}.hook_attn_out"),
            Self::ResidMid(i) => write!(f, "blocks.{i}.hook_resid_mid"),
            Self::Ln2Normalized(i) => write!(f, "blocks.{i}.ln2.hook_normalized"),
            Self::MlpPre(i) => write!(f, "blocks.{i}.mlp.hook_pre"),
            Self::MlpPost(i) => write!(f, "blocks.{i}.mlp.hook_post"),
            Self::MlpOut(i) => write!(f, "blocks.{i}.hook_mlp_out"),
            Self::ResidPost(i) => write!(f, "blocks.{i}.hook_resid_post"),
            Self::FinalNorm => write!(f, "ln_final.hook_normalized"),
        }
    }
}

/// Parse a `TransformerLens`-style string into a [`HookPoint`].
///
/// # Errors
///
/// Returns [`MIError::Hook`] for names outside the closed hook set.
impl FromStr for HookPoint {
    type Err = MIError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hook_embed" => return Ok(Self::Embed),
            "hook_pos_embed" => return Ok(Self::PosEmbed),
            "ln_final.hook_normalized" => return Ok(Self::FinalNorm),
            _ => {}
        }

        let unknown = || MIError::Hook(format!("unknown hook point `{s}`"));

        // "blocks.{layer}.{suffix}"
        let rest = s.strip_prefix("blocks.").ok_or_else(unknown)?;
        let (layer_str, suffix) = rest.split_once('.').ok_or_else(unknown)?;
        let layer: usize = layer_str.parse().map_err(|_| unknown())?;
        match suffix {
            "hook_resid_pre" => Ok(Self::ResidPre(layer)),
            "ln1.hook_normalized" => Ok(Self::Ln1Normalized(layer)),
            "attn.hook_attn_scores" => Ok(Self::AttnScores(layer)),
            "attn.hook_pattern" => Ok(Self::AttnPattern(layer)),
            "hook_attn_out" => Ok(Self::AttnOut(layer)),
            "hook_resid_mid" => Ok(Self::ResidMid(layer)),
            "ln2.hook_normalized" => Ok(Self::Ln2Normalized(layer)),
            "mlp.hook_pre" => Ok(Self::MlpPre(layer)),
            "mlp.hook_post" => Ok(Self::MlpPost(layer)),
            "hook_mlp_out" => Ok(Self::MlpOut(layer)),
            "hook_resid_post" => Ok(Self::ResidPost(layer)),
            _ => Err(unknown()),
        }
    }
}

// ---------------------------------------------------------------------------
// ActivationOverride
// ---------------------------------------------------------------------------

/// Strategy invoked with the live activation at one hook point during a
/// forward pass. The returned tensor replaces the activation and the rest
/// of the pass continues from it.
///
/// Overrides are registered per pass through [`HookSpec::intervene`], so
/// two passes never share override state.
pub trait ActivationOverride: fmt::Debug + Send + Sync {
    /// Produce the activation that continues through the forward pass.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Intervention`] if the activation has an
    /// unexpected shape, or [`MIError::Model`] on tensor failures.
    fn mutate(&self, activation: &Tensor) -> Result<Tensor>;
}

/// Replace the activation at a single sequence position with the value
/// from a source tensor of the same shape (typically the clean run's
/// cached activation at the same hook point).
///
/// # Shapes
/// - `source`: `[batch, seq, d_model]`
#[derive(Debug, Clone)]
pub struct PositionPatch {
    /// Sequence position to overwrite.
    pub position: usize,
    /// Tensor holding the replacement values.
    pub source: Tensor,
}

impl PositionPatch {
    /// Patch `position` with the corresponding slice of `source`.
    #[must_use]
    pub const fn new(position: usize, source: Tensor) -> Self {
        Self { position, source }
    }
}

impl ActivationOverride for PositionPatch {
    fn mutate(&self, activation: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, hidden) = activation.dims3()?;
        if self.source.dims() != activation.dims() {
            return Err(MIError::Intervention(format!(
                "patch source shape {:?} does not match activation shape {:?}",
                self.source.dims(),
                activation.dims()
            )));
        }
        if self.position >= seq_len {
            return Err(MIError::Intervention(format!(
                "patch position {} out of range (seq_len={seq_len})",
                self.position
            )));
        }
        let patch = self
            .source
            .narrow(1, self.position, 1)?
            .to_dtype(activation.dtype())?
            .contiguous()?;
        Ok(activation.slice_assign(
            &[0..batch, self.position..self.position + 1, 0..hidden],
            &patch,
        )?)
    }
}

// ---------------------------------------------------------------------------
// Intervention
// ---------------------------------------------------------------------------

/// An intervention to apply at a hook point during the forward pass.
///
/// Interventions modify activations as they flow through the model.
/// They are specified as part of a [`HookSpec`] and applied by the backend
/// at the corresponding [`HookPoint`].
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Intervention {
    /// Zero the tensor at this hook point.
    Zero,

    /// Delegate to a caller-supplied [`ActivationOverride`].
    // TRAIT_OBJECT: overrides are caller-defined strategies
    Override(Arc<dyn ActivationOverride>),
}

impl Intervention {
    /// Patch one sequence position from `source` (see [`PositionPatch`]).
    #[must_use]
    pub fn patch_position(position: usize, source: Tensor) -> Self {
        Self::Override(Arc::new(PositionPatch::new(position, source)))
    }
}

/// Apply a single [`Intervention`] to a tensor.
///
/// # Shapes
/// - `tensor`: any shape, the activation at the hook point.
/// - returns: same shape as `tensor`.
///
/// # Errors
///
/// Returns [`MIError::Model`] if the underlying tensor operation fails and
/// propagates override errors.
pub(crate) fn apply_intervention(tensor: &Tensor, intervention: &Intervention) -> Result<Tensor> {
    match intervention {
        Intervention::Zero => Ok(tensor.zeros_like()?),
        Intervention::Override(strategy) => strategy.mutate(tensor),
    }
}

// ---------------------------------------------------------------------------
// HookSpec
// ---------------------------------------------------------------------------

/// Declares which activations to capture and which interventions to apply.
///
/// Passed to [`MIBackend::forward`](crate::MIBackend::forward). When empty,
/// the forward pass does no extra cloning.
///
/// # Example
///
/// ```
/// use graphcot_mi::{HookPoint, HookSpec};
///
/// let mut hooks = HookSpec::new();
/// hooks.capture(HookPoint::ResidPre(0))
///      .capture(HookPoint::FinalNorm);
/// assert_eq!(hooks.num_captures(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct HookSpec {
    /// Hook points to capture during the forward pass.
    captures: HashSet<HookPoint>,
    /// Interventions to apply, stored as (`hook_point`, intervention) pairs.
    interventions: Vec<(HookPoint, Intervention)>,
}

impl HookSpec {
    /// Create an empty hook specification (no captures, no interventions).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture every hook point of a `num_layers`-layer model.
    #[must_use]
    pub fn capture_all(num_layers: usize) -> Self {
        let mut spec = Self::new();
        for hook in HookPoint::all(num_layers) {
            spec.capture(hook);
        }
        spec
    }

    /// Request capture of the activation at the given hook point.
    pub fn capture(&mut self, hook: HookPoint) -> &mut Self {
        self.captures.insert(hook);
        self
    }

    /// Register an intervention at the given hook point.
    pub fn intervene(&mut self, hook: HookPoint, intervention: Intervention) -> &mut Self {
        self.interventions.push((hook, intervention));
        self
    }

    /// Check whether a specific hook point should be captured.
    #[must_use]
    pub fn is_captured(&self, hook: &HookPoint) -> bool {
        self.captures.contains(hook)
    }

    /// Check whether this spec has no captures and no interventions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.captures.is_empty() && self.interventions.is_empty()
    }

    /// Number of requested captures.
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }

    /// Number of registered interventions.
    #[must_use]
    pub const fn num_interventions(&self) -> usize {
        self.interventions.len()
    }

    /// Iterate over interventions registered at a specific hook point.
    pub fn interventions_at(&self, hook: &HookPoint) -> impl Iterator<Item = &Intervention> {
        self.interventions
            .iter()
            .filter(move |(h, _)| h == hook)
            .map(|(_, intervention)| intervention)
    }

    /// Check whether any intervention targets the given hook point.
    #[must_use]
    pub fn has_intervention_at(&self, hook: &HookPoint) -> bool {
        self.interventions.iter().any(|(h, _)| h == hook)
    }

    /// Capture `tensor` if requested, then run every intervention
    /// registered at `hook` in registration order.
    ///
    /// Backends call this at each hook point of the forward pass.
    ///
    /// # Errors
    ///
    /// Propagates intervention failures.
    pub fn apply(&self, hook: HookPoint, tensor: Tensor, cache: &mut HookCache) -> Result<Tensor> {
        if self.is_captured(&hook) {
            cache.store(hook, tensor.clone());
        }
        let mut tensor = tensor;
        for intervention in self.interventions_at(&hook) {
            tensor = apply_intervention(&tensor, intervention)?;
        }
        Ok(tensor)
    }
}

// ---------------------------------------------------------------------------
// HookCache
// ---------------------------------------------------------------------------

/// Tensors captured while a forward pass runs, plus the output logits.
///
/// Backends fill a `HookCache` and return it from
/// [`MIBackend::forward`](crate::MIBackend::forward);
/// [`MIModel`](crate::MIModel) then freezes it into an immutable
/// [`ActivationCache`](crate::ActivationCache).
#[derive(Debug)]
pub struct HookCache {
    /// Output tensor from the forward pass (logits).
    output: Tensor,
    /// Captured activations keyed by hook point.
    captures: HashMap<HookPoint, Tensor>,
}

impl HookCache {
    /// Create a new cache with the given output tensor and no captures.
    #[must_use]
    pub fn new(output: Tensor) -> Self {
        Self {
            output,
            captures: HashMap::new(),
        }
    }

    /// The output tensor from the forward pass.
    #[must_use]
    pub const fn output(&self) -> &Tensor {
        &self.output
    }

    /// Retrieve a captured tensor by hook point.
    #[must_use]
    pub fn get(&self, hook: &HookPoint) -> Option<&Tensor> {
        self.captures.get(hook)
    }

    /// Store a captured activation. Called by backend implementations.
    pub fn store(&mut self, hook: HookPoint, tensor: Tensor) {
        self.captures.insert(hook, tensor);
    }

    /// Replace the output tensor (e.g., after computing final logits).
    pub fn set_output(&mut self, output: Tensor) {
        self.output = output;
    }

    /// Number of captured tensors (excludes the output).
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }

    /// Split into output and captures.
    pub(crate) fn into_parts(self) -> (Tensor, HashMap<HookPoint, Tensor>) {
        (self.output, self.captures)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn hook_point_display_roundtrip() {
        for hook in HookPoint::all(3) {
            let name = hook.to_string();
            let parsed: HookPoint = name.parse().unwrap();
            assert_eq!(parsed, hook, "FromStr failed for {name:?}");
        }
        assert_eq!(
            HookPoint::FinalNorm.to_string(),
            "ln_final.hook_normalized"
        );
        assert_eq!(
            HookPoint::ResidPre(0).to_string(),
            "blocks.0.hook_resid_pre"
        );
    }

    #[test]
    fn unknown_string_is_an_error() {
        assert!("some.unknown.hook".parse::<HookPoint>().is_err());
        assert!("blocks.x.hook_resid_pre".parse::<HookPoint>().is_err());
        assert!("blocks.2.hook_nothing".parse::<HookPoint>().is_err());
    }

    #[test]
    fn layer_accessor() {
        assert_eq!(HookPoint::ResidMid(4).layer(), Some(4));
        assert_eq!(HookPoint::FinalNorm.layer(), None);
        assert!(HookPoint::ResidPost(1).is_residual_shaped());
        assert!(!HookPoint::AttnPattern(1).is_residual_shaped());
    }

    #[test]
    fn hook_spec_capture_and_query() {
        let mut spec = HookSpec::new();
        assert!(spec.is_empty());

        spec.capture(HookPoint::AttnPattern(1));
        spec.capture(HookPoint::ResidPost(0));

        assert!(!spec.is_empty());
        assert_eq!(spec.num_captures(), 2);
        assert!(spec.is_captured(&HookPoint::AttnPattern(1)));
        assert!(!spec.is_captured(&HookPoint::Embed));

        let all = HookSpec::capture_all(2);
        assert_eq!(all.num_captures(), HookPoint::all(2).len());
    }

    #[test]
    fn hook_spec_intervention_query() {
        let mut spec = HookSpec::new();
        spec.intervene(HookPoint::ResidPre(1), Intervention::Zero);
        spec.intervene(
            HookPoint::ResidPre(1),
            Intervention::patch_position(0, Tensor::zeros((1, 2, 2), DType::F32, &Device::Cpu).unwrap()),
        );
        spec.intervene(HookPoint::ResidPost(0), Intervention::Zero);

        assert_eq!(spec.num_interventions(), 3);
        assert!(spec.has_intervention_at(&HookPoint::ResidPre(1)));
        assert!(!spec.has_intervention_at(&HookPoint::Embed));
        assert_eq!(spec.interventions_at(&HookPoint::ResidPre(1)).count(), 2);
    }

    #[test]
    fn position_patch_replaces_only_one_position() {
        let device = Device::Cpu;
        let live = Tensor::zeros((1, 4, 3), DType::F32, &device).unwrap();
        let source = Tensor::ones((1, 4, 3), DType::F32, &device).unwrap();
        let patch = PositionPatch::new(2, source);

        let out = patch.mutate(&live).unwrap();
        let rows: Vec<Vec<f32>> = out.squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(rows[0], vec![0.0; 3]);
        assert_eq!(rows[1], vec![0.0; 3]);
        assert_eq!(rows[2], vec![1.0; 3]);
        assert_eq!(rows[3], vec![0.0; 3]);
    }

    #[test]
    fn position_patch_rejects_bad_input() {
        let device = Device::Cpu;
        let live = Tensor::zeros((1, 4, 3), DType::F32, &device).unwrap();
        let source = Tensor::ones((1, 4, 3), DType::F32, &device).unwrap();
        assert!(PositionPatch::new(4, source).mutate(&live).is_err());

        let short = Tensor::ones((1, 2, 3), DType::F32, &device).unwrap();
        assert!(PositionPatch::new(0, short).mutate(&live).is_err());
    }

    #[test]
    fn apply_runs_position_patch_override() {
        let device = Device::Cpu;
        let mut spec = HookSpec::new();
        let source = Tensor::ones((1, 3, 2), DType::F32, &device).unwrap();
        spec.intervene(HookPoint::ResidMid(0), Intervention::patch_position(1, source));

        let mut cache = HookCache::new(Tensor::zeros(1, DType::F32, &device).unwrap());
        let x = Tensor::zeros((1, 3, 2), DType::F32, &device).unwrap();
        let out = spec.apply(HookPoint::ResidMid(0), x, &mut cache).unwrap();
        let rows: Vec<Vec<f32>> = out.squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(rows, vec![vec![0.0; 2], vec![1.0; 2], vec![0.0; 2]]);
        assert!(cache.get(&HookPoint::ResidMid(0)).is_none());
    }

    #[test]
    fn apply_captures_before_intervening() {
        let device = Device::Cpu;
        let mut spec = HookSpec::new();
        spec.capture(HookPoint::ResidPre(0))
            .intervene(HookPoint::ResidPre(0), Intervention::Zero);

        let mut cache = HookCache::new(Tensor::zeros(1, DType::F32, &device).unwrap());
        let x = Tensor::ones((1, 2, 2), DType::F32, &device).unwrap();
        let out = spec.apply(HookPoint::ResidPre(0), x, &mut cache).unwrap();

        let captured: f32 = cache
            .get(&HookPoint::ResidPre(0))
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        let after: f32 = out.sum_all().unwrap().to_scalar().unwrap();
        assert!((captured - 4.0).abs() < 1e-6);
        assert!(after.abs() < 1e-6);
    }
}

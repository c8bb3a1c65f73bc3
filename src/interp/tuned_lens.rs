// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tuned-lens calibration.
//!
//! A tuned lens replaces the unembedding at each lens layer with a matrix
//! fitted to predict the next answer token from that layer's normalized
//! residual. Calibration runs in three steps:
//!
//! 1. [`aggregate_activations`] over the lens hook points, keeping only
//!    instances the model answers correctly;
//! 2. [`build_calibration_set`] aligns each answer position's residual
//!    with the token that follows it;
//! 3. [`fit_lenses`] fits one [`LinearProbe`] per hook point.
//!
//! [`calibrate`] chains them with the default [`SoftmaxProbe`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use candle_core::{D, DType, Device, Tensor};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::backend::{MIModel, ModelSignature};
use crate::cache::AggregatedActivations;
use crate::error::{MIError, Result};
use crate::hooks::HookPoint;
use crate::interp::aggregate::{AggregateConfig, SampleBudget, aggregate_activations};
use crate::interp::probe::{LinearProbe, ProbeConfig, SoftmaxProbe};
use crate::task::{CorrectnessOracle, GraphDataset, PathOrder, TaskGenerator, answer_span, prompt_tokens};

pub use crate::interp::logit_lens::lens_hook_points;

// ---------------------------------------------------------------------------
// LensMatrix / TunedLens
// ---------------------------------------------------------------------------

/// One lens layer's decoder.
#[derive(Debug, Clone)]
pub struct LensMatrix {
    /// `[hidden_size, vocab_size]`.
    weight: Tensor,
    /// Training accuracy, when the matrix was fitted.
    accuracy: Option<f32>,
}

impl LensMatrix {
    /// Wrap a `[hidden_size, vocab_size]` matrix.
    #[must_use]
    pub const fn new(weight: Tensor, accuracy: Option<f32>) -> Self {
        Self { weight, accuracy }
    }

    /// The decoder matrix, `[hidden_size, vocab_size]`.
    #[must_use]
    pub const fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Training accuracy recorded at calibration time.
    #[must_use]
    pub const fn accuracy(&self) -> Option<f32> {
        self.accuracy
    }
}

/// Calibrated lens matrices for every lens layer of one model
/// configuration.
#[derive(Debug, Clone)]
pub struct TunedLens {
    /// Matrix per lens hook point.
    matrices: BTreeMap<HookPoint, LensMatrix>,
    /// Configuration the lens was calibrated for.
    signature: ModelSignature,
}

/// JSON sidecar written next to the safetensors file.
#[derive(Debug, Serialize, Deserialize)]
struct LensManifest {
    signature: ModelSignature,
    layers: Vec<ManifestEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestEntry {
    hook: String,
    accuracy: Option<f32>,
}

impl TunedLens {
    /// Create an empty lens for a model configuration.
    #[must_use]
    pub const fn new(signature: ModelSignature) -> Self {
        Self {
            matrices: BTreeMap::new(),
            signature,
        }
    }

    /// Configuration the lens was calibrated for.
    #[must_use]
    pub const fn signature(&self) -> ModelSignature {
        self.signature
    }

    /// Add or replace the matrix for `hook`.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Calibration`] if the matrix is not
    /// `[hidden_size, vocab_size]`.
    pub fn insert(&mut self, hook: HookPoint, matrix: LensMatrix) -> Result<()> {
        let expected = [self.signature.hidden_size, self.signature.vocab_size];
        if matrix.weight.dims() != expected {
            return Err(MIError::Calibration(format!(
                "lens matrix for `{hook}` has shape {:?}, expected {expected:?}",
                matrix.weight.dims()
            )));
        }
        self.matrices.insert(hook, matrix);
        Ok(())
    }

    /// Matrix for `hook`, if calibrated.
    #[must_use]
    pub fn get(&self, hook: &HookPoint) -> Option<&LensMatrix> {
        self.matrices.get(hook)
    }

    /// Matrix for `hook`.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Calibration`] if `hook` was not calibrated.
    pub fn require(&self, hook: &HookPoint) -> Result<&LensMatrix> {
        self.get(hook)
            .ok_or_else(|| MIError::Calibration(format!("no lens matrix for `{hook}`")))
    }

    /// Calibrated hook points in layer order.
    pub fn hook_points(&self) -> impl Iterator<Item = &HookPoint> {
        self.matrices.keys()
    }

    /// Number of calibrated hook points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.matrices.len()
    }

    /// Whether no hook point is calibrated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.matrices.is_empty()
    }

    /// Write the matrices to `path` as safetensors (one tensor per hook
    /// point name) and the signature plus accuracies to `path` with
    /// `.json` appended (`lens.safetensors.json`).
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Model`] if the safetensors write fails and
    /// [`MIError::Io`] / [`MIError::Json`] for the sidecar.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut tensors = std::collections::HashMap::with_capacity(self.matrices.len());
        let mut layers = Vec::with_capacity(self.matrices.len());
        for (hook, matrix) in &self.matrices {
            let name = hook.to_string();
            tensors.insert(name.clone(), matrix.weight.contiguous()?);
            layers.push(ManifestEntry {
                hook: name,
                accuracy: matrix.accuracy,
            });
        }
        candle_core::safetensors::save(&tensors, path)?;

        let manifest = LensManifest {
            signature: self.signature,
            layers,
        };
        std::fs::write(sidecar_path(path), serde_json::to_string_pretty(&manifest)?)?;
        tracing::info!(path = %path.display(), layers = self.len(), "saved tuned lens");
        Ok(())
    }

    /// Read a lens written by [`save`](Self::save).
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Io`] / [`MIError::Json`] if the sidecar is
    /// unreadable, [`MIError::Model`] if the safetensors file is, and
    /// [`MIError::Calibration`] if the two disagree.
    pub fn load(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let manifest: LensManifest =
            serde_json::from_str(&std::fs::read_to_string(sidecar_path(path))?)?;
        let mut tensors = candle_core::safetensors::load(path, device)?;

        let mut lens = Self::new(manifest.signature);
        for entry in manifest.layers {
            let hook: HookPoint = entry.hook.parse()?;
            let weight = tensors.remove(&entry.hook).ok_or_else(|| {
                MIError::Calibration(format!("lens file has no tensor `{}`", entry.hook))
            })?;
            lens.insert(hook, LensMatrix::new(weight, entry.accuracy))?;
        }
        Ok(lens)
    }
}

/// `lens.safetensors` -> `lens.safetensors.json`; never the tensor file
/// itself, whatever its extension.
fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".json");
    PathBuf::from(name)
}

// ---------------------------------------------------------------------------
// CalibrationSet
// ---------------------------------------------------------------------------

/// Residual rows and next-token labels for every lens hook point.
#[derive(Debug, Clone)]
pub struct CalibrationSet {
    /// `[n, hidden_size]` per hook point; row `i` of every hook belongs to
    /// the same answer position.
    rows: BTreeMap<HookPoint, Tensor>,
    /// `[n]`, `U32`.
    labels: Tensor,
}

impl CalibrationSet {
    /// Rows for `hook`.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Calibration`] if `hook` is not in the set.
    pub fn rows(&self, hook: &HookPoint) -> Result<&Tensor> {
        self.rows
            .get(hook)
            .ok_or_else(|| MIError::Calibration(format!("calibration set has no `{hook}`")))
    }

    /// Next-token labels shared by every hook point.
    #[must_use]
    pub const fn labels(&self) -> &Tensor {
        &self.labels
    }

    /// Hook points in the set.
    pub fn hook_points(&self) -> impl Iterator<Item = &HookPoint> {
        self.rows.keys()
    }

    /// Number of labelled rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.dim(0).unwrap_or(0)
    }

    /// Whether the set has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Align each accepted instance's answer positions with their labels.
///
/// For an instance with prompt `tokens` and answer span `start..end`, the
/// labels are `tokens[start..end]` and the rows are the activations at
/// positions `start - 1..end - 1`, the positions whose next token is the
/// label.
///
/// # Errors
///
/// Returns [`MIError::Calibration`] if nothing was accepted,
/// [`MIError::Task`] if an instance has no answer span, and
/// [`MIError::Model`] if an activation is shorter than its prompt.
pub fn build_calibration_set<G: GraphDataset>(
    dataset: &G,
    aggregated: &AggregatedActivations<G::Instance>,
) -> Result<CalibrationSet> {
    if aggregated.is_empty() {
        return Err(MIError::Calibration(
            "no accepted instances to calibrate on".into(),
        ));
    }

    let hooks: Vec<HookPoint> = aggregated.hook_points().copied().collect();
    let mut pieces: Vec<Vec<Tensor>> = vec![Vec::with_capacity(aggregated.len()); hooks.len()];
    let mut labels = Vec::new();

    for (i, instance) in aggregated.instances().iter().enumerate() {
        let tokens = prompt_tokens(dataset, instance)?;
        let span = answer_span(dataset, &tokens)?;
        labels.extend_from_slice(&tokens[span.clone()]);
        for (hook, out) in hooks.iter().zip(pieces.iter_mut()) {
            let acts = aggregated.require(hook)?.get(i).ok_or_else(|| {
                MIError::Calibration(format!("missing `{hook}` activation for instance {i}"))
            })?;
            // acts: [1, seq, hidden] -> [span, hidden]
            out.push(acts.get(0)?.narrow(0, span.start - 1, span.len())?);
        }
    }

    let mut rows = BTreeMap::new();
    for (hook, parts) in hooks.into_iter().zip(pieces) {
        rows.insert(hook, Tensor::cat(&parts, 0)?.to_dtype(DType::F32)?);
    }
    let n = labels.len();
    let labels = Tensor::from_vec(labels, n, &Device::Cpu)?;

    tracing::info!(
        instances = aggregated.len(),
        rows = n,
        hooks = rows.len(),
        "built calibration set"
    );
    Ok(CalibrationSet { rows, labels })
}

/// Next-token accuracy of a `[hidden_size, vocab_size]` decoder.
///
/// # Errors
///
/// Returns [`MIError::Model`] on shape mismatch.
pub fn lens_accuracy(rows: &Tensor, labels: &Tensor, matrix: &Tensor) -> Result<f32> {
    let predicted = rows.matmul(matrix)?.argmax(D::Minus1)?;
    let hits = predicted.eq(&labels.to_dtype(DType::U32)?)?;
    Ok(hits.to_dtype(DType::F32)?.mean_all()?.to_scalar()?)
}

// ---------------------------------------------------------------------------
// Fitting
// ---------------------------------------------------------------------------

/// Fit one probe per hook point and collect the transposed weights.
///
/// # Errors
///
/// Propagates probe failures; returns [`MIError::Calibration`] if a
/// fitted weight does not match `signature`.
pub fn fit_lenses<P, F>(
    set: &CalibrationSet,
    signature: ModelSignature,
    mut make_probe: F,
) -> Result<TunedLens>
where
    P: LinearProbe,
    F: FnMut(HookPoint) -> P,
{
    let mut lens = TunedLens::new(signature);
    for (hook, rows) in &set.rows {
        let mut probe = make_probe(*hook);
        probe.fit(rows, &set.labels)?;
        let accuracy = probe.score(rows, &set.labels)?;
        // probe weights are [vocab, hidden]; the lens stores W^T
        let weight = probe.weight()?.t()?.contiguous()?;
        tracing::info!(hook = %hook, accuracy, rows = set.len(), "fitted lens layer");
        lens.insert(*hook, LensMatrix::new(weight, Some(accuracy)))?;
    }
    Ok(lens)
}

/// Settings of [`calibrate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Sampling of calibration instances.
    pub aggregate: AggregateConfig,
    /// Probe optimization.
    pub probe: ProbeConfig,
    /// Start every probe from the model's unembedding.
    pub warm_start: bool,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            aggregate: AggregateConfig {
                budget: SampleBudget::Attempts(16_384),
                path_length: None,
                order: PathOrder::Random,
            },
            probe: ProbeConfig::default(),
            warm_start: true,
        }
    }
}

/// Calibrate a tuned lens with the default [`SoftmaxProbe`].
///
/// With `warm_start`, each probe starts from `W_U^T` and keeps its best
/// weights, so every tuned layer is at least as accurate on the
/// calibration rows as the native lens.
///
/// # Errors
///
/// See [`calibrate_with`].
pub fn calibrate<G, T, O, R>(
    model: &MIModel,
    dataset: &G,
    generator: &T,
    oracle: &O,
    config: &CalibrationConfig,
    rng: &mut R,
) -> Result<TunedLens>
where
    G: GraphDataset,
    T: TaskGenerator<G::Instance>,
    O: CorrectnessOracle<G>,
    R: Rng,
{
    let initial = if config.warm_start {
        Some(
            model
                .unembedding()?
                .to_dtype(DType::F32)?
                .to_device(&Device::Cpu)?
                .t()?
                .contiguous()?,
        )
    } else {
        None
    };
    let vocab_size = model.vocab_size();
    calibrate_with(
        model,
        dataset,
        generator,
        oracle,
        &config.aggregate,
        rng,
        |_| {
            let probe = SoftmaxProbe::new(vocab_size, config.probe.clone());
            match &initial {
                Some(w) => probe.with_initial_weight(w.clone()),
                None => probe,
            }
        },
    )
}

/// Calibrate a tuned lens with a caller-supplied probe per hook point.
///
/// # Errors
///
/// Propagates aggregation errors, returns [`MIError::Calibration`] if no
/// instance is accepted, and propagates probe failures.
pub fn calibrate_with<G, T, O, R, P, F>(
    model: &MIModel,
    dataset: &G,
    generator: &T,
    oracle: &O,
    aggregate: &AggregateConfig,
    rng: &mut R,
    make_probe: F,
) -> Result<TunedLens>
where
    G: GraphDataset,
    T: TaskGenerator<G::Instance>,
    O: CorrectnessOracle<G>,
    R: Rng,
    P: LinearProbe,
    F: FnMut(HookPoint) -> P,
{
    let hooks = lens_hook_points(model.num_layers());
    let aggregated =
        aggregate_activations(model, dataset, generator, oracle, &hooks, aggregate, rng)?;
    let set = build_calibration_set(dataset, &aggregated)?;
    fit_lenses(&set, model.signature(), make_probe)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::test_util::tiny_model;

    fn signature() -> ModelSignature {
        ModelSignature {
            num_layers: 2,
            hidden_size: 4,
            vocab_size: 3,
        }
    }

    /// Prompts are the instance minus its last token; start marker is 1.
    struct Plain;

    impl GraphDataset for Plain {
        type Instance = Vec<u32>;

        fn n_states(&self) -> usize {
            3
        }
        fn id_to_token(&self, _id: u32) -> Option<&str> {
            None
        }
        fn token_to_id(&self, _token: &str) -> Option<u32> {
            None
        }
        fn start_token(&self) -> u32 {
            1
        }
        fn pad_token(&self) -> u32 {
            0
        }
        fn tokenize(&self, instance: &Vec<u32>) -> Result<Vec<u32>> {
            Ok(instance.clone())
        }
    }

    #[test]
    fn insert_checks_shape() {
        let mut lens = TunedLens::new(signature());
        let good = Tensor::zeros((4, 3), DType::F32, &Device::Cpu).unwrap();
        let bad = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        lens.insert(HookPoint::FinalNorm, LensMatrix::new(good, None))
            .unwrap();
        assert!(matches!(
            lens.insert(HookPoint::Ln1Normalized(1), LensMatrix::new(bad, None)),
            Err(MIError::Calibration(_))
        ));
        assert_eq!(lens.len(), 1);
        assert!(lens.require(&HookPoint::Ln1Normalized(1)).is_err());
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lens.safetensors");

        let mut lens = TunedLens::new(signature());
        let w = Tensor::arange(0_f32, 12.0, &Device::Cpu)
            .unwrap()
            .reshape((4, 3))
            .unwrap();
        lens.insert(HookPoint::Ln1Normalized(1), LensMatrix::new(w.clone(), Some(0.75)))
            .unwrap();
        lens.insert(HookPoint::FinalNorm, LensMatrix::new(w.clone(), None))
            .unwrap();
        lens.save(&path).unwrap();
        assert!(dir.path().join("lens.safetensors.json").exists());

        let loaded = TunedLens::load(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.signature(), signature());
        assert_eq!(loaded.len(), 2);
        let m = loaded.require(&HookPoint::Ln1Normalized(1)).unwrap();
        assert_eq!(m.accuracy(), Some(0.75));
        assert_eq!(
            m.weight().to_vec2::<f32>().unwrap(),
            w.to_vec2::<f32>().unwrap()
        );
        assert_eq!(loaded.require(&HookPoint::FinalNorm).unwrap().accuracy(), None);
    }

    #[test]
    fn json_named_lens_keeps_its_tensors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lens.json");

        let mut lens = TunedLens::new(signature());
        let w = Tensor::ones((4, 3), DType::F32, &Device::Cpu).unwrap();
        lens.insert(HookPoint::FinalNorm, LensMatrix::new(w, Some(0.5)))
            .unwrap();
        lens.save(&path).unwrap();
        assert!(dir.path().join("lens.json.json").exists());

        let loaded = TunedLens::load(&path, &Device::Cpu).unwrap();
        let m = loaded.require(&HookPoint::FinalNorm).unwrap();
        assert_eq!(m.accuracy(), Some(0.5));
        assert_eq!(m.weight().dims(), &[4, 3]);
    }

    #[test]
    fn calibration_rows_align_with_labels() {
        let model = tiny_model(2, 5);
        let hooks = lens_hook_points(2);
        let mut agg = AggregatedActivations::new(&hooks);
        // Prompt [4, 1, 2, 3, 5]: span 3..5, labels [3, 5], rows at 2..4.
        let instance = vec![4, 1, 2, 3, 5, 6];
        let prompt = prompt_tokens(&Plain, &instance).unwrap();
        let cache = model.run_with_cache(&prompt, &hooks).unwrap();
        agg.push(instance, &cache).unwrap();

        let set = build_calibration_set(&Plain, &agg).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.labels().to_vec1::<u32>().unwrap(), vec![3, 5]);

        let rows = set.rows(&HookPoint::FinalNorm).unwrap();
        let expected = cache
            .require(&HookPoint::FinalNorm)
            .unwrap()
            .get(0)
            .unwrap()
            .narrow(0, 2, 2)
            .unwrap();
        assert_eq!(
            rows.to_vec2::<f32>().unwrap(),
            expected.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn empty_aggregate_is_a_calibration_error() {
        let agg: AggregatedActivations<Vec<u32>> =
            AggregatedActivations::new(&[HookPoint::FinalNorm]);
        assert!(matches!(
            build_calibration_set(&Plain, &agg),
            Err(MIError::Calibration(_))
        ));
    }

    #[test]
    fn lens_accuracy_counts_hits() {
        let rows = Tensor::new(&[[1.0_f32, 0.0], [0.0, 1.0]], &Device::Cpu).unwrap();
        let identity = Tensor::new(&[[1.0_f32, 0.0], [0.0, 1.0]], &Device::Cpu).unwrap();
        let labels = Tensor::new(&[0_u32, 0], &Device::Cpu).unwrap();
        let acc = lens_accuracy(&rows, &labels, &identity).unwrap();
        assert!((acc - 0.5).abs() < 1e-6);
    }

    #[test]
    fn default_config_samples_randomly() {
        let cfg = CalibrationConfig::default();
        assert_eq!(cfg.aggregate.budget, SampleBudget::Attempts(16_384));
        assert_eq!(cfg.aggregate.order, PathOrder::Random);
        assert!(cfg.warm_start);
    }
}

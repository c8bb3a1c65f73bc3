// SPDX-License-Identifier: MIT OR Apache-2.0

//! Linear classification probes over residual-stream activations.
//!
//! [`LinearProbe`] is the interface the tuned-lens calibrator fits once
//! per lens layer. [`SoftmaxProbe`] is a multinomial logistic regression
//! without intercept, trained with `AdamW` on mini-batches.

use candle_core::{DType, Tensor, Var};
use candle_nn::{Optimizer, ParamsAdamW};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::{MIError, Result};

// ---------------------------------------------------------------------------
// LinearProbe
// ---------------------------------------------------------------------------

/// A linear classifier `argmax(W x)` fitted on labelled activations.
pub trait LinearProbe {
    /// Fit on `rows` with integer class `labels`.
    ///
    /// # Shapes
    /// - `rows`: `[n, d_model]`, `F32`
    /// - `labels`: `[n]`, `U32`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Calibration`] on empty or mismatched data and
    /// [`MIError::Model`] on tensor failures.
    fn fit(&mut self, rows: &Tensor, labels: &Tensor) -> Result<()>;

    /// Classification accuracy on `rows`.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Calibration`] if the probe has not been fitted.
    fn score(&self, rows: &Tensor, labels: &Tensor) -> Result<f32>;

    /// Fitted weight matrix.
    ///
    /// # Shapes
    /// - returns: `[n_classes, d_model]`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Calibration`] if the probe has not been fitted.
    fn weight(&self) -> Result<Tensor>;
}

/// Accuracy of `rows @ weight^T` against `labels`.
///
/// # Shapes
/// - `rows`: `[n, d_model]`
/// - `weight`: `[n_classes, d_model]`
/// - `labels`: `[n]`
///
/// # Errors
///
/// Returns [`MIError::Model`] on shape or tensor failures.
pub fn classifier_accuracy(rows: &Tensor, weight: &Tensor, labels: &Tensor) -> Result<f32> {
    let predicted = rows
        .matmul(&weight.t()?)?
        .argmax(candle_core::D::Minus1)?;
    let hits = predicted.eq(&labels.to_dtype(DType::U32)?)?;
    Ok(hits.to_dtype(DType::F32)?.mean_all()?.to_scalar()?)
}

// ---------------------------------------------------------------------------
// ProbeConfig
// ---------------------------------------------------------------------------

/// Optimization settings for [`SoftmaxProbe`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Passes over the training rows.
    pub epochs: usize,
    /// `AdamW` learning rate.
    pub learning_rate: f64,
    /// `AdamW` weight decay.
    pub weight_decay: f64,
    /// Rows per optimizer step.
    pub batch_size: usize,
    /// Seed of the per-epoch shuffle.
    pub seed: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            epochs: 30,
            learning_rate: 1e-2,
            weight_decay: 0.0,
            batch_size: 512,
            seed: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// SoftmaxProbe
// ---------------------------------------------------------------------------

/// No-intercept multinomial logistic regression.
///
/// Training keeps the weights with the best training accuracy seen over
/// all epochs, including the starting point. Starting from a known
/// decoder ([`with_initial_weight`](Self::with_initial_weight)) therefore
/// never yields a probe less accurate than that decoder on the training
/// rows.
#[derive(Debug, Clone)]
pub struct SoftmaxProbe {
    /// Number of classes (vocabulary size).
    n_classes: usize,
    /// Optimization settings.
    config: ProbeConfig,
    /// Starting weights, `[n_classes, d_model]`; zeros when absent.
    initial: Option<Tensor>,
    /// Fitted weights, `[n_classes, d_model]`.
    weight: Option<Tensor>,
    /// Training accuracy of the fitted weights.
    train_accuracy: Option<f32>,
}

impl SoftmaxProbe {
    /// Create an unfitted probe over `n_classes` classes.
    #[must_use]
    pub const fn new(n_classes: usize, config: ProbeConfig) -> Self {
        Self {
            n_classes,
            config,
            initial: None,
            weight: None,
            train_accuracy: None,
        }
    }

    /// Start optimization from `weight` (`[n_classes, d_model]`).
    #[must_use]
    pub fn with_initial_weight(mut self, weight: Tensor) -> Self {
        self.initial = Some(weight);
        self
    }

    /// Training accuracy of the kept weights, once fitted.
    #[must_use]
    pub const fn train_accuracy(&self) -> Option<f32> {
        self.train_accuracy
    }

    /// Validate training data and return `(n, d_model)`.
    fn check_data(&self, rows: &Tensor, labels: &Tensor) -> Result<(usize, usize)> {
        let (n, d) = rows.dims2()?;
        if n == 0 {
            return Err(MIError::Calibration("no training rows".into()));
        }
        if labels.dims() != [n] {
            return Err(MIError::Calibration(format!(
                "labels shape {:?} does not match {n} rows",
                labels.dims()
            )));
        }
        let max_label = labels.max_all()?.to_dtype(DType::U32)?.to_scalar::<u32>()?;
        if usize::try_from(max_label).map_or(true, |l| l >= self.n_classes) {
            return Err(MIError::Calibration(format!(
                "label {max_label} out of range ({} classes)",
                self.n_classes
            )));
        }
        Ok((n, d))
    }
}

impl LinearProbe for SoftmaxProbe {
    fn fit(&mut self, rows: &Tensor, labels: &Tensor) -> Result<()> {
        let (n, d) = self.check_data(rows, labels)?;
        let device = rows.device();
        let rows = rows.to_dtype(DType::F32)?;
        let labels = labels.to_dtype(DType::U32)?;

        let init = match &self.initial {
            Some(w) if w.dims() == [self.n_classes, d] => w.to_dtype(DType::F32)?.to_device(device)?,
            Some(w) => {
                return Err(MIError::Calibration(format!(
                    "initial weight shape {:?}, expected [{}, {d}]",
                    w.dims(),
                    self.n_classes
                )));
            }
            None => Tensor::zeros((self.n_classes, d), DType::F32, device)?,
        };

        let mut best_accuracy = classifier_accuracy(&rows, &init, &labels)?;
        let mut best = init.clone();
        tracing::trace!(accuracy = best_accuracy, "probe starting accuracy");

        let var = Var::from_tensor(&init)?;
        let mut optimizer = candle_nn::AdamW::new(
            vec![var.clone()],
            ParamsAdamW {
                lr: self.config.learning_rate,
                weight_decay: self.config.weight_decay,
                ..Default::default()
            },
        )?;

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut order: Vec<u32> = (0..n).filter_map(|i| u32::try_from(i).ok()).collect();
        let batch_size = self.config.batch_size.max(1);

        for epoch in 0..self.config.epochs {
            order.shuffle(&mut rng);
            for batch in order.chunks(batch_size) {
                let idx = Tensor::new(batch, device)?;
                let xb = rows.index_select(&idx, 0)?;
                let yb = labels.index_select(&idx, 0)?;
                let logits = xb.matmul(&var.as_tensor().t()?)?;
                let loss = candle_nn::loss::cross_entropy(&logits, &yb)?;
                optimizer.backward_step(&loss)?;
            }

            let current = var.as_tensor().detach();
            let accuracy = classifier_accuracy(&rows, &current, &labels)?;
            tracing::trace!(epoch, accuracy, "probe epoch");
            if accuracy > best_accuracy {
                best_accuracy = accuracy;
                best = current.copy()?;
            }
        }

        self.weight = Some(best);
        self.train_accuracy = Some(best_accuracy);
        Ok(())
    }

    fn score(&self, rows: &Tensor, labels: &Tensor) -> Result<f32> {
        let weight = self.weight()?;
        classifier_accuracy(&rows.to_dtype(DType::F32)?, &weight, labels)
    }

    fn weight(&self) -> Result<Tensor> {
        self.weight
            .clone()
            .ok_or_else(|| MIError::Calibration("probe has not been fitted".into()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use candle_core::Device;

    /// Two well-separated clusters: class 0 along +x, class 2 along +y.
    fn separable() -> (Tensor, Tensor) {
        let device = Device::Cpu;
        let rows = Tensor::new(
            &[
                [1.0_f32, 0.1],
                [0.9, -0.1],
                [1.1, 0.0],
                [0.0, 1.0],
                [0.1, 0.9],
                [-0.1, 1.1],
            ],
            &device,
        )
        .unwrap();
        let labels = Tensor::new(&[0_u32, 0, 0, 2, 2, 2], &device).unwrap();
        (rows, labels)
    }

    fn config() -> ProbeConfig {
        ProbeConfig {
            epochs: 50,
            learning_rate: 0.1,
            batch_size: 4,
            ..ProbeConfig::default()
        }
    }

    #[test]
    fn fits_separable_data() {
        let (rows, labels) = separable();
        let mut probe = SoftmaxProbe::new(3, config());
        assert!(probe.weight().is_err());
        probe.fit(&rows, &labels).unwrap();
        assert_eq!(probe.weight().unwrap().dims(), &[3, 2]);
        assert!((probe.score(&rows, &labels).unwrap() - 1.0).abs() < 1e-6);
        assert_eq!(probe.train_accuracy(), Some(1.0));
    }

    #[test]
    fn never_worse_than_warm_start() {
        let (rows, labels) = separable();
        // Already perfect: class 0 reads x, class 2 reads y.
        let perfect = Tensor::new(&[[1.0_f32, 0.0], [-1.0, -1.0], [0.0, 1.0]], &Device::Cpu).unwrap();
        let start = classifier_accuracy(&rows, &perfect, &labels).unwrap();
        let mut probe = SoftmaxProbe::new(3, ProbeConfig { epochs: 3, ..config() })
            .with_initial_weight(perfect);
        probe.fit(&rows, &labels).unwrap();
        assert!(probe.score(&rows, &labels).unwrap() >= start);
    }

    #[test]
    fn rejects_bad_data() {
        let (rows, labels) = separable();
        let mut probe = SoftmaxProbe::new(2, config());
        assert!(matches!(probe.fit(&rows, &labels), Err(MIError::Calibration(_))));

        let mut probe = SoftmaxProbe::new(3, config());
        let short = labels.narrow(0, 0, 4).unwrap();
        assert!(probe.fit(&rows, &short).is_err());

        let wrong = Tensor::zeros((3, 5), DType::F32, &Device::Cpu).unwrap();
        let mut probe = SoftmaxProbe::new(3, config()).with_initial_weight(wrong);
        assert!(probe.fit(&rows, &labels).is_err());
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let cfg: ProbeConfig = serde_json::from_str(r#"{"epochs": 5}"#).unwrap();
        assert_eq!(cfg.epochs, 5);
        assert_eq!(cfg.batch_size, ProbeConfig::default().batch_size);
    }
}

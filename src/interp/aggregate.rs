// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sample task instances, keep the ones the model solves, and collect
//! their activations on the host.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::backend::MIModel;
use crate::cache::AggregatedActivations;
use crate::error::Result;
use crate::hooks::HookPoint;
use crate::task::{CorrectnessOracle, GraphDataset, PathOrder, TaskGenerator, TaskSpec, prompt_tokens};

/// Inclusive lower bound of generated instance seeds.
const SEED_MIN: u64 = 1_000_000;
/// Exclusive upper bound of generated instance seeds (`i32::MAX`).
const SEED_MAX: u64 = 2_147_483_647;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// When sampling stops.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleBudget {
    /// Generate exactly this many instances; the number accepted varies
    /// with model accuracy.
    Attempts(usize),
    /// Generate until `target` instances are accepted or `max_attempts`
    /// have been generated, whichever comes first.
    Accepted {
        /// Accepted instances wanted.
        target: usize,
        /// Hard cap on generated instances.
        max_attempts: usize,
    },
}

impl SampleBudget {
    /// Whether sampling is finished after `attempts` generated and
    /// `accepted` kept.
    #[must_use]
    pub const fn is_exhausted(&self, attempts: usize, accepted: usize) -> bool {
        match *self {
            Self::Attempts(n) => attempts >= n,
            Self::Accepted {
                target,
                max_attempts,
            } => accepted >= target || attempts >= max_attempts,
        }
    }
}

impl Default for SampleBudget {
    fn default() -> Self {
        Self::Attempts(1024)
    }
}

/// Settings of one aggregation run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateConfig {
    /// Stopping rule.
    pub budget: SampleBudget,
    /// Path length passed to the generator (`None` lets it choose).
    pub path_length: Option<usize>,
    /// Traversal order passed to the generator.
    pub order: PathOrder,
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Generate instances, discard those `oracle` rejects, and store the
/// activations at `hooks` for the rest.
///
/// Every instance gets a fresh seed drawn from `rng` in
/// `[1_000_000, i32::MAX)`. Captured tensors are detached and moved to the
/// CPU before the next instance runs.
///
/// # Errors
///
/// Propagates generator, oracle, tokenization and model errors. Rejected
/// instances are counted, not reported as errors.
pub fn aggregate_activations<G, T, O, R>(
    model: &MIModel,
    dataset: &G,
    generator: &T,
    oracle: &O,
    hooks: &[HookPoint],
    config: &AggregateConfig,
    rng: &mut R,
) -> Result<AggregatedActivations<G::Instance>>
where
    G: GraphDataset,
    T: TaskGenerator<G::Instance>,
    O: CorrectnessOracle<G>,
    R: Rng,
{
    let spec = TaskSpec {
        n_states: dataset.n_states(),
        path_length: config.path_length,
        order: config.order,
    };
    let mut aggregated = AggregatedActivations::new(hooks);

    while !config
        .budget
        .is_exhausted(aggregated.attempts(), aggregated.len())
    {
        let seed = rng.gen_range(SEED_MIN..SEED_MAX);
        let instance = generator.generate(&spec, seed)?;

        if !oracle.is_correct(model, dataset, &instance)? {
            tracing::trace!(seed, "rejected incorrectly answered instance");
            aggregated.record_rejection();
            continue;
        }

        let tokens = prompt_tokens(dataset, &instance)?;
        let cache = model.run_with_cache(&tokens, hooks)?;
        aggregated.push(instance, &cache)?;
    }

    tracing::info!(
        accepted = aggregated.len(),
        rejected = aggregated.rejected(),
        attempts = aggregated.attempts(),
        "aggregated activations"
    );
    if let SampleBudget::Accepted { target, .. } = config.budget {
        if aggregated.len() < target {
            tracing::warn!(
                accepted = aggregated.len(),
                target,
                "attempt cap reached before the accepted target"
            );
        }
    }

    Ok(aggregated)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::MIError;
    use crate::test_util::tiny_model;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    /// Instances are seeds; tokens are `[1, seed % 5 + 2, 3]`.
    struct SeedDataset;

    impl GraphDataset for SeedDataset {
        type Instance = u64;

        fn n_states(&self) -> usize {
            4
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
        fn tokenize(&self, seed: &u64) -> Result<Vec<u32>> {
            let mid = u32::try_from(seed % 5).unwrap() + 2;
            Ok(vec![1, mid, 3, 0])
        }
    }

    struct SeedGenerator;

    impl TaskGenerator<u64> for SeedGenerator {
        fn generate(&self, spec: &TaskSpec, seed: u64) -> Result<u64> {
            assert_eq!(spec.n_states, 4);
            Ok(seed)
        }
        fn extract_adjacency(&self, _instance: &u64) -> Result<Vec<Vec<bool>>> {
            Err(MIError::Task("no graph".into()))
        }
    }

    /// Accepts even seeds only.
    struct EvenOracle;

    impl CorrectnessOracle<SeedDataset> for EvenOracle {
        fn is_correct(&self, _model: &MIModel, _dataset: &SeedDataset, seed: &u64) -> Result<bool> {
            Ok(seed % 2 == 0)
        }
    }

    #[test]
    fn budget_rules() {
        assert!(SampleBudget::Attempts(3).is_exhausted(3, 0));
        assert!(!SampleBudget::Attempts(3).is_exhausted(2, 2));
        let accepted = SampleBudget::Accepted {
            target: 2,
            max_attempts: 10,
        };
        assert!(accepted.is_exhausted(4, 2));
        assert!(accepted.is_exhausted(10, 1));
        assert!(!accepted.is_exhausted(9, 1));
    }

    #[test]
    fn attempts_budget_filters_rejected() {
        let model = tiny_model(2, 31);
        let config = AggregateConfig {
            budget: SampleBudget::Attempts(12),
            ..AggregateConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(7);
        let hooks = [HookPoint::ResidPre(1)];
        let agg = aggregate_activations(
            &model,
            &SeedDataset,
            &SeedGenerator,
            &EvenOracle,
            &hooks,
            &config,
            &mut rng,
        )
        .unwrap();

        assert_eq!(agg.attempts(), 12);
        assert_eq!(agg.len() + agg.rejected(), 12);
        assert!(agg.instances().iter().all(|s| s % 2 == 0));
        assert!(agg.instances().iter().all(|s| (SEED_MIN..SEED_MAX).contains(s)));
        let acts = agg.require(&HookPoint::ResidPre(1)).unwrap();
        assert_eq!(acts.len(), agg.len());
        assert!(acts.iter().all(|t| t.dims() == [1, 3, model.hidden_size()]));
    }

    #[test]
    fn accepted_budget_reaches_target() {
        let model = tiny_model(2, 31);
        let config = AggregateConfig {
            budget: SampleBudget::Accepted {
                target: 3,
                max_attempts: 200,
            },
            ..AggregateConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(8);
        let agg = aggregate_activations(
            &model,
            &SeedDataset,
            &SeedGenerator,
            &EvenOracle,
            &[HookPoint::FinalNorm],
            &config,
            &mut rng,
        )
        .unwrap();
        assert_eq!(agg.len(), 3);
    }

    #[test]
    fn config_deserializes_budget() {
        let config: AggregateConfig = serde_json::from_str(
            r#"{"budget": {"accepted": {"target": 5, "max_attempts": 50}}, "order": "random"}"#,
        )
        .unwrap();
        assert_eq!(
            config.budget,
            SampleBudget::Accepted {
                target: 5,
                max_attempts: 50
            }
        );
        assert_eq!(config.order, PathOrder::Random);
        assert_eq!(config.path_length, None);
    }
}

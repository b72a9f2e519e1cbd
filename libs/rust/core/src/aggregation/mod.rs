//! Aggregation strategies.
//!
//! Strategies work in delta space: they receive the current global layers
//! plus either the opened weighted sum of all deltas or each client's delta,
//! and return the next global layers.

mod fedavg;
mod feddyn;
mod fedma;
mod fedprox;
mod scaffold;

pub use fedavg::FedAvg;
pub use feddyn::FedDyn;
pub use fedma::FedMa;
pub use fedprox::FedProx;
pub use scaffold::{ControlVariates, Scaffold};

use tracing::debug;

use crate::config::{AggregationConfig, AggregationKind};
use crate::error::{FedResult, FederationError};
use crate::model::ClientId;
use crate::tensor::{apply_delta, check_shapes, Tensor};

#[derive(Debug, Clone)]
pub struct Contribution {
    pub client_id: ClientId,
    pub sample_count: u64,
    pub delta: Vec<Tensor>,
}

/// Opened `Σ nᵢ·δᵢ` together with `Σ nᵢ`, where `nᵢ` is each contributor's
/// sample count.
#[derive(Debug, Clone)]
pub struct WeightedSum {
    pub delta_sum: Vec<Tensor>,
    pub total_weight: u64,
    pub contributors: Vec<ClientId>,
}

#[derive(Debug, Clone)]
pub enum AggregationInput {
    Summed(WeightedSum),
    Individual(Vec<Contribution>),
}

impl AggregationInput {
    pub fn contributors(&self) -> Vec<ClientId> {
        match self {
            AggregationInput::Summed(s) => s.contributors.clone(),
            AggregationInput::Individual(cs) => cs.iter().map(|c| c.client_id.clone()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            AggregationInput::Summed(s) => s.contributors.is_empty(),
            AggregationInput::Individual(cs) => cs.is_empty(),
        }
    }

    /// Sample-weighted mean delta.
    pub fn weighted_mean_delta(&self) -> FedResult<Vec<Tensor>> {
        match self {
            AggregationInput::Summed(s) => {
                if s.total_weight == 0 {
                    return Err(FederationError::AggregationFailure("total weight is zero".into()));
                }
                let inv = 1.0 / s.total_weight as f32;
                Ok(s.delta_sum.iter().map(|t| {
                    let mut t = t.clone();
                    t.scale(inv);
                    t
                }).collect())
            }
            AggregationInput::Individual(cs) => {
                let first = cs.first().ok_or_else(|| FederationError::AggregationFailure("no contributions".into()))?;
                let weights = sample_weights(&cs.iter().map(|c| c.sample_count).collect::<Vec<_>>())?;
                let mut acc: Vec<Tensor> = first.delta.iter().map(Tensor::zeros_like).collect();
                for (c, w) in cs.iter().zip(weights) {
                    check_shapes(&acc, &c.delta).map_err(|e| FederationError::AggregationFailure(e.to_string()))?;
                    for (a, d) in acc.iter_mut().zip(&c.delta) {
                        a.add_scaled(d, w as f32);
                    }
                }
                Ok(acc)
            }
        }
    }

    pub(crate) fn individual(&self, strategy: &str) -> FedResult<&[Contribution]> {
        match self {
            AggregationInput::Individual(cs) if !cs.is_empty() => Ok(cs),
            AggregationInput::Individual(_) => Err(FederationError::AggregationFailure("no contributions".into())),
            AggregationInput::Summed(_) => Err(FederationError::AggregationFailure(format!("{strategy} needs individual contributions"))),
        }
    }
}

/// Fractions of the cohort's total sample count; they sum to 1.
pub fn sample_weights(counts: &[u64]) -> FedResult<Vec<f64>> {
    let total: u64 = counts.iter().sum();
    if total == 0 {
        return Err(FederationError::AggregationFailure("total sample count is zero".into()));
    }
    Ok(counts.iter().map(|c| *c as f64 / total as f64).collect())
}

/// `global + delta`, with shape mismatches reported as aggregation failures.
pub(crate) fn apply(global: &[Tensor], delta: &[Tensor]) -> FedResult<Vec<Tensor>> {
    apply_delta(global, delta).map_err(|e| FederationError::AggregationFailure(e.to_string()))
}

/// Server-side state a stateful strategy carries from one round to the next.
#[derive(Debug, Clone)]
pub enum StrategyState {
    FedDyn(Vec<Tensor>),
    Scaffold(ControlVariates),
}

/// Result of one aggregation. `staged` holds the strategy's next state; it
/// only takes effect once passed back through [`AggregationEngine::commit`].
#[derive(Debug, Clone)]
pub struct Aggregate {
    pub layers: Vec<Tensor>,
    pub staged: Option<StrategyState>,
}

impl Aggregate {
    pub fn stateless(layers: Vec<Tensor>) -> Self {
        Self { layers, staged: None }
    }
}

pub trait AggregationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the strategy needs each client's delta opened separately.
    fn requires_individual(&self) -> bool {
        false
    }

    /// Computes the next global layers. Must not mutate strategy state.
    fn aggregate(&self, global: &[Tensor], input: &AggregationInput) -> FedResult<Aggregate>;

    /// Installs state staged by an earlier `aggregate` call.
    fn commit(&self, _state: StrategyState) {}
}

pub struct AggregationEngine {
    strategy: Box<dyn AggregationStrategy>,
}

impl AggregationEngine {
    pub fn new(strategy: Box<dyn AggregationStrategy>) -> Self {
        Self { strategy }
    }

    pub fn from_config(cfg: &AggregationConfig) -> Self {
        let strategy: Box<dyn AggregationStrategy> = match cfg.strategy {
            AggregationKind::FedAvg => Box::new(FedAvg),
            AggregationKind::FedProx => Box::new(FedProx::new(cfg.fedprox_mu)),
            AggregationKind::FedMa => Box::new(FedMa::new(cfg.fedma_threshold, cfg.fedma_layers.clone())),
            AggregationKind::FedDyn => Box::new(FedDyn::new(cfg.feddyn_alpha)),
            AggregationKind::Scaffold => Box::new(Scaffold::new(cfg.scaffold_lr)),
        };
        Self::new(strategy)
    }

    pub fn name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn requires_individual(&self) -> bool {
        self.strategy.requires_individual()
    }

    /// Runs the strategy and validates its output. Strategy state is left
    /// untouched; pass `staged` to [`commit`](Self::commit) once the round is
    /// known to complete.
    pub fn aggregate(&self, global: &[Tensor], input: &AggregationInput) -> FedResult<Aggregate> {
        if input.is_empty() {
            return Err(FederationError::AggregationFailure("no accepted updates".into()));
        }
        let next = self.strategy.aggregate(global, input)?;
        check_shapes(global, &next.layers).map_err(|e| FederationError::AggregationFailure(format!("{} changed layer shapes: {e}", self.name())))?;
        if !next.layers.iter().all(Tensor::is_finite) {
            return Err(FederationError::AggregationFailure(format!("{} produced non-finite values", self.name())));
        }
        debug!(strategy = self.name(), contributors = input.contributors().len(), "aggregation_applied");
        Ok(next)
    }

    pub fn commit(&self, staged: Option<StrategyState>) {
        if let Some(state) = staged {
            self.strategy.commit(state);
            debug!(strategy = self.name(), "strategy_state_committed");
        }
    }
}

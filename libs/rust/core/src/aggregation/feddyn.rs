use parking_lot::Mutex;

use tracing::debug;

use super::{apply, Aggregate, AggregationInput, AggregationStrategy, StrategyState};
use crate::error::FedResult;
use crate::tensor::{shapes_of, Tensor};

/// Dynamic regularisation. Keeps a server state `h` that accumulates the
/// model drift of every round and is subtracted from the averaged model.
pub struct FedDyn {
    alpha: f32,
    h: Mutex<Option<Vec<Tensor>>>,
}

impl FedDyn {
    pub fn new(alpha: f32) -> Self {
        Self { alpha, h: Mutex::new(None) }
    }

    pub fn server_state(&self) -> Option<Vec<Tensor>> {
        self.h.lock().clone()
    }
}

impl AggregationStrategy for FedDyn {
    fn name(&self) -> &'static str {
        "fed_dyn"
    }

    fn aggregate(&self, global: &[Tensor], input: &AggregationInput) -> FedResult<Aggregate> {
        let averaged = apply(global, &input.weighted_mean_delta()?)?;
        let h = match self.h.lock().as_ref() {
            Some(h) if shapes_of(h) == shapes_of(global) => h.clone(),
            _ => global.iter().map(Tensor::zeros_like).collect(),
        };
        let next: Vec<Tensor> = averaged
            .iter()
            .zip(&h)
            .map(|(a, h)| {
                let mut t = a.clone();
                t.add_scaled(h, -self.alpha);
                t
            })
            .collect();
        let updated = h.iter().zip(next.iter().zip(global)).map(|(h, (n, g))| h.add(&n.sub(g))).collect();
        Ok(Aggregate { layers: next, staged: Some(StrategyState::FedDyn(updated)) })
    }

    fn commit(&self, state: StrategyState) {
        match state {
            StrategyState::FedDyn(h) => *self.h.lock() = Some(h),
            StrategyState::Scaffold(_) => debug!("fed_dyn_ignored_foreign_state"),
        }
    }
}

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use super::{apply, Aggregate, AggregationInput, AggregationStrategy, StrategyState};
use crate::error::{FedResult, FederationError};
use crate::model::ClientId;
use crate::tensor::{check_shapes, shapes_of, Tensor};

/// Server variate `c` plus the per-client variates `cᵢ`.
#[derive(Debug, Clone, Default)]
pub struct ControlVariates {
    server: Vec<Tensor>,
    clients: HashMap<ClientId, Vec<Tensor>>,
}

/// Stochastic controlled averaging.
///
/// The server keeps a control variate `c` and one `cᵢ` per client it has
/// heard from. The step is `lr·(mean δᵢ − mean(cᵢ − c))`; afterwards each
/// participant's variate becomes `δᵢ − step` and `c` moves by the mean
/// change over all known clients.
pub struct Scaffold {
    lr: f32,
    state: Mutex<ControlVariates>,
}

impl Scaffold {
    pub fn new(lr: f32) -> Self {
        Self { lr, state: Mutex::new(ControlVariates::default()) }
    }

    pub fn server_variate(&self) -> Vec<Tensor> {
        self.state.lock().server.clone()
    }

    pub fn client_variate(&self, client: &str) -> Option<Vec<Tensor>> {
        self.state.lock().clients.get(client).cloned()
    }
}

fn zeros(like: &[Tensor]) -> Vec<Tensor> {
    like.iter().map(Tensor::zeros_like).collect()
}

impl AggregationStrategy for Scaffold {
    fn name(&self) -> &'static str {
        "scaffold"
    }

    fn requires_individual(&self) -> bool {
        true
    }

    fn aggregate(&self, global: &[Tensor], input: &AggregationInput) -> FedResult<Aggregate> {
        let contributions = input.individual(self.name())?;
        let mut state = self.state.lock().clone();
        if shapes_of(&state.server) != shapes_of(global) {
            state.server = zeros(global);
            state.clients.clear();
        }

        let inv = 1.0 / contributions.len() as f32;
        let mut step = zeros(global);
        for c in contributions {
            check_shapes(global, &c.delta).map_err(|e| FederationError::AggregationFailure(e.to_string()))?;
            let own = state.clients.get(&c.client_id);
            for (i, s) in step.iter_mut().enumerate() {
                s.add_scaled(&c.delta[i], inv);
                if let Some(own) = own {
                    s.add_scaled(&own[i], -inv);
                }
                s.add_scaled(&state.server[i], inv);
            }
        }
        for s in &mut step {
            s.scale(self.lr);
        }
        let next = apply(global, &step)?;

        let mut drift = zeros(global);
        for c in contributions {
            let fresh: Vec<Tensor> = c.delta.iter().zip(&step).map(|(d, s)| d.sub(s)).collect();
            match state.clients.get(&c.client_id) {
                Some(old) => drift.iter_mut().zip(fresh.iter().zip(old)).for_each(|(acc, (n, o))| acc.add_scaled(&n.sub(o), 1.0)),
                None => drift.iter_mut().zip(&fresh).for_each(|(acc, n)| acc.add_scaled(n, 1.0)),
            }
            state.clients.insert(c.client_id.clone(), fresh);
        }
        let known = state.clients.len().max(1) as f32;
        for (c, d) in state.server.iter_mut().zip(&drift) {
            c.add_scaled(d, 1.0 / known);
        }
        Ok(Aggregate { layers: next, staged: Some(StrategyState::Scaffold(state)) })
    }

    fn commit(&self, state: StrategyState) {
        match state {
            StrategyState::Scaffold(variates) => *self.state.lock() = variates,
            StrategyState::FedDyn(_) => debug!("scaffold_ignored_foreign_state"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::testutil::*;
    use crate::aggregation::WeightedSum;

    fn step(s: &Scaffold, global: &[Tensor], input: &AggregationInput) -> Vec<Tensor> {
        let out = s.aggregate(global, input).unwrap();
        if let Some(state) = out.staged {
            s.commit(state);
        }
        out.layers
    }

    #[test]
    fn first_round_takes_mean_delta() {
        let s = Scaffold::new(1.0);
        let global = vec![Tensor::vector(vec![0.0])];
        let input = AggregationInput::Individual(vec![contribution("a", 1, vec![vec![1.0]]), contribution("b", 100, vec![vec![3.0]])]);
        let next = step(&s, &global, &input);
        assert!(close(&next[0].data, &[2.0]));
        assert!(close(&s.client_variate("a").unwrap()[0].data, &[-1.0]));
        assert!(close(&s.client_variate("b").unwrap()[0].data, &[1.0]));
        assert!(close(&s.server_variate()[0].data, &[0.0]));
    }

    #[test]
    fn variates_correct_for_client_drift() {
        let s = Scaffold::new(1.0);
        let global = vec![Tensor::vector(vec![0.0])];
        let both = AggregationInput::Individual(vec![contribution("a", 1, vec![vec![1.0]]), contribution("b", 1, vec![vec![3.0]])]);
        let g1 = step(&s, &global, &both);
        // a alone drifts low; its variate of -1 pulls the step back up to 2.
        let only_a = AggregationInput::Individual(vec![contribution("a", 1, vec![vec![1.0]])]);
        let g2 = step(&s, &g1, &only_a);
        assert!(close(&g2[0].data, &[4.0]));
        assert!(close(&s.client_variate("a").unwrap()[0].data, &[-1.0]));
    }

    #[test]
    fn learning_rate_scales_the_step() {
        let s = Scaffold::new(0.5);
        let next = s
            .aggregate(&[Tensor::vector(vec![1.0])], &AggregationInput::Individual(vec![contribution("solo", 5, vec![vec![2.0]])]))
            .unwrap();
        assert!(close(&next.layers[0].data, &[2.0]));
    }

    #[test]
    fn variates_wait_for_commit() {
        let s = Scaffold::new(1.0);
        let global = vec![Tensor::vector(vec![0.0])];
        let input = AggregationInput::Individual(vec![contribution("a", 1, vec![vec![1.0]]), contribution("b", 1, vec![vec![3.0]])]);
        let out = s.aggregate(&global, &input).unwrap();
        assert!(s.client_variate("a").is_none());
        assert!(s.server_variate().is_empty());
        s.commit(out.staged.unwrap());
        assert!(close(&s.client_variate("a").unwrap()[0].data, &[-1.0]));
    }

    #[test]
    fn refuses_opened_sums() {
        let s = Scaffold::new(1.0);
        let input = AggregationInput::Summed(WeightedSum { delta_sum: vec![Tensor::vector(vec![1.0])], total_weight: 1, contributors: vec!["a".into()] });
        assert!(matches!(s.aggregate(&[Tensor::vector(vec![0.0])], &input), Err(FederationError::AggregationFailure(_))));
    }
}

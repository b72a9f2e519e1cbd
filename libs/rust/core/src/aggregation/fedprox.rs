use super::{apply, Aggregate, AggregationInput, AggregationStrategy};
use crate::error::FedResult;
use crate::tensor::Tensor;

/// Weighted averaging with a proximal pull toward the current global model.
///
/// The server-side step is `g + (1 - μ)·avg(δ)`; `μ = 0` reduces to FedAvg.
#[derive(Debug, Clone, Copy)]
pub struct FedProx {
    mu: f32,
}

impl FedProx {
    pub fn new(mu: f32) -> Self {
        Self { mu: mu.clamp(0.0, 1.0) }
    }
}

impl AggregationStrategy for FedProx {
    fn name(&self) -> &'static str {
        "fed_prox"
    }

    fn aggregate(&self, global: &[Tensor], input: &AggregationInput) -> FedResult<Aggregate> {
        let mut step = input.weighted_mean_delta()?;
        for t in &mut step {
            t.scale(1.0 - self.mu);
        }
        apply(global, &step).map(Aggregate::stateless)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::testutil::*;
    use crate::aggregation::FedAvg;

    #[test]
    fn proximal_term_shrinks_the_step() {
        let global = vec![Tensor::vector(vec![1.0, 1.0])];
        let input = AggregationInput::Individual(vec![contribution("a", 1, vec![vec![2.0, -2.0]]), contribution("b", 1, vec![vec![0.0, 0.0]])]);
        let next = FedProx::new(0.5).aggregate(&global, &input).unwrap().layers;
        assert!(close(&next[0].data, &[1.5, 0.5]));
    }

    #[test]
    fn zero_mu_matches_fedavg() {
        let global = vec![Tensor::vector(vec![0.3])];
        let input = AggregationInput::Individual(vec![contribution("a", 4, vec![vec![1.0]]), contribution("b", 12, vec![vec![0.2]])]);
        let prox = FedProx::new(0.0).aggregate(&global, &input).unwrap().layers;
        let avg = FedAvg.aggregate(&global, &input).unwrap().layers;
        assert!(close(&prox[0].data, &avg[0].data));
    }
}

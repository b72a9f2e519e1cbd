use super::{apply, Aggregate, AggregationInput, AggregationStrategy};
use crate::error::FedResult;
use crate::tensor::Tensor;

/// Sample-weighted averaging: `g + Σ nᵢ·δᵢ / N`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FedAvg;

impl AggregationStrategy for FedAvg {
    fn name(&self) -> &'static str {
        "fed_avg"
    }

    fn aggregate(&self, global: &[Tensor], input: &AggregationInput) -> FedResult<Aggregate> {
        let mean = input.weighted_mean_delta()?;
        apply(global, &mean).map(Aggregate::stateless)
    }
}

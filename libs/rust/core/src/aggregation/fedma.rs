use tracing::debug;

use super::{apply, sample_weights, Aggregate, AggregationInput, AggregationStrategy, Contribution};
use crate::error::{FedResult, FederationError};
use crate::tensor::{check_shapes, Tensor};

/// Matched averaging.
///
/// For each configured 2-D layer, the units (rows) of every client are
/// matched to the units of the first contributor by greedy cosine
/// similarity before averaging. Pairs below the threshold stay unmatched
/// and are paired by position. All other layers use the weighted mean.
pub struct FedMa {
    threshold: f32,
    layers: Vec<usize>,
}

impl FedMa {
    pub fn new(threshold: f32, layers: Vec<usize>) -> Self {
        Self { threshold, layers }
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

/// `perm[u]` is the row of `candidate` assigned to template row `u`.
pub(crate) fn match_units(template: &Tensor, candidate: &Tensor, threshold: f32) -> Vec<usize> {
    let rows = template.units().map(|(r, _)| r).unwrap_or(0);
    let mut pairs = Vec::with_capacity(rows * rows);
    for u in 0..rows {
        for v in 0..rows {
            pairs.push((cosine(template.row(u), candidate.row(v)), u, v));
        }
    }
    pairs.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

    let mut perm = vec![usize::MAX; rows];
    let mut taken = vec![false; rows];
    for (sim, u, v) in pairs {
        if sim < threshold {
            break;
        }
        if perm[u] == usize::MAX && !taken[v] {
            perm[u] = v;
            taken[v] = true;
        }
    }
    let mut free = (0..rows).filter(|v| !taken[*v]);
    for slot in perm.iter_mut().filter(|p| **p == usize::MAX) {
        *slot = free.next().unwrap_or(0);
    }
    perm
}

impl FedMa {
    fn matched_layer(&self, index: usize, locals: &[Vec<Tensor>], weights: &[f64]) -> Tensor {
        let template = &locals[0][index];
        let (rows, cols) = template.units().unwrap_or((template.len(), 1));
        let mut out = Tensor::zeros_like(template);
        for (local, w) in locals.iter().zip(weights) {
            let layer = &local[index];
            let perm = match_units(template, layer, self.threshold);
            for u in 0..rows {
                let src = layer.row(perm[u]);
                for (o, s) in out.data[u * cols..(u + 1) * cols].iter_mut().zip(src) {
                    *o += *w as f32 * s;
                }
            }
        }
        out
    }
}

impl AggregationStrategy for FedMa {
    fn name(&self) -> &'static str {
        "fed_ma"
    }

    fn requires_individual(&self) -> bool {
        true
    }

    fn aggregate(&self, global: &[Tensor], input: &AggregationInput) -> FedResult<Aggregate> {
        let contributions: &[Contribution] = input.individual(self.name())?;
        let weights = sample_weights(&contributions.iter().map(|c| c.sample_count).collect::<Vec<_>>())?;
        let mut locals = Vec::with_capacity(contributions.len());
        for c in contributions {
            locals.push(apply(global, &c.delta)?);
        }
        let mut next = apply(global, &input.weighted_mean_delta()?)?;
        for &index in &self.layers {
            match global.get(index).and_then(Tensor::units) {
                Some(_) => next[index] = self.matched_layer(index, &locals, &weights),
                None => debug!(layer = index, "fedma_layer_not_matrix"),
            }
        }
        check_shapes(global, &next).map_err(|e| FederationError::AggregationFailure(e.to_string()))?;
        Ok(Aggregate::stateless(next))
    }
}

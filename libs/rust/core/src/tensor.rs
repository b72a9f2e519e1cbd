//! Dense layer tensors.
//!
//! Row-major `f32` storage with an explicit shape. The leading axis of a 2-D
//! tensor is treated as the unit (neuron) axis.

use serde::{Deserialize, Serialize};

use crate::error::{FedResult, FederationError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> FedResult<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(FederationError::InvalidUpdateShape(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// 1-D tensor over `data`.
    pub fn vector(data: Vec<f32>) -> Self {
        Self { shape: vec![data.len()], data }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        let n = shape.iter().product();
        Self { shape: shape.to_vec(), data: vec![0.0; n] }
    }

    pub fn zeros_like(other: &Tensor) -> Self {
        Self::zeros(&other.shape)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn l2_norm(&self) -> f64 {
        self.data.iter().map(|v| (*v as f64) * (*v as f64)).sum::<f64>().sqrt()
    }

    pub fn max_abs(&self) -> f32 {
        self.data.iter().fold(0.0f32, |m, v| m.max(v.abs()))
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    pub fn scale(&mut self, factor: f32) {
        for v in &mut self.data {
            *v *= factor;
        }
    }

    /// `self += factor * other`; shapes must already match.
    pub fn add_scaled(&mut self, other: &Tensor, factor: f32) {
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += factor * *b;
        }
    }

    pub fn sub(&self, other: &Tensor) -> Tensor {
        let data = self.data.iter().zip(&other.data).map(|(a, b)| a - b).collect();
        Tensor { shape: self.shape.clone(), data }
    }

    pub fn add(&self, other: &Tensor) -> Tensor {
        let data = self.data.iter().zip(&other.data).map(|(a, b)| a + b).collect();
        Tensor { shape: self.shape.clone(), data }
    }

    /// `(units, fan_in)` for 2-D tensors.
    pub fn units(&self) -> Option<(usize, usize)> {
        match self.shape.as_slice() {
            [rows, cols] => Some((*rows, *cols)),
            _ => None,
        }
    }

    pub fn row(&self, i: usize) -> &[f32] {
        let (_, cols) = self.units().unwrap_or((self.len(), 1));
        &self.data[i * cols..(i + 1) * cols]
    }
}

pub fn shapes_of(tensors: &[Tensor]) -> Vec<Vec<usize>> {
    tensors.iter().map(|t| t.shape.clone()).collect()
}

/// Checks that `candidate` matches `reference` layer-for-layer.
pub fn check_shapes(reference: &[Tensor], candidate: &[Tensor]) -> FedResult<()> {
    if reference.len() != candidate.len() {
        return Err(FederationError::InvalidUpdateShape(format!(
            "expected {} layers, got {}",
            reference.len(),
            candidate.len()
        )));
    }
    for (i, (r, c)) in reference.iter().zip(candidate).enumerate() {
        if r.shape != c.shape || c.data.len() != r.data.len() {
            return Err(FederationError::InvalidUpdateShape(format!(
                "layer {i}: expected {:?}, got {:?}",
                r.shape, c.shape
            )));
        }
    }
    Ok(())
}

/// Elementwise `weights - base`.
pub fn delta(weights: &[Tensor], base: &[Tensor]) -> FedResult<Vec<Tensor>> {
    check_shapes(base, weights)?;
    Ok(weights.iter().zip(base).map(|(w, b)| w.sub(b)).collect())
}

/// Elementwise `base + delta`.
pub fn apply_delta(base: &[Tensor], delta: &[Tensor]) -> FedResult<Vec<Tensor>> {
    check_shapes(base, delta)?;
    Ok(base.iter().zip(delta).map(|(b, d)| b.add(d)).collect())
}

pub fn global_l2_norm(tensors: &[Tensor]) -> f64 {
    tensors.iter().map(|t| t.l2_norm().powi(2)).sum::<f64>().sqrt()
}

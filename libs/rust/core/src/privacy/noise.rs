use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::Serialize;

use crate::config::PrivacyConfig;
use crate::error::{FedResult, FederationError};
use crate::tensor::Tensor;

/// What the mechanism did to one update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoiseReport {
    /// Per-tensor clip factor, each in (0, 1].
    pub scales: Vec<f64>,
    pub sigma: f64,
    pub effective_batch: usize,
}

/// Per-tensor L2 clipping followed by Gaussian noise.
#[derive(Debug, Clone)]
pub struct NoiseMechanism {
    clip_norm: f64,
    noise_multiplier: f64,
    min_batch_size: usize,
}

impl NoiseMechanism {
    pub fn new(cfg: &PrivacyConfig) -> Self {
        Self { clip_norm: cfg.clip_norm, noise_multiplier: cfg.noise_multiplier, min_batch_size: cfg.min_batch_size.max(1) }
    }

    /// L2 sensitivity of an update with `layers` independently clipped tensors.
    pub fn sensitivity(&self, layers: usize) -> f64 {
        self.clip_norm * (layers.max(1) as f64).sqrt()
    }

    /// Batch size used for noise calibration. Claims above the adaptive
    /// recommendation are ignored.
    pub fn effective_batch(&self, reported_samples: u64, recommended: usize) -> usize {
        let claimed = usize::try_from(reported_samples).unwrap_or(usize::MAX);
        claimed.min(recommended).max(self.min_batch_size)
    }

    pub fn sigma(&self, effective_batch: usize) -> f64 {
        self.clip_norm * self.noise_multiplier / (effective_batch.max(1) as f64).sqrt()
    }

    /// Scales each tensor down to `clip_norm`; returns the factors applied.
    pub fn clip(&self, tensors: &mut [Tensor]) -> Vec<f64> {
        tensors
            .iter_mut()
            .map(|t| {
                let norm = t.l2_norm();
                let scale = if norm > self.clip_norm { self.clip_norm / norm } else { 1.0 };
                if scale < 1.0 {
                    t.scale(scale as f32);
                }
                scale
            })
            .collect()
    }

    pub fn privatize(&self, tensors: &mut [Tensor], effective_batch: usize) -> FedResult<NoiseReport> {
        self.privatize_with_rng(tensors, effective_batch, &mut rand::thread_rng())
    }

    /// Clip, then noise. Reversing the order would void the sensitivity bound.
    pub fn privatize_with_rng<R: Rng + ?Sized>(&self, tensors: &mut [Tensor], effective_batch: usize, rng: &mut R) -> FedResult<NoiseReport> {
        let scales = self.clip(tensors);
        let sigma = self.sigma(effective_batch);
        let normal = Normal::new(0.0, sigma).map_err(|e| FederationError::Config(format!("noise distribution: {e}")))?;
        for t in tensors.iter_mut() {
            for v in &mut t.data {
                *v += normal.sample(rng) as f32;
            }
        }
        Ok(NoiseReport { scales, sigma, effective_batch })
    }
}

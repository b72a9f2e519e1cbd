//! Per-client update shaping: compression with error feedback, staleness
//! admission and batch-size recommendations.
//!
//! Compression output is staged. The residual only advances once the update
//! is accepted, via [`UpdateOptimizer::commit`].

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

use crate::config::{BatchingConfig, CompressionConfig, CompressionMode, StalenessConfig};
use crate::error::{FedResult, FederationError};
use crate::model::{ClientId, ModelVersion};
use crate::tensor::{shapes_of, Tensor};

const LATENCY_WINDOW: usize = 16;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompressionState {
    /// Error-feedback residual per layer.
    pub residuals: Vec<Tensor>,
    /// Elements kept by the last sparsification; empty for other modes.
    pub mask: Vec<Vec<bool>>,
    pub last_sent: Vec<Tensor>,
}

impl CompressionState {
    fn fresh(shapes: &[Vec<usize>]) -> Self {
        Self { residuals: shapes.iter().map(|s| Tensor::zeros(s)).collect(), mask: Vec::new(), last_sent: Vec::new() }
    }

    fn matches(&self, shapes: &[Vec<usize>]) -> bool {
        shapes_of(&self.residuals) == shapes
    }

    pub fn residual_norm(&self) -> f64 {
        crate::tensor::global_l2_norm(&self.residuals)
    }
}

#[derive(Debug, Clone)]
pub struct CompressedUpdate {
    pub tensors: Vec<Tensor>,
    /// State to install if the update is accepted.
    pub staged: CompressionState,
    /// Fraction of elements carried (1.0 for quantization and passthrough).
    pub density: f64,
}

struct ClientTrack {
    compression: Option<CompressionState>,
    latencies: VecDeque<u64>,
    batch_size: usize,
}

pub struct UpdateOptimizer {
    compression: CompressionConfig,
    staleness: StalenessConfig,
    batching: BatchingConfig,
    clients: RwLock<HashMap<ClientId, ClientTrack>>,
}

impl UpdateOptimizer {
    pub fn new(compression: CompressionConfig, staleness: StalenessConfig, batching: BatchingConfig) -> Self {
        Self { compression, staleness, batching, clients: RwLock::new(HashMap::new()) }
    }

    fn new_track(&self) -> ClientTrack {
        ClientTrack { compression: None, latencies: VecDeque::new(), batch_size: self.batching.initial_batch_size }
    }

    /// Compresses `delta` against the client's current residual without
    /// touching stored state.
    pub fn compress(&self, client: &str, delta: &[Tensor]) -> CompressedUpdate {
        let shapes = shapes_of(delta);
        let prior = self
            .clients
            .read()
            .get(client)
            .and_then(|t| t.compression.clone())
            .filter(|s| s.matches(&shapes))
            .unwrap_or_else(|| CompressionState::fresh(&shapes));

        let feedback = self.compression.error_feedback && self.compression.mode != CompressionMode::None;
        let mut tensors = Vec::with_capacity(delta.len());
        let mut residuals = Vec::with_capacity(delta.len());
        let mut mask = Vec::new();
        let (mut kept, mut total) = (0usize, 0usize);
        for (d, r) in delta.iter().zip(&prior.residuals) {
            let input = if feedback { d.add(r) } else { d.clone() };
            let out = match self.compression.mode {
                CompressionMode::None => input.clone(),
                CompressionMode::Sparsify => {
                    let (sparse, m) = sparsify(&input, self.compression.rate);
                    kept += m.iter().filter(|b| **b).count();
                    mask.push(m);
                    sparse
                }
                CompressionMode::Quantize => quantize(&input, quantization_bits(self.compression.rate)),
            };
            total += input.len();
            residuals.push(if feedback { input.sub(&out) } else { Tensor::zeros_like(&input) });
            tensors.push(out);
        }
        let density = match self.compression.mode {
            CompressionMode::Sparsify if total > 0 => kept as f64 / total as f64,
            _ => 1.0,
        };
        let staged = CompressionState { residuals, mask, last_sent: tensors.clone() };
        CompressedUpdate { tensors, staged, density }
    }

    pub fn commit(&self, client: &str, staged: CompressionState) {
        let mut clients = self.clients.write();
        let track = clients.entry(client.to_string()).or_insert_with(|| self.new_track());
        track.compression = Some(staged);
    }

    pub fn compression_state(&self, client: &str) -> Option<CompressionState> {
        self.clients.read().get(client).and_then(|t| t.compression.clone())
    }

    /// Staleness bound for `client`, widened by one version per multiple of
    /// the fleet average latency it consistently shows.
    pub fn allowed_staleness(&self, client: &str) -> u64 {
        let base = self.staleness.max_staleness;
        if !self.staleness.adaptive {
            return base;
        }
        let clients = self.clients.read();
        let Some(track) = clients.get(client).filter(|t| t.latencies.len() >= self.staleness.latency_samples.max(1)) else {
            return base;
        };
        let means: Vec<f64> = clients.values().filter(|t| !t.latencies.is_empty()).map(|t| mean(&t.latencies)).collect();
        let fleet = means.iter().sum::<f64>() / means.len() as f64;
        if fleet <= 0.0 {
            return base;
        }
        let extra = ((mean(&track.latencies) / fleet).floor() as u64).saturating_sub(1);
        (base + extra).min(self.staleness.hard_max_staleness)
    }

    /// Returns the staleness of an update trained on `base_version`.
    pub fn check_staleness(&self, client: &str, current: ModelVersion, base_version: ModelVersion) -> FedResult<u64> {
        let staleness = current.saturating_sub(base_version);
        let allowed = self.allowed_staleness(client);
        if staleness > allowed {
            debug!(client_id = %client, staleness, allowed, "stale_update");
            return Err(FederationError::StaleUpdate { staleness, allowed });
        }
        Ok(staleness)
    }

    /// Records how long the client took to return an update and adapts its
    /// recommended batch size.
    pub fn observe_latency(&self, client: &str, latency_ms: u64) {
        let mut clients = self.clients.write();
        let track = clients.entry(client.to_string()).or_insert_with(|| self.new_track());
        track.latencies.push_back(latency_ms);
        while track.latencies.len() > LATENCY_WINDOW {
            track.latencies.pop_front();
        }
        let factor = if latency_ms <= self.batching.target_latency_ms { 1.25 } else { 0.8 };
        let next = (track.batch_size as f64 * factor).round() as usize;
        track.batch_size = next.clamp(self.batching.min_batch_size, self.batching.max_batch_size);
    }

    pub fn batch_size_for(&self, client: &str) -> usize {
        self.clients.read().get(client).map(|t| t.batch_size).unwrap_or(self.batching.initial_batch_size)
    }
}

fn mean(xs: &VecDeque<u64>) -> f64 {
    xs.iter().sum::<u64>() as f64 / xs.len().max(1) as f64
}

/// Levels used by the quantizer for a given compression rate.
pub fn quantization_bits(rate: f64) -> u32 {
    ((32.0 * rate).round() as i64).clamp(1, 16) as u32
}

/// Keeps the `rate` fraction of largest-magnitude elements (at least one).
fn sparsify(t: &Tensor, rate: f64) -> (Tensor, Vec<bool>) {
    let n = t.len();
    let k = ((rate * n as f64).ceil() as usize).clamp(1, n.max(1));
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|a, b| t.data[*b].abs().partial_cmp(&t.data[*a].abs()).unwrap_or(std::cmp::Ordering::Equal).then(a.cmp(b)));
    let mut mask = vec![false; n];
    for i in order.into_iter().take(k) {
        mask[i] = true;
    }
    let data = t.data.iter().zip(&mask).map(|(v, keep)| if *keep { *v } else { 0.0 }).collect();
    (Tensor { shape: t.shape.clone(), data }, mask)
}

/// Uniform symmetric quantization over the tensor's max magnitude.
fn quantize(t: &Tensor, bits: u32) -> Tensor {
    let max = t.max_abs();
    if max == 0.0 {
        return t.clone();
    }
    let levels = ((1u32 << (bits - 1)) - 1).max(1) as f32;
    let step = max / levels;
    let data = t.data.iter().map(|v| (v / step).round() * step).collect();
    Tensor { shape: t.shape.clone(), data }
}

//! Deployment configuration.
//!
//! Every section defaults independently, so a partial YAML file or a handful of
//! `FEDSHIELD_*` environment overrides is enough to run.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{FedResult, FederationError};
use crate::proof::Constraint;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    pub round: RoundConfig,
    pub selection: SelectionConfig,
    pub aggregation: AggregationConfig,
    pub privacy: PrivacyConfig,
    pub proof: ProofConfig,
    pub channel: ChannelConfig,
    pub compression: CompressionConfig,
    pub staleness: StalenessConfig,
    pub batching: BatchingConfig,
    pub update: UpdateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundConfig {
    pub min_clients: usize,
    /// Target cohort size; fewer are accepted down to `min_clients`.
    pub cohort_size: usize,
    pub round_timeout_ms: u64,
    /// Accepted updates needed to aggregate a timed-out round instead of failing it.
    pub min_updates_on_timeout: usize,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self { min_clients: 2, cohort_size: 10, round_timeout_ms: 300_000, min_updates_on_timeout: 2 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    Random,
    PowerOfTwo,
    Reputation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub strategy: SelectionStrategy,
    pub history_len: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self { strategy: SelectionStrategy::PowerOfTwo, history_len: 20 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    FedAvg,
    FedProx,
    FedMa,
    FedDyn,
    Scaffold,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub strategy: AggregationKind,
    pub fedprox_mu: f32,
    pub feddyn_alpha: f32,
    pub scaffold_lr: f32,
    pub fedma_threshold: f32,
    /// Layer indices whose units may be permuted between clients.
    pub fedma_layers: Vec<usize>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            strategy: AggregationKind::FedAvg,
            fedprox_mu: 0.01,
            feddyn_alpha: 0.01,
            scaffold_lr: 1.0,
            fedma_threshold: 0.7,
            fedma_layers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStrategyKind {
    Fixed,
    Proportional,
    Adaptive,
    Composition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    pub epsilon: f64,
    pub delta: f64,
    pub clip_norm: f64,
    pub noise_multiplier: f64,
    pub min_batch_size: usize,
    pub budget_strategy: BudgetStrategyKind,
    pub fixed_fraction: f64,
    pub base_query_epsilon: f64,
    pub min_query_epsilon: f64,
    pub max_query_epsilon: f64,
    pub reference_sensitivity: f64,
    pub adaptive_decay: f64,
    pub adaptive_window: usize,
    pub composition_queries: u64,
    pub global_epsilon: Option<f64>,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            epsilon: 10.0,
            delta: 1e-5,
            clip_norm: 1.0,
            noise_multiplier: 1.1,
            min_batch_size: 32,
            budget_strategy: BudgetStrategyKind::Proportional,
            fixed_fraction: 0.1,
            base_query_epsilon: 0.5,
            min_query_epsilon: 0.05,
            max_query_epsilon: 2.0,
            reference_sensitivity: 1.0,
            adaptive_decay: 0.9,
            adaptive_window: 10,
            composition_queries: 100,
            global_epsilon: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProofConfig {
    pub freshness_ms: i64,
    pub max_proof_bytes: usize,
    /// Fixed-point precision used when committing to update values.
    pub precision_bits: u32,
    /// Constraints every submitted delta must be proven to satisfy.
    pub constraints: Vec<Constraint>,
}

impl Default for ProofConfig {
    fn default() -> Self {
        Self {
            freshness_ms: 60_000,
            max_proof_bytes: 4 * 1024 * 1024,
            precision_bits: 16,
            constraints: vec![Constraint::Norm { max_l2: 100.0 }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub precision_bits: u32,
    /// Baby-step table holds `2^dlog_table_bits` points.
    pub dlog_table_bits: u32,
    /// Largest decryptable plaintext magnitude is `2^max_plaintext_bits`.
    pub max_plaintext_bits: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self { precision_bits: 12, dlog_table_bits: 16, max_plaintext_bits: 36 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMode {
    None,
    Sparsify,
    Quantize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub mode: CompressionMode,
    /// Fraction of elements kept (sparsify) or of 32 bits kept (quantize).
    pub rate: f64,
    pub error_feedback: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self { mode: CompressionMode::Sparsify, rate: 0.25, error_feedback: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StalenessConfig {
    pub max_staleness: u64,
    pub hard_max_staleness: u64,
    pub adaptive: bool,
    /// Latency observations required before a client's allowance is widened.
    pub latency_samples: usize,
}

impl Default for StalenessConfig {
    fn default() -> Self {
        Self { max_staleness: 2, hard_max_staleness: 5, adaptive: true, latency_samples: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub initial_batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub target_latency_ms: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self { initial_batch_size: 64, min_batch_size: 16, max_batch_size: 512, target_latency_ms: 30_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Largest absolute weight value accepted in a submitted update.
    pub max_abs_value: f32,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self { max_abs_value: 1.0e4 }
    }
}

fn invalid(msg: impl Into<String>) -> FederationError {
    FederationError::Config(msg.into())
}

impl FederationConfig {
    pub fn validate(&self) -> FedResult<()> {
        let r = &self.round;
        if r.min_clients == 0 {
            return Err(invalid("round.min_clients must be at least 1"));
        }
        if r.cohort_size < r.min_clients {
            return Err(invalid("round.cohort_size must be >= round.min_clients"));
        }
        if r.round_timeout_ms == 0 {
            return Err(invalid("round.round_timeout_ms must be positive"));
        }
        if r.min_updates_on_timeout == 0 {
            return Err(invalid("round.min_updates_on_timeout must be at least 1"));
        }

        let p = &self.privacy;
        if !(p.epsilon > 0.0) {
            return Err(invalid("privacy.epsilon must be positive"));
        }
        if !(p.delta > 0.0 && p.delta < 1.0) {
            return Err(invalid("privacy.delta must lie in (0, 1)"));
        }
        if !(p.clip_norm > 0.0) || p.noise_multiplier < 0.0 {
            return Err(invalid("privacy.clip_norm must be positive and noise_multiplier non-negative"));
        }
        if p.min_batch_size == 0 {
            return Err(invalid("privacy.min_batch_size must be at least 1"));
        }
        if !(p.fixed_fraction > 0.0 && p.fixed_fraction <= 1.0) {
            return Err(invalid("privacy.fixed_fraction must lie in (0, 1]"));
        }
        if !(p.min_query_epsilon > 0.0) || p.min_query_epsilon > p.max_query_epsilon {
            return Err(invalid("privacy.min_query_epsilon must be positive and <= max_query_epsilon"));
        }
        if !(p.reference_sensitivity > 0.0) {
            return Err(invalid("privacy.reference_sensitivity must be positive"));
        }
        if !(p.adaptive_decay > 0.0 && p.adaptive_decay < 1.0) {
            return Err(invalid("privacy.adaptive_decay must lie in (0, 1)"));
        }
        if p.composition_queries == 0 {
            return Err(invalid("privacy.composition_queries must be at least 1"));
        }

        if self.proof.precision_bits == 0 || self.proof.precision_bits > 24 {
            return Err(invalid("proof.precision_bits must lie in 1..=24"));
        }
        for c in &self.proof.constraints {
            c.validate()?;
        }

        let ch = &self.channel;
        if ch.precision_bits > 24 {
            return Err(invalid("channel.precision_bits must be <= 24"));
        }
        if !(4..=24).contains(&ch.dlog_table_bits) || ch.max_plaintext_bits < ch.dlog_table_bits || ch.max_plaintext_bits > 62 {
            return Err(invalid("channel: need 4 <= dlog_table_bits <= max_plaintext_bits <= 62"));
        }

        let c = &self.compression;
        if c.mode != CompressionMode::None && !(c.rate > 0.0 && c.rate <= 1.0) {
            return Err(invalid("compression.rate must lie in (0, 1]"));
        }

        if self.staleness.hard_max_staleness < self.staleness.max_staleness {
            return Err(invalid("staleness.hard_max_staleness must be >= max_staleness"));
        }

        let b = &self.batching;
        if b.min_batch_size == 0 || b.min_batch_size > b.initial_batch_size || b.initial_batch_size > b.max_batch_size {
            return Err(invalid("batching: need 0 < min <= initial <= max"));
        }

        if !(-1.0..=1.0).contains(&self.aggregation.fedma_threshold) {
            return Err(invalid("aggregation.fedma_threshold must lie in [-1, 1]"));
        }
        if !(0.0..=1.0).contains(&self.aggregation.fedprox_mu) {
            return Err(invalid("aggregation.fedprox_mu must lie in [0, 1]"));
        }
        Ok(())
    }
}

/// Loads configuration: defaults, then the optional file named by
/// `FEDSHIELD_CONFIG_FILE`, then `FEDSHIELD_<SECTION>__<KEY>` overrides.
pub fn load_config() -> Result<FederationConfig> {
    let file = std::env::var("FEDSHIELD_CONFIG_FILE").ok();
    load_config_from(file.as_deref().map(Path::new))
}

pub fn load_config_from(file: Option<&Path>) -> Result<FederationConfig> {
    let mut builder = config::Config::builder();
    if let Some(path) = file {
        builder = builder.add_source(config::File::from(path).required(false));
    }
    builder = builder.add_source(
        config::Environment::with_prefix("FEDSHIELD")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );
    let cfg: FederationConfig = builder.build()?.try_deserialize()?;
    cfg.validate()?;
    tracing::info!(
        aggregation = ?cfg.aggregation.strategy,
        selection = ?cfg.selection.strategy,
        epsilon = cfg.privacy.epsilon,
        "federation_config_loaded"
    );
    Ok(cfg)
}

/// Parses an inline YAML document on top of the defaults.
pub fn config_from_yaml(text: &str) -> Result<FederationConfig> {
    let cfg: FederationConfig = config::Config::builder()
        .add_source(config::File::from_str(text, config::FileFormat::Yaml))
        .build()?
        .try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}

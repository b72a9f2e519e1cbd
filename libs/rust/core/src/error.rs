//! Error taxonomy for the federation core.
//!
//! Per-update rejections are local: the offending update is dropped and the
//! round carries on. Round-level failures are reported by the coordinator
//! through the same enum.

use thiserror::Error;

use crate::model::{ClientId, RoundId};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FederationError {
    #[error("round {0} is still active")]
    RoundAlreadyActive(RoundId),
    #[error("insufficient clients: {available} available, {required} required")]
    InsufficientClients { available: usize, required: usize },
    #[error("no active round")]
    NoActiveRound,
    #[error("client {0} is not part of the active cohort")]
    ClientNotSelected(ClientId),
    #[error("client {0} already has an accepted update in this round")]
    DuplicateUpdate(ClientId),
    #[error("invalid update shape: {0}")]
    InvalidUpdateShape(String),
    #[error("privacy budget exceeded for {0}")]
    PrivacyBudgetExceeded(ClientId),
    #[error("stale update: {staleness} versions behind, {allowed} allowed")]
    StaleUpdate { staleness: u64, allowed: u64 },
    #[error("invalid proof: {0}")]
    InvalidProof(String),
    #[error("proof is {age_ms} ms old, freshness window is {window_ms} ms")]
    ProofStale { age_ms: i64, window_ms: i64 },
    #[error("proof is {size} bytes, cap is {cap}")]
    ProofTooLarge { size: usize, cap: usize },
    #[error("constraint not satisfied: {0}")]
    ConstraintViolated(String),
    #[error("aggregation failed: {0}")]
    AggregationFailure(String),
    #[error("unknown client {0}")]
    UnknownClient(ClientId),
    #[error("client {0} already registered")]
    ClientAlreadyRegistered(ClientId),
    #[error("secure channel: {0}")]
    Channel(String),
    #[error("configuration: {0}")]
    Config(String),
}

impl FederationError {
    /// Short label used as a metric attribute and in rejection events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RoundAlreadyActive(_) => "round_already_active",
            Self::InsufficientClients { .. } => "insufficient_clients",
            Self::NoActiveRound => "no_active_round",
            Self::ClientNotSelected(_) => "client_not_selected",
            Self::DuplicateUpdate(_) => "duplicate_update",
            Self::InvalidUpdateShape(_) => "invalid_update_shape",
            Self::PrivacyBudgetExceeded(_) => "privacy_budget_exceeded",
            Self::StaleUpdate { .. } => "stale_update",
            Self::InvalidProof(_) => "invalid_proof",
            Self::ProofStale { .. } => "proof_stale",
            Self::ProofTooLarge { .. } => "proof_too_large",
            Self::ConstraintViolated(_) => "constraint_violated",
            Self::AggregationFailure(_) => "aggregation_failure",
            Self::UnknownClient(_) => "unknown_client",
            Self::ClientAlreadyRegistered(_) => "client_already_registered",
            Self::Channel(_) => "channel",
            Self::Config(_) => "config",
        }
    }
}

pub type FedResult<T> = Result<T, FederationError>;

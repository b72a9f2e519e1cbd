//! Round, model and update records shared across the pipeline.

use serde::{Deserialize, Serialize};

use crate::secure_channel::SealedTensors;
use crate::tensor::Tensor;

pub type ClientId = String;
pub type RoundId = u64;
pub type ModelVersion = u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalModel {
    pub version: ModelVersion,
    pub layers: Vec<Tensor>,
    pub updated_at: i64,
}

impl GlobalModel {
    pub fn new(layers: Vec<Tensor>) -> Self {
        Self { version: 0, layers, updated_at: chrono::Utc::now().timestamp_millis() }
    }

    /// Successor model produced by `round`.
    pub fn successor(&self, round: RoundId, layers: Vec<Tensor>) -> Self {
        debug_assert!(round > self.version);
        Self { version: round, layers, updated_at: chrono::Utc::now().timestamp_millis() }
    }
}

/// Self-reported training metrics. Never trusted for anything security relevant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub sample_count: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelUpdate {
    pub client_id: ClientId,
    /// Round this update is submitted to.
    pub round_id: RoundId,
    /// Global model version the client trained on.
    pub base_version: ModelVersion,
    /// Local model weights, one tensor per global layer.
    pub layers: Vec<Tensor>,
    pub metrics: TrainingMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundState {
    Initializing,
    InProgress,
    Aggregating,
    Completed,
    Failed,
}

impl RoundState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RoundState::Completed | RoundState::Failed)
    }

    pub fn can_advance_to(self, next: RoundState) -> bool {
        use RoundState::*;
        match (self, next) {
            (Initializing, InProgress) | (InProgress, Aggregating) | (Aggregating, Completed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub participation_rate: f64,
    pub accepted: usize,
    pub selected: usize,
}

/// An admitted, privatized and sealed contribution.
#[derive(Debug, Clone)]
pub struct AcceptedUpdate {
    pub client_id: ClientId,
    pub sample_count: u64,
    pub metrics: TrainingMetrics,
    pub sealed_delta: SealedTensors,
    pub accepted_at: i64,
}

#[derive(Debug, Clone)]
pub struct Round {
    pub id: RoundId,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub cohort: Vec<ClientId>,
    pub state: RoundState,
    /// Global model version distributed with this round.
    pub base_version: ModelVersion,
    pub updates: Vec<AcceptedUpdate>,
    /// Clients whose updates made it into aggregation; filled when the round ends.
    pub contributors: Vec<ClientId>,
    pub metrics: Option<RoundMetrics>,
    pub failure: Option<String>,
}

impl Round {
    pub fn new(id: RoundId, cohort: Vec<ClientId>, base_version: ModelVersion) -> Self {
        Self {
            id,
            started_at: chrono::Utc::now().timestamp_millis(),
            ended_at: None,
            cohort,
            state: RoundState::Initializing,
            base_version,
            updates: Vec::new(),
            contributors: Vec::new(),
            metrics: None,
            failure: None,
        }
    }

    /// Moves to `next` if the lifecycle allows it.
    pub fn advance(&mut self, next: RoundState) -> bool {
        if !self.state.can_advance_to(next) {
            return false;
        }
        self.state = next;
        if next.is_terminal() {
            self.ended_at = Some(chrono::Utc::now().timestamp_millis());
        }
        true
    }

    pub fn is_selected(&self, client: &str) -> bool {
        self.cohort.iter().any(|c| c == client)
    }

    pub fn has_accepted(&self, client: &str) -> bool {
        self.updates.iter().any(|u| u.client_id == client)
    }

    pub fn is_cohort_complete(&self) -> bool {
        self.updates.len() == self.cohort.len()
    }
}

/// Serializable summary of a finished round, handed to the audit store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundRecord {
    pub id: RoundId,
    pub state: RoundState,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub cohort: Vec<ClientId>,
    pub contributors: Vec<ClientId>,
    pub metrics: Option<RoundMetrics>,
    pub failure: Option<String>,
}

impl From<&Round> for RoundRecord {
    fn from(r: &Round) -> Self {
        Self {
            id: r.id,
            state: r.state,
            started_at: r.started_at,
            ended_at: r.ended_at,
            cohort: r.cohort.clone(),
            contributors: r.contributors.clone(),
            metrics: r.metrics.clone(),
            failure: r.failure.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_only_moves_forward() {
        let mut r = Round::new(1, vec!["a".into()], 0);
        assert!(!r.advance(RoundState::Aggregating));
        assert!(r.advance(RoundState::InProgress));
        assert!(r.advance(RoundState::Aggregating));
        assert!(r.advance(RoundState::Completed));
        assert!(r.ended_at.is_some());
        assert!(!r.advance(RoundState::Failed));
    }

    #[test]
    fn any_live_state_can_fail() {
        for s in [RoundState::Initializing, RoundState::InProgress, RoundState::Aggregating] {
            assert!(s.can_advance_to(RoundState::Failed));
        }
        assert!(!RoundState::Failed.can_advance_to(RoundState::Failed));
    }
}

//! Operational events emitted by the coordinator.
//!
//! Events carry no correctness weight; a bus with no subscribers simply drops
//! them.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{ClientId, RoundId, RoundMetrics};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FederationEvent {
    RoundStarted { round_id: RoundId, selected_clients: Vec<ClientId> },
    UpdateReceived { client_id: ClientId, round_id: RoundId },
    UpdateRejected { client_id: ClientId, round_id: RoundId, reason: String },
    PrivacyBudgetExceeded { client_id: ClientId },
    RoundCompleted { round_id: RoundId, metrics: RoundMetrics },
    RoundTimeout { round_id: RoundId },
    RoundFailed { round_id: RoundId, reason: String },
    Error { round_id: Option<RoundId>, message: String },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FederationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FederationEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: FederationEvent) {
        tracing::debug!(?event, "federation_event");
        // Err only means nobody is listening.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

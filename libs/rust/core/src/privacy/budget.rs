use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

use crate::config::{BudgetStrategyKind, PrivacyConfig};
use crate::error::{FedResult, FederationError};
use crate::metrics_ext::FED_METRICS;
use crate::model::ClientId;

const TOLERANCE: f64 = 1e-12;

/// Cumulative privacy loss. Every field only ever grows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrivacyLedgerEntry {
    /// Composed epsilon charged so far.
    pub epsilon: f64,
    pub delta: f64,
    pub steps: u64,
    /// Σ ε² over recorded queries.
    pub moment: f64,
    /// Σ ε over recorded queries (basic composition).
    pub linear: f64,
    /// Σ ε(e^ε − 1) over recorded queries.
    pub expected_loss: f64,
}

impl PrivacyLedgerEntry {
    fn advanced_bound(&self, ln_inv_delta: f64) -> f64 {
        (2.0 * ln_inv_delta * self.moment).sqrt() + self.expected_loss
    }

    /// Ledger after one more query costing `query_epsilon`, charged `charge`.
    fn after(&self, charge: &BudgetCharge, composed: Option<f64>) -> Self {
        let q = charge.query_epsilon;
        let mut next = Self {
            epsilon: self.epsilon + charge.epsilon,
            delta: self.delta + charge.delta,
            steps: self.steps + 1,
            moment: self.moment + q * q,
            linear: self.linear + q,
            expected_loss: self.expected_loss + q * q.exp_m1(),
        };
        if let Some(ln_inv_delta) = composed {
            next.epsilon = self.epsilon.max(next.linear.min(next.advanced_bound(ln_inv_delta)));
        }
        next
    }
}

/// Cost of one query, computed by [`BudgetAccountant::request_budget`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetCharge {
    /// Per-query epsilon fed into composition.
    pub query_epsilon: f64,
    /// Increase of the ledger's composed epsilon.
    pub epsilon: f64,
    pub delta: f64,
}

#[derive(Default)]
struct ClientBudget {
    ledger: PrivacyLedgerEntry,
    /// Recent (query epsilon, success) pairs for the adaptive strategy.
    history: VecDeque<(f64, bool)>,
}

#[derive(Default)]
struct State {
    clients: HashMap<ClientId, ClientBudget>,
    global: PrivacyLedgerEntry,
}

pub struct BudgetAccountant {
    cfg: PrivacyConfig,
    state: RwLock<State>,
}

impl BudgetAccountant {
    pub fn new(cfg: PrivacyConfig) -> Self {
        Self { cfg, state: RwLock::new(State::default()) }
    }

    pub fn strategy(&self) -> BudgetStrategyKind {
        self.cfg.budget_strategy
    }

    pub fn ledger(&self, client: &str) -> PrivacyLedgerEntry {
        self.state.read().clients.get(client).map(|c| c.ledger.clone()).unwrap_or_default()
    }

    pub fn global_ledger(&self) -> PrivacyLedgerEntry {
        self.state.read().global.clone()
    }

    pub fn remaining(&self, client: &str) -> f64 {
        (self.cfg.epsilon - self.ledger(client).epsilon).max(0.0)
    }

    /// `ln(1/δ')` with δ' = δ/2 set aside for advanced composition.
    fn ln_inv_delta_slack(&self) -> f64 {
        (2.0 / self.cfg.delta).ln()
    }

    fn composition(&self) -> Option<f64> {
        (self.cfg.budget_strategy == BudgetStrategyKind::Composition).then(|| self.ln_inv_delta_slack())
    }

    fn clamp(&self, eps: f64) -> f64 {
        eps.clamp(self.cfg.min_query_epsilon, self.cfg.max_query_epsilon)
    }

    /// Cost of a query with the given L2 sensitivity. Nothing is committed.
    pub fn request_budget(&self, client: &str, sensitivity: f64) -> BudgetCharge {
        let state = self.state.read();
        let entry = state.clients.get(client);
        let ledger = entry.map(|c| c.ledger.clone()).unwrap_or_default();
        let cfg = &self.cfg;
        let ratio = sensitivity.max(0.0) / cfg.reference_sensitivity;
        let per_query_delta = cfg.delta / cfg.composition_queries as f64;
        match cfg.budget_strategy {
            BudgetStrategyKind::Fixed => {
                let remaining = (cfg.epsilon - ledger.epsilon).max(0.0);
                // floor keeps a drained budget from being split forever
                let eps = (cfg.fixed_fraction * remaining).max(cfg.min_query_epsilon);
                let delta = cfg.fixed_fraction * (cfg.delta - ledger.delta).max(0.0);
                BudgetCharge { query_epsilon: eps, epsilon: eps, delta }
            }
            BudgetStrategyKind::Proportional => {
                let eps = self.clamp(cfg.base_query_epsilon * ratio);
                BudgetCharge { query_epsilon: eps, epsilon: eps, delta: per_query_delta }
            }
            BudgetStrategyKind::Adaptive => {
                let history = entry.map(|c| &c.history);
                let eps = self.clamp(self.adaptive_estimate(history) * ratio);
                BudgetCharge { query_epsilon: eps, epsilon: eps, delta: per_query_delta }
            }
            BudgetStrategyKind::Composition => {
                let ln_inv = self.ln_inv_delta_slack();
                let remaining_queries = cfg.composition_queries.saturating_sub(ledger.steps).max(1) as f64;
                let remaining = (cfg.epsilon - ledger.epsilon).max(0.0);
                let q = remaining / (2.0 * (2.0 * remaining_queries * ln_inv).sqrt());
                let trial = BudgetCharge { query_epsilon: q, epsilon: 0.0, delta: 0.0 };
                let composed = ledger.after(&trial, Some(ln_inv)).epsilon;
                // δ' is paid once, on the first query
                let slack = if ledger.steps == 0 { cfg.delta / 2.0 } else { 0.0 };
                let delta = slack + cfg.delta / (2.0 * cfg.composition_queries as f64);
                BudgetCharge { query_epsilon: q, epsilon: (composed - ledger.epsilon).max(0.0), delta }
            }
        }
    }

    /// Exponentially decayed average of recent successful costs. The decay is
    /// relaxed when recent queries mostly failed so the estimate moves faster.
    fn adaptive_estimate(&self, history: Option<&VecDeque<(f64, bool)>>) -> f64 {
        let Some(history) = history.filter(|h| !h.is_empty()) else {
            return self.cfg.base_query_epsilon;
        };
        let success_rate = history.iter().filter(|(_, ok)| *ok).count() as f64 / history.len() as f64;
        let decay = (self.cfg.adaptive_decay * (0.5 + 0.5 * success_rate)).clamp(0.05, 0.99);
        history
            .iter()
            .filter(|(_, ok)| *ok)
            .fold(self.cfg.base_query_epsilon, |avg, (eps, _)| decay * avg + (1.0 - decay) * eps)
    }

    fn admissible(&self, state: &State, ledger: &PrivacyLedgerEntry, charge: &BudgetCharge) -> bool {
        let next = ledger.after(charge, self.composition());
        if next.epsilon > self.cfg.epsilon + TOLERANCE || next.delta > self.cfg.delta + TOLERANCE {
            return false;
        }
        match self.cfg.global_epsilon {
            Some(cap) => state.global.epsilon + (next.epsilon - ledger.epsilon) <= cap + TOLERANCE,
            None => true,
        }
    }

    /// Admission check for a charge computed by `request_budget`.
    pub fn check(&self, client: &str, charge: &BudgetCharge) -> FedResult<()> {
        let state = self.state.read();
        let ledger = state.clients.get(client).map(|c| c.ledger.clone()).unwrap_or_default();
        if self.admissible(&state, &ledger, charge) {
            Ok(())
        } else {
            warn!(client_id = %client, spent = ledger.epsilon, requested = charge.epsilon, "privacy_budget_exceeded");
            Err(FederationError::PrivacyBudgetExceeded(client.to_string()))
        }
    }

    /// `request_budget` followed by `check`.
    pub fn admit(&self, client: &str, sensitivity: f64) -> FedResult<BudgetCharge> {
        let charge = self.request_budget(client, sensitivity);
        self.check(client, &charge)?;
        Ok(charge)
    }

    /// Commits a successful query, re-checking admission under the write
    /// lock. A failed query only feeds the adaptive history.
    pub fn record_query(&self, client: &str, charge: &BudgetCharge, success: bool) -> FedResult<()> {
        let mut state = self.state.write();
        let window = self.cfg.adaptive_window.max(1);
        if !success {
            let entry = state.clients.entry(client.to_string()).or_default();
            entry.history.push_back((charge.query_epsilon, false));
            while entry.history.len() > window {
                entry.history.pop_front();
            }
            return Ok(());
        }
        let ledger = state.clients.get(client).map(|c| c.ledger.clone()).unwrap_or_default();
        if !self.admissible(&state, &ledger, charge) {
            warn!(client_id = %client, spent = ledger.epsilon, "privacy_budget_exceeded_at_commit");
            return Err(FederationError::PrivacyBudgetExceeded(client.to_string()));
        }
        let next = ledger.after(charge, self.composition());
        let charged = next.epsilon - ledger.epsilon;
        let global_charge = BudgetCharge { query_epsilon: charged, epsilon: charged, delta: next.delta - ledger.delta };
        state.global = state.global.after(&global_charge, None);
        let entry = state.clients.entry(client.to_string()).or_default();
        entry.ledger = next;
        entry.history.push_back((charge.query_epsilon, true));
        while entry.history.len() > window {
            entry.history.pop_front();
        }
        FED_METRICS.epsilon_charged.record(charged, &[]);
        debug!(client_id = %client, charged, total = entry.ledger.epsilon, steps = entry.ledger.steps, "privacy_budget_committed");
        Ok(())
    }
}

//! Client registry, cohort selection and reputation scoring.
//!
//! Score and reputation weights are fixed:
//! - selection: accuracy 0.3, speed 0.2, participation 0.2, compute 0.15, reputation 0.15
//! - reputation: accuracy 0.4, duration stability 0.2, participation 0.2, trend 0.2

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

use crate::config::SelectionStrategy;
use crate::error::{FedResult, FederationError};
use crate::model::ClientId;

const TREND_WINDOW: usize = 10;
const TREND_STEEPNESS: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientState {
    Idle,
    Training,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub loss: f64,
    pub accuracy: f64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    pub state: ClientState,
    pub available: bool,
    pub compute_capability: f64,
    pub reputation: f64,
    pub times_selected: u64,
    pub times_contributed: u64,
    pub history: VecDeque<PerformanceSample>,
    /// Set once the current selection has been credited a contribution.
    #[serde(skip)]
    credited: bool,
}

impl Client {
    pub fn new(id: ClientId, compute_capability: f64) -> Self {
        Self {
            id,
            state: ClientState::Idle,
            available: true,
            compute_capability: compute_capability.max(0.0),
            reputation: 0.5,
            times_selected: 0,
            times_contributed: 0,
            history: VecDeque::new(),
            credited: false,
        }
    }

    pub fn is_selectable(&self) -> bool {
        self.available && self.state == ClientState::Idle
    }

    pub fn participation_rate(&self) -> f64 {
        if self.times_selected == 0 {
            return 0.5;
        }
        (self.times_contributed as f64 / self.times_selected as f64).clamp(0.0, 1.0)
    }

    pub fn average_accuracy(&self) -> f64 {
        if self.history.is_empty() {
            return 0.5;
        }
        let sum: f64 = self.history.iter().map(|s| s.accuracy.clamp(0.0, 1.0)).sum();
        sum / self.history.len() as f64
    }

    fn average_duration_secs(&self) -> Option<f64> {
        if self.history.is_empty() {
            return None;
        }
        let sum: f64 = self.history.iter().map(|s| s.duration_ms as f64 / 1000.0).sum();
        Some(sum / self.history.len() as f64)
    }

    /// 1 minus the coefficient of variation of training time.
    fn duration_stability(&self) -> f64 {
        if self.history.len() < 2 {
            return 0.5;
        }
        let xs: Vec<f64> = self.history.iter().map(|s| s.duration_ms as f64).collect();
        let mean = xs.iter().sum::<f64>() / xs.len() as f64;
        if mean <= 0.0 {
            return 1.0;
        }
        let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / xs.len() as f64;
        1.0 - (var.sqrt() / mean).clamp(0.0, 1.0)
    }

    /// Least-squares slope over recent accuracy, squashed into (0, 1).
    fn accuracy_trend(&self) -> f64 {
        let recent: Vec<f64> = self.history.iter().rev().take(TREND_WINDOW).rev().map(|s| s.accuracy).collect();
        if recent.len() < 2 {
            return 0.5;
        }
        let n = recent.len() as f64;
        let mean_x = (n - 1.0) / 2.0;
        let mean_y = recent.iter().sum::<f64>() / n;
        let (mut num, mut den) = (0.0, 0.0);
        for (i, y) in recent.iter().enumerate() {
            let dx = i as f64 - mean_x;
            num += dx * (y - mean_y);
            den += dx * dx;
        }
        let slope = if den > 0.0 { num / den } else { 0.0 };
        1.0 / (1.0 + (-TREND_STEEPNESS * slope).exp())
    }

    pub fn recompute_reputation(&mut self) {
        let rep = 0.4 * self.average_accuracy()
            + 0.2 * self.duration_stability()
            + 0.2 * self.participation_rate()
            + 0.2 * self.accuracy_trend();
        self.reputation = rep.clamp(0.0, 1.0);
    }

    /// Selection score against the most capable candidate in the pool.
    pub fn selection_score(&self, max_compute: f64) -> f64 {
        let speed = self.average_duration_secs().map(|s| 1.0 / (1.0 + s)).unwrap_or(0.5);
        let compute = if max_compute > 0.0 { (self.compute_capability / max_compute).clamp(0.0, 1.0) } else { 0.0 };
        0.3 * self.average_accuracy() + 0.2 * speed + 0.2 * self.participation_rate() + 0.15 * compute + 0.15 * self.reputation
    }
}

pub struct ClientSelector {
    strategy: SelectionStrategy,
    history_len: usize,
    clients: RwLock<HashMap<ClientId, Client>>,
    rng: Mutex<StdRng>,
}

impl ClientSelector {
    pub fn new(strategy: SelectionStrategy, history_len: usize) -> Self {
        Self::with_rng(strategy, history_len, StdRng::from_entropy())
    }

    pub fn with_seed(strategy: SelectionStrategy, history_len: usize, seed: u64) -> Self {
        Self::with_rng(strategy, history_len, StdRng::seed_from_u64(seed))
    }

    fn with_rng(strategy: SelectionStrategy, history_len: usize, rng: StdRng) -> Self {
        Self { strategy, history_len: history_len.max(1), clients: RwLock::new(HashMap::new()), rng: Mutex::new(rng) }
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    pub fn register(&self, id: impl Into<ClientId>, compute_capability: f64) -> FedResult<()> {
        let id = id.into();
        let mut map = self.clients.write();
        if map.contains_key(&id) {
            return Err(FederationError::ClientAlreadyRegistered(id));
        }
        info!(client_id = %id, compute_capability, "client_registered");
        map.insert(id.clone(), Client::new(id, compute_capability));
        Ok(())
    }

    pub fn set_available(&self, id: &str, available: bool) -> FedResult<()> {
        let mut map = self.clients.write();
        let client = map.get_mut(id).ok_or_else(|| FederationError::UnknownClient(id.to_string()))?;
        client.available = available;
        Ok(())
    }

    pub fn client(&self, id: &str) -> Option<Client> {
        self.clients.read().get(id).cloned()
    }

    pub fn clients(&self) -> Vec<Client> {
        let mut all: Vec<Client> = self.clients.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn selectable_count(&self) -> usize {
        self.clients.read().values().filter(|c| c.is_selectable()).count()
    }

    /// Picks up to `target` idle clients, failing if fewer than `min` are idle.
    /// Chosen clients move to `Training`.
    pub fn select(&self, min: usize, target: usize) -> FedResult<Vec<ClientId>> {
        let mut map = self.clients.write();
        let mut pool: Vec<&Client> = map.values().filter(|c| c.is_selectable()).collect();
        if pool.len() < min {
            return Err(FederationError::InsufficientClients { available: pool.len(), required: min });
        }
        // HashMap order is unstable; sort so seeded selection is reproducible.
        pool.sort_by(|a, b| a.id.cmp(&b.id));
        let k = target.max(min).min(pool.len());
        let chosen = {
            let mut rng = self.rng.lock();
            match self.strategy {
                SelectionStrategy::Random => select_random(pool, k, &mut *rng),
                SelectionStrategy::PowerOfTwo => select_power_of_two(pool, k, &mut *rng),
                SelectionStrategy::Reputation => select_by_reputation(pool, k),
            }
        };
        for id in &chosen {
            if let Some(c) = map.get_mut(id) {
                c.state = ClientState::Training;
                c.times_selected += 1;
                c.credited = false;
            }
        }
        debug!(strategy = ?self.strategy, selected = chosen.len(), "cohort_selected");
        Ok(chosen)
    }

    /// Returns a client to `Idle` after its update was accepted or rejected.
    /// At most one accepted contribution is counted per selection.
    pub fn record_contribution(&self, id: &str, accepted: bool, sample: Option<PerformanceSample>) -> FedResult<f64> {
        let mut map = self.clients.write();
        let client = map.get_mut(id).ok_or_else(|| FederationError::UnknownClient(id.to_string()))?;
        client.state = ClientState::Idle;
        if accepted && !client.credited {
            client.credited = true;
            client.times_contributed += 1;
            if let Some(s) = sample {
                client.history.push_back(s);
                while client.history.len() > self.history_len {
                    client.history.pop_front();
                }
            }
        }
        client.recompute_reputation();
        debug!(client_id = %id, accepted, reputation = client.reputation, "contribution_recorded");
        Ok(client.reputation)
    }

    /// Returns a client to `Idle` without recording a contribution.
    pub fn release(&self, id: &str) {
        if let Some(c) = self.clients.write().get_mut(id) {
            c.state = ClientState::Idle;
        }
    }
}

fn select_random<R: Rng>(pool: Vec<&Client>, k: usize, rng: &mut R) -> Vec<ClientId> {
    let mut ids: Vec<ClientId> = pool.into_iter().map(|c| c.id.clone()).collect();
    ids.shuffle(rng);
    ids.truncate(k);
    ids
}

fn select_power_of_two<R: Rng>(mut pool: Vec<&Client>, k: usize, rng: &mut R) -> Vec<ClientId> {
    let max_compute = pool.iter().map(|c| c.compute_capability).fold(0.0, f64::max);
    let mut chosen = Vec::with_capacity(k);
    while chosen.len() < k && !pool.is_empty() {
        let idx = if pool.len() == 1 {
            0
        } else {
            let a = rng.gen_range(0..pool.len());
            let mut b = rng.gen_range(0..pool.len() - 1);
            if b >= a {
                b += 1;
            }
            if pool[a].selection_score(max_compute) >= pool[b].selection_score(max_compute) { a } else { b }
        };
        chosen.push(pool.swap_remove(idx).id.clone());
    }
    chosen
}

fn select_by_reputation(mut pool: Vec<&Client>, k: usize) -> Vec<ClientId> {
    pool.sort_by(|a, b| b.reputation.partial_cmp(&a.reputation).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.id.cmp(&b.id)));
    pool.into_iter().take(k).map(|c| c.id.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(acc: f64, ms: u64) -> PerformanceSample {
        PerformanceSample { loss: 1.0 - acc, accuracy: acc, duration_ms: ms }
    }

    fn selector(strategy: SelectionStrategy, n: usize) -> ClientSelector {
        let s = ClientSelector::with_seed(strategy, 20, 7);
        for i in 0..n {
            s.register(format!("c{i}"), 1.0).unwrap();
        }
        s
    }

    #[test]
    fn random_selection_moves_clients_to_training() {
        let s = selector(SelectionStrategy::Random, 5);
        let chosen = s.select(2, 3).unwrap();
        assert_eq!(chosen.len(), 3);
        for id in &chosen {
            assert_eq!(s.client(id).unwrap().state, ClientState::Training);
        }
        assert_eq!(s.selectable_count(), 2);
    }

    #[test]
    fn insufficient_clients_changes_nothing() {
        let s = selector(SelectionStrategy::Random, 2);
        let err = s.select(3, 3).unwrap_err();
        assert_eq!(err, FederationError::InsufficientClients { available: 2, required: 3 });
        assert_eq!(s.selectable_count(), 2);
    }

    #[test]
    fn unavailable_clients_are_skipped() {
        let s = selector(SelectionStrategy::Random, 3);
        s.set_available("c0", false).unwrap();
        let chosen = s.select(1, 3).unwrap();
        assert_eq!(chosen.len(), 2);
        assert!(!chosen.contains(&"c0".to_string()));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let s = selector(SelectionStrategy::Random, 1);
        assert!(matches!(s.register("c0", 2.0), Err(FederationError::ClientAlreadyRegistered(_))));
    }

    #[test]
    fn reputation_strategy_takes_top_k() {
        let s = selector(SelectionStrategy::Reputation, 4);
        {
            let mut map = s.clients.write();
            map.get_mut("c2").unwrap().reputation = 0.9;
            map.get_mut("c3").unwrap().reputation = 0.8;
        }
        assert_eq!(s.select(1, 2).unwrap(), vec!["c2".to_string(), "c3".to_string()]);
    }

    #[test]
    fn power_of_two_prefers_stronger_client_in_pair() {
        let s = ClientSelector::with_seed(SelectionStrategy::PowerOfTwo, 20, 1);
        s.register("weak", 0.1).unwrap();
        s.register("strong", 10.0).unwrap();
        assert_eq!(s.select(1, 1).unwrap(), vec!["strong".to_string()]);
    }

    #[test]
    fn reputation_follows_weighted_formula() {
        let s = selector(SelectionStrategy::Random, 1);
        for acc in [0.5, 0.7, 0.9] {
            s.select(1, 1).unwrap();
            s.record_contribution("c0", true, Some(sample(acc, 1000))).unwrap();
        }
        let c = s.client("c0").unwrap();
        assert_eq!(c.state, ClientState::Idle);
        let trend = 1.0 / (1.0 + (-TREND_STEEPNESS * 0.2f64).exp());
        let expected = 0.4 * 0.7 + 0.2 * 1.0 + 0.2 * 1.0 + 0.2 * trend;
        assert!((c.reputation - expected).abs() < 1e-9, "{} vs {}", c.reputation, expected);
    }

    #[test]
    fn rejection_lowers_participation() {
        let s = selector(SelectionStrategy::Random, 1);
        s.select(1, 1).unwrap();
        s.record_contribution("c0", true, Some(sample(0.8, 500))).unwrap();
        s.select(1, 1).unwrap();
        let before = s.client("c0").unwrap().reputation;
        let after = s.record_contribution("c0", false, None).unwrap();
        assert!(after < before);
        assert_eq!(s.client("c0").unwrap().participation_rate(), 0.5);
    }

    #[test]
    fn one_selection_credits_one_contribution() {
        let s = selector(SelectionStrategy::Random, 1);
        s.select(1, 1).unwrap();
        s.record_contribution("c0", true, Some(sample(0.8, 500))).unwrap();
        s.record_contribution("c0", true, Some(sample(0.8, 500))).unwrap();
        let c = s.client("c0").unwrap();
        assert_eq!((c.times_selected, c.times_contributed), (1, 1));
        assert_eq!(c.history.len(), 1);
        assert!(c.participation_rate() <= 1.0);

        s.select(1, 1).unwrap();
        s.record_contribution("c0", true, None).unwrap();
        assert_eq!(s.client("c0").unwrap().times_contributed, 2);
    }

    #[test]
    fn history_is_bounded() {
        let s = ClientSelector::with_seed(SelectionStrategy::Random, 3, 0);
        s.register("c", 1.0).unwrap();
        for i in 0..10 {
            s.select(1, 1).unwrap();
            s.record_contribution("c", true, Some(sample(0.1 * i as f64, 100))).unwrap();
        }
        assert_eq!(s.client("c").unwrap().history.len(), 3);
    }
}

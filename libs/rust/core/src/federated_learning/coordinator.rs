use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aggregation::{Aggregate, AggregationEngine, AggregationInput, Contribution, WeightedSum};
use crate::collaborators::BlobStore;
use crate::config::FederationConfig;
use crate::error::{FedResult, FederationError};
use crate::events::{EventBus, FederationEvent};
use crate::metrics_ext::FED_METRICS;
use crate::model::{AcceptedUpdate, ClientId, GlobalModel, ModelUpdate, ModelVersion, Round, RoundId, RoundMetrics, RoundRecord, RoundState};
use crate::optimizer::{CompressionState, UpdateOptimizer};
use crate::privacy::{BudgetAccountant, BudgetCharge, NoiseMechanism};
use crate::proof::{PedersenProofGate, Proof, ProofGate, ProofStatement};
use crate::secure_channel::{RistrettoChannel, SealedTensors, SecureChannel};
use crate::selection::{ClientSelector, PerformanceSample};
use crate::tensor::{check_shapes, delta, shapes_of, Tensor};

/// What a selected client receives when a round opens.
#[derive(Debug, Clone)]
pub struct RoundTicket {
    pub round_id: RoundId,
    pub cohort: Vec<ClientId>,
    /// Version the cohort trains on; echoed back as `ModelUpdate::base_version`.
    pub base_version: ModelVersion,
    /// Global model sealed under the coordinator channel.
    pub sealed_model: SealedTensors,
    /// Recommended local batch size per cohort member.
    pub batch_sizes: HashMap<ClientId, usize>,
    /// Unix millis after which the round times out.
    pub deadline_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionReceipt {
    pub round_id: RoundId,
    pub client_id: ClientId,
    pub accepted: usize,
    pub cohort_size: usize,
    pub staleness: u64,
    pub epsilon_charged: f64,
    pub noise_sigma: f64,
    /// Round state once the submission was processed; `Completed` when this
    /// update closed the cohort.
    pub round_state: RoundState,
}

/// Round context captured under the lock before the admission stages run.
struct Admission {
    round_id: RoundId,
    started_at: i64,
    current: Arc<GlobalModel>,
    base: Option<Arc<GlobalModel>>,
}

struct Admitted {
    sealed: SealedTensors,
    charge: BudgetCharge,
    staged: CompressionState,
    staleness: u64,
    sigma: f64,
}

struct Inner {
    next_round: RoundId,
    active: Option<RoundId>,
    rounds: BTreeMap<RoundId, Round>,
    model: Arc<GlobalModel>,
    /// Older versions kept for stale-but-admissible updates, oldest first.
    previous: VecDeque<Arc<GlobalModel>>,
    timer: Option<(RoundId, JoinHandle<()>)>,
}

impl Inner {
    fn version(&self, version: ModelVersion) -> Option<Arc<GlobalModel>> {
        if self.model.version == version {
            return Some(self.model.clone());
        }
        self.previous.iter().find(|m| m.version == version).cloned()
    }

    fn disarm(&mut self, round_id: RoundId) {
        if let Some((id, handle)) = self.timer.take() {
            if id == round_id {
                handle.abort();
            } else {
                self.timer = Some((id, handle));
            }
        }
    }
}

pub struct CoordinatorBuilder {
    cfg: FederationConfig,
    initial: GlobalModel,
    channel: Option<Arc<dyn SecureChannel>>,
    proof_gate: Option<Arc<dyn ProofGate>>,
    selector: Option<ClientSelector>,
    events: Option<EventBus>,
    audit: Option<Arc<dyn BlobStore>>,
}

impl CoordinatorBuilder {
    pub fn channel(mut self, channel: Arc<dyn SecureChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn proof_gate(mut self, gate: Arc<dyn ProofGate>) -> Self {
        self.proof_gate = Some(gate);
        self
    }

    pub fn selector(mut self, selector: ClientSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Finished rounds are written here as JSON `RoundRecord`s.
    pub fn audit_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.audit = Some(store);
        self
    }

    pub fn build(self) -> FedResult<Arc<RoundCoordinator>> {
        let cfg = self.cfg;
        cfg.validate()?;
        if self.initial.layers.is_empty() || self.initial.layers.iter().any(|t| t.is_empty() || !t.is_finite()) {
            return Err(FederationError::Config("initial model needs at least one finite, non-empty layer".into()));
        }
        let channel: Arc<dyn SecureChannel> = match self.channel {
            Some(channel) => channel,
            None => Arc::new(RistrettoChannel::new(&cfg.channel)),
        };
        let proof_gate: Arc<dyn ProofGate> = match self.proof_gate {
            Some(gate) => gate,
            None => Arc::new(PedersenProofGate::new(&cfg.proof)),
        };
        let selector = self.selector.unwrap_or_else(|| ClientSelector::new(cfg.selection.strategy, cfg.selection.history_len));
        let layer_shapes = shapes_of(&self.initial.layers);
        info!(
            layers = layer_shapes.len(),
            version = self.initial.version,
            strategy = ?cfg.aggregation.strategy,
            budget = ?cfg.privacy.budget_strategy,
            "coordinator_initialized"
        );
        Ok(Arc::new(RoundCoordinator {
            accountant: BudgetAccountant::new(cfg.privacy.clone()),
            noise: NoiseMechanism::new(&cfg.privacy),
            optimizer: UpdateOptimizer::new(cfg.compression.clone(), cfg.staleness.clone(), cfg.batching.clone()),
            engine: AggregationEngine::from_config(&cfg.aggregation),
            events: self.events.unwrap_or_default(),
            audit: self.audit,
            channel,
            proof_gate,
            selector,
            layer_shapes,
            inner: Mutex::new(Inner {
                next_round: self.initial.version + 1,
                active: None,
                rounds: BTreeMap::new(),
                model: Arc::new(self.initial),
                previous: VecDeque::new(),
                timer: None,
            }),
            cfg,
        }))
    }
}

/// Drives rounds: selection, admission of updates, aggregation and model
/// replacement. All round-state transitions go through `inner`; the lock is
/// never held across an await.
pub struct RoundCoordinator {
    cfg: FederationConfig,
    channel: Arc<dyn SecureChannel>,
    proof_gate: Arc<dyn ProofGate>,
    selector: ClientSelector,
    accountant: BudgetAccountant,
    noise: NoiseMechanism,
    optimizer: UpdateOptimizer,
    engine: AggregationEngine,
    events: EventBus,
    audit: Option<Arc<dyn BlobStore>>,
    layer_shapes: Vec<Vec<usize>>,
    inner: Mutex<Inner>,
}

impl RoundCoordinator {
    pub fn builder(cfg: FederationConfig, initial: GlobalModel) -> CoordinatorBuilder {
        CoordinatorBuilder { cfg, initial, channel: None, proof_gate: None, selector: None, events: None, audit: None }
    }

    /// Coordinator with the Ristretto channel, the Pedersen proof gate and an
    /// unseeded selector.
    pub fn new(cfg: FederationConfig, initial: GlobalModel) -> FedResult<Arc<Self>> {
        Self::builder(cfg, initial).build()
    }

    pub fn register_client(&self, id: impl Into<ClientId>, compute_capability: f64) -> FedResult<()> {
        self.selector.register(id, compute_capability)
    }

    /// Opens a round: selects a cohort, seals the current model for
    /// distribution and arms the round timeout.
    ///
    /// The model is replaced by what the cohort will actually open from the
    /// ticket, so deltas and proof bindings are checked against the same
    /// fixed-point values the clients trained on.
    pub async fn start_round(self: &Arc<Self>) -> FedResult<RoundTicket> {
        let (round_id, cohort, model) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if let Some(active) = inner.active {
                return Err(FederationError::RoundAlreadyActive(active));
            }
            let cohort = match self.selector.select(self.cfg.round.min_clients, self.cfg.round.cohort_size) {
                Ok(cohort) => cohort,
                Err(e) => {
                    warn!(reason = %e, "round_not_started");
                    return Err(e);
                }
            };
            let round_id = inner.next_round;
            inner.next_round += 1;
            inner.rounds.insert(round_id, Round::new(round_id, cohort.clone(), inner.model.version));
            inner.active = Some(round_id);
            (round_id, cohort, inner.model.clone())
        };

        let distributed = async {
            let sealed = self.channel.encrypt(&model.layers).await?;
            let opened = self.channel.decrypt(&sealed).await?;
            Ok::<_, FederationError>((sealed, opened))
        };
        let (sealed_model, opened) = match distributed.await {
            Ok(pair) => pair,
            Err(e) => {
                self.fail_round(round_id, format!("model sealing failed: {e}")).await;
                return Err(e);
            }
        };

        let timeout = Duration::from_millis(self.cfg.round.round_timeout_ms);
        let started_at = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let round = inner
                .rounds
                .get_mut(&round_id)
                .filter(|r| r.state == RoundState::Initializing)
                .ok_or(FederationError::NoActiveRound)?;
            round.advance(RoundState::InProgress);
            round.started_at = chrono::Utc::now().timestamp_millis();
            if inner.model.version == model.version && inner.model.layers != opened {
                debug!(round_id, version = model.version, "model_quantized_for_distribution");
                inner.model = Arc::new(GlobalModel { version: model.version, layers: opened, updated_at: model.updated_at });
            }
            let weak = Arc::downgrade(self);
            let handle = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(coordinator) = weak.upgrade() {
                    coordinator.on_timeout(round_id).await;
                }
            });
            inner.timer = Some((round_id, handle));
            round.started_at
        };

        let batch_sizes = cohort.iter().map(|c| (c.clone(), self.optimizer.batch_size_for(c))).collect();
        FED_METRICS.rounds_started.add(1, &[]);
        info!(round_id, cohort = cohort.len(), base_version = model.version, "round_started");
        self.events.emit(FederationEvent::RoundStarted { round_id, selected_clients: cohort.clone() });
        Ok(RoundTicket {
            round_id,
            cohort,
            base_version: model.version,
            sealed_model,
            batch_sizes,
            deadline_ms: started_at + timeout.as_millis() as i64,
        })
    }

    /// Runs an update through admission (shape, staleness, compression,
    /// budget, noise, proof, sealing) and appends it to the active round.
    /// The submission that completes the cohort also aggregates the round.
    pub async fn submit_update(&self, update: ModelUpdate, proof: Proof) -> FedResult<SubmissionReceipt> {
        let client = update.client_id.clone();
        let ctx = match self.admission_context(&update) {
            Ok(ctx) => ctx,
            Err(e) => return Err(self.reject(&client, update.round_id, e, false)),
        };

        let mut charge = None;
        let admitted = match self.admit(&update, &proof, &ctx, &mut charge).await {
            Ok(admitted) => admitted,
            Err(e) => {
                if let Some(c) = charge {
                    let _ = self.accountant.record_query(&client, &c, false);
                }
                return Err(self.reject(&client, ctx.round_id, e, true));
            }
        };

        let (charge, staleness, sigma) = (admitted.charge, admitted.staleness, admitted.sigma);
        let (accepted, cohort_size, complete) = match self.append(&update, &ctx, admitted) {
            Ok(outcome) => outcome,
            Err(e) => {
                let _ = self.accountant.record_query(&client, &charge, false);
                return Err(self.reject(&client, ctx.round_id, e, true));
            }
        };

        let now = chrono::Utc::now().timestamp_millis();
        self.optimizer.observe_latency(&client, (now - ctx.started_at).max(0) as u64);
        let sample = PerformanceSample { loss: update.metrics.loss, accuracy: update.metrics.accuracy, duration_ms: update.metrics.duration_ms };
        if let Err(e) = self.selector.record_contribution(&client, true, Some(sample)) {
            debug!(client_id = %client, reason = %e, "reputation_not_updated");
        }
        FED_METRICS.updates_accepted.add(1, &[]);
        info!(client_id = %client, round_id = ctx.round_id, accepted, cohort = cohort_size, staleness, "update_accepted");
        self.events.emit(FederationEvent::UpdateReceived { client_id: client.clone(), round_id: ctx.round_id });

        if complete {
            self.finish_round(ctx.round_id).await;
        }
        let round_state = self.inner.lock().rounds.get(&ctx.round_id).map(|r| r.state).unwrap_or(RoundState::Failed);
        Ok(SubmissionReceipt {
            round_id: ctx.round_id,
            client_id: client,
            accepted,
            cohort_size,
            staleness,
            epsilon_charged: charge.epsilon,
            noise_sigma: sigma,
            round_state,
        })
    }

    fn admission_context(&self, update: &ModelUpdate) -> FedResult<Admission> {
        let guard = self.inner.lock();
        let round_id = guard.active.filter(|id| *id == update.round_id).ok_or(FederationError::NoActiveRound)?;
        let round = guard
            .rounds
            .get(&round_id)
            .filter(|r| r.state == RoundState::InProgress)
            .ok_or(FederationError::NoActiveRound)?;
        if !round.is_selected(&update.client_id) {
            return Err(FederationError::ClientNotSelected(update.client_id.clone()));
        }
        if round.has_accepted(&update.client_id) {
            return Err(FederationError::DuplicateUpdate(update.client_id.clone()));
        }
        Ok(Admission { round_id, started_at: round.started_at, current: guard.model.clone(), base: guard.version(update.base_version) })
    }

    async fn admit(&self, update: &ModelUpdate, proof: &Proof, ctx: &Admission, charge_out: &mut Option<BudgetCharge>) -> FedResult<Admitted> {
        let client = update.client_id.as_str();
        check_shapes(&ctx.current.layers, &update.layers)?;
        if !update.layers.iter().all(Tensor::is_finite) {
            return Err(FederationError::InvalidUpdateShape("update contains non-finite values".into()));
        }
        let peak = update.layers.iter().map(Tensor::max_abs).fold(0.0f32, f32::max);
        if peak > self.cfg.update.max_abs_value {
            return Err(FederationError::InvalidUpdateShape(format!("value magnitude {peak} exceeds {}", self.cfg.update.max_abs_value)));
        }

        let staleness = self.optimizer.check_staleness(client, ctx.current.version, update.base_version)?;
        // base_version from the future, or one evicted from history
        let base = ctx
            .base
            .as_ref()
            .ok_or_else(|| FederationError::StaleUpdate { staleness, allowed: self.optimizer.allowed_staleness(client) })?;
        let raw = delta(&update.layers, &base.layers)?;
        let compressed = self.optimizer.compress(client, &raw);

        let charge = match self.accountant.admit(client, self.noise.sensitivity(raw.len())) {
            Ok(charge) => charge,
            Err(e) => {
                self.events.emit(FederationEvent::PrivacyBudgetExceeded { client_id: client.to_string() });
                return Err(e);
            }
        };
        *charge_out = Some(charge);
        let batch = self.noise.effective_batch(update.metrics.sample_count, self.optimizer.batch_size_for(client));
        let mut privatized = compressed.tensors;
        let report = self.noise.privatize(&mut privatized, batch)?;

        let statement = self.proof_statement(client, ctx.round_id, update.base_version);
        self.proof_gate.verify_proof(proof, &statement).await?;
        self.proof_gate.verify_binding(proof, &statement, &raw).await?;

        let sealed = self.channel.encrypt(&privatized).await?;
        debug!(client_id = %client, density = compressed.density, sigma = report.sigma, batch, "update_privatized");
        Ok(Admitted { sealed, charge, staged: compressed.staged, staleness, sigma: report.sigma })
    }

    /// Final commit under the lock. Returns `(accepted, cohort size, cohort complete)`.
    fn append(&self, update: &ModelUpdate, ctx: &Admission, admitted: Admitted) -> FedResult<(usize, usize, bool)> {
        let client = update.client_id.as_str();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.active != Some(ctx.round_id) {
            return Err(FederationError::NoActiveRound);
        }
        let round = inner
            .rounds
            .get_mut(&ctx.round_id)
            .filter(|r| r.state == RoundState::InProgress)
            .ok_or(FederationError::NoActiveRound)?;
        if round.has_accepted(client) {
            return Err(FederationError::DuplicateUpdate(client.to_string()));
        }
        self.accountant.record_query(client, &admitted.charge, true)?;
        self.optimizer.commit(client, admitted.staged);
        round.updates.push(AcceptedUpdate {
            client_id: client.to_string(),
            sample_count: update.metrics.sample_count,
            metrics: update.metrics.clone(),
            sealed_delta: admitted.sealed,
            accepted_at: chrono::Utc::now().timestamp_millis(),
        });
        let outcome = (round.updates.len(), round.cohort.len(), round.is_cohort_complete());
        if outcome.2 {
            round.advance(RoundState::Aggregating);
            inner.disarm(ctx.round_id);
        }
        Ok(outcome)
    }

    fn reject(&self, client: &str, round_id: RoundId, err: FederationError, in_cohort: bool) -> FederationError {
        FED_METRICS.rejected(err.kind());
        warn!(client_id = %client, round_id, reason = %err, "update_rejected");
        self.events.emit(FederationEvent::UpdateRejected { client_id: client.to_string(), round_id, reason: err.to_string() });
        if in_cohort {
            if let Err(e) = self.selector.record_contribution(client, false, None) {
                debug!(client_id = %client, reason = %e, "reputation_not_updated");
            }
        }
        err
    }

    /// Timeout handler. Aggregates a partial cohort if enough updates were
    /// accepted, otherwise fails the round. No-op once the round has left
    /// `InProgress`. Only the round timer calls this.
    pub(crate) async fn on_timeout(&self, round_id: RoundId) {
        let (accepted, selected, partial) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if inner.active != Some(round_id) {
                return;
            }
            let Some(round) = inner.rounds.get_mut(&round_id) else { return };
            if round.state != RoundState::InProgress {
                return;
            }
            // may be running inside the timer task itself, so detach instead of abort
            if matches!(&inner.timer, Some((id, _)) if *id == round_id) {
                inner.timer = None;
            }
            let partial = round.updates.len() >= self.cfg.round.min_updates_on_timeout;
            if partial {
                round.advance(RoundState::Aggregating);
            }
            (round.updates.len(), round.cohort.len(), partial)
        };
        warn!(round_id, accepted, selected, partial, "round_timeout");
        self.events.emit(FederationEvent::RoundTimeout { round_id });
        if partial {
            self.finish_round(round_id).await;
        } else {
            self.fail_round(round_id, format!("timed out with {accepted} of {selected} updates")).await;
        }
    }

    /// Marks the active round failed.
    pub async fn abort_round(&self, reason: impl Into<String>) -> FedResult<RoundId> {
        let round_id = self.inner.lock().active.ok_or(FederationError::NoActiveRound)?;
        self.fail_round(round_id, reason.into()).await;
        Ok(round_id)
    }

    async fn finish_round(&self, round_id: RoundId) {
        let started = Instant::now();
        let snapshot = {
            let guard = self.inner.lock();
            match guard.rounds.get(&round_id) {
                Some(r) if r.state == RoundState::Aggregating => Some((r.updates.clone(), r.cohort.clone(), guard.model.clone())),
                _ => None,
            }
        };
        let Some((updates, cohort, current)) = snapshot else { return };

        let Aggregate { layers, staged } = match self.aggregate(&updates, &current).await {
            Ok(aggregate) => aggregate,
            Err(e) => {
                warn!(round_id, reason = %e, "aggregation_failed");
                self.events.emit(FederationEvent::Error { round_id: Some(round_id), message: e.to_string() });
                self.fail_round(round_id, e.to_string()).await;
                return;
            }
        };

        let metrics = round_metrics(&updates, cohort.len());
        let record = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let Some(round) = inner.rounds.get_mut(&round_id) else { return };
            if !round.advance(RoundState::Completed) {
                debug!(round_id, state = ?round.state, "aggregation_discarded");
                return;
            }
            self.engine.commit(staged);
            round.contributors = updates.iter().map(|u| u.client_id.clone()).collect();
            round.metrics = Some(metrics.clone());
            let next = Arc::new(inner.model.successor(round_id, layers));
            let prev = std::mem::replace(&mut inner.model, next);
            inner.previous.push_back(prev);
            while inner.previous.len() as u64 > self.cfg.staleness.hard_max_staleness {
                inner.previous.pop_front();
            }
            if inner.active == Some(round_id) {
                inner.active = None;
            }
            RoundRecord::from(&*round)
        };

        for id in &cohort {
            self.selector.release(id);
        }
        let latency = started.elapsed().as_secs_f64() * 1000.0;
        FED_METRICS.aggregation_latency_ms.record(latency, &[]);
        FED_METRICS.rounds_completed.add(1, &[]);
        info!(
            round_id,
            strategy = self.engine.name(),
            accepted = metrics.accepted,
            participation = metrics.participation_rate,
            loss = metrics.loss,
            latency_ms = latency,
            "round_completed"
        );
        self.events.emit(FederationEvent::RoundCompleted { round_id, metrics });
        self.audit(record).await;
    }

    /// Opens the sealed deltas (individually or only as their weighted sum)
    /// and runs the aggregation strategy. Under encryption each delta is
    /// scaled by its sample count and the opened sum divided by the total.
    async fn aggregate(&self, updates: &[AcceptedUpdate], current: &GlobalModel) -> FedResult<Aggregate> {
        let counts: Vec<u64> = updates.iter().map(|u| u.sample_count.max(1)).collect();
        let input = if self.engine.requires_individual() {
            let mut contributions = Vec::with_capacity(updates.len());
            for (u, n) in updates.iter().zip(&counts) {
                let opened = self.channel.decrypt(&u.sealed_delta).await?;
                contributions.push(Contribution { client_id: u.client_id.clone(), sample_count: *n, delta: opened });
            }
            AggregationInput::Individual(contributions)
        } else {
            let mut scaled = Vec::with_capacity(updates.len());
            for (u, n) in updates.iter().zip(&counts) {
                scaled.push(self.channel.scale(&u.sealed_delta, *n).await?);
            }
            let sum = self.channel.homomorphic_sum(&scaled).await?;
            AggregationInput::Summed(WeightedSum {
                delta_sum: self.channel.decrypt(&sum).await?,
                total_weight: counts.iter().sum(),
                contributors: updates.iter().map(|u| u.client_id.clone()).collect(),
            })
        };
        self.engine.aggregate(&current.layers, &input)
    }

    async fn fail_round(&self, round_id: RoundId, reason: String) {
        let outcome = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            inner.disarm(round_id);
            match inner.rounds.get_mut(&round_id) {
                Some(round) if !round.state.is_terminal() => {
                    round.advance(RoundState::Failed);
                    round.failure = Some(reason.clone());
                    if inner.active == Some(round_id) {
                        inner.active = None;
                    }
                    Some((RoundRecord::from(&*round), round.cohort.clone()))
                }
                _ => None,
            }
        };
        let Some((record, cohort)) = outcome else { return };
        for id in &cohort {
            self.selector.release(id);
        }
        FED_METRICS.rounds_failed.add(1, &[]);
        warn!(round_id, reason = %reason, "round_failed");
        self.events.emit(FederationEvent::RoundFailed { round_id, reason });
        self.audit(record).await;
    }

    async fn audit(&self, record: RoundRecord) {
        let Some(store) = &self.audit else { return };
        let id = format!("round-{:010}", record.id);
        let blob = match serde_json::to_vec(&record) {
            Ok(blob) => blob,
            Err(e) => {
                warn!(round_id = record.id, error = %e, "audit_encode_failed");
                return;
            }
        };
        if let Err(e) = store.store(&id, blob).await {
            warn!(round_id = record.id, error = %e, "audit_store_failed");
            self.events.emit(FederationEvent::Error { round_id: Some(record.id), message: format!("audit store: {e}") });
        }
    }

    /// Statement a client must prove for `round_id`. Constraints always come
    /// from the coordinator's configuration.
    pub fn proof_statement(&self, client: &str, round_id: RoundId, base_version: ModelVersion) -> ProofStatement {
        ProofStatement::from_config(&self.cfg.proof, client, round_id, base_version, self.layer_shapes.clone())
    }

    pub fn global_model(&self) -> Arc<GlobalModel> {
        self.inner.lock().model.clone()
    }

    pub fn active_round(&self) -> Option<Round> {
        let guard = self.inner.lock();
        guard.active.and_then(|id| guard.rounds.get(&id).cloned())
    }

    pub fn round(&self, id: RoundId) -> Option<Round> {
        self.inner.lock().rounds.get(&id).cloned()
    }

    pub fn rounds(&self) -> Vec<RoundRecord> {
        self.inner.lock().rounds.values().map(RoundRecord::from).collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FederationEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &FederationConfig {
        &self.cfg
    }

    pub fn channel(&self) -> Arc<dyn SecureChannel> {
        self.channel.clone()
    }

    pub fn proof_gate(&self) -> Arc<dyn ProofGate> {
        self.proof_gate.clone()
    }

    pub fn selector(&self) -> &ClientSelector {
        &self.selector
    }

    pub fn accountant(&self) -> &BudgetAccountant {
        &self.accountant
    }

    pub fn optimizer(&self) -> &UpdateOptimizer {
        &self.optimizer
    }
}

/// Participation plus sample-weighted means of the reported loss and accuracy.
fn round_metrics(updates: &[AcceptedUpdate], selected: usize) -> RoundMetrics {
    let total: u64 = updates.iter().map(|u| u.sample_count).sum();
    let weight = |u: &AcceptedUpdate| {
        if total > 0 {
            u.sample_count as f64 / total as f64
        } else {
            1.0 / updates.len().max(1) as f64
        }
    };
    RoundMetrics {
        loss: updates.iter().map(|u| weight(u) * u.metrics.loss).sum(),
        accuracy: updates.iter().map(|u| weight(u) * u.metrics.accuracy).sum(),
        participation_rate: updates.len() as f64 / selected.max(1) as f64,
        accepted: updates.len(),
        selected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelConfig, CompressionMode, PrivacyConfig, ProofConfig, RoundConfig};
    use crate::model::TrainingMetrics;
    use crate::proof::{Constraint, ProofWitness};
    use crate::secure_channel::SealedTensors;
    use crate::selection::ClientState;

    fn accepted(client: &str, samples: u64, loss: f64, accuracy: f64) -> AcceptedUpdate {
        AcceptedUpdate {
            client_id: client.into(),
            sample_count: samples,
            metrics: TrainingMetrics { loss, accuracy, sample_count: samples, duration_ms: 10 },
            sealed_delta: SealedTensors { shapes: vec![], ciphertexts: vec![], precision_bits: 8 },
            accepted_at: 0,
        }
    }

    #[test]
    fn metrics_are_sample_weighted() {
        let m = round_metrics(&[accepted("a", 10, 1.0, 0.5), accepted("b", 30, 0.2, 0.9)], 4);
        assert!((m.loss - 0.4).abs() < 1e-12);
        assert!((m.accuracy - 0.8).abs() < 1e-12);
        assert_eq!(m.participation_rate, 0.5);
        assert_eq!((m.accepted, m.selected), (2, 4));
    }

    #[test]
    fn zero_samples_fall_back_to_plain_mean() {
        let m = round_metrics(&[accepted("a", 0, 1.0, 0.0), accepted("b", 0, 3.0, 1.0)], 2);
        assert!((m.loss - 2.0).abs() < 1e-12);
        assert_eq!(m.participation_rate, 1.0);
    }

    #[test]
    fn builder_rejects_empty_model() {
        let err = RoundCoordinator::builder(FederationConfig::default(), GlobalModel::new(vec![])).build().err();
        assert!(matches!(err, Some(FederationError::Config(_))));
    }

    fn three_client_coordinator() -> Arc<RoundCoordinator> {
        let mut cfg = FederationConfig {
            round: RoundConfig { min_clients: 2, cohort_size: 3, round_timeout_ms: 60_000, min_updates_on_timeout: 2 },
            privacy: PrivacyConfig {
                epsilon: 10.0,
                clip_norm: 10.0,
                noise_multiplier: 0.0,
                min_batch_size: 1,
                base_query_epsilon: 0.5,
                reference_sensitivity: 10.0,
                ..PrivacyConfig::default()
            },
            proof: ProofConfig { precision_bits: 8, constraints: vec![Constraint::Magnitude { max_abs: 4.0 }], ..ProofConfig::default() },
            channel: ChannelConfig { precision_bits: 8, dlog_table_bits: 10, max_plaintext_bits: 24 },
            ..FederationConfig::default()
        };
        cfg.compression.mode = CompressionMode::None;
        let coord = RoundCoordinator::new(cfg, GlobalModel::new(vec![Tensor::vector(vec![0.0])])).unwrap();
        for c in ["a", "b", "c"] {
            coord.register_client(c, 1.0).unwrap();
        }
        coord
    }

    async fn contribute(coord: &RoundCoordinator, ticket: &RoundTicket, client: &str, step: f32) -> FedResult<SubmissionReceipt> {
        let base = coord.channel().decrypt(&ticket.sealed_model).await?;
        let local = vec![Tensor::vector(vec![step])];
        let update = ModelUpdate {
            client_id: client.into(),
            round_id: ticket.round_id,
            base_version: ticket.base_version,
            layers: vec![base[0].add(&local[0])],
            metrics: TrainingMetrics { loss: 0.3, accuracy: 0.7, sample_count: 10, duration_ms: 50 },
        };
        let opened = delta(&update.layers, &base)?;
        let statement = coord.proof_statement(client, ticket.round_id, ticket.base_version);
        let proof = coord.proof_gate().generate_proof(&opened, &ProofWitness::for_tensors(&opened), &statement).await?;
        coord.submit_update(update, proof).await
    }

    #[tokio::test]
    async fn timeout_aggregates_a_partial_cohort() {
        let coord = three_client_coordinator();
        let ticket = coord.start_round().await.unwrap();
        contribute(&coord, &ticket, "a", 1.0).await.unwrap();
        contribute(&coord, &ticket, "b", -1.0).await.unwrap();

        coord.on_timeout(ticket.round_id).await;
        let round = coord.round(ticket.round_id).unwrap();
        assert_eq!(round.state, RoundState::Completed);
        let metrics = round.metrics.unwrap();
        assert_eq!(metrics.accepted, 2);
        assert!((metrics.participation_rate - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(coord.global_model().version, ticket.round_id);
        assert!(coord.global_model().layers[0].data[0].abs() < 1e-4);

        let late = contribute(&coord, &ticket, "c", 0.5).await;
        assert_eq!(late.unwrap_err(), FederationError::NoActiveRound);
        assert_eq!(coord.selector().client("c").unwrap().state, ClientState::Idle);

        // a second firing is a no-op
        coord.on_timeout(ticket.round_id).await;
        assert_eq!(coord.round(ticket.round_id).unwrap().state, RoundState::Completed);
    }

    #[tokio::test]
    async fn timeout_below_threshold_fails() {
        let coord = three_client_coordinator();
        let ticket = coord.start_round().await.unwrap();
        contribute(&coord, &ticket, "a", 1.0).await.unwrap();
        coord.on_timeout(ticket.round_id).await;
        let round = coord.round(ticket.round_id).unwrap();
        assert_eq!(round.state, RoundState::Failed);
        assert_eq!(coord.global_model().version, 0);
        assert!(coord.active_round().is_none());
    }

    #[tokio::test]
    async fn timeout_for_another_round_is_ignored() {
        let coord = three_client_coordinator();
        let ticket = coord.start_round().await.unwrap();
        coord.on_timeout(ticket.round_id + 1).await;
        assert_eq!(coord.active_round().unwrap().state, RoundState::InProgress);
    }
}

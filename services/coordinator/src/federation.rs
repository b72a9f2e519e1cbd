use std::sync::Arc;

use anyhow::{Context, Result};
use fedshield_core::tensor::delta;
use fedshield_core::{
    FederationConfig, FederationEvent, GlobalModel, ModelUpdate, ProofWitness, RoundCoordinator, RoundId, RoundRecord, RoundTicket, Tensor, TrainingMetrics,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Fleet and model shape for the simulated run. Read from
/// `FEDSHIELD_SIM_CLIENTS`, `FEDSHIELD_SIM_ROUNDS` and `FEDSHIELD_SIM_SEED`.
#[derive(Debug, Clone)]
pub struct SimulationSettings {
    pub clients: usize,
    pub rounds: usize,
    pub seed: u64,
    pub layer_shapes: Vec<Vec<usize>>,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(v) => v.parse().with_context(|| format!("{key}={v}")),
        Err(_) => Ok(default),
    }
}

impl SimulationSettings {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            clients: env_or("FEDSHIELD_SIM_CLIENTS", 8)?,
            rounds: env_or("FEDSHIELD_SIM_ROUNDS", 3)?,
            seed: env_or("FEDSHIELD_SIM_SEED", 42)?,
            layer_shapes: vec![vec![4, 3], vec![4]],
        })
    }
}

/// A simulated participant: trains by stepping the global model toward its
/// own optimum.
struct SimulatedClient {
    id: String,
    optimum: Vec<Tensor>,
    samples: u64,
    learning_rate: f32,
}

impl SimulatedClient {
    fn train(&self, global: &[Tensor], rng: &mut StdRng) -> (Vec<Tensor>, TrainingMetrics) {
        let layers: Vec<Tensor> = global
            .iter()
            .zip(&self.optimum)
            .map(|(g, o)| {
                let mut w = g.clone();
                for (v, target) in w.data.iter_mut().zip(&o.data) {
                    *v += self.learning_rate * (target - *v) + rng.gen_range(-0.01..0.01);
                }
                w
            })
            .collect();
        let loss: f64 = layers.iter().zip(&self.optimum).map(|(w, o)| w.sub(o).l2_norm().powi(2)).sum();
        let metrics = TrainingMetrics { loss, accuracy: 1.0 / (1.0 + loss), sample_count: self.samples, duration_ms: rng.gen_range(50..500) };
        (layers, metrics)
    }
}

#[derive(Debug, serde::Serialize)]
pub struct RoundSummary {
    pub record: RoundRecord,
    pub rejected: usize,
    pub model_version: u64,
}

pub struct FederationModule {
    coordinator: Arc<RoundCoordinator>,
    fleet: Vec<Arc<SimulatedClient>>,
    seed: u64,
}

impl FederationModule {
    pub fn new(cfg: FederationConfig, settings: &SimulationSettings) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(settings.seed);
        let initial = GlobalModel::new(settings.layer_shapes.iter().map(|s| Tensor::zeros(s)).collect());
        let coordinator = RoundCoordinator::new(cfg, initial)?;
        let mut fleet = Vec::with_capacity(settings.clients);
        for i in 0..settings.clients {
            let id = format!("client-{i:03}");
            coordinator.register_client(id.clone(), rng.gen_range(0.5..4.0))?;
            let optimum = settings
                .layer_shapes
                .iter()
                .map(|s| {
                    let mut t = Tensor::zeros(s);
                    t.data.iter_mut().for_each(|v| *v = rng.gen_range(-0.5..0.5));
                    t
                })
                .collect();
            fleet.push(Arc::new(SimulatedClient { id, optimum, samples: rng.gen_range(16..256), learning_rate: 0.3 }));
        }
        info!(clients = fleet.len(), "federation_module_initialized");
        Ok(Self { coordinator, fleet, seed: settings.seed })
    }

    /// Opens a round, lets every cohort member train, prove and submit
    /// concurrently, and reports how the round ended. A round short of its
    /// cohort is closed by the coordinator's timer.
    pub async fn run_round(&self) -> Result<RoundSummary> {
        let mut events = self.coordinator.subscribe();
        let ticket = self.coordinator.start_round().await?;
        let global = self.coordinator.channel().decrypt(&ticket.sealed_model).await?;
        let mut tasks = Vec::with_capacity(ticket.cohort.len());
        for id in &ticket.cohort {
            let Some(client) = self.fleet.iter().find(|c| &c.id == id).cloned() else { continue };
            let coordinator = self.coordinator.clone();
            let global = global.clone();
            let ticket = ticket.clone();
            let seed = self.seed ^ ticket.round_id.rotate_left(17) ^ fnv1a(id);
            tasks.push(tokio::spawn(async move { participate(&coordinator, &client, &ticket, &global, seed).await }));
        }
        let mut rejected = 0;
        for task in tasks {
            if let Err(e) = task.await? {
                rejected += 1;
                warn!(error = %e, "submission_failed");
            }
        }
        self.await_round_end(&mut events, ticket.round_id).await;
        let round = self.coordinator.round(ticket.round_id).context("round vanished")?;
        Ok(RoundSummary { record: RoundRecord::from(&round), rejected, model_version: self.coordinator.global_model().version })
    }

    async fn await_round_end(&self, events: &mut broadcast::Receiver<FederationEvent>, round_id: RoundId) {
        loop {
            if self.coordinator.round(round_id).map_or(true, |r| r.state.is_terminal()) {
                return;
            }
            match events.recv().await {
                Ok(FederationEvent::RoundCompleted { round_id: id, .. } | FederationEvent::RoundFailed { round_id: id, .. }) if id == round_id => return,
                Ok(FederationEvent::RoundTimeout { round_id: id }) if id == round_id => info!(round_id, "waiting_on_timeout_outcome"),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => debug!(round_id, skipped, "round_events_lagged"),
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        if self.coordinator.active_round().is_some() {
            self.coordinator.abort_round("coordinator shutdown").await?;
        }
        info!("federation_module_shutdown");
        Ok(())
    }
}

fn fnv1a(s: &str) -> u64 {
    s.bytes().fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ b as u64).wrapping_mul(0x100_0000_01b3))
}

async fn participate(coordinator: &RoundCoordinator, client: &SimulatedClient, ticket: &RoundTicket, global: &[Tensor], seed: u64) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let (layers, metrics) = client.train(global, &mut rng);
    let update_delta = delta(&layers, global)?;
    let statement = coordinator.proof_statement(&client.id, ticket.round_id, ticket.base_version);
    let proof = coordinator.proof_gate().generate_proof(&update_delta, &ProofWitness::for_tensors(&update_delta), &statement).await?;
    let update = ModelUpdate { client_id: client.id.clone(), round_id: ticket.round_id, base_version: ticket.base_version, layers, metrics };
    let receipt = coordinator.submit_update(update, proof).await?;
    info!(client_id = %receipt.client_id, accepted = receipt.accepted, epsilon = receipt.epsilon_charged, "submission_accepted");
    Ok(())
}

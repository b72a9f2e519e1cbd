use std::sync::Arc;
use std::time::Duration;

use fedshield_core::collaborators::{BlobStore, InMemoryBlobStore};
use fedshield_core::config::{AggregationConfig, AggregationKind, ChannelConfig, CompressionMode, PrivacyConfig, ProofConfig, RoundConfig, SelectionStrategy, StalenessConfig};
use fedshield_core::selection::ClientState;
use fedshield_core::tensor;
use fedshield_core::{
    ClientSelector, Constraint, FedResult, FederationConfig, FederationError, FederationEvent, GlobalModel, ModelUpdate, ProofWitness, RoundCoordinator, RoundState, RoundTicket,
    SubmissionReceipt, Tensor, TrainingMetrics,
};
use tokio::sync::broadcast;

fn config(min_clients: usize, cohort_size: usize) -> FederationConfig {
    let mut cfg = FederationConfig {
        round: RoundConfig { min_clients, cohort_size, round_timeout_ms: 60_000, min_updates_on_timeout: 2 },
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
        staleness: StalenessConfig { max_staleness: 2, hard_max_staleness: 5, adaptive: false, latency_samples: 3 },
        ..FederationConfig::default()
    };
    cfg.compression.mode = CompressionMode::None;
    cfg.selection.strategy = SelectionStrategy::Reputation;
    cfg
}

fn coordinator(cfg: FederationConfig, global: Vec<f32>, clients: &[&str]) -> Arc<RoundCoordinator> {
    let coord = RoundCoordinator::builder(cfg, GlobalModel::new(vec![Tensor::vector(global)]))
        .selector(ClientSelector::with_seed(SelectionStrategy::Reputation, 10, 7))
        .build()
        .unwrap();
    for c in clients {
        coord.register_client(*c, 1.0).unwrap();
    }
    coord
}

fn update(ticket: &RoundTicket, client: &str, weights: Vec<f32>, samples: u64) -> ModelUpdate {
    ModelUpdate {
        client_id: client.into(),
        round_id: ticket.round_id,
        base_version: ticket.base_version,
        layers: vec![Tensor::vector(weights)],
        metrics: TrainingMetrics { loss: 0.4, accuracy: 0.8, sample_count: samples, duration_ms: 120 },
    }
}

/// What a cohort member trains on: the model sealed into its ticket.
async fn opened_model(coord: &RoundCoordinator, ticket: &RoundTicket) -> Vec<Tensor> {
    coord.channel().decrypt(&ticket.sealed_model).await.unwrap()
}

/// Proves the delta of `update` against the ticket's model and submits it.
async fn submit(coord: &RoundCoordinator, ticket: &RoundTicket, update: ModelUpdate) -> FedResult<SubmissionReceipt> {
    let base = opened_model(coord, ticket).await;
    let delta = tensor::delta(&update.layers, &base)?;
    let statement = coord.proof_statement(&update.client_id, update.round_id, update.base_version);
    let proof = coord.proof_gate().generate_proof(&delta, &ProofWitness::for_tensors(&delta), &statement).await?;
    coord.submit_update(update, proof).await
}

fn drain(rx: &mut broadcast::Receiver<FederationEvent>) -> Vec<FederationEvent> {
    let mut events = Vec::new();
    while let Ok(e) = rx.try_recv() {
        events.push(e);
    }
    events
}

#[tokio::test]
async fn too_few_idle_clients_creates_no_round() {
    let coord = coordinator(config(3, 3), vec![0.0], &["a", "b"]);
    let err = coord.start_round().await.unwrap_err();
    assert_eq!(err, FederationError::InsufficientClients { available: 2, required: 3 });
    assert!(coord.active_round().is_none());
    assert!(coord.rounds().is_empty());
    for c in coord.selector().clients() {
        assert_eq!(c.state, ClientState::Idle);
        assert_eq!(c.times_selected, 0);
    }
}

#[tokio::test]
async fn full_cohort_completes_with_weighted_average() {
    let store = Arc::new(InMemoryBlobStore::new());
    let coord = RoundCoordinator::builder(config(2, 2), GlobalModel::new(vec![Tensor::vector(vec![1.0])]))
        .audit_store(store.clone())
        .build()
        .unwrap();
    coord.register_client("a", 1.0).unwrap();
    coord.register_client("b", 2.0).unwrap();
    let mut rx = coord.subscribe();

    let ticket = coord.start_round().await.unwrap();
    assert_eq!(ticket.cohort.len(), 2);
    assert_eq!(ticket.base_version, 0);
    assert_eq!(ticket.batch_sizes.len(), 2);
    let opened = coord.channel().decrypt(&ticket.sealed_model).await.unwrap();
    assert!((opened[0].data[0] - 1.0).abs() < 1e-6);
    assert!(matches!(coord.start_round().await, Err(FederationError::RoundAlreadyActive(id)) if id == ticket.round_id));

    let first = submit(&coord, &ticket, update(&ticket, "a", vec![2.0], 10)).await.unwrap();
    assert_eq!((first.accepted, first.cohort_size), (1, 2));
    assert_eq!(first.round_state, RoundState::InProgress);
    let last = submit(&coord, &ticket, update(&ticket, "b", vec![0.0], 30)).await.unwrap();
    assert_eq!(last.round_state, RoundState::Completed);

    let model = coord.global_model();
    assert_eq!(model.version, ticket.round_id);
    assert!((model.layers[0].data[0] - 0.5).abs() < 1e-4, "got {:?}", model.layers[0].data);

    let round = coord.round(ticket.round_id).unwrap();
    let metrics = round.metrics.unwrap();
    assert_eq!(metrics.participation_rate, 1.0);
    assert_eq!(round.contributors.len(), 2);
    assert!(coord.active_round().is_none());
    assert!(coord.accountant().ledger("a").epsilon > 0.0);
    assert!(coord.accountant().ledger("a").epsilon <= 10.0);
    assert_eq!(coord.selector().client("a").unwrap().times_contributed, 1);
    assert_eq!(coord.selector().client("b").unwrap().state, ClientState::Idle);

    let events = drain(&mut rx);
    assert!(matches!(events.first(), Some(FederationEvent::RoundStarted { .. })));
    assert_eq!(events.iter().filter(|e| matches!(e, FederationEvent::UpdateReceived { .. })).count(), 2);
    assert!(matches!(events.last(), Some(FederationEvent::RoundCompleted { round_id, .. }) if *round_id == ticket.round_id));
    assert_eq!(store.list().await.unwrap().len(), 1);

    // the next round trains on the new model
    let next = coord.start_round().await.unwrap();
    assert_eq!(next.base_version, ticket.round_id);
}

#[tokio::test]
async fn outsiders_duplicates_and_wrong_rounds_are_rejected() {
    let coord = coordinator(config(2, 3), vec![0.0], &["a", "b", "c"]);
    let ticket = coord.start_round().await.unwrap();

    let outsider = submit(&coord, &ticket, update(&ticket, "mallory", vec![0.5], 5)).await;
    assert_eq!(outsider.unwrap_err(), FederationError::ClientNotSelected("mallory".into()));

    let mut wrong = update(&ticket, "a", vec![0.5], 5);
    wrong.round_id += 1;
    assert_eq!(submit(&coord, &ticket, wrong).await.unwrap_err(), FederationError::NoActiveRound);

    submit(&coord, &ticket, update(&ticket, "a", vec![0.5], 5)).await.unwrap();
    let again = submit(&coord, &ticket, update(&ticket, "a", vec![0.25], 5)).await;
    assert_eq!(again.unwrap_err(), FederationError::DuplicateUpdate("a".into()));
    let round = coord.active_round().unwrap();
    assert_eq!(round.updates.len(), 1);
    assert_eq!(round.state, RoundState::InProgress);
}

#[tokio::test]
async fn stale_update_leaves_round_untouched() {
    let cfg = config(1, 1);
    let model = GlobalModel { version: 6, layers: vec![Tensor::vector(vec![0.0])], updated_at: 0 };
    let coord = RoundCoordinator::builder(cfg, model).build().unwrap();
    coord.register_client("slow", 1.0).unwrap();
    let ticket = coord.start_round().await.unwrap();
    assert_eq!(ticket.round_id, 7);

    let mut stale = update(&ticket, "slow", vec![0.5], 5);
    stale.base_version = 1;
    let err = submit(&coord, &ticket, stale).await.unwrap_err();
    assert_eq!(err, FederationError::StaleUpdate { staleness: 5, allowed: 2 });
    assert!(coord.active_round().unwrap().updates.is_empty());
    assert_eq!(coord.accountant().ledger("slow").epsilon, 0.0);
}

#[tokio::test]
async fn misbound_proof_is_rejected() {
    let coord = coordinator(config(2, 2), vec![0.0], &["a", "b"]);
    let ticket = coord.start_round().await.unwrap();
    let honest = vec![Tensor::vector(vec![0.5])];
    let statement = coord.proof_statement("a", ticket.round_id, ticket.base_version);
    let proof = coord.proof_gate().generate_proof(&honest, &ProofWitness::for_tensors(&honest), &statement).await.unwrap();

    let err = coord.submit_update(update(&ticket, "a", vec![3.5], 5), proof).await.unwrap_err();
    assert!(matches!(err, FederationError::InvalidProof(_)), "{err:?}");
    assert!(coord.active_round().unwrap().updates.is_empty());
    assert_eq!(coord.selector().client("a").unwrap().times_contributed, 0);
    assert_eq!(coord.accountant().ledger("a").epsilon, 0.0);
}

#[tokio::test]
async fn exhausted_budget_rejects_update_and_keeps_ledger() {
    let mut cfg = config(2, 2);
    cfg.privacy.epsilon = 0.6;
    let coord = coordinator(cfg, vec![0.0], &["a", "b"]);
    let mut rx = coord.subscribe();

    let first = coord.start_round().await.unwrap();
    submit(&coord, &first, update(&first, "a", vec![0.5], 10)).await.unwrap();
    submit(&coord, &first, update(&first, "b", vec![-0.5], 10)).await.unwrap();
    let spent = coord.accountant().ledger("a").epsilon;
    assert!(spent > 0.0 && spent <= 0.6);

    let second = coord.start_round().await.unwrap();
    let err = submit(&coord, &second, update(&second, "a", vec![0.5], 10)).await.unwrap_err();
    assert_eq!(err, FederationError::PrivacyBudgetExceeded("a".into()));
    assert_eq!(coord.accountant().ledger("a").epsilon, spent);
    assert!(drain(&mut rx).iter().any(|e| matches!(e, FederationEvent::PrivacyBudgetExceeded { client_id } if client_id == "a")));
}

#[tokio::test]
async fn timer_fails_an_empty_round() {
    let mut cfg = config(2, 2);
    cfg.round.round_timeout_ms = 50;
    let coord = coordinator(cfg, vec![0.0], &["a", "b"]);
    let mut rx = coord.subscribe();
    let ticket = coord.start_round().await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let round = coord.round(ticket.round_id).unwrap();
    assert_eq!(round.state, RoundState::Failed);
    assert!(round.failure.is_some());
    assert!(coord.active_round().is_none());
    assert_eq!(coord.global_model().version, 0);

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(e, FederationEvent::RoundTimeout { .. })));
    assert!(events.iter().any(|e| matches!(e, FederationEvent::RoundFailed { .. })));

    let late = coord.submit_update(update(&ticket, "a", vec![0.5], 5), dummy_proof(&coord, &ticket).await).await;
    assert_eq!(late.unwrap_err(), FederationError::NoActiveRound);
    assert!(coord.selector().clients().iter().all(|c| c.state == ClientState::Idle));
    coord.start_round().await.unwrap();
}

async fn dummy_proof(coord: &RoundCoordinator, ticket: &RoundTicket) -> fedshield_core::Proof {
    let delta = vec![Tensor::vector(vec![0.5])];
    let statement = coord.proof_statement("a", ticket.round_id, ticket.base_version);
    coord.proof_gate().generate_proof(&delta, &ProofWitness::for_tensors(&delta), &statement).await.unwrap()
}

#[tokio::test]
async fn timer_aggregates_a_partial_cohort() {
    let mut cfg = config(2, 3);
    cfg.round.round_timeout_ms = 2_000;
    let coord = coordinator(cfg, vec![0.0], &["a", "b", "c"]);
    let mut rx = coord.subscribe();
    let ticket = coord.start_round().await.unwrap();
    submit(&coord, &ticket, update(&ticket, "a", vec![1.0], 10)).await.unwrap();
    submit(&coord, &ticket, update(&ticket, "b", vec![-1.0], 10)).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(FederationEvent::RoundCompleted { round_id, metrics }) if round_id == ticket.round_id => return Some(metrics),
                Ok(FederationEvent::RoundFailed { round_id, .. }) if round_id == ticket.round_id => return None,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .expect("round timer never fired");
    let metrics = outcome.expect("partial cohort should aggregate");
    assert_eq!((metrics.accepted, metrics.selected), (2, 3));
    assert_eq!(coord.global_model().version, ticket.round_id);
    assert!(coord.global_model().layers[0].data[0].abs() < 1e-4);
    assert_eq!(coord.selector().client("c").unwrap().state, ClientState::Idle);
}

#[tokio::test]
async fn abort_marks_the_round_failed() {
    let coord = coordinator(config(2, 2), vec![0.0], &["a", "b"]);
    let ticket = coord.start_round().await.unwrap();
    assert_eq!(coord.abort_round("operator shutdown").await.unwrap(), ticket.round_id);
    let round = coord.round(ticket.round_id).unwrap();
    assert_eq!(round.state, RoundState::Failed);
    assert_eq!(round.failure.as_deref(), Some("operator shutdown"));
    assert_eq!(coord.abort_round("again").await.unwrap_err(), FederationError::NoActiveRound);
}

#[tokio::test]
async fn individual_strategy_opens_each_update() {
    let mut cfg = config(2, 2);
    cfg.aggregation = AggregationConfig { strategy: AggregationKind::FedMa, ..AggregationConfig::default() };
    let coord = coordinator(cfg, vec![1.0], &["a", "b"]);
    let ticket = coord.start_round().await.unwrap();
    submit(&coord, &ticket, update(&ticket, "a", vec![2.0], 10)).await.unwrap();
    let receipt = submit(&coord, &ticket, update(&ticket, "b", vec![0.0], 30)).await.unwrap();
    assert_eq!(receipt.round_state, RoundState::Completed);
    assert!((coord.global_model().layers[0].data[0] - 0.5).abs() < 1e-4);
}

#[tokio::test]
async fn ticket_model_is_the_base_across_rounds() {
    for kind in [AggregationKind::FedAvg, AggregationKind::FedDyn, AggregationKind::Scaffold] {
        let mut cfg = config(2, 2);
        cfg.aggregation = AggregationConfig { strategy: kind, ..AggregationConfig::default() };
        // not representable at the channel precision
        let coord = coordinator(cfg, vec![0.123_456, -0.333_3], &["a", "b"]);
        for round in 1..=3u64 {
            let ticket = coord.start_round().await.unwrap();
            let base = opened_model(&coord, &ticket).await;
            let step_a = base[0].add(&Tensor::vector(vec![0.013, -0.029]));
            let step_b = base[0].add(&Tensor::vector(vec![-0.007, 0.041]));
            submit(&coord, &ticket, update(&ticket, "a", step_a.data.clone(), 12)).await.unwrap_or_else(|e| panic!("{kind:?} round {round}: {e}"));
            let receipt = submit(&coord, &ticket, update(&ticket, "b", step_b.data.clone(), 12)).await.unwrap_or_else(|e| panic!("{kind:?} round {round}: {e}"));
            assert_eq!(receipt.round_state, RoundState::Completed, "{kind:?} round {round}");
            assert_eq!(coord.global_model().version, ticket.round_id);
        }
        assert_eq!(coord.rounds().len(), 3);
    }
}

#[tokio::test]
async fn small_contributor_keeps_its_sample_share() {
    let coord = coordinator(config(2, 2), vec![1.0], &["tiny", "bulk"]);
    let ticket = coord.start_round().await.unwrap();
    submit(&coord, &ticket, update(&ticket, "tiny", vec![3.0], 1)).await.unwrap();
    let receipt = submit(&coord, &ticket, update(&ticket, "bulk", vec![1.0], 10_000)).await.unwrap();
    assert_eq!(receipt.round_state, RoundState::Completed);
    let value = coord.global_model().layers[0].data[0];
    // 1 + 2 * 1 / 10_001
    assert!((value - 1.000_2).abs() < 1e-5, "got {value}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_complete_the_round_once() {
    let clients = ["a", "b", "c", "d"];
    let coord = coordinator(config(4, 4), vec![0.0], &clients);
    let mut rx = coord.subscribe();
    let ticket = coord.start_round().await.unwrap();

    let mut tasks = Vec::new();
    for (i, c) in clients.iter().enumerate() {
        let coord = coord.clone();
        let ticket = ticket.clone();
        let client = c.to_string();
        tasks.push(tokio::spawn(async move {
            let weights = vec![0.25 * (i as f32 + 1.0)];
            submit(&coord, &ticket, update(&ticket, &client, weights, 10)).await
        }));
    }
    // a second copy from "a" racing the rest
    let duplicate = {
        let coord = coord.clone();
        let ticket = ticket.clone();
        tokio::spawn(async move { submit(&coord, &ticket, update(&ticket, "a", vec![0.75], 10)).await })
    };

    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    for task in tasks.into_iter().chain(std::iter::once(duplicate)) {
        match task.await.unwrap() {
            Ok(receipt) => accepted.push(receipt),
            Err(e) => rejected.push(e),
        }
    }
    assert_eq!(accepted.len(), 4, "rejected: {rejected:?}");
    assert_eq!(rejected.len(), 1);
    assert!(matches!(rejected[0], FederationError::DuplicateUpdate(_) | FederationError::NoActiveRound), "{:?}", rejected[0]);
    let mut counts: Vec<usize> = accepted.iter().map(|r| r.accepted).collect();
    counts.sort_unstable();
    assert_eq!(counts, vec![1, 2, 3, 4]);

    let round = coord.round(ticket.round_id).unwrap();
    assert_eq!(round.state, RoundState::Completed);
    assert_eq!(round.contributors.len(), 4);
    assert_eq!(coord.global_model().version, ticket.round_id);
    assert!(coord.active_round().is_none());
    assert_eq!(coord.rounds().len(), 1);
    for c in clients {
        let client = coord.selector().client(c).unwrap();
        assert_eq!((client.times_selected, client.times_contributed), (1, 1), "{c}");
        assert_eq!(client.state, ClientState::Idle);
    }
    let completions = drain(&mut rx).into_iter().filter(|e| matches!(e, FederationEvent::RoundCompleted { .. })).count();
    assert_eq!(completions, 1);
}

//! FedShield core: a privacy-preserving federated learning coordinator.
//!
//! A [`RoundCoordinator`] selects a cohort of clients, distributes the sealed
//! global model, and admits client updates through a pipeline of staleness
//! and compression ([`UpdateOptimizer`]), differential privacy
//! ([`BudgetAccountant`], [`NoiseMechanism`]), zero-knowledge constraint
//! proofs ([`ProofGate`]) and additively homomorphic sealing
//! ([`SecureChannel`]). Accepted updates are combined by an
//! [`AggregationEngine`] into the next global model.

use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub mod aggregation;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod events;
pub mod federated_learning;
pub mod metrics_ext;
pub mod model;
pub mod optimizer;
pub mod privacy;
pub mod proof;
pub mod secure_channel;
pub mod selection;
pub mod tensor;

pub use aggregation::{Aggregate, AggregationEngine, AggregationInput, AggregationStrategy, Contribution, StrategyState, WeightedSum};
pub use collaborators::{BlobStore, InMemoryBlobStore};
pub use config::{load_config, load_config_from, FederationConfig};
pub use error::{FedResult, FederationError};
pub use events::{EventBus, FederationEvent};
pub use federated_learning::{CoordinatorBuilder, RoundCoordinator, RoundTicket, SubmissionReceipt};
pub use metrics_ext::FED_METRICS;
pub use model::{ClientId, GlobalModel, ModelUpdate, ModelVersion, Round, RoundId, RoundMetrics, RoundRecord, RoundState, TrainingMetrics};
pub use optimizer::UpdateOptimizer;
pub use privacy::{BudgetAccountant, NoiseMechanism, PrivacyLedgerEntry};
pub use proof::{Constraint, PedersenProofGate, Proof, ProofGate, ProofStatement, ProofWitness};
pub use secure_channel::{RistrettoChannel, SealedTensors, SecureChannel};
pub use selection::{ClientSelector, PerformanceSample};
pub use tensor::Tensor;

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Installs the global subscriber once. `RUST_LOG` drives filtering;
/// `FEDSHIELD_JSON_LOG=1` switches to flattened JSON lines.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("FEDSHIELD_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(env_filter);
        if json {
            registry
                .with(tracing_subscriber::fmt::layer().json().flatten_event(true).with_current_span(true).with_span_list(false))
                .try_init()?;
        } else {
            registry
                .with(tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(false).with_line_number(true))
                .try_init()?;
        }
        Ok(())
    })?;
    info!(service, "tracing_initialized");
    Ok(())
}

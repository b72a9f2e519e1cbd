//! Update admission proofs.
//!
//! A client commits to every element of its delta with a Pedersen commitment
//! and proves, non-interactively over a Merlin transcript, that
//!
//! 1. the commitments open to the delta it submitted (binding iteration), and
//! 2. each declared [`Constraint`] holds for the committed values.
//!
//! Every challenge is squeezed from the transcript after absorbing the
//! statement, the metadata, all commitments and every earlier move.

mod gate;
mod product;
mod range;
mod wire;

use async_trait::async_trait;
use curve25519_dalek::scalar::Scalar;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ProofConfig;
use crate::error::{FedResult, FederationError};
use crate::model::{ClientId, ModelVersion, RoundId};
use crate::tensor::Tensor;

pub use gate::PedersenProofGate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Constraint {
    /// Every element lies in `[min, max]`.
    Range { min: f64, max: f64 },
    /// Global L2 norm of the delta is at most `max_l2`.
    Norm { max_l2: f64 },
    /// Every element satisfies `|x| <= max_abs`.
    Magnitude { max_abs: f64 },
}

impl Constraint {
    pub fn validate(&self) -> FedResult<()> {
        let ok = match self {
            Constraint::Range { min, max } => min.is_finite() && max.is_finite() && min <= max,
            Constraint::Norm { max_l2 } => max_l2.is_finite() && *max_l2 > 0.0,
            Constraint::Magnitude { max_abs } => max_abs.is_finite() && *max_abs > 0.0,
        };
        if ok {
            Ok(())
        } else {
            Err(FederationError::Config(format!("invalid proof constraint {self:?}")))
        }
    }
}

/// Public claim a proof is checked against. Built by the coordinator from its
/// own configuration so the prover cannot pick weaker constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofStatement {
    pub prover: ClientId,
    pub round_id: RoundId,
    pub base_version: ModelVersion,
    pub layer_shapes: Vec<Vec<usize>>,
    pub constraints: Vec<Constraint>,
    /// Fixed-point scale `2^precision_bits` applied before committing.
    pub precision_bits: u32,
}

impl ProofStatement {
    pub fn from_config(cfg: &ProofConfig, prover: impl Into<ClientId>, round_id: RoundId, base_version: ModelVersion, layer_shapes: Vec<Vec<usize>>) -> Self {
        Self {
            prover: prover.into(),
            round_id,
            base_version,
            layer_shapes,
            constraints: cfg.constraints.clone(),
            precision_bits: cfg.precision_bits,
        }
    }

    pub fn element_count(&self) -> usize {
        self.layer_shapes.iter().map(|s| s.iter().product::<usize>()).sum()
    }
}

/// Commitment blindings, one per delta element. Never leaves the client.
#[derive(Clone)]
pub struct ProofWitness {
    blindings: Vec<Scalar>,
}

impl ProofWitness {
    pub fn random(elements: usize) -> Self {
        Self { blindings: (0..elements).map(|_| Scalar::random(&mut OsRng)).collect() }
    }

    pub fn for_tensors(tensors: &[Tensor]) -> Self {
        Self::random(tensors.iter().map(Tensor::len).sum())
    }

    pub fn len(&self) -> usize {
        self.blindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blindings.is_empty()
    }

    pub(crate) fn blindings(&self) -> &[Scalar] {
        &self.blindings
    }
}

impl std::fmt::Debug for ProofWitness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProofWitness").field("blindings", &self.blindings.len()).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofMetadata {
    pub proof_id: Uuid,
    pub timestamp_ms: i64,
    pub prover: ClientId,
    /// Size reported by the prover; verifiers measure it themselves.
    pub serialized_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proof {
    /// Element commitments followed by one block of square commitments per
    /// norm constraint.
    pub commitments: Vec<[u8; 32]>,
    /// One challenge per iteration: binding first, then one per constraint.
    pub challenges: Vec<[u8; 32]>,
    pub responses: Vec<Vec<u8>>,
    pub metadata: ProofMetadata,
}

impl Proof {
    pub fn encoded_len(&self) -> FedResult<usize> {
        serde_json::to_vec(self)
            .map(|v| v.len())
            .map_err(|e| FederationError::InvalidProof(format!("proof does not serialize: {e}")))
    }
}

#[async_trait]
pub trait ProofGate: Send + Sync {
    async fn generate_proof(&self, delta: &[Tensor], witness: &ProofWitness, statement: &ProofStatement) -> FedResult<Proof>;

    /// Size, freshness, prover, transcript and constraint checks.
    async fn verify_proof(&self, proof: &Proof, statement: &ProofStatement) -> FedResult<()>;

    /// Checks that the proof's commitments open to `delta`.
    async fn verify_binding(&self, proof: &Proof, statement: &ProofStatement, delta: &[Tensor]) -> FedResult<()>;
}

/// Fixed-point encoding shared by prover and verifier.
pub(crate) fn quantize(v: f64, precision_bits: u32) -> FedResult<i128> {
    let q = (v * 2f64.powi(precision_bits as i32)).round();
    if !q.is_finite() || q.abs() >= 2f64.powi(62) {
        return Err(FederationError::ConstraintViolated(format!("value {v} cannot be encoded at {precision_bits} bits")));
    }
    Ok(q as i128)
}

use async_trait::async_trait;
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use merlin::Transcript;
use rand::rngs::OsRng;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use tracing::debug;
use uuid::Uuid;

use super::product::{self, SquareResponse};
use super::range::{int_scalar, prove_bounds, prove_values, verify_bounds, verify_values, Bounds, GENERATORS};
use super::wire::{self, malformed, Reader, Writer};
use super::{quantize, Constraint, Proof, ProofGate, ProofMetadata, ProofStatement, ProofWitness};
use crate::config::ProofConfig;
use crate::error::{FedResult, FederationError};
use crate::tensor::{shapes_of, Tensor};

const DOMAIN: &[u8] = b"fedshield-proof-gate-v1";

/// Pedersen/Bulletproofs implementation of [`ProofGate`]. Holds no secrets;
/// the same instance serves provers and the coordinator.
pub struct PedersenProofGate {
    freshness_ms: i64,
    max_proof_bytes: usize,
}

enum Plan {
    Bounds(Bounds),
    Norm { bound_q: u64, bounds: Bounds },
}

impl Plan {
    fn new(constraint: &Constraint, precision_bits: u32, elements: usize) -> FedResult<Self> {
        constraint.validate()?;
        let q = |v: f64| quantize(v, precision_bits).map_err(|e| FederationError::Config(e.to_string()));
        Ok(match constraint {
            Constraint::Range { min, max } => Plan::Bounds(Bounds::new(q(*min)?, q(*max)?)?),
            Constraint::Magnitude { max_abs } => {
                let m = q(*max_abs)?;
                Plan::Bounds(Bounds::new(-m, m)?)
            }
            Constraint::Norm { max_l2 } => {
                // covers the rounding slack of up to 0.5 per element
                let bq = (max_l2 * 2f64.powi(precision_bits as i32) + 0.5 * (elements as f64).sqrt()).ceil();
                if !(bq >= 0.0 && bq < 2f64.powi(32)) {
                    return Err(FederationError::Config(format!("norm bound {max_l2} is too large at {precision_bits} bits")));
                }
                let bound_q = bq as u64;
                Plan::Norm { bound_q, bounds: Bounds::new(-(bound_q as i128), bound_q as i128)? }
            }
        })
    }

    /// Prover-side evaluation on the quantized delta.
    fn check(&self, xs: &[i128]) -> FedResult<()> {
        let bounds = match self {
            Plan::Bounds(b) => b,
            Plan::Norm { bounds, .. } => bounds,
        };
        if let Some(j) = xs.iter().position(|x| !bounds.contains(*x)) {
            return Err(FederationError::ConstraintViolated(format!("element {j} lies outside the permitted interval")));
        }
        if let Plan::Norm { bound_q, .. } = self {
            let sum: u128 = xs.iter().map(|x| (x * x) as u128).sum();
            if sum > (*bound_q as u128).pow(2) {
                return Err(FederationError::ConstraintViolated("delta exceeds the L2 norm bound".into()));
            }
        }
        Ok(())
    }
}

struct Layout {
    elements: usize,
    plans: Vec<Plan>,
}

impl Layout {
    fn new(statement: &ProofStatement) -> FedResult<Self> {
        let elements = statement.element_count();
        if elements == 0 {
            return Err(malformed("statement covers no elements"));
        }
        let plans = statement
            .constraints
            .iter()
            .map(|c| Plan::new(c, statement.precision_bits, elements))
            .collect::<FedResult<Vec<_>>>()?;
        Ok(Self { elements, plans })
    }

    fn norm_count(&self) -> usize {
        self.plans.iter().filter(|p| matches!(p, Plan::Norm { .. })).count()
    }

    fn commitment_count(&self) -> usize {
        self.elements * (1 + self.norm_count())
    }

    fn iterations(&self) -> usize {
        1 + self.plans.len()
    }

    /// Byte length of the announcement prefix of a norm response.
    fn norm_announcement_len(&self, response: &[u8]) -> FedResult<usize> {
        let mut r = Reader::new(response);
        if r.u32()? as usize != self.elements {
            return Err(malformed("norm response covers the wrong number of elements"));
        }
        r.skip(self.elements * 64)?;
        Ok(r.position())
    }
}

fn open_transcript(statement: &ProofStatement, metadata: &ProofMetadata, commitments: &[[u8; 32]]) -> FedResult<Transcript> {
    let encoded = serde_json::to_vec(statement).map_err(|e| malformed(format!("statement does not serialize: {e}")))?;
    let mut t = Transcript::new(DOMAIN);
    t.append_message(b"statement", &encoded);
    t.append_message(b"proof-id", metadata.proof_id.as_bytes());
    t.append_u64(b"timestamp", metadata.timestamp_ms as u64);
    t.append_message(b"prover", metadata.prover.as_bytes());
    t.append_u64(b"commitment-count", commitments.len() as u64);
    for c in commitments {
        t.append_message(b"commitment", c);
    }
    Ok(t)
}

fn challenge(t: &mut Transcript) -> Scalar {
    let mut buf = [0u8; 64];
    t.challenge_bytes(b"challenge", &mut buf);
    Scalar::from_bytes_mod_order_wide(&buf)
}

/// Random linear-combination weights for the binding iteration.
fn binding_weights(t: &mut Transcript, n: usize) -> Vec<Scalar> {
    let mut seed = [0u8; 32];
    t.challenge_bytes(b"binding-weights", &mut seed);
    (0..n)
        .map(|j| Scalar::from_hash(Sha512::new().chain_update(seed).chain_update((j as u64).to_le_bytes())))
        .collect()
}

fn quantize_delta(delta: &[Tensor], precision_bits: u32) -> FedResult<Vec<i128>> {
    delta.iter().flat_map(|t| t.data.iter()).map(|v| quantize(*v as f64, precision_bits)).collect()
}

struct Replay {
    weights: Vec<Scalar>,
    challenges: Vec<Scalar>,
}

enum Iteration {
    Bounds(Vec<bulletproofs::RangeProof>),
    Norm { products: Vec<SquareResponse>, bounds: Vec<bulletproofs::RangeProof>, sum: Vec<bulletproofs::RangeProof> },
}

struct Decoded {
    points: Vec<RistrettoPoint>,
    iterations: Vec<Iteration>,
}

impl PedersenProofGate {
    pub fn new(cfg: &ProofConfig) -> Self {
        Self { freshness_ms: cfg.freshness_ms, max_proof_bytes: cfg.max_proof_bytes }
    }

    /// Re-derives every challenge from the transcript and compares it with
    /// the stored one.
    fn replay(&self, proof: &Proof, statement: &ProofStatement, layout: &Layout) -> FedResult<Replay> {
        if proof.commitments.len() != layout.commitment_count() {
            return Err(malformed(format!("expected {} commitments, got {}", layout.commitment_count(), proof.commitments.len())));
        }
        if proof.challenges.len() != layout.iterations() || proof.responses.len() != layout.iterations() {
            return Err(malformed(format!("expected {} challenge/response pairs", layout.iterations())));
        }
        let mut t = open_transcript(statement, &proof.metadata, &proof.commitments)?;
        let weights = binding_weights(&mut t, layout.elements);
        let mut challenges = Vec::with_capacity(layout.iterations());
        for (i, response) in proof.responses.iter().enumerate() {
            let announced = match i {
                0 if response.len() == 64 => 32,
                0 => return Err(malformed("binding response must be 64 bytes")),
                _ => match layout.plans[i - 1] {
                    Plan::Bounds(_) => 0,
                    Plan::Norm { .. } => layout.norm_announcement_len(response)?,
                },
            };
            if announced > 0 {
                t.append_message(b"announcement", &response[..announced]);
            }
            let e = challenge(&mut t);
            if !bool::from(e.as_bytes()[..].ct_eq(&proof.challenges[i][..])) {
                return Err(malformed(format!("challenge {i} does not match the transcript")));
            }
            t.append_message(b"response", response);
            challenges.push(e);
        }
        Ok(Replay { weights, challenges })
    }

    /// Parses every commitment and response into group elements.
    fn decode(&self, proof: &Proof, layout: &Layout) -> FedResult<Decoded> {
        let points = proof.commitments.iter().map(|c| wire::point(c)).collect::<FedResult<Vec<_>>>()?;
        wire::point(&proof.responses[0][..32])?;
        wire::scalar(&proof.responses[0][32..])?;
        let mut iterations = Vec::with_capacity(layout.plans.len());
        for (plan, response) in layout.plans.iter().zip(&proof.responses[1..]) {
            let mut r = Reader::new(response);
            let it = match plan {
                Plan::Bounds(_) => Iteration::Bounds(r.proofs()?),
                Plan::Norm { .. } => {
                    r.u32()?;
                    let mut announcements = Vec::with_capacity(layout.elements);
                    for _ in 0..layout.elements {
                        announcements.push((r.point()?, r.point()?));
                    }
                    let mut products = Vec::with_capacity(layout.elements);
                    for (a1, a2) in announcements {
                        products.push(SquareResponse { a1, a2, z_x: r.scalar()?, z_r: r.scalar()?, z_t: r.scalar()? });
                    }
                    Iteration::Norm { products, bounds: r.proofs()?, sum: r.proofs()? }
                }
            };
            r.finish()?;
            iterations.push(it);
        }
        Ok(Decoded { points, iterations })
    }

    fn evaluate(&self, decoded: &Decoded, layout: &Layout, replay: &Replay) -> FedResult<()> {
        let pc = &GENERATORS.pc;
        let n = layout.elements;
        let elements = &decoded.points[..n];
        let mut squares = decoded.points[n..].chunks(n);
        for (i, (plan, it)) in layout.plans.iter().zip(&decoded.iterations).enumerate() {
            let e = &replay.challenges[i + 1];
            let seed = e.to_bytes();
            match (plan, it) {
                (Plan::Bounds(b), Iteration::Bounds(proofs)) => verify_bounds(&seed, b"bounds", elements, b, proofs)?,
                (Plan::Norm { bound_q, bounds }, Iteration::Norm { products, bounds: bound_proofs, sum }) => {
                    let block = squares.next().ok_or_else(|| malformed("missing square commitments"))?;
                    for (j, ((c, s), resp)) in elements.iter().zip(block).zip(products).enumerate() {
                        if !product::verify(pc, c, s, resp, e) {
                            return Err(malformed(format!("square relation fails at element {j}")));
                        }
                    }
                    verify_bounds(&seed, b"norm-bounds", elements, bounds, bound_proofs)?;
                    let total: RistrettoPoint = block.iter().sum();
                    let slack = pc.B * Scalar::from((*bound_q as u128).pow(2)) - total;
                    verify_values(&seed, b"norm-sum", &[slack], 64, sum)?;
                }
                _ => return Err(malformed(format!("iteration {} does not match its constraint", i + 1))),
            }
        }
        Ok(())
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl ProofGate for PedersenProofGate {
    async fn generate_proof(&self, delta: &[Tensor], witness: &ProofWitness, statement: &ProofStatement) -> FedResult<Proof> {
        if shapes_of(delta) != statement.layer_shapes {
            return Err(FederationError::InvalidUpdateShape("delta does not match the statement's layer shapes".into()));
        }
        let layout = Layout::new(statement)?;
        let n = layout.elements;
        let rs = witness.blindings();
        if rs.len() != n {
            return Err(malformed(format!("witness holds {} blindings for {n} elements", rs.len())));
        }
        let xs = quantize_delta(delta, statement.precision_bits)?;
        for plan in &layout.plans {
            plan.check(&xs)?;
        }

        let pc = &GENERATORS.pc;
        let x_scalars: Vec<Scalar> = xs.iter().map(|x| int_scalar(*x)).collect();
        let mut points: Vec<RistrettoPoint> = x_scalars.iter().zip(rs).map(|(x, r)| pc.commit(*x, *r)).collect();
        let mut square_blindings = Vec::with_capacity(layout.norm_count());
        for _ in 0..layout.norm_count() {
            let ts: Vec<Scalar> = (0..n).map(|_| Scalar::random(&mut OsRng)).collect();
            points.extend(xs.iter().zip(&ts).map(|(x, t)| pc.commit(Scalar::from((x * x) as u128), *t)));
            square_blindings.push(ts);
        }
        let commitments: Vec<[u8; 32]> = points.iter().map(|p| p.compress().to_bytes()).collect();
        let metadata = ProofMetadata { proof_id: Uuid::new_v4(), timestamp_ms: now_ms(), prover: statement.prover.clone(), serialized_size: 0 };

        let mut t = open_transcript(statement, &metadata, &commitments)?;
        let mut challenges = Vec::with_capacity(layout.iterations());
        let mut responses = Vec::with_capacity(layout.iterations());

        let weights = binding_weights(&mut t, n);
        let w: Scalar = weights.iter().zip(rs).map(|(rho, r)| rho * r).sum();
        let k = Scalar::random(&mut OsRng);
        let announcement = pc.B_blinding * k;
        let mut out = Writer::new();
        out.point(&announcement);
        let binding = out.into_inner();
        t.append_message(b"announcement", &binding);
        let e0 = challenge(&mut t);
        let mut out = Writer::from_bytes(binding);
        out.scalar(&(k + e0 * w));
        let binding = out.into_inner();
        t.append_message(b"response", &binding);
        challenges.push(e0.to_bytes());
        responses.push(binding);

        let mut square_blindings = square_blindings.iter();
        for plan in &layout.plans {
            let response = match plan {
                Plan::Bounds(bounds) => {
                    let e = challenge(&mut t);
                    challenges.push(e.to_bytes());
                    let mut out = Writer::new();
                    out.proofs(&prove_bounds(&e.to_bytes(), b"bounds", &xs, rs, bounds)?);
                    out.into_inner()
                }
                Plan::Norm { bound_q, bounds } => {
                    let ts = square_blindings.next().ok_or_else(|| malformed("missing square blindings"))?;
                    let mut out = Writer::new();
                    out.u32(n as u32);
                    let mut nonces = Vec::with_capacity(n);
                    for c in &points[..n] {
                        let (nonce, a1, a2) = product::announce(pc, c);
                        out.point(&a1);
                        out.point(&a2);
                        nonces.push(nonce);
                    }
                    let announced = out.into_inner();
                    t.append_message(b"announcement", &announced);
                    let e = challenge(&mut t);
                    challenges.push(e.to_bytes());

                    let mut out = Writer::from_bytes(announced);
                    for (j, nonce) in nonces.iter().enumerate() {
                        let t_prime = ts[j] - x_scalars[j] * rs[j];
                        let (z_x, z_r, z_t) = nonce.respond(&e, &x_scalars[j], &rs[j], &t_prime);
                        out.scalar(&z_x);
                        out.scalar(&z_r);
                        out.scalar(&z_t);
                    }
                    out.proofs(&prove_bounds(&e.to_bytes(), b"norm-bounds", &xs, rs, bounds)?);
                    let sum_sq: u128 = xs.iter().map(|x| (x * x) as u128).sum();
                    let slack = ((*bound_q as u128).pow(2) - sum_sq) as u64;
                    let blinding = -ts.iter().sum::<Scalar>();
                    out.proofs(&prove_values(&e.to_bytes(), b"norm-sum", &[slack], &[blinding], 64)?);
                    out.into_inner()
                }
            };
            t.append_message(b"response", &response);
            responses.push(response);
        }

        let mut proof = Proof { commitments, challenges, responses, metadata };
        proof.metadata.serialized_size = proof.encoded_len()?;
        debug!(prover = %statement.prover, round_id = statement.round_id, elements = n, bytes = proof.metadata.serialized_size, "proof_generated");
        Ok(proof)
    }

    async fn verify_proof(&self, proof: &Proof, statement: &ProofStatement) -> FedResult<()> {
        let size = proof.encoded_len()?;
        if size > self.max_proof_bytes {
            return Err(FederationError::ProofTooLarge { size, cap: self.max_proof_bytes });
        }
        let age_ms = now_ms() - proof.metadata.timestamp_ms;
        if age_ms.abs() > self.freshness_ms {
            return Err(FederationError::ProofStale { age_ms, window_ms: self.freshness_ms });
        }
        if proof.metadata.prover != statement.prover {
            return Err(malformed("proof was generated for a different prover"));
        }
        let layout = Layout::new(statement)?;
        let replay = self.replay(proof, statement, &layout)?;
        let decoded = self.decode(proof, &layout)?;
        self.evaluate(&decoded, &layout, &replay)
    }

    async fn verify_binding(&self, proof: &Proof, statement: &ProofStatement, delta: &[Tensor]) -> FedResult<()> {
        if shapes_of(delta) != statement.layer_shapes {
            return Err(malformed("delta does not match the statement's layer shapes"));
        }
        let layout = Layout::new(statement)?;
        let replay = self.replay(proof, statement, &layout)?;
        let xs = quantize_delta(delta, statement.precision_bits).map_err(|e| malformed(e.to_string()))?;
        let pc = &GENERATORS.pc;
        let mut target = RistrettoPoint::default();
        for ((c, x), rho) in proof.commitments.iter().zip(&xs).zip(&replay.weights) {
            target += (wire::point(c)? - pc.B * int_scalar(*x)) * rho;
        }
        let announcement = wire::point(&proof.responses[0][..32])?;
        let z = wire::scalar(&proof.responses[0][32..])?;
        if pc.B_blinding * z != announcement + target * replay.challenges[0] {
            return Err(malformed("commitments do not open to the submitted delta"));
        }
        Ok(())
    }
}

//! Additively homomorphic sealing of tensor payloads.
//!
//! `RistrettoChannel` is exponential ElGamal over Ristretto255. A plaintext
//! `m` (a fixed-point encoded element) is sealed as `(r·B, m·B + r·P)`, so
//! ciphertexts add componentwise and scale by public integers. Opening
//! recovers `m·B` and solves a bounded discrete log with baby-step/giant-step.

use async_trait::async_trait;
use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use once_cell::sync::OnceCell;
use rand::rngs::{OsRng, StdRng};
use rand::SeedableRng;
use rayon::prelude::*;
use std::collections::HashMap;
use std::ops::Add;
use tracing::debug;

use crate::config::ChannelConfig;
use crate::error::{FedResult, FederationError};
use crate::tensor::{shapes_of, Tensor};

#[async_trait]
pub trait SecureChannel: Send + Sync {
    async fn encrypt(&self, tensors: &[Tensor]) -> FedResult<SealedTensors>;
    async fn decrypt(&self, sealed: &SealedTensors) -> FedResult<Vec<Tensor>>;
    /// Sealed elementwise sum of all inputs.
    async fn homomorphic_sum(&self, sealed: &[SealedTensors]) -> FedResult<SealedTensors>;
    /// Sealed elementwise product with a public integer.
    async fn scale(&self, sealed: &SealedTensors, factor: u64) -> FedResult<SealedTensors>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ciphertext {
    pub ephemeral: RistrettoPoint,
    pub payload: RistrettoPoint,
}

impl Add for Ciphertext {
    type Output = Ciphertext;

    fn add(self, rhs: Ciphertext) -> Ciphertext {
        Ciphertext { ephemeral: self.ephemeral + rhs.ephemeral, payload: self.payload + rhs.payload }
    }
}

impl Ciphertext {
    fn zero() -> Self {
        Self { ephemeral: RistrettoPoint::identity(), payload: RistrettoPoint::identity() }
    }

    fn times(&self, k: &Scalar) -> Self {
        Self { ephemeral: self.ephemeral * k, payload: self.payload * k }
    }
}

/// Sealed form of a tensor list: one ciphertext per element, row-major,
/// layers concatenated.
#[derive(Debug, Clone, PartialEq)]
pub struct SealedTensors {
    pub shapes: Vec<Vec<usize>>,
    pub ciphertexts: Vec<Ciphertext>,
    pub precision_bits: u32,
}

impl SealedTensors {
    pub fn element_count(&self) -> usize {
        self.ciphertexts.len()
    }

    fn compatible_with(&self, other: &SealedTensors) -> bool {
        self.shapes == other.shapes && self.precision_bits == other.precision_bits && self.ciphertexts.len() == other.ciphertexts.len()
    }
}

struct DlogTable {
    baby: HashMap<CompressedRistretto, u64>,
    giant: RistrettoPoint,
}

pub struct RistrettoChannel {
    secret: Scalar,
    public: RistrettoPoint,
    precision_bits: u32,
    table_bits: u32,
    max_plaintext_bits: u32,
    table: OnceCell<DlogTable>,
}

impl RistrettoChannel {
    pub fn new(cfg: &ChannelConfig) -> Self {
        Self::with_secret(cfg, Scalar::random(&mut OsRng))
    }

    /// Deterministic keypair, for simulations and tests.
    pub fn from_seed(cfg: &ChannelConfig, seed: u64) -> Self {
        Self::with_secret(cfg, Scalar::random(&mut StdRng::seed_from_u64(seed)))
    }

    fn with_secret(cfg: &ChannelConfig, secret: Scalar) -> Self {
        Self {
            public: RistrettoPoint::mul_base(&secret),
            secret,
            precision_bits: cfg.precision_bits,
            table_bits: cfg.dlog_table_bits,
            max_plaintext_bits: cfg.max_plaintext_bits,
            table: OnceCell::new(),
        }
    }

    pub fn public_key(&self) -> CompressedRistretto {
        self.public.compress()
    }

    fn encode(&self, v: f32) -> FedResult<i64> {
        let q = (v as f64 * 2f64.powi(self.precision_bits as i32)).round();
        let bound = 2f64.powi(self.max_plaintext_bits as i32);
        if !q.is_finite() || q.abs() > bound {
            return Err(FederationError::Channel(format!("value {v} exceeds the {}-bit plaintext range", self.max_plaintext_bits)));
        }
        Ok(q as i64)
    }

    fn seal_one(&self, m: i64) -> Ciphertext {
        let r = Scalar::random(&mut OsRng);
        Ciphertext {
            ephemeral: RistrettoPoint::mul_base(&r),
            payload: RistrettoPoint::mul_base(&signed_scalar(m)) + self.public * r,
        }
    }

    fn table(&self) -> &DlogTable {
        self.table.get_or_init(|| {
            let size = 1u64 << self.table_bits;
            let mut baby = HashMap::with_capacity(size as usize);
            let mut acc = RistrettoPoint::identity();
            for j in 0..size {
                baby.insert(acc.compress(), j);
                acc += RISTRETTO_BASEPOINT_POINT;
            }
            debug!(entries = size, "dlog_table_built");
            // acc is now size·B
            DlogTable { baby, giant: acc }
        })
    }

    /// Signed discrete log of `point` base B within the plaintext bound.
    fn solve(&self, point: RistrettoPoint) -> Option<i64> {
        let table = self.table();
        let steps = 1u64 << self.max_plaintext_bits.saturating_sub(self.table_bits);
        let step_size = 1u64 << self.table_bits;
        let mut pos = point;
        let mut neg = -point;
        for i in 0..=steps {
            if let Some(j) = table.baby.get(&pos.compress()) {
                return Some((i * step_size + j) as i64);
            }
            if let Some(j) = table.baby.get(&neg.compress()) {
                return Some(-((i * step_size + j) as i64));
            }
            pos -= table.giant;
            neg -= table.giant;
        }
        None
    }

    fn open_one(&self, c: &Ciphertext) -> FedResult<i64> {
        let m = c.payload - c.ephemeral * self.secret;
        self.solve(m).ok_or_else(|| FederationError::Channel("plaintext outside the decodable range".into()))
    }
}

fn signed_scalar(m: i64) -> Scalar {
    if m >= 0 {
        Scalar::from(m as u64)
    } else {
        -Scalar::from(m.unsigned_abs())
    }
}

#[async_trait]
impl SecureChannel for RistrettoChannel {
    async fn encrypt(&self, tensors: &[Tensor]) -> FedResult<SealedTensors> {
        let plain: Vec<f32> = tensors.iter().flat_map(|t| t.data.iter().copied()).collect();
        let encoded = plain.iter().map(|v| self.encode(*v)).collect::<FedResult<Vec<i64>>>()?;
        let ciphertexts = encoded.par_iter().map(|m| self.seal_one(*m)).collect();
        Ok(SealedTensors { shapes: shapes_of(tensors), ciphertexts, precision_bits: self.precision_bits })
    }

    async fn decrypt(&self, sealed: &SealedTensors) -> FedResult<Vec<Tensor>> {
        let expected: usize = sealed.shapes.iter().map(|s| s.iter().product::<usize>()).sum();
        if expected != sealed.ciphertexts.len() {
            return Err(FederationError::Channel(format!("{} ciphertexts for {} elements", sealed.ciphertexts.len(), expected)));
        }
        self.table();
        let values = sealed.ciphertexts.par_iter().map(|c| self.open_one(c)).collect::<FedResult<Vec<i64>>>()?;
        let unit = 2f64.powi(sealed.precision_bits as i32);
        let mut out = Vec::with_capacity(sealed.shapes.len());
        let mut offset = 0;
        for shape in &sealed.shapes {
            let n: usize = shape.iter().product();
            let data = values[offset..offset + n].iter().map(|m| (*m as f64 / unit) as f32).collect();
            out.push(Tensor::new(shape.clone(), data)?);
            offset += n;
        }
        Ok(out)
    }

    async fn homomorphic_sum(&self, sealed: &[SealedTensors]) -> FedResult<SealedTensors> {
        let first = sealed.first().ok_or_else(|| FederationError::Channel("nothing to sum".into()))?;
        if let Some(bad) = sealed.iter().position(|s| !first.compatible_with(s)) {
            return Err(FederationError::Channel(format!("operand {bad} does not match the first operand's layout")));
        }
        let ciphertexts = (0..first.ciphertexts.len())
            .into_par_iter()
            .map(|i| sealed.iter().fold(Ciphertext::zero(), |acc, s| acc + s.ciphertexts[i]))
            .collect();
        Ok(SealedTensors { shapes: first.shapes.clone(), ciphertexts, precision_bits: first.precision_bits })
    }

    async fn scale(&self, sealed: &SealedTensors, factor: u64) -> FedResult<SealedTensors> {
        let k = Scalar::from(factor);
        let ciphertexts = sealed.ciphertexts.par_iter().map(|c| c.times(&k)).collect();
        Ok(SealedTensors { shapes: sealed.shapes.clone(), ciphertexts, precision_bits: sealed.precision_bits })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ChannelConfig {
        ChannelConfig { precision_bits: 8, dlog_table_bits: 8, max_plaintext_bits: 20 }
    }

    fn close(a: &[f32], b: &[f32]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= 1.0 / 256.0)
    }

    #[tokio::test]
    async fn encrypt_then_decrypt_recovers_values() {
        let ch = RistrettoChannel::from_seed(&cfg(), 1);
        let input = vec![Tensor::vector(vec![0.5, -1.25, 3.0]), Tensor::new(vec![1, 2], vec![0.0, -7.5]).unwrap()];
        let sealed = ch.encrypt(&input).await.unwrap();
        assert_eq!(sealed.element_count(), 5);
        let out = ch.decrypt(&sealed).await.unwrap();
        assert_eq!(out[1].shape, vec![1, 2]);
        assert!(close(&out[0].data, &input[0].data));
        assert!(close(&out[1].data, &input[1].data));
    }

    #[tokio::test]
    async fn sum_of_ciphertexts_opens_to_sum_of_plaintexts() {
        let ch = RistrettoChannel::from_seed(&cfg(), 2);
        let a = ch.encrypt(&[Tensor::vector(vec![1.0, -2.0])]).await.unwrap();
        let b = ch.encrypt(&[Tensor::vector(vec![0.5, 0.25])]).await.unwrap();
        let sum = ch.homomorphic_sum(&[a, b]).await.unwrap();
        let out = ch.decrypt(&sum).await.unwrap();
        assert!(close(&out[0].data, &[1.5, -1.75]));
    }

    #[tokio::test]
    async fn scaling_multiplies_plaintext() {
        let ch = RistrettoChannel::from_seed(&cfg(), 3);
        let a = ch.encrypt(&[Tensor::vector(vec![0.5, -0.25])]).await.unwrap();
        let out = ch.decrypt(&ch.scale(&a, 3).await.unwrap()).await.unwrap();
        assert!(close(&out[0].data, &[1.5, -0.75]));
    }

    #[tokio::test]
    async fn mismatched_layouts_do_not_sum() {
        let ch = RistrettoChannel::from_seed(&cfg(), 4);
        let a = ch.encrypt(&[Tensor::vector(vec![1.0])]).await.unwrap();
        let b = ch.encrypt(&[Tensor::vector(vec![1.0, 2.0])]).await.unwrap();
        assert!(matches!(ch.homomorphic_sum(&[a, b]).await, Err(FederationError::Channel(_))));
        assert!(ch.homomorphic_sum(&[]).await.is_err());
    }

    #[tokio::test]
    async fn out_of_range_values_are_refused() {
        let ch = RistrettoChannel::from_seed(&cfg(), 5);
        assert!(ch.encrypt(&[Tensor::vector(vec![1.0e6])]).await.is_err());
        assert!(ch.encrypt(&[Tensor::vector(vec![f32::NAN])]).await.is_err());
    }

    #[tokio::test]
    async fn foreign_key_cannot_open() {
        let sender = RistrettoChannel::from_seed(&cfg(), 6);
        let other = RistrettoChannel::from_seed(&cfg(), 7);
        assert_ne!(sender.public_key(), other.public_key());
        let sealed = sender.encrypt(&[Tensor::vector(vec![2.0])]).await.unwrap();
        assert!(other.decrypt(&sealed).await.is_err());
    }
}

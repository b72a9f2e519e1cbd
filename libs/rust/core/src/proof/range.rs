//! Interval membership via aggregated Bulletproofs.
//!
//! `x ∈ [lo, hi]` is shown as two n-bit range proofs over shifted copies of
//! the element commitment: `x − lo ∈ [0, 2ⁿ)` and `x − hi + 2ⁿ − 1 ∈ [0, 2ⁿ)`,
//! with `hi − lo < 2ⁿ`. Values are aggregated `CHUNK` at a time.

use bulletproofs::{BulletproofGens, PedersenGens, RangeProof};
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use merlin::Transcript;
use once_cell::sync::Lazy;

use super::wire::malformed;
use crate::error::{FedResult, FederationError};

pub(crate) const CHUNK: usize = 16;
const BIT_WIDTHS: [usize; 4] = [8, 16, 32, 64];

pub(crate) struct Generators {
    pub pc: PedersenGens,
    pub bp: BulletproofGens,
}

pub(crate) static GENERATORS: Lazy<Generators> =
    Lazy::new(|| Generators { pc: PedersenGens::default(), bp: BulletproofGens::new(64, CHUNK) });

pub(crate) fn int_scalar(v: i128) -> Scalar {
    if v >= 0 {
        Scalar::from(v as u128)
    } else {
        -Scalar::from(v.unsigned_abs())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Bounds {
    pub lo: i128,
    pub hi: i128,
    pub bits: usize,
}

impl Bounds {
    pub fn new(lo: i128, hi: i128) -> FedResult<Self> {
        if hi < lo {
            return Err(FederationError::Config(format!("empty interval [{lo}, {hi}]")));
        }
        let span = hi - lo;
        let bits = BIT_WIDTHS
            .iter()
            .copied()
            .find(|b| span < (1i128 << b))
            .ok_or_else(|| FederationError::Config(format!("interval [{lo}, {hi}] is wider than 2^64")))?;
        Ok(Self { lo, hi, bits })
    }

    fn upper_shift(&self) -> i128 {
        self.hi - (1i128 << self.bits) + 1
    }

    pub fn contains(&self, x: i128) -> bool {
        (self.lo..=self.hi).contains(&x)
    }
}

fn sub_transcript(seed: &[u8; 32], label: &'static [u8], chunk: usize) -> Transcript {
    let mut t = Transcript::new(b"fedshield-range-v1");
    t.append_message(b"iteration-challenge", seed);
    t.append_message(b"part", label);
    t.append_u64(b"chunk", chunk as u64);
    t
}

/// Range proofs that every `xs[j]` committed under blinding `rs[j]` lies in `bounds`.
pub(crate) fn prove_bounds(seed: &[u8; 32], label: &'static [u8], xs: &[i128], rs: &[Scalar], bounds: &Bounds) -> FedResult<Vec<RangeProof>> {
    let mut values = Vec::with_capacity(xs.len() * 2);
    let mut blindings = Vec::with_capacity(xs.len() * 2);
    for (j, (x, r)) in xs.iter().zip(rs).enumerate() {
        if !bounds.contains(*x) {
            return Err(FederationError::ConstraintViolated(format!("element {j} lies outside the permitted interval")));
        }
        values.push((x - bounds.lo) as u64);
        values.push((x - bounds.upper_shift()) as u64);
        blindings.push(*r);
        blindings.push(*r);
    }
    prove_values(seed, label, &values, &blindings, bounds.bits)
}

pub(crate) fn verify_bounds(seed: &[u8; 32], label: &'static [u8], commitments: &[RistrettoPoint], bounds: &Bounds, proofs: &[RangeProof]) -> FedResult<()> {
    let g = GENERATORS.pc.B;
    let low = g * int_scalar(bounds.lo);
    let high = g * int_scalar(bounds.upper_shift());
    let shifted: Vec<RistrettoPoint> = commitments.iter().flat_map(|c| [c - low, c - high]).collect();
    verify_values(seed, label, &shifted, bounds.bits, proofs)
}

pub(crate) fn prove_values(seed: &[u8; 32], label: &'static [u8], values: &[u64], blindings: &[Scalar], bits: usize) -> FedResult<Vec<RangeProof>> {
    let gens = &*GENERATORS;
    let mut out = Vec::with_capacity(values.len().div_ceil(CHUNK));
    for (idx, (vals, blinds)) in values.chunks(CHUNK).zip(blindings.chunks(CHUNK)).enumerate() {
        let width = vals.len().next_power_of_two();
        let mut vals = vals.to_vec();
        let mut blinds = blinds.to_vec();
        // zero value, zero blinding: the verifier pads with the identity point
        vals.resize(width, 0);
        blinds.resize(width, Scalar::ZERO);
        let mut t = sub_transcript(seed, label, idx);
        let (proof, _) = RangeProof::prove_multiple(&gens.bp, &gens.pc, &mut t, &vals, &blinds, bits)
            .map_err(|e| FederationError::ConstraintViolated(format!("range proof generation: {e:?}")))?;
        out.push(proof);
    }
    Ok(out)
}

pub(crate) fn verify_values(seed: &[u8; 32], label: &'static [u8], commitments: &[RistrettoPoint], bits: usize, proofs: &[RangeProof]) -> FedResult<()> {
    let gens = &*GENERATORS;
    let expected = commitments.len().div_ceil(CHUNK);
    if proofs.len() != expected {
        return Err(malformed(format!("expected {expected} range proofs, got {}", proofs.len())));
    }
    for (idx, (points, proof)) in commitments.chunks(CHUNK).zip(proofs).enumerate() {
        let width = points.len().next_power_of_two();
        let mut compressed: Vec<_> = points.iter().map(|p| p.compress()).collect();
        compressed.resize(width, RistrettoPoint::identity().compress());
        let mut t = sub_transcript(seed, label, idx);
        proof
            .verify_multiple(&gens.bp, &gens.pc, &mut t, &compressed, bits)
            .map_err(|e| malformed(format!("range proof {idx} rejected: {e:?}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn bit_width_covers_span() {
        assert_eq!(Bounds::new(-10, 10).unwrap().bits, 8);
        assert_eq!(Bounds::new(0, 255).unwrap().bits, 8);
        assert_eq!(Bounds::new(0, 256).unwrap().bits, 16);
        assert_eq!(Bounds::new(-(1 << 40), 1 << 40).unwrap().bits, 64);
        assert!(Bounds::new(5, 4).is_err());
    }

    #[test]
    fn interval_proofs_verify_against_shifted_commitments() {
        let bounds = Bounds::new(-100, 100).unwrap();
        let xs = [-100i128, 0, 37, 100];
        let rs: Vec<Scalar> = xs.iter().map(|_| Scalar::random(&mut OsRng)).collect();
        let cs: Vec<RistrettoPoint> = xs.iter().zip(&rs).map(|(x, r)| GENERATORS.pc.commit(int_scalar(*x), *r)).collect();
        let seed = [7u8; 32];
        let proofs = prove_bounds(&seed, b"t", &xs, &rs, &bounds).unwrap();
        verify_bounds(&seed, b"t", &cs, &bounds, &proofs).unwrap();
        assert!(verify_bounds(&[8u8; 32], b"t", &cs, &bounds, &proofs).is_err());
        let tighter = Bounds { lo: -50, ..bounds };
        assert!(verify_bounds(&seed, b"t", &cs, &tighter, &proofs).is_err());
    }

    #[test]
    fn out_of_interval_value_is_refused_by_prover() {
        let bounds = Bounds::new(0, 10).unwrap();
        let err = prove_bounds(&[0u8; 32], b"t", &[11], &[Scalar::ONE], &bounds).unwrap_err();
        assert!(matches!(err, FederationError::ConstraintViolated(_)));
    }
}

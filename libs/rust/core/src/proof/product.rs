//! Sigma proof that `S` commits to the square of the value inside `C`.
//!
//! With `C = xG + rH` and `S = x²G + tH`, we have `S = x·C + (t − x·r)H`, so
//! the prover shows knowledge of `(x, r, t')` such that `C = xG + rH` and
//! `S = x·C + t'H` using one shared challenge.

use bulletproofs::PedersenGens;
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use rand::rngs::OsRng;

pub(crate) struct SquareNonce {
    a: Scalar,
    b: Scalar,
    c: Scalar,
}

#[derive(Debug, Clone)]
pub(crate) struct SquareResponse {
    pub a1: RistrettoPoint,
    pub a2: RistrettoPoint,
    pub z_x: Scalar,
    pub z_r: Scalar,
    pub z_t: Scalar,
}

/// First move: fresh nonces and the two announcement points.
pub(crate) fn announce(pc: &PedersenGens, commitment: &RistrettoPoint) -> (SquareNonce, RistrettoPoint, RistrettoPoint) {
    let nonce = SquareNonce { a: Scalar::random(&mut OsRng), b: Scalar::random(&mut OsRng), c: Scalar::random(&mut OsRng) };
    let a1 = pc.commit(nonce.a, nonce.b);
    let a2 = commitment * nonce.a + pc.B_blinding * nonce.c;
    (nonce, a1, a2)
}

impl SquareNonce {
    pub fn respond(&self, e: &Scalar, x: &Scalar, r: &Scalar, t_prime: &Scalar) -> (Scalar, Scalar, Scalar) {
        (self.a + e * x, self.b + e * r, self.c + e * t_prime)
    }
}

pub(crate) fn verify(pc: &PedersenGens, commitment: &RistrettoPoint, square: &RistrettoPoint, resp: &SquareResponse, e: &Scalar) -> bool {
    let opens = pc.commit(resp.z_x, resp.z_r) == resp.a1 + commitment * e;
    let squares = commitment * resp.z_x + pc.B_blinding * resp.z_t == resp.a2 + square * e;
    opens && squares
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proof::range::int_scalar;

    fn prove(x: i128, claimed_square: i128) -> bool {
        let pc = PedersenGens::default();
        let (xs, r, t) = (int_scalar(x), Scalar::random(&mut OsRng), Scalar::random(&mut OsRng));
        let c = pc.commit(xs, r);
        let s = pc.commit(int_scalar(claimed_square), t);
        let (nonce, a1, a2) = announce(&pc, &c);
        let e = Scalar::random(&mut OsRng);
        let (z_x, z_r, z_t) = nonce.respond(&e, &xs, &r, &(t - xs * r));
        verify(&pc, &c, &s, &SquareResponse { a1, a2, z_x, z_r, z_t }, &e)
    }

    #[test]
    fn honest_square_verifies() {
        assert!(prove(-12, 144));
        assert!(prove(0, 0));
    }

    #[test]
    fn wrong_square_fails() {
        assert!(!prove(5, 24));
    }
}

//! Byte layout helpers for proof responses.

use bulletproofs::RangeProof;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;

use crate::error::{FedResult, FederationError};

pub(crate) fn malformed(what: impl Into<String>) -> FederationError {
    FederationError::InvalidProof(what.into())
}

pub(crate) fn point(bytes: &[u8]) -> FedResult<RistrettoPoint> {
    let arr: [u8; 32] = bytes.try_into().map_err(|_| malformed("point encoding must be 32 bytes"))?;
    CompressedRistretto(arr).decompress().ok_or_else(|| malformed("point does not decompress"))
}

pub(crate) fn scalar(bytes: &[u8]) -> FedResult<Scalar> {
    let arr: [u8; 32] = bytes.try_into().map_err(|_| malformed("scalar encoding must be 32 bytes"))?;
    Option::<Scalar>::from(Scalar::from_canonical_bytes(arr)).ok_or_else(|| malformed("scalar is not canonical"))
}

#[derive(Default)]
pub(crate) struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(buf: Vec<u8>) -> Self {
        Self { buf }
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn point(&mut self, p: &RistrettoPoint) {
        self.buf.extend_from_slice(p.compress().as_bytes());
    }

    pub fn scalar(&mut self, s: &Scalar) {
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn proofs(&mut self, proofs: &[RangeProof]) {
        self.u32(proofs.len() as u32);
        for p in proofs {
            let bytes = p.to_bytes();
            self.u32(bytes.len() as u32);
            self.buf.extend_from_slice(&bytes);
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> FedResult<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.buf.len()).ok_or_else(|| malformed("response truncated"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn u32(&mut self) -> FedResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn skip(&mut self, n: usize) -> FedResult<()> {
        self.take(n).map(|_| ())
    }

    pub fn point(&mut self) -> FedResult<RistrettoPoint> {
        point(self.take(32)?)
    }

    pub fn scalar(&mut self) -> FedResult<Scalar> {
        scalar(self.take(32)?)
    }

    pub fn proofs(&mut self) -> FedResult<Vec<RangeProof>> {
        let count = self.u32()? as usize;
        if count > self.buf.len() - self.pos {
            return Err(malformed("range proof count exceeds response length"));
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let len = self.u32()? as usize;
            let bytes = self.take(len)?;
            out.push(RangeProof::from_bytes(bytes).map_err(|e| malformed(format!("range proof encoding: {e:?}")))?);
        }
        Ok(out)
    }

    pub fn finish(self) -> FedResult<()> {
        if self.pos != self.buf.len() {
            return Err(malformed(format!("{} trailing bytes in response", self.buf.len() - self.pos)));
        }
        Ok(())
    }
}

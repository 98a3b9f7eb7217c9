//! Blake2b hashing: plain digests, hash-to-scalar and hash-to-point.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Blake2b512, Digest};
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;

type Blake2b256 = Blake2b<U32>;

/// Compute a 256-bit Blake2b hash of arbitrary data.
pub fn blake2b_256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash multiple byte slices in sequence (avoids concatenation allocation).
pub fn blake2b_256_multi(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// `Hs`: hash the concatenation of `parts` to a uniformly distributed scalar.
pub fn hash_to_scalar(parts: &[&[u8]]) -> Scalar {
    let mut hasher = Blake2b512::new();
    for part in parts {
        hasher.update(part);
    }
    Scalar::from_hash(hasher)
}

/// `Hp`: hash bytes to a group element with unknown discrete log.
pub fn hash_to_point(data: &[u8]) -> RistrettoPoint {
    RistrettoPoint::hash_from_bytes::<Blake2b512>(data)
}

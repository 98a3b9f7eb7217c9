//! Scalar/point conversion and view/spend key generation.

use crate::error::CryptoError;
use crate::hash::hash_to_scalar;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use umbra_types::{KeyPair, PublicKey, SecretKey};

pub(crate) fn to_scalar(secret: &SecretKey) -> Scalar {
    Scalar::from_bytes_mod_order(secret.0)
}

pub(crate) fn from_scalar(scalar: &Scalar) -> SecretKey {
    SecretKey(scalar.to_bytes())
}

pub(crate) fn to_point(public: &PublicKey) -> Result<RistrettoPoint, CryptoError> {
    CompressedRistretto(public.0)
        .decompress()
        .ok_or(CryptoError::InvalidPoint)
}

pub(crate) fn from_point(point: &RistrettoPoint) -> PublicKey {
    PublicKey(point.compress().to_bytes())
}

/// Public key `x·G` for a secret scalar.
pub fn secret_to_public(secret: &SecretKey) -> PublicKey {
    from_point(&RistrettoPoint::mul_base(&to_scalar(secret)))
}

/// `secret · public`, e.g. a per-output transaction key `r·B_sub`.
pub fn scalar_mult_key(public: &PublicKey, secret: &SecretKey) -> Result<PublicKey, CryptoError> {
    Ok(from_point(&(to_scalar(secret) * to_point(public)?)))
}

/// Fresh random key pair.
pub fn generate_keys<R: RngCore + CryptoRng>(rng: &mut R) -> KeyPair {
    let secret = Scalar::random(rng);
    KeyPair {
        public: from_point(&RistrettoPoint::mul_base(&secret)),
        secret: from_scalar(&secret),
    }
}

/// Deterministic key pair from 32 bytes of seed material.
pub fn keys_from_seed(seed: &[u8; 32]) -> KeyPair {
    let secret = hash_to_scalar(&[b"umbra.keys", seed]);
    KeyPair {
        public: from_point(&RistrettoPoint::mul_base(&secret)),
        secret: from_scalar(&secret),
    }
}

/// View secret for an account: `Hs(spend secret)`.
pub fn derive_view_secret(spend_secret: &SecretKey) -> SecretKey {
    from_scalar(&hash_to_scalar(&[b"umbra.view", &spend_secret.0]))
}

/// Whether `public` is a valid point encoding.
pub fn check_key(public: &PublicKey) -> bool {
    to_point(public).is_ok()
}

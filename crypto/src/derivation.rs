//! Stealth output key derivation.
//!
//! A sender with transaction secret `r` and a recipient with view secret `a`
//! share `D = r·A = a·R`. Output `i` gets the one-time key
//! `P = Hs(D‖i)·G + B`, spendable with `x = Hs(D‖i) + b`.

use crate::error::CryptoError;
use crate::hash::{blake2b_256_multi, hash_to_scalar};
use crate::keys::{from_point, from_scalar, to_point, to_scalar};
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use umbra_types::{KeyDerivation, PublicKey, SecretKey};

/// `D = secret · public`.
pub fn generate_key_derivation(
    public: &PublicKey,
    secret: &SecretKey,
) -> Result<KeyDerivation, CryptoError> {
    let point = to_point(public)?;
    Ok(KeyDerivation(
        (to_scalar(secret) * point).compress().to_bytes(),
    ))
}

pub(crate) fn shared_scalar(derivation: &KeyDerivation, output_index: u64) -> Scalar {
    hash_to_scalar(&[&derivation.0, &output_index.to_le_bytes()])
}

/// `Hs(D‖i)`, the per-output shared secret used for amount encryption.
pub fn derivation_to_scalar(derivation: &KeyDerivation, output_index: u64) -> SecretKey {
    from_scalar(&shared_scalar(derivation, output_index))
}

/// `Hs(D‖i)·G + base`.
pub fn derive_public_key(
    derivation: &KeyDerivation,
    output_index: u64,
    base: &PublicKey,
) -> Result<PublicKey, CryptoError> {
    let base = to_point(base)?;
    let scalar = shared_scalar(derivation, output_index);
    Ok(from_point(&(RistrettoPoint::mul_base(&scalar) + base)))
}

/// `Hs(D‖i) + base`.
pub fn derive_secret_key(
    derivation: &KeyDerivation,
    output_index: u64,
    base: &SecretKey,
) -> SecretKey {
    let scalar = shared_scalar(derivation, output_index);
    from_scalar(&(scalar + to_scalar(base)))
}

/// Recover the spend key an output was sent to: `P - Hs(D‖i)·G`.
pub fn derive_subaddress_public_key(
    output_key: &PublicKey,
    derivation: &KeyDerivation,
    output_index: u64,
) -> Result<PublicKey, CryptoError> {
    let point = to_point(output_key)?;
    let scalar = shared_scalar(derivation, output_index);
    Ok(from_point(&(point - RistrettoPoint::mul_base(&scalar))))
}

/// One-byte scan hint for output `i`.
pub fn derive_view_tag(derivation: &KeyDerivation, output_index: u64) -> u8 {
    blake2b_256_multi(&[b"view_tag", &derivation.0, &output_index.to_le_bytes()])[0]
}

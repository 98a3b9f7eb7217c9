//! Amount commitments `C = mask·G + amount·H` and amount encryption.
//!
//! `H` is a hashed generator with no known discrete log relative to `G`.

use crate::error::CryptoError;
use crate::hash::{blake2b_256_multi, hash_to_point, hash_to_scalar};
use crate::keys::{from_point, from_scalar, to_point, to_scalar};
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use std::sync::OnceLock;
use umbra_types::{PublicKey, SecretKey};

fn generator_h() -> &'static RistrettoPoint {
    static H: OnceLock<RistrettoPoint> = OnceLock::new();
    H.get_or_init(|| hash_to_point(b"umbra.commitment.H"))
}

pub fn commit(amount: u64, mask: &SecretKey) -> PublicKey {
    let point = RistrettoPoint::mul_base(&to_scalar(mask)) + Scalar::from(amount) * generator_h();
    from_point(&point)
}

/// The mask used for plaintext-amount outputs.
pub fn identity_mask() -> SecretKey {
    from_scalar(&Scalar::ONE)
}

/// Commitment to a plaintext amount, as used for coinbase and legacy outputs.
pub fn zero_commit(amount: u64) -> PublicKey {
    commit(amount, &identity_mask())
}

/// Blinding factor for output `i`, from its shared secret `Hs(D‖i)`.
pub fn commitment_mask(shared: &SecretKey) -> SecretKey {
    from_scalar(&hash_to_scalar(&[b"commitment_mask", &shared.0]))
}

fn amount_pad(shared: &SecretKey) -> [u8; 8] {
    let digest = blake2b_256_multi(&[b"amount", &shared.0]);
    let mut pad = [0u8; 8];
    pad.copy_from_slice(&digest[..8]);
    pad
}

pub fn encrypt_amount(amount: u64, shared: &SecretKey) -> [u8; 8] {
    let pad = amount_pad(shared);
    let mut out = amount.to_le_bytes();
    for (b, p) in out.iter_mut().zip(pad) {
        *b ^= p;
    }
    out
}

pub fn decrypt_amount(encrypted: &[u8; 8], shared: &SecretKey) -> u64 {
    let pad = amount_pad(shared);
    let mut out = *encrypted;
    for (b, p) in out.iter_mut().zip(pad) {
        *b ^= p;
    }
    u64::from_le_bytes(out)
}

pub fn sum_secrets(secrets: &[SecretKey]) -> SecretKey {
    from_scalar(&secrets.iter().map(to_scalar).sum::<Scalar>())
}

pub fn sub_secrets(a: &SecretKey, b: &SecretKey) -> SecretKey {
    from_scalar(&(to_scalar(a) - to_scalar(b)))
}

/// `Σ pseudo_outs == Σ out_commitments + fee·H`.
pub fn commitments_balance(
    pseudo_outs: &[PublicKey],
    out_commitments: &[PublicKey],
    fee: u64,
) -> Result<bool, CryptoError> {
    let mut inputs = RistrettoPoint::identity();
    for c in pseudo_outs {
        inputs += to_point(c)?;
    }
    let mut outputs = Scalar::from(fee) * generator_h();
    for c in out_commitments {
        outputs += to_point(c)?;
    }
    Ok(inputs == outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::{random_scalar, rng_from_seed};

    #[test]
    fn amount_encryption_round_trip() {
        let mut rng = rng_from_seed(11);
        let shared = random_scalar(&mut rng);
        let enc = encrypt_amount(123_456_789, &shared);
        assert_eq!(decrypt_amount(&enc, &shared), 123_456_789);
        let other = random_scalar(&mut rng);
        assert_ne!(decrypt_amount(&enc, &other), 123_456_789);
    }

    #[test]
    fn balanced_masks_balance_commitments() {
        let mut rng = rng_from_seed(12);
        let out_masks = [random_scalar(&mut rng), random_scalar(&mut rng)];
        let outs = [commit(70, &out_masks[0]), commit(20, &out_masks[1])];
        let first = random_scalar(&mut rng);
        let last = sub_secrets(&sum_secrets(&out_masks), &first);
        let pseudo = [commit(40, &first), commit(60, &last)];
        assert!(commitments_balance(&pseudo, &outs, 10).unwrap());
        assert!(!commitments_balance(&pseudo, &outs, 11).unwrap());
    }

    #[test]
    fn zero_commit_uses_identity_mask() {
        assert_eq!(zero_commit(5), commit(5, &identity_mask()));
        assert_ne!(zero_commit(5), zero_commit(6));
    }
}

//! Subaddress keys.
//!
//! Subaddress `(major, minor)` has spend key `B + m·G` with
//! `m = Hs("SubAddr"‖a‖major‖minor)` and view key `a·(B + m·G)`.
//! The primary address `(0, 0)` is `B` itself.

use crate::error::CryptoError;
use crate::hash::hash_to_scalar;
use crate::keys::{from_point, from_scalar, to_point, to_scalar};
use curve25519_dalek::ristretto::RistrettoPoint;
use umbra_types::{PublicKey, SecretKey, SubaddressIndex};

/// `m` for a subaddress; zero for the primary address.
pub fn subaddress_secret_key(view_secret: &SecretKey, index: SubaddressIndex) -> SecretKey {
    if index.is_primary() {
        return SecretKey([0u8; 32]);
    }
    from_scalar(&hash_to_scalar(&[
        b"SubAddr\0",
        &view_secret.0,
        &index.major.to_le_bytes(),
        &index.minor.to_le_bytes(),
    ]))
}

pub fn subaddress_spend_public_key(
    spend_public: &PublicKey,
    view_secret: &SecretKey,
    index: SubaddressIndex,
) -> Result<PublicKey, CryptoError> {
    if index.is_primary() {
        return Ok(*spend_public);
    }
    let m = to_scalar(&subaddress_secret_key(view_secret, index));
    Ok(from_point(&(to_point(spend_public)? + RistrettoPoint::mul_base(&m))))
}

pub fn subaddress_view_public_key(
    subaddress_spend_public: &PublicKey,
    view_secret: &SecretKey,
) -> Result<PublicKey, CryptoError> {
    Ok(from_point(
        &(to_scalar(view_secret) * to_point(subaddress_spend_public)?),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derivation::{derive_public_key, derive_secret_key, generate_key_derivation};
    use crate::keys::{generate_keys, scalar_mult_key, secret_to_public};
    use crate::random::rng_from_seed;
    use crate::sum_secrets;

    #[test]
    fn primary_is_identity() {
        let mut rng = rng_from_seed(1);
        let spend = generate_keys(&mut rng);
        let view = generate_keys(&mut rng);
        assert_eq!(
            subaddress_spend_public_key(&spend.public, &view.secret, SubaddressIndex::PRIMARY)
                .unwrap(),
            spend.public
        );
    }

    #[test]
    fn payment_to_subaddress_is_spendable() {
        let mut rng = rng_from_seed(2);
        let spend = generate_keys(&mut rng);
        let view = generate_keys(&mut rng);
        let index = SubaddressIndex::new(1, 4);

        let sub_spend = subaddress_spend_public_key(&spend.public, &view.secret, index).unwrap();
        let sub_view = subaddress_view_public_key(&sub_spend, &view.secret).unwrap();

        // Sender: per-output key R = r·D_sub, derivation r·C_sub.
        let r = generate_keys(&mut rng);
        let tx_pub = scalar_mult_key(&sub_spend, &r.secret).unwrap();
        let sender_d = generate_key_derivation(&sub_view, &r.secret).unwrap();
        let out = derive_public_key(&sender_d, 0, &sub_spend).unwrap();

        // Receiver: a·R.
        let recv_d = generate_key_derivation(&tx_pub, &view.secret).unwrap();
        assert_eq!(recv_d, sender_d);

        let m = subaddress_secret_key(&view.secret, index);
        let x = derive_secret_key(&recv_d, 0, &sum_secrets(&[spend.secret.clone(), m]));
        assert_eq!(secret_to_public(&x), out);
    }
}

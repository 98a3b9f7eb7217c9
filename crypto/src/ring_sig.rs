//! bLSAG linkable ring signatures.
//!
//! Proves knowledge of the secret for one ring member and binds the
//! signature to that member's key image, so two signatures by the same key
//! are linkable while the signer stays hidden among the ring.

use crate::error::CryptoError;
use crate::hash::{hash_to_point, hash_to_scalar};
use crate::keys::{to_point, to_scalar};
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use umbra_types::{KeyImage, PublicKey, RingSignature, SecretKey};

fn challenge(message: &[u8; 32], l: &RistrettoPoint, r: &RistrettoPoint) -> Scalar {
    hash_to_scalar(&[
        b"umbra.blsag",
        message,
        l.compress().as_bytes(),
        r.compress().as_bytes(),
    ])
}

pub fn generate_ring_signature<R: RngCore + CryptoRng>(
    message: &[u8; 32],
    ring: &[PublicKey],
    key_image: &KeyImage,
    secret: &SecretKey,
    real_index: usize,
    rng: &mut R,
) -> Result<RingSignature, CryptoError> {
    let n = ring.len();
    if n == 0 {
        return Err(CryptoError::EmptyRing);
    }
    if real_index >= n {
        return Err(CryptoError::RealIndexOutOfRange {
            ring: n,
            index: real_index,
        });
    }
    let points = ring.iter().map(to_point).collect::<Result<Vec<_>, _>>()?;
    let hashed: Vec<RistrettoPoint> = ring.iter().map(|p| hash_to_point(&p.0)).collect();
    let image = CompressedRistretto(key_image.0)
        .decompress()
        .ok_or(CryptoError::InvalidPoint)?;
    let x = to_scalar(secret);

    let mut c = vec![Scalar::ZERO; n];
    let mut s = vec![Scalar::ZERO; n];

    let alpha = Scalar::random(rng);
    let mut next = (real_index + 1) % n;
    c[next] = challenge(
        message,
        &RistrettoPoint::mul_base(&alpha),
        &(alpha * hashed[real_index]),
    );
    while next != real_index {
        s[next] = Scalar::random(rng);
        let l = RistrettoPoint::mul_base(&s[next]) + c[next] * points[next];
        let r = s[next] * hashed[next] + c[next] * image;
        let following = (next + 1) % n;
        c[following] = challenge(message, &l, &r);
        next = following;
    }
    s[real_index] = alpha - c[real_index] * x;

    Ok(RingSignature {
        c0: c[0].to_bytes(),
        responses: s.iter().map(|v| v.to_bytes()).collect(),
    })
}

pub fn check_ring_signature(
    message: &[u8; 32],
    ring: &[PublicKey],
    key_image: &KeyImage,
    signature: &RingSignature,
) -> bool {
    if ring.is_empty() || signature.responses.len() != ring.len() {
        return false;
    }
    let Some(image) = CompressedRistretto(key_image.0).decompress() else {
        return false;
    };
    let Some(c0) = Option::<Scalar>::from(Scalar::from_canonical_bytes(signature.c0)) else {
        return false;
    };
    let mut c = c0;
    for (member, response) in ring.iter().zip(&signature.responses) {
        let Ok(point) = to_point(member) else {
            return false;
        };
        let Some(s) = Option::<Scalar>::from(Scalar::from_canonical_bytes(*response)) else {
            return false;
        };
        let l = RistrettoPoint::mul_base(&s) + c * point;
        let r = s * hash_to_point(&member.0) + c * image;
        c = challenge(message, &l, &r);
    }
    c == c0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_image::generate_key_image;
    use crate::keys::generate_keys;
    use crate::random::rng_from_seed;

    fn ring_with_signer(size: usize, real: usize) -> (Vec<PublicKey>, SecretKey) {
        let mut rng = rng_from_seed(21);
        let mut ring = Vec::new();
        let mut secret = None;
        for i in 0..size {
            let kp = generate_keys(&mut rng);
            ring.push(kp.public);
            if i == real {
                secret = Some(kp.secret);
            }
        }
        (ring, secret.unwrap())
    }

    #[test]
    fn signature_verifies_for_every_position() {
        let msg = [5u8; 32];
        for real in 0..4 {
            let (ring, secret) = ring_with_signer(4, real);
            let image = generate_key_image(&ring[real], &secret);
            let mut rng = rng_from_seed(real as u64);
            let sig = generate_ring_signature(&msg, &ring, &image, &secret, real, &mut rng).unwrap();
            assert!(check_ring_signature(&msg, &ring, &image, &sig));
        }
    }

    #[test]
    fn wrong_message_or_image_fails() {
        let (ring, secret) = ring_with_signer(3, 1);
        let image = generate_key_image(&ring[1], &secret);
        let mut rng = rng_from_seed(3);
        let sig = generate_ring_signature(&[1u8; 32], &ring, &image, &secret, 1, &mut rng).unwrap();
        assert!(!check_ring_signature(&[2u8; 32], &ring, &image, &sig));
        let other = generate_key_image(&ring[0], &secret);
        assert!(!check_ring_signature(&[1u8; 32], &ring, &other, &sig));
    }

    #[test]
    fn bad_shapes_are_rejected() {
        let (ring, secret) = ring_with_signer(2, 0);
        let image = generate_key_image(&ring[0], &secret);
        let mut rng = rng_from_seed(4);
        assert_eq!(
            generate_ring_signature(&[0u8; 32], &ring, &image, &secret, 2, &mut rng),
            Err(CryptoError::RealIndexOutOfRange { ring: 2, index: 2 })
        );
        assert_eq!(
            generate_ring_signature(&[0u8; 32], &[], &image, &secret, 0, &mut rng),
            Err(CryptoError::EmptyRing)
        );
    }
}

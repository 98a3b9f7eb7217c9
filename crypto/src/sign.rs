//! Ed25519 message signing and verification, used for quorum votes.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::{CryptoRng, RngCore};
use umbra_types::{KeyPair, PublicKey, SecretKey, Signature};

/// Generate a new Ed25519 key pair.
pub fn generate_signing_keypair<R: RngCore + CryptoRng>(rng: &mut R) -> KeyPair {
    let signing_key = SigningKey::generate(rng);
    KeyPair {
        public: PublicKey(signing_key.verifying_key().to_bytes()),
        secret: SecretKey(signing_key.to_bytes()),
    }
}

/// Derive an Ed25519 key pair from a 32-byte seed (deterministic).
pub fn signing_keypair_from_seed(seed: &[u8; 32]) -> KeyPair {
    let signing_key = SigningKey::from_bytes(seed);
    KeyPair {
        public: PublicKey(signing_key.verifying_key().to_bytes()),
        secret: SecretKey(signing_key.to_bytes()),
    }
}

/// Sign a message with an Ed25519 seed.
pub fn sign_message(message: &[u8], secret: &SecretKey) -> Signature {
    let signing_key = SigningKey::from_bytes(&secret.0);
    Signature(signing_key.sign(message).to_bytes())
}

/// Verify a signature against a message and public key.
///
/// Returns `true` if the signature is valid, `false` otherwise.
/// Also rejects non-canonical signatures (malleability protection).
pub fn verify_signature(message: &[u8], signature: &Signature, public_key: &PublicKey) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(&public_key.0) else {
        return false;
    };
    let dalek_sig = ed25519_dalek::Signature::from_bytes(&signature.0);
    verifying_key.verify(message, &dalek_sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::rng_from_seed;

    #[test]
    fn sign_and_verify() {
        let kp = generate_signing_keypair(&mut rng_from_seed(1));
        let msg = b"checkpoint vote";
        let sig = sign_message(msg, &kp.secret);
        assert!(verify_signature(msg, &sig, &kp.public));
    }

    #[test]
    fn wrong_message_fails() {
        let kp = generate_signing_keypair(&mut rng_from_seed(2));
        let sig = sign_message(b"correct message", &kp.secret);
        assert!(!verify_signature(b"wrong message", &sig, &kp.public));
    }

    #[test]
    fn wrong_key_fails() {
        let mut rng = rng_from_seed(3);
        let kp1 = generate_signing_keypair(&mut rng);
        let kp2 = generate_signing_keypair(&mut rng);
        let sig = sign_message(b"test", &kp1.secret);
        assert!(!verify_signature(b"test", &sig, &kp2.public));
    }

    #[test]
    fn signature_deterministic() {
        let kp = signing_keypair_from_seed(&[99u8; 32]);
        let sig1 = sign_message(b"deterministic", &kp.secret);
        let sig2 = sign_message(b"deterministic", &kp.secret);
        assert_eq!(sig1.0, sig2.0);
    }

    #[test]
    fn invalid_public_key() {
        let kp = signing_keypair_from_seed(&[7u8; 32]);
        let sig = sign_message(b"test", &kp.secret);
        assert!(!verify_signature(b"test", &sig, &PublicKey([0xFF; 32])));
    }
}

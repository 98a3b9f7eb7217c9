//! CSPRNG helpers.

use curve25519_dalek::scalar::Scalar;
use rand::rngs::StdRng;
use rand::{CryptoRng, RngCore, SeedableRng};
use umbra_types::SecretKey;

/// A ChaCha-based generator seeded from the operating system.
pub fn secure_rng() -> StdRng {
    StdRng::from_entropy()
}

/// Deterministic generator for reproducible decoy sampling and tests.
pub fn rng_from_seed(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub fn random_scalar<R: RngCore + CryptoRng>(rng: &mut R) -> SecretKey {
    SecretKey(Scalar::random(rng).to_bytes())
}

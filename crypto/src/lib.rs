//! Cryptographic primitives for Umbra.
//!
//! - **Ristretto255** stealth addressing: key derivation, one-time output
//!   keys, subaddresses, key images
//! - **Commitments** (`mask·G + amount·H`) and encrypted amounts
//! - **bLSAG** linkable ring signatures
//! - **Ed25519** for quorum vote signing
//! - **Blake2b** for hashing
//!
//! Callers treat everything here as opaque: inputs and outputs are the
//! byte-level types from `umbra-types`.

pub mod commitment;
pub mod derivation;
pub mod error;
pub mod hash;
pub mod key_image;
pub mod keys;
pub mod random;
pub mod ring_sig;
pub mod sign;
pub mod subaddress;

pub use commitment::{
    commit, commitment_mask, commitments_balance, decrypt_amount, encrypt_amount, identity_mask,
    sub_secrets, sum_secrets, zero_commit,
};
pub use derivation::{
    derivation_to_scalar, derive_public_key, derive_secret_key, derive_subaddress_public_key,
    derive_view_tag, generate_key_derivation,
};
pub use error::CryptoError;
pub use hash::{blake2b_256, blake2b_256_multi, hash_to_scalar};
pub use key_image::generate_key_image;
pub use keys::{
    check_key, derive_view_secret, generate_keys, keys_from_seed, scalar_mult_key, secret_to_public,
};
pub use random::{random_scalar, rng_from_seed, secure_rng};
pub use ring_sig::{check_ring_signature, generate_ring_signature};
pub use sign::{generate_signing_keypair, signing_keypair_from_seed, sign_message, verify_signature};
pub use subaddress::{subaddress_secret_key, subaddress_spend_public_key, subaddress_view_public_key};

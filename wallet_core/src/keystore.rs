//! Argon2id encrypted key file.
//!
//! Encrypts the account's spend secret with a user-chosen password:
//! 1. Argon2id derives a 32-byte encryption key from the password + random salt
//! 2. AES-256-GCM encrypts the secret with a random nonce
//! 3. The result is stored as a JSON file with all parameters for future decryption
//!
//! The view secret is re-derived from the spend secret on load.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::path::Path;
use umbra_types::SecretKey;
use zeroize::Zeroizing;

use crate::error::WalletError;
use crate::keys::AccountKeys;

const KEYSTORE_VERSION: u32 = 1;

/// 64 MiB.
const ARGON2_MEMORY_KIB: u32 = 65536;
const ARGON2_PARALLELISM: u32 = 1;
const ARGON2_OUTPUT_LEN: usize = 32;

pub(crate) const SALT_LEN: usize = 32;
/// AES-GCM nonce length in bytes (96 bits).
pub(crate) const NONCE_LEN: usize = 12;

/// The top-level key file structure, serializable to/from JSON.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeystoreFile {
    pub version: u32,
    /// Hex-encoded primary spend public key, for identification only.
    pub spend_public: String,
    pub crypto: KeystoreCrypto,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeystoreCrypto {
    pub cipher: String,
    pub kdf: String,
    pub kdf_params: KdfParams,
    /// Hex-encoded salt.
    pub salt: String,
    /// Hex-encoded nonce.
    pub nonce: String,
    /// Hex-encoded ciphertext.
    pub ciphertext: String,
}

/// KDF parameters for Argon2id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl KdfParams {
    pub fn with_rounds(iterations: u32) -> Self {
        Self {
            memory: ARGON2_MEMORY_KIB,
            iterations: iterations.max(1),
            parallelism: ARGON2_PARALLELISM,
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::with_rounds(3)
    }
}

/// Salt, nonce and AES-256-GCM ciphertext of one sealed blob.
pub(crate) struct Sealed {
    pub salt: [u8; SALT_LEN],
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

pub(crate) fn seal<R: RngCore + CryptoRng>(
    plaintext: &[u8],
    password: &str,
    params: &KdfParams,
    rng: &mut R,
) -> Result<Sealed, WalletError> {
    let mut salt = [0u8; SALT_LEN];
    rng.fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce);

    let key = derive_key(password, &salt, params)?;
    let cipher = Aes256Gcm::new_from_slice(&key[..])
        .map_err(|e| WalletError::Internal(format!("AES key init failed: {e}")))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| WalletError::Internal(format!("encryption failed: {e}")))?;
    Ok(Sealed {
        salt,
        nonce,
        ciphertext,
    })
}

/// Decrypt a sealed blob. A failed tag check means the password is wrong.
pub(crate) fn open(
    salt: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
    password: &str,
    params: &KdfParams,
) -> Result<Zeroizing<Vec<u8>>, WalletError> {
    if nonce.len() != NONCE_LEN {
        return Err(WalletError::Corrupt(format!(
            "invalid nonce length: expected {}, got {}",
            NONCE_LEN,
            nonce.len()
        )));
    }
    let key = derive_key(password, salt, params)?;
    let cipher = Aes256Gcm::new_from_slice(&key[..])
        .map_err(|e| WalletError::Internal(format!("AES key init failed: {e}")))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| WalletError::InvalidPassword)
}

/// Encrypt the account's spend secret.
pub fn encrypt_keys<R: RngCore + CryptoRng>(
    keys: &AccountKeys,
    password: &str,
    params: &KdfParams,
    rng: &mut R,
) -> Result<KeystoreFile, WalletError> {
    let sealed = seal(keys.spend_secret.as_bytes(), password, params, rng)?;
    Ok(KeystoreFile {
        version: KEYSTORE_VERSION,
        spend_public: hex::encode(keys.spend_public.as_bytes()),
        crypto: KeystoreCrypto {
            cipher: "aes-256-gcm".to_string(),
            kdf: "argon2id".to_string(),
            kdf_params: *params,
            salt: hex::encode(sealed.salt),
            nonce: hex::encode(sealed.nonce),
            ciphertext: hex::encode(&sealed.ciphertext),
        },
    })
}

pub fn decrypt_keys(keystore: &KeystoreFile, password: &str) -> Result<AccountKeys, WalletError> {
    if keystore.version != KEYSTORE_VERSION {
        return Err(WalletError::Corrupt(format!(
            "unsupported keystore version: {}",
            keystore.version
        )));
    }
    if keystore.crypto.cipher != "aes-256-gcm" || keystore.crypto.kdf != "argon2id" {
        return Err(WalletError::Corrupt(format!(
            "unsupported cipher/kdf: {}/{}",
            keystore.crypto.cipher, keystore.crypto.kdf
        )));
    }

    let salt = hex::decode(&keystore.crypto.salt)
        .map_err(|e| WalletError::Corrupt(format!("invalid salt hex: {e}")))?;
    let nonce = hex::decode(&keystore.crypto.nonce)
        .map_err(|e| WalletError::Corrupt(format!("invalid nonce hex: {e}")))?;
    let ciphertext = hex::decode(&keystore.crypto.ciphertext)
        .map_err(|e| WalletError::Corrupt(format!("invalid ciphertext hex: {e}")))?;

    let plaintext = open(
        &salt,
        &nonce,
        &ciphertext,
        password,
        &keystore.crypto.kdf_params,
    )?;
    let secret: [u8; 32] = plaintext.as_slice().try_into().map_err(|_| {
        WalletError::Corrupt(format!(
            "decrypted key has wrong length: expected 32, got {}",
            plaintext.len()
        ))
    })?;
    Ok(AccountKeys::from_spend_secret(SecretKey(secret)))
}

/// Save a key file as pretty JSON.
pub fn save_keystore(keystore: &KeystoreFile, path: &Path) -> Result<(), WalletError> {
    let json = serde_json::to_string_pretty(keystore)
        .map_err(|e| WalletError::Serialization(format!("JSON serialization failed: {e}")))?;
    std::fs::write(path, json)?;
    Ok(())
}

pub fn load_keystore(path: &Path) -> Result<KeystoreFile, WalletError> {
    let json = std::fs::read_to_string(path)?;
    serde_json::from_str(&json).map_err(|e| WalletError::Corrupt(format!("invalid keystore JSON: {e}")))
}

fn derive_key(
    password: &str,
    salt: &[u8],
    params: &KdfParams,
) -> Result<Zeroizing<[u8; ARGON2_OUTPUT_LEN]>, WalletError> {
    let params = Params::new(
        params.memory,
        params.iterations,
        params.parallelism,
        Some(ARGON2_OUTPUT_LEN),
    )
    .map_err(|e| WalletError::Corrupt(format!("Argon2 params error: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut output = Zeroizing::new([0u8; ARGON2_OUTPUT_LEN]);
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut output[..])
        .map_err(|e| WalletError::Corrupt(format!("Argon2 hashing failed: {e}")))?;
    Ok(output)
}

//! Wallet files on disk.
//!
//! A wallet lives in two files: the JSON key file at `<path>.keys` and the
//! encrypted cache at `<path>`. The cache is a bincode container holding a
//! versioned header and the AES-256-GCM sealed, bincode-encoded
//! [`WalletCache`]. Both are sealed under the same password.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use umbra_types::TxHash;

use crate::config::WalletConfig;
use crate::error::WalletError;
use crate::hash_chain::HashChain;
use crate::keystore::{
    decrypt_keys, encrypt_keys, load_keystore, open, save_keystore, seal, KdfParams, NONCE_LEN,
    SALT_LEN,
};
use crate::payments::{ConfirmedTransferDetail, PaymentDetail, PoolPayment, UnconfirmedTransferDetail};
use crate::ring_db::RingDatabase;
use crate::subaddress::SubaddressTable;
use crate::transfers::{TransferDetail, TransferLedger};
use crate::wallet::Wallet;

const CACHE_MAGIC: [u8; 8] = *b"UMBRACHE";
const CACHE_VERSION: u32 = 1;

/// Everything a wallet learned from the chain.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WalletCache {
    pub transfers: Vec<TransferDetail>,
    pub hash_chain: HashChain,
    pub payments: Vec<PaymentDetail>,
    pub unconfirmed_payments: HashMap<TxHash, PoolPayment>,
    pub confirmed_txs: HashMap<TxHash, ConfirmedTransferDetail>,
    pub unconfirmed_txs: HashMap<TxHash, UnconfirmedTransferDetail>,
    pub ring_db: RingDatabase,
    pub subaddresses: SubaddressTable,
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    magic: [u8; 8],
    version: u32,
    kdf: KdfParams,
    salt: [u8; SALT_LEN],
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
}

pub fn keys_path(path: &Path) -> PathBuf {
    path.with_extension("keys")
}

impl Wallet {
    pub fn to_cache(&self) -> WalletCache {
        WalletCache {
            transfers: self.transfers.transfers().to_vec(),
            hash_chain: self.hash_chain.clone(),
            payments: self.payments.clone(),
            unconfirmed_payments: self.unconfirmed_payments.clone(),
            confirmed_txs: self.confirmed_txs.clone(),
            unconfirmed_txs: self.unconfirmed_txs.clone(),
            ring_db: self.ring_db.clone(),
            subaddresses: self.subaddresses.clone(),
        }
    }

    /// Replace the chain state with `cache`. The ledger indices are rebuilt
    /// and checked.
    pub fn restore_cache(&mut self, cache: WalletCache) -> Result<(), WalletError> {
        self.transfers = TransferLedger::from_transfers(cache.transfers)?;
        self.hash_chain = cache.hash_chain;
        self.payments = cache.payments;
        self.unconfirmed_payments = cache.unconfirmed_payments;
        self.confirmed_txs = cache.confirmed_txs;
        self.unconfirmed_txs = cache.unconfirmed_txs;
        self.ring_db = cache.ring_db;
        self.subaddresses = cache.subaddresses;
        Ok(())
    }

    pub fn encrypt_cache(&mut self, password: &str) -> Result<Vec<u8>, WalletError> {
        let plaintext = bincode::serialize(&self.to_cache())
            .map_err(|e| WalletError::Serialization(format!("cache encoding failed: {e}")))?;
        let kdf = KdfParams::with_rounds(self.config.kdf_rounds);
        let sealed = seal(&plaintext, password, &kdf, &mut self.rng)?;
        let file = CacheFile {
            magic: CACHE_MAGIC,
            version: CACHE_VERSION,
            kdf,
            salt: sealed.salt,
            nonce: sealed.nonce,
            ciphertext: sealed.ciphertext,
        };
        bincode::serialize(&file).map_err(|e| WalletError::Serialization(format!("cache container encoding failed: {e}")))
    }
}

pub fn decrypt_cache(blob: &[u8], password: &str) -> Result<WalletCache, WalletError> {
    let file: CacheFile =
        bincode::deserialize(blob).map_err(|e| WalletError::Corrupt(format!("invalid cache container: {e}")))?;
    if file.magic != CACHE_MAGIC {
        return Err(WalletError::Corrupt("not a wallet cache".into()));
    }
    if file.version != CACHE_VERSION {
        return Err(WalletError::Corrupt(format!("unsupported cache version: {}", file.version)));
    }
    let plaintext = open(&file.salt, &file.nonce, &file.ciphertext, password, &file.kdf)?;
    bincode::deserialize(&plaintext).map_err(|e| WalletError::Corrupt(format!("invalid cache contents: {e}")))
}

/// Write the key file and the cache.
pub fn save_wallet(wallet: &mut Wallet, path: &Path, password: &str) -> Result<(), WalletError> {
    let kdf = KdfParams::with_rounds(wallet.config.kdf_rounds);
    let keystore = encrypt_keys(&wallet.keys, password, &kdf, &mut wallet.rng)?;
    save_keystore(&keystore, &keys_path(path))?;

    let blob = wallet.encrypt_cache(password)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, blob)?;
    std::fs::rename(&tmp, path)?;
    info!(path = %path.display(), transfers = wallet.transfers.len(), "wallet saved");
    Ok(())
}

/// Open the wallet at `path`. A missing cache file gives a wallet with no
/// chain state.
pub fn load_wallet(path: &Path, password: &str, config: WalletConfig) -> Result<Wallet, WalletError> {
    let keystore = load_keystore(&keys_path(path))?;
    let keys = decrypt_keys(&keystore, password)?;
    let mut wallet = Wallet::new(keys, config)?;
    match std::fs::read(path) {
        Ok(blob) => {
            let cache = decrypt_cache(&blob, password)?;
            wallet.restore_cache(cache)?;
            info!(path = %path.display(), height = wallet.hash_chain.size(), "wallet loaded");
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no cache file, starting from scratch");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(wallet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::AccountKeys;
    use crate::payments::TxState;
    use crate::ring_db::OutputId;
    use crate::transfers::tests::td;
    use umbra_types::{BlockHash, KeyImage, SubaddressIndex, TransactionPrefix, TxExtra};

    fn config() -> WalletConfig {
        WalletConfig {
            kdf_rounds: 1,
            subaddress_lookahead_major: 2,
            subaddress_lookahead_minor: 5,
            worker_threads: 1,
            ..WalletConfig::dev()
        }
    }

    fn populated() -> Wallet {
        let keys = AccountKeys::from_seed(&[9u8; 32]);
        let mut wallet = Wallet::new(keys, config()).unwrap().with_rng_seed(3);
        wallet.hash_chain.push_back(BlockHash::new([1; 32]));
        wallet.hash_chain.push_back(BlockHash::new([2; 32]));
        wallet.transfers.push(td(1, 1)).unwrap();
        wallet.transfers.push(td(2, 1)).unwrap();
        wallet.transfers.set_spent(0, 1).unwrap();
        wallet.payments.push(PaymentDetail {
            txid: TxHash::new([1; 32]),
            amount: 1_000,
            block_height: 1,
            unlock_time: 0,
            timestamp: 1_700_000_000,
            subaddr_index: SubaddressIndex::PRIMARY,
            coinbase: false,
        });
        wallet.unconfirmed_txs.insert(
            TxHash::new([5; 32]),
            UnconfirmedTransferDetail {
                tx: TransactionPrefix {
                    version: 2,
                    unlock_time: 0,
                    inputs: vec![],
                    outputs: vec![],
                    extra: TxExtra::default(),
                },
                amount_in: 3,
                amount_out: 2,
                change: 0,
                sent_time: 1,
                dests: vec![],
                state: TxState::Pending,
                timestamp: 1,
                subaddr_account: 0,
                subaddr_indices: vec![0],
                rings: vec![],
            },
        );
        wallet.ring_db.set_ring(KeyImage([1; 32]), vec![3, 8, 13]);
        wallet.ring_db.blackball(OutputId { amount: 0, index: 8 });
        wallet
            .subaddresses
            .expand(&wallet.keys.clone(), SubaddressIndex::new(0, 4))
            .unwrap();
        wallet
    }

    #[test]
    fn save_then_load_is_lossless() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet");
        let mut wallet = populated();
        save_wallet(&mut wallet, &path, "hunter2").unwrap();
        assert!(keys_path(&path).exists());

        let loaded = load_wallet(&path, "hunter2", config()).unwrap();
        assert_eq!(loaded.to_cache(), wallet.to_cache());
        assert_eq!(loaded.keys().spend_public, wallet.keys().spend_public);
        assert_eq!(loaded.balance(0), wallet.balance(0));
        assert_eq!(loaded.transfers().find_by_key_image(&KeyImage([2; 32])), Some(1));
    }

    #[test]
    fn wrong_password_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet");
        let mut wallet = populated();
        save_wallet(&mut wallet, &path, "right").unwrap();
        assert!(matches!(
            load_wallet(&path, "wrong", config()),
            Err(WalletError::InvalidPassword)
        ));
    }

    #[test]
    fn cache_under_a_different_password_is_rejected() {
        let mut wallet = populated();
        let blob = wallet.encrypt_cache("one").unwrap();
        assert!(matches!(decrypt_cache(&blob, "two"), Err(WalletError::InvalidPassword)));
    }

    #[test]
    fn damaged_cache_is_corrupt() {
        let mut wallet = populated();
        let mut blob = wallet.encrypt_cache("pw").unwrap();
        blob[0] ^= 0xff;
        assert!(matches!(decrypt_cache(&blob, "pw"), Err(WalletError::Corrupt(_))));
        assert!(matches!(decrypt_cache(&[1, 2, 3], "pw"), Err(WalletError::Corrupt(_))));
    }

    #[test]
    fn missing_cache_loads_empty_chain_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet");
        let mut wallet = populated();
        save_wallet(&mut wallet, &path, "pw").unwrap();
        std::fs::remove_file(&path).unwrap();
        let loaded = load_wallet(&path, "pw", config()).unwrap();
        assert!(loaded.transfers().is_empty());
        assert!(loaded.hash_chain().is_empty());
    }
}

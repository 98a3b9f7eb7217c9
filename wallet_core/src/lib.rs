//! Wallet core library for Umbra.
//!
//! Provides everything a wallet application needs:
//! - Account keys, subaddresses and the encrypted key file
//! - Following the daemon's chain: refresh, output scanning, reorg handling
//! - The ledger of owned outputs with balances and unlock rules
//! - Fee and ring size policy tied to the hard-fork schedule
//! - Decoy selection, output selection and transaction building
//! - M-of-N multisig candidate sets
//! - Persistence of the wallet cache

pub mod clock;
pub mod config;
pub mod daemon;
pub mod daemon_client;
pub mod decoys;
pub mod error;
pub mod events;
pub mod fee;
pub mod hash_chain;
pub mod keys;
pub mod keystore;
pub mod multisig;
pub mod payments;
pub mod refresh;
pub mod ring_db;
pub mod scanner;
pub mod selection;
pub mod storage;
pub mod subaddress;
pub mod transfers;
pub mod tx_builder;
pub mod wallet;

pub use clock::{Clock, SystemClock};
pub use config::WalletConfig;
pub use daemon::{BlockSource, ConsensusOracle, Daemon};
pub use daemon_client::DaemonClient;
pub use error::{DaemonError, WalletError};
pub use events::{EventBus, WalletEvent};
pub use hash_chain::HashChain;
pub use keys::{AccountKeys, Address};
pub use keystore::{decrypt_keys, encrypt_keys, load_keystore, save_keystore, KdfParams, KeystoreFile};
pub use multisig::MultisigTxSet;
pub use refresh::{RefreshSummary, StopHandle};
pub use ring_db::{OutputId, RingDatabase};
pub use storage::{load_wallet, save_wallet, WalletCache};
pub use transfers::{TransferDetail, TransferLedger};
pub use tx_builder::{PendingTx, TxDestination};
pub use wallet::Wallet;

//! Fundamental types for the Umbra node and wallet.
//!
//! This crate defines the core types shared across every other crate in the workspace:
//! hashes, keys, key images, amounts, subaddress indices, timestamps, the
//! transaction and block data model, and per-network consensus parameters.

pub mod amount;
pub mod block;
pub mod error;
pub mod hash;
pub mod keys;
pub mod network;
pub mod params;
pub mod subaddress;
pub mod time;
pub mod transaction;

pub use amount::{format_amount, COIN};
pub use block::{Block, BlockHeader};
pub use error::UmbraError;
pub use hash::{BlockHash, TxHash};
pub use keys::{KeyDerivation, KeyImage, KeyPair, PublicKey, SecretKey, Signature};
pub use network::NetworkId;
pub use params::{HardforkEntry, NetworkParams};
pub use subaddress::SubaddressIndex;
pub use time::Timestamp;
pub use transaction::{
    RctSignatures, RctType, RingSignature, Transaction, TransactionPrefix, TxExtra, TxIn, TxOut,
    TxOutTarget,
};

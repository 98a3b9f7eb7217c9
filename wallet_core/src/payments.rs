//! Payment and transfer history records.

use serde::{Deserialize, Serialize};
use umbra_types::{KeyImage, SubaddressIndex, TransactionPrefix, TxHash};

use crate::tx_builder::TxDestination;

/// An incoming payment to one subaddress.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentDetail {
    pub txid: TxHash,
    pub amount: u64,
    /// Zero for pool payments.
    pub block_height: u64,
    pub unlock_time: u64,
    pub timestamp: u64,
    pub subaddr_index: SubaddressIndex,
    pub coinbase: bool,
}

/// Incoming payments carried by one pool transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolPayment {
    pub payments: Vec<PaymentDetail>,
    pub double_spend_seen: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxState {
    Pending,
    /// Missed once by a pool poll; failed if still missing on the next one.
    PendingNotInPool,
    Failed,
}

/// An outgoing transaction this wallet broadcast and has not yet seen in a
/// block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnconfirmedTransferDetail {
    pub tx: TransactionPrefix,
    pub amount_in: u64,
    /// Destinations plus change.
    pub amount_out: u64,
    pub change: u64,
    pub sent_time: u64,
    pub dests: Vec<TxDestination>,
    pub state: TxState,
    pub timestamp: u64,
    pub subaddr_account: u32,
    pub subaddr_indices: Vec<u32>,
    /// Absolute ring members per spent key image.
    pub rings: Vec<(KeyImage, Vec<u64>)>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedTransferDetail {
    pub amount_in: u64,
    pub amount_out: u64,
    pub change: u64,
    pub block_height: u64,
    pub dests: Vec<TxDestination>,
    pub timestamp: u64,
    pub unlock_time: u64,
    pub subaddr_account: u32,
    pub subaddr_indices: Vec<u32>,
    pub rings: Vec<(KeyImage, Vec<u64>)>,
}

impl ConfirmedTransferDetail {
    pub fn from_unconfirmed(utd: UnconfirmedTransferDetail, block_height: u64, timestamp: u64) -> Self {
        Self {
            amount_in: utd.amount_in,
            amount_out: utd.amount_out,
            change: utd.change,
            block_height,
            unlock_time: utd.tx.unlock_time,
            dests: utd.dests,
            timestamp,
            subaddr_account: utd.subaddr_account,
            subaddr_indices: utd.subaddr_indices,
            rings: utd.rings,
        }
    }
}

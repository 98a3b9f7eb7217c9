//! The wallet's output ledger.
//!
//! Every output the wallet owns is a [`TransferDetail`], kept in chain order.
//! Two indexes sit beside the list: key image → position and output public
//! key → position. They are only ever changed together with the list, and
//! [`TransferLedger::check_invariants`] verifies they agree.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use umbra_types::params::{
    DEFAULT_TX_SPENDABLE_AGE, LOCKED_TX_ALLOWED_DELTA_BLOCKS, LOCKED_TX_ALLOWED_DELTA_SECS,
    MAX_BLOCK_NUMBER,
};
use umbra_types::{KeyImage, PublicKey, SecretKey, SubaddressIndex, TxHash};

use crate::error::WalletError;

/// One output owned by the wallet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDetail {
    pub txid: TxHash,
    /// Position of the output within its transaction.
    pub internal_output_index: u64,
    /// Position of the output among all outputs of its amount class.
    pub global_output_index: u64,
    pub block_height: u64,
    /// Transaction public key the output was derived from.
    pub tx_pub_key: PublicKey,
    /// One-time output key.
    pub public_key: PublicKey,
    pub amount: u64,
    pub mask: SecretKey,
    pub rct: bool,
    pub key_image: KeyImage,
    pub key_image_known: bool,
    pub key_image_partial: bool,
    pub spent: bool,
    pub spent_height: u64,
    pub subaddr_index: SubaddressIndex,
    pub unlock_time: u64,
    pub frozen: bool,
}

impl TransferDetail {
    /// Amount class used to group decoys: 0 for confidential outputs.
    pub fn amount_class(&self) -> u64 {
        if self.rct {
            0
        } else {
            self.amount
        }
    }

    fn indexed_key_image(&self) -> Option<KeyImage> {
        (self.key_image_known && !self.key_image_partial).then_some(self.key_image)
    }
}

/// Chain height and wall-clock time used for unlock checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpendContext {
    /// Number of blocks in the chain.
    pub chain_height: u64,
    pub now: u64,
}

/// Whether an `unlock_time` has passed: below [`MAX_BLOCK_NUMBER`] it is a
/// height, otherwise a Unix timestamp.
pub fn is_tx_spendtime_unlocked(unlock_time: u64, ctx: SpendContext) -> bool {
    if unlock_time < MAX_BLOCK_NUMBER {
        ctx.chain_height.saturating_sub(1) + LOCKED_TX_ALLOWED_DELTA_BLOCKS >= unlock_time
    } else {
        ctx.now + LOCKED_TX_ALLOWED_DELTA_SECS >= unlock_time
    }
}

pub fn is_transfer_unlocked(td: &TransferDetail, ctx: SpendContext) -> bool {
    if !is_tx_spendtime_unlocked(td.unlock_time, ctx) {
        return false;
    }
    td.block_height + DEFAULT_TX_SPENDABLE_AGE <= ctx.chain_height
}

#[derive(Clone, Debug, Default)]
pub struct TransferLedger {
    transfers: Vec<TransferDetail>,
    key_images: HashMap<KeyImage, usize>,
    pub_keys: HashMap<PublicKey, usize>,
}

impl TransferLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger, with its indexes, from a stored transfer list.
    pub fn from_transfers(transfers: Vec<TransferDetail>) -> Result<Self, WalletError> {
        let mut ledger = Self::new();
        for td in transfers {
            ledger.push(td)?;
        }
        Ok(ledger)
    }

    pub fn push(&mut self, td: TransferDetail) -> Result<usize, WalletError> {
        if self.pub_keys.contains_key(&td.public_key) {
            return Err(WalletError::Internal(format!(
                "output key {} already in ledger",
                td.public_key
            )));
        }
        let idx = self.transfers.len();
        if let Some(ki) = td.indexed_key_image() {
            if self.key_images.insert(ki, idx).is_some() {
                return Err(WalletError::Internal(format!(
                    "key image {ki} already in ledger"
                )));
            }
        }
        self.pub_keys.insert(td.public_key, idx);
        self.transfers.push(td);
        Ok(idx)
    }

    pub fn get(&self, idx: usize) -> Option<&TransferDetail> {
        self.transfers.get(idx)
    }

    pub fn transfers(&self) -> &[TransferDetail] {
        &self.transfers
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    fn slot(&mut self, idx: usize) -> Result<&mut TransferDetail, WalletError> {
        let len = self.transfers.len();
        self.transfers
            .get_mut(idx)
            .ok_or_else(|| WalletError::Internal(format!("transfer index {idx} out of range ({len})")))
    }

    pub fn set_spent(&mut self, idx: usize, height: u64) -> Result<(), WalletError> {
        let td = self.slot(idx)?;
        td.spent = true;
        td.spent_height = height;
        Ok(())
    }

    pub fn set_unspent(&mut self, idx: usize) -> Result<(), WalletError> {
        let td = self.slot(idx)?;
        td.spent = false;
        td.spent_height = 0;
        Ok(())
    }

    pub fn freeze(&mut self, idx: usize) -> Result<(), WalletError> {
        self.slot(idx)?.frozen = true;
        Ok(())
    }

    pub fn thaw(&mut self, idx: usize) -> Result<(), WalletError> {
        self.slot(idx)?.frozen = false;
        Ok(())
    }

    pub fn find_by_key_image(&self, key_image: &KeyImage) -> Option<usize> {
        self.key_images.get(key_image).copied()
    }

    pub fn find_by_public_key(&self, public_key: &PublicKey) -> Option<usize> {
        self.pub_keys.get(public_key).copied()
    }

    /// Mark every output spent at or above `height` as unspent again.
    pub fn reset_spent_from(&mut self, height: u64) -> usize {
        let mut reset = 0;
        for td in self.transfers.iter_mut().filter(|td| td.spent && td.spent_height >= height) {
            td.spent = false;
            td.spent_height = 0;
            reset += 1;
        }
        reset
    }

    /// Roll the ledger back to before `height`: spends at or above it are
    /// undone and outputs received at or above it are erased, together with
    /// their index entries. Returns the number of outputs erased.
    pub fn detach_from(&mut self, height: u64) -> Result<usize, WalletError> {
        self.reset_spent_from(height);

        let first = self
            .transfers
            .iter()
            .position(|td| td.block_height >= height)
            .unwrap_or(self.transfers.len());

        for td in &self.transfers[first..] {
            if let Some(ki) = td.indexed_key_image() {
                if self.key_images.remove(&ki).is_none() {
                    return Err(WalletError::Internal(format!(
                        "key image {ki} missing from index during detach"
                    )));
                }
            }
            if self.pub_keys.remove(&td.public_key).is_none() {
                return Err(WalletError::Internal(format!(
                    "output key {} missing from index during detach",
                    td.public_key
                )));
            }
        }
        let removed = self.transfers.len() - first;
        self.transfers.truncate(first);
        Ok(removed)
    }

    /// Indices of outputs that can be selected for spending from `account`.
    /// An empty `minors` set accepts every subaddress of the account.
    pub fn unspent_indices(
        &self,
        account: u32,
        minors: &[u32],
        ctx: SpendContext,
    ) -> Vec<usize> {
        self.transfers
            .iter()
            .enumerate()
            .filter(|(_, td)| {
                !td.spent
                    && !td.frozen
                    && !td.key_image_partial
                    && td.subaddr_index.major == account
                    && (minors.is_empty() || minors.contains(&td.subaddr_index.minor))
                    && is_transfer_unlocked(td, ctx)
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Unspent, unfrozen total of `account`.
    pub fn balance(&self, account: u32) -> u64 {
        self.balance_per_subaddress(account).values().sum()
    }

    pub fn unlocked_balance(&self, account: u32, ctx: SpendContext) -> u64 {
        self.unlocked_balance_per_subaddress(account, ctx).values().sum()
    }

    pub fn balance_per_subaddress(&self, account: u32) -> HashMap<u32, u64> {
        let mut out = HashMap::new();
        for td in self.owned_unspent(account) {
            *out.entry(td.subaddr_index.minor).or_insert(0) += td.amount;
        }
        out
    }

    pub fn unlocked_balance_per_subaddress(&self, account: u32, ctx: SpendContext) -> HashMap<u32, u64> {
        let mut out = HashMap::new();
        for td in self.owned_unspent(account).filter(|td| is_transfer_unlocked(td, ctx)) {
            *out.entry(td.subaddr_index.minor).or_insert(0) += td.amount;
        }
        out
    }

    fn owned_unspent(&self, account: u32) -> impl Iterator<Item = &TransferDetail> {
        self.transfers
            .iter()
            .filter(move |td| !td.spent && !td.frozen && td.subaddr_index.major == account)
    }

    /// Verify the two indexes match the transfer list exactly.
    pub fn check_invariants(&self) -> Result<(), WalletError> {
        let mut indexed = 0;
        for (i, td) in self.transfers.iter().enumerate() {
            if let Some(ki) = td.indexed_key_image() {
                indexed += 1;
                if self.key_images.get(&ki) != Some(&i) {
                    return Err(WalletError::Internal(format!(
                        "key image index out of step at transfer {i}"
                    )));
                }
            }
            if self.pub_keys.get(&td.public_key) != Some(&i) {
                return Err(WalletError::Internal(format!(
                    "public key index out of step at transfer {i}"
                )));
            }
        }
        if indexed != self.key_images.len() || self.transfers.len() != self.pub_keys.len() {
            return Err(WalletError::Internal(format!(
                "index sizes {}/{} do not match {} transfers ({indexed} with key images)",
                self.key_images.len(),
                self.pub_keys.len(),
                self.transfers.len()
            )));
        }
        Ok(())
    }
}

impl PartialEq for TransferLedger {
    fn eq(&self, other: &Self) -> bool {
        self.transfers == other.transfers
    }
}

//! Blockchain scanning.
//!
//! Finding owned outputs is pure and runs on the wallet's worker pool: one
//! job per transaction matches outputs, then, after the pool joins, key
//! images for every match are computed in parallel. Ledger updates happen
//! afterwards on the calling thread, strictly in block order.

use rayon::prelude::*;
use std::collections::HashMap;
use tracing::{debug, info, trace, warn};
use umbra_crypto::{
    commit, commitment_mask, decrypt_amount, derivation_to_scalar, derive_secret_key,
    derive_subaddress_public_key, derive_view_tag, generate_key_derivation, generate_key_image,
    identity_mask,
};
use umbra_types::{
    KeyDerivation, KeyImage, PublicKey, RctType, SecretKey, SubaddressIndex, Transaction, TxHash,
    TxIn,
};

use crate::daemon::{BlockEntry, BlocksResponse};
use crate::daemon_client::check_blocks_shape;
use crate::error::{DaemonError, WalletError};
use crate::events::WalletEvent;
use crate::keys::AccountKeys;
use crate::payments::{ConfirmedTransferDetail, PaymentDetail, PoolPayment};
use crate::subaddress::SubaddressTable;
use crate::transfers::TransferDetail;
use crate::wallet::Wallet;

/// An output found to belong to the wallet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnedOutput {
    /// Position within the transaction.
    pub index: usize,
    /// The transaction key the output was derived from.
    pub tx_pub_key: PublicKey,
    pub subaddr_index: SubaddressIndex,
    pub amount: u64,
    pub mask: SecretKey,
    derivation: KeyDerivation,
    pub key_image: KeyImage,
}

/// Match a transaction's outputs against the account. Outputs whose
/// amount data does not check out are skipped.
pub fn scan_outputs(keys: &AccountKeys, table: &SubaddressTable, tx: &Transaction) -> Vec<OwnedOutput> {
    let extra = &tx.prefix.extra;
    let derive = |public: &PublicKey| match generate_key_derivation(public, &keys.view_secret) {
        Ok(d) => Some((*public, d)),
        Err(e) => {
            debug!(error = %e, "unusable transaction public key");
            None
        }
    };
    let main = extra.tx_pub_key.as_ref().and_then(derive);
    let additional: Vec<Option<(PublicKey, KeyDerivation)>> =
        extra.additional_pub_keys.iter().map(derive).collect();

    let mut found = Vec::new();
    for (i, out) in tx.prefix.outputs.iter().enumerate() {
        let index = i as u64;
        let candidates = main.iter().chain(additional.get(i).and_then(Option::as_ref));
        for (tx_pub_key, derivation) in candidates {
            if let Some(tag) = out.target.view_tag() {
                if derive_view_tag(derivation, index) != tag {
                    continue;
                }
            }
            let Ok(spend) = derive_subaddress_public_key(out.target.key(), derivation, index) else {
                continue;
            };
            let Some(subaddr_index) = table.lookup(&spend) else {
                continue;
            };
            let (amount, mask) = match tx.rct.rct_type {
                RctType::Null => (out.amount, identity_mask()),
                RctType::Simple => {
                    let (Some(encrypted), Some(commitment)) =
                        (tx.rct.encrypted_amounts.get(i), tx.rct.out_commitments.get(i))
                    else {
                        warn!(output = i, "owned output without amount data, skipping");
                        break;
                    };
                    let shared = derivation_to_scalar(derivation, index);
                    let amount = decrypt_amount(encrypted, &shared);
                    let mask = commitment_mask(&shared);
                    if commit(amount, &mask) != *commitment {
                        warn!(output = i, "owned output commitment does not match its amount, skipping");
                        break;
                    }
                    (amount, mask)
                }
            };
            found.push(OwnedOutput {
                index: i,
                tx_pub_key: *tx_pub_key,
                subaddr_index,
                amount,
                mask,
                derivation: *derivation,
                key_image: KeyImage([0u8; 32]),
            });
            break;
        }
    }
    found
}

fn fill_key_image(keys: &AccountKeys, tx: &Transaction, owned: &mut OwnedOutput) {
    let secret = derive_secret_key(
        &owned.derivation,
        owned.index as u64,
        &keys.subaddress_spend_secret(owned.subaddr_index),
    );
    owned.key_image = generate_key_image(tx.prefix.outputs[owned.index].target.key(), &secret);
}

/// What processing one batch of blocks did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub blocks_added: u64,
    pub received_money: bool,
}

impl Wallet {
    /// Scan `txs` on the worker pool. Returns matches aligned with `txs`.
    pub(crate) fn scan_transactions(&self, txs: &[&Transaction]) -> Vec<Vec<OwnedOutput>> {
        let keys = &self.keys;
        let table = &self.subaddresses;
        self.pool.install(|| {
            let mut matched: Vec<Vec<OwnedOutput>> =
                txs.par_iter().map(|tx| scan_outputs(keys, table, tx)).collect();
            matched
                .par_iter_mut()
                .zip(txs.par_iter())
                .for_each(|(owned, tx)| {
                    for o in owned.iter_mut() {
                        fill_key_image(keys, tx, o);
                    }
                });
            matched
        })
    }

    /// Record what `tx` does to the wallet. `output_indices` are the
    /// global indices of its outputs; pool transactions have none.
    #[allow(clippy::too_many_arguments)]
    pub fn process_new_transaction(
        &mut self,
        txid: TxHash,
        tx: &Transaction,
        output_indices: &[u64],
        height: u64,
        timestamp: u64,
        is_miner: bool,
        pool: bool,
    ) -> Result<bool, WalletError> {
        let owned = self.scan_transactions(&[tx]).pop().unwrap_or_default();
        self.apply_transaction(txid, tx, output_indices, height, timestamp, is_miner, pool, false, owned)
    }

    /// Ledger side of [`Self::process_new_transaction`], given the scan
    /// results. Returns whether any money was received.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn apply_transaction(
        &mut self,
        txid: TxHash,
        tx: &Transaction,
        output_indices: &[u64],
        height: u64,
        timestamp: u64,
        is_miner: bool,
        pool: bool,
        double_spend_seen: bool,
        owned: Vec<OwnedOutput>,
    ) -> Result<bool, WalletError> {
        if !pool && output_indices.len() != tx.prefix.outputs.len() {
            return Err(WalletError::Internal(format!(
                "transaction {txid} has {} outputs but {} global indices",
                tx.prefix.outputs.len(),
                output_indices.len()
            )));
        }

        let mut received: HashMap<SubaddressIndex, u64> = HashMap::new();
        for o in owned {
            if !pool {
                let public_key = *tx.prefix.outputs[o.index].target.key();
                if self.transfers.find_by_public_key(&public_key).is_some() {
                    warn!(%txid, output = o.index, "output key already owned, ignoring duplicate");
                    continue;
                }
                if self.transfers.find_by_key_image(&o.key_image).is_some() {
                    warn!(%txid, output = o.index, key_image = %o.key_image, "key image already owned, ignoring");
                    continue;
                }
                self.transfers.push(TransferDetail {
                    txid,
                    internal_output_index: o.index as u64,
                    global_output_index: output_indices[o.index],
                    block_height: height,
                    tx_pub_key: o.tx_pub_key,
                    public_key,
                    amount: o.amount,
                    mask: o.mask,
                    rct: tx.is_rct(),
                    key_image: o.key_image,
                    key_image_known: true,
                    key_image_partial: false,
                    spent: false,
                    spent_height: 0,
                    subaddr_index: o.subaddr_index,
                    unlock_time: tx.prefix.unlock_time,
                    frozen: false,
                })?;
                self.subaddresses.expand(&self.keys, o.subaddr_index)?;
                info!(%txid, height, amount = o.amount, subaddr = %o.subaddr_index, "received money");
                self.events.emit(&WalletEvent::MoneyReceived {
                    txid,
                    height,
                    amount: o.amount,
                    subaddr_index: o.subaddr_index,
                });
            }
            *received.entry(o.subaddr_index).or_insert(0) += o.amount;
        }

        let mut spent = 0u64;
        let mut spent_account = None;
        for input in &tx.prefix.inputs {
            let key_image = match input {
                TxIn::Gen { .. } => continue,
                TxIn::ToKey { key_image, .. } => key_image,
            };
            let Some(idx) = self.transfers.find_by_key_image(key_image) else {
                continue;
            };
            let td = self.transfer(idx)?;
            let (amount, subaddr_index) = (td.amount, td.subaddr_index);
            spent += amount;
            spent_account = Some(subaddr_index.major);
            if !pool {
                self.transfers.set_spent(idx, height)?;
                info!(%txid, height, amount, "spent money");
                self.events.emit(&WalletEvent::MoneySpent {
                    txid,
                    height,
                    amount,
                    subaddr_index,
                });
            }
        }

        if spent > 0 && !pool {
            let self_received: u64 = received
                .iter()
                .filter(|(i, _)| Some(i.major) == spent_account)
                .map(|(_, a)| a)
                .sum();
            self.process_outgoing(txid, tx, height, timestamp, spent, self_received, spent_account);
        }
        if let Some(account) = spent_account {
            received.retain(|i, _| i.major != account);
        }

        let received_money = !received.is_empty();
        let mut payments: Vec<PaymentDetail> = received
            .into_iter()
            .map(|(subaddr_index, amount)| PaymentDetail {
                txid,
                amount,
                block_height: if pool { 0 } else { height },
                unlock_time: tx.prefix.unlock_time,
                timestamp,
                subaddr_index,
                coinbase: is_miner,
            })
            .collect();
        payments.sort_by_key(|p| p.subaddr_index);

        if pool {
            if !payments.is_empty() {
                for p in &payments {
                    self.events.emit(&WalletEvent::UnconfirmedMoneyReceived {
                        txid,
                        amount: p.amount,
                        subaddr_index: p.subaddr_index,
                    });
                }
                self.unconfirmed_payments.insert(
                    txid,
                    PoolPayment {
                        payments,
                        double_spend_seen,
                    },
                );
            }
        } else {
            self.payments.extend(payments);
            self.unconfirmed_payments.remove(&txid);
        }
        Ok(received_money)
    }

    #[allow(clippy::too_many_arguments)]
    fn process_outgoing(
        &mut self,
        txid: TxHash,
        tx: &Transaction,
        height: u64,
        timestamp: u64,
        spent: u64,
        self_received: u64,
        account: Option<u32>,
    ) {
        if let Some(utd) = self.unconfirmed_txs.remove(&txid) {
            debug!(%txid, height, "outgoing transaction confirmed");
            self.confirmed_txs
                .insert(txid, ConfirmedTransferDetail::from_unconfirmed(utd, height, timestamp));
            return;
        }
        // Sent from another copy of this wallet.
        let entry = self.confirmed_txs.entry(txid).or_insert_with(|| ConfirmedTransferDetail {
            amount_in: spent,
            amount_out: spent.saturating_sub(tx.fee()),
            change: self_received,
            block_height: height,
            dests: Vec::new(),
            timestamp,
            unlock_time: tx.prefix.unlock_time,
            subaddr_account: account.unwrap_or(0),
            subaddr_indices: Vec::new(),
            rings: Vec::new(),
        });
        entry.block_height = height;
    }

    /// Roll the wallet back to before `height`: spends at or above it are
    /// undone, outputs received at or above it are forgotten, and the hash
    /// chain, incoming payments and confirmed transfers are cut there.
    pub fn detach_blockchain(&mut self, height: u64) -> Result<(), WalletError> {
        let offset = self.hash_chain.offset();
        if height < offset && self.hash_chain.size() > offset {
            return Err(WalletError::Internal(format!(
                "cannot detach at {height}, below the hash chain offset {offset}"
            )));
        }
        let removed = self.transfers.detach_from(height)?;
        let blocks = self.hash_chain.size().saturating_sub(height);
        self.hash_chain.crop(height);
        self.payments.retain(|p| p.block_height < height);
        self.confirmed_txs.retain(|_, c| c.block_height < height);
        info!(height, blocks, transfers = removed, "detached blockchain");
        Ok(())
    }

    fn process_block(
        &mut self,
        height: u64,
        entry: &BlockEntry,
        indices: &[Vec<u64>],
        mut owned: Vec<Vec<OwnedOutput>>,
    ) -> Result<bool, WalletError> {
        let timestamp = entry.block.header.timestamp;
        let mut received = false;
        let txs: Vec<&Transaction> = std::iter::once(&entry.block.miner_tx).chain(&entry.txs).collect();
        for (pos, (tx, tx_indices)) in txs.iter().copied().zip(indices).enumerate() {
            let table_size = self.subaddresses.len();
            let found = std::mem::take(&mut owned[pos]);
            received |= self.apply_transaction(
                tx.hash(),
                tx,
                tx_indices,
                height,
                timestamp,
                pos == 0,
                false,
                false,
                found,
            )?;
            if self.subaddresses.len() > table_size && pos + 1 < txs.len() {
                let rescanned = self.scan_transactions(&txs[pos + 1..]);
                owned.truncate(pos + 1);
                owned.extend(rescanned);
            }
        }
        Ok(received)
    }

    /// Fold a batch of blocks from the daemon into the wallet. Blocks
    /// already known are skipped; a different block at a known height
    /// detaches the chain there first.
    pub fn process_parsed_blocks(&mut self, resp: &BlocksResponse) -> Result<BatchOutcome, WalletError> {
        check_blocks_shape(resp)?;
        let start = resp.start_height;
        if start < self.hash_chain.offset() {
            return Err(DaemonError::OutOfHashChainBounds.into());
        }

        let scan_from = self.config.refresh_from_block_height;
        let mut jobs: Vec<&Transaction> = Vec::new();
        let mut spans = Vec::with_capacity(resp.blocks.len());
        for (i, entry) in resp.blocks.iter().enumerate() {
            let first = jobs.len();
            if start + i as u64 >= scan_from {
                jobs.push(&entry.block.miner_tx);
                jobs.extend(entry.txs.iter());
            }
            spans.push(first..jobs.len());
        }
        let mut scanned = self.scan_transactions(&jobs);

        let mut outcome = BatchOutcome::default();
        for (i, (entry, indices)) in resp.blocks.iter().zip(&resp.output_indices).enumerate() {
            let height = start + i as u64;
            let owned: Vec<Vec<OwnedOutput>> = scanned[spans[i].clone()].iter_mut().map(std::mem::take).collect();
            let hash = entry.block.hash();

            if height < self.hash_chain.size() {
                if self.hash_chain.get(height) == Some(hash) {
                    trace!(height, %hash, "block already known");
                    continue;
                }
                if height == start {
                    return Err(WalletError::Internal(format!(
                        "daemon gave an inconsistent split at its first block {height}"
                    )));
                }
                warn!(height, %hash, "chain split detected");
                self.detach_blockchain(height)?;
            } else if height > self.hash_chain.size() {
                return Err(DaemonError::Malformed(format!(
                    "block {height} leaves a gap after the known tip {}",
                    self.hash_chain.size()
                ))
                .into());
            }

            if height >= scan_from {
                let table_size = self.subaddresses.len();
                outcome.received_money |= self.process_block(height, entry, indices, owned)?;
                let rest = spans[i].end;
                if self.subaddresses.len() > table_size && rest < jobs.len() {
                    debug!(height, remaining = jobs.len() - rest, "subaddress table grew, rescanning rest of batch");
                    let rescanned = self.scan_transactions(&jobs[rest..]);
                    scanned.truncate(rest);
                    scanned.extend(rescanned);
                }
            } else {
                trace!(height, "below refresh height, recording hash only");
            }
            self.hash_chain.push_back(hash);
            outcome.blocks_added += 1;
            self.events.emit(&WalletEvent::NewBlock { height, hash });
        }
        Ok(outcome)
    }
}

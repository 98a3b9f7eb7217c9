//! Nullable daemon: an in-memory chain that mines on request.
//!
//! Blocks are mined explicitly with [`NullDaemon::mine_block`], each paying
//! its coinbase to the given address and confirming whatever sits in the
//! pool. The hard-fork state machine runs over a [`NullChainStore`], so the
//! rule versions the wallet sees come from real votes. Transactions
//! submitted through [`BlockSource::send_raw_tx`] are checked the way a
//! daemon would: key images, ring signatures and commitment balance.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::debug;
use umbra_consensus::HardFork;
use umbra_crypto::{check_ring_signature, commitments_balance, rng_from_seed, zero_commit};
use umbra_types::params::{
    BLOCK_GRANTED_FULL_REWARD_ZONE_V5, DEFAULT_TX_SPENDABLE_AGE, DIFFICULTY_TARGET_SECS,
    HF_VERSION_VIEW_TAGS,
};
use umbra_types::transaction::relative_to_absolute;
use umbra_types::{
    Block, BlockHash, BlockHeader, KeyImage, NetworkId, NetworkParams, PublicKey, RctType,
    Transaction, TxHash, TxIn, COIN,
};
use umbra_wallet_core::daemon::{
    BlockEntry, BlocksResponse, FeeEstimate, HashesResponse, HistogramEntry, KeyImageStatus,
    OutputDistribution, OutputInfo, OutputRequest, PoolTx,
};
use umbra_wallet_core::fee::{fee_quantization_mask, get_dynamic_base_fee};
use umbra_wallet_core::transfers::{is_tx_spendtime_unlocked, SpendContext};
use umbra_wallet_core::tx_builder::construct_miner_tx;
use umbra_wallet_core::{AccountKeys, Address, BlockSource, ConsensusOracle, DaemonError, WalletError};

use crate::store::NullChainStore;

/// Coinbase reward of every mined block.
pub const BLOCK_REWARD: u64 = 10 * COIN;

/// Timestamp of the genesis block.
pub const GENESIS_TIMESTAMP: u64 = 1_700_000_000;

const BLOCKS_PER_REQUEST: usize = 20;
const HASHES_PER_REQUEST: usize = 1_000;

#[derive(Clone, Copy, Debug)]
struct StoredOutput {
    key: PublicKey,
    commitment: PublicKey,
    height: u64,
    timestamp: u64,
    unlock_time: u64,
    txid: TxHash,
}

struct ChainState {
    blocks: Vec<BlockEntry>,
    hashes: Vec<BlockHash>,
    heights: HashMap<BlockHash, u64>,
    /// Per block, per transaction (miner first), per output.
    output_indices: Vec<Vec<Vec<u64>>>,
    /// Outputs by amount class, in global index order.
    outputs: BTreeMap<u64, Vec<StoredOutput>>,
    spent: HashSet<KeyImage>,
    pool: Vec<PoolTx>,
    hardfork: HardFork<NullChainStore>,
    rng: StdRng,
    block_weight_limit: u64,
    failures: VecDeque<Option<DaemonError>>,
    rejected: Vec<String>,
}

/// An in-memory daemon. All calls serialize on one lock.
pub struct NullDaemon {
    state: Mutex<ChainState>,
}

fn amount_class(tx: &Transaction, amount: u64) -> u64 {
    if tx.is_rct() {
        0
    } else {
        amount
    }
}

fn rejected(reason: impl Into<String>) -> DaemonError {
    DaemonError::Rejected { reason: reason.into() }
}

impl ChainState {
    fn height(&self) -> u64 {
        self.blocks.len() as u64
    }

    fn tip_timestamp(&self) -> u64 {
        self.blocks
            .last()
            .map_or(GENESIS_TIMESTAMP, |b| b.block.header.timestamp)
    }

    fn take_failure(&mut self) -> Result<(), DaemonError> {
        match self.failures.pop_front() {
            Some(Some(e)) => Err(e),
            _ => Ok(()),
        }
    }

    /// Height of the first `history` hash on this chain, raised to
    /// `start_height`.
    fn split_height(&self, start_height: u64, history: &[BlockHash]) -> Result<u64, DaemonError> {
        if history.is_empty() {
            return Ok(start_height);
        }
        history
            .iter()
            .find_map(|h| self.heights.get(h).copied())
            .map(|split| split.max(start_height))
            .ok_or_else(|| rejected("no block of the short history is on the main chain"))
    }

    fn is_unlocked(&self, out: &StoredOutput) -> bool {
        let ctx = SpendContext {
            chain_height: self.height(),
            now: self.tip_timestamp(),
        };
        out.height + DEFAULT_TX_SPENDABLE_AGE <= ctx.chain_height && is_tx_spendtime_unlocked(out.unlock_time, ctx)
    }

    fn output(&self, amount: u64, index: u64) -> Result<&StoredOutput, DaemonError> {
        self.outputs
            .get(&amount)
            .and_then(|list| list.get(index as usize))
            .ok_or_else(|| rejected(format!("no output {index} for amount {amount}")))
    }

    /// Index `tx`'s outputs at `height`. Returns their global indices.
    fn index_outputs(&mut self, tx: &Transaction, txid: TxHash, height: u64, timestamp: u64) -> Vec<u64> {
        let mut indices = Vec::with_capacity(tx.prefix.outputs.len());
        for (i, out) in tx.prefix.outputs.iter().enumerate() {
            let commitment = match tx.rct.rct_type {
                RctType::Simple => tx.rct.out_commitments.get(i).copied(),
                RctType::Null => None,
            }
            .unwrap_or_else(|| zero_commit(out.amount));
            let list = self.outputs.entry(amount_class(tx, out.amount)).or_default();
            indices.push(list.len() as u64);
            list.push(StoredOutput {
                key: *out.target.key(),
                commitment,
                height,
                timestamp,
                unlock_time: tx.prefix.unlock_time,
                txid,
            });
        }
        indices
    }

    /// Reject what a daemon would refuse to relay.
    fn verify(&self, tx: &Transaction) -> Result<(), DaemonError> {
        if tx.is_coinbase() || tx.prefix.inputs.is_empty() {
            return Err(rejected("transaction has no spendable inputs"));
        }
        if tx.rct.ring_signatures.len() != tx.prefix.inputs.len() {
            return Err(rejected("ring signature count does not match inputs"));
        }
        let pooled: HashSet<&KeyImage> = self.pool.iter().flat_map(|p| p.tx.prefix.key_images()).collect();
        let mut seen = HashSet::new();
        let message = tx.signing_message();
        for (input, sig) in tx.prefix.inputs.iter().zip(&tx.rct.ring_signatures) {
            let TxIn::ToKey {
                amount,
                key_offsets,
                key_image,
            } = input
            else {
                return Err(rejected("coinbase input in a regular transaction"));
            };
            if !seen.insert(key_image) || self.spent.contains(key_image) || pooled.contains(key_image) {
                return Err(rejected(format!("double spend of key image {key_image}")));
            }
            let class = if tx.is_rct() { 0 } else { *amount };
            let ring = relative_to_absolute(key_offsets)
                .into_iter()
                .map(|index| self.output(class, index).map(|o| o.key))
                .collect::<Result<Vec<PublicKey>, _>>()?;
            if !check_ring_signature(&message, &ring, key_image, sig) {
                return Err(rejected(format!("invalid ring signature for key image {key_image}")));
            }
        }
        if tx.rct.rct_type == RctType::Simple {
            let balanced = commitments_balance(&tx.rct.pseudo_outs, &tx.rct.out_commitments, tx.rct.fee)
                .map_err(|e| rejected(format!("bad commitments: {e}")))?;
            if !balanced {
                return Err(rejected("commitments do not balance"));
            }
        }
        Ok(())
    }

    fn block_weight(entry: &BlockEntry) -> u64 {
        entry.block.miner_tx.weight() + entry.txs.iter().map(Transaction::weight).sum::<u64>()
    }
}

impl NullDaemon {
    /// A dev-network chain holding only its genesis block.
    pub fn new() -> Result<Self, WalletError> {
        Self::with_params(&NetworkParams::for_network(NetworkId::Dev), 0)
    }

    /// A chain following `params`' fork schedule. `seed` fixes the
    /// coinbase randomness, and with it every block hash.
    pub fn with_params(params: &NetworkParams, seed: u64) -> Result<Self, WalletError> {
        let mut hardfork = HardFork::for_network(NullChainStore::new(), params);
        hardfork
            .init()
            .map_err(|e| WalletError::Internal(format!("hard-fork state: {e}")))?;
        let daemon = Self {
            state: Mutex::new(ChainState {
                blocks: Vec::new(),
                hashes: Vec::new(),
                heights: HashMap::new(),
                output_indices: Vec::new(),
                outputs: BTreeMap::new(),
                spent: HashSet::new(),
                pool: Vec::new(),
                hardfork,
                rng: rng_from_seed(seed),
                block_weight_limit: 2 * BLOCK_GRANTED_FULL_REWARD_ZONE_V5,
                failures: VecDeque::new(),
                rejected: Vec::new(),
            }),
        };
        let genesis = AccountKeys::from_seed(&[0u8; 32]).address();
        daemon.mine_block(&genesis)?;
        Ok(daemon)
    }

    pub fn height(&self) -> u64 {
        self.state.lock().height()
    }

    pub fn block_hash(&self, height: u64) -> Option<BlockHash> {
        self.state.lock().hashes.get(height as usize).copied()
    }

    pub fn tip_hash(&self) -> Option<BlockHash> {
        self.state.lock().hashes.last().copied()
    }

    /// Mine one block paying `address` and confirming the whole pool.
    pub fn mine_block(&self, address: &Address) -> Result<BlockHash, WalletError> {
        let mut state = self.state.lock();
        let height = state.height();
        let major = state.hardfork.get_current_version();
        let vote = state.hardfork.get_ideal_version();
        let miner_tx = construct_miner_tx(
            address,
            height,
            BLOCK_REWARD,
            major >= HF_VERSION_VIEW_TAGS,
            &mut state.rng,
        )?;
        let txs: Vec<Transaction> = std::mem::take(&mut state.pool).into_iter().map(|p| p.tx).collect();
        let timestamp = GENESIS_TIMESTAMP + height * DIFFICULTY_TARGET_SECS;
        let block = Block {
            header: BlockHeader {
                major_version: major,
                minor_version: vote,
                timestamp,
                prev_id: state.hashes.last().copied().unwrap_or_default(),
                nonce: height as u32,
            },
            tx_hashes: txs.iter().map(Transaction::hash).collect(),
            miner_tx,
        };

        let mut indices = Vec::with_capacity(1 + txs.len());
        for tx in std::iter::once(&block.miner_tx).chain(&txs) {
            indices.push(state.index_outputs(tx, tx.hash(), height, timestamp));
            let images: Vec<KeyImage> = tx.prefix.key_images().copied().collect();
            state.spent.extend(images);
        }

        let stored = state.hardfork.store_mut().push_block(major, vote);
        let accepted = state
            .hardfork
            .add(major, vote, stored)
            .map_err(|e| WalletError::Internal(format!("hard-fork state: {e}")))?;
        if !accepted {
            return Err(WalletError::Internal(format!(
                "block {height} versions {major}/{vote} refused by the fork schedule"
            )));
        }

        let hash = block.hash();
        debug!(height, %hash, txs = txs.len(), major, "mined block");
        state.hashes.push(hash);
        state.heights.insert(hash, height);
        state.output_indices.push(indices);
        state.blocks.push(BlockEntry { block, txs });
        Ok(hash)
    }

    pub fn mine_blocks(&self, n: u64, address: &Address) -> Result<(), WalletError> {
        for _ in 0..n {
            self.mine_block(address)?;
        }
        Ok(())
    }

    /// Drop `n` blocks from the tip. Their transactions go back to the
    /// pool, as after a reorg. Returns how many blocks were removed.
    pub fn pop_blocks(&self, n: u64) -> Result<u64, WalletError> {
        let mut state = self.state.lock();
        // Genesis stays.
        let n = n.min(state.height().saturating_sub(1));
        let new_height = state.height() - n;
        let mut returned = Vec::new();
        for _ in 0..n {
            let (Some(entry), Some(hash)) = (state.blocks.pop(), state.hashes.pop()) else {
                break;
            };
            state.output_indices.pop();
            state.heights.remove(&hash);
            for tx in std::iter::once(&entry.block.miner_tx).chain(&entry.txs) {
                for ki in tx.prefix.key_images() {
                    state.spent.remove(ki);
                }
            }
            returned.extend(entry.txs);
        }
        for list in state.outputs.values_mut() {
            let keep = list.partition_point(|o| o.height < new_height);
            list.truncate(keep);
        }
        returned.reverse();
        let mut pool: Vec<PoolTx> = returned
            .into_iter()
            .map(|tx| PoolTx {
                txid: tx.hash(),
                tx,
                double_spend_seen: false,
            })
            .collect();
        pool.append(&mut state.pool);
        state.pool = pool;

        state.hardfork.store_mut().pop_blocks(n);
        state
            .hardfork
            .on_block_popped(n)
            .map_err(|e| WalletError::Internal(format!("hard-fork state: {e}")))?;
        debug!(popped = n, height = new_height, "popped blocks");
        Ok(n)
    }

    pub fn pool_txids(&self) -> Vec<TxHash> {
        self.state.lock().pool.iter().map(|p| p.txid).collect()
    }

    /// Evict a transaction from the pool without confirming it.
    pub fn drop_pool_tx(&self, txid: &TxHash) -> bool {
        let mut state = self.state.lock();
        let before = state.pool.len();
        state.pool.retain(|p| p.txid != *txid);
        state.pool.len() != before
    }

    pub fn clear_pool(&self) {
        self.state.lock().pool.clear();
    }

    /// Reasons given for every refused transaction so far.
    pub fn rejections(&self) -> Vec<String> {
        self.state.lock().rejected.clone()
    }

    /// Make the next daemon call fail with `error`. Queued failures are
    /// served one per call, in order.
    pub fn fail_next(&self, error: DaemonError) {
        self.state.lock().failures.push_back(Some(error));
    }

    /// Let the next call through when failures are queued behind it.
    pub fn succeed_next(&self) {
        self.state.lock().failures.push_back(None);
    }

    pub fn set_block_weight_limit(&self, limit: u64) {
        self.state.lock().block_weight_limit = limit;
    }
}

impl BlockSource for NullDaemon {
    fn get_height(&self) -> Result<u64, DaemonError> {
        let mut state = self.state.lock();
        state.take_failure()?;
        Ok(state.height())
    }

    fn get_blocks(&self, start_height: u64, short_history: &[BlockHash]) -> Result<BlocksResponse, DaemonError> {
        let mut state = self.state.lock();
        state.take_failure()?;
        let start = state.split_height(start_height, short_history)?.min(state.height()) as usize;
        let end = (start + BLOCKS_PER_REQUEST).min(state.blocks.len());
        Ok(BlocksResponse {
            start_height: start as u64,
            current_height: state.height(),
            blocks: state.blocks[start..end].to_vec(),
            output_indices: state.output_indices[start..end].to_vec(),
        })
    }

    fn get_hashes(&self, start_height: u64, short_history: &[BlockHash]) -> Result<HashesResponse, DaemonError> {
        let mut state = self.state.lock();
        state.take_failure()?;
        let start = state.split_height(start_height, short_history)?.min(state.height()) as usize;
        let end = (start + HASHES_PER_REQUEST).min(state.hashes.len());
        Ok(HashesResponse {
            start_height: start as u64,
            current_height: state.height(),
            hashes: state.hashes[start..end].to_vec(),
        })
    }

    fn get_output_histogram(
        &self,
        amounts: &[u64],
        min_count: u64,
        max_count: u64,
        unlocked: bool,
        recent_cutoff: u64,
    ) -> Result<Vec<HistogramEntry>, DaemonError> {
        let mut state = self.state.lock();
        state.take_failure()?;
        let classes: Vec<u64> = if amounts.is_empty() {
            state.outputs.keys().copied().collect()
        } else {
            amounts.to_vec()
        };
        let mut entries = Vec::new();
        for amount in classes {
            let list = state.outputs.get(&amount).map(Vec::as_slice).unwrap_or_default();
            let total = list.len() as u64;
            if total < min_count || (max_count != 0 && total > max_count) {
                continue;
            }
            let unlocked_instances = if unlocked {
                list.iter().filter(|o| state.is_unlocked(o)).count() as u64
            } else {
                total
            };
            entries.push(HistogramEntry {
                amount,
                unlocked_instances,
                recent_instances: list.iter().filter(|o| o.timestamp >= recent_cutoff).count() as u64,
                total_instances: total,
            });
        }
        Ok(entries)
    }

    fn get_output_distribution(&self, amount: u64, from_height: u64) -> Result<OutputDistribution, DaemonError> {
        let mut state = self.state.lock();
        state.take_failure()?;
        let list = state.outputs.get(&amount).map(Vec::as_slice).unwrap_or_default();
        let base = list.partition_point(|o| o.height < from_height) as u64;
        let cumulative = (from_height..state.height())
            .map(|h| list.partition_point(|o| o.height <= h) as u64)
            .collect();
        Ok(OutputDistribution {
            amount,
            start_height: from_height,
            base,
            cumulative,
        })
    }

    fn get_outputs(&self, requests: &[OutputRequest]) -> Result<Vec<OutputInfo>, DaemonError> {
        let mut state = self.state.lock();
        state.take_failure()?;
        requests
            .iter()
            .map(|r| {
                let out = state.output(r.amount, r.index)?;
                Ok(OutputInfo {
                    key: out.key,
                    commitment: out.commitment,
                    unlocked: state.is_unlocked(out),
                    height: out.height,
                    txid: out.txid,
                })
            })
            .collect()
    }

    fn is_key_image_spent(&self, key_images: &[KeyImage]) -> Result<Vec<KeyImageStatus>, DaemonError> {
        let mut state = self.state.lock();
        state.take_failure()?;
        let pooled: HashSet<&KeyImage> = state.pool.iter().flat_map(|p| p.tx.prefix.key_images()).collect();
        Ok(key_images
            .iter()
            .map(|ki| {
                if state.spent.contains(ki) {
                    KeyImageStatus::SpentInChain
                } else if pooled.contains(ki) {
                    KeyImageStatus::SpentInPool
                } else {
                    KeyImageStatus::Unspent
                }
            })
            .collect())
    }

    fn send_raw_tx(&self, blob: &[u8]) -> Result<(), DaemonError> {
        let mut state = self.state.lock();
        state.take_failure()?;
        let checked = Transaction::from_blob(blob)
            .map_err(|e| rejected(format!("undecodable transaction: {e}")))
            .and_then(|tx| state.verify(&tx).map(|()| tx));
        match checked {
            Ok(tx) => {
                let txid = tx.hash();
                debug!(%txid, "transaction added to pool");
                state.pool.push(PoolTx {
                    txid,
                    tx,
                    double_spend_seen: false,
                });
                Ok(())
            }
            Err(e) => {
                state.rejected.push(e.to_string());
                Err(e)
            }
        }
    }

    fn get_transaction_pool_hashes(&self) -> Result<Vec<TxHash>, DaemonError> {
        let mut state = self.state.lock();
        state.take_failure()?;
        Ok(state.pool.iter().map(|p| p.txid).collect())
    }

    fn get_pool_transactions(&self, txids: &[TxHash]) -> Result<Vec<PoolTx>, DaemonError> {
        let mut state = self.state.lock();
        state.take_failure()?;
        Ok(txids
            .iter()
            .filter_map(|id| state.pool.iter().find(|p| p.txid == *id).cloned())
            .collect())
    }

    fn get_block_weight_limit(&self) -> Result<u64, DaemonError> {
        let mut state = self.state.lock();
        state.take_failure()?;
        Ok(state.block_weight_limit)
    }

    fn get_recent_block_weights(&self, count: u64) -> Result<Vec<u64>, DaemonError> {
        let mut state = self.state.lock();
        state.take_failure()?;
        let from = state.blocks.len().saturating_sub(count as usize);
        Ok(state.blocks[from..].iter().map(ChainState::block_weight).collect())
    }

    /// Blocks needed to clear the pool transactions paying at least each
    /// per-byte fee level.
    fn estimate_backlog(&self, fee_levels: &[u64]) -> Result<Vec<u64>, DaemonError> {
        let mut state = self.state.lock();
        state.take_failure()?;
        let full_reward_zone = (state.block_weight_limit / 2).max(1);
        Ok(fee_levels
            .iter()
            .map(|&level| {
                let weight: u64 = state
                    .pool
                    .iter()
                    .map(|p| (p.tx.weight(), p.tx.fee()))
                    .filter(|&(w, fee)| fee >= level.saturating_mul(w))
                    .map(|(w, _)| w)
                    .sum();
                weight.div_ceil(full_reward_zone)
            })
            .collect())
    }

    fn get_fee_estimate(&self) -> Result<FeeEstimate, DaemonError> {
        let mut state = self.state.lock();
        state.take_failure()?;
        let version = state.hardfork.get_current_version();
        Ok(FeeEstimate {
            base_fee: get_dynamic_base_fee(BLOCK_REWARD, state.block_weight_limit / 2, version),
            quantization_mask: fee_quantization_mask(),
        })
    }
}

impl ConsensusOracle for NullDaemon {
    fn get_hardfork_version(&self) -> Result<u8, DaemonError> {
        let mut state = self.state.lock();
        state.take_failure()?;
        Ok(state.hardfork.get_current_version())
    }

    fn get_earliest_height(&self, version: u8) -> Result<Option<u64>, DaemonError> {
        let mut state = self.state.lock();
        state.take_failure()?;
        let height = state.hardfork.get_earliest_ideal_height_for_version(version);
        Ok((height != u64::MAX).then_some(height))
    }
}

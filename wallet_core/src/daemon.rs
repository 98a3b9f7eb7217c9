//! What the wallet needs from a daemon.
//!
//! [`BlockSource`] serves chain data and accepts transactions;
//! [`ConsensusOracle`] reports the active rule version. Both are blocking:
//! implementations serialize their own requests.

use serde::{Deserialize, Serialize};
use umbra_types::{Block, BlockHash, KeyImage, PublicKey, Transaction, TxHash};

use crate::error::DaemonError;

/// A block with the non-coinbase transactions it includes, in block order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub block: Block,
    pub txs: Vec<Transaction>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlocksResponse {
    /// Height of `blocks[0]`.
    pub start_height: u64,
    /// Chain height of the daemon when it answered.
    pub current_height: u64,
    pub blocks: Vec<BlockEntry>,
    /// Global output indices: per block, per transaction (miner tx first),
    /// per output.
    pub output_indices: Vec<Vec<Vec<u64>>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashesResponse {
    pub start_height: u64,
    pub current_height: u64,
    pub hashes: Vec<BlockHash>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramEntry {
    pub amount: u64,
    pub unlocked_instances: u64,
    pub recent_instances: u64,
    pub total_instances: u64,
}

/// Cumulative output counts per block for one amount class.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDistribution {
    pub amount: u64,
    pub start_height: u64,
    /// Outputs created before `start_height`.
    pub base: u64,
    /// `cumulative[i]` counts outputs up to and including block `start_height + i`.
    pub cumulative: Vec<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputRequest {
    pub amount: u64,
    pub index: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputInfo {
    pub key: PublicKey,
    pub commitment: PublicKey,
    pub unlocked: bool,
    pub height: u64,
    pub txid: TxHash,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyImageStatus {
    Unspent,
    SpentInChain,
    SpentInPool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolTx {
    pub txid: TxHash,
    pub tx: Transaction,
    pub double_spend_seen: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeEstimate {
    /// Per byte once per-byte fees are active, per kB before.
    pub base_fee: u64,
    pub quantization_mask: u64,
}

/// Chain data and transaction relay.
pub trait BlockSource: Send + Sync {
    fn get_height(&self) -> Result<u64, DaemonError>;

    /// Blocks from the later of `start_height` and the first hash in
    /// `short_history` the daemon recognises. The returned batch starts at
    /// that split block.
    fn get_blocks(
        &self,
        start_height: u64,
        short_history: &[BlockHash],
    ) -> Result<BlocksResponse, DaemonError>;

    /// Block hashes only, with the same split rule as [`Self::get_blocks`].
    fn get_hashes(
        &self,
        start_height: u64,
        short_history: &[BlockHash],
    ) -> Result<HashesResponse, DaemonError>;

    fn get_output_histogram(
        &self,
        amounts: &[u64],
        min_count: u64,
        max_count: u64,
        unlocked: bool,
        recent_cutoff: u64,
    ) -> Result<Vec<HistogramEntry>, DaemonError>;

    fn get_output_distribution(
        &self,
        amount: u64,
        from_height: u64,
    ) -> Result<OutputDistribution, DaemonError>;

    /// One answer per request, in request order.
    fn get_outputs(&self, requests: &[OutputRequest]) -> Result<Vec<OutputInfo>, DaemonError>;

    fn is_key_image_spent(
        &self,
        key_images: &[KeyImage],
    ) -> Result<Vec<KeyImageStatus>, DaemonError>;

    /// Submit a serialized transaction. A refusal is
    /// [`DaemonError::Rejected`].
    fn send_raw_tx(&self, blob: &[u8]) -> Result<(), DaemonError>;

    fn get_transaction_pool_hashes(&self) -> Result<Vec<TxHash>, DaemonError>;

    fn get_pool_transactions(&self, txids: &[TxHash]) -> Result<Vec<PoolTx>, DaemonError>;

    fn get_block_weight_limit(&self) -> Result<u64, DaemonError>;

    /// Weights of the last `count` blocks, oldest first.
    fn get_recent_block_weights(&self, count: u64) -> Result<Vec<u64>, DaemonError>;

    /// Pool backlog, in blocks, at each of the given fee levels.
    fn estimate_backlog(&self, fee_levels: &[u64]) -> Result<Vec<u64>, DaemonError>;

    fn get_fee_estimate(&self) -> Result<FeeEstimate, DaemonError>;
}

/// Which consensus rules are in force.
pub trait ConsensusOracle: Send + Sync {
    fn get_hardfork_version(&self) -> Result<u8, DaemonError>;

    /// First height at which `version` is active, or `None` if it never was.
    fn get_earliest_height(&self, version: u8) -> Result<Option<u64>, DaemonError>;
}

/// Everything the wallet talks to.
pub trait Daemon: BlockSource + ConsensusOracle {}

impl<T: BlockSource + ConsensusOracle> Daemon for T {}

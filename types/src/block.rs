//! Block data model.

use crate::hash::{digest, BlockHash, TxHash};
use crate::transaction::{Transaction, TxIn};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Consensus version the block was produced under.
    pub major_version: u8,
    /// Version the producer votes for.
    pub minor_version: u8,
    pub timestamp: u64,
    pub prev_id: BlockHash,
    pub nonce: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub miner_tx: Transaction,
    pub tx_hashes: Vec<TxHash>,
}

impl Block {
    pub fn hash(&self) -> BlockHash {
        let header = bincode::serialize(&self.header).unwrap_or_default();
        let mut parts: Vec<&[u8]> = Vec::with_capacity(2 + self.tx_hashes.len());
        let miner = self.miner_tx.hash();
        parts.push(&header);
        parts.push(miner.as_bytes());
        for h in &self.tx_hashes {
            parts.push(h.as_bytes());
        }
        BlockHash::new(digest(&parts))
    }

    /// Height recorded in the coinbase input, if the miner transaction is well formed.
    pub fn height(&self) -> Option<u64> {
        match self.miner_tx.prefix.inputs.as_slice() {
            [TxIn::Gen { height }] => Some(*height),
            _ => None,
        }
    }
}

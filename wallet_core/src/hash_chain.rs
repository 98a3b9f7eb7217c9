//! Block hashes the wallet has processed, indexed by height.
//!
//! The prefix below `offset` can be dropped (e.g. behind a checkpoint) while
//! the genesis hash is kept, so the chain still anchors short histories.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use umbra_types::BlockHash;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashChain {
    genesis: BlockHash,
    offset: u64,
    blocks: VecDeque<BlockHash>,
}

impl HashChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Height one past the last known block.
    pub fn size(&self) -> u64 {
        self.offset + self.blocks.len() as u64
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn genesis(&self) -> BlockHash {
        self.genesis
    }

    pub fn is_empty(&self) -> bool {
        self.offset == 0 && self.blocks.is_empty()
    }

    pub fn push_back(&mut self, hash: BlockHash) {
        if self.offset == 0 && self.blocks.is_empty() {
            self.genesis = hash;
        }
        self.blocks.push_back(hash);
    }

    /// Whether `height` is stored, as opposed to trimmed or beyond the tip.
    pub fn is_in_bounds(&self, height: u64) -> bool {
        height >= self.offset && height < self.size()
    }

    pub fn get(&self, height: u64) -> Option<BlockHash> {
        if height == 0 && self.size() > 0 {
            return Some(self.genesis);
        }
        if !self.is_in_bounds(height) {
            return None;
        }
        self.blocks.get((height - self.offset) as usize).copied()
    }

    /// Drop every block at or above `height`.
    pub fn crop(&mut self, height: u64) {
        let keep = height.saturating_sub(self.offset) as usize;
        self.blocks.truncate(keep);
    }

    /// Drop stored blocks below `height`, always keeping the last one.
    pub fn trim(&mut self, height: u64) {
        while height > self.offset && self.blocks.len() > 1 {
            self.blocks.pop_front();
            self.offset += 1;
        }
    }

    /// Jump straight to a trusted block: everything below `height` is
    /// treated as trimmed.
    pub fn skip_to(&mut self, height: u64, hash: BlockHash) {
        self.blocks.clear();
        self.offset = height;
        self.blocks.push_back(hash);
    }

    /// Start over from just the genesis block.
    pub fn reset_to_genesis(&mut self) {
        let genesis = self.genesis;
        self.blocks.clear();
        self.offset = 0;
        self.blocks.push_back(genesis);
    }

    /// Stored hashes from `offset` upwards.
    pub fn stored(&self) -> impl Iterator<Item = &BlockHash> {
        self.blocks.iter()
    }
}

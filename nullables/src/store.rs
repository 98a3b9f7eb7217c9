//! Nullable chain store: an in-memory block-version table for the
//! hard-fork state machine.

use umbra_consensus::{ConsensusError, HardforkStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct StoredBlock {
    major: u8,
    minor: u8,
    hard_fork_version: u8,
}

/// Blocks are pushed and popped at the tip; the state machine records the
/// rule version of each height through [`HardforkStore::set_hard_fork_version`].
#[derive(Clone, Debug, Default)]
pub struct NullChainStore {
    blocks: Vec<StoredBlock>,
}

impl NullChainStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a block with the given major (rule) and minor (vote) versions.
    /// Its recorded fork version starts out equal to its major version.
    pub fn push_block(&mut self, major: u8, minor: u8) -> u64 {
        self.blocks.push(StoredBlock {
            major,
            minor,
            hard_fork_version: major,
        });
        self.blocks.len() as u64 - 1
    }

    /// Drop up to `n` blocks from the tip. Returns how many were removed.
    pub fn pop_blocks(&mut self, n: u64) -> u64 {
        let n = n.min(self.blocks.len() as u64);
        self.blocks.truncate(self.blocks.len() - n as usize);
        n
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    fn block(&self, height: u64) -> Result<&StoredBlock, ConsensusError> {
        self.blocks
            .get(height as usize)
            .ok_or_else(|| ConsensusError::Store(format!("no block at height {height}")))
    }
}

impl HardforkStore for NullChainStore {
    fn height(&self) -> Result<u64, ConsensusError> {
        Ok(self.blocks.len() as u64)
    }

    fn block_version(&self, height: u64) -> Result<u8, ConsensusError> {
        Ok(self.block(height)?.major)
    }

    fn block_vote(&self, height: u64) -> Result<u8, ConsensusError> {
        Ok(self.block(height)?.minor)
    }

    fn hard_fork_version(&self, height: u64) -> Result<u8, ConsensusError> {
        Ok(self.block(height)?.hard_fork_version)
    }

    fn set_hard_fork_version(&mut self, height: u64, version: u8) -> Result<(), ConsensusError> {
        let block = self
            .blocks
            .get_mut(height as usize)
            .ok_or_else(|| ConsensusError::Store(format!("no block at height {height}")))?;
        block.hard_fork_version = version;
        Ok(())
    }
}

//! Chain-store interface consumed by the hard-fork state machine.
//!
//! The node's blockchain database implements this; tests use the in-memory
//! store from `umbra-nullables`.

use crate::error::ConsensusError;

/// Read access to block versions plus the per-height record of which rule
/// version was in force.
pub trait HardforkStore {
    /// Number of blocks in the chain (tip height + 1).
    fn height(&self) -> Result<u64, ConsensusError>;

    /// Major (rule) version declared by the block at `height`.
    fn block_version(&self, height: u64) -> Result<u8, ConsensusError>;

    /// Minor version of the block at `height`, which carries its vote.
    fn block_vote(&self, height: u64) -> Result<u8, ConsensusError>;

    /// Rule version recorded for `height` when the block was added.
    fn hard_fork_version(&self, height: u64) -> Result<u8, ConsensusError>;

    fn set_hard_fork_version(&mut self, height: u64, version: u8) -> Result<(), ConsensusError>;
}

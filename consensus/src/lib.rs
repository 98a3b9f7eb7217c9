//! Consensus state tracking for the node side.
//!
//! ## Module overview
//!
//! - [`hardfork`]: Hard-fork voting state machine: decides which rule
//!   version is active at each height from the versions miners vote for.
//! - [`store`]: The chain-store interface the state machine reads block
//!   versions from and records per-height versions into.
//! - [`quorum`]: Quorum vote types, signing and verification.
//! - [`vote_pool`]: Deduplicating pool of quorum votes with relay
//!   tracking, expiry, and checkpoint assembly.
//! - [`error`]: Consensus error types.

pub mod error;
pub mod hardfork;
pub mod quorum;
pub mod store;
pub mod vote_pool;

pub use error::ConsensusError;
pub use hardfork::{HardFork, HardforkParams, HardforkRecord, HardforkState, VotingInfo};
pub use quorum::{
    NewState, Quorum, QuorumGroup, QuorumVote, VoteKind, VotePayload, VoteVerificationContext,
};
pub use store::HardforkStore;
pub use vote_pool::{Checkpoint, ConsumedVote, PoolVoteEntry, VotePool, VoterSignature};

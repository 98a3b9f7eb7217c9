//! Quorum votes.
//!
//! A quorum is the set of validators chosen for a height. Validators vote
//! either to change a worker node's state (obligations) or to sign a block
//! hash as a checkpoint (checkpointing).

use serde::{Deserialize, Serialize};
use umbra_crypto::{blake2b_256_multi, sign_message, verify_signature};
use umbra_types::{BlockHash, PublicKey, SecretKey, Signature};

use crate::error::ConsensusError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteKind {
    Obligations,
    Checkpointing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuorumGroup {
    Validator,
    Worker,
}

/// State a worker node is voted into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NewState {
    Deregister,
    Decommission,
    Recommission,
    IpChangePenalty,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VotePayload {
    StateChange { worker_index: u32, state: NewState },
    Checkpoint { block_hash: BlockHash },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumVote {
    pub version: u8,
    pub kind: VoteKind,
    pub block_height: u64,
    pub group: QuorumGroup,
    pub index_in_group: u32,
    pub signature: Signature,
    pub payload: VotePayload,
}

/// Keys of the participants selected for one height.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quorum {
    pub validators: Vec<PublicKey>,
    pub workers: Vec<PublicKey>,
}

impl Quorum {
    pub fn key(&self, group: QuorumGroup, index: u32) -> Option<&PublicKey> {
        let members = match group {
            QuorumGroup::Validator => &self.validators,
            QuorumGroup::Worker => &self.workers,
        };
        members.get(index as usize)
    }
}

/// Outcome flags for one vote submission.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VoteVerificationContext {
    pub invalid_block_height: bool,
    pub invalid_vote_type: bool,
    pub invalid_group: bool,
    pub invalid_index: bool,
    pub signature_not_valid: bool,
    /// An identical vote was already pooled. Not a failure.
    pub duplicate_in_pool: bool,
    pub added_to_pool: bool,
}

impl VoteVerificationContext {
    /// True when the vote was rejected, as opposed to merely already known.
    pub fn verification_failed(&self) -> bool {
        self.invalid_block_height
            || self.invalid_vote_type
            || self.invalid_group
            || self.invalid_index
            || self.signature_not_valid
    }
}

impl QuorumVote {
    /// Hash the voter signs: everything except the signature.
    pub fn signing_hash(
        version: u8,
        kind: VoteKind,
        block_height: u64,
        payload: &VotePayload,
    ) -> Result<[u8; 32], ConsensusError> {
        let kind_tag = [match kind {
            VoteKind::Obligations => 0u8,
            VoteKind::Checkpointing => 1u8,
        }];
        let payload_bytes = bincode::serialize(payload)?;
        Ok(blake2b_256_multi(&[
            b"umbra.quorum.vote",
            &[version],
            &kind_tag,
            &block_height.to_le_bytes(),
            &payload_bytes,
        ]))
    }

    /// Build and sign a vote with the voter's Ed25519 seed.
    pub fn new_signed(
        version: u8,
        block_height: u64,
        group: QuorumGroup,
        index_in_group: u32,
        payload: VotePayload,
        secret: &SecretKey,
    ) -> Result<Self, ConsensusError> {
        let kind = match payload {
            VotePayload::StateChange { .. } => VoteKind::Obligations,
            VotePayload::Checkpoint { .. } => VoteKind::Checkpointing,
        };
        let hash = Self::signing_hash(version, kind, block_height, &payload)?;
        Ok(Self {
            version,
            kind,
            block_height,
            group,
            index_in_group,
            signature: sign_message(&hash, secret),
            payload,
        })
    }

    pub fn vote_signing_hash(&self) -> Result<[u8; 32], ConsensusError> {
        Self::signing_hash(self.version, self.kind, self.block_height, &self.payload)
    }

    /// Check kind/payload agreement, group and index bounds, and the
    /// signature against the quorum. Sets the matching context flag on failure.
    pub fn verify(&self, quorum: &Quorum, ctx: &mut VoteVerificationContext) -> bool {
        match (self.kind, &self.payload) {
            (VoteKind::Obligations, VotePayload::StateChange { worker_index, .. }) => {
                if self.group != QuorumGroup::Validator {
                    ctx.invalid_group = true;
                    return false;
                }
                if *worker_index as usize >= quorum.workers.len() {
                    ctx.invalid_index = true;
                    return false;
                }
            }
            (VoteKind::Checkpointing, VotePayload::Checkpoint { .. }) => {
                if self.group != QuorumGroup::Validator {
                    ctx.invalid_group = true;
                    return false;
                }
            }
            _ => {
                ctx.invalid_vote_type = true;
                return false;
            }
        }

        let Some(key) = quorum.key(self.group, self.index_in_group) else {
            ctx.invalid_index = true;
            return false;
        };
        let Ok(hash) = self.vote_signing_hash() else {
            ctx.signature_not_valid = true;
            return false;
        };
        if !verify_signature(&hash, &self.signature, key) {
            ctx.signature_not_valid = true;
            return false;
        }
        true
    }
}

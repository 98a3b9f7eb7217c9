//! Quorum vote pool.
//!
//! Votes are grouped per (height, kind, payload). Each group keeps at most
//! one vote per (group, index) voter, ordered by voter index, so the first N
//! entries of a group are always N distinct voters. Groups are dropped when
//! they age out of the vote lifetime or when the chain consumes them.

use crate::quorum::{NewState, Quorum, QuorumGroup, QuorumVote, VoteKind, VotePayload, VoteVerificationContext};
use serde::{Deserialize, Serialize};
use umbra_types::{BlockHash, Signature};

/// Blocks a vote stays valid for.
pub const VOTE_LIFETIME: u64 = 60;

/// Distinct validator signatures needed for a checkpoint.
pub const CHECKPOINT_MIN_VOTES: usize = 13;

/// Distinct validator votes needed to change a worker's state.
pub const STATE_CHANGE_MIN_VOTES: usize = 7;

/// Seconds before a relayed vote becomes relayable again.
pub const TIME_BETWEEN_RELAY_SECS: u64 = 60 * 2;

/// Upper bound on vote groups held at once.
pub const MAX_POOL_GROUPS: usize = 4096;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolVoteEntry {
    pub vote: QuorumVote,
    /// Unix time of the last relay, 0 if never relayed.
    pub time_last_sent: u64,
}

impl PoolVoteEntry {
    pub fn relayed(&self) -> bool {
        self.time_last_sent != 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct GroupKey {
    height: u64,
    kind: VoteKind,
    payload: VotePayload,
}

impl GroupKey {
    fn of(vote: &QuorumVote) -> Self {
        Self {
            height: vote.block_height,
            kind: vote.kind,
            payload: vote.payload,
        }
    }
}

struct VoteGroup {
    key: GroupKey,
    votes: Vec<PoolVoteEntry>,
}

/// A vote embedded in the chain, whose pooled copies are no longer needed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumedVote {
    StateChange {
        block_height: u64,
        worker_index: u32,
        state: NewState,
    },
    Checkpoint {
        block_height: u64,
        block_hash: BlockHash,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterSignature {
    pub voter_index: u32,
    pub signature: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: u64,
    pub block_hash: BlockHash,
    pub signatures: Vec<VoterSignature>,
}

#[derive(Default)]
pub struct VotePool {
    groups: Vec<VoteGroup>,
}

impl VotePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and pool a vote.
    ///
    /// Returns every vote now pooled for the vote's (height, kind, payload)
    /// when it was newly inserted, and an empty list otherwise. `ctx`
    /// records why a vote was not inserted.
    pub fn add_pool_vote_if_unique(
        &mut self,
        latest_height: u64,
        vote: &QuorumVote,
        ctx: &mut VoteVerificationContext,
        quorum: &Quorum,
    ) -> Vec<PoolVoteEntry> {
        if vote.block_height < latest_height && latest_height - vote.block_height > VOTE_LIFETIME {
            ctx.invalid_block_height = true;
            tracing::debug!(
                vote_height = vote.block_height,
                latest_height,
                "vote rejected: expired"
            );
            return Vec::new();
        }
        if vote.block_height > latest_height.saturating_add(VOTE_LIFETIME) {
            ctx.invalid_block_height = true;
            tracing::debug!(
                vote_height = vote.block_height,
                latest_height,
                "vote rejected: too far ahead"
            );
            return Vec::new();
        }
        if !vote.verify(quorum, ctx) {
            tracing::debug!(
                vote_height = vote.block_height,
                index = vote.index_in_group,
                "vote rejected: failed verification"
            );
            return Vec::new();
        }

        let key = GroupKey::of(vote);
        let pos = match self.groups.iter().position(|g| g.key == key) {
            Some(pos) => pos,
            None => {
                if self.groups.len() >= MAX_POOL_GROUPS {
                    self.evict_oldest_group();
                }
                self.groups.push(VoteGroup {
                    key,
                    votes: Vec::new(),
                });
                self.groups.len() - 1
            }
        };

        let group = &mut self.groups[pos];
        let slot = group.votes.binary_search_by(|e| {
            (group_rank(e.vote.group), e.vote.index_in_group)
                .cmp(&(group_rank(vote.group), vote.index_in_group))
        });
        match slot {
            Ok(_) => {
                ctx.duplicate_in_pool = true;
                Vec::new()
            }
            Err(at) => {
                group.votes.insert(
                    at,
                    PoolVoteEntry {
                        vote: vote.clone(),
                        time_last_sent: 0,
                    },
                );
                ctx.added_to_pool = true;
                group.votes.clone()
            }
        }
    }

    fn evict_oldest_group(&mut self) {
        if let Some((pos, _)) = self
            .groups
            .iter()
            .enumerate()
            .min_by_key(|(_, g)| g.key.height)
        {
            self.groups.remove(pos);
        }
    }

    /// Drop groups older than the vote lifetime relative to `height`.
    pub fn remove_expired_votes(&mut self, height: u64) {
        let min_height = height.saturating_sub(VOTE_LIFETIME);
        let before = self.groups.len();
        self.groups.retain(|g| g.key.height >= min_height);
        let removed = before - self.groups.len();
        if removed > 0 {
            tracing::debug!(height, removed, "expired vote groups removed");
        }
    }

    /// Drop groups whose outcome is now recorded on chain.
    pub fn remove_used_votes(&mut self, consumed: &[ConsumedVote]) {
        self.groups.retain(|g| {
            !consumed.iter().any(|c| match *c {
                ConsumedVote::StateChange {
                    block_height,
                    worker_index,
                    state,
                } => {
                    g.key.height == block_height
                        && g.key.payload
                            == VotePayload::StateChange {
                                worker_index,
                                state,
                            }
                }
                ConsumedVote::Checkpoint {
                    block_height,
                    block_hash,
                } => {
                    g.key.height == block_height
                        && g.key.payload == VotePayload::Checkpoint { block_hash }
                }
            })
        });
    }

    /// Votes never relayed or last relayed at least
    /// [`TIME_BETWEEN_RELAY_SECS`] before `now`.
    pub fn get_relayable_votes(&self, now: u64) -> Vec<QuorumVote> {
        let max_last_sent = now.saturating_sub(TIME_BETWEEN_RELAY_SECS);
        self.groups
            .iter()
            .flat_map(|g| g.votes.iter())
            .filter(|e| !e.relayed() || e.time_last_sent <= max_last_sent)
            .map(|e| e.vote.clone())
            .collect()
    }

    pub fn set_relayed(&mut self, votes: &[QuorumVote], now: u64) {
        for vote in votes {
            let key = GroupKey::of(vote);
            let Some(group) = self.groups.iter_mut().find(|g| g.key == key) else {
                continue;
            };
            if let Some(entry) = group.votes.iter_mut().find(|e| {
                e.vote.group == vote.group && e.vote.index_in_group == vote.index_in_group
            }) {
                entry.time_last_sent = now;
            }
        }
    }

    /// A checkpoint signed by the first [`CHECKPOINT_MIN_VOTES`] distinct
    /// validators, once that many have voted for `block_hash` at `height`.
    pub fn assemble_checkpoint(&self, height: u64, block_hash: BlockHash) -> Option<Checkpoint> {
        let key = GroupKey {
            height,
            kind: VoteKind::Checkpointing,
            payload: VotePayload::Checkpoint { block_hash },
        };
        let group = self.groups.iter().find(|g| g.key == key)?;
        if group.votes.len() < CHECKPOINT_MIN_VOTES {
            return None;
        }
        Some(Checkpoint {
            height,
            block_hash,
            signatures: group
                .votes
                .iter()
                .take(CHECKPOINT_MIN_VOTES)
                .map(|e| VoterSignature {
                    voter_index: e.vote.index_in_group,
                    signature: e.vote.signature.clone(),
                })
                .collect(),
        })
    }

    /// Whether enough validators agreed on a worker state change.
    pub fn state_change_ready(&self, height: u64, worker_index: u32, state: NewState) -> bool {
        let key = GroupKey {
            height,
            kind: VoteKind::Obligations,
            payload: VotePayload::StateChange {
                worker_index,
                state,
            },
        };
        self.groups
            .iter()
            .find(|g| g.key == key)
            .is_some_and(|g| g.votes.len() >= STATE_CHANGE_MIN_VOTES)
    }

    /// Total pooled votes.
    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.votes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

fn group_rank(group: QuorumGroup) -> u8 {
    match group {
        QuorumGroup::Validator => 0,
        QuorumGroup::Worker => 1,
    }
}

//! Hard-fork voting state machine.
//!
//! Every block declares the rule version it was built under (major version)
//! and the version its producer votes for (minor version). The machine keeps
//! a sliding window of the last `window_size` votes and activates a
//! scheduled fork once its height is reached and enough of the window votes
//! for that version or later.
//!
//! Forks only move forward while blocks are added. Rolling back is explicit:
//! [`HardFork::reorganize_from_block_height`] replays votes, while
//! [`HardFork::on_block_popped`] falls back to the height schedule alone.

use crate::error::ConsensusError;
use crate::store::HardforkStore;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use umbra_types::params::{
    DEFAULT_FORKED_TIME_SECS, DEFAULT_UPDATE_TIME_SECS, DEFAULT_VOTE_THRESHOLD, DEFAULT_VOTE_WINDOW,
};
use umbra_types::{Block, NetworkParams};

/// One scheduled fork.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardforkRecord {
    pub version: u8,
    pub height: u64,
    /// Percentage of the window that must vote for this version or later.
    pub threshold: u8,
    pub time: u64,
}

/// Static configuration of the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HardforkParams {
    pub original_version: u8,
    pub window_size: u64,
    pub default_threshold: u8,
    /// Seconds after the last scheduled fork before a node still on the old
    /// rules is considered forked off.
    pub forked_time: u64,
    /// Seconds after the last scheduled fork before an update is advised.
    pub update_time: u64,
}

impl Default for HardforkParams {
    fn default() -> Self {
        Self {
            original_version: 1,
            window_size: DEFAULT_VOTE_WINDOW,
            default_threshold: DEFAULT_VOTE_THRESHOLD,
            forked_time: DEFAULT_FORKED_TIME_SECS,
            update_time: DEFAULT_UPDATE_TIME_SECS,
        }
    }
}

impl HardforkParams {
    pub fn from_network(params: &NetworkParams) -> Self {
        Self {
            original_version: params.original_version,
            window_size: params.vote_window,
            default_threshold: params.default_threshold,
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HardforkState {
    /// The local schedule is current.
    Ready,
    /// The last scheduled fork is old enough that newer software likely exists.
    UpdateNeeded,
    /// The last scheduled fork is so old the network has likely moved on.
    LikelyForked,
}

/// Snapshot of how close a version is to activation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VotingInfo {
    /// Votes currently in the window.
    pub window: u32,
    /// Votes in the window for the queried version or later.
    pub votes: u32,
    /// Votes needed under the current fork's threshold.
    pub threshold: u32,
    /// Earliest height from which every scheduled version is at least the
    /// queried one; `u64::MAX` when no such height exists.
    pub earliest_height: u64,
    /// Highest scheduled version.
    pub voting: u8,
    /// Whether the queried version is already active.
    pub enabled: bool,
}

pub struct HardFork<S> {
    store: S,
    params: HardforkParams,
    heights: Vec<HardforkRecord>,
    versions: VecDeque<u8>,
    last_versions: [u32; 256],
    current_fork_index: usize,
}

/// `ceil(window * percent / 100)`.
fn required_votes(window: u64, threshold: u8) -> u64 {
    (window * threshold as u64 + 99) / 100
}

impl<S: HardforkStore> HardFork<S> {
    pub fn new(store: S, mut params: HardforkParams) -> Self {
        params.window_size = params.window_size.max(1);
        Self {
            store,
            params,
            heights: Vec::new(),
            versions: VecDeque::new(),
            last_versions: [0; 256],
            current_fork_index: 0,
        }
    }

    /// State machine loaded with a network's fork schedule. Call
    /// [`init`](Self::init) before feeding blocks.
    pub fn for_network(store: S, network: &NetworkParams) -> Self {
        let mut hf = Self::new(store, HardforkParams::from_network(network));
        for fork in &network.hard_forks {
            if !hf.add_fork(fork.version, fork.height, fork.threshold, fork.time) {
                tracing::warn!(
                    version = fork.version,
                    height = fork.height,
                    "ignoring out-of-order fork"
                );
            }
        }
        hf
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    // ── Schedule ─────────────────────────────────────────────────────────

    /// Schedule a fork. Rejected without mutation unless version, height and
    /// time all strictly exceed the previous record and `threshold <= 100`.
    pub fn add_fork(&mut self, version: u8, height: u64, threshold: u8, time: u64) -> bool {
        if version == 0 || threshold > 100 {
            return false;
        }
        if let Some(last) = self.heights.last() {
            if version <= last.version || height <= last.height || time <= last.time {
                return false;
            }
        }
        self.heights.push(HardforkRecord {
            version,
            height,
            threshold,
            time,
        });
        true
    }

    pub fn add_fork_default_threshold(&mut self, version: u8, height: u64, time: u64) -> bool {
        self.add_fork(version, height, self.params.default_threshold, time)
    }

    // ── Voting ───────────────────────────────────────────────────────────

    /// Clamp a vote to the highest scheduled version.
    fn effective_version(&self, voting_version: u8) -> u8 {
        match self.heights.last() {
            Some(last) if voting_version > last.version => last.version,
            _ => voting_version,
        }
    }

    /// Record at `idx`, or the original version while nothing is scheduled.
    fn record(&self, idx: usize) -> HardforkRecord {
        self.heights.get(idx).copied().unwrap_or(HardforkRecord {
            version: self.params.original_version,
            height: 0,
            threshold: 0,
            time: 0,
        })
    }

    fn current(&self) -> HardforkRecord {
        self.record(self.current_fork_index)
    }

    fn vote_at(&self, height: u64) -> Result<u8, ConsensusError> {
        // Blocks from before voting existed carry minor version 0, which
        // counts as a vote for version 1.
        Ok(match self.store.block_vote(height)? {
            0 => 1,
            v => v,
        })
    }

    fn clear_window(&mut self) {
        self.versions.clear();
        self.last_versions = [0; 256];
    }

    fn push_vote(&mut self, version: u8) {
        while self.versions.len() as u64 >= self.params.window_size {
            match self.versions.pop_front() {
                Some(old) => self.last_versions[old as usize] -= 1,
                None => break,
            }
        }
        self.last_versions[version as usize] += 1;
        self.versions.push_back(version);
    }

    /// Highest record index (never 0) whose height is reached at `height`
    /// and whose threshold is met by votes for its version or later;
    /// otherwise the current index.
    pub fn get_voted_fork_index(&self, height: u64) -> usize {
        let mut accumulated: u64 = 0;
        let mut upper = 256usize;
        for n in (1..self.heights.len()).rev() {
            let record = &self.heights[n];
            let version = record.version as usize;
            accumulated += self.last_versions[version..upper]
                .iter()
                .map(|&c| c as u64)
                .sum::<u64>();
            upper = version;
            let threshold = required_votes(self.params.window_size, record.threshold);
            if height >= record.height && accumulated >= threshold {
                return n;
            }
        }
        self.current_fork_index
    }

    /// Whether a block with these versions is acceptable on top of the
    /// current state.
    pub fn check(&self, block_version: u8, voting_version: u8) -> bool {
        let current = self.current();
        block_version == current.version && voting_version >= current.version
    }

    /// Like [`check`](Self::check) but against the fork voted in at `height`.
    pub fn check_for_height(&self, block_version: u8, voting_version: u8, height: u64) -> bool {
        let record = self.record(self.get_voted_fork_index(height));
        block_version == record.version && voting_version >= record.version
    }

    /// Record a new block. Returns `Ok(false)` without touching any state if
    /// the block's versions fail [`check`](Self::check).
    pub fn add(
        &mut self,
        block_version: u8,
        voting_version: u8,
        height: u64,
    ) -> Result<bool, ConsensusError> {
        if !self.check(block_version, voting_version) {
            tracing::debug!(height, block_version, voting_version, "block versions rejected");
            return Ok(false);
        }
        let version = self.current().version;
        self.store.set_hard_fork_version(height, version)?;

        let vote = self.effective_version(voting_version);
        self.push_vote(vote);

        let voted = self.get_voted_fork_index(height + 1);
        if voted > self.current_fork_index {
            self.current_fork_index = voted;
            tracing::info!(
                version = self.current().version,
                height = height + 1,
                "hard fork activated"
            );
        }
        Ok(true)
    }

    /// [`add`](Self::add) reading the versions from a block header.
    pub fn add_block(&mut self, block: &Block, height: u64) -> Result<bool, ConsensusError> {
        let vote = match block.header.minor_version {
            0 => 1,
            v => v,
        };
        self.add(block.header.major_version, vote, height)
    }

    // ── Rebuilding ───────────────────────────────────────────────────────

    /// Seed the placeholder record if no schedule was loaded, then rebuild
    /// the window from the last `window_size` blocks in the store.
    pub fn init(&mut self) -> Result<(), ConsensusError> {
        if self.heights.is_empty() {
            let placeholder = self.record(0);
            self.heights.push(placeholder);
        }
        self.clear_window();
        self.current_fork_index = 0;

        let mut height = self.store.height()?;
        if height > self.params.window_size {
            height -= self.params.window_size - 1;
        } else {
            height = 1;
        }
        self.rescan_from_chain_height(height)?;
        Ok(())
    }

    /// Rebuild the window from the votes of blocks `height..tip`, then take
    /// the fork recorded at the tip, advanced by voting if possible.
    pub fn rescan_from_block_height(&mut self, height: u64) -> Result<bool, ConsensusError> {
        let chain_height = self.store.height()?;
        if height >= chain_height {
            return Ok(false);
        }

        self.clear_window();
        for h in height..chain_height {
            let vote = self.effective_version(self.vote_at(h)?);
            self.push_vote(vote);
        }

        let last = self.store.hard_fork_version(chain_height - 1)?;
        self.current_fork_index = 0;
        while self.current_fork_index + 1 < self.heights.len()
            && self.heights[self.current_fork_index].version != last
        {
            self.current_fork_index += 1;
        }

        let voted = self.get_voted_fork_index(chain_height);
        if voted > self.current_fork_index {
            self.current_fork_index = voted;
        }
        Ok(true)
    }

    pub fn rescan_from_chain_height(&mut self, height: u64) -> Result<bool, ConsensusError> {
        if height == 0 {
            return Ok(false);
        }
        self.rescan_from_block_height(height - 1)
    }

    /// Roll the state back to just after block `height`, then replay every
    /// later block through [`add`](Self::add).
    pub fn reorganize_from_block_height(&mut self, height: u64) -> Result<bool, ConsensusError> {
        let chain_height = self.store.height()?;
        if height >= chain_height {
            return Ok(false);
        }

        self.clear_window();
        let rescan_height = height.saturating_sub(self.params.window_size - 1);
        let start_version = if height == 0 {
            self.params.original_version
        } else {
            self.store.hard_fork_version(height)?
        };
        while self.current_fork_index > 0 && self.current().version > start_version {
            self.current_fork_index -= 1;
        }

        for h in rescan_height..=height {
            let vote = self.effective_version(self.vote_at(h)?);
            self.push_vote(vote);
        }

        let voted = self.get_voted_fork_index(height + 1);
        if voted > self.current_fork_index {
            self.current_fork_index = voted;
        }

        for h in height + 1..chain_height {
            let major = self.store.block_version(h)?;
            let vote = self.vote_at(h)?;
            if !self.add(major, vote, h)? {
                tracing::warn!(height = h, major, vote, "block rejected while reorganizing");
            }
        }
        tracing::info!(from = height, tip = chain_height, "hard fork state reorganized");
        Ok(true)
    }

    pub fn reorganize_from_chain_height(&mut self, height: u64) -> Result<bool, ConsensusError> {
        if height == 0 {
            return Ok(false);
        }
        self.reorganize_from_block_height(height - 1)
    }

    /// Called after the store dropped `nblocks` from its tip.
    ///
    /// The window loses the popped votes and regains, at its front, the
    /// recorded versions of the blocks that slide back into range. The
    /// active fork is then recomputed from the height schedule only; votes
    /// are not re-applied on this path.
    pub fn on_block_popped(&mut self, nblocks: u64) -> Result<(), ConsensusError> {
        if nblocks == 0 {
            return Ok(());
        }
        let new_chain_height = self.store.height()?;
        let old_chain_height = new_chain_height + nblocks;
        for h in (new_chain_height..old_chain_height).rev() {
            if let Some(v) = self.versions.pop_back() {
                self.last_versions[v as usize] -= 1;
            }
            if h >= self.params.window_size {
                let reentering = h - self.params.window_size;
                let v = self.effective_version(self.store.hard_fork_version(reentering)?);
                self.versions.push_front(v);
                self.last_versions[v as usize] += 1;
            }
        }

        let tip = new_chain_height.saturating_sub(1);
        self.current_fork_index = (1..self.heights.len())
            .rev()
            .find(|&i| tip >= self.heights[i].height)
            .unwrap_or(0);
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────────────────

    /// Rule version in force at `height`: the live state at the chain
    /// height, the recorded version below it.
    pub fn get(&self, height: u64) -> Result<u8, ConsensusError> {
        let chain_height = self.store.height()?;
        if height > chain_height {
            return Err(ConsensusError::InvalidHeight {
                height,
                chain_height,
            });
        }
        if height == chain_height {
            return Ok(self.get_current_version());
        }
        self.store.hard_fork_version(height)
    }

    pub fn get_current_version(&self) -> u8 {
        self.current().version
    }

    /// Highest scheduled version.
    pub fn get_ideal_version(&self) -> u8 {
        self.heights
            .last()
            .map(|r| r.version)
            .unwrap_or(self.params.original_version)
    }

    /// Version the schedule alone prescribes at `height`.
    pub fn get_ideal_version_for_height(&self, height: u64) -> u8 {
        self.heights
            .iter()
            .rev()
            .find(|r| height >= r.height)
            .or_else(|| self.heights.first())
            .map(|r| r.version)
            .unwrap_or(self.params.original_version)
    }

    pub fn get_earliest_ideal_height_for_version(&self, version: u8) -> u64 {
        let mut height = u64::MAX;
        for record in self.heights.iter().rev() {
            if record.version >= version {
                height = record.height;
            } else {
                break;
            }
        }
        height
    }

    /// The version expected next: the one scheduled after the fork the
    /// chain height has reached, or the last one.
    pub fn get_next_version(&self) -> Result<u8, ConsensusError> {
        let height = self.store.height()?;
        for (i, record) in self.heights.iter().enumerate().rev() {
            if height >= record.height {
                let next = (i + 1).min(self.heights.len() - 1);
                return Ok(self.heights[next].version);
            }
        }
        Ok(self.params.original_version)
    }

    pub fn get_threshold(&self, version: u8) -> u8 {
        self.heights
            .iter()
            .find(|r| r.version == version)
            .map(|r| r.threshold)
            .unwrap_or(0)
    }

    pub fn get_state(&self, now: u64) -> HardforkState {
        if self.heights.len() <= 1 {
            return HardforkState::Ready;
        }
        let last = self.heights[self.heights.len() - 1].time;
        if now >= last.saturating_add(self.params.forked_time) {
            HardforkState::LikelyForked
        } else if now >= last.saturating_add(self.params.update_time) {
            HardforkState::UpdateNeeded
        } else {
            HardforkState::Ready
        }
    }

    pub fn get_voting_info(&self, version: u8) -> VotingInfo {
        let current = self.current();
        let window = self.versions.len() as u32;
        let votes: u32 = self.last_versions[version as usize..].iter().sum();
        VotingInfo {
            window,
            votes,
            threshold: required_votes(window as u64, current.threshold) as u32,
            earliest_height: self.get_earliest_ideal_height_for_version(version),
            voting: self.get_ideal_version(),
            enabled: current.version >= version,
        }
    }

    pub fn original_version(&self) -> u8 {
        self.params.original_version
    }

    pub fn window_size(&self) -> u64 {
        self.params.window_size
    }

    pub fn records(&self) -> &[HardforkRecord] {
        &self.heights
    }

    pub fn current_fork_index(&self) -> usize {
        self.current_fork_index
    }

    /// Votes currently in the window, oldest first.
    pub fn window(&self) -> impl Iterator<Item = u8> + '_ {
        self.versions.iter().copied()
    }

    pub fn vote_counts(&self) -> &[u32; 256] {
        &self.last_versions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Store with no blocks; enough for schedule-only tests.
    struct EmptyStore;

    impl HardforkStore for EmptyStore {
        fn height(&self) -> Result<u64, ConsensusError> {
            Ok(0)
        }
        fn block_version(&self, _: u64) -> Result<u8, ConsensusError> {
            Err(ConsensusError::Store("empty".into()))
        }
        fn block_vote(&self, _: u64) -> Result<u8, ConsensusError> {
            Err(ConsensusError::Store("empty".into()))
        }
        fn hard_fork_version(&self, _: u64) -> Result<u8, ConsensusError> {
            Err(ConsensusError::Store("empty".into()))
        }
        fn set_hard_fork_version(&mut self, _: u64, _: u8) -> Result<(), ConsensusError> {
            Ok(())
        }
    }

    fn hf() -> HardFork<EmptyStore> {
        HardFork::new(EmptyStore, HardforkParams::default())
    }

    #[test]
    fn threshold_rounds_up() {
        assert_eq!(required_votes(10, 50), 5);
        assert_eq!(required_votes(10, 51), 6);
        assert_eq!(required_votes(100, 60), 60);
        assert_eq!(required_votes(10080, 80), 8064);
        assert_eq!(required_votes(7, 0), 0);
    }

    #[test]
    fn add_fork_requires_strict_increase() {
        let mut hf = hf();
        assert!(hf.add_fork(1, 0, 0, 0));
        assert!(!hf.add_fork(1, 10, 0, 10));
        assert!(!hf.add_fork(2, 0, 0, 10));
        assert!(!hf.add_fork(2, 10, 0, 0));
        assert!(!hf.add_fork(2, 10, 101, 10));
        assert!(hf.add_fork(2, 10, 100, 10));
        assert_eq!(hf.records().len(), 2);
    }

    #[test]
    fn version_zero_is_rejected() {
        let mut hf = hf();
        assert!(!hf.add_fork(0, 0, 0, 0));
        assert!(hf.records().is_empty());
    }

    #[test]
    fn queries_before_init_fall_back_to_the_original_version() {
        let hf = hf();
        let original = hf.original_version();
        assert_eq!(hf.get_current_version(), original);
        assert!(hf.check(original, original));
        assert!(!hf.check(original + 1, original + 1));
        assert!(hf.check_for_height(original, original, 5));
        let info = hf.get_voting_info(original);
        assert!(info.enabled);
        assert_eq!(info.threshold, 0);
    }

    #[test]
    fn init_on_empty_chain_seeds_placeholder() {
        let mut hf = hf();
        hf.init().unwrap();
        assert_eq!(hf.records().len(), 1);
        assert_eq!(hf.get_current_version(), 1);
        assert_eq!(hf.window().count(), 0);
    }

    #[test]
    fn earliest_ideal_height_walks_back_while_versions_qualify() {
        let mut hf = hf();
        hf.add_fork(1, 0, 0, 0);
        hf.add_fork(2, 100, 0, 1);
        hf.add_fork(3, 200, 0, 2);
        assert_eq!(hf.get_earliest_ideal_height_for_version(2), 100);
        assert_eq!(hf.get_earliest_ideal_height_for_version(3), 200);
        assert_eq!(hf.get_earliest_ideal_height_for_version(1), 0);
        assert_eq!(hf.get_earliest_ideal_height_for_version(4), u64::MAX);
    }

    #[test]
    fn ideal_version_for_height_follows_schedule() {
        let mut hf = hf();
        hf.add_fork(1, 0, 0, 0);
        hf.add_fork(2, 100, 0, 1);
        assert_eq!(hf.get_ideal_version_for_height(99), 1);
        assert_eq!(hf.get_ideal_version_for_height(100), 2);
        assert_eq!(hf.get_ideal_version(), 2);
    }

    #[test]
    fn state_depends_on_last_fork_time() {
        let mut hf = hf();
        hf.add_fork(1, 0, 0, 0);
        assert_eq!(hf.get_state(u64::MAX), HardforkState::Ready);
        hf.add_fork(2, 100, 0, 1_000);
        assert_eq!(hf.get_state(1_000), HardforkState::Ready);
        assert_eq!(
            hf.get_state(1_000 + DEFAULT_UPDATE_TIME_SECS),
            HardforkState::UpdateNeeded
        );
        assert_eq!(
            hf.get_state(1_000 + DEFAULT_FORKED_TIME_SECS),
            HardforkState::LikelyForked
        );
    }

    #[test]
    fn get_above_chain_height_is_an_error() {
        let mut hf = hf();
        hf.init().unwrap();
        assert_eq!(hf.get(0).unwrap(), 1);
        assert!(matches!(
            hf.get(1),
            Err(ConsensusError::InvalidHeight {
                height: 1,
                chain_height: 0
            })
        ));
    }

    #[test]
    fn threshold_lookup() {
        let mut hf = hf();
        hf.add_fork(1, 0, 0, 0);
        hf.add_fork_default_threshold(2, 10, 1);
        assert_eq!(hf.get_threshold(2), DEFAULT_VOTE_THRESHOLD);
        assert_eq!(hf.get_threshold(9), 0);
    }
}

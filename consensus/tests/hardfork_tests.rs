//! Hard-fork state machine driven through the in-memory chain store.

use umbra_consensus::{HardFork, HardforkParams, HardforkStore};
use umbra_nullables::NullChainStore;

fn machine(window: u64, forks: &[(u8, u64, u8)]) -> HardFork<NullChainStore> {
    let params = HardforkParams {
        window_size: window,
        ..HardforkParams::default()
    };
    let mut hf = HardFork::new(NullChainStore::new(), params);
    for (time, &(version, height, threshold)) in forks.iter().enumerate() {
        assert!(hf.add_fork(version, height, threshold, time as u64));
    }
    hf.init().unwrap();
    hf
}

/// Append a block built under the current rules that votes for `vote`.
fn mine(hf: &mut HardFork<NullChainStore>, vote: u8) -> bool {
    let major = hf.get_current_version();
    let height = hf.store_mut().push_block(major, vote);
    hf.add(major, vote, height).unwrap()
}

fn assert_window_consistent(hf: &HardFork<NullChainStore>) {
    let total: u64 = hf.vote_counts().iter().map(|&c| c as u64).sum();
    assert_eq!(total, hf.window().count() as u64);
    assert!(hf.window().count() as u64 <= hf.window_size());
}

#[test]
fn sixty_of_hundred_activates() {
    let mut hf = machine(100, &[(1, 0, 0), (2, 1, 60)]);
    for _ in 0..40 {
        assert!(mine(&mut hf, 1));
    }
    for _ in 0..59 {
        assert!(mine(&mut hf, 2));
        assert_eq!(hf.get_current_version(), 1);
    }
    assert!(mine(&mut hf, 2));
    assert_eq!(hf.get_current_version(), 2);
    assert_window_consistent(&hf);
}

#[test]
fn fifty_nine_of_hundred_does_not_activate() {
    let mut hf = machine(100, &[(1, 0, 0), (2, 1, 60)]);
    for _ in 0..41 {
        mine(&mut hf, 1);
    }
    for _ in 0..59 {
        mine(&mut hf, 2);
    }
    assert_eq!(hf.get_current_version(), 1);

    // The window keeps sliding; old votes for 1 fall out, new ones replace them.
    for _ in 0..30 {
        mine(&mut hf, 1);
    }
    assert_eq!(hf.get_current_version(), 1);
    assert_eq!(hf.vote_counts()[2], 59);
}

#[test]
fn half_of_window_of_ten_activates_at_exactly_five() {
    let mut hf = machine(10, &[(1, 0, 0), (2, 1, 50)]);
    for _ in 0..4 {
        mine(&mut hf, 2);
    }
    assert_eq!(hf.get_current_version(), 1);
    mine(&mut hf, 2);
    assert_eq!(hf.get_current_version(), 2);
}

#[test]
fn fork_waits_for_its_height() {
    let mut hf = machine(10, &[(1, 0, 0), (2, 50, 50)]);
    for height in 0..49u64 {
        mine(&mut hf, 2);
        assert_eq!(hf.get_current_version(), 1, "active too early at {height}");
    }
    mine(&mut hf, 2);
    assert_eq!(hf.get_current_version(), 2);
}

#[test]
fn votes_for_later_versions_count_for_earlier_forks() {
    let mut hf = machine(10, &[(1, 0, 0), (2, 1, 50), (3, 2, 50)]);
    for _ in 0..5 {
        mine(&mut hf, 3);
    }
    assert_eq!(hf.get_current_version(), 3);
}

#[test]
fn votes_above_schedule_are_clamped() {
    let mut hf = machine(10, &[(1, 0, 0), (2, 1, 100)]);
    mine(&mut hf, 9);
    assert_eq!(hf.vote_counts()[9], 0);
    assert_eq!(hf.vote_counts()[2], 1);
}

#[test]
fn add_rejects_wrong_versions_without_mutation() {
    let mut hf = machine(10, &[(1, 0, 0), (2, 1, 50)]);
    for _ in 0..5 {
        mine(&mut hf, 2);
    }
    assert_eq!(hf.get_current_version(), 2);
    let before: Vec<u8> = hf.window().collect();
    let height = hf.store_mut().push_block(1, 2);
    assert!(!hf.add(1, 2, height).unwrap());
    assert!(!hf.add(2, 1, height).unwrap());
    assert_eq!(hf.window().collect::<Vec<_>>(), before);
    assert!(hf.check_for_height(2, 2, height));
}

#[test]
fn reorganize_rolls_back_and_replays() {
    let mut hf = machine(10, &[(1, 0, 0), (2, 1, 50)]);
    for _ in 0..3 {
        mine(&mut hf, 1);
    }
    for _ in 0..5 {
        mine(&mut hf, 2);
    }
    assert_eq!(hf.get_current_version(), 2);
    for _ in 0..4 {
        mine(&mut hf, 2);
    }

    hf.store_mut().pop_blocks(7);
    assert!(hf.reorganize_from_chain_height(5).unwrap());
    assert_eq!(hf.get_current_version(), 1);
    assert_eq!(hf.window().collect::<Vec<_>>(), vec![1, 1, 1, 2, 2]);
    assert_window_consistent(&hf);

    for _ in 0..3 {
        mine(&mut hf, 2);
    }
    assert_eq!(hf.get_current_version(), 2);
}

#[test]
fn reorganize_beyond_tip_is_a_no_op() {
    let mut hf = machine(10, &[(1, 0, 0)]);
    mine(&mut hf, 1);
    assert!(!hf.reorganize_from_block_height(1).unwrap());
    assert!(!hf.reorganize_from_chain_height(0).unwrap());
}

#[test]
fn popping_refills_window_from_recorded_versions() {
    let mut hf = machine(10, &[(1, 0, 0), (2, 1, 50)]);
    for _ in 0..5 {
        mine(&mut hf, 2);
    }
    for _ in 0..10 {
        mine(&mut hf, 2);
    }
    assert_eq!(hf.store().height().unwrap(), 15);

    hf.store_mut().pop_blocks(3);
    hf.on_block_popped(3).unwrap();

    // Heights 2..=4 re-enter with their recorded version (1).
    assert_eq!(hf.window().count(), 10);
    assert_eq!(hf.vote_counts()[1], 3);
    assert_eq!(hf.vote_counts()[2], 7);
    assert_eq!(hf.get_current_version(), 2);
    assert_window_consistent(&hf);
}

#[test]
fn popping_below_fork_height_uses_schedule_only() {
    let mut hf = machine(10, &[(1, 0, 0), (2, 5, 0)]);
    for _ in 0..8 {
        mine(&mut hf, 2);
    }
    assert_eq!(hf.get_current_version(), 2);

    hf.store_mut().pop_blocks(4);
    hf.on_block_popped(4).unwrap();
    assert_eq!(hf.get_current_version(), 1);
    assert_window_consistent(&hf);
}

#[test]
fn init_rebuilds_the_same_state() {
    let mut hf = machine(10, &[(1, 0, 0), (2, 1, 50), (3, 30, 80)]);
    for i in 0..40u32 {
        let vote = if i % 3 == 0 { 1 } else { 3 };
        let vote = vote.max(hf.get_current_version());
        mine(&mut hf, vote);
    }

    let mut rebuilt = machine(10, &[(1, 0, 0), (2, 1, 50), (3, 30, 80)]);
    *rebuilt.store_mut() = hf.store().clone();
    rebuilt.init().unwrap();

    assert_eq!(rebuilt.get_current_version(), hf.get_current_version());
    assert_eq!(
        rebuilt.window().collect::<Vec<_>>(),
        hf.window().collect::<Vec<_>>()
    );
}

#[test]
fn get_reads_recorded_versions_below_tip() {
    let mut hf = machine(10, &[(1, 0, 0), (2, 1, 50)]);
    for _ in 0..7 {
        mine(&mut hf, 2);
    }
    // Block 4 completed the vote; blocks from 5 on run under version 2.
    assert_eq!(hf.get(4).unwrap(), 1);
    assert_eq!(hf.get(5).unwrap(), 2);
    assert_eq!(hf.get(7).unwrap(), 2);
    assert!(hf.get(8).is_err());
}

#[test]
fn voting_info_reports_window_progress() {
    let mut hf = machine(10, &[(1, 0, 0), (2, 1, 50)]);
    mine(&mut hf, 2);
    mine(&mut hf, 1);
    mine(&mut hf, 2);

    let info = hf.get_voting_info(2);
    assert_eq!(info.window, 3);
    assert_eq!(info.votes, 2);
    assert_eq!(info.voting, 2);
    assert_eq!(info.earliest_height, 1);
    assert!(!info.enabled);

    assert!(hf.get_voting_info(1).enabled);
}

#[test]
fn next_version_follows_chain_height() {
    let mut hf = machine(10, &[(1, 0, 0), (2, 3, 0)]);
    assert_eq!(hf.get_next_version().unwrap(), 2);
    for _ in 0..5 {
        mine(&mut hf, 2);
    }
    assert_eq!(hf.get_next_version().unwrap(), 2);
}

use proptest::prelude::*;
use umbra_consensus::{HardFork, HardforkParams};
use umbra_nullables::NullChainStore;

fn machine(window: u64) -> HardFork<NullChainStore> {
    let params = HardforkParams {
        window_size: window,
        ..HardforkParams::default()
    };
    let mut hf = HardFork::new(NullChainStore::new(), params);
    hf.add_fork(1, 0, 0, 0);
    hf.add_fork(2, 10, 50, 1);
    hf.add_fork(3, 20, 70, 2);
    hf.add_fork(4, 40, 90, 3);
    hf.init().unwrap();
    hf
}

fn mine(hf: &mut HardFork<NullChainStore>, vote: u8) {
    let major = hf.get_current_version();
    let vote = vote.max(major);
    let height = hf.store_mut().push_block(major, vote);
    assert!(hf.add(major, vote, height).unwrap());
}

fn window_is_consistent(hf: &HardFork<NullChainStore>) -> bool {
    let mut counts = [0u32; 256];
    for v in hf.window() {
        counts[v as usize] += 1;
    }
    counts == *hf.vote_counts() && hf.window().count() as u64 <= hf.window_size()
}

proptest! {
    #[test]
    fn current_version_never_decreases_while_adding(
        window in 1u64..30,
        votes in prop::collection::vec(1u8..=6, 1..200),
    ) {
        let mut hf = machine(window);
        let mut last = hf.get_current_version();
        for vote in votes {
            mine(&mut hf, vote);
            let now = hf.get_current_version();
            prop_assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn window_counts_match_contents(
        window in 1u64..30,
        votes in prop::collection::vec(1u8..=6, 1..120),
        pops in 0u64..40,
    ) {
        let mut hf = machine(window);
        for vote in votes {
            mine(&mut hf, vote);
            prop_assert!(window_is_consistent(&hf));
        }
        let popped = hf.store_mut().pop_blocks(pops);
        hf.on_block_popped(popped).unwrap();
        prop_assert!(window_is_consistent(&hf));
    }
}

//! Chain following against an in-memory daemon: sync, reorgs, retries,
//! fast refresh and persistence of the synced state.

mod common;

use common::{config, daemon, mine_to, outsider, wallet, wallet_with};
use std::sync::{Arc, Mutex};
use umbra_nullables::daemon::BLOCK_REWARD;
use umbra_wallet_core::{load_wallet, save_wallet, DaemonError, WalletConfig, WalletError, WalletEvent};

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

#[test]
fn refresh_picks_up_coinbase_rewards() {
    let daemon = daemon();
    let mut alice = wallet(1, &daemon);
    daemon.mine_blocks(20, &alice.address()).unwrap();

    let summary = alice.refresh(0).unwrap();
    assert_eq!(summary.blocks_fetched, 20);
    assert!(summary.received_money);
    assert_eq!(alice.blockchain_height(), daemon.height());
    assert_eq!(alice.hash_chain().get(20), daemon.tip_hash());
    assert_eq!(alice.transfers().len(), 20);
    assert_eq!(alice.balance(0), 20 * BLOCK_REWARD);
    // Coinbase outputs stay locked for the mining window.
    assert_eq!(alice.unlocked_balance(0), 0);
    assert!(alice.payments().iter().all(|p| p.coinbase));

    daemon.mine_blocks(60, &outsider()).unwrap();
    let summary = alice.refresh(0).unwrap();
    assert_eq!(summary.blocks_fetched, 60);
    assert!(!summary.received_money);
    assert_eq!(alice.unlocked_balance(0), 20 * BLOCK_REWARD);
    alice.transfers().check_invariants().unwrap();
}

#[test]
fn refresh_at_the_tip_fetches_nothing() {
    let daemon = daemon();
    let mut alice = wallet(1, &daemon);
    mine_to(&daemon, &mut alice, 5);
    let summary = alice.refresh(0).unwrap();
    assert_eq!(summary.blocks_fetched, 0);
    assert!(!summary.received_money);
}

#[test]
fn every_new_block_is_announced() {
    let daemon = daemon();
    let mut alice = wallet(1, &daemon);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    alice.subscribe(move |e| {
        if let WalletEvent::NewBlock { height, .. } = e {
            sink.lock().unwrap().push(*height);
        }
    });
    daemon.mine_blocks(25, &outsider()).unwrap();
    alice.refresh(0).unwrap();
    assert_eq!(*seen.lock().unwrap(), (0..=25).collect::<Vec<u64>>());
}

#[test]
fn refresh_height_skips_scanning_older_blocks() {
    let daemon = daemon();
    let cfg = WalletConfig {
        refresh_from_block_height: 15,
        ..config()
    };
    let mut alice = wallet_with(1, &daemon, cfg);
    daemon.mine_blocks(25, &alice.address()).unwrap();
    alice.refresh(0).unwrap();

    assert_eq!(alice.blockchain_height(), 26);
    assert_eq!(alice.transfers().len(), 11);
    assert!(alice.transfers().transfers().iter().all(|td| td.block_height >= 15));
    for h in 0..26 {
        assert_eq!(alice.hash_chain().get(h), daemon.block_hash(h));
    }
}

// ---------------------------------------------------------------------------
// Reorganisations
// ---------------------------------------------------------------------------

#[test]
fn reorg_replaces_the_orphaned_blocks() {
    let daemon = daemon();
    let mut alice = wallet(1, &daemon);
    mine_to(&daemon, &mut alice, 30);
    assert_eq!(alice.transfers().len(), 30);

    daemon.pop_blocks(5).unwrap();
    daemon.mine_blocks(7, &outsider()).unwrap();
    let summary = alice.refresh(0).unwrap();

    assert_eq!(summary.blocks_fetched, 7);
    assert_eq!(alice.blockchain_height(), 33);
    assert_eq!(alice.hash_chain().get(32), daemon.tip_hash());
    assert_eq!(alice.transfers().len(), 25);
    assert_eq!(alice.balance(0), 25 * BLOCK_REWARD);
    assert_eq!(alice.payments().len(), 25);
    alice.transfers().check_invariants().unwrap();
}

#[test]
fn detach_then_rescan_restores_the_ledger() {
    let daemon = daemon();
    let mut alice = wallet(1, &daemon);
    mine_to(&daemon, &mut alice, 40);
    let ledger = alice.transfers().clone();
    let payments = alice.payments().to_vec();

    for height in [1, 17, 39, 40, 41] {
        alice.detach_blockchain(height).unwrap();
        assert_eq!(alice.blockchain_height(), height);
        alice.refresh(0).unwrap();
        assert_eq!(*alice.transfers(), ledger, "after detaching at {height}");
        assert_eq!(alice.payments(), payments.as_slice());
    }
}

// ---------------------------------------------------------------------------
// Daemon failures
// ---------------------------------------------------------------------------

#[test]
fn busy_daemon_is_retried() {
    let daemon = daemon();
    let mut alice = wallet(1, &daemon);
    mine_to(&daemon, &mut alice, 3);
    daemon.mine_blocks(4, &outsider()).unwrap();

    daemon.fail_next(DaemonError::Busy);
    daemon.fail_next(DaemonError::ConnectionFailed("reset".into()));
    let summary = alice.refresh(0).unwrap();
    assert_eq!(summary.blocks_fetched, 4);
}

#[test]
fn refresh_gives_up_after_three_attempts() {
    let daemon = daemon();
    let mut alice = wallet(1, &daemon);
    mine_to(&daemon, &mut alice, 3);
    daemon.mine_blocks(4, &outsider()).unwrap();

    for _ in 0..3 {
        daemon.fail_next(DaemonError::Busy);
    }
    assert!(matches!(
        alice.refresh(0),
        Err(WalletError::Daemon(DaemonError::Busy))
    ));
    assert_eq!(alice.blockchain_height(), 4);

    assert_eq!(alice.refresh(0).unwrap().blocks_fetched, 4);
}

#[test]
fn retries_are_counted_per_batch() {
    let daemon = daemon();
    let mut alice = wallet(1, &daemon);
    mine_to(&daemon, &mut alice, 3);
    daemon.mine_blocks(60, &outsider()).unwrap();

    // Fail twice, serve the first batch, then fail its prefetch and the
    // retry after it. Four failures in total, never three in a row.
    daemon.fail_next(DaemonError::Busy);
    daemon.fail_next(DaemonError::Busy);
    daemon.succeed_next();
    daemon.fail_next(DaemonError::Busy);
    daemon.fail_next(DaemonError::Busy);
    let summary = alice.refresh(0).unwrap();
    assert_eq!(summary.blocks_fetched, 60);
    assert_eq!(alice.blockchain_height(), daemon.height());
}

#[test]
fn malformed_answers_are_not_retried() {
    let daemon = daemon();
    let mut alice = wallet(1, &daemon);
    mine_to(&daemon, &mut alice, 3);
    daemon.fail_next(DaemonError::Malformed("truncated".into()));
    assert!(matches!(
        alice.refresh(0),
        Err(WalletError::Daemon(DaemonError::Malformed(_)))
    ));
}

#[test]
fn stop_request_cancels_the_next_refresh() {
    let daemon = daemon();
    let mut alice = wallet(1, &daemon);
    daemon.mine_blocks(3, &outsider()).unwrap();
    alice.stop_handle().stop();
    assert!(matches!(alice.refresh(0), Err(WalletError::Stopped)));
    assert_eq!(alice.refresh(0).unwrap().blocks_fetched, 3);
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[test]
fn saved_wallet_resumes_where_it_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("alice");
    let daemon = daemon();
    let mut alice = wallet(1, &daemon);
    mine_to(&daemon, &mut alice, 12);
    save_wallet(&mut alice, &path, "pw").unwrap();

    daemon.mine_blocks(3, &alice.address()).unwrap();
    let mut loaded = load_wallet(&path, "pw", config()).unwrap();
    assert_eq!(loaded.blockchain_height(), 13);
    let handle: Arc<dyn umbra_wallet_core::Daemon> = daemon.clone();
    loaded.set_daemon(handle);
    assert_eq!(loaded.refresh(0).unwrap().blocks_fetched, 3);
    assert_eq!(loaded.balance(0), 15 * BLOCK_REWARD);
}

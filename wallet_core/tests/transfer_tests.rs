//! Building, broadcasting and confirming transactions end to end against
//! an in-memory daemon that checks ring signatures on submission.

mod common;

use common::{daemon, mine_to, outsider, wallet};
use std::sync::Arc;
use umbra_nullables::NullDaemon;
use umbra_types::{SubaddressIndex, TxExtra, COIN};
use umbra_wallet_core::fee::{calculate_fee, get_fee_multiplier};
use umbra_wallet_core::payments::TxState;
use umbra_wallet_core::{
    load_wallet, save_wallet, BlockSource, DaemonError, MultisigTxSet, PendingTx, TxDestination,
    Wallet, WalletError,
};

const RING_SIZE: usize = 11;

/// Alice owns 150 coinbase outputs, the older ones unlocked. Bob is empty.
fn funded() -> (Arc<NullDaemon>, Wallet, Wallet) {
    let daemon = daemon();
    let mut alice = wallet(1, &daemon);
    let mut bob = wallet(2, &daemon);
    mine_to(&daemon, &mut alice, 150);
    bob.refresh(0).expect("bob refresh");
    (daemon, alice, bob)
}

fn pay(alice: &mut Wallet, to: &Wallet, amount: u64) -> PendingTx {
    let dsts = vec![TxDestination::new(to.address(), amount)];
    let mut ptxs = alice
        .create_transactions_2(dsts, RING_SIZE as u64 - 1, 0, 1, &TxExtra::default(), 0, &[])
        .expect("create transactions");
    assert_eq!(ptxs.len(), 1);
    ptxs.remove(0)
}

// ---------------------------------------------------------------------------
// Plain transfers
// ---------------------------------------------------------------------------

#[test]
fn transfer_is_built_with_a_settled_fee() {
    let (daemon, mut alice, bob) = funded();
    let ptx = pay(&mut alice, &bob, COIN);

    let estimate = daemon.get_fee_estimate().expect("fee estimate");
    let multiplier = get_fee_multiplier(1, 3).expect("multiplier");
    assert_eq!(
        ptx.fee,
        calculate_fee(true, ptx.tx.weight(), estimate.base_fee, multiplier, estimate.quantization_mask)
    );
    assert_eq!(ptx.tx.fee(), ptx.fee);
    assert!(ptx
        .construction_data
        .sources
        .iter()
        .all(|s| s.outputs.len() == RING_SIZE));
    let dsts = [TxDestination::new(bob.address(), COIN)];
    alice.sanity_check(std::slice::from_ref(&ptx), Some(&dsts[..])).expect("sanity check");
}

#[test]
fn transfer_reaches_the_receiver() {
    let (daemon, mut alice, mut bob) = funded();
    let before = alice.balance(0);
    let ptx = pay(&mut alice, &bob, COIN);
    let txid = alice.commit_tx(&ptx).expect("commit");

    assert_eq!(daemon.pool_txids(), vec![txid]);
    assert_eq!(alice.unconfirmed_txs()[&txid].state, TxState::Pending);
    for &idx in &ptx.selected_transfers {
        assert!(alice.transfers().transfers()[idx].spent);
    }
    for src in &ptx.construction_data.sources {
        assert_eq!(alice.ring_db().get_ring(&src.key_image), Some(src.ring_indices().as_slice()));
    }

    bob.refresh(0).expect("bob refresh");
    let pending = bob.unconfirmed_payments().get(&txid).expect("pool payment");
    assert_eq!(pending.payments[0].amount, COIN);
    assert_eq!(bob.balance(0), 0);

    daemon.mine_blocks(1, &outsider()).expect("mine");
    bob.refresh(0).expect("bob refresh");
    alice.refresh(0).expect("alice refresh");

    assert_eq!(bob.balance(0), COIN);
    assert!(bob.unconfirmed_payments().is_empty());
    assert_eq!(bob.payments().last().map(|p| p.txid), Some(txid));

    assert!(alice.unconfirmed_txs().is_empty());
    let confirmed = alice.confirmed_txs().get(&txid).expect("confirmed transfer");
    assert_eq!(confirmed.block_height, 151);
    assert_eq!(confirmed.dests, vec![TxDestination::new(bob.address(), COIN)]);
    assert_eq!(alice.balance(0), before - COIN - ptx.fee);
    alice.transfers().check_invariants().expect("ledger invariants");
}

#[test]
fn second_broadcast_is_rejected_as_double_spend() {
    let (daemon, mut alice, bob) = funded();
    let ptx = pay(&mut alice, &bob, COIN);
    alice.commit_tx(&ptx).expect("commit");

    let err = alice.commit_tx(&ptx).expect_err("double spend");
    assert!(matches!(err, WalletError::Daemon(DaemonError::Rejected { .. })));
    assert_eq!(daemon.rejections().len(), 1);
    assert_eq!(daemon.pool_txids().len(), 1);
}

#[test]
fn dropped_transaction_fails_and_frees_its_inputs() {
    let (daemon, mut alice, bob) = funded();
    let ptx = pay(&mut alice, &bob, COIN);
    let txid = alice.commit_tx(&ptx).expect("commit");
    assert!(daemon.drop_pool_tx(&txid));

    alice.update_pool_state().expect("first poll");
    assert_eq!(alice.unconfirmed_txs()[&txid].state, TxState::PendingNotInPool);
    for &idx in &ptx.selected_transfers {
        assert!(alice.transfers().transfers()[idx].spent);
    }

    alice.update_pool_state().expect("second poll");
    assert_eq!(alice.unconfirmed_txs()[&txid].state, TxState::Failed);
    for &idx in &ptx.selected_transfers {
        assert!(!alice.transfers().transfers()[idx].spent);
    }
}

// ---------------------------------------------------------------------------
// Subaddresses beyond the lookahead
// ---------------------------------------------------------------------------

fn pay_subaddress(alice: &mut Wallet, bob: &Wallet, minor: u32) -> PendingTx {
    let to = bob.subaddress(SubaddressIndex::new(0, minor)).expect("subaddress");
    let mut ptxs = alice
        .create_transactions_2(
            vec![TxDestination::new(to, COIN)],
            RING_SIZE as u64 - 1,
            0,
            1,
            &TxExtra::default(),
            0,
            &[],
        )
        .expect("create transactions");
    ptxs.remove(0)
}

#[test]
fn payments_past_the_lookahead_are_found_across_blocks() {
    let (daemon, mut alice, mut bob) = funded();
    // Minor 7 is only generated once the payment to minor 4 is seen.
    assert!(bob.subaddresses().extent(0) <= 7);

    let first = pay_subaddress(&mut alice, &bob, 4);
    alice.commit_tx(&first).expect("commit");
    daemon.mine_blocks(1, &outsider()).expect("mine");
    alice.refresh(0).expect("alice refresh");
    let second = pay_subaddress(&mut alice, &bob, 7);
    alice.commit_tx(&second).expect("commit");
    daemon.mine_blocks(1, &outsider()).expect("mine");

    let summary = bob.refresh(0).expect("bob refresh");
    assert_eq!(summary.blocks_fetched, 2);
    let per_subaddress = bob.balance_per_subaddress(0);
    assert_eq!(per_subaddress.get(&4), Some(&COIN));
    assert_eq!(per_subaddress.get(&7), Some(&COIN));
    assert_eq!(bob.balance(0), 2 * COIN);
}

#[test]
fn payments_past_the_lookahead_are_found_within_one_block() {
    let (daemon, mut alice, mut bob) = funded();
    let first = pay_subaddress(&mut alice, &bob, 4);
    let first_id = alice.commit_tx(&first).expect("commit");
    let second = pay_subaddress(&mut alice, &bob, 7);
    let second_id = alice.commit_tx(&second).expect("commit");
    daemon.mine_blocks(1, &outsider()).expect("mine");

    bob.refresh(0).expect("bob refresh");
    let received: Vec<_> = bob.payments().iter().map(|p| (p.txid, p.subaddr_index.minor)).collect();
    assert!(received.contains(&(first_id, 4)));
    assert!(received.contains(&(second_id, 7)));
    assert_eq!(bob.balance(0), 2 * COIN);
}

// ---------------------------------------------------------------------------
// Stored rings
// ---------------------------------------------------------------------------

#[test]
fn spending_an_output_again_reuses_its_ring() {
    let (_daemon, mut alice, _bob) = funded();
    // Mined at height 5, so its global index is 5.
    let td = alice.transfers().transfers()[4].clone();
    assert_eq!(td.global_output_index, 5);
    let ring: Vec<u64> = (0..RING_SIZE as u64).collect();
    alice.ring_db_mut().set_ring(td.key_image, ring.clone());

    let ptxs = alice
        .create_transactions_single(&td.key_image, outsider(), 1, RING_SIZE as u64 - 1, 0, 1, &TxExtra::default())
        .expect("sweep single");
    assert_eq!(ptxs.len(), 1);
    assert_eq!(ptxs[0].key_images, vec![td.key_image]);
    assert_eq!(ptxs[0].construction_data.sources[0].ring_indices(), ring);
}

#[test]
fn stored_ring_larger_than_allowed_is_refused() {
    let (_daemon, mut alice, _bob) = funded();
    let td = alice.transfers().transfers()[4].clone();
    alice
        .ring_db_mut()
        .set_ring(td.key_image, (0..RING_SIZE as u64 + 1).collect());

    let err = alice
        .create_transactions_single(&td.key_image, outsider(), 1, RING_SIZE as u64 - 1, 0, 1, &TxExtra::default())
        .expect_err("ring too small");
    assert!(matches!(
        err,
        WalletError::RingSizeTooSmall {
            requested: 11,
            previous: 12
        }
    ));
}

// ---------------------------------------------------------------------------
// Multisig
// ---------------------------------------------------------------------------

#[test]
fn two_of_three_set_resolves_to_a_valid_transaction() {
    let (daemon, mut alice, bob) = funded();
    let ptx = pay(&mut alice, &bob, COIN);

    let mut set = MultisigTxSet::build(&ptx, alice.keys(), 0, 2, 3).expect("build set");
    assert_eq!(set.candidate_count(), 2);
    assert!(!set.is_complete());
    let candidates = set.candidates();
    assert_ne!(candidates[0].tx.rct.ring_signatures, candidates[1].tx.rct.ring_signatures);
    assert_eq!(candidates[0].tx.prefix_hash(), candidates[1].tx.prefix_hash());

    set.sign(1).expect("cosigner signs");
    assert_eq!(set.candidate_count(), 1);
    assert!(set.is_complete());

    // Participant 2 is outside the remaining candidate.
    assert!(matches!(set.sign(2), Err(WalletError::Multisig(_))));
    assert_eq!(set.candidate_count(), 1);

    let prefix = set.prefix_hash();
    let tx = set.finalize().expect("finalize");
    assert_eq!(tx.prefix_hash(), prefix);
    assert_eq!(tx.prefix_hash(), ptx.tx.prefix_hash());

    daemon
        .send_raw_tx(&tx.to_blob().expect("blob"))
        .expect("finalized candidate is accepted");
    assert_eq!(daemon.pool_txids(), vec![tx.hash()]);
    assert!(daemon.rejections().is_empty());
}

#[test]
fn multisig_set_needs_the_input_owner() {
    let (_daemon, mut alice, bob) = funded();
    let ptx = pay(&mut alice, &bob, COIN);
    assert!(MultisigTxSet::build(&ptx, bob.keys(), 0, 2, 3).is_err());
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

#[test]
fn quiet_network_allows_low_priority() {
    let (_daemon, alice, _bob) = funded();
    assert_eq!(alice.adjust_priority(0), 1);
    assert_eq!(alice.adjust_priority(3), 3);
}

#[test]
fn full_blocks_keep_the_default_priority() {
    let (daemon, alice, _bob) = funded();
    daemon.set_block_weight_limit(20);
    assert_eq!(alice.adjust_priority(0), 0);
}

#[test]
fn pool_backlog_keeps_the_default_priority() {
    let (_daemon, mut alice, bob) = funded();
    let ptx = pay(&mut alice, &bob, COIN);
    alice.commit_tx(&ptx).expect("commit");
    assert_eq!(alice.adjust_priority(0), 0);
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[test]
fn pending_transfer_survives_a_reload() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("alice");
    let (daemon, mut alice, bob) = funded();
    let ptx = pay(&mut alice, &bob, COIN);
    let txid = alice.commit_tx(&ptx).expect("commit");
    save_wallet(&mut alice, &path, "secret").expect("save");

    let mut loaded = load_wallet(&path, "secret", common::config()).expect("load");
    let handle: Arc<dyn umbra_wallet_core::Daemon> = daemon.clone();
    loaded.set_daemon(handle);
    assert_eq!(loaded.refresh(0).expect("refresh").blocks_fetched, 0);
    assert_eq!(loaded.unconfirmed_txs()[&txid].state, TxState::Pending);
    assert_eq!(loaded.ring_db().ring_count(), ptx.key_images.len());
    assert_eq!(*loaded.transfers(), *alice.transfers());

    assert!(matches!(
        load_wallet(&path, "wrong", common::config()),
        Err(WalletError::InvalidPassword)
    ));
}

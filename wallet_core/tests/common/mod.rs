//! Shared fixtures: wallets wired to an in-memory daemon.

#![allow(dead_code)]

use std::sync::Arc;
use umbra_nullables::daemon::GENESIS_TIMESTAMP;
use umbra_nullables::{NullClock, NullDaemon};
use umbra_wallet_core::{AccountKeys, Address, Daemon, Wallet, WalletConfig};

pub fn config() -> WalletConfig {
    WalletConfig {
        kdf_rounds: 1,
        subaddress_lookahead_major: 2,
        subaddress_lookahead_minor: 5,
        worker_threads: 2,
        ..WalletConfig::dev()
    }
}

pub fn daemon() -> Arc<NullDaemon> {
    Arc::new(NullDaemon::new().expect("null daemon"))
}

pub fn wallet_with(seed: u8, daemon: &Arc<NullDaemon>, config: WalletConfig) -> Wallet {
    let handle: Arc<dyn Daemon> = daemon.clone();
    Wallet::new(AccountKeys::from_seed(&[seed; 32]), config)
        .expect("wallet")
        .with_daemon(handle)
        .with_rng_seed(seed as u64)
        .with_clock(Arc::new(NullClock::new(GENESIS_TIMESTAMP + 1_000_000)))
}

pub fn wallet(seed: u8, daemon: &Arc<NullDaemon>) -> Wallet {
    wallet_with(seed, daemon, config())
}

/// Someone who is neither sender nor receiver.
pub fn outsider() -> Address {
    AccountKeys::from_seed(&[0xee; 32]).address()
}

/// Mine `blocks` paying `wallet`, then sync it.
pub fn mine_to(daemon: &NullDaemon, wallet: &mut Wallet, blocks: u64) {
    daemon.mine_blocks(blocks, &wallet.address()).expect("mine");
    wallet.refresh(0).expect("refresh");
}

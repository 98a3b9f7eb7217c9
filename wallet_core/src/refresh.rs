//! Following the daemon's chain.
//!
//! A refresh first catches up on hashes alone up to the scan start, then
//! pulls full blocks in batches. The next batch is fetched on a scoped
//! thread while the current one is processed. Afterwards the pool is
//! polled for incoming and outgoing unconfirmed transactions.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use umbra_types::{BlockHash, Transaction, TxHash};

use crate::daemon::{BlocksResponse, Daemon};
use crate::error::{DaemonError, WalletError};
use crate::events::WalletEvent;
use crate::payments::TxState;
use crate::wallet::Wallet;

/// Blocks taken one by one from the tip before the history starts
/// doubling its step.
const LINEAR_HISTORY: usize = 10;

/// Hashes from the end of a batch that lead the next request's history.
const BATCH_TAIL: usize = 3;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub blocks_fetched: u64,
    pub received_money: bool,
}

/// Cancels a running refresh from another thread.
#[derive(Clone, Debug)]
pub struct StopHandle(pub(crate) Arc<AtomicBool>);

impl StopHandle {
    /// Ask the refresh to stop before its next daemon pull.
    pub fn stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum PullEnd {
    Done,
    Stopped,
}

impl Wallet {
    /// Sparse list of known block hashes, newest first: the last ten
    /// blocks, then every 2nd, 4th, 8th... back to the oldest stored block,
    /// then genesis when the chain is trimmed. `granularity` rounds the
    /// starting height down.
    pub fn get_short_chain_history(&self, granularity: u64) -> Vec<BlockHash> {
        let chain = &self.hash_chain;
        let offset = chain.offset();
        let granularity = granularity.max(1);
        let size = (chain.size() / granularity * granularity).max(offset);
        let sz = size - offset;
        let mut ids = Vec::new();
        if sz == 0 {
            ids.push(chain.genesis());
            return ids;
        }

        let mut i = 0;
        let mut multiplier = 1u64;
        let mut back = 1u64;
        while back < sz {
            if let Some(h) = chain.get(offset + sz - back) {
                ids.push(h);
            }
            if i < LINEAR_HISTORY {
                back += 1;
            } else {
                multiplier *= 2;
                back += multiplier;
            }
            i += 1;
        }
        if let Some(h) = chain.get(offset) {
            ids.push(h);
        }
        if offset > 0 {
            ids.push(chain.genesis());
        }
        ids
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.run))
    }

    pub fn stop(&self) {
        self.run.store(false, Ordering::SeqCst);
    }

    fn take_stop_request(&self) -> bool {
        !self.run.swap(true, Ordering::SeqCst)
    }

    /// Catch up from the daemon. Blocks below the larger of `start_height`
    /// and the configured refresh height are recorded by hash only.
    pub fn refresh(&mut self, start_height: u64) -> Result<RefreshSummary, WalletError> {
        if self.take_stop_request() {
            return Err(WalletError::Stopped);
        }
        let daemon = self.daemon()?;
        if self.hash_chain.is_empty() {
            let resp = daemon.get_hashes(0, &[])?;
            let genesis = resp
                .hashes
                .first()
                .copied()
                .ok_or_else(|| DaemonError::Malformed("no genesis hash".into()))?;
            self.hash_chain.push_back(genesis);
            self.events.emit(&WalletEvent::NewBlock { height: 0, hash: genesis });
        }

        let scan_from = start_height.max(self.config.refresh_from_block_height);
        if scan_from > self.hash_chain.size() {
            self.fast_refresh(&*daemon, scan_from, false)?;
        }

        let mut summary = RefreshSummary::default();
        // Consecutive failed pulls. Any block added resets the count.
        let mut attempts = 0;
        loop {
            let fetched = summary.blocks_fetched;
            match self.pull_blocks(&*daemon, &mut summary) {
                Ok(PullEnd::Done) => break,
                Ok(PullEnd::Stopped) => {
                    info!(blocks = summary.blocks_fetched, "refresh stopped");
                    return Ok(summary);
                }
                Err(WalletError::Daemon(DaemonError::OutOfHashChainBounds)) => {
                    info!("daemon claims next block is out of hash chain bounds, resetting hash chain");
                    self.rebuild_hash_chain(&*daemon)?;
                }
                Err(WalletError::Daemon(e)) if e.is_retryable() => {
                    if summary.blocks_fetched > fetched {
                        attempts = 0;
                    }
                    attempts += 1;
                    if attempts >= self.config.max_refresh_retries {
                        warn!(attempts, error = %e, "giving up on block pull");
                        return Err(e.into());
                    }
                    warn!(attempts, error = %e, "block pull failed, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        if let Err(e) = self.update_pool_state() {
            warn!(error = %e, "failed to update pool state");
        }
        info!(
            blocks = summary.blocks_fetched,
            height = self.hash_chain.size(),
            received = summary.received_money,
            "refresh done"
        );
        Ok(summary)
    }

    fn pull_blocks(&mut self, daemon: &dyn Daemon, summary: &mut RefreshSummary) -> Result<PullEnd, WalletError> {
        let history = self.get_short_chain_history(1);
        if self.take_stop_request() {
            return Ok(PullEnd::Stopped);
        }
        let mut batch = daemon.get_blocks(0, &history)?;
        loop {
            if batch.blocks.is_empty() {
                return Ok(PullEnd::Done);
            }
            let last = batch.start_height + batch.blocks.len() as u64 >= batch.current_height;
            let stopping = !last && self.take_stop_request();

            let mut next_history: Vec<BlockHash> = batch
                .blocks
                .iter()
                .rev()
                .take(BATCH_TAIL)
                .map(|b| b.block.hash())
                .collect();
            next_history.extend(self.get_short_chain_history(1));

            let (processed, next) = std::thread::scope(|s| {
                let fetch = (!last && !stopping).then(|| s.spawn(|| daemon.get_blocks(0, &next_history)));
                let processed = self.process_parsed_blocks(&batch);
                let next = fetch.map(|h| h.join());
                (processed, next)
            });
            let outcome = processed?;
            summary.blocks_fetched += outcome.blocks_added;
            summary.received_money |= outcome.received_money;
            trace!(start = batch.start_height, added = outcome.blocks_added, "processed batch");

            if stopping {
                return Ok(PullEnd::Stopped);
            }
            let next: BlocksResponse = match next {
                None => return Ok(PullEnd::Done),
                Some(joined) => joined.map_err(|_| WalletError::Internal("block fetch thread panicked".into()))??,
            };
            if next.start_height == batch.start_height {
                return Ok(PullEnd::Done);
            }
            batch = next;
        }
    }

    /// Record hashes only, from the tip up to `stop_height`. Jumps to the
    /// network checkpoint first when it lies on the way, unless `force`.
    /// Stops quietly at a hash that differs from what is stored.
    fn fast_refresh(&mut self, daemon: &dyn Daemon, stop_height: u64, force: bool) -> Result<(), WalletError> {
        if !force {
            if let Some(cp) = self.network.checkpoint {
                if stop_height > cp.height && self.hash_chain.size() <= cp.height {
                    debug!(height = cp.height, "skipping to checkpoint");
                    self.hash_chain.skip_to(cp.height, cp.hash);
                }
            }
        }

        while self.hash_chain.size() < stop_height {
            if !self.run.load(Ordering::SeqCst) {
                return Ok(());
            }
            let history = self.get_short_chain_history(1);
            let resp = daemon.get_hashes(0, &history)?;
            if resp.hashes.len() <= BATCH_TAIL {
                return Ok(());
            }
            if resp.start_height < self.hash_chain.offset() {
                warn!(
                    start = resp.start_height,
                    offset = self.hash_chain.offset(),
                    "hashes start before hash chain offset"
                );
                return Ok(());
            }
            let mut height = resp.start_height;
            for hash in resp.hashes {
                if height >= self.hash_chain.size() {
                    self.hash_chain.push_back(hash);
                    self.events.emit(&WalletEvent::NewBlock { height, hash });
                } else if self.hash_chain.get(height) != Some(hash) {
                    info!(height, "fork below fast refresh target");
                    return Ok(());
                }
                height += 1;
                if height >= stop_height {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Refill a trimmed hash chain from genesis up to its old offset and
    /// put the stored tip back on top.
    fn rebuild_hash_chain(&mut self, daemon: &dyn Daemon) -> Result<(), WalletError> {
        let stop_height = self.hash_chain.offset();
        if stop_height == 0 {
            return Err(DaemonError::OutOfHashChainBounds.into());
        }
        let tip: Vec<BlockHash> = self.hash_chain.stored().copied().collect();
        self.hash_chain.reset_to_genesis();
        self.fast_refresh(daemon, stop_height, true)?;
        if self.hash_chain.size() != stop_height || self.hash_chain.offset() != 0 {
            return Err(WalletError::Internal(format!(
                "unexpected hash chain size {} (offset {}) after rebuilding to {stop_height}",
                self.hash_chain.size(),
                self.hash_chain.offset()
            )));
        }
        for hash in tip {
            self.hash_chain.push_back(hash);
        }
        Ok(())
    }

    /// Reconcile with the daemon's pool: our pending transactions that
    /// dropped out are failed after two polls and their inputs freed,
    /// incoming pool payments that left are removed, and new pool
    /// transactions are scanned.
    pub fn update_pool_state(&mut self) -> Result<(), WalletError> {
        let daemon = self.daemon()?;
        let pool: HashSet<TxHash> = daemon.get_transaction_pool_hashes()?.into_iter().collect();

        let mut failed_key_images = Vec::new();
        for (txid, utd) in self.unconfirmed_txs.iter_mut() {
            if pool.contains(txid) {
                if utd.state == TxState::PendingNotInPool {
                    utd.state = TxState::Pending;
                }
                continue;
            }
            match utd.state {
                TxState::Pending => {
                    debug!(%txid, "pending transaction not in pool");
                    utd.state = TxState::PendingNotInPool;
                }
                TxState::PendingNotInPool => {
                    warn!(%txid, "pending transaction left the pool, marking failed");
                    utd.state = TxState::Failed;
                    failed_key_images.extend(utd.tx.key_images().copied());
                }
                TxState::Failed => {}
            }
        }
        for key_image in failed_key_images {
            if let Some(idx) = self.transfers.find_by_key_image(&key_image) {
                self.transfers.set_unspent(idx)?;
            }
        }

        let gone: Vec<TxHash> = self
            .unconfirmed_payments
            .keys()
            .filter(|t| !pool.contains(t))
            .copied()
            .collect();
        for txid in gone {
            self.unconfirmed_payments.remove(&txid);
            info!(%txid, "incoming pool transaction removed");
            self.events.emit(&WalletEvent::PoolTxRemoved { txid });
        }

        let mut fresh: Vec<TxHash> = pool
            .iter()
            .filter(|t| !self.scanned_pool_txs.contains(t) && !self.unconfirmed_txs.contains_key(t))
            .copied()
            .collect();
        fresh.sort();
        if !fresh.is_empty() {
            let pool_txs = daemon.get_pool_transactions(&fresh)?;
            let txs: Vec<&Transaction> = pool_txs.iter().map(|p| &p.tx).collect();
            let scanned = self.scan_transactions(&txs);
            let now = self.clock.now();
            for (ptx, owned) in pool_txs.iter().zip(scanned) {
                if ptx.tx.hash() != ptx.txid {
                    warn!(txid = %ptx.txid, "pool transaction does not hash to its id, skipping");
                    continue;
                }
                self.apply_transaction(ptx.txid, &ptx.tx, &[], 0, now, false, true, ptx.double_spend_seen, owned)?;
                self.scanned_pool_txs.insert(ptx.txid);
            }
        }
        self.scanned_pool_txs.retain(|t| pool.contains(t));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalletConfig;
    use crate::keys::AccountKeys;

    fn wallet_with_chain(len: u8) -> Wallet {
        let config = WalletConfig {
            subaddress_lookahead_major: 1,
            subaddress_lookahead_minor: 2,
            worker_threads: 1,
            ..WalletConfig::dev()
        };
        let mut w = Wallet::new(AccountKeys::from_seed(&[1u8; 32]), config).unwrap();
        for i in 0..len {
            w.hash_chain.push_back(BlockHash::new([i; 32]));
        }
        w
    }

    fn h(i: u8) -> BlockHash {
        BlockHash::new([i; 32])
    }

    #[test]
    fn history_of_empty_chain_is_genesis() {
        let w = wallet_with_chain(1);
        assert_eq!(w.get_short_chain_history(1), vec![h(0)]);
    }

    #[test]
    fn short_history_is_linear_then_exponential() {
        let w = wallet_with_chain(30);
        let got = w.get_short_chain_history(1);
        let mut want: Vec<BlockHash> = (19..=29).rev().map(h).collect();
        // Back offsets after the first eleven: 13, 17, 25.
        want.extend([h(17), h(13), h(5), h(0)]);
        assert_eq!(got, want);
    }

    #[test]
    fn trimmed_history_ends_with_base_and_genesis() {
        let mut w = wallet_with_chain(20);
        w.hash_chain.trim(15);
        let got = w.get_short_chain_history(1);
        assert_eq!(got, vec![h(19), h(18), h(17), h(16), h(15), h(0)]);
    }

    #[test]
    fn granularity_rounds_down() {
        let w = wallet_with_chain(25);
        let got = w.get_short_chain_history(10);
        assert_eq!(got.first(), Some(&h(19)));
        assert_eq!(got.last(), Some(&h(0)));
    }

    #[test]
    fn stop_before_refresh_is_reported_once() {
        let mut w = wallet_with_chain(1);
        w.stop_handle().stop();
        assert!(matches!(w.refresh(0), Err(WalletError::Stopped)));
        // The request is consumed; with no daemon the next call fails on that.
        assert!(matches!(w.refresh(0), Err(WalletError::NoDaemon)));
    }
}

//! The wallet context.
//!
//! [`Wallet`] owns every piece of chain-derived state together with the
//! daemon handle, clock and randomness it works with. All mutation goes
//! through `&mut self`; scanning, refresh, selection and storage live in
//! their own modules as further `impl Wallet` blocks.

use rand::rngs::StdRng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::debug;
use umbra_crypto::{rng_from_seed, secure_rng};
use umbra_types::{NetworkParams, SubaddressIndex, TxHash};

use crate::clock::{Clock, SystemClock};
use crate::config::WalletConfig;
use crate::daemon::Daemon;
use crate::daemon_client::DaemonClient;
use crate::error::WalletError;
use crate::events::{EventBus, WalletEvent};
use crate::fee::{self, ForkRules, PriorityPolicy};
use crate::hash_chain::HashChain;
use crate::keys::{AccountKeys, Address};
use crate::payments::{ConfirmedTransferDetail, PaymentDetail, PoolPayment, UnconfirmedTransferDetail};
use crate::ring_db::RingDatabase;
use crate::subaddress::SubaddressTable;
use crate::transfers::{SpendContext, TransferDetail, TransferLedger};

pub struct Wallet {
    pub(crate) keys: AccountKeys,
    pub(crate) config: WalletConfig,
    pub(crate) network: NetworkParams,
    pub(crate) subaddresses: SubaddressTable,
    pub(crate) transfers: TransferLedger,
    pub(crate) hash_chain: HashChain,
    pub(crate) payments: Vec<PaymentDetail>,
    pub(crate) unconfirmed_payments: HashMap<TxHash, PoolPayment>,
    pub(crate) confirmed_txs: HashMap<TxHash, ConfirmedTransferDetail>,
    pub(crate) unconfirmed_txs: HashMap<TxHash, UnconfirmedTransferDetail>,
    pub(crate) ring_db: RingDatabase,
    /// Pool transactions already scanned and still in the pool.
    pub(crate) scanned_pool_txs: HashSet<TxHash>,
    pub(crate) events: EventBus,
    pub(crate) daemon: Option<Arc<dyn Daemon>>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) rng: StdRng,
    /// Cleared by a [`crate::refresh::StopHandle`].
    pub(crate) run: Arc<AtomicBool>,
    /// Scanner workers.
    pub(crate) pool: rayon::ThreadPool,
}

impl Wallet {
    /// A wallet with no chain state and no daemon.
    pub fn new(keys: AccountKeys, config: WalletConfig) -> Result<Self, WalletError> {
        let subaddresses = SubaddressTable::new(
            &keys,
            config.subaddress_lookahead_major,
            config.subaddress_lookahead_minor,
        )?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(|i| format!("umbra-scan-{i}"))
            .build()
            .map_err(|e| WalletError::Config(format!("failed to start scanner threads: {e}")))?;
        debug!(
            subaddresses = subaddresses.len(),
            threads = pool.current_num_threads(),
            "wallet created"
        );
        Ok(Self {
            network: config.network_params(),
            keys,
            config,
            subaddresses,
            transfers: TransferLedger::new(),
            hash_chain: HashChain::new(),
            payments: Vec::new(),
            unconfirmed_payments: HashMap::new(),
            confirmed_txs: HashMap::new(),
            unconfirmed_txs: HashMap::new(),
            ring_db: RingDatabase::new(),
            scanned_pool_txs: HashSet::new(),
            events: EventBus::new(),
            daemon: None,
            clock: Arc::new(SystemClock),
            rng: secure_rng(),
            run: Arc::new(AtomicBool::new(true)),
            pool,
        })
    }

    pub fn with_daemon(mut self, daemon: Arc<dyn Daemon>) -> Self {
        self.daemon = Some(daemon);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Deterministic randomness, for tests and reproducible builds.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = rng_from_seed(seed);
        self
    }

    pub fn with_network_params(mut self, network: NetworkParams) -> Self {
        self.network = network;
        self
    }

    pub fn set_daemon(&mut self, daemon: Arc<dyn Daemon>) {
        self.daemon = Some(daemon);
    }

    /// Connect to the JSON-RPC daemon named in the config.
    pub fn connect(&mut self) -> Result<(), WalletError> {
        let client = DaemonClient::from_config(&self.config)?;
        self.daemon = Some(Arc::new(client));
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.daemon.is_some()
    }

    pub fn subscribe(&mut self, listener: impl Fn(&WalletEvent) + Send + Sync + 'static) {
        self.events.subscribe(Box::new(listener));
    }

    pub fn keys(&self) -> &AccountKeys {
        &self.keys
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn network(&self) -> &NetworkParams {
        &self.network
    }

    pub fn address(&self) -> Address {
        self.keys.address()
    }

    pub fn subaddress(&self, index: SubaddressIndex) -> Result<Address, WalletError> {
        self.keys.subaddress(index)
    }

    pub fn subaddresses(&self) -> &SubaddressTable {
        &self.subaddresses
    }

    pub fn transfers(&self) -> &TransferLedger {
        &self.transfers
    }

    pub fn hash_chain(&self) -> &HashChain {
        &self.hash_chain
    }

    /// Height one past the last block the wallet knows.
    pub fn blockchain_height(&self) -> u64 {
        self.hash_chain.size()
    }

    pub fn payments(&self) -> &[PaymentDetail] {
        &self.payments
    }

    pub fn unconfirmed_payments(&self) -> &HashMap<TxHash, PoolPayment> {
        &self.unconfirmed_payments
    }

    pub fn confirmed_txs(&self) -> &HashMap<TxHash, ConfirmedTransferDetail> {
        &self.confirmed_txs
    }

    pub fn unconfirmed_txs(&self) -> &HashMap<TxHash, UnconfirmedTransferDetail> {
        &self.unconfirmed_txs
    }

    pub fn ring_db(&self) -> &RingDatabase {
        &self.ring_db
    }

    pub fn ring_db_mut(&mut self) -> &mut RingDatabase {
        &mut self.ring_db
    }

    pub fn balance(&self, account: u32) -> u64 {
        self.transfers.balance(account)
    }

    pub fn unlocked_balance(&self, account: u32) -> u64 {
        self.transfers.unlocked_balance(account, self.spend_context())
    }

    pub fn balance_per_subaddress(&self, account: u32) -> HashMap<u32, u64> {
        self.transfers.balance_per_subaddress(account)
    }

    pub fn unlocked_balance_per_subaddress(&self, account: u32) -> HashMap<u32, u64> {
        self.transfers
            .unlocked_balance_per_subaddress(account, self.spend_context())
    }

    /// Keep an output out of selection until thawed.
    pub fn freeze(&mut self, idx: usize) -> Result<(), WalletError> {
        self.transfers.freeze(idx)
    }

    pub fn thaw(&mut self, idx: usize) -> Result<(), WalletError> {
        self.transfers.thaw(idx)
    }

    pub(crate) fn daemon(&self) -> Result<Arc<dyn Daemon>, WalletError> {
        self.daemon.clone().ok_or(WalletError::NoDaemon)
    }

    pub(crate) fn transfer(&self, idx: usize) -> Result<&TransferDetail, WalletError> {
        self.transfers
            .get(idx)
            .ok_or_else(|| WalletError::Internal(format!("transfer index {idx} out of range")))
    }

    pub(crate) fn spend_context(&self) -> SpendContext {
        SpendContext {
            chain_height: self.hash_chain.size(),
            now: self.clock.now(),
        }
    }

    /// Fork schedule as the daemon sees it right now.
    pub fn fork_rules(&self) -> Result<ForkRules, WalletError> {
        let daemon = self.daemon()?;
        let height = daemon.get_height()?;
        ForkRules::from_oracle(&*daemon, height)
    }

    /// Resolve priority 0: the low level when the network is quiet and
    /// auto-low-priority is on, else the configured default. Any failure
    /// asking the daemon leaves the request as it was.
    pub fn adjust_priority(&self, priority: u32) -> u32 {
        let policy = PriorityPolicy {
            default_priority: self.config.default_priority,
            auto_low_priority: self.config.auto_low_priority,
            chain_size: self.hash_chain.size(),
        };
        let adjusted = match (self.daemon(), self.fork_rules()) {
            (Ok(daemon), Ok(rules)) => fee::adjust_priority(priority, policy, &rules, &*daemon),
            _ => priority,
        };
        if adjusted == 0 {
            self.config.default_priority
        } else {
            adjusted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfers::tests::td;
    use std::sync::Mutex;
    use umbra_types::BlockHash;

    struct FixedClock(u64);

    impl Clock for FixedClock {
        fn now(&self) -> u64 {
            self.0
        }
    }

    fn test_config() -> WalletConfig {
        WalletConfig {
            subaddress_lookahead_major: 2,
            subaddress_lookahead_minor: 5,
            worker_threads: 2,
            kdf_rounds: 1,
            ..WalletConfig::dev()
        }
    }

    fn wallet() -> Wallet {
        Wallet::new(AccountKeys::from_seed(&[3u8; 32]), test_config())
            .unwrap()
            .with_rng_seed(1)
            .with_clock(Arc::new(FixedClock(1_700_000_000)))
    }

    #[test]
    fn fresh_wallet_is_empty() {
        let w = wallet();
        assert_eq!(w.blockchain_height(), 0);
        assert_eq!(w.balance(0), 0);
        assert_eq!(w.subaddresses().len(), 10);
        assert!(!w.is_connected());
    }

    #[test]
    fn daemon_calls_need_a_daemon() {
        let w = wallet();
        assert!(matches!(w.fork_rules(), Err(WalletError::NoDaemon)));
        assert_eq!(w.adjust_priority(3), 3);
        assert_eq!(w.adjust_priority(0), 0);
    }

    #[test]
    fn default_priority_fills_in_for_zero() {
        let mut config = test_config();
        config.default_priority = 2;
        let w = Wallet::new(AccountKeys::from_seed(&[3u8; 32]), config).unwrap();
        assert_eq!(w.adjust_priority(0), 2);
        assert_eq!(w.adjust_priority(4), 4);
    }

    #[test]
    fn unlocked_balance_follows_chain_height() {
        let mut w = wallet();
        w.transfers.push(td(1, 5)).unwrap();
        for i in 0..10 {
            w.hash_chain.push_back(BlockHash::new([i; 32]));
        }
        assert_eq!(w.balance(0), 1_000);
        assert_eq!(w.unlocked_balance(0), 0);
        for i in 10..15 {
            w.hash_chain.push_back(BlockHash::new([i; 32]));
        }
        assert_eq!(w.unlocked_balance(0), 1_000);
        w.freeze(0).unwrap();
        assert_eq!(w.unlocked_balance(0), 0);
        w.thaw(0).unwrap();
        assert_eq!(w.unlocked_balance_per_subaddress(0).get(&0), Some(&1_000));
    }

    #[test]
    fn listeners_see_events() {
        let mut w = wallet();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        w.subscribe(move |e| sink.lock().unwrap().push(e.clone()));
        let txid = TxHash::new([4; 32]);
        w.events.emit(&WalletEvent::PoolTxRemoved { txid });
        assert_eq!(*seen.lock().unwrap(), vec![WalletEvent::PoolTxRemoved { txid }]);
    }
}

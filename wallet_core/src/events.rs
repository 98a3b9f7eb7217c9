//! Events emitted while the wallet follows the chain.

use umbra_types::{BlockHash, SubaddressIndex, TxHash};

/// Wallet-level events that observers can subscribe to via the [`EventBus`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalletEvent {
    /// A block was appended to the wallet's hash chain.
    NewBlock { height: u64, hash: BlockHash },
    /// An output paying this wallet was confirmed.
    MoneyReceived {
        txid: TxHash,
        height: u64,
        amount: u64,
        subaddr_index: SubaddressIndex,
    },
    /// A pool transaction pays this wallet.
    UnconfirmedMoneyReceived {
        txid: TxHash,
        amount: u64,
        subaddr_index: SubaddressIndex,
    },
    /// One of this wallet's outputs was spent in a confirmed transaction.
    MoneySpent {
        txid: TxHash,
        height: u64,
        amount: u64,
        subaddr_index: SubaddressIndex,
    },
    /// A previously seen incoming pool transaction left the pool.
    PoolTxRemoved { txid: TxHash },
}

/// Synchronous fan-out event bus.
///
/// Listeners are invoked inline on the refreshing thread; keep handlers fast
/// to avoid stalling the scan.
pub struct EventBus {
    listeners: Vec<Box<dyn Fn(&WalletEvent) + Send + Sync>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, listener: Box<dyn Fn(&WalletEvent) + Send + Sync>) {
        self.listeners.push(listener);
    }

    pub fn emit(&self, event: &WalletEvent) {
        for listener in &self.listeners {
            listener(event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn emit_calls_all_listeners() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut bus = EventBus::new();

        let c1 = Arc::clone(&counter);
        bus.subscribe(Box::new(move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        }));
        let c2 = Arc::clone(&counter);
        bus.subscribe(Box::new(move |_| {
            c2.fetch_add(10, Ordering::SeqCst);
        }));

        bus.emit(&WalletEvent::NewBlock {
            height: 1,
            hash: BlockHash::ZERO,
        });
        assert_eq!(counter.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn emit_with_no_listeners_is_noop() {
        let bus = EventBus::default();
        bus.emit(&WalletEvent::PoolTxRemoved { txid: TxHash::ZERO });
        assert!(bus.listeners.is_empty());
    }
}

//! Nullable infrastructure for deterministic testing.
//!
//! Everything the wallet and the consensus code reach outside the process
//! for (time, the chain store, the daemon) sits behind a trait. This crate
//! provides in-memory implementations that:
//! - Return deterministic values
//! - Can be controlled programmatically
//! - Never touch the filesystem or network
//!
//! Usage: swap real implementations for nullables in tests.

pub mod clock;
pub mod daemon;
pub mod store;

pub use clock::NullClock;
pub use daemon::NullDaemon;
pub use store::NullChainStore;

//! Wall-clock access for unlock-time checks and transfer bookkeeping.

use umbra_types::Timestamp;

/// Source of the current Unix time in seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// The system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        Timestamp::now().as_secs()
    }
}

use thiserror::Error;
use umbra_crypto::CryptoError;
use umbra_types::{KeyImage, UmbraError};

/// Failures talking to the daemon.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DaemonError {
    #[error("connection to daemon failed: {0}")]
    ConnectionFailed(String),

    #[error("daemon is busy")]
    Busy,

    #[error("malformed daemon response: {0}")]
    Malformed(String),

    #[error("daemon rejected request: {reason}")]
    Rejected { reason: String },

    #[error("daemon returned blocks below the hash chain offset")]
    OutOfHashChainBounds,
}

impl DaemonError {
    /// Transport-level failures that are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_) | Self::Busy)
    }
}

#[derive(Debug, Error)]
pub enum WalletError {
    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error("not enough money: available {available}, needed {needed}, fee {fee}")]
    NotEnoughMoney { available: u64, needed: u64, fee: u64 },

    #[error("not enough outputs to mix for amount {amount}: found {available}, need {required}")]
    NotEnoughOutsToMix {
        amount: u64,
        available: u64,
        required: u64,
    },

    #[error("transaction too big: weight {weight}, limit {limit}")]
    TxTooBig { weight: u64, limit: u64 },

    #[error("no destinations given")]
    ZeroDestination,

    #[error("zero amount destination")]
    ZeroAmount,

    #[error(
        "output was previously spent with ring size {previous}, cannot spend with smaller ring size {requested}"
    )]
    RingSizeTooSmall { requested: u64, previous: u64 },

    #[error("invalid password")]
    InvalidPassword,

    #[error("corrupt wallet data: {0}")]
    Corrupt(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("invalid priority: {0}")]
    InvalidPriority(u32),

    #[error("invalid fee algorithm: {0}")]
    InvalidFeeAlgorithm(i32),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("refresh stopped")]
    Stopped,

    #[error("no daemon connection configured")]
    NoDaemon,

    #[error("output with key image {key_image} is not spendable")]
    OutputNotSpendable { key_image: KeyImage },

    #[error("multisig: {0}")]
    Multisig(String),
}

impl From<UmbraError> for WalletError {
    fn from(e: UmbraError) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_failures_are_retryable() {
        assert!(DaemonError::ConnectionFailed("refused".into()).is_retryable());
        assert!(DaemonError::Busy.is_retryable());
        assert!(!DaemonError::Malformed("short".into()).is_retryable());
        assert!(!DaemonError::Rejected {
            reason: "double spend".into()
        }
        .is_retryable());
        assert!(!DaemonError::OutOfHashChainBounds.is_retryable());
    }

    #[test]
    fn daemon_error_converts() {
        let e: WalletError = DaemonError::Busy.into();
        assert!(matches!(e, WalletError::Daemon(DaemonError::Busy)));
    }
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("chain store error: {0}")]
    Store(String),

    #[error("height {height} is above the chain height {chain_height}")]
    InvalidHeight { height: u64, chain_height: u64 },

    #[error("vote encoding failed: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("{0}")]
    Other(String),
}

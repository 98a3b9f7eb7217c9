//! Top-level error type shared across crates.

use thiserror::Error;

/// Low-level errors shared by every crate in the workspace.
#[derive(Debug, Error)]
pub enum UmbraError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("index {index} out of bounds (len {len})")]
    OutOfBounds { index: usize, len: usize },

    #[error("{0}")]
    Other(String),
}

impl From<bincode::Error> for UmbraError {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

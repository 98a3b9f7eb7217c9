use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid point encoding")]
    InvalidPoint,

    #[error("ring of {ring} members cannot hold real index {index}")]
    RealIndexOutOfRange { ring: usize, index: usize },

    #[error("empty ring")]
    EmptyRing,
}

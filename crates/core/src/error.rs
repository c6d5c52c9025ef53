//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid chunk key: {0}")]
    InvalidKey(String),

    #[error("invalid permutation: {0}")]
    InvalidPermutation(String),

    #[error("invalid chunk length: {0}")]
    InvalidChunkLength(i64),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

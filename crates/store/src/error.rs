//! Chunk store error types.

use thiserror::Error;

/// Chunk store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(
        "no space for {needed} bytes: {capacity} byte capacity, {locked} bytes locked"
    )]
    NoSpace {
        needed: u64,
        capacity: u64,
        locked: u64,
    },
}

/// Result type for chunk store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

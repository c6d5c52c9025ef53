//! Sync protocol error types.

use thiserror::Error;

/// Errors terminating a sync session. All are fatal to the session; the
/// caller may retry the session as a whole.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync session disposed")]
    Disposed,

    #[error("unexpected chunk: {0}")]
    UnexpectedChunk(String),

    #[error("unsolicited chunk data after the final requested chunk")]
    UnsolicitedChunkData,

    #[error("chunk stream ended unexpectedly")]
    UnexpectedEof,

    #[error("invalid chunk length: {0}")]
    InvalidChunkLength(i64),

    #[error("wishlist too short: ended after {0} chunks")]
    WishlistTooShort(u64),

    #[error(transparent)]
    Store(#[from] coffer_store::StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for sync operations.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

//! Remote differential synchronization of chunked files.
//!
//! A sync session moves one file between two chunk stores in three phases:
//!
//! 1. The sender shares the file's [`Manifest`](coffer_core::Manifest):
//!    chunk keys, sizes and the session permutation.
//! 2. The receiver answers with a wishlist: one bit per chunk, in shuffled
//!    order, set for every chunk its store is missing.
//! 3. The sender streams the bodies of exactly the requested chunks, in the
//!    same shuffled order.
//!
//! Transport is anything implementing `tokio::io::AsyncRead`/`AsyncWrite`;
//! manifest exchange is the caller's concern (JSON or the legacy stream).

pub mod error;
pub mod receive;
pub mod send;
mod wire;

pub use error::{SyncError, SyncResult};
pub use receive::Builder;
pub use send::{TransferStatus, write_chunk_data};

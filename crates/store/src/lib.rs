//! Reference-counted, capacity-bounded, content-addressed chunk storage.
//!
//! The [`ChunkStore`] keeps chunks in memory, keyed by the SHA-256 of their
//! bytes. Chunks are observed through counted [`ChunkHandle`]s: while any
//! handle for a key is alive the chunk cannot be evicted; once the last
//! handle drops the chunk becomes cache, evictable under capacity pressure
//! (oldest release first) or via [`ChunkStore::free_cache`].

pub mod error;
pub mod file;
pub mod store;
pub mod temp;

pub use error::{StoreError, StoreResult};
pub use file::File;
pub use store::{ChunkHandle, ChunkStore, UsageInfo};
pub use temp::Temporary;

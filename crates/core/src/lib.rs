//! Core domain types and shared logic for the coffer content-addressable store.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Chunk keys and hashing
//! - Content-defined chunking
//! - Stream permutation and shuffling
//! - Sync manifests and their wire encodings

pub mod chunker;
pub mod config;
pub mod error;
pub mod hash;
pub mod manifest;
pub mod shuffle;
pub mod wire;

pub use chunker::Chunker;
pub use error::{Error, Result};
pub use hash::{ChunkHasher, ChunkKey};
pub use manifest::{ChunkInfo, Manifest};
pub use shuffle::{InverseStreamShuffler, Permutation, Slot, StreamShuffler};

/// Minimum chunk size: 2 KiB
pub const MIN_CHUNK_SIZE: u64 = 2 * 1024;

/// Maximum chunk size: 128 KiB
pub const MAX_CHUNK_SIZE: u64 = 128 * 1024;

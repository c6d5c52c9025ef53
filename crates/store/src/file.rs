//! Immutable chunked files.

use crate::store::ChunkHandle;
use bytes::{Bytes, BytesMut};
use coffer_core::{ChunkInfo, Manifest, Permutation};
use std::fmt;
use std::sync::Arc;

/// An immutable file: an ordered sequence of chunk references whose
/// concatenation is the file's bytes.
///
/// A `File` is itself a counted handle; clones share the underlying chunk
/// references, and dropping the last clone releases them all.
#[derive(Clone)]
pub struct File {
    shared: Arc<FileShared>,
}

struct FileShared {
    label: String,
    chunks: Vec<ChunkHandle>,
    size: u64,
}

impl File {
    pub(crate) fn new(label: String, chunks: Vec<ChunkHandle>, size: u64) -> Self {
        debug_assert_eq!(size, chunks.iter().map(|c| c.size()).sum::<u64>());
        Self {
            shared: Arc::new(FileShared {
                label,
                chunks,
                size,
            }),
        }
    }

    /// The diagnostic label given at creation.
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Total file size in bytes.
    pub fn size(&self) -> u64 {
        self.shared.size
    }

    pub fn chunk_count(&self) -> usize {
        self.shared.chunks.len()
    }

    /// Iterate the file's chunks in file order. Clone a yielded handle to
    /// take an owned reference to a chunk.
    pub fn chunks(&self) -> std::slice::Iter<'_, ChunkHandle> {
        self.shared.chunks.iter()
    }

    /// The `(key, size)` sequence of this file, in file order.
    pub fn chunk_infos(&self) -> impl Iterator<Item = ChunkInfo> + '_ {
        self.shared
            .chunks
            .iter()
            .map(|c| ChunkInfo::new(*c.key(), c.size()))
    }

    /// Build the sync manifest for this file under the given permutation.
    pub fn manifest(&self, perm: Permutation) -> Manifest {
        let mut manifest = Manifest::new();
        manifest.set_chunks(self.chunk_infos());
        manifest.set_permutation(perm);
        manifest
    }

    /// Concatenate the file's chunks into one contiguous buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.shared.size as usize);
        for chunk in &self.shared.chunks {
            buf.extend_from_slice(&chunk.bytes());
        }
        buf.freeze()
    }
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File")
            .field("label", &self.shared.label)
            .field("size", &self.shared.size)
            .field("chunks", &self.shared.chunks.len())
            .finish()
    }
}

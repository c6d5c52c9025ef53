//! Write-in-progress files.

use crate::error::StoreResult;
use crate::file::File;
use crate::store::{ChunkHandle, ChunkStore};
use bytes::Bytes;
use coffer_core::Chunker;
use std::fmt;

/// A file under construction.
///
/// Appended bytes run through the content-defined chunker; every finished
/// chunk is inserted into the store (deduplicating against chunks already
/// present). [`close`](Temporary::close) finalizes the trailing partial
/// chunk and yields the immutable [`File`]. Dropping an unclosed
/// `Temporary` abandons the partial build and releases its chunk
/// references.
pub struct Temporary {
    store: ChunkStore,
    label: String,
    chunker: Chunker,
    pending: Vec<u8>,
    chunks: Vec<ChunkHandle>,
    size: u64,
}

impl Temporary {
    pub(crate) fn new(store: ChunkStore, label: String) -> Self {
        tracing::trace!(label = %label, "new temporary");
        Self {
            store,
            label,
            chunker: Chunker::new(),
            pending: Vec::new(),
            chunks: Vec::new(),
            size: 0,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Bytes appended so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Append bytes, storing every chunk the boundary detector completes.
    pub fn write(&mut self, data: &[u8]) -> StoreResult<()> {
        let mut rest = data;
        while !rest.is_empty() {
            let n = self.chunker.scan(rest);
            self.pending.extend_from_slice(&rest[..n]);
            let boundary = n < rest.len();
            rest = &rest[n..];
            if boundary {
                self.flush_chunk()?;
            }
        }
        self.size += data.len() as u64;
        Ok(())
    }

    /// Finalize the trailing partial chunk and produce the immutable file,
    /// transferring chunk ownership to it.
    pub fn close(mut self) -> StoreResult<File> {
        self.flush_chunk()?;
        let file = File::new(
            std::mem::take(&mut self.label),
            std::mem::take(&mut self.chunks),
            self.size,
        );
        tracing::trace!(label = %file.label(), size = file.size(), chunks = file.chunk_count(), "closed temporary");
        Ok(file)
    }

    fn flush_chunk(&mut self) -> StoreResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let data = Bytes::from(std::mem::take(&mut self.pending));
        let handle = self.store.insert(data)?;
        self.chunks.push(handle);
        Ok(())
    }
}

impl fmt::Debug for Temporary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Temporary")
            .field("label", &self.label)
            .field("size", &self.size)
            .field("chunks", &self.chunks.len())
            .finish()
    }
}

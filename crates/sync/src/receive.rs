//! Receiver side: wishlist emission and file reconstruction.
//!
//! A [`Builder`] runs two concurrent tasks against opposite ends of a
//! bounded memo queue. The wishlist task walks the manifest in shuffled
//! order, decides per chunk whether to request it, and records that
//! decision both as a wishlist bit and as a memo. The reconstruction task
//! replays the same shuffled order, pairs each decision with its memo (and,
//! for requested chunks, with a body arriving on the chunk stream), and
//! restores file order through the inverse shuffler.
//!
//! Both tasks derive the blank emissions of the shuffle buffer from the
//! shared permutation instead of passing them through the queue; blanks
//! would otherwise occupy window capacity that the pipeline needs for real
//! chunks when the permutation is much longer than the manifest.

use crate::error::{SyncError, SyncResult};
use crate::wire::{BitWriter, read_chunk_length};
use bytes::Bytes;
use coffer_core::shuffle::{InverseStreamShuffler, Slot, StreamShuffler};
use coffer_core::{ChunkInfo, ChunkKey, MAX_CHUNK_SIZE, Manifest};
use coffer_store::{ChunkHandle, ChunkStore, File, Temporary};
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A receiver-side note for one chunk, crossing from the wishlist task to
/// the reconstruction task in shuffled order.
struct Memo {
    info: ChunkInfo,
    /// Pins the chunk when it was already present locally at decision time.
    cached: Option<ChunkHandle>,
    requested: bool,
}

/// State for reconstructing one file from a remote peer.
///
/// [`write_wishlist`](Builder::write_wishlist) and
/// [`reconstruct`](Builder::reconstruct) are each called once and run
/// concurrently; [`dispose`](Builder::dispose) aborts both. Each builder
/// handles exactly one transfer.
pub struct Builder {
    store: ChunkStore,
    manifest: Manifest,
    label: String,
    memo_tx: Mutex<Option<mpsc::Sender<Memo>>>,
    memo_rx: Mutex<Option<mpsc::Receiver<Memo>>>,
    cancel: CancellationToken,
    disposed: AtomicBool,
}

impl Builder {
    /// Create a receiver for one file transfer described by `manifest`.
    /// `window_size` bounds the number of in-flight chunk decisions between
    /// the two tasks and should be at least 8 (a full wishlist byte);
    /// `label` is diagnostic.
    pub fn new(
        store: ChunkStore,
        manifest: Manifest,
        window_size: usize,
        label: impl Into<String>,
    ) -> Self {
        let (memo_tx, memo_rx) = mpsc::channel(window_size.max(8));
        Self {
            store,
            manifest,
            label: label.into(),
            memo_tx: Mutex::new(Some(memo_tx)),
            memo_rx: Mutex::new(Some(memo_rx)),
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Walk the manifest in shuffled order and write one wishlist bit per
    /// chunk: `1` requests the chunk, `0` declines it because it is already
    /// present locally or was already requested earlier in the shuffled
    /// order. Every decision is also queued as a memo for
    /// [`reconstruct`](Builder::reconstruct).
    ///
    /// # Panics
    ///
    /// Panics if called more than once.
    pub async fn write_wishlist<W: AsyncWrite + Unpin>(&self, w: W) -> SyncResult<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Disposed);
        }
        let tx = self
            .memo_tx
            .lock()
            .unwrap()
            .take()
            .expect("write_wishlist may only be called once");

        tracing::debug!(label = %self.label, chunks = self.manifest.chunk_count(), "begin wishlist");
        let mut bits = BitWriter::new(w);
        let mut requested: HashSet<ChunkKey> = HashSet::new();

        let mut shuffler = StreamShuffler::new(&self.manifest.perm);
        for info in self.manifest.chunks.iter().copied() {
            if info.size == 0 || info.size > MAX_CHUNK_SIZE {
                return Err(SyncError::InvalidChunkLength(info.size as i64));
            }
            if let Slot::Value(emitted) = shuffler.put(info) {
                self.decide(emitted, &mut requested, &tx, &mut bits).await?;
            }
        }
        for slot in shuffler.end() {
            if let Slot::Value(emitted) = slot {
                self.decide(emitted, &mut requested, &tx, &mut bits).await?;
            }
        }

        bits.flush().await?;
        tracing::debug!(label = %self.label, "end wishlist");
        Ok(())
    }

    /// Handle one real shuffler emission: decide, enqueue the memo, write
    /// the bit.
    async fn decide<W: AsyncWrite + Unpin>(
        &self,
        info: ChunkInfo,
        requested: &mut HashSet<ChunkKey>,
        tx: &mpsc::Sender<Memo>,
        bits: &mut BitWriter<W>,
    ) -> SyncResult<()> {
        let mut cached = None;
        let mut want = false;
        if info.key.is_zero() || requested.contains(&info.key) {
            // Never requested: the zero key is reserved, and a repeated key
            // is already on its way or pinned by an earlier memo.
        } else if let Some(handle) = self.store.get(&info.key) {
            // Present locally; pin it until the reconstruction task is done
            // with this position.
            cached = Some(handle);
            requested.insert(info.key);
        } else {
            want = true;
            requested.insert(info.key);
        }
        tracing::trace!(key = %info.key, requested = want, "wishlist decision");

        let memo = Memo {
            info,
            cached,
            requested: want,
        };
        // Blocks while the window is full. Disposal interrupts the wait; a
        // dropped memo releases any handle it pinned.
        tokio::select! {
            res = tx.send(memo) => res.map_err(|_| SyncError::Disposed)?,
            _ = self.cancel.cancelled() => return Err(SyncError::Disposed),
        }
        bits.write_bit(want).await?;
        Ok(())
    }

    /// Consume the memo queue and the chunk-body stream, verify every
    /// received chunk against its announcement, and reassemble the file in
    /// original order through the inverse shuffler.
    ///
    /// # Panics
    ///
    /// Panics if called more than once.
    pub async fn reconstruct<R: AsyncRead + Unpin>(&self, r: R) -> SyncResult<File> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Disposed);
        }
        let mut rx = self
            .memo_rx
            .lock()
            .unwrap()
            .take()
            .expect("reconstruct may only be called once");

        tracing::debug!(label = %self.label, "begin reconstruct");
        let mut reader = BufReader::new(r);
        let mut temp = self.store.create(self.label.clone());
        let mut unshuffler: InverseStreamShuffler<ChunkHandle> =
            InverseStreamShuffler::new(&self.manifest.perm);

        // Replay the wishlist task's shuffled order to know where the
        // buffer emits blanks; only real decisions cross the memo queue.
        let mut order = StreamShuffler::new(&self.manifest.perm);
        for _ in 0..self.manifest.chunk_count() {
            let slot = order.put(());
            self.advance(slot, &mut rx, &mut reader, &mut temp, &mut unshuffler)
                .await?;
        }
        for slot in order.end() {
            self.advance(slot, &mut rx, &mut reader, &mut temp, &mut unshuffler)
                .await?;
        }

        // Every announced chunk is settled: the body stream must be done.
        if self.cancel.is_cancelled() {
            return Err(SyncError::Disposed);
        }
        match reader.read_u8().await {
            Ok(_) => return Err(SyncError::UnsolicitedChunkData),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {}
            Err(e) => return Err(e.into()),
        }

        for ready in unshuffler.end() {
            append(&mut temp, ready)?;
        }
        let file = temp.close()?;
        tracing::debug!(label = %self.label, size = file.size(), "end reconstruct");
        Ok(file)
    }

    /// Handle one position of the shuffled stream: feed a blank straight
    /// into the inverse shuffler, or settle the next memo against the chunk
    /// store and body stream.
    async fn advance<R: AsyncRead + Unpin>(
        &self,
        slot: Slot<()>,
        rx: &mut mpsc::Receiver<Memo>,
        reader: &mut R,
        temp: &mut Temporary,
        unshuffler: &mut InverseStreamShuffler<ChunkHandle>,
    ) -> SyncResult<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Disposed);
        }

        let ready = match slot {
            Slot::Blank => unshuffler.put(Slot::Blank),
            Slot::Value(()) => {
                let memo = tokio::select! {
                    m = rx.recv() => m.ok_or(SyncError::Disposed)?,
                    _ = self.cancel.cancelled() => return Err(SyncError::Disposed),
                };
                let handle = if memo.requested {
                    receive_chunk(&self.store, reader, &memo.info).await?
                } else {
                    // Guaranteed present: either `cached` pins it, or an
                    // earlier occurrence is pinned downstream of us.
                    self.store.get(&memo.info.key).ok_or_else(|| {
                        SyncError::UnexpectedChunk(format!(
                            "announced chunk {} not available",
                            memo.info.key
                        ))
                    })?
                };
                drop(memo.cached);
                unshuffler.put(Slot::Value(handle))
            }
        };
        if let Some(chunk) = ready {
            append(temp, chunk)?;
        }
        Ok(())
    }

    /// Abort the transfer. Both tasks observe the signal at their next
    /// blocking point and fail with [`SyncError::Disposed`]; memos still
    /// queued are dropped, releasing the chunk handles they pinned.
    ///
    /// # Panics
    ///
    /// Panics when called twice; disposing a builder is a one-shot
    /// operation.
    pub fn dispose(&self) {
        let was_disposed = self.disposed.swap(true, Ordering::SeqCst);
        assert!(!was_disposed, "builder disposed twice");
        tracing::debug!(label = %self.label, "dispose");
        self.cancel.cancel();
        drop(self.memo_tx.lock().unwrap().take());
        drop(self.memo_rx.lock().unwrap().take());
    }
}

/// Read one `varint(size) || bytes` record, verify it against the memo and
/// store it.
async fn receive_chunk<R: AsyncRead + Unpin>(
    store: &ChunkStore,
    reader: &mut R,
    info: &ChunkInfo,
) -> SyncResult<ChunkHandle> {
    let size = match read_chunk_length(reader).await {
        Err(SyncError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            // The sender owed us this chunk's body.
            return Err(SyncError::UnexpectedEof);
        }
        other => other?,
    };
    let mut data = vec![0u8; size as usize];
    reader.read_exact(&mut data).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            SyncError::UnexpectedEof
        } else {
            SyncError::Io(e)
        }
    })?;

    let key = ChunkKey::compute(&data);
    if size != info.size || key != info.key {
        return Err(SyncError::UnexpectedChunk(format!(
            "expected {} ({} bytes), received {key} ({size} bytes)",
            info.key, info.size
        )));
    }
    tracing::trace!(key = %key, size, "received chunk");
    Ok(store.insert(Bytes::from(data))?)
}

fn append(temp: &mut Temporary, chunk: ChunkHandle) -> SyncResult<()> {
    temp.write(&chunk.bytes())?;
    Ok(())
}

//! Sender side: stream the bodies of requested chunks in shuffled order.

use crate::error::{SyncError, SyncResult};
use crate::wire::{BitReader, write_varint};
use coffer_core::shuffle::{Permutation, Slot, StreamShuffler};
use coffer_store::{ChunkHandle, File};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Progress callback: `(bytes_to_transfer, bytes_transferred)`.
///
/// Called once before transmission with the file's full size, then after
/// every chunk decision: skipped chunks lower `bytes_to_transfer`,
/// transmitted chunks raise `bytes_transferred`. The figures stay accurate
/// even though the stream is shuffled.
pub type TransferStatus<'a> = &'a mut (dyn FnMut(u64, u64) + Send);

/// Transmit the chunks of `file` that the receiver's wishlist requests.
///
/// The file's chunks are fed in file order through a forward shuffler built
/// from `perm`. For every chunk leaving the shuffler (shuffled order, the
/// order the receiver computed its wishlist in) one wishlist bit is read;
/// a set bit emits `varint(size) || bytes` to `out`, a clear bit emits
/// nothing. A wishlist that ends before every chunk was decided is a fatal
/// protocol error.
pub async fn write_chunk_data<R, W>(
    file: &File,
    wishlist: R,
    perm: &Permutation,
    mut out: W,
    mut status: Option<TransferStatus<'_>>,
) -> SyncResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tracing::debug!(label = %file.label(), size = file.size(), "begin chunk data");

    let mut bits = BitReader::new(wishlist);
    let mut progress = Progress {
        bytes_to_transfer: file.size(),
        bytes_transferred: 0,
        decided: 0,
    };
    if let Some(cb) = status.as_mut() {
        cb(progress.bytes_to_transfer, progress.bytes_transferred);
    }

    let mut shuffler = StreamShuffler::new(perm);
    for chunk in file.chunks() {
        if let Slot::Value(emitted) = shuffler.put(chunk.clone()) {
            transmit(&mut bits, &mut out, emitted, &mut progress, &mut status).await?;
        }
    }
    for slot in shuffler.end() {
        if let Slot::Value(emitted) = slot {
            transmit(&mut bits, &mut out, emitted, &mut progress, &mut status).await?;
        }
    }

    out.flush().await?;
    tracing::debug!(
        label = %file.label(),
        transferred = progress.bytes_transferred,
        "end chunk data"
    );
    Ok(())
}

struct Progress {
    bytes_to_transfer: u64,
    bytes_transferred: u64,
    decided: u64,
}

/// Handle one chunk leaving the shuffler: read its wishlist bit and write
/// the body if it was requested.
async fn transmit<R, W>(
    bits: &mut BitReader<R>,
    out: &mut W,
    chunk: ChunkHandle,
    progress: &mut Progress,
    status: &mut Option<TransferStatus<'_>>,
) -> SyncResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let requested = bits.read_bit().await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            SyncError::WishlistTooShort(progress.decided)
        } else {
            SyncError::Io(e)
        }
    })?;
    progress.decided += 1;

    if requested {
        tracing::trace!(key = %chunk.key(), size = chunk.size(), "send chunk");
        write_varint(out, chunk.size() as i64).await?;
        out.write_all(&chunk.bytes()).await?;
        progress.bytes_transferred += chunk.size();
    } else {
        tracing::trace!(key = %chunk.key(), "skip chunk");
        progress.bytes_to_transfer -= chunk.size();
    }
    if let Some(cb) = status.as_mut() {
        cb(progress.bytes_to_transfer, progress.bytes_transferred);
    }
    Ok(())
}

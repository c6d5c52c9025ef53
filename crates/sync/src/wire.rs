//! Async wire primitives: MSB-first bit streams and varint records.

use crate::error::{SyncError, SyncResult};
use coffer_core::MAX_CHUNK_SIZE;
use coffer_core::wire::{MAX_VARINT_LEN, encode_varint, zigzag_decode};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Packs bits MSB-first into bytes. [`flush`](BitWriter::flush) pads the
/// trailing byte with zero bits.
pub(crate) struct BitWriter<W> {
    w: W,
    buf: u8,
    n: u8,
}

impl<W: AsyncWrite + Unpin> BitWriter<W> {
    pub(crate) fn new(w: W) -> Self {
        Self { w, buf: 0, n: 0 }
    }

    pub(crate) async fn write_bit(&mut self, bit: bool) -> io::Result<()> {
        self.buf = (self.buf << 1) | u8::from(bit);
        self.n += 1;
        if self.n == 8 {
            let byte = self.buf;
            self.buf = 0;
            self.n = 0;
            self.w.write_all(&[byte]).await?;
        }
        Ok(())
    }

    pub(crate) async fn flush(&mut self) -> io::Result<()> {
        while self.n != 0 {
            self.write_bit(false).await?;
        }
        self.w.flush().await
    }
}

/// Reads MSB-first packed bits, pulling one byte at a time.
pub(crate) struct BitReader<R> {
    r: R,
    buf: u8,
    n: u8,
}

impl<R: AsyncRead + Unpin> BitReader<R> {
    pub(crate) fn new(r: R) -> Self {
        Self { r, buf: 0, n: 0 }
    }

    pub(crate) async fn read_bit(&mut self) -> io::Result<bool> {
        if self.n == 0 {
            self.buf = self.r.read_u8().await?;
            self.n = 8;
        }
        let bit = self.buf & 0x80 != 0;
        self.buf <<= 1;
        self.n -= 1;
        Ok(bit)
    }
}

/// Write a signed zigzag varint.
pub(crate) async fn write_varint<W: AsyncWrite + Unpin>(w: &mut W, value: i64) -> io::Result<()> {
    let mut buf = [0u8; MAX_VARINT_LEN];
    let n = encode_varint(value, &mut buf);
    w.write_all(&buf[..n]).await
}

/// Read a signed zigzag varint, one byte at a time.
pub(crate) async fn read_varint<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<i64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let b = r.read_u8().await?;
        if shift == 63 && b > 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "varint overflows 64 bits",
            ));
        }
        value |= u64::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Ok(zigzag_decode(value));
        }
        shift += 7;
        if shift > 63 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "varint overflows 64 bits",
            ));
        }
    }
}

/// Read a chunk body length, enforcing `0 < length <= MAX_CHUNK_SIZE`.
pub(crate) async fn read_chunk_length<R: AsyncRead + Unpin>(r: &mut R) -> SyncResult<u64> {
    let length = read_varint(r).await?;
    if length <= 0 || length as u64 > MAX_CHUNK_SIZE {
        return Err(SyncError::InvalidChunkLength(length));
    }
    Ok(length as u64)
}

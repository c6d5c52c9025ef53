//! Content-defined chunking with a rolling Adler-32 boundary detector.
//!
//! The chunker partitions a byte stream into chunks whose boundaries depend
//! only on the last [`WINDOW_SIZE`] bytes, so unchanged regions of modified
//! files produce identical chunks regardless of their position.

use crate::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};

/// Size of the rolling-hash window in bytes.
pub const WINDOW_SIZE: usize = 64;

const MOD_ADLER: u32 = 65521;

/// A cut point is declared when the low bits of the weighted window sum all
/// match. With a 13-bit mask, chunks average roughly 8 KiB past the minimum.
const BOUNDARY_MASK: u32 = (1 << 13) - 1;

/// Stateful chunk boundary detector.
///
/// [`Chunker::scan`] reports how many leading bytes of its input belong to
/// the current chunk; callers accumulate those bytes and finalize a chunk
/// whenever the returned count falls short of the input length. The chunker
/// never looks at chunk hashes, it only finds boundaries.
#[derive(Clone, Debug)]
pub struct Chunker {
    window: [u8; WINDOW_SIZE],
    len: usize,
    pos: usize,
    a: u32,
    b: u32,
    count: u64,
}

impl Chunker {
    pub fn new() -> Self {
        Self {
            window: [0u8; WINDOW_SIZE],
            len: 0,
            pos: 0,
            a: 0,
            b: 0,
            count: 0,
        }
    }

    /// Scan `data` for the next chunk boundary.
    ///
    /// Returns the number of leading bytes that belong to the current chunk.
    /// A return value of `data.len()` means no boundary was found inside
    /// `data`; feed more. Any smaller value `n` places a boundary immediately
    /// after byte `n - 1` and starts a fresh chunk; in particular `n == 0`
    /// finalizes the pending chunk without consuming input.
    ///
    /// The boundary decision is made before the following byte is consumed,
    /// so splitting the input into arbitrary slices across `scan` calls
    /// yields the same boundaries as scanning it whole.
    pub fn scan(&mut self, data: &[u8]) -> usize {
        for (i, &byte) in data.iter().enumerate() {
            if self.boundary_pending() {
                self.reset();
                return i;
            }
            self.roll(byte);
            self.count += 1;
        }
        data.len()
    }

    /// Whether the bytes consumed so far end the current chunk: either the
    /// hash predicate fired past the minimum size, or the hard cap is hit.
    fn boundary_pending(&self) -> bool {
        self.count >= MAX_CHUNK_SIZE
            || (self.count >= MIN_CHUNK_SIZE && self.b & BOUNDARY_MASK == BOUNDARY_MASK)
    }

    /// Slide one byte into the window, maintaining `a` (byte sum) and `b`
    /// (position-weighted sum), both mod 65521. Once the window is full both
    /// sums are functions of the window contents alone.
    fn roll(&mut self, byte: u8) {
        let incoming = u32::from(byte);
        if self.len < WINDOW_SIZE {
            self.window[self.len] = byte;
            self.len += 1;
            self.a = (self.a + incoming) % MOD_ADLER;
            self.b = (self.b + self.a) % MOD_ADLER;
        } else {
            let outgoing = u32::from(self.window[self.pos]);
            self.window[self.pos] = byte;
            self.pos = (self.pos + 1) % WINDOW_SIZE;
            self.a = (self.a + MOD_ADLER + incoming - outgoing) % MOD_ADLER;
            self.b =
                (self.b + self.a + MOD_ADLER - (WINDOW_SIZE as u32 * outgoing) % MOD_ADLER)
                    % MOD_ADLER;
        }
    }

    fn reset(&mut self) {
        self.len = 0;
        self.pos = 0;
        self.a = 0;
        self.b = 0;
        self.count = 0;
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new()
    }
}

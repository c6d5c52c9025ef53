//! Cyclic permutation of element streams over a fixed-size buffer.
//!
//! A [`Shuffler`] reorders a possibly unbounded stream under a permutation of
//! length `k`, emitting each element at most `k - 1` steps after it was put
//! in. The reordering is reversible: feeding a shuffled stream through a
//! shuffler built from the [inverse](Permutation::inverse) permutation
//! restores the original order, delayed by `k - 1` elements.
//!
//! When several receivers pull the same file concurrently from different
//! senders over buffered paths, shuffling each transfer under a different
//! permutation makes the senders pick different chunk subsets early, and the
//! receivers' growing chunk caches suppress duplicate transmissions.

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Deserializer, Serialize};

/// A permutation of the integers `0..k`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Permutation(Vec<usize>);

impl Permutation {
    /// The trivial permutation `[0]`: shuffling degenerates to the identity
    /// with zero delay.
    pub fn trivial() -> Self {
        Self(vec![0])
    }

    /// Create a random permutation of the given length.
    pub fn random<R: Rng + ?Sized>(len: usize, rng: &mut R) -> Self {
        let mut values: Vec<usize> = (0..len.max(1)).collect();
        values.shuffle(rng);
        Self(values)
    }

    /// Validate and wrap a permutation vector. Every value in `0..len` must
    /// occur exactly once.
    pub fn from_vec(values: Vec<usize>) -> crate::Result<Self> {
        if values.is_empty() {
            return Err(crate::Error::InvalidPermutation(
                "permutation must not be empty".into(),
            ));
        }
        let mut seen = vec![false; values.len()];
        for &v in &values {
            if v >= values.len() || seen[v] {
                return Err(crate::Error::InvalidPermutation(format!(
                    "not a permutation of 0..{}: {v}",
                    values.len()
                )));
            }
            seen[v] = true;
        }
        Ok(Self(values))
    }

    /// The length `k` of the permutation cycle. Always at least 1.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    /// The complementary permutation: a shuffler built from `p.inverse()`
    /// restores the order of a stream shuffled under `p`, except for a delay
    /// of `k - 1` steps, which is encoded as `inv[p[i]] = (k - 1 + i) % k`.
    pub fn inverse(&self) -> Self {
        let k = self.0.len();
        let mut inv = vec![0usize; k];
        for (i, &j) in self.0.iter().enumerate() {
            inv[j] = (k - 1 + i) % k;
        }
        Self(inv)
    }
}

impl<'de> Deserialize<'de> for Permutation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let values = Vec::<usize>::deserialize(deserializer)?;
        Permutation::from_vec(values).map_err(serde::de::Error::custom)
    }
}

/// An element of a shuffled stream: a real value, or blank space introduced
/// by the shuffle buffer while it fills and drains. Blanks are never
/// interpreted as data, they only keep both ends of a transfer aligned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot<T> {
    Value(T),
    Blank,
}

impl<T> Slot<T> {
    pub fn into_value(self) -> Option<T> {
        match self {
            Slot::Value(v) => Some(v),
            Slot::Blank => None,
        }
    }
}

/// The raw k-slot permutation buffer.
///
/// Every `put` stores the incoming element at slot `p[i]` and emits the
/// element at slot `i`, where `i` cycles through `0..k`. Empty slots emit
/// `None`.
#[derive(Debug)]
pub struct Shuffler<T> {
    perm: Permutation,
    buffer: Vec<Option<T>>,
    idx: usize,
}

impl<T> Shuffler<T> {
    pub fn new(perm: Permutation) -> Self {
        let buffer = (0..perm.len()).map(|_| None).collect();
        Self {
            perm,
            buffer,
            idx: 0,
        }
    }

    /// The buffer length `k`. Always at least 1.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Put one element in, take one element out. Each occupied slot is read
    /// exactly once before it is overwritten, so no element is lost; when
    /// `p[i] == i` the element passes straight through.
    pub fn put(&mut self, value: Option<T>) -> Option<T> {
        let i = self.idx;
        self.idx = (self.idx + 1) % self.buffer.len();
        self.buffer[self.perm.as_slice()[i]] = value;
        self.buffer[i].take()
    }
}

/// Applies a permutation to a stream with a well-defined beginning and end.
///
/// Each [`put`](StreamShuffler::put) emits exactly one [`Slot`]; buffer
/// positions that have not been filled yet surface as [`Slot::Blank`].
/// [`end`](StreamShuffler::end) drains the remaining `k - 1` emissions.
#[derive(Debug)]
pub struct StreamShuffler<T> {
    inner: Shuffler<Slot<T>>,
}

impl<T> StreamShuffler<T> {
    pub fn new(perm: &Permutation) -> Self {
        Self {
            inner: Shuffler::new(perm.clone()),
        }
    }

    pub fn put(&mut self, value: T) -> Slot<T> {
        self.inner.put(Some(Slot::Value(value))).unwrap_or(Slot::Blank)
    }

    /// Flush the buffer, yielding the final `k - 1` emissions.
    pub fn end(self) -> Drain<T> {
        let remaining = self.inner.len() - 1;
        Drain {
            inner: self.inner,
            remaining,
        }
    }
}

/// Iterator over a forward shuffler's final emissions.
#[derive(Debug)]
pub struct Drain<T> {
    inner: Shuffler<Slot<T>>,
    remaining: usize,
}

impl<T> Iterator for Drain<T> {
    type Item = Slot<T>;

    fn next(&mut self) -> Option<Slot<T>> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.inner.put(None).unwrap_or(Slot::Blank))
    }
}

/// Restores the original order of a stream shuffled under `perm`.
///
/// Fed with the forward shuffler's emissions (including blanks), it
/// surfaces only the real values, in their original order.
#[derive(Debug)]
pub struct InverseStreamShuffler<T> {
    inner: Shuffler<Slot<T>>,
}

impl<T> InverseStreamShuffler<T> {
    pub fn new(perm: &Permutation) -> Self {
        Self {
            inner: Shuffler::new(perm.inverse()),
        }
    }

    /// Accept the next element of the shuffled stream. Returns the restored
    /// value when one leaves the buffer; blanks and unfilled slots yield
    /// `None`.
    pub fn put(&mut self, slot: Slot<T>) -> Option<T> {
        self.inner.put(Some(slot)).and_then(Slot::into_value)
    }

    /// Flush the buffer, yielding the values still held.
    pub fn end(self) -> InverseDrain<T> {
        let remaining = self.inner.len() - 1;
        InverseDrain {
            inner: self.inner,
            remaining,
        }
    }
}

/// Iterator over an inverse shuffler's final emissions; blanks are skipped.
#[derive(Debug)]
pub struct InverseDrain<T> {
    inner: Shuffler<Slot<T>>,
    remaining: usize,
}

impl<T> Iterator for InverseDrain<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        while self.remaining > 0 {
            self.remaining -= 1;
            if let Some(Slot::Value(v)) = self.inner.put(None) {
                return Some(v);
            }
        }
        None
    }
}

//! The chunk store proper: entry map, refcounting and eviction.

use crate::error::{StoreError, StoreResult};
use crate::temp::Temporary;
use bytes::Bytes;
use coffer_core::ChunkKey;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

/// A content-addressed, reference-counted, capacity-bounded chunk store.
///
/// Cloning a `ChunkStore` yields another handle on the same store. All
/// operations are safe under concurrent use from multiple tasks or threads.
#[derive(Clone)]
pub struct ChunkStore {
    inner: Arc<StoreInner>,
}

pub(crate) struct StoreInner {
    capacity: u64,
    state: Mutex<StoreState>,
}

struct StoreState {
    entries: HashMap<ChunkKey, Entry>,
    /// Refcount-zero chunks in release order, oldest first.
    evictable: BTreeMap<u64, ChunkKey>,
    used: u64,
    locked: u64,
    tick: u64,
}

struct Entry {
    data: Bytes,
    refs: u64,
    evict_tick: Option<u64>,
}

/// Snapshot of the store's space accounting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsageInfo {
    /// Bytes currently held by the store, cache included.
    pub used: u64,
    /// Maximum bytes the store may hold.
    pub capacity: u64,
    /// Bytes pinned by outstanding handles.
    pub locked: u64,
}

impl fmt::Display for UsageInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kib = |v: u64| v.div_ceil(1024);
        write!(
            f,
            "{} of {} KiB used, {} KiB locked",
            kib(self.used),
            kib(self.capacity),
            kib(self.locked)
        )
    }
}

impl ChunkStore {
    /// Create a store bounded to `capacity` bytes of chunk data.
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                capacity,
                state: Mutex::new(StoreState {
                    entries: HashMap::new(),
                    evictable: BTreeMap::new(),
                    used: 0,
                    locked: 0,
                    tick: 0,
                }),
            }),
        }
    }

    pub fn with_config(config: &coffer_core::config::StoreConfig) -> Self {
        Self::new(config.capacity)
    }

    /// Begin a new write-in-progress file. `label` is diagnostic only.
    pub fn create(&self, label: impl Into<String>) -> Temporary {
        Temporary::new(self.clone(), label.into())
    }

    /// Look up a chunk, pinning it with a fresh handle. `None` means the
    /// key is not present; that is a normal outcome, not a failure.
    pub fn get(&self, key: &ChunkKey) -> Option<ChunkHandle> {
        let mut state = self.inner.state.lock().unwrap();
        let size = state.entries.get(key)?.data.len() as u64;
        state.acquire(key);
        drop(state);
        Some(ChunkHandle {
            store: Arc::clone(&self.inner),
            key: *key,
            size,
        })
    }

    /// Whether a chunk with this key is currently present.
    pub fn contains(&self, key: &ChunkKey) -> bool {
        self.inner.state.lock().unwrap().entries.contains_key(key)
    }

    /// Space accounting snapshot.
    pub fn usage(&self) -> UsageInfo {
        let state = self.inner.state.lock().unwrap();
        UsageInfo {
            used: state.used,
            capacity: self.inner.capacity,
            locked: state.locked,
        }
    }

    /// Evict every chunk that no handle is pinning. Returns the number of
    /// bytes freed.
    pub fn free_cache(&self) -> u64 {
        let mut state = self.inner.state.lock().unwrap();
        let mut freed = 0u64;
        while let Some((_, key)) = state.evictable.pop_first() {
            let entry = state
                .entries
                .remove(&key)
                .expect("evictable chunk must have an entry");
            freed += entry.data.len() as u64;
        }
        state.used -= freed;
        if freed > 0 {
            tracing::debug!(freed, used = state.used, "cleared chunk cache");
        }
        freed
    }

    /// Insert one chunk's bytes, deduplicating by key, and pin the chunk
    /// with a handle. `data` must be a complete chunk (at most
    /// [`coffer_core::MAX_CHUNK_SIZE`] bytes); file-sized writes go through
    /// [`ChunkStore::create`] instead. If the data would exceed capacity,
    /// unreferenced chunks are evicted oldest-release-first; if that cannot
    /// make room the insert fails with [`StoreError::NoSpace`].
    pub fn insert(&self, data: Bytes) -> StoreResult<ChunkHandle> {
        let key = ChunkKey::compute(&data);
        let size = data.len() as u64;
        let mut state = self.inner.state.lock().unwrap();

        if state.entries.contains_key(&key) {
            state.acquire(&key);
        } else {
            while state.used + size > self.inner.capacity {
                let Some((_, victim)) = state.evictable.pop_first() else {
                    return Err(StoreError::NoSpace {
                        needed: size,
                        capacity: self.inner.capacity,
                        locked: state.locked,
                    });
                };
                let entry = state
                    .entries
                    .remove(&victim)
                    .expect("evictable chunk must have an entry");
                state.used -= entry.data.len() as u64;
                tracing::debug!(key = %victim, size = entry.data.len(), "evicted chunk");
            }
            state.used += size;
            state.locked += size;
            state.entries.insert(
                key,
                Entry {
                    data,
                    refs: 1,
                    evict_tick: None,
                },
            );
        }
        drop(state);

        Ok(ChunkHandle {
            store: Arc::clone(&self.inner),
            key,
            size,
        })
    }
}

impl fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let usage = self.usage();
        f.debug_struct("ChunkStore")
            .field("used", &usage.used)
            .field("capacity", &usage.capacity)
            .field("locked", &usage.locked)
            .finish()
    }
}

impl StoreState {
    /// Bump the refcount of an existing entry, unpinning it from the
    /// eviction index if this is the first reference.
    fn acquire(&mut self, key: &ChunkKey) {
        let entry = self
            .entries
            .get_mut(key)
            .expect("acquire of a missing chunk");
        entry.refs += 1;
        if let Some(tick) = entry.evict_tick.take() {
            self.evictable.remove(&tick);
            self.locked += entry.data.len() as u64;
        }
    }

    fn release(&mut self, key: &ChunkKey) {
        let tick = {
            let entry = self
                .entries
                .get_mut(key)
                .expect("release of a missing chunk");
            entry.refs -= 1;
            if entry.refs > 0 {
                return;
            }
            self.tick += 1;
            entry.evict_tick = Some(self.tick);
            self.locked -= entry.data.len() as u64;
            self.tick
        };
        let existing = self.evictable.insert(tick, *key);
        debug_assert!(existing.is_none());
    }
}

/// A counted reference to a stored chunk.
///
/// While any handle for a key is alive the store will not evict that chunk.
/// Cloning takes another reference; dropping releases one.
pub struct ChunkHandle {
    store: Arc<StoreInner>,
    key: ChunkKey,
    size: u64,
}

impl ChunkHandle {
    pub fn key(&self) -> &ChunkKey {
        &self.key
    }

    /// Chunk size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The chunk's bytes. Cheap: the payload is shared, not copied.
    pub fn bytes(&self) -> Bytes {
        let state = self.store.state.lock().unwrap();
        state
            .entries
            .get(&self.key)
            .expect("chunk pinned by a live handle")
            .data
            .clone()
    }
}

impl Clone for ChunkHandle {
    fn clone(&self) -> Self {
        self.store.state.lock().unwrap().acquire(&self.key);
        Self {
            store: Arc::clone(&self.store),
            key: self.key,
            size: self.size,
        }
    }
}

impl Drop for ChunkHandle {
    fn drop(&mut self) {
        self.store.state.lock().unwrap().release(&self.key);
    }
}

impl fmt::Debug for ChunkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkHandle")
            .field("key", &self.key)
            .field("size", &self.size)
            .finish()
    }
}

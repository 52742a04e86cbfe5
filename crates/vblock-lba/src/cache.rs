//! Bounded write-back cache of LBA shards
//!
//! Shards are cached by shard index with least-recently-used eviction.
//! Every entry has the same footprint (one serialized shard), so the byte
//! limit translates directly into an entry capacity, min-capped to one so a
//! tiny configuration can still hold a shard.
//!
//! Removing an entry to make room is observable: the eviction callback runs
//! synchronously with the removed entry so the owner can write dirty state
//! back to the external store before the shard is dropped.

use crate::shard::Shard;
use crate::SHARD_BYTE_SIZE;

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Cache statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        let total = hits + misses;
        if total == 0.0 { 0.0 } else { hits / total }
    }
}

/// Entry stored per shard index.
#[derive(Debug, Clone)]
pub enum CacheEntry {
    /// A live shard.
    Shard(Shard),
    /// The shard was deleted by the user; the deletion still has to reach
    /// the external store on eviction or flush.
    Tombstone,
}

impl CacheEntry {
    /// True iff this entry has state the external store does not have yet.
    pub fn dirty(&self) -> bool {
        match self {
            CacheEntry::Shard(shard) => shard.dirty(),
            CacheEntry::Tombstone => true,
        }
    }
}

/// Result of a cache probe.
#[derive(Debug)]
pub enum CacheLookup {
    /// No entry; the caller should consult the external store.
    Miss,
    /// Tombstone hit: the shard is deleted locally and the external store
    /// must NOT be consulted.
    Deleted,
    /// Cached shard (a copy; write it back with `add` after mutating).
    Shard(Shard),
}

/// Callback invoked with every entry removed by eviction, explicit clearing
/// or removal. Runs outside the cache's internal lock.
pub type EvictCallback = Box<dyn Fn(u64, CacheEntry) + Send + Sync>;

struct CacheState {
    entries: HashMap<u64, CacheEntry>,
    /// Recency order: front is least recently used.
    recency: VecDeque<u64>,
}

impl CacheState {
    fn touch(&mut self, index: u64) {
        self.recency.retain(|&i| i != index);
        self.recency.push_back(index);
    }

    fn pop_lru(&mut self) -> Option<(u64, CacheEntry)> {
        let index = self.recency.pop_front()?;
        let entry = self.entries.remove(&index)?;
        Some((index, entry))
    }
}

/// Bounded LRU cache of shards keyed by shard index.
pub struct ShardCache {
    state: Mutex<CacheState>,
    capacity: usize,
    on_evict: EvictCallback,
    stats: CacheStats,
}

impl ShardCache {
    /// Create a cache bounded to `byte_limit` bytes of shard data.
    ///
    /// The entry capacity is `byte_limit / SHARD_BYTE_SIZE`, min-capped to
    /// one entry.
    pub fn new(byte_limit: u64, on_evict: EvictCallback) -> Self {
        let capacity = ((byte_limit / SHARD_BYTE_SIZE as u64) as usize).max(1);
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::with_capacity(capacity),
                recency: VecDeque::with_capacity(capacity),
            }),
            capacity,
            on_evict,
            stats: CacheStats::default(),
        }
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of entries (tombstones included).
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// True iff the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cache statistics.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Probe the cache. Hits (tombstones included) become most recent.
    pub fn get(&self, index: u64) -> CacheLookup {
        let mut state = self.state.lock();
        let entry = state.entries.get(&index).cloned();
        match entry {
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                CacheLookup::Miss
            }
            Some(CacheEntry::Tombstone) => {
                state.touch(index);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                CacheLookup::Deleted
            }
            Some(CacheEntry::Shard(shard)) => {
                state.touch(index);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                CacheLookup::Shard(shard)
            }
        }
    }

    /// Insert or replace an entry; the entry becomes most recent.
    ///
    /// A replacement never runs the eviction callback. A true insertion
    /// that pushes the cache over capacity removes the least recently used
    /// entry and hands it to the callback; all entries are equal-sized, so
    /// one removal is always enough.
    pub fn add(&self, index: u64, entry: CacheEntry) {
        let evicted = {
            let mut state = self.state.lock();
            let replaced = state.entries.insert(index, entry).is_some();
            state.touch(index);
            if !replaced && state.entries.len() > self.capacity {
                state.pop_lru()
            } else {
                None
            }
        };

        // Callback runs without the internal lock: it is allowed to block
        // on external store I/O.
        if let Some((lru_index, lru_entry)) = evicted {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(shard = lru_index, "evicting least recently used shard");
            (self.on_evict)(lru_index, lru_entry);
        }
    }

    /// Replace any entry for `index` with a tombstone, keeping its cache
    /// slot. The deletion is propagated on eviction or flush.
    pub fn delete(&self, index: u64) {
        self.add(index, CacheEntry::Tombstone);
    }

    /// Visit every dirty entry in unspecified order: live shards emit their
    /// serialized bytes (`None` when the shard is all-nil, so the store
    /// entry can be dropped instead), tombstones emit `None`. Dirty bits
    /// are left untouched. Returns the number of entries emitted.
    pub fn serialize<E>(
        &self,
        mut emit: impl FnMut(u64, Option<Bytes>) -> Result<(), E>,
    ) -> Result<usize, E> {
        let state = self.state.lock();
        let mut emitted = 0;
        for (&index, entry) in &state.entries {
            let payload = match entry {
                CacheEntry::Shard(shard) if !shard.dirty() => continue,
                CacheEntry::Shard(shard) if shard.is_empty() => None,
                CacheEntry::Shard(shard) => Some(shard.serialize()),
                CacheEntry::Tombstone => None,
            };
            emit(index, payload)?;
            emitted += 1;
        }
        Ok(emitted)
    }

    /// Remove every entry. With `evict` the callback runs for each entry,
    /// dirty or not; without it the entries are dropped silently (used
    /// after a flush already made them durable).
    pub fn clear(&self, evict: bool) {
        let drained: Vec<(u64, CacheEntry)> = {
            let mut state = self.state.lock();
            state.recency.clear();
            state.entries.drain().collect()
        };

        if evict {
            for (index, entry) in drained {
                (self.on_evict)(index, entry);
            }
        }
    }
}

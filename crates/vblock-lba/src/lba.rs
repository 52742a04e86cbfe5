//! Block index → content hash lookups for one vdisk
//!
//! The [`Lba`] shards its index space into groups of
//! [`RECORDS_PER_SHARD`](crate::RECORDS_PER_SHARD) records and keeps hot
//! shards in a bounded [`ShardCache`]. Shards missing from the cache are
//! fetched from the external metadata store; dirty shards pushed out of the
//! cache are written back best-effort, and [`Lba::flush`] persists all
//! remaining dirty state in one transactional batch.

use crate::cache::{CacheEntry, CacheLookup, CacheStats, ShardCache};
use crate::config::LbaConfig;
use crate::error::{LbaError, LbaResult};
use crate::hash::Hash;
use crate::shard::Shard;
use crate::RECORDS_PER_SHARD;

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};
use vblock_meta_store::{MetaCommand, MetaConnectionProvider, MetaReply, StoreError};

/// Prefix of the aggregate key under which a vdisk's shards are stored.
pub const STORAGE_KEY_PREFIX: &str = "lba:";

/// Build the metadata store aggregate key for a vdisk.
pub fn storage_key(vdisk_id: &str) -> String {
    format!("{STORAGE_KEY_PREFIX}{vdisk_id}")
}

/// Store access shared between the LBA and its eviction callback.
struct MetaAccess {
    provider: Weak<dyn MetaConnectionProvider>,
    key: String,
}

impl MetaAccess {
    fn provider(&self) -> LbaResult<Arc<dyn MetaConnectionProvider>> {
        self.provider.upgrade().ok_or(LbaError::InvalidProvider)
    }

    /// Fetch one shard. Absent is not an error: the shard was never
    /// persisted (or was deleted).
    fn load_shard(&self, index: u64) -> LbaResult<Option<Shard>> {
        let provider = self.provider()?;
        let mut conn = provider.meta_connection()?;
        match conn.call(MetaCommand::GetField {
            key: self.key.clone(),
            field: index,
        })? {
            MetaReply::Value(bytes) => Ok(Some(Shard::deserialize(&bytes)?)),
            MetaReply::Absent => Ok(None),
            reply => Err(StoreError::Protocol(format!("unexpected reply {reply:?}")).into()),
        }
    }

    fn store_shard(&self, index: u64, shard: &Shard) -> LbaResult<()> {
        let provider = self.provider()?;
        let mut conn = provider.meta_connection()?;
        conn.call(MetaCommand::SetField {
            key: self.key.clone(),
            field: index,
            value: shard.serialize(),
        })?;
        Ok(())
    }

    fn delete_shard(&self, index: u64) -> LbaResult<()> {
        let provider = self.provider()?;
        let mut conn = provider.meta_connection()?;
        conn.call(MetaCommand::DelField {
            key: self.key.clone(),
            field: index,
        })?;
        Ok(())
    }

    /// Write an evicted entry through to the store, best-effort.
    ///
    /// Eviction is triggered from inside a mutation that already owns a
    /// shard lock, so there is no caller to hand an error to: failures are
    /// logged and the state is dropped. A final flush before shutdown is
    /// the actual durability barrier.
    fn write_back_evicted(&self, index: u64, entry: CacheEntry) {
        let result = match entry {
            CacheEntry::Shard(shard) => {
                if !shard.dirty() {
                    return;
                }
                self.store_shard(index, &shard)
            }
            CacheEntry::Tombstone => self.delete_shard(index),
        };

        if let Err(err) = result {
            warn!(shard = index, %err, "failed to write back evicted shard");
        }
    }
}

/// Block index → content hash map of one vdisk, cached in shards.
pub struct Lba {
    meta: Arc<MetaAccess>,
    cache: ShardCache,

    /// One mutex per shard index. Locking per shard keeps concurrent
    /// operations on different shards parallel while serializing the
    /// lookup-or-create of any single shard, so a shard can never be
    /// fetched or created twice. Sized at construction, never resized.
    shard_locks: Box<[Mutex<()>]>,

    /// Serializes flush against itself.
    flush_lock: Mutex<()>,

    block_count: u64,
}

impl Lba {
    /// Create an LBA for `block_count` blocks, caching up to
    /// `cache_byte_limit` bytes of shards (min one shard).
    ///
    /// The provider is borrowed weakly; a provider that is already gone
    /// fails with [`LbaError::InvalidProvider`].
    pub fn new(
        vdisk_id: &str,
        block_count: u64,
        cache_byte_limit: u64,
        provider: Weak<dyn MetaConnectionProvider>,
    ) -> LbaResult<Self> {
        if provider.upgrade().is_none() {
            return Err(LbaError::InvalidProvider);
        }

        let shard_count = block_count.div_ceil(RECORDS_PER_SHARD);
        let shard_locks = (0..shard_count)
            .map(|_| Mutex::new(()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let meta = Arc::new(MetaAccess {
            provider,
            key: storage_key(vdisk_id),
        });

        let writer = Arc::clone(&meta);
        let cache = ShardCache::new(
            cache_byte_limit,
            Box::new(move |index, entry| writer.write_back_evicted(index, entry)),
        );

        Ok(Self {
            meta,
            cache,
            shard_locks,
            flush_lock: Mutex::new(()),
            block_count,
        })
    }

    /// Create an LBA from a configuration.
    pub fn from_config(
        config: &LbaConfig,
        provider: Weak<dyn MetaConnectionProvider>,
    ) -> LbaResult<Self> {
        Self::new(
            &config.vdisk_id,
            config.block_count,
            config.cache_bytes,
            provider,
        )
    }

    /// Number of addressable blocks.
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Number of shards covering the index space.
    pub fn shard_count(&self) -> u64 {
        self.shard_locks.len() as u64
    }

    /// Shard cache statistics.
    pub fn cache_stats(&self) -> &CacheStats {
        self.cache.stats()
    }

    /// Map the content hash for a block. The containing shard is marked
    /// dirty and persisted on eviction or at the next [`flush`](Self::flush).
    pub fn set(&self, block_index: u64, hash: Hash) -> LbaResult<()> {
        let (shard_index, record_index) = self.locate(block_index)?;
        let _guard = self.shard_locks[shard_index as usize].lock();

        let mut shard = match self.cache.get(shard_index) {
            CacheLookup::Shard(shard) => shard,
            // Deleted locally: start over from an empty shard rather than
            // resurrecting store state the tombstone still has to erase.
            CacheLookup::Deleted => Shard::new(),
            CacheLookup::Miss => self.meta.load_shard(shard_index)?.unwrap_or_default(),
        };

        shard.set(record_index, hash);
        self.cache.add(shard_index, CacheEntry::Shard(shard));
        Ok(())
    }

    /// Unmap a block: sets the nil hash.
    pub fn delete(&self, block_index: u64) -> LbaResult<()> {
        self.set(block_index, Hash::NIL)
    }

    /// Look up the content hash for a block. Blocks that were never mapped
    /// read as [`Hash::NIL`].
    pub fn get(&self, block_index: u64) -> LbaResult<Hash> {
        let (shard_index, record_index) = self.locate(block_index)?;
        let _guard = self.shard_locks[shard_index as usize].lock();

        match self.cache.get(shard_index) {
            CacheLookup::Shard(shard) => Ok(shard.get(record_index)),
            CacheLookup::Deleted => Ok(Hash::NIL),
            CacheLookup::Miss => match self.meta.load_shard(shard_index)? {
                Some(shard) => {
                    let hash = shard.get(record_index);
                    self.cache.add(shard_index, CacheEntry::Shard(shard));
                    Ok(hash)
                }
                None => Ok(Hash::NIL),
            },
        }
    }

    /// Persist all dirty shards in one transactional batch.
    ///
    /// On success the cache is dropped without re-running the eviction
    /// write-back (the batch already made it durable). On failure the cache
    /// and every dirty bit stay intact, so a later flush re-emits the same
    /// shards.
    pub fn flush(&self) -> LbaResult<()> {
        let _flushing = self.flush_lock.lock();

        let provider = self.meta.provider()?;
        let mut conn = provider.meta_connection()?;

        conn.send(MetaCommand::BeginTx)?;
        let dirty = self.cache.serialize(|index, bytes| {
            conn.send(match bytes {
                Some(value) => MetaCommand::SetField {
                    key: self.meta.key.clone(),
                    field: index,
                    value,
                },
                None => MetaCommand::DelField {
                    key: self.meta.key.clone(),
                    field: index,
                },
            })
        })?;

        match conn.call(MetaCommand::CommitTx) {
            Ok(MetaReply::Committed(_)) => {}
            Ok(reply) => {
                return Err(LbaError::TxAborted(format!(
                    "unexpected commit reply {reply:?}"
                )));
            }
            Err(err) => return Err(LbaError::TxAborted(err.to_string())),
        }

        debug!(key = %self.meta.key, shards = dirty, "flushed dirty shards");
        self.cache.clear(false);
        Ok(())
    }

    fn locate(&self, block_index: u64) -> LbaResult<(u64, usize)> {
        if block_index >= self.block_count {
            return Err(LbaError::OutOfRange {
                index: block_index,
                block_count: self.block_count,
            });
        }
        Ok((
            block_index / RECORDS_PER_SHARD,
            (block_index % RECORDS_PER_SHARD) as usize,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HASH_SIZE, SHARD_BYTE_SIZE};
    use std::sync::atomic::Ordering;
    use vblock_meta_store::{MemoryMetaStore, RedbMetaStore};

    fn hash(fill: u8) -> Hash {
        Hash::new([fill; HASH_SIZE])
    }

    fn lba_on(store: &Arc<MemoryMetaStore>, block_count: u64, cache_bytes: u64) -> Lba {
        Lba::new(
            "vd1",
            block_count,
            cache_bytes,
            Arc::downgrade(&(store.clone() as Arc<dyn MetaConnectionProvider>)),
        )
        .unwrap()
    }

    #[test]
    fn test_basic_set_get() {
        let store = Arc::new(MemoryMetaStore::new());
        let lba = lba_on(&store, 256, SHARD_BYTE_SIZE as u64);

        lba.set(0, hash(0x01)).unwrap();
        lba.set(130, hash(0x02)).unwrap();

        assert_eq!(lba.get(0).unwrap(), hash(0x01));
        assert_eq!(lba.get(130).unwrap(), hash(0x02));
        assert_eq!(lba.get(1).unwrap(), Hash::NIL);
    }

    #[test]
    fn test_from_config() {
        let store = Arc::new(MemoryMetaStore::new());
        let config = LbaConfig::new("vd1", 300);
        let lba = Lba::from_config(
            &config,
            Arc::downgrade(&(store.clone() as Arc<dyn MetaConnectionProvider>)),
        )
        .unwrap();

        assert_eq!(lba.block_count(), 300);
        assert_eq!(lba.shard_count(), 3);

        lba.set(299, hash(0x0C)).unwrap();
        assert_eq!(lba.get(299).unwrap(), hash(0x0C));
    }

    #[test]
    fn test_unwritten_blocks_read_nil() {
        let store = Arc::new(MemoryMetaStore::new());
        let lba = lba_on(&store, 512, 4 * SHARD_BYTE_SIZE as u64);

        assert_eq!(lba.get(0).unwrap(), Hash::NIL);
        assert_eq!(lba.get(511).unwrap(), Hash::NIL);
    }

    #[test]
    fn test_set_is_idempotent() {
        let store = Arc::new(MemoryMetaStore::new());
        let lba = lba_on(&store, 256, 4 * SHARD_BYTE_SIZE as u64);

        lba.set(9, hash(0x42)).unwrap();
        lba.set(9, hash(0x42)).unwrap();
        assert_eq!(lba.get(9).unwrap(), hash(0x42));

        lba.flush().unwrap();
        assert_eq!(store.field_count("lba:vd1"), 1);
        assert_eq!(lba.get(9).unwrap(), hash(0x42));
    }

    #[test]
    fn test_cross_shard_eviction_writes_through() {
        let store = Arc::new(MemoryMetaStore::new());
        let lba = lba_on(&store, 512, SHARD_BYTE_SIZE as u64);

        lba.set(0, hash(0xA1)).unwrap();
        // Creating shard 1 evicts dirty shard 0, which must reach the store.
        lba.set(128, hash(0xB2)).unwrap();
        assert!(store.field("lba:vd1", 0).is_some());

        // A fresh LBA over the same volume sees shard 0 but not the still
        // cached shard 1.
        let fresh = lba_on(&store, 512, SHARD_BYTE_SIZE as u64);
        assert_eq!(fresh.get(0).unwrap(), hash(0xA1));
        assert_eq!(fresh.get(128).unwrap(), Hash::NIL);

        lba.flush().unwrap();
        let reopened = lba_on(&store, 512, SHARD_BYTE_SIZE as u64);
        assert_eq!(reopened.get(128).unwrap(), hash(0xB2));
    }

    #[test]
    fn test_delete_via_nil_hash() {
        let store = Arc::new(MemoryMetaStore::new());
        let lba = lba_on(&store, 256, 4 * SHARD_BYTE_SIZE as u64);

        lba.set(5, hash(0x05)).unwrap();
        lba.delete(5).unwrap();
        assert_eq!(lba.get(5).unwrap(), Hash::NIL);

        // The emptied shard flushes as a field delete, not as zero bytes.
        lba.flush().unwrap();
        assert_eq!(store.field_count("lba:vd1"), 0);

        let reopened = lba_on(&store, 256, 4 * SHARD_BYTE_SIZE as u64);
        assert_eq!(reopened.get(5).unwrap(), Hash::NIL);
    }

    #[test]
    fn test_corrupt_shard_surfaces_on_get() {
        let store = Arc::new(MemoryMetaStore::new());
        store.put_field(&storage_key("vd1"), 0, vec![0u8; SHARD_BYTE_SIZE - 1]);

        let lba = lba_on(&store, 256, SHARD_BYTE_SIZE as u64);
        assert!(matches!(
            lba.get(0),
            Err(LbaError::CorruptShard { actual, .. }) if actual == SHARD_BYTE_SIZE - 1
        ));
    }

    #[test]
    fn test_concurrent_same_shard_sets_fetch_once() {
        let store = Arc::new(MemoryMetaStore::new());
        let lba = lba_on(&store, 256, 4 * SHARD_BYTE_SIZE as u64);

        std::thread::scope(|scope| {
            for i in 0u64..100 {
                let lba = &lba;
                scope.spawn(move || lba.set(i, hash(i as u8 + 1)).unwrap());
            }
        });

        for i in 0u64..100 {
            assert_eq!(lba.get(i).unwrap(), hash(i as u8 + 1));
        }

        // All 100 writes landed in one shard; only the first miss consulted
        // the store.
        assert_eq!(store.stats().get_fields.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_flush_failure_keeps_cache_and_retries() {
        let store = Arc::new(MemoryMetaStore::new());
        let lba = lba_on(&store, 512, 4 * SHARD_BYTE_SIZE as u64);

        lba.set(0, hash(0x11)).unwrap();
        lba.set(200, hash(0x22)).unwrap();

        store.fail_next_commits(1);
        assert!(matches!(lba.flush(), Err(LbaError::TxAborted(_))));
        assert_eq!(store.field_count("lba:vd1"), 0);

        // The failed flush left the shards cached: reads do not touch the
        // store again.
        let fetches = store.stats().get_fields.load(Ordering::Relaxed);
        assert_eq!(lba.get(0).unwrap(), hash(0x11));
        assert_eq!(store.stats().get_fields.load(Ordering::Relaxed), fetches);

        // The same dirty shards land with the next flush.
        lba.flush().unwrap();
        assert_eq!(store.field_count("lba:vd1"), 2);

        let reopened = lba_on(&store, 512, 4 * SHARD_BYTE_SIZE as u64);
        assert_eq!(reopened.get(0).unwrap(), hash(0x11));
        assert_eq!(reopened.get(200).unwrap(), hash(0x22));
    }

    #[test]
    fn test_flush_clears_cache_on_success() {
        let store = Arc::new(MemoryMetaStore::new());
        let lba = lba_on(&store, 256, 4 * SHARD_BYTE_SIZE as u64);

        lba.set(0, hash(0x33)).unwrap();
        lba.flush().unwrap();

        // The next read misses the cache and reloads from the store.
        let fetches = store.stats().get_fields.load(Ordering::Relaxed);
        assert_eq!(lba.get(0).unwrap(), hash(0x33));
        assert_eq!(
            store.stats().get_fields.load(Ordering::Relaxed),
            fetches + 1
        );
    }

    #[test]
    fn test_eviction_write_back_failure_is_swallowed() {
        let store = Arc::new(MemoryMetaStore::new());
        let lba = lba_on(&store, 512, SHARD_BYTE_SIZE as u64);

        lba.set(0, hash(0x44)).unwrap();
        store.fail_next_sets(1);

        // Evicting dirty shard 0 fails to write back; the mutation itself
        // still succeeds.
        lba.set(128, hash(0x55)).unwrap();
        assert_eq!(store.field_count("lba:vd1"), 0);
        assert_eq!(lba.get(128).unwrap(), hash(0x55));
    }

    #[test]
    fn test_out_of_range_block_index() {
        let store = Arc::new(MemoryMetaStore::new());
        let lba = lba_on(&store, 256, SHARD_BYTE_SIZE as u64);

        assert!(matches!(
            lba.get(256),
            Err(LbaError::OutOfRange {
                index: 256,
                block_count: 256,
            })
        ));
        assert!(lba.set(1 << 40, hash(0x01)).is_err());
    }

    #[test]
    fn test_provider_gone_is_invalid_provider() {
        let store = Arc::new(MemoryMetaStore::new());
        let weak = Arc::downgrade(&store);
        drop(store);
        assert!(matches!(
            Lba::new("vd1", 256, SHARD_BYTE_SIZE as u64, weak),
            Err(LbaError::InvalidProvider)
        ));

        // Dropping the provider after construction surfaces on the next
        // store access.
        let store = Arc::new(MemoryMetaStore::new());
        let lba = lba_on(&store, 256, SHARD_BYTE_SIZE as u64);
        drop(store);
        assert!(matches!(lba.get(0), Err(LbaError::InvalidProvider)));
    }

    #[test]
    fn test_flush_and_reopen_against_redb() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RedbMetaStore::open(dir.path().join("meta.redb")).unwrap());

        let lba = Lba::new(
            "vd1",
            512,
            SHARD_BYTE_SIZE as u64,
            Arc::downgrade(&(store.clone() as Arc<dyn MetaConnectionProvider>)),
        )
        .unwrap();
        lba.set(0, hash(0x61)).unwrap();
        lba.set(300, hash(0x62)).unwrap();
        lba.flush().unwrap();
        drop(lba);

        let reopened = Lba::new(
            "vd1",
            512,
            SHARD_BYTE_SIZE as u64,
            Arc::downgrade(&(store.clone() as Arc<dyn MetaConnectionProvider>)),
        )
        .unwrap();
        assert_eq!(reopened.get(0).unwrap(), hash(0x61));
        assert_eq!(reopened.get(300).unwrap(), hash(0x62));
        assert_eq!(reopened.get(1).unwrap(), Hash::NIL);
    }
}

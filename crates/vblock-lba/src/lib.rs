//! vblock LBA metadata cache
//!
//! This crate maintains the mapping from a vdisk's logical block indices to
//! the content hashes of its blocks. The map is partitioned into shards of
//! [`RECORDS_PER_SHARD`] records; shards are held in a bounded write-back
//! cache and persisted through a hash-field interface on the external
//! metadata store.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  Block storage   │  (deduped lookup: block index → content hash)
//! └────────┬─────────┘
//!          │ get / set / delete / flush
//! ┌────────▼─────────┐
//! │       Lba        │  per-shard locks, shard addressing
//! │   ┌───────────┐  │
//! │   │ ShardCache│  │  bounded LRU, dirty write-back on eviction
//! │   └───────────┘  │
//! └────────┬─────────┘
//!          │ hash-field commands
//! ┌────────▼─────────┐
//! │  Metadata store  │  (vblock-meta-store connection)
//! └──────────────────┘
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod hash;
pub mod lba;
pub mod shard;

pub use cache::{CacheEntry, CacheLookup, CacheStats, ShardCache};
pub use config::LbaConfig;
pub use error::{LbaError, LbaResult};
pub use hash::Hash;
pub use lba::{storage_key, Lba, STORAGE_KEY_PREFIX};
pub use shard::Shard;

/// Width of a content hash in bytes
pub const HASH_SIZE: usize = 32;

/// Number of hash records per LBA shard
pub const RECORDS_PER_SHARD: u64 = 128;

/// Serialized size of one shard: 128 records of [`HASH_SIZE`] bytes
pub const SHARD_BYTE_SIZE: usize = RECORDS_PER_SHARD as usize * HASH_SIZE;

/// Default shard cache limit: 20 MiB
pub const DEFAULT_CACHE_BYTES: u64 = 20 * 1024 * 1024;

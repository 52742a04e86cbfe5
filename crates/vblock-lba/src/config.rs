//! Configuration for the LBA subsystem

use crate::DEFAULT_CACHE_BYTES;
use serde::{Deserialize, Serialize};

/// LBA configuration for one vdisk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LbaConfig {
    /// Vdisk identifier; prefixed into the metadata store aggregate key.
    pub vdisk_id: String,
    /// Total number of addressable blocks.
    pub block_count: u64,
    /// Shard cache limit in bytes; min-capped to one shard.
    #[serde(default = "default_cache_bytes")]
    pub cache_bytes: u64,
}

impl LbaConfig {
    /// Configuration with the default cache limit.
    pub fn new(vdisk_id: impl Into<String>, block_count: u64) -> Self {
        Self {
            vdisk_id: vdisk_id.into(),
            block_count,
            cache_bytes: DEFAULT_CACHE_BYTES,
        }
    }
}

fn default_cache_bytes() -> u64 {
    DEFAULT_CACHE_BYTES
}

//! LBA error types

use thiserror::Error;
use vblock_meta_store::StoreError;

/// LBA error
#[derive(Error, Debug)]
pub enum LbaError {
    /// No metadata connection provider (absent at construction, or dropped
    /// while the LBA was still in use)
    #[error("No metadata connection provider available")]
    InvalidProvider,

    /// A persisted shard could not be decoded
    #[error("Corrupt shard: expected {expected} bytes, got {actual}")]
    CorruptShard { expected: usize, actual: usize },

    /// The flush transaction was not applied
    #[error("Flush transaction aborted: {0}")]
    TxAborted(String),

    /// Block index beyond the vdisk's block count
    #[error("Block index {index} out of range (block count {block_count})")]
    OutOfRange { index: u64, block_count: u64 },

    /// Metadata store error
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for LBA operations
pub type LbaResult<T> = Result<T, LbaError>;

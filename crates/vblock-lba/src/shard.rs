//! LBA shards
//!
//! A shard is a dense group of [`RECORDS_PER_SHARD`] hash records, the unit
//! of caching and persistence. Its wire format is the concatenation of the
//! raw records, exactly `RECORDS_PER_SHARD * HASH_SIZE` bytes: no header,
//! no checksum, no version byte. A record that was never set serializes as
//! zeroes, which is the nil hash.

use crate::error::{LbaError, LbaResult};
use crate::hash::Hash;
use crate::{RECORDS_PER_SHARD, SHARD_BYTE_SIZE};

use bytes::Bytes;

/// A fixed-length group of hash records with a dirty bit.
///
/// The dirty bit is set on every mutation and only cleared by a successful
/// durable write.
#[derive(Debug, Clone)]
pub struct Shard {
    records: Box<[Hash; RECORDS_PER_SHARD as usize]>,
    dirty: bool,
}

impl Shard {
    /// Create a shard with every record nil.
    pub fn new() -> Self {
        Self {
            records: Box::new([Hash::NIL; RECORDS_PER_SHARD as usize]),
            dirty: false,
        }
    }

    /// Read one record. Unset records read as [`Hash::NIL`].
    pub fn get(&self, index: usize) -> Hash {
        self.records[index]
    }

    /// Write one record and mark the shard dirty.
    pub fn set(&mut self, index: usize, hash: Hash) {
        self.records[index] = hash;
        self.dirty = true;
    }

    /// True iff the shard was mutated since its last durable write.
    pub fn dirty(&self) -> bool {
        self.dirty
    }

    /// Clear the dirty bit. Called after a successful durable write.
    pub fn unset_dirty(&mut self) {
        self.dirty = false;
    }

    /// True iff every record is nil. An all-nil shard is equivalent to no
    /// shard at all in the external store.
    pub fn is_empty(&self) -> bool {
        self.records.iter().all(Hash::is_nil)
    }

    /// Serialize to the wire format.
    pub fn serialize(&self) -> Bytes {
        let mut buf = Vec::with_capacity(SHARD_BYTE_SIZE);
        for record in self.records.iter() {
            buf.extend_from_slice(record.as_bytes());
        }
        Bytes::from(buf)
    }

    /// Deserialize from the wire format. The buffer length must be exactly
    /// [`SHARD_BYTE_SIZE`](crate::SHARD_BYTE_SIZE); the returned shard is
    /// clean.
    pub fn deserialize(buf: &[u8]) -> LbaResult<Self> {
        if buf.len() != SHARD_BYTE_SIZE {
            return Err(LbaError::CorruptShard {
                expected: SHARD_BYTE_SIZE,
                actual: buf.len(),
            });
        }

        let mut shard = Shard::new();
        for (record, chunk) in shard
            .records
            .iter_mut()
            .zip(buf.chunks_exact(crate::HASH_SIZE))
        {
            let mut bytes = [0u8; crate::HASH_SIZE];
            bytes.copy_from_slice(chunk);
            *record = Hash::new(bytes);
        }
        Ok(shard)
    }
}

impl Default for Shard {
    fn default() -> Self {
        Self::new()
    }
}

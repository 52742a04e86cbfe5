//! In-memory metadata store
//!
//! Keeps every aggregate in a process-local map. Used as the provider in
//! unit tests and as a reference implementation of the connection contract;
//! the fault-injection switches make provider outages and commit failures
//! reproducible without a network.

use crate::connection::{
    MetaCommand, MetaConnection, MetaConnectionProvider, MetaReply, Pipeline,
};
use crate::error::{StoreError, StoreResult};

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Operation counters, shared across all connections of one store.
#[derive(Debug, Default)]
pub struct StoreStats {
    pub get_fields: AtomicU64,
    pub set_fields: AtomicU64,
    pub del_fields: AtomicU64,
    pub commits: AtomicU64,
}

/// In-memory hash-field store.
pub struct MemoryMetaStore {
    aggregates: RwLock<HashMap<String, BTreeMap<u64, Bytes>>>,
    unavailable: AtomicBool,
    fail_commits: AtomicU32,
    fail_sets: AtomicU32,
    stats: StoreStats,
}

impl MemoryMetaStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            aggregates: RwLock::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
            fail_commits: AtomicU32::new(0),
            fail_sets: AtomicU32::new(0),
            stats: StoreStats::default(),
        }
    }

    /// Refuse all connection acquisitions while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `n` transaction commits.
    pub fn fail_next_commits(&self, n: u32) {
        self.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` non-transactional field writes.
    pub fn fail_next_sets(&self, n: u32) {
        self.fail_sets.store(n, Ordering::SeqCst);
    }

    /// Seed a field directly, bypassing the connection contract.
    pub fn put_field(&self, key: &str, field: u64, value: impl Into<Bytes>) {
        self.aggregates
            .write()
            .entry(key.to_string())
            .or_default()
            .insert(field, value.into());
    }

    /// Read a field directly.
    pub fn field(&self, key: &str, field: u64) -> Option<Bytes> {
        self.aggregates
            .read()
            .get(key)
            .and_then(|fields| fields.get(&field).cloned())
    }

    /// Number of fields stored under an aggregate key.
    pub fn field_count(&self, key: &str) -> usize {
        self.aggregates
            .read()
            .get(key)
            .map(|fields| fields.len())
            .unwrap_or(0)
    }

    /// Operation counters.
    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    fn apply(&self, cmd: &MetaCommand) -> StoreResult<MetaReply> {
        match cmd {
            MetaCommand::GetField { key, field } => {
                self.stats.get_fields.fetch_add(1, Ordering::Relaxed);
                match self.field(key, *field) {
                    Some(value) => Ok(MetaReply::Value(value)),
                    None => Ok(MetaReply::Absent),
                }
            }
            MetaCommand::SetField { key, field, value } => {
                if self.fail_sets.load(Ordering::SeqCst) > 0 {
                    self.fail_sets.fetch_sub(1, Ordering::SeqCst);
                    return Err(StoreError::Unavailable("injected write failure".into()));
                }
                self.stats.set_fields.fetch_add(1, Ordering::Relaxed);
                self.put_field(key, *field, value.clone());
                Ok(MetaReply::Done)
            }
            MetaCommand::DelField { key, field } => {
                self.stats.del_fields.fetch_add(1, Ordering::Relaxed);
                let mut aggregates = self.aggregates.write();
                if let Some(fields) = aggregates.get_mut(key) {
                    fields.remove(field);
                    if fields.is_empty() {
                        aggregates.remove(key);
                    }
                }
                Ok(MetaReply::Done)
            }
            MetaCommand::BeginTx | MetaCommand::CommitTx => {
                unreachable!("transaction brackets are handled by the connection")
            }
        }
    }

    /// Apply a staged batch under one write lock.
    fn commit(&self, staged: Vec<MetaCommand>) -> StoreResult<MetaReply> {
        if self.fail_commits.load(Ordering::SeqCst) > 0 {
            self.fail_commits.fetch_sub(1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("injected commit failure".into()));
        }

        let mut aggregates = self.aggregates.write();
        let applied = staged.len();
        for cmd in staged {
            match cmd {
                MetaCommand::SetField { key, field, value } => {
                    self.stats.set_fields.fetch_add(1, Ordering::Relaxed);
                    aggregates.entry(key).or_default().insert(field, value);
                }
                MetaCommand::DelField { key, field } => {
                    self.stats.del_fields.fetch_add(1, Ordering::Relaxed);
                    if let Some(fields) = aggregates.get_mut(&key) {
                        fields.remove(&field);
                        if fields.is_empty() {
                            aggregates.remove(&key);
                        }
                    }
                }
                other => {
                    return Err(StoreError::Protocol(format!(
                        "{other:?} staged inside a transaction"
                    )));
                }
            }
        }

        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        Ok(MetaReply::Committed(applied))
    }
}

impl Default for MemoryMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaConnectionProvider for MemoryMetaStore {
    fn meta_connection(&self) -> StoreResult<Box<dyn MetaConnection + '_>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store marked unavailable".into()));
        }
        Ok(Box::new(MemoryMetaConnection {
            store: self,
            pipeline: Pipeline::default(),
            tx: None,
        }))
    }
}

struct MemoryMetaConnection<'a> {
    store: &'a MemoryMetaStore,
    pipeline: Pipeline,
    tx: Option<Vec<MetaCommand>>,
}

impl MemoryMetaConnection<'_> {
    fn execute(&mut self, cmd: MetaCommand) -> StoreResult<MetaReply> {
        match cmd {
            MetaCommand::BeginTx => {
                if self.tx.is_some() {
                    return Err(StoreError::Protocol("nested transaction".into()));
                }
                self.tx = Some(Vec::new());
                Ok(MetaReply::Done)
            }
            MetaCommand::CommitTx => {
                let staged = self
                    .tx
                    .take()
                    .ok_or_else(|| StoreError::Protocol("commit without open transaction".into()))?;
                self.store.commit(staged)
            }
            MetaCommand::GetField { .. } if self.tx.is_some() => Err(StoreError::Protocol(
                "read inside an open transaction".into(),
            )),
            write @ (MetaCommand::SetField { .. } | MetaCommand::DelField { .. })
                if self.tx.is_some() =>
            {
                self.tx
                    .as_mut()
                    .expect("transaction checked above")
                    .push(write);
                Ok(MetaReply::Queued)
            }
            cmd => self.store.apply(&cmd),
        }
    }
}

impl MetaConnection for MemoryMetaConnection<'_> {
    fn send(&mut self, cmd: MetaCommand) -> StoreResult<()> {
        self.pipeline.push(cmd);
        Ok(())
    }

    fn flush(&mut self) -> StoreResult<()> {
        for cmd in self.pipeline.drain_pending() {
            let reply = self.execute(cmd)?;
            self.pipeline.push_reply(reply);
        }
        Ok(())
    }

    fn receive(&mut self) -> StoreResult<MetaReply> {
        self.pipeline.pop_reply()
    }

    fn call(&mut self, cmd: MetaCommand) -> StoreResult<MetaReply> {
        self.send(cmd)?;
        self.flush()?;
        self.pipeline.take_last_reply()
    }
}

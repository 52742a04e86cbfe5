//! Persistent metadata store using redb
//!
//! Stores shard fields as `(aggregate key, field) → bytes` rows so vdisk
//! metadata survives restarts. A transactional batch maps onto a single
//! redb write transaction, which gives the commit its atomicity.

use crate::connection::{
    MetaCommand, MetaConnection, MetaConnectionProvider, MetaReply, Pipeline,
};
use crate::error::{StoreError, StoreResult};

use bytes::Bytes;
use redb::{Database, TableDefinition};
use std::fmt::Display;
use std::path::Path;

/// Shard fields: (aggregate key, field) → opaque shard bytes
const SHARDS: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("shards");

fn backend_err(err: impl Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// Persistent hash-field store backed by redb.
pub struct RedbMetaStore {
    db: Database,
}

impl RedbMetaStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db = Database::create(path).map_err(backend_err)?;

        // Ensure the table exists before the first read
        let wtx = db.begin_write().map_err(backend_err)?;
        wtx.open_table(SHARDS).map_err(backend_err)?;
        wtx.commit().map_err(backend_err)?;

        Ok(Self { db })
    }

    fn get_field(&self, key: &str, field: u64) -> StoreResult<Option<Bytes>> {
        let rtx = self.db.begin_read().map_err(backend_err)?;
        let table = rtx.open_table(SHARDS).map_err(backend_err)?;
        let value = table
            .get((key, field))
            .map_err(backend_err)?
            .map(|guard| Bytes::copy_from_slice(guard.value()));
        Ok(value)
    }

    fn set_field(&self, key: &str, field: u64, value: &[u8]) -> StoreResult<()> {
        let wtx = self.db.begin_write().map_err(backend_err)?;
        wtx.open_table(SHARDS)
            .map_err(backend_err)?
            .insert((key, field), value)
            .map_err(backend_err)?;
        wtx.commit().map_err(backend_err)?;
        Ok(())
    }

    fn del_field(&self, key: &str, field: u64) -> StoreResult<()> {
        let wtx = self.db.begin_write().map_err(backend_err)?;
        wtx.open_table(SHARDS)
            .map_err(backend_err)?
            .remove((key, field))
            .map_err(backend_err)?;
        wtx.commit().map_err(backend_err)?;
        Ok(())
    }

    /// Apply a staged batch inside one redb write transaction.
    fn commit(&self, staged: Vec<MetaCommand>) -> StoreResult<MetaReply> {
        let wtx = self
            .db
            .begin_write()
            .map_err(|err| StoreError::TxAborted(err.to_string()))?;
        let applied = staged.len();
        {
            let mut table = wtx.open_table(SHARDS).map_err(backend_err)?;
            for cmd in staged {
                match cmd {
                    MetaCommand::SetField { key, field, value } => {
                        table
                            .insert((key.as_str(), field), value.as_ref())
                            .map_err(backend_err)?;
                    }
                    MetaCommand::DelField { key, field } => {
                        table.remove((key.as_str(), field)).map_err(backend_err)?;
                    }
                    other => {
                        return Err(StoreError::Protocol(format!(
                            "{other:?} staged inside a transaction"
                        )));
                    }
                }
            }
        }
        wtx.commit()
            .map_err(|err| StoreError::TxAborted(err.to_string()))?;
        Ok(MetaReply::Committed(applied))
    }
}

impl MetaConnectionProvider for RedbMetaStore {
    fn meta_connection(&self) -> StoreResult<Box<dyn MetaConnection + '_>> {
        Ok(Box::new(RedbMetaConnection {
            store: self,
            pipeline: Pipeline::default(),
            tx: None,
        }))
    }
}

struct RedbMetaConnection<'a> {
    store: &'a RedbMetaStore,
    pipeline: Pipeline,
    tx: Option<Vec<MetaCommand>>,
}

impl RedbMetaConnection<'_> {
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
            MetaCommand::GetField { key, field } => match self.store.get_field(&key, field)? {
                Some(value) => Ok(MetaReply::Value(value)),
                None => Ok(MetaReply::Absent),
            },
            MetaCommand::SetField { key, field, value } => {
                self.store.set_field(&key, field, &value)?;
                Ok(MetaReply::Done)
            }
            MetaCommand::DelField { key, field } => {
                self.store.del_field(&key, field)?;
                Ok(MetaReply::Done)
            }
        }
    }
}

impl MetaConnection for RedbMetaConnection<'_> {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn get(key: &str, field: u64) -> MetaCommand {
        MetaCommand::GetField {
            key: key.to_string(),
            field,
        }
    }

    fn set(key: &str, field: u64, value: &[u8]) -> MetaCommand {
        MetaCommand::SetField {
            key: key.to_string(),
            field,
            value: Bytes::copy_from_slice(value),
        }
    }

    #[test]
    fn test_set_get_del_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbMetaStore::open(dir.path().join("meta.redb")).unwrap();
        let mut conn = store.meta_connection().unwrap();

        assert_eq!(conn.call(get("vd1", 3)).unwrap(), MetaReply::Absent);
        conn.call(set("vd1", 3, b"shard bytes")).unwrap();
        assert_eq!(
            conn.call(get("vd1", 3)).unwrap(),
            MetaReply::Value(Bytes::from_static(b"shard bytes"))
        );

        conn.call(MetaCommand::DelField {
            key: "vd1".to_string(),
            field: 3,
        })
        .unwrap();
        assert_eq!(conn.call(get("vd1", 3)).unwrap(), MetaReply::Absent);
    }

    #[test]
    fn test_transaction_commits_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbMetaStore::open(dir.path().join("meta.redb")).unwrap();
        let mut conn = store.meta_connection().unwrap();

        conn.send(MetaCommand::BeginTx).unwrap();
        conn.send(set("vd1", 0, b"zero")).unwrap();
        conn.send(set("vd1", 1, b"one")).unwrap();
        assert_eq!(
            conn.call(MetaCommand::CommitTx).unwrap(),
            MetaReply::Committed(2)
        );

        assert_eq!(
            conn.call(get("vd1", 1)).unwrap(),
            MetaReply::Value(Bytes::from_static(b"one"))
        );
    }

    #[test]
    fn test_fields_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.redb");

        {
            let store = RedbMetaStore::open(&path).unwrap();
            let mut conn = store.meta_connection().unwrap();
            conn.call(set("vd1", 42, b"persisted")).unwrap();
        }

        let store = RedbMetaStore::open(&path).unwrap();
        let mut conn = store.meta_connection().unwrap();
        assert_eq!(
            conn.call(get("vd1", 42)).unwrap(),
            MetaReply::Value(Bytes::from_static(b"persisted"))
        );
    }

    #[test]
    fn test_aggregates_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbMetaStore::open(dir.path().join("meta.redb")).unwrap();
        let mut conn = store.meta_connection().unwrap();

        conn.call(set("vd1", 0, b"for vd1")).unwrap();
        assert_eq!(conn.call(get("vd2", 0)).unwrap(), MetaReply::Absent);
    }
}

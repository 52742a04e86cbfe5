//! Connection contract for the external metadata store
//!
//! Connections are short-lived: callers acquire one per operation from a
//! [`MetaConnectionProvider`], run commands on it, and release it by
//! dropping it. Commands may be executed one at a time with [`call`], or
//! pipelined with [`send`]/[`flush`]/[`receive`] so that a whole batch
//! crosses the wire at once.
//!
//! [`call`]: MetaConnection::call
//! [`send`]: MetaConnection::send
//! [`flush`]: MetaConnection::flush
//! [`receive`]: MetaConnection::receive

use crate::error::{StoreError, StoreResult};
use bytes::Bytes;

/// A single hash-field command understood by the metadata store.
#[derive(Debug, Clone)]
pub enum MetaCommand {
    /// Read one field under an aggregate key.
    GetField { key: String, field: u64 },
    /// Write one field under an aggregate key.
    SetField { key: String, field: u64, value: Bytes },
    /// Remove one field under an aggregate key.
    DelField { key: String, field: u64 },
    /// Open a transaction; subsequent writes are staged until commit.
    BeginTx,
    /// Atomically apply all writes staged since [`MetaCommand::BeginTx`].
    CommitTx,
}

/// Reply to a [`MetaCommand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaReply {
    /// Field value.
    Value(Bytes),
    /// The field (or the whole aggregate) does not exist.
    Absent,
    /// Command applied.
    Done,
    /// Command staged inside an open transaction.
    Queued,
    /// Transaction committed; number of writes applied.
    Committed(usize),
}

/// One scoped connection to the metadata store.
///
/// Dropping the connection releases it, success or failure.
pub trait MetaConnection {
    /// Buffer a command into the connection's pipeline.
    fn send(&mut self, cmd: MetaCommand) -> StoreResult<()>;

    /// Execute every buffered command, queueing one reply per command.
    fn flush(&mut self) -> StoreResult<()>;

    /// Take the next pending reply.
    fn receive(&mut self) -> StoreResult<MetaReply>;

    /// Execute `cmd` synchronously: flush the pipeline along with `cmd` and
    /// return the reply to `cmd`, discarding replies to earlier buffered
    /// commands.
    fn call(&mut self, cmd: MetaCommand) -> StoreResult<MetaReply>;
}

/// Supplies short-lived metadata store connections.
pub trait MetaConnectionProvider: Send + Sync {
    /// Acquire a connection, or fail with [`StoreError::Unavailable`].
    fn meta_connection(&self) -> StoreResult<Box<dyn MetaConnection + '_>>;
}

/// Reply queue shared by connection implementations: commands are buffered
/// on `send`, executed in order on `flush`, and their replies drained by
/// `receive`/`call`.
#[derive(Debug, Default)]
pub(crate) struct Pipeline {
    pending: Vec<MetaCommand>,
    replies: std::collections::VecDeque<MetaReply>,
}

impl Pipeline {
    pub(crate) fn push(&mut self, cmd: MetaCommand) {
        self.pending.push(cmd);
    }

    pub(crate) fn drain_pending(&mut self) -> Vec<MetaCommand> {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn push_reply(&mut self, reply: MetaReply) {
        self.replies.push_back(reply);
    }

    pub(crate) fn pop_reply(&mut self) -> StoreResult<MetaReply> {
        self.replies
            .pop_front()
            .ok_or_else(|| StoreError::Protocol("receive with no pending reply".into()))
    }

    /// Take the most recent reply and discard the rest (`call` semantics).
    pub(crate) fn take_last_reply(&mut self) -> StoreResult<MetaReply> {
        let last = self
            .replies
            .pop_back()
            .ok_or_else(|| StoreError::Protocol("call produced no reply".into()))?;
        self.replies.clear();
        Ok(last)
    }
}

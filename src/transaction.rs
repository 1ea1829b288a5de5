use arrow::record_batch::RecordBatch;
use log::{debug, warn};
use std::sync::Arc;

use crate::commands::{
    ClearCommand, Command, CommitCommand, LockControlCommand, PrepareCommand,
    PutKeyValueCommand, PutMapCommand, RemoveCommand, ReturnValue, RollbackCommand,
};
use crate::context::InvocationContext;
use crate::data_store::versioned_value::VersionedValue;
use crate::errors::Result;
use crate::isolation::TransactionIsolation;
use crate::key::CacheKey;
use crate::seshat::Seshat;
use crate::tx::{GlobalTransaction, LocalTransaction};

/// Represents a single grid transaction.
///
/// Writes are buffered on the node that started the transaction and become
/// visible to nobody until [`commit`](Transaction::commit). Committing
/// broadcasts the writes in total order; every member validates them in the
/// same order, and the transaction commits only if every member agreed.
/// Transactions are created by [`Seshat::begin`].
pub struct Transaction {
    node: Arc<Seshat>,
    local: Arc<LocalTransaction>,
    finished: bool,
}

impl Transaction {
    pub(crate) fn new(node: Arc<Seshat>, local: Arc<LocalTransaction>) -> Self {
        Self {
            node,
            local,
            finished: false,
        }
    }

    pub fn id(&self) -> GlobalTransaction {
        self.local.gtx()
    }

    pub fn isolation(&self) -> TransactionIsolation {
        self.local.isolation()
    }

    fn invoke(&self, command: Command) -> Result<ReturnValue> {
        let mut ctx = InvocationContext::local(Arc::clone(&self.local));
        self.node.invoke(&mut ctx, command)
    }

    /// Reads a key.
    ///
    /// The transaction's own writes win. Otherwise the value is read from an
    /// owner; under repeatable read the first read of a key is pinned and its
    /// version is validated when the transaction commits.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use seshat::prelude::*;
    /// # fn batch() -> arrow::record_batch::RecordBatch { unimplemented!() }
    ///
    /// let cluster = LocalCluster::start(3, SeshatConfig::new(0), Vec::new()).unwrap();
    /// let node = cluster.node(1).unwrap();
    ///
    /// let mut txn = node.begin();
    /// txn.write("user:1", batch()).unwrap();
    /// assert!(txn.read("user:1").unwrap().is_some());
    /// txn.commit().unwrap();
    /// ```
    pub fn read(&mut self, key: impl Into<CacheKey>) -> Result<Option<Arc<RecordBatch>>> {
        let key = key.into();
        if let Some(own) = self.local.lookup_modified(&key) {
            return Ok(own);
        }
        if let Some(pinned) = self.local.cached_read(&key) {
            return Ok(pinned.map(VersionedValue::into_data));
        }

        let value = self.node.get_versioned(&key)?;
        self.local.record_read(key, value.clone());
        Ok(value.map(VersionedValue::into_data))
    }

    /// Stages a write of `record_batch` under `key`.
    pub fn write(&mut self, key: impl Into<CacheKey>, record_batch: RecordBatch) -> Result<()> {
        self.invoke(Command::Put(PutKeyValueCommand {
            key: key.into(),
            value: Arc::new(record_batch),
        }))?;
        Ok(())
    }

    pub fn write_all(&mut self, entries: Vec<(CacheKey, RecordBatch)>) -> Result<()> {
        let entries = entries
            .into_iter()
            .map(|(key, value)| (key, Arc::new(value)))
            .collect();
        self.invoke(Command::PutAll(PutMapCommand { entries }))?;
        Ok(())
    }

    /// Stages the removal of `key`.
    pub fn delete(&mut self, key: impl Into<CacheKey>) -> Result<()> {
        self.invoke(Command::Remove(RemoveCommand { key: key.into() }))?;
        Ok(())
    }

    /// Stages the removal of every entry.
    pub fn clear(&mut self) -> Result<()> {
        self.invoke(Command::Clear(ClearCommand))?;
        Ok(())
    }

    /// Explicit locking. Always fails with
    /// [`SeshatError::UnsupportedOperation`](crate::errors::SeshatError::UnsupportedOperation):
    /// total order decides conflicts without locks.
    pub fn lock(&mut self, keys: Vec<CacheKey>) -> Result<()> {
        self.invoke(Command::LockControl(LockControlCommand {
            gtx: self.id(),
            keys,
        }))?;
        Ok(())
    }

    /// Commits the transaction.
    ///
    /// The outcome is decided by the prepare: once every member validated
    /// it, the transaction is committed and `Ok` is returned, even when a
    /// member failed to acknowledge the commit itself.
    ///
    /// # Errors
    ///
    /// Any error of the prepare phase: [`SeshatError::ValidationFailure`]
    /// when a member found stale reads, [`SeshatError::NodeUnreachable`] when
    /// a member is partitioned from this node, [`SeshatError::Timeout`] when
    /// not every member answered. The transaction was applied nowhere and
    /// has been rolled back on every reachable member when the error is
    /// returned.
    ///
    /// [`SeshatError::ValidationFailure`]: crate::errors::SeshatError::ValidationFailure
    /// [`SeshatError::NodeUnreachable`]: crate::errors::SeshatError::NodeUnreachable
    /// [`SeshatError::Timeout`]: crate::errors::SeshatError::Timeout
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        let gtx = self.id();
        if !self.local.has_modifications() {
            debug!("{} has nothing to commit", gtx);
            return Ok(());
        }

        let prepare = PrepareCommand {
            gtx,
            modifications: self.local.modifications(),
            affected_keys: self.local.affected_keys(),
            versions_seen: self.local.versions_seen(),
            origin: self.node.node_id(),
        };
        if let Err(error) = self.invoke(Command::Prepare(prepare)) {
            debug!("Prepare of {} failed: {}", gtx, error);
            // Nothing left this node unless the prepare was registered.
            if self.node.manager().local_transaction(&gtx).is_some() {
                if let Err(rollback_error) = self.invoke(Command::Rollback(RollbackCommand { gtx })) {
                    warn!("Rollback of {} failed: {}", gtx, rollback_error);
                }
            }
            return Err(error);
        }

        self.invoke(Command::Commit(CommitCommand {
            gtx,
            updated_versions: Some(self.local.updated_versions()),
        }))?;
        debug!("Committed {}", gtx);
        Ok(())
    }

    /// Discards the transaction. Its writes never left this node.
    pub fn rollback(mut self) {
        self.finished = true;
        debug!("Rolled back {}", self.id());
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            debug!("{} dropped without commit, discarding", self.id());
        }
    }
}

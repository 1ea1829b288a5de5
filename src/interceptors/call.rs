use arrow::record_batch::RecordBatch;
use log::{debug, trace};
use std::sync::Arc;

use crate::commands::{
    Command, Modification, PrepareCommand, PutKeyValueCommand, PutMapCommand, RemoveCommand,
    ReturnValue,
};
use crate::conflict::detection::detect_write_skew;
use crate::context::InvocationContext;
use crate::data_store::container::DataContainer;
use crate::data_store::versioned_value::VersionedValue;
use crate::distribution::Distribution;
use crate::errors::{Result, SeshatError};
use crate::interceptors::{Interceptor, Next};
use crate::key::CacheKey;
use crate::storage::{Storage, StorageMutation};
use crate::tx::{EntryVersionsMap, LocalTransaction, RemoteTransaction, StagedWrite};

/// Last stage of the pipeline: applies commands to the node's data.
///
/// Writes inside a transaction are recorded on the local transaction.
/// Non-transactional writes are applied to the keys this node owns, with the
/// versions their primary owner assigned. A
/// delivered prepare is validated against the container and its owned writes
/// are staged; the commit applies the staged writes, the rollback drops them.
/// Every applied change is passed to the [`Storage`] hook.
pub struct CallInterceptor {
    distribution: Arc<Distribution>,
    container: Arc<DataContainer>,
    storage: Arc<dyn Storage>,
}

impl CallInterceptor {
    pub fn new(
        distribution: Arc<Distribution>,
        container: Arc<DataContainer>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            distribution,
            container,
            storage,
        }
    }

    fn owns(&self, ctx: &InvocationContext, key: &CacheKey) -> Result<bool> {
        self.distribution.is_local_owner(ctx, key)
    }

    fn persist(&self, mutations: Vec<StorageMutation>) -> Result<()> {
        if mutations.is_empty() {
            return Ok(());
        }
        self.storage.apply_mutations(mutations)
    }

    /// Writes with the version the primary owner assigned, or the next local one.
    fn write_entry(
        &self,
        ctx: &InvocationContext,
        key: CacheKey,
        value: Arc<RecordBatch>,
    ) -> Option<VersionedValue> {
        match ctx.assigned_version(&key) {
            Some(version) => self.container.put_versioned(key, value, version),
            None => self.container.put(key, value),
        }
    }

    fn record(&self, local: &LocalTransaction, command: Command) -> Result<ReturnValue> {
        match command {
            Command::Put(put) => local.add_modification(Modification::Put {
                key: put.key,
                value: put.value,
            }),
            Command::Remove(remove) => {
                local.add_modification(Modification::Remove { key: remove.key })
            }
            Command::Clear(_) => local.add_modification(Modification::Clear),
            Command::PutAll(put_all) => {
                for (key, value) in put_all.entries {
                    local.add_modification(Modification::Put { key, value });
                }
            }
            other => {
                return Err(SeshatError::IllegalState(format!(
                    "{} cannot be recorded on {}",
                    other.name(),
                    local.gtx()
                )));
            }
        }
        Ok(None)
    }

    fn put(&self, ctx: &InvocationContext, put: PutKeyValueCommand) -> Result<ReturnValue> {
        if !self.owns(ctx, &put.key)? {
            return Ok(None);
        }
        let previous = self.write_entry(ctx, put.key.clone(), Arc::clone(&put.value));
        self.persist(vec![StorageMutation::Insert(
            put.key,
            RecordBatch::clone(&put.value),
        )])?;
        Ok(previous.map(VersionedValue::into_data))
    }

    fn remove(&self, ctx: &InvocationContext, remove: RemoveCommand) -> Result<ReturnValue> {
        if !self.owns(ctx, &remove.key)? {
            return Ok(None);
        }
        let previous = self.container.remove(&remove.key);
        if previous.is_some() {
            self.persist(vec![StorageMutation::Delete(remove.key)])?;
        }
        Ok(previous.map(VersionedValue::into_data))
    }

    fn put_all(&self, ctx: &InvocationContext, put_all: PutMapCommand) -> Result<ReturnValue> {
        let mut mutations = Vec::with_capacity(put_all.entries.len());
        for (key, value) in put_all.entries {
            if self.owns(ctx, &key)? {
                self.write_entry(ctx, key.clone(), Arc::clone(&value));
                mutations.push(StorageMutation::Insert(key, RecordBatch::clone(&value)));
            }
        }
        self.persist(mutations)?;
        Ok(None)
    }

    fn clear(&self) -> Result<ReturnValue> {
        let cleared = self.container.clear();
        trace!("Cleared {} entries", cleared);
        self.persist(vec![StorageMutation::Clear])?;
        Ok(None)
    }

    /// Checks the reads of a delivered prepare and stages its owned writes.
    fn validate(
        &self,
        ctx: &InvocationContext,
        remote: &RemoteTransaction,
        prepare: &PrepareCommand,
    ) -> Result<()> {
        let mut owned_seen = EntryVersionsMap::default();
        for (key, version) in &prepare.versions_seen {
            if self.owns(ctx, key)? {
                owned_seen.insert(key.clone(), *version);
            }
        }
        let conflicts = detect_write_skew(&owned_seen, &self.container);
        if !conflicts.is_empty() {
            return Err(SeshatError::ValidationFailure(format!(
                "{} read stale data: {:?}",
                prepare.gtx, conflicts
            )));
        }

        let mut staged = Vec::with_capacity(prepare.modifications.len());
        let mut versions = EntryVersionsMap::default();
        for modification in &prepare.modifications {
            match modification {
                Modification::Put { key, value } => {
                    if !self.owns(ctx, key)? {
                        continue;
                    }
                    let version = match versions.get(key) {
                        Some(version) => *version,
                        None => self.container.next_version(key),
                    };
                    versions.insert(key.clone(), version);
                    staged.push(StagedWrite::Put {
                        key: key.clone(),
                        value: Arc::clone(value),
                        version,
                    });
                }
                Modification::Remove { key } => {
                    if !self.owns(ctx, key)? {
                        continue;
                    }
                    versions.remove(key);
                    staged.push(StagedWrite::Remove { key: key.clone() });
                }
                Modification::Clear => {
                    versions.clear();
                    staged.push(StagedWrite::Clear);
                }
            }
        }
        debug!(
            "Staged {} writes of {} with {} versions",
            staged.len(),
            prepare.gtx,
            versions.len()
        );
        remote.stage(staged, versions);
        Ok(())
    }

    fn apply_staged(&self, remote: &RemoteTransaction) -> Result<ReturnValue> {
        let (writes, versions) = remote.take_staged();
        let mut mutations = Vec::with_capacity(writes.len());
        for write in writes {
            match write {
                StagedWrite::Put {
                    key,
                    value,
                    version,
                } => {
                    let version = versions.get(&key).copied().unwrap_or(version);
                    self.container
                        .put_versioned(key.clone(), Arc::clone(&value), version);
                    mutations.push(StorageMutation::Insert(key, RecordBatch::clone(&value)));
                }
                StagedWrite::Remove { key } => {
                    if self.container.remove(&key).is_some() {
                        mutations.push(StorageMutation::Delete(key));
                    }
                }
                StagedWrite::Clear => {
                    self.container.clear();
                    mutations.push(StorageMutation::Clear);
                }
            }
        }
        debug!(
            "Applied {} writes of {}",
            mutations.len(),
            remote.gtx()
        );
        self.persist(mutations)?;
        Ok(None)
    }
}

impl Interceptor for CallInterceptor {
    fn name(&self) -> &'static str {
        "call"
    }

    fn handle(
        &self,
        ctx: &mut InvocationContext,
        command: Command,
        _next: Next<'_>,
    ) -> Result<ReturnValue> {
        if command.is_write() {
            if let Some(local) = ctx.local_transaction() {
                return self.record(local, command);
            }
        }

        match command {
            Command::Put(put) => self.put(ctx, put),
            Command::Remove(remove) => self.remove(ctx, remove),
            Command::PutAll(put_all) => self.put_all(ctx, put_all),
            Command::Clear(_) => self.clear(),
            Command::Prepare(prepare) => match ctx.remote_transaction() {
                Some(remote) => {
                    self.validate(ctx, remote, &prepare)?;
                    Ok(None)
                }
                None => Ok(None),
            },
            Command::Commit(_) => match ctx.remote_transaction() {
                Some(remote) => self.apply_staged(remote),
                None => Ok(None),
            },
            Command::Rollback(rollback) => {
                if let Some(remote) = ctx.remote_transaction() {
                    let (discarded, _) = remote.take_staged();
                    trace!("Discarded {} writes of {}", discarded.len(), rollback.gtx);
                }
                Ok(None)
            }
            Command::LockControl(_) => Err(SeshatError::UnsupportedOperation(
                "Lock control is not supported under total order".to_string(),
            )),
        }
    }
}

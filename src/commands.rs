//! Commands flowing through the interceptor pipeline.

use arrow::record_batch::RecordBatch;
use std::sync::Arc;

use crate::key::CacheKey;
use crate::topology::NodeId;
use crate::tx::{EntryVersionsMap, GlobalTransaction};

/// Result of a command. Writes return the previous value when it is known.
pub type ReturnValue = Option<Arc<RecordBatch>>;

#[derive(Debug, Clone)]
pub struct PutKeyValueCommand {
    pub key: CacheKey,
    pub value: Arc<RecordBatch>,
}

#[derive(Debug, Clone)]
pub struct RemoveCommand {
    pub key: CacheKey,
}

#[derive(Debug, Clone, Default)]
pub struct ClearCommand;

#[derive(Debug, Clone)]
pub struct PutMapCommand {
    pub entries: Vec<(CacheKey, Arc<RecordBatch>)>,
}

impl PutMapCommand {
    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.entries.iter().map(|(key, _)| key)
    }
}

/// A write recorded by a transaction before it is ordered.
#[derive(Debug, Clone)]
pub enum Modification {
    Put {
        key: CacheKey,
        value: Arc<RecordBatch>,
    },
    Remove {
        key: CacheKey,
    },
    Clear,
}

impl Modification {
    pub fn key(&self) -> Option<&CacheKey> {
        match self {
            Modification::Put { key, .. } | Modification::Remove { key } => Some(key),
            Modification::Clear => None,
        }
    }
}

/// First phase of a transaction: its writes, broadcast in total order.
#[derive(Debug, Clone)]
pub struct PrepareCommand {
    pub gtx: GlobalTransaction,
    pub modifications: Vec<Modification>,
    pub affected_keys: Vec<CacheKey>,
    /// Versions the transaction observed on its reads.
    pub versions_seen: EntryVersionsMap,
    pub origin: NodeId,
}

impl PrepareCommand {
    pub fn is_origin(&self, node: NodeId) -> bool {
        self.origin == node
    }

    /// True when the transaction clears the cache and so touches every key.
    pub fn clears(&self) -> bool {
        self.modifications
            .iter()
            .any(|modification| matches!(modification, Modification::Clear))
    }
}

#[derive(Debug, Clone)]
pub struct CommitCommand {
    pub gtx: GlobalTransaction,
    /// Versions produced by the validated prepare, merged over all members.
    pub updated_versions: Option<EntryVersionsMap>,
}

#[derive(Debug, Clone)]
pub struct RollbackCommand {
    pub gtx: GlobalTransaction,
}

/// Explicit lock acquisition. Total order never locks, so this is rejected.
#[derive(Debug, Clone)]
pub struct LockControlCommand {
    pub gtx: GlobalTransaction,
    pub keys: Vec<CacheKey>,
}

#[derive(Debug, Clone)]
pub enum Command {
    Put(PutKeyValueCommand),
    Remove(RemoveCommand),
    Clear(ClearCommand),
    PutAll(PutMapCommand),
    Prepare(PrepareCommand),
    Commit(CommitCommand),
    Rollback(RollbackCommand),
    LockControl(LockControlCommand),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Put(_) => "Put",
            Command::Remove(_) => "Remove",
            Command::Clear(_) => "Clear",
            Command::PutAll(_) => "PutAll",
            Command::Prepare(_) => "Prepare",
            Command::Commit(_) => "Commit",
            Command::Rollback(_) => "Rollback",
            Command::LockControl(_) => "LockControl",
        }
    }

    /// Whether the command writes entries (as opposed to driving a transaction).
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Command::Put(_) | Command::Remove(_) | Command::Clear(_) | Command::PutAll(_)
        )
    }

    /// Keys written by a put, remove or put-all.
    pub fn written_keys(&self) -> Vec<CacheKey> {
        match self {
            Command::Put(put) => vec![put.key.clone()],
            Command::Remove(remove) => vec![remove.key.clone()],
            Command::PutAll(put_all) => put_all.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }
}

use ahash::{AHashMap, AHashSet};
use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::commands::Modification;
use crate::data_store::versioned_value::VersionedValue;
use crate::isolation::TransactionIsolation;
use crate::key::CacheKey;
use crate::tx::{EntryVersionsMap, GlobalTransaction};

#[derive(Default)]
struct LocalState {
    modifications: Vec<Modification>,
    affected_keys: Vec<CacheKey>,
    affected_set: AHashSet<CacheKey>,
    reads: AHashMap<CacheKey, Option<VersionedValue>>,
    versions_seen: EntryVersionsMap,
    updated_versions: EntryVersionsMap,
}

/// Transaction state on the node that started the transaction.
///
/// Holds the writes not yet globally ordered and, under repeatable read, the
/// first value and version observed for every key read.
pub struct LocalTransaction {
    gtx: GlobalTransaction,
    isolation: TransactionIsolation,
    state: Mutex<LocalState>,
}

impl LocalTransaction {
    pub fn new(gtx: GlobalTransaction, isolation: TransactionIsolation) -> Self {
        Self {
            gtx,
            isolation,
            state: Mutex::new(LocalState::default()),
        }
    }

    pub fn gtx(&self) -> GlobalTransaction {
        self.gtx
    }

    pub fn isolation(&self) -> TransactionIsolation {
        self.isolation
    }

    pub fn add_modification(&self, modification: Modification) {
        let mut state = self.state.lock();
        if let Some(key) = modification.key() {
            if state.affected_set.insert(key.clone()) {
                state.affected_keys.push(key.clone());
            }
        }
        state.modifications.push(modification);
    }

    pub fn has_modifications(&self) -> bool {
        !self.state.lock().modifications.is_empty()
    }

    pub fn modifications(&self) -> Vec<Modification> {
        self.state.lock().modifications.clone()
    }

    /// Keys written by the transaction, in first-write order.
    pub fn affected_keys(&self) -> Vec<CacheKey> {
        self.state.lock().affected_keys.clone()
    }

    /// The transaction's own latest write of `key`.
    ///
    /// `Some(None)` means the transaction removed the key (or cleared the cache
    /// after its last put); `None` means it never touched the key.
    pub fn lookup_modified(&self, key: &CacheKey) -> Option<Option<Arc<RecordBatch>>> {
        let state = self.state.lock();
        for modification in state.modifications.iter().rev() {
            match modification {
                Modification::Put { key: written, value } if written == key => {
                    return Some(Some(Arc::clone(value)));
                }
                Modification::Remove { key: written } if written == key => return Some(None),
                Modification::Clear => return Some(None),
                _ => {}
            }
        }
        None
    }

    /// Value pinned by an earlier read, under repeatable read.
    pub fn cached_read(&self, key: &CacheKey) -> Option<Option<VersionedValue>> {
        self.state.lock().reads.get(key).cloned()
    }

    /// Records a read. Only the first read of a key is kept.
    pub fn record_read(&self, key: CacheKey, value: Option<VersionedValue>) {
        if self.isolation != TransactionIsolation::RepeatableRead {
            return;
        }
        let mut state = self.state.lock();
        let version = value.as_ref().map(VersionedValue::version).unwrap_or(0);
        state.versions_seen.entry(key.clone()).or_insert(version);
        state.reads.entry(key).or_insert(value);
    }

    pub fn versions_seen(&self) -> EntryVersionsMap {
        self.state.lock().versions_seen.clone()
    }

    pub fn set_updated_versions(&self, versions: EntryVersionsMap) {
        self.state.lock().updated_versions = versions;
    }

    pub fn updated_versions(&self) -> EntryVersionsMap {
        self.state.lock().updated_versions.clone()
    }
}

impl std::fmt::Debug for LocalTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransaction")
            .field("gtx", &self.gtx)
            .field("isolation", &self.isolation)
            .finish_non_exhaustive()
    }
}

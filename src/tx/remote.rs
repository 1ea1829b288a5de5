use arrow::record_batch::RecordBatch;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Instant;

use crate::errors::SeshatError;
use crate::key::CacheKey;
use crate::tx::{EntryVersionsMap, GlobalTransaction};

/// Lifecycle of a transaction on a node processing its delivered prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPhase {
    AwaitingValidation,
    Validating,
    Prepared,
    /// Validation raised an error.
    Failed,
    Committed,
    RolledBack,
    Removed,
}

impl TxPhase {
    /// Whether the transaction can no longer be prepared.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TxPhase::Committed | TxPhase::RolledBack | TxPhase::Removed
        )
    }
}

/// A validated write waiting for the commit.
#[derive(Debug, Clone)]
pub enum StagedWrite {
    Put {
        key: CacheKey,
        value: Arc<RecordBatch>,
        version: u64,
    },
    Remove {
        key: CacheKey,
    },
    Clear,
}

pub(crate) struct RemoteState {
    pub(crate) phase: TxPhase,
    prepared: bool,
    pub(crate) marked_for_rollback: bool,
    failure: Option<SeshatError>,
    staged: Vec<StagedWrite>,
    pub(crate) updated_versions: EntryVersionsMap,
    registered_at: Instant,
    finished_at: Option<Instant>,
}

/// Transaction state on a node processing a delivered prepare.
///
/// The state is shared between the delivery thread validating the prepare
/// and the threads carrying the commit or rollback, which may arrive first
/// and block on [`RemoteTransaction::changed`] until validation settles.
pub struct RemoteTransaction {
    gtx: GlobalTransaction,
    pub(crate) state: Mutex<RemoteState>,
    pub(crate) changed: Condvar,
}

impl RemoteTransaction {
    pub fn new(gtx: GlobalTransaction) -> Self {
        Self {
            gtx,
            state: Mutex::new(RemoteState {
                phase: TxPhase::AwaitingValidation,
                prepared: false,
                marked_for_rollback: false,
                failure: None,
                staged: Vec::new(),
                updated_versions: EntryVersionsMap::default(),
                registered_at: Instant::now(),
                finished_at: None,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn gtx(&self) -> GlobalTransaction {
        self.gtx
    }

    pub fn phase(&self) -> TxPhase {
        self.state.lock().phase
    }

    /// Set once validation succeeds and never cleared.
    pub fn is_prepared(&self) -> bool {
        self.state.lock().prepared
    }

    pub fn is_marked_for_rollback(&self) -> bool {
        self.state.lock().marked_for_rollback
    }

    pub fn failure(&self) -> Option<SeshatError> {
        self.state.lock().failure.clone()
    }

    pub fn updated_versions(&self) -> EntryVersionsMap {
        self.state.lock().updated_versions.clone()
    }

    pub fn staged_writes(&self) -> usize {
        self.state.lock().staged.len()
    }

    /// Stages validated writes together with the versions they will carry.
    pub fn stage(&self, writes: Vec<StagedWrite>, versions: EntryVersionsMap) {
        let mut state = self.state.lock();
        state.staged.extend(writes);
        state.updated_versions.extend(versions);
    }

    /// Takes the staged writes and the versions to apply them with.
    pub fn take_staged(&self) -> (Vec<StagedWrite>, EntryVersionsMap) {
        let mut state = self.state.lock();
        (
            std::mem::take(&mut state.staged),
            state.updated_versions.clone(),
        )
    }

    /// Returns false when the transaction was finished while validating.
    pub(crate) fn mark_prepared(&self) -> bool {
        let mut state = self.state.lock();
        if state.phase != TxPhase::Validating {
            return false;
        }
        state.phase = TxPhase::Prepared;
        state.prepared = true;
        self.changed.notify_all();
        true
    }

    pub(crate) fn mark_failed(&self, error: SeshatError) {
        let mut state = self.state.lock();
        if state.phase != TxPhase::Validating {
            return;
        }
        state.phase = TxPhase::Failed;
        state.failure = Some(error);
        state.staged.clear();
        self.changed.notify_all();
    }

    pub(crate) fn mark_completed(&self, committed: bool) {
        let mut state = self.state.lock();
        if state.phase == TxPhase::Prepared {
            state.phase = if committed {
                TxPhase::Committed
            } else {
                TxPhase::RolledBack
            };
        }
        self.changed.notify_all();
    }

    /// Moves the transaction to [`TxPhase::Removed`]. Returns false if it
    /// already was.
    pub(crate) fn finish(&self) -> bool {
        let mut state = self.state.lock();
        if state.phase == TxPhase::Removed {
            return false;
        }
        state.phase = TxPhase::Removed;
        state.staged.clear();
        state.finished_at = Some(Instant::now());
        self.changed.notify_all();
        true
    }

    pub(crate) fn registered_before(&self, cutoff: Instant) -> bool {
        self.state.lock().registered_at <= cutoff
    }

    pub(crate) fn finished_before(&self, cutoff: Instant) -> bool {
        self.state
            .lock()
            .finished_at
            .is_some_and(|finished_at| finished_at <= cutoff)
    }
}

impl std::fmt::Debug for RemoteTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTransaction")
            .field("gtx", &self.gtx)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

use crossbeam_skiplist::SkipMap;
use log::{debug, trace, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::commands::{Command, PrepareCommand};
use crate::context::InvocationContext;
use crate::errors::{Result, SeshatError};
use crate::interceptors::Next;
use crate::key::CacheKey;
use crate::topology::NodeId;
use crate::totalorder::barrier::KeyBarrier;
use crate::tx::{EntryVersionsMap, GlobalTransaction, LocalTransaction, RemoteTransaction, TxPhase};

/// Registrations between two sweeps of finished remote transactions.
const CLEANUP_THRESHOLD: u64 = 256;

/// Default bound on how long a remote transaction may stay unfinished.
pub const DEFAULT_ABANDON_TIMEOUT: Duration = Duration::from_secs(30);

/// Tracks the transactions a node takes part in under total order.
///
/// A node plays two roles. As *originator* it holds the [`LocalTransaction`]
/// of every transaction started on it until the commit or rollback finishes.
/// As *member* it holds a [`RemoteTransaction`] for every transaction whose
/// prepare, commit or rollback reached it, including its own transactions,
/// which are validated like everybody else's when their prepare is delivered.
///
/// Finished remote transactions stay registered in the [`TxPhase::Removed`]
/// phase, so late commit, rollback or prepare traffic is recognised as
/// belonging to a finished transaction. They are swept once older than the
/// retention period.
///
/// A remote transaction whose commit or rollback never arrives (its
/// originator crashed, or the message was lost) is abandoned once it stays
/// unfinished longer than the abandonment timeout: its key claims are
/// released and it is finished without applying anything.
pub struct TotalOrderManager {
    local_node: NodeId,
    local_transactions: SkipMap<GlobalTransaction, Arc<LocalTransaction>>,
    remote_transactions: SkipMap<GlobalTransaction, Arc<RemoteTransaction>>,
    barrier: KeyBarrier,
    prepare_timeout: Duration,
    retention: Duration,
    abandon_timeout: Duration,
    cleanup_counter: AtomicU64,
}

impl TotalOrderManager {
    pub fn new(local_node: NodeId, prepare_timeout: Duration, retention: Duration) -> Self {
        Self {
            local_node,
            local_transactions: SkipMap::new(),
            remote_transactions: SkipMap::new(),
            barrier: KeyBarrier::new(DEFAULT_ABANDON_TIMEOUT),
            prepare_timeout,
            retention,
            abandon_timeout: DEFAULT_ABANDON_TIMEOUT,
            cleanup_counter: AtomicU64::new(0),
        }
    }

    /// Sets how long a remote transaction may stay unfinished before it is
    /// abandoned.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Bound measured from the registration of a remote
    ///   transaction, and from the moment a validated one claimed its keys.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use seshat::prelude::*;
    /// use std::time::Duration;
    ///
    /// let manager = TotalOrderManager::new(1, Duration::from_secs(10), Duration::from_secs(60))
    ///     .with_abandon_timeout(Duration::from_secs(45));
    /// assert_eq!(manager.abandon_timeout(), Duration::from_secs(45));
    /// ```
    pub fn with_abandon_timeout(mut self, timeout: Duration) -> Self {
        self.barrier = KeyBarrier::new(timeout);
        self.abandon_timeout = timeout;
        self
    }

    pub fn abandon_timeout(&self) -> Duration {
        self.abandon_timeout
    }

    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    /// Registers a transaction started on this node.
    ///
    /// # Errors
    ///
    /// [`SeshatError::IllegalState`] if `gtx` is already registered as local.
    pub fn add_local_transaction(
        &self,
        gtx: GlobalTransaction,
        local: Arc<LocalTransaction>,
    ) -> Result<()> {
        let entry = self.local_transactions.get_or_insert(gtx, Arc::clone(&local));
        if !Arc::ptr_eq(entry.value(), &local) {
            return Err(SeshatError::IllegalState(format!(
                "{} is already registered as a local transaction",
                gtx
            )));
        }
        debug!("Registered local transaction {}", gtx);
        Ok(())
    }

    pub fn local_transaction(&self, gtx: &GlobalTransaction) -> Option<Arc<LocalTransaction>> {
        self.local_transactions
            .get(gtx)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Returns the member-side state of `gtx`, creating it on first use.
    ///
    /// The prepare, the commit and the rollback of a transaction may reach a
    /// member in any order and on different threads; all of them share the
    /// state returned here. Concurrent first calls agree on one instance.
    ///
    /// # Arguments
    ///
    /// * `gtx` - The transaction, as named by its originator.
    ///
    /// # Returns
    ///
    /// The registered [`RemoteTransaction`]. A finished transaction is
    /// returned in the [`TxPhase::Removed`] phase until it is purged.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use seshat::prelude::*;
    /// use seshat::tx::TxPhase;
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// let manager = TotalOrderManager::new(1, Duration::from_secs(10), Duration::from_secs(60));
    /// let gtx = GlobalTransaction::new(2, 1);
    /// let remote = manager.remote_transaction(gtx);
    /// assert_eq!(remote.phase(), TxPhase::AwaitingValidation);
    /// assert!(Arc::ptr_eq(&remote, &manager.remote_transaction(gtx)));
    /// ```
    pub fn remote_transaction(&self, gtx: GlobalTransaction) -> Arc<RemoteTransaction> {
        if let Some(entry) = self.remote_transactions.get(&gtx) {
            return Arc::clone(entry.value());
        }

        let created = Arc::new(RemoteTransaction::new(gtx));
        let entry = self
            .remote_transactions
            .get_or_insert(gtx, Arc::clone(&created));
        let remote = Arc::clone(entry.value());
        if Arc::ptr_eq(&remote, &created) {
            trace!("Registered remote transaction {}", gtx);
            self.record_registration();
        }
        remote
    }

    /// Validates a delivered prepare.
    ///
    /// Does nothing when the transaction is no longer awaiting validation,
    /// and only finishes it when a rollback was requested before delivery.
    /// Otherwise waits until no earlier unfinished transaction holds one of
    /// its keys, runs the rest of the pipeline and marks the transaction
    /// prepared. Waiters are woken in every case.
    pub fn validate_transaction(
        &self,
        prepare: PrepareCommand,
        ctx: &mut InvocationContext,
        next: Next<'_>,
    ) -> Result<()> {
        let gtx = prepare.gtx;
        let remote = match ctx.remote_transaction() {
            Some(remote) => Arc::clone(remote),
            None => self.remote_transaction(gtx),
        };

        {
            let mut state = remote.state.lock();
            if state.phase != TxPhase::AwaitingValidation {
                warn!(
                    "Ignoring delivered prepare of {}, transaction is {:?}",
                    gtx, state.phase
                );
                return Ok(());
            }
            if state.marked_for_rollback {
                drop(state);
                debug!("{} was rolled back before its prepare was delivered", gtx);
                self.finish_transaction(gtx, true, Some(&remote));
                return Ok(());
            }
            state.phase = TxPhase::Validating;
        }

        let keys = claimed_keys(&prepare);
        let clears = prepare.clears();
        let deadline = Instant::now() + self.prepare_timeout;
        let result = self
            .barrier
            .acquire(gtx, &keys, clears, deadline)
            .and_then(|abandoned| {
                for holder in abandoned {
                    self.abandon(holder);
                }
                next.invoke(ctx, Command::Prepare(prepare))
            });

        match result {
            Ok(_) if remote.mark_prepared() => {
                debug!("Validated {}", gtx);
                Ok(())
            }
            Ok(_) => {
                debug!("{} finished while it was validated", gtx);
                self.barrier.release(gtx);
                Ok(())
            }
            Err(error) => {
                debug!("Validation of {} failed: {}", gtx, error);
                remote.mark_failed(error.clone());
                self.barrier.release(gtx);
                Err(error)
            }
        }
    }

    /// Blocks until the delivered prepare of `remote` has been validated.
    ///
    /// Returns `true` once prepared; for a commit the given versions are
    /// installed first. Returns `false` when validation failed (the
    /// transaction is finished), when the transaction already finished, or
    /// when a rollback overtakes a prepare not delivered yet, in which case
    /// the transaction is marked so the later delivery only finishes it.
    ///
    /// # Errors
    ///
    /// [`SeshatError::Timeout`] when validation does not settle within the
    /// prepare timeout.
    pub fn wait_for_tx_prepared(
        &self,
        remote: &Arc<RemoteTransaction>,
        is_commit: bool,
        versions: Option<&EntryVersionsMap>,
    ) -> Result<bool> {
        let gtx = remote.gtx();
        let deadline = Instant::now() + self.prepare_timeout;
        let mut state = remote.state.lock();
        let mut timed_out = false;
        loop {
            let phase = state.phase;
            match phase {
                TxPhase::Prepared => {
                    if is_commit {
                        if let Some(versions) = versions {
                            state.updated_versions.extend(
                                versions.iter().map(|(key, version)| (key.clone(), *version)),
                            );
                        }
                    }
                    return Ok(true);
                }
                TxPhase::Failed => {
                    drop(state);
                    self.finish_transaction(gtx, true, Some(remote));
                    return Ok(false);
                }
                TxPhase::AwaitingValidation if !is_commit => {
                    state.marked_for_rollback = true;
                    debug!("Rollback of {} arrived before its prepare", gtx);
                    return Ok(false);
                }
                phase if phase.is_finished() => return Ok(false),
                _ => {}
            }

            if timed_out {
                return Err(SeshatError::Timeout(format!(
                    "{} was not validated within {:?}",
                    gtx, self.prepare_timeout
                )));
            }
            timed_out = remote.changed.wait_until(&mut state, deadline).timed_out();
        }
    }

    /// Finishes `gtx` in one role. Finishing twice is a no-op.
    pub fn finish_transaction(
        &self,
        gtx: GlobalTransaction,
        was_remote: bool,
        remote: Option<&Arc<RemoteTransaction>>,
    ) {
        if !was_remote {
            if self.local_transactions.remove(&gtx).is_some() {
                debug!("Finished local transaction {}", gtx);
            }
            return;
        }

        let remote = remote.cloned().or_else(|| {
            self.remote_transactions
                .get(&gtx)
                .map(|entry| Arc::clone(entry.value()))
        });
        match remote {
            Some(remote) if remote.finish() => debug!("Finished remote transaction {}", gtx),
            Some(_) => trace!("Remote transaction {} already finished", gtx),
            None => trace!("No remote state to finish for {}", gtx),
        }
        self.barrier.release(gtx);
    }

    pub fn active_local_transactions(&self) -> usize {
        self.local_transactions.len()
    }

    /// Remote transactions not finished yet.
    pub fn active_remote_transactions(&self) -> usize {
        self.remote_transactions
            .iter()
            .filter(|entry| entry.value().phase() != TxPhase::Removed)
            .count()
    }

    /// Remote transactions still registered, finished ones included.
    pub fn tracked_remote_transactions(&self) -> usize {
        self.remote_transactions.len()
    }

    /// Transaction currently holding `key` between validation and finish.
    pub fn key_holder(&self, key: &CacheKey) -> Option<GlobalTransaction> {
        self.barrier.holder_of(key)
    }

    /// Drops finished remote transactions older than the retention period.
    pub fn purge_finished(&self) -> usize {
        let Some(cutoff) = Instant::now().checked_sub(self.retention) else {
            return 0;
        };
        let mut removed = 0;
        for entry in self.remote_transactions.iter() {
            if entry.value().finished_before(cutoff) && entry.remove() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Purged {} finished remote transactions", removed);
        }
        removed
    }

    /// Finishes remote transactions unfinished for longer than the
    /// abandonment timeout. Their staged writes are dropped.
    pub fn expire_abandoned(&self) -> usize {
        let Some(cutoff) = Instant::now().checked_sub(self.abandon_timeout) else {
            return 0;
        };
        let mut expired = 0;
        for entry in self.remote_transactions.iter() {
            let remote = entry.value();
            if !remote.phase().is_finished() && remote.registered_before(cutoff) {
                self.abandon(remote.gtx());
                expired += 1;
            }
        }
        expired
    }

    fn abandon(&self, gtx: GlobalTransaction) {
        warn!(
            "{} was neither committed nor rolled back within {:?}, abandoning it",
            gtx, self.abandon_timeout
        );
        self.finish_transaction(gtx, true, None);
    }

    fn record_registration(&self) {
        let count = self.cleanup_counter.fetch_add(1, Ordering::Relaxed);
        if count >= CLEANUP_THRESHOLD {
            self.cleanup_counter.store(0, Ordering::Relaxed);
            self.expire_abandoned();
            self.purge_finished();
        }
    }
}

/// Keys a prepare reads or writes.
fn claimed_keys(prepare: &PrepareCommand) -> Vec<CacheKey> {
    let mut keys = prepare.affected_keys.clone();
    for key in prepare.versions_seen.keys() {
        if !keys.contains(key) {
            keys.push(key.clone());
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::TransactionIsolation;

    fn manager(retention: Duration) -> TotalOrderManager {
        TotalOrderManager::new(1, Duration::from_millis(200), retention)
    }

    #[test]
    fn test_remote_transaction_is_created_once() {
        let manager = manager(Duration::from_secs(60));
        let gtx = GlobalTransaction::new(2, 1);
        let first = manager.remote_transaction(gtx);
        let second = manager.remote_transaction(gtx);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.active_remote_transactions(), 1);
    }

    #[test]
    fn test_finished_transactions_are_purged_after_retention() {
        let manager = manager(Duration::ZERO);
        let gtx = GlobalTransaction::new(2, 1);
        let remote = manager.remote_transaction(gtx);
        manager.finish_transaction(gtx, true, Some(&remote));
        assert_eq!(manager.active_remote_transactions(), 0);
        assert_eq!(manager.tracked_remote_transactions(), 1);
        assert_eq!(manager.purge_finished(), 1);
        assert_eq!(manager.tracked_remote_transactions(), 0);
    }

    #[test]
    fn test_unfinished_transactions_expire() {
        let manager = manager(Duration::from_secs(60)).with_abandon_timeout(Duration::from_millis(20));
        let stale = manager.remote_transaction(GlobalTransaction::new(2, 1));
        std::thread::sleep(Duration::from_millis(40));
        let fresh = manager.remote_transaction(GlobalTransaction::new(2, 2));

        assert_eq!(manager.expire_abandoned(), 1);
        assert_eq!(stale.phase(), TxPhase::Removed);
        assert_eq!(fresh.phase(), TxPhase::AwaitingValidation);
        assert_eq!(manager.active_remote_transactions(), 1);
    }

    #[test]
    fn test_finish_local_forgets_it() {
        let manager = manager(Duration::from_secs(60));
        let gtx = GlobalTransaction::new(1, 7);
        let local = Arc::new(LocalTransaction::new(gtx, TransactionIsolation::RepeatableRead));
        manager.add_local_transaction(gtx, local).unwrap();
        assert!(manager.local_transaction(&gtx).is_some());
        manager.finish_transaction(gtx, false, None);
        manager.finish_transaction(gtx, false, None);
        assert!(manager.local_transaction(&gtx).is_none());
    }
}

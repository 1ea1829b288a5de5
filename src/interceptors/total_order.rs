use log::{debug, trace};
use std::sync::Arc;

use crate::commands::{Command, ReturnValue};
use crate::context::InvocationContext;
use crate::errors::{Result, SeshatError};
use crate::interceptors::{Interceptor, Next};
use crate::totalorder::TotalOrderManager;
use crate::tx::{EntryVersionsMap, GlobalTransaction, RemoteTransaction};

/// Finishes a transaction when dropped, whatever path left the handler.
struct FinishGuard<'a> {
    manager: &'a TotalOrderManager,
    gtx: GlobalTransaction,
    remote: Option<Arc<RemoteTransaction>>,
    armed: bool,
}

impl<'a> FinishGuard<'a> {
    fn local(manager: &'a TotalOrderManager, gtx: GlobalTransaction) -> Self {
        Self {
            manager,
            gtx,
            remote: None,
            armed: true,
        }
    }

    fn remote(manager: &'a TotalOrderManager, remote: Arc<RemoteTransaction>) -> Self {
        Self {
            manager,
            gtx: remote.gtx(),
            remote: Some(remote),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.manager
                .finish_transaction(self.gtx, self.remote.is_some(), self.remote.as_ref());
        }
    }
}

/// Drives the total-order manager for transaction boundary commands.
///
/// | Command | Local origin | Remote origin |
/// |---|---|---|
/// | Prepare | register, forward | validate, return nothing |
/// | LockControl | rejected | rejected |
/// | Commit | forward, finish | wait until prepared, forward if prepared, finish |
/// | Rollback | forward, finish | wait until prepared, forward if prepared, finish |
///
/// A rollback that overtakes its prepare leaves the transaction registered
/// and marked, so the later delivery can finish it.
pub struct TotalOrderInterceptor {
    manager: Arc<TotalOrderManager>,
}

impl TotalOrderInterceptor {
    pub fn new(manager: Arc<TotalOrderManager>) -> Self {
        Self { manager }
    }

    fn remote_of(
        &self,
        ctx: &InvocationContext,
        gtx: GlobalTransaction,
    ) -> Arc<RemoteTransaction> {
        match ctx.remote_transaction() {
            Some(remote) => Arc::clone(remote),
            None => self.manager.remote_transaction(gtx),
        }
    }

    fn finish_remotely(
        &self,
        ctx: &mut InvocationContext,
        gtx: GlobalTransaction,
        versions: Option<EntryVersionsMap>,
        command: Command,
        next: Next<'_>,
    ) -> Result<ReturnValue> {
        let is_commit = matches!(command, Command::Commit(_));
        let remote = self.remote_of(ctx, gtx);
        let mut guard = FinishGuard::remote(&self.manager, Arc::clone(&remote));

        let prepared = self
            .manager
            .wait_for_tx_prepared(&remote, is_commit, versions.as_ref())?;

        if !prepared {
            if !is_commit && remote.is_marked_for_rollback() && !remote.phase().is_finished() {
                // The delivery of the prepare finishes it.
                guard.disarm();
            }
            trace!("{} not prepared here, skipping {}", gtx, command.name());
            return Ok(None);
        }

        let result = next.invoke(ctx, command)?;
        remote.mark_completed(is_commit);
        Ok(result)
    }
}

impl Interceptor for TotalOrderInterceptor {
    fn name(&self) -> &'static str {
        "total-order"
    }

    fn handle(
        &self,
        ctx: &mut InvocationContext,
        command: Command,
        next: Next<'_>,
    ) -> Result<ReturnValue> {
        match command {
            Command::LockControl(lock) => Err(SeshatError::UnsupportedOperation(format!(
                "Lock control is not supported under total order ({})",
                lock.gtx
            ))),
            Command::Prepare(prepare) if ctx.is_origin_local() => {
                let local = ctx.local_transaction().cloned().ok_or_else(|| {
                    SeshatError::IllegalState(format!(
                        "Prepare of {} issued outside of its transaction",
                        prepare.gtx
                    ))
                })?;
                self.manager.add_local_transaction(prepare.gtx, local)?;
                next.invoke(ctx, Command::Prepare(prepare))
            }
            Command::Prepare(prepare) => {
                self.manager.validate_transaction(prepare, ctx, next)?;
                Ok(None)
            }
            Command::Commit(commit) if ctx.is_origin_local() => {
                let _guard = FinishGuard::local(&self.manager, commit.gtx);
                debug!("Committing {}", commit.gtx);
                next.invoke(ctx, Command::Commit(commit))
            }
            Command::Rollback(rollback) if ctx.is_origin_local() => {
                let _guard = FinishGuard::local(&self.manager, rollback.gtx);
                debug!("Rolling back {}", rollback.gtx);
                next.invoke(ctx, Command::Rollback(rollback))
            }
            Command::Commit(commit) => {
                let gtx = commit.gtx;
                let versions = commit.updated_versions.clone();
                self.finish_remotely(ctx, gtx, versions, Command::Commit(commit), next)
            }
            Command::Rollback(rollback) => {
                let gtx = rollback.gtx;
                self.finish_remotely(ctx, gtx, None, Command::Rollback(rollback), next)
            }
            other => next.invoke(ctx, other),
        }
    }
}

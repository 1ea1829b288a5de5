use ahash::AHashMap;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::commands::{Command, PrepareCommand, PutMapCommand, ReturnValue};
use crate::context::InvocationContext;
use crate::data_store::container::DataContainer;
use crate::distribution::Distribution;
use crate::errors::{Result, SeshatError};
use crate::interceptors::{Interceptor, Next};
use crate::remote::{RemoteCommand, Response, ResponseValue, RpcManager};
use crate::topology::NodeId;
use crate::totalorder::{PrepareOutcome, TotalOrderBroadcast};
use crate::tx::{EntryVersionsMap, GlobalTransaction};

/// Attempts at delivering a commit to a member before giving up on it.
const COMMIT_ATTEMPTS: u32 = 3;
const COMMIT_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Sends locally issued commands to the members that must see them.
///
/// * A non-transactional write is ordered by the primary owner of its keys.
///   A node that is not the primary forwards the write there. The primary
///   assigns the versions under its write lock, replicates the write to the
///   backup owners and then applies it itself, so every owner stores the
///   same value under the same version. Clear goes to every member.
/// * Writes inside a transaction stay local until the prepare.
/// * A prepare is broadcast in total order; the replies of all members are
///   merged into the transaction's updated versions, and any failed reply
///   fails the prepare.
/// * Commit and rollback are sent to every member, this node included. Once
///   every member validated, the transaction is committed: members that do
///   not acknowledge the commit are retried and then only reported.
///
/// Commands received from other members are only passed on, except writes
/// forwarded to this node as their primary owner.
pub struct DistributionInterceptor {
    distribution: Arc<Distribution>,
    container: Arc<DataContainer>,
    rpc: Arc<dyn RpcManager>,
    broadcast: Arc<dyn TotalOrderBroadcast>,
    remote_timeout: Duration,
    /// Held by this node while it orders a write as primary owner.
    write_order: Mutex<()>,
}

impl DistributionInterceptor {
    pub fn new(
        distribution: Arc<Distribution>,
        container: Arc<DataContainer>,
        rpc: Arc<dyn RpcManager>,
        broadcast: Arc<dyn TotalOrderBroadcast>,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            distribution,
            container,
            rpc,
            broadcast,
            remote_timeout,
            write_order: Mutex::new(()),
        }
    }

    fn local(&self) -> NodeId {
        self.distribution.local_node()
    }

    /// Invokes `command` synchronously on `targets` and fails on the first
    /// unsuccessful response, in node order.
    fn invoke_checked(
        &self,
        targets: &[NodeId],
        command: RemoteCommand,
    ) -> Result<AHashMap<NodeId, ResponseValue>> {
        if targets.is_empty() {
            return Ok(AHashMap::new());
        }
        let responses = self
            .rpc
            .invoke_remotely(targets, command, &self.rpc.default_options())?;

        let mut ordered: Vec<(NodeId, Response)> = responses.into_iter().collect();
        ordered.sort_by_key(|(node, _)| *node);
        let mut values = AHashMap::with_capacity(ordered.len());
        for (node, response) in ordered {
            values.insert(node, response.into_result(node)?);
        }
        Ok(values)
    }

    /// Invokes `command` on `targets` and returns the nodes that did not
    /// answer successfully, with their errors.
    fn invoke_all(
        &self,
        targets: &[NodeId],
        command: RemoteCommand,
    ) -> Vec<(NodeId, SeshatError)> {
        if targets.is_empty() {
            return Vec::new();
        }
        let options = self.rpc.default_options();
        let responses = match self.rpc.invoke_remotely(targets, command, &options) {
            Ok(responses) => responses,
            Err(error) => return targets.iter().map(|node| (*node, error.clone())).collect(),
        };

        let mut failed: Vec<(NodeId, SeshatError)> = targets
            .iter()
            .filter_map(|node| match responses.get(node) {
                Some(Response::Success(_)) => None,
                Some(response) => response.clone().into_result(*node).err().map(|e| (*node, e)),
                None => Some((
                    *node,
                    SeshatError::IllegalState(format!("No response from node {}", node)),
                )),
            })
            .collect();
        failed.sort_by_key(|(node, _)| *node);
        failed
    }

    fn write(
        &self,
        ctx: &mut InvocationContext,
        command: Command,
        next: Next<'_>,
    ) -> Result<ReturnValue> {
        if let Command::Clear(_) = command {
            return self.clear_everywhere(ctx, command, next);
        }

        let local = self.local();
        let mut parts = self.split_by_primary(ctx, command)?;
        if parts.len() <= 1 {
            return match parts.pop() {
                Some((primary, command)) if primary == local => {
                    self.write_as_primary(ctx, command, next)
                }
                Some((primary, command)) => self.forward_to_primary(primary, command),
                None => Ok(None),
            };
        }

        // A put-all spanning several primaries is ordered by each of them.
        let mut local_part = None;
        for (primary, command) in parts {
            if primary == local {
                local_part = Some(command);
            } else {
                self.forward_to_primary(primary, command)?;
            }
        }
        if let Some(command) = local_part {
            self.write_as_primary(ctx, command, next)?;
        }
        Ok(None)
    }

    /// Splits a write into one command per primary owner of its keys.
    fn split_by_primary(
        &self,
        ctx: &InvocationContext,
        command: Command,
    ) -> Result<Vec<(NodeId, Command)>> {
        match command {
            Command::PutAll(put_all) => {
                let mut parts: Vec<(NodeId, PutMapCommand)> = Vec::new();
                for (key, value) in put_all.entries {
                    let primary = self.distribution.primary_owner(ctx, &key)?;
                    match parts.iter_mut().find(|(node, _)| *node == primary) {
                        Some((_, part)) => part.entries.push((key, value)),
                        None => parts.push((
                            primary,
                            PutMapCommand {
                                entries: vec![(key, value)],
                            },
                        )),
                    }
                }
                Ok(parts
                    .into_iter()
                    .map(|(primary, part)| (primary, Command::PutAll(part)))
                    .collect())
            }
            command => match command.written_keys().first() {
                Some(key) => Ok(vec![(self.distribution.primary_owner(ctx, key)?, command)]),
                None => Ok(Vec::new()),
            },
        }
    }

    fn forward_to_primary(&self, primary: NodeId, command: Command) -> Result<ReturnValue> {
        trace!("Forwarding {} to primary owner {}", command.name(), primary);
        let mut values = self.invoke_checked(&[primary], RemoteCommand::Write(command))?;
        match values.remove(&primary) {
            Some(ResponseValue::Value(value)) => Ok(value),
            _ => Ok(None),
        }
    }

    /// Orders a write whose keys this node is the primary owner of.
    ///
    /// The backups apply the write before this node does, so a write that
    /// fails to replicate is not applied here either.
    fn write_as_primary(
        &self,
        ctx: &mut InvocationContext,
        command: Command,
        next: Next<'_>,
    ) -> Result<ReturnValue> {
        let local = self.local();
        let _order = self.write_order.lock();

        let keys = command.written_keys();
        let mut versions = EntryVersionsMap::default();
        if !matches!(command, Command::Remove(_)) {
            for key in &keys {
                versions.insert(key.clone(), self.container.next_version(key));
            }
        }

        let mut backups: Vec<NodeId> = Vec::new();
        for key in &keys {
            for owner in self.distribution.owners(ctx, key)? {
                if owner != local && !backups.contains(&owner) {
                    backups.push(owner);
                }
            }
        }

        trace!("Replicating {} to {:?}", command.name(), backups);
        self.invoke_checked(
            &backups,
            RemoteCommand::Replicate {
                command: command.clone(),
                versions: versions.clone(),
            },
        )?;
        ctx.assign_versions(versions);
        next.invoke(ctx, command)
    }

    fn clear_everywhere(
        &self,
        ctx: &mut InvocationContext,
        command: Command,
        next: Next<'_>,
    ) -> Result<ReturnValue> {
        let local = self.local();
        let others: Vec<NodeId> = self
            .members()
            .into_iter()
            .filter(|node| *node != local)
            .collect();
        trace!("Sending {} to {:?}", command.name(), others);
        self.invoke_checked(
            &others,
            RemoteCommand::Replicate {
                command: command.clone(),
                versions: EntryVersionsMap::default(),
            },
        )?;
        next.invoke(ctx, command)
    }

    fn broadcast_prepare(&self, ctx: &InvocationContext, prepare: PrepareCommand) -> Result<()> {
        let gtx = prepare.gtx;
        let replies = self
            .broadcast
            .broadcast(prepare)?
            .collect(self.remote_timeout)?;

        let mut merged = EntryVersionsMap::default();
        for reply in replies {
            match reply.outcome {
                PrepareOutcome::Validated(versions) => {
                    // Owners may propose different versions; all apply the highest.
                    for (key, version) in versions {
                        let slot = merged.entry(key).or_insert(version);
                        *slot = (*slot).max(version);
                    }
                }
                PrepareOutcome::Failed(error) => {
                    debug!("Prepare of {} failed on node {}: {}", gtx, reply.node, error);
                    return Err(error);
                }
            }
        }
        debug!("Prepare of {} validated on every member", gtx);
        if let Some(local) = ctx.local_transaction() {
            local.set_updated_versions(merged);
        }
        Ok(())
    }

    /// Sends the commit of a transaction every member validated.
    ///
    /// The outcome is decided, so failures never turn into an error: a member
    /// that does not acknowledge is retried a few times and then reported.
    fn commit_everywhere(&self, gtx: GlobalTransaction, command: RemoteCommand) {
        let mut pending = self.members();
        for attempt in 1..=COMMIT_ATTEMPTS {
            let failed = self.invoke_all(&pending, command.clone());
            if failed.is_empty() {
                return;
            }
            if attempt == COMMIT_ATTEMPTS {
                for (node, error) in failed {
                    warn!(
                        "{} is committed but node {} did not acknowledge it: {}",
                        gtx, node, error
                    );
                }
                return;
            }
            debug!(
                "Retrying commit of {} on {:?} (attempt {})",
                gtx,
                failed.iter().map(|(node, _)| *node).collect::<Vec<_>>(),
                attempt + 1
            );
            pending = failed.into_iter().map(|(node, _)| node).collect();
            thread::sleep(COMMIT_RETRY_DELAY * attempt);
        }
    }

    fn rollback_everywhere(&self, gtx: GlobalTransaction, command: RemoteCommand) {
        for (node, error) in self.invoke_all(&self.members(), command) {
            warn!("Rollback of {} not acknowledged by node {}: {}", gtx, node, error);
        }
    }

    fn members(&self) -> Vec<NodeId> {
        self.distribution.snapshot().members.to_vec()
    }
}

impl Interceptor for DistributionInterceptor {
    fn name(&self) -> &'static str {
        "distribution"
    }

    fn handle(
        &self,
        ctx: &mut InvocationContext,
        command: Command,
        next: Next<'_>,
    ) -> Result<ReturnValue> {
        let non_tx_write = command.is_write() && !ctx.is_in_tx_scope() && !ctx.is_replica();
        if !ctx.is_origin_local() && !non_tx_write {
            return next.invoke(ctx, command);
        }

        match command {
            Command::Prepare(prepare) => {
                let result = next.invoke(ctx, Command::Prepare(prepare.clone()))?;
                self.broadcast_prepare(ctx, prepare)?;
                Ok(result)
            }
            Command::Commit(commit) => {
                self.commit_everywhere(commit.gtx, RemoteCommand::Commit(commit.clone()));
                next.invoke(ctx, Command::Commit(commit))
            }
            Command::Rollback(rollback) => {
                self.rollback_everywhere(rollback.gtx, RemoteCommand::Rollback(rollback.clone()));
                next.invoke(ctx, Command::Rollback(rollback))
            }
            command if non_tx_write => self.write(ctx, command, next),
            other => next.invoke(ctx, other),
        }
    }
}

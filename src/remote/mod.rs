//! Point-to-point remote invocation between members.

use ahash::{AHashMap, AHashSet};
use std::time::Duration;

use crate::commands::{Command, CommitCommand, ReturnValue, RollbackCommand};
use crate::data_store::versioned_value::VersionedValue;
use crate::errors::{Result, SeshatError};
use crate::key::CacheKey;
use crate::topology::NodeId;
use crate::tx::EntryVersionsMap;

pub mod in_process;

pub use in_process::{InProcessRpcManager, InProcessTransport};

/// A command executed on another member.
#[derive(Debug, Clone)]
pub enum RemoteCommand {
    /// Enumerate the keys of a group. Sent to the group's primary owner.
    GetKeysInGroup(String),
    /// Read the versioned entry of a key. Sent to an owner.
    Get(CacheKey),
    /// Order a non-transactional write. Sent to the primary owner of the
    /// written keys, which assigns their versions and replicates the write.
    Write(Command),
    /// Apply a write the sender already ordered, with the versions it assigned.
    /// Sent by a primary owner to the backup owners, and by the node clearing
    /// the cache to every other member.
    Replicate {
        command: Command,
        versions: EntryVersionsMap,
    },
    Commit(CommitCommand),
    Rollback(RollbackCommand),
}

#[derive(Debug, Clone)]
pub enum ResponseValue {
    None,
    Value(ReturnValue),
    Keys(AHashSet<CacheKey>),
    Entry(Option<VersionedValue>),
}

#[derive(Debug, Clone)]
pub enum Response {
    Success(ResponseValue),
    /// The target handled the command but refused it.
    Unsuccessful(String),
    /// The target raised an error, or could not be reached.
    Exception(SeshatError),
}

impl Response {
    /// Turns the response of `node` into a result.
    pub fn into_result(self, node: NodeId) -> Result<ResponseValue> {
        match self {
            Response::Success(value) => Ok(value),
            Response::Unsuccessful(reason) => Err(SeshatError::IllegalState(format!(
                "Node {} answered unsuccessfully: {}",
                node, reason
            ))),
            Response::Exception(error) => Err(error),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// Wait for every target, up to the timeout.
    Synchronous,
    /// Fire and forget. No responses are returned.
    Asynchronous,
}

#[derive(Debug, Clone, Copy)]
pub struct RpcOptions {
    pub timeout: Duration,
    pub mode: ResponseMode,
}

impl RpcOptions {
    pub fn synchronous(timeout: Duration) -> Self {
        Self {
            timeout,
            mode: ResponseMode::Synchronous,
        }
    }
}

/// Invokes commands on other members.
pub trait RpcManager: Send + Sync {
    fn local_node(&self) -> NodeId;

    /// Invokes `command` on every node of `targets`.
    ///
    /// In synchronous mode the returned map holds one response per target:
    /// failures of individual targets (unreachable, timed out, raised an
    /// error) are reported as [`Response::Exception`] rather than failing
    /// the whole call.
    fn invoke_remotely(
        &self,
        targets: &[NodeId],
        command: RemoteCommand,
        options: &RpcOptions,
    ) -> Result<AHashMap<NodeId, Response>>;

    /// Synchronous, bounded by the node's remote timeout, no retries.
    fn default_options(&self) -> RpcOptions;
}

/// Executes commands received from other members.
pub trait RemoteCommandHandler: Send + Sync {
    fn handle(&self, origin: NodeId, command: RemoteCommand) -> Result<Response>;
}

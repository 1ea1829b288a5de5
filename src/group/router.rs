use ahash::AHashSet;
use log::debug;
use std::sync::Arc;

use crate::errors::{Result, SeshatError};
use crate::key::CacheKey;
use crate::remote::{RemoteCommand, Response, ResponseValue, RpcManager};
use crate::topology::{NodeId, RoutingKey, Topology};

/// Routes group-level requests to the primary owner of a group.
pub struct GroupRouter {
    topology: Arc<Topology>,
    rpc: Arc<dyn RpcManager>,
}

impl GroupRouter {
    /// Creates a router for one node.
    ///
    /// # Arguments
    ///
    /// * `topology` - The membership view the primary owner of a group is
    ///   computed from.
    /// * `rpc` - The node's remote invoker, used to reach the primary owner.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use seshat::prelude::*;
    /// use seshat::remote::{InProcessRpcManager, InProcessTransport};
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// let topology = Arc::new(Topology::new(vec![1, 2, 3], 2));
    /// let transport = Arc::new(InProcessTransport::new());
    /// let rpc = Arc::new(InProcessRpcManager::new(1, transport, Duration::from_secs(5)));
    ///
    /// let router = GroupRouter::new(topology, rpc);
    /// let owner = router.primary_owner("orders").unwrap();
    /// assert!((1..=3).contains(&owner));
    /// ```
    pub fn new(topology: Arc<Topology>, rpc: Arc<dyn RpcManager>) -> Self {
        Self { topology, rpc }
    }

    /// Primary owner of `group` in the current topology.
    pub fn primary_owner(&self, group: &str) -> Result<NodeId> {
        self.topology
            .snapshot()
            .primary_owner(&RoutingKey::Group(group.to_string()))
    }

    /// Returns every key currently stored under `group`.
    ///
    /// The enumeration runs on the group's primary owner, which holds every
    /// key of the group. The call waits synchronously with the default RPC
    /// options and is not retried.
    ///
    /// # Errors
    ///
    /// A failed enumeration is always an error, never an empty set:
    /// * [`SeshatError::NodeUnreachable`] or [`SeshatError::Timeout`] when the
    ///   owner cannot answer,
    /// * [`SeshatError::IllegalState`] when the owner's response is missing or
    ///   unsuccessful,
    /// * any error raised by the owner while resolving its keys.
    pub fn get_keys_in_group(&self, group: &str) -> Result<AHashSet<CacheKey>> {
        let owner = self.primary_owner(group)?;
        debug!("Enumerating group '{}' on primary owner {}", group, owner);

        let mut responses = self.rpc.invoke_remotely(
            &[owner],
            RemoteCommand::GetKeysInGroup(group.to_string()),
            &self.rpc.default_options(),
        )?;

        match responses.remove(&owner) {
            Some(Response::Success(ResponseValue::Keys(keys))) => Ok(keys),
            Some(Response::Success(other)) => Err(SeshatError::IllegalState(format!(
                "Unexpected response {:?} to group enumeration from node {}",
                other, owner
            ))),
            Some(Response::Unsuccessful(reason)) => Err(SeshatError::IllegalState(format!(
                "Group enumeration on node {} was unsuccessful: {}",
                owner, reason
            ))),
            Some(Response::Exception(error)) => Err(error),
            None => Err(SeshatError::IllegalState(format!(
                "No response to group enumeration from node {}",
                owner
            ))),
        }
    }
}

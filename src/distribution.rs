use std::sync::Arc;

use crate::context::InvocationContext;
use crate::errors::Result;
use crate::group::GroupManager;
use crate::key::CacheKey;
use crate::topology::{NodeId, RoutingKey, Topology, TopologySnapshot};

/// Maps keys to their owners for one node.
///
/// With grouping enabled a key that resolves to a group is routed by the
/// group label; every other key is routed by its own hash.
pub struct Distribution {
    local: NodeId,
    topology: Arc<Topology>,
    groups: Arc<GroupManager>,
    groups_enabled: bool,
}

impl Distribution {
    pub fn new(
        local: NodeId,
        topology: Arc<Topology>,
        groups: Arc<GroupManager>,
        groups_enabled: bool,
    ) -> Self {
        Self {
            local,
            topology,
            groups,
            groups_enabled,
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.local
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        self.topology.snapshot()
    }

    pub fn routing_key(&self, key: &CacheKey) -> Result<RoutingKey> {
        if self.groups_enabled {
            if let Some(group) = self.groups.get_group(key)? {
                return Ok(RoutingKey::Group(group));
            }
        }
        Ok(RoutingKey::Key(key.routing_hash()))
    }

    /// Routing key of `key`, preferring the decision already made for this invocation.
    pub fn routing_key_in(&self, ctx: &InvocationContext, key: &CacheKey) -> Result<RoutingKey> {
        match ctx.routing_of(key) {
            Some(routing) => Ok(routing.clone()),
            None => self.routing_key(key),
        }
    }

    pub fn owners(&self, ctx: &InvocationContext, key: &CacheKey) -> Result<Vec<NodeId>> {
        Ok(self.snapshot().owners(&self.routing_key_in(ctx, key)?))
    }

    pub fn primary_owner(&self, ctx: &InvocationContext, key: &CacheKey) -> Result<NodeId> {
        self.snapshot().primary_owner(&self.routing_key_in(ctx, key)?)
    }

    pub fn is_local_owner(&self, ctx: &InvocationContext, key: &CacheKey) -> Result<bool> {
        Ok(self.owners(ctx, key)?.contains(&self.local))
    }
}

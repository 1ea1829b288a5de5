//! Cluster membership view and owner selection.
//!
//! Owners for a routing key are picked with HRW (Highest Random Weight)
//! hashing over the current member list, so the owner set of a key only
//! changes when one of its owners joins or leaves.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::errors::{Result, SeshatError};

/// Identifier of a cluster member.
pub type NodeId = u64;

/// The value owners are computed from.
///
/// Grouped keys route by their group label, every other key routes by its
/// own stable hash. All keys sharing a group therefore share owners.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoutingKey {
    Group(String),
    Key(u64),
}

impl RoutingKey {
    fn to_bytes(&self) -> Vec<u8> {
        match self {
            RoutingKey::Group(label) => {
                let mut bytes = Vec::with_capacity(label.len() + 1);
                bytes.push(b'g');
                bytes.extend_from_slice(label.as_bytes());
                bytes
            }
            RoutingKey::Key(hash) => {
                let mut bytes = Vec::with_capacity(9);
                bytes.push(b'k');
                bytes.extend_from_slice(&hash.to_le_bytes());
                bytes
            }
        }
    }
}

/// Orders `members` by their HRW weight for `routing`, heaviest first.
pub fn hrw_order(routing: &RoutingKey, members: &[NodeId]) -> Vec<NodeId> {
    let prefix = routing.to_bytes();
    let mut weights: Vec<(NodeId, u64)> = members
        .iter()
        .map(|node| {
            let mut hasher = blake3::Hasher::new();
            hasher.update(&prefix);
            hasher.update(&node.to_le_bytes());
            let hash = hasher.finalize();
            let mut head = [0u8; 8];
            head.copy_from_slice(&hash.as_bytes()[0..8]);
            (*node, u64::from_le_bytes(head))
        })
        .collect();

    weights.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    weights.into_iter().map(|(node, _)| node).collect()
}

/// An immutable view of the membership at one point in time.
#[derive(Debug, Clone)]
pub struct TopologySnapshot {
    pub topology_id: u64,
    pub members: Arc<Vec<NodeId>>,
    pub num_owners: usize,
}

impl TopologySnapshot {
    /// Owners of `routing`, primary first.
    pub fn owners(&self, routing: &RoutingKey) -> Vec<NodeId> {
        let mut ordered = hrw_order(routing, &self.members);
        ordered.truncate(self.num_owners);
        ordered
    }

    pub fn primary_owner(&self, routing: &RoutingKey) -> Result<NodeId> {
        hrw_order(routing, &self.members)
            .first()
            .copied()
            .ok_or_else(|| SeshatError::IllegalState("topology has no members".to_string()))
    }

    pub fn is_member(&self, node: NodeId) -> bool {
        self.members.contains(&node)
    }
}

/// Shared, updatable membership view.
///
/// Every node of an in-process cluster holds the same `Arc<Topology>`, which
/// stands in for the view agreed on by the group membership service.
#[derive(Debug)]
pub struct Topology {
    current: RwLock<TopologySnapshot>,
}

impl Topology {
    pub fn new(members: Vec<NodeId>, num_owners: usize) -> Self {
        Self {
            current: RwLock::new(TopologySnapshot {
                topology_id: 1,
                members: Arc::new(members),
                num_owners,
            }),
        }
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        self.current.read().clone()
    }

    /// Installs a new member list. Entries are not moved between owners.
    pub fn set_members(&self, members: Vec<NodeId>) {
        let mut current = self.current.write();
        current.topology_id += 1;
        current.members = Arc::new(members);
        log::debug!(
            "Installed topology {} with members {:?}",
            current.topology_id,
            current.members
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hrw_order_is_deterministic() {
        let members = vec![1, 2, 3, 4];
        let routing = RoutingKey::Group("groupA".to_string());
        assert_eq!(hrw_order(&routing, &members), hrw_order(&routing, &members));
        assert_eq!(hrw_order(&routing, &members).len(), 4);
    }

    #[test]
    fn test_owners_respect_num_owners() {
        let topology = Topology::new(vec![1, 2, 3, 4], 2);
        let snapshot = topology.snapshot();
        let owners = snapshot.owners(&RoutingKey::Key(42));
        assert_eq!(owners.len(), 2);
        assert_eq!(owners[0], snapshot.primary_owner(&RoutingKey::Key(42)).unwrap());
    }

    #[test]
    fn test_owners_capped_by_member_count() {
        let topology = Topology::new(vec![7], 3);
        assert_eq!(topology.snapshot().owners(&RoutingKey::Key(1)), vec![7]);
    }

    #[test]
    fn test_empty_topology_has_no_primary() {
        let topology = Topology::new(vec![], 2);
        assert!(matches!(
            topology.snapshot().primary_owner(&RoutingKey::Key(1)),
            Err(SeshatError::IllegalState(_))
        ));
    }

    #[test]
    fn test_set_members_bumps_topology_id() {
        let topology = Topology::new(vec![1], 1);
        topology.set_members(vec![1, 2]);
        let snapshot = topology.snapshot();
        assert_eq!(snapshot.topology_id, 2);
        assert!(snapshot.is_member(2));
    }
}

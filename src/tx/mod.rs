//! Transaction identity and per-role transaction state.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::key::CacheKey;
use crate::topology::NodeId;

pub mod local;
pub mod remote;

pub use local::LocalTransaction;
pub use remote::{RemoteTransaction, StagedWrite, TxPhase};

/// Key to version map produced by a validated prepare.
pub type EntryVersionsMap = AHashMap<CacheKey, u64>;

/// Cluster-wide unique transaction identifier.
///
/// Ordered by originating node first, then by the node-local counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GlobalTransaction {
    node: NodeId,
    id: u64,
}

impl GlobalTransaction {
    pub fn new(node: NodeId, id: u64) -> Self {
        Self { node, id }
    }

    /// The node the transaction was started on.
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Display for GlobalTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalTx:{}:{}", self.node, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(GlobalTransaction::new(2, 17).to_string(), "GlobalTx:2:17");
    }

    #[test]
    fn test_ordering_is_node_then_id() {
        let a = GlobalTransaction::new(1, 9);
        let b = GlobalTransaction::new(2, 0);
        let c = GlobalTransaction::new(2, 1);
        assert!(a < b && b < c);
    }
}

use ahash::AHashMap;
use std::sync::Arc;

use crate::key::CacheKey;
use crate::topology::{NodeId, RoutingKey};
use crate::tx::{EntryVersionsMap, LocalTransaction, RemoteTransaction};

/// Where an invocation entered the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Issued by a client of this node.
    Local,
    /// Received from a member, or delivered by total order on behalf of it.
    Remote(NodeId),
}

/// The transaction an invocation runs in, seen from this node's role.
#[derive(Debug, Clone)]
pub enum CacheTransaction {
    Local(Arc<LocalTransaction>),
    Remote(Arc<RemoteTransaction>),
}

/// Per-invocation state passed along the interceptor pipeline.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    origin: Origin,
    transaction: Option<CacheTransaction>,
    routing: AHashMap<CacheKey, RoutingKey>,
    /// Versions the primary owner assigned to a non-transactional write.
    versions: EntryVersionsMap,
    /// Set when a backup owner applies a write its primary already ordered.
    replica: bool,
}

impl InvocationContext {
    pub fn non_transactional() -> Self {
        Self {
            origin: Origin::Local,
            transaction: None,
            routing: AHashMap::new(),
            versions: EntryVersionsMap::default(),
            replica: false,
        }
    }

    pub fn local(transaction: Arc<LocalTransaction>) -> Self {
        Self {
            origin: Origin::Local,
            transaction: Some(CacheTransaction::Local(transaction)),
            routing: AHashMap::new(),
            versions: EntryVersionsMap::default(),
            replica: false,
        }
    }

    pub fn remote(origin: NodeId) -> Self {
        Self {
            origin: Origin::Remote(origin),
            transaction: None,
            routing: AHashMap::new(),
            versions: EntryVersionsMap::default(),
            replica: false,
        }
    }

    pub fn remote_transaction_of(origin: NodeId, transaction: Arc<RemoteTransaction>) -> Self {
        Self {
            origin: Origin::Remote(origin),
            transaction: Some(CacheTransaction::Remote(transaction)),
            routing: AHashMap::new(),
            versions: EntryVersionsMap::default(),
            replica: false,
        }
    }

    /// A backup owner applying a write ordered by `origin`, the primary.
    pub fn replica(origin: NodeId, versions: EntryVersionsMap) -> Self {
        Self {
            origin: Origin::Remote(origin),
            transaction: None,
            routing: AHashMap::new(),
            versions,
            replica: true,
        }
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn is_origin_local(&self) -> bool {
        self.origin == Origin::Local
    }

    pub fn is_in_tx_scope(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn local_transaction(&self) -> Option<&Arc<LocalTransaction>> {
        match &self.transaction {
            Some(CacheTransaction::Local(tx)) => Some(tx),
            _ => None,
        }
    }

    pub fn remote_transaction(&self) -> Option<&Arc<RemoteTransaction>> {
        match &self.transaction {
            Some(CacheTransaction::Remote(tx)) => Some(tx),
            _ => None,
        }
    }

    /// Records the routing decision for `key`.
    pub fn route(&mut self, key: CacheKey, routing: RoutingKey) {
        self.routing.insert(key, routing);
    }

    pub fn routing_of(&self, key: &CacheKey) -> Option<&RoutingKey> {
        self.routing.get(key)
    }

    pub fn is_replica(&self) -> bool {
        self.replica
    }

    pub fn assign_versions(&mut self, versions: EntryVersionsMap) {
        self.versions.extend(versions);
    }

    pub fn assigned_version(&self, key: &CacheKey) -> Option<u64> {
        self.versions.get(key).copied()
    }
}

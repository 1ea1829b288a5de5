//! A whole cluster embedded in one process.

use log::debug;
use std::sync::{Arc, Weak};

use crate::config::SeshatConfig;
use crate::errors::Result;
use crate::group::Grouper;
use crate::key::CacheKey;
use crate::remote::{InProcessRpcManager, InProcessTransport};
use crate::seshat::{NodeServices, Seshat};
use crate::storage::{NoopStorage, Storage};
use crate::topology::{NodeId, Topology};
use crate::totalorder::TotalOrderSequencer;

/// `size` nodes with ids `1..=size`, sharing one topology, one in-process
/// transport and one total-order sequencer.
pub struct LocalCluster {
    topology: Arc<Topology>,
    transport: Arc<InProcessTransport>,
    sequencer: Arc<TotalOrderSequencer>,
    nodes: Vec<Arc<Seshat>>,
}

impl LocalCluster {
    /// Starts a cluster whose nodes keep no storage.
    ///
    /// Every node gets a copy of `template` with its own `node_id`, and the
    /// same groupers.
    pub fn start(
        size: usize,
        template: SeshatConfig,
        groupers: Vec<Arc<dyn Grouper>>,
    ) -> Result<Self> {
        Self::start_with_storage(size, template, groupers, |_| Arc::new(NoopStorage))
    }

    pub fn start_with_storage<F>(
        size: usize,
        template: SeshatConfig,
        groupers: Vec<Arc<dyn Grouper>>,
        storage: F,
    ) -> Result<Self>
    where
        F: Fn(NodeId) -> Arc<dyn Storage>,
    {
        let ids: Vec<NodeId> = (1..=size as NodeId).collect();
        let topology = Arc::new(Topology::new(ids.clone(), template.num_owners));
        let transport = Arc::new(InProcessTransport::new());
        let sequencer = Arc::new(TotalOrderSequencer::new());

        let mut nodes = Vec::with_capacity(size);
        for id in ids {
            let config = SeshatConfig {
                node_id: id,
                ..template.clone()
            };
            let rpc = Arc::new(InProcessRpcManager::new(
                id,
                Arc::clone(&transport),
                config.remote_timeout(),
            ));
            let services = NodeServices {
                topology: Arc::clone(&topology),
                rpc,
                broadcast: Arc::clone(&sequencer) as _,
            };
            let node = Seshat::new(config, services, storage(id), groupers.clone())?;

            let handler: Weak<Seshat> = Arc::downgrade(&node);
            transport.register(id, handler.clone());
            sequencer.join(id, handler)?;
            nodes.push(node);
        }
        debug!("Started in-process cluster of {} nodes", nodes.len());

        Ok(Self {
            topology,
            transport,
            sequencer,
            nodes,
        })
    }

    pub fn node(&self, id: NodeId) -> Option<&Arc<Seshat>> {
        self.nodes.iter().find(|node| node.node_id() == id)
    }

    pub fn nodes(&self) -> &[Arc<Seshat>] {
        &self.nodes
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn transport(&self) -> &Arc<InProcessTransport> {
        &self.transport
    }

    pub fn sequencer(&self) -> &Arc<TotalOrderSequencer> {
        &self.sequencer
    }

    /// Partitions `node` from the rest of the cluster: remote calls to and
    /// from it fail, and it takes no part in total-order delivery.
    pub fn disconnect(&self, node: NodeId) {
        self.transport.disconnect(node);
        self.sequencer.disconnect(node);
    }

    pub fn reconnect(&self, node: NodeId) {
        self.sequencer.reconnect(node);
        self.transport.reconnect(node);
    }

    /// Owners of `key`, primary first.
    pub fn owners_of(&self, key: &CacheKey) -> Result<Vec<NodeId>> {
        let snapshot = self.topology.snapshot();
        match self.nodes.first() {
            Some(node) => Ok(snapshot.owners(&node.distribution().routing_key(key)?)),
            None => Ok(Vec::new()),
        }
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        for node in &self.nodes {
            self.sequencer.leave(node.node_id());
            self.transport.unregister(node.node_id());
        }
    }
}

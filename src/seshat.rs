use ahash::AHashSet;
use arrow::record_batch::RecordBatch;
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::commands::{
    ClearCommand, Command, PrepareCommand, PutKeyValueCommand, PutMapCommand, RemoveCommand,
    ReturnValue,
};
use crate::config::SeshatConfig;
use crate::context::InvocationContext;
use crate::data_store::container::DataContainer;
use crate::data_store::versioned_value::VersionedValue;
use crate::distribution::Distribution;
use crate::errors::{Result, SeshatError};
use crate::group::{GetKeysInGroupCommand, GroupManager, GroupRouter, Grouper};
use crate::interceptors::{
    CallInterceptor, DistributionInterceptor, GroupingInterceptor, InterceptorChain,
    TotalOrderInterceptor,
};
use crate::key::CacheKey;
use crate::remote::{RemoteCommand, RemoteCommandHandler, Response, ResponseValue, RpcManager};
use crate::storage::Storage;
use crate::topology::{NodeId, Topology};
use crate::totalorder::{DeliveryHandler, PrepareOutcome, TotalOrderBroadcast, TotalOrderManager};
use crate::transaction::Transaction;
use crate::tx::{GlobalTransaction, LocalTransaction};

/// Seshat Prelude
pub mod prelude {
    pub use crate::cluster::*;
    pub use crate::commands::*;
    pub use crate::config::*;
    pub use crate::data_store::container::*;
    pub use crate::data_store::versioned_value::*;
    pub use crate::errors::*;
    pub use crate::group::*;
    pub use crate::isolation::*;
    pub use crate::key::*;
    pub use crate::storage::*;
    pub use crate::transaction::*;

    pub use crate::seshat::{NodeServices, Seshat};
    pub use crate::topology::{NodeId, RoutingKey, Topology};
    pub use crate::totalorder::TotalOrderManager;
    pub use crate::tx::GlobalTransaction;
}

/// Cluster services a node is wired to.
#[derive(Clone)]
pub struct NodeServices {
    pub topology: Arc<Topology>,
    pub rpc: Arc<dyn RpcManager>,
    pub broadcast: Arc<dyn TotalOrderBroadcast>,
}

/// One node of the data grid.
///
/// Every operation enters the node's interceptor pipeline:
///
/// ```text
/// grouping (when enabled) -> total-order -> distribution -> call
/// ```
///
/// The node also serves commands sent by other members
/// ([`RemoteCommandHandler`]) and prepares delivered by total order
/// ([`DeliveryHandler`]).
pub struct Seshat {
    config: SeshatConfig,
    container: Arc<DataContainer>,
    groups: Arc<GroupManager>,
    distribution: Arc<Distribution>,
    manager: Arc<TotalOrderManager>,
    router: GroupRouter,
    rpc: Arc<dyn RpcManager>,
    pipeline: InterceptorChain,
    transaction_counter: AtomicU64,
}

impl Seshat {
    /// Creates a node.
    ///
    /// # Errors
    ///
    /// [`SeshatError::Configuration`] when the configuration is invalid or the
    /// node is not a member of the topology.
    pub fn new(
        config: SeshatConfig,
        services: NodeServices,
        storage: Arc<dyn Storage>,
        groupers: Vec<Arc<dyn Grouper>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let node_id = config.node_id;
        if !services.topology.snapshot().is_member(node_id) {
            return Err(SeshatError::Configuration(format!(
                "Node {} is not a member of the topology",
                node_id
            )));
        }

        let container = Arc::new(DataContainer::new());
        let groups = Arc::new(GroupManager::new(groupers));
        let distribution = Arc::new(Distribution::new(
            node_id,
            Arc::clone(&services.topology),
            Arc::clone(&groups),
            config.groups.enabled,
        ));
        let manager = Arc::new(
            TotalOrderManager::new(
                node_id,
                config.prepare_timeout(),
                config.finished_tx_retention(),
            )
            .with_abandon_timeout(config.abandoned_tx_timeout()),
        );

        let mut pipeline = InterceptorChain::new();
        if config.groups.enabled {
            pipeline.link(Arc::new(GroupingInterceptor::new(Arc::clone(&groups))));
        }
        pipeline.link(Arc::new(TotalOrderInterceptor::new(Arc::clone(&manager))));
        pipeline.link(Arc::new(DistributionInterceptor::new(
            Arc::clone(&distribution),
            Arc::clone(&container),
            Arc::clone(&services.rpc),
            Arc::clone(&services.broadcast),
            config.remote_timeout(),
        )));
        pipeline.link(Arc::new(CallInterceptor::new(
            Arc::clone(&distribution),
            Arc::clone(&container),
            storage,
        )));
        debug!(
            "Node {} started with interceptors {:?}",
            node_id,
            pipeline.names()
        );

        Ok(Arc::new(Self {
            router: GroupRouter::new(Arc::clone(&services.topology), Arc::clone(&services.rpc)),
            rpc: services.rpc,
            config,
            container,
            groups,
            distribution,
            manager,
            pipeline,
            transaction_counter: AtomicU64::new(0),
        }))
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn config(&self) -> &SeshatConfig {
        &self.config
    }

    /// Entries stored on this node.
    pub fn container(&self) -> &DataContainer {
        &self.container
    }

    pub fn manager(&self) -> &TotalOrderManager {
        &self.manager
    }

    pub fn groups(&self) -> &GroupManager {
        &self.groups
    }

    pub fn distribution(&self) -> &Distribution {
        &self.distribution
    }

    pub fn interceptors(&self) -> Vec<&'static str> {
        self.pipeline.names()
    }

    /// Runs `command` through the node's pipeline.
    pub fn invoke(&self, ctx: &mut InvocationContext, command: Command) -> Result<ReturnValue> {
        self.pipeline.invoke(ctx, command)
    }

    fn invoke_non_transactional(&self, command: Command) -> Result<ReturnValue> {
        let mut ctx = InvocationContext::non_transactional();
        self.invoke(&mut ctx, command)
    }

    /// Writes `value` under `key` on every owner, outside of any transaction.
    ///
    /// The write is ordered by the primary owner of `key`: it assigns the
    /// new version, replicates the write to the backup owners and applies it
    /// last, so all owners hold the same value under the same version.
    ///
    /// # Arguments
    ///
    /// * `key` - Any key type convertible into a [`CacheKey`].
    /// * `value` - The record batch to store.
    ///
    /// # Returns
    ///
    /// The value the primary owner held before the write, if any.
    ///
    /// # Errors
    ///
    /// [`SeshatError::NodeUnreachable`] or [`SeshatError::Timeout`] when an
    /// owner cannot be reached; [`SeshatError::Configuration`] when the group
    /// of `key` cannot be resolved.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use seshat::prelude::*;
    /// use arrow::array::Int64Array;
    /// use arrow::datatypes::{DataType, Field, Schema};
    /// use arrow::record_batch::RecordBatch;
    /// use std::sync::Arc;
    ///
    /// let schema = Arc::new(Schema::new(vec![Field::new("stock", DataType::Int64, false)]));
    /// let batch = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![12]))]).unwrap();
    ///
    /// let cluster = LocalCluster::start(3, SeshatConfig::new(0), Vec::new()).unwrap();
    /// let node = cluster.node(2).unwrap();
    /// assert!(node.put("sku:42", batch.clone()).unwrap().is_none());
    /// assert_eq!(node.put("sku:42", batch).unwrap().unwrap().num_rows(), 1);
    /// ```
    pub fn put(
        &self,
        key: impl Into<CacheKey>,
        value: RecordBatch,
    ) -> Result<Option<Arc<RecordBatch>>> {
        self.invoke_non_transactional(Command::Put(PutKeyValueCommand {
            key: key.into(),
            value: Arc::new(value),
        }))
    }

    pub fn put_all(&self, entries: Vec<(CacheKey, RecordBatch)>) -> Result<()> {
        let entries = entries
            .into_iter()
            .map(|(key, value)| (key, Arc::new(value)))
            .collect();
        self.invoke_non_transactional(Command::PutAll(PutMapCommand { entries }))?;
        Ok(())
    }

    pub fn remove(&self, key: impl Into<CacheKey>) -> Result<Option<Arc<RecordBatch>>> {
        self.invoke_non_transactional(Command::Remove(RemoveCommand { key: key.into() }))
    }

    /// Removes every entry on every member.
    pub fn clear(&self) -> Result<()> {
        self.invoke_non_transactional(Command::Clear(ClearCommand))?;
        Ok(())
    }

    pub fn get(&self, key: impl Into<CacheKey>) -> Result<Option<Arc<RecordBatch>>> {
        Ok(self
            .get_versioned(&key.into())?
            .map(VersionedValue::into_data))
    }

    /// Reads `key` from this node when it is an owner, otherwise from the
    /// primary owner.
    pub fn get_versioned(&self, key: &CacheKey) -> Result<Option<VersionedValue>> {
        let ctx = InvocationContext::non_transactional();
        let owners = self.distribution.owners(&ctx, key)?;
        if owners.contains(&self.node_id()) {
            return Ok(self.container.get(key));
        }
        let primary = *owners.first().ok_or_else(|| {
            SeshatError::IllegalState(format!("No owner for key {:?}", key))
        })?;

        let mut responses = self.rpc.invoke_remotely(
            &[primary],
            RemoteCommand::Get(key.clone()),
            &self.rpc.default_options(),
        )?;
        let response = responses.remove(&primary).ok_or_else(|| {
            SeshatError::IllegalState(format!("No response to read from node {}", primary))
        })?;
        match response.into_result(primary)? {
            ResponseValue::Entry(entry) => Ok(entry),
            other => Err(SeshatError::IllegalState(format!(
                "Unexpected response {:?} to read from node {}",
                other, primary
            ))),
        }
    }

    /// Starts a transaction on this node.
    pub fn begin(self: &Arc<Self>) -> Transaction {
        let id = self.transaction_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let gtx = GlobalTransaction::new(self.node_id(), id);
        let local = Arc::new(LocalTransaction::new(gtx, self.config.isolation));
        debug!("Began {}", gtx);
        Transaction::new(Arc::clone(self), local)
    }

    /// Resolves the group of `key` with this node's groupers.
    pub fn get_group(&self, key: &CacheKey) -> Result<Option<String>> {
        self.groups.get_group(key)
    }

    /// Returns every key stored under `group`, as seen by the group's primary owner.
    ///
    /// # Errors
    ///
    /// [`SeshatError::IllegalState`] when grouping is disabled; otherwise the
    /// errors of [`GroupRouter::get_keys_in_group`].
    pub fn get_group_keys(&self, group: &str) -> Result<AHashSet<CacheKey>> {
        if !self.config.groups.enabled {
            return Err(SeshatError::IllegalState(
                "Grouping is not enabled on this node".to_string(),
            ));
        }
        self.router.get_keys_in_group(group)
    }

    /// Primary owner of `group`.
    pub fn group_owner(&self, group: &str) -> Result<NodeId> {
        self.router.primary_owner(group)
    }
}

impl RemoteCommandHandler for Seshat {
    fn handle(&self, origin: NodeId, command: RemoteCommand) -> Result<Response> {
        match command {
            RemoteCommand::GetKeysInGroup(group) => {
                if !self.config.groups.enabled {
                    return Ok(Response::Unsuccessful(format!(
                        "Grouping is not enabled on node {}",
                        self.node_id()
                    )));
                }
                let keys = GetKeysInGroupCommand::new(group).perform(&self.container, &self.groups)?;
                Ok(Response::Success(ResponseValue::Keys(keys)))
            }
            RemoteCommand::Get(key) => Ok(Response::Success(ResponseValue::Entry(
                self.container.get(&key),
            ))),
            RemoteCommand::Write(command) => {
                if !command.is_write() {
                    return Ok(Response::Unsuccessful(format!(
                        "{} is not a write",
                        command.name()
                    )));
                }
                let mut ctx = InvocationContext::remote(origin);
                let value = self.invoke(&mut ctx, command)?;
                Ok(Response::Success(ResponseValue::Value(value)))
            }
            RemoteCommand::Replicate { command, versions } => {
                if !command.is_write() {
                    return Ok(Response::Unsuccessful(format!(
                        "{} is not a write",
                        command.name()
                    )));
                }
                let mut ctx = InvocationContext::replica(origin, versions);
                let value = self.invoke(&mut ctx, command)?;
                Ok(Response::Success(ResponseValue::Value(value)))
            }
            RemoteCommand::Commit(commit) => {
                let remote = self.manager.remote_transaction(commit.gtx);
                let mut ctx = InvocationContext::remote_transaction_of(origin, remote);
                self.invoke(&mut ctx, Command::Commit(commit))?;
                Ok(Response::Success(ResponseValue::None))
            }
            RemoteCommand::Rollback(rollback) => {
                let remote = self.manager.remote_transaction(rollback.gtx);
                let mut ctx = InvocationContext::remote_transaction_of(origin, remote);
                self.invoke(&mut ctx, Command::Rollback(rollback))?;
                Ok(Response::Success(ResponseValue::None))
            }
        }
    }
}

impl DeliveryHandler for Seshat {
    fn deliver(&self, prepare: PrepareCommand) -> PrepareOutcome {
        let gtx = prepare.gtx;
        let remote = self.manager.remote_transaction(gtx);
        let mut ctx = InvocationContext::remote_transaction_of(prepare.origin, Arc::clone(&remote));
        match self.invoke(&mut ctx, Command::Prepare(prepare)) {
            Ok(_) if remote.is_prepared() => PrepareOutcome::Validated(remote.updated_versions()),
            Ok(_) => {
                warn!(
                    "{} finished on node {} before its prepare was validated",
                    gtx,
                    self.node_id()
                );
                PrepareOutcome::Failed(SeshatError::IllegalState(format!(
                    "{} finished on node {} before its prepare was validated",
                    gtx,
                    self.node_id()
                )))
            }
            Err(error) => PrepareOutcome::Failed(error),
        }
    }
}

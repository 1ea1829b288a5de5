pub mod cluster;
pub mod commands;
pub mod config;
pub mod conflict;
pub mod context;
pub mod data_store;
pub mod distribution;
pub mod errors;
pub mod group;
pub mod interceptors;
pub mod isolation;
pub mod key;
pub mod remote;
pub mod seshat;
pub mod storage;
pub mod topology;
pub mod totalorder;
pub mod transaction;
pub mod tx;

// Re-export key types and structs for easier access
pub use cluster::LocalCluster;
pub use config::{GroupsConfig, SeshatConfig};
pub use data_store::container::DataContainer;
pub use data_store::versioned_value::VersionedValue;
pub use errors::{Result, SeshatError};
pub use group::{GroupManager, GroupRouter, Grouper, grouper_for};
pub use isolation::TransactionIsolation;
pub use key::{CacheKey, GridKey, GroupAccessor};
pub use seshat::{NodeServices, Seshat, prelude};
pub use storage::{Storage, StorageMutation};
pub use topology::{NodeId, RoutingKey, Topology};
pub use totalorder::TotalOrderManager;
pub use transaction::Transaction;
pub use tx::GlobalTransaction;

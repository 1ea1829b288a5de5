//! Node configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{Result, SeshatError};
use crate::isolation::TransactionIsolation;
use crate::topology::NodeId;

/// Configuration of one grid node.
///
/// Groupers and the storage hook are code, not data, and are passed to
/// [`Seshat::new`](crate::Seshat::new) directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeshatConfig {
    /// Identifier of this node within the cluster.
    pub node_id: NodeId,

    /// Number of owners of every key (or group).
    #[serde(default = "default_num_owners")]
    pub num_owners: usize,

    #[serde(default)]
    pub groups: GroupsConfig,

    /// Isolation of transactions started on this node.
    #[serde(default)]
    pub isolation: TransactionIsolation,

    /// Bound on every wait for a delivered prepare to be validated.
    #[serde(default = "default_prepare_timeout")]
    pub prepare_timeout_ms: u64,

    /// Bound on every remote call and on collecting prepare replies.
    #[serde(default = "default_remote_timeout")]
    pub remote_timeout_ms: u64,

    /// How long finished remote transactions are remembered.
    #[serde(default = "default_finished_tx_retention")]
    pub finished_tx_retention_ms: u64,

    /// How long a remote transaction may stay unfinished before its key
    /// claims are released and it is abandoned.
    #[serde(default = "default_abandoned_tx_timeout")]
    pub abandoned_tx_timeout_ms: u64,
}

/// Grouping configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupsConfig {
    /// When disabled, group declarations and groupers are ignored for routing
    /// and group enumeration is refused.
    #[serde(default)]
    pub enabled: bool,
}

fn default_num_owners() -> usize {
    2
}
fn default_prepare_timeout() -> u64 {
    10_000
}
fn default_remote_timeout() -> u64 {
    15_000
}
fn default_finished_tx_retention() -> u64 {
    60_000
}
fn default_abandoned_tx_timeout() -> u64 {
    30_000
}

impl SeshatConfig {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            num_owners: default_num_owners(),
            groups: GroupsConfig::default(),
            isolation: TransactionIsolation::default(),
            prepare_timeout_ms: default_prepare_timeout(),
            remote_timeout_ms: default_remote_timeout(),
            finished_tx_retention_ms: default_finished_tx_retention(),
            abandoned_tx_timeout_ms: default_abandoned_tx_timeout(),
        }
    }

    pub fn with_groups_enabled(mut self, enabled: bool) -> Self {
        self.groups.enabled = enabled;
        self
    }

    pub fn with_num_owners(mut self, num_owners: usize) -> Self {
        self.num_owners = num_owners;
        self
    }

    pub fn with_isolation(mut self, isolation: TransactionIsolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_prepare_timeout(mut self, timeout: Duration) -> Self {
        self.prepare_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_finished_tx_retention(mut self, retention: Duration) -> Self {
        self.finished_tx_retention_ms = retention.as_millis() as u64;
        self
    }

    pub fn with_abandoned_tx_timeout(mut self, timeout: Duration) -> Self {
        self.abandoned_tx_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_millis(self.prepare_timeout_ms)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn finished_tx_retention(&self) -> Duration {
        Duration::from_millis(self.finished_tx_retention_ms)
    }

    pub fn abandoned_tx_timeout(&self) -> Duration {
        Duration::from_millis(self.abandoned_tx_timeout_ms)
    }

    /// Rejects settings no node can run with.
    pub fn validate(&self) -> Result<()> {
        if self.num_owners == 0 {
            return Err(SeshatError::Configuration(
                "num_owners must be at least 1".to_string(),
            ));
        }
        if self.prepare_timeout_ms == 0 {
            return Err(SeshatError::Configuration(
                "prepare_timeout_ms must be positive".to_string(),
            ));
        }
        if self.remote_timeout_ms == 0 {
            return Err(SeshatError::Configuration(
                "remote_timeout_ms must be positive".to_string(),
            ));
        }
        if self.abandoned_tx_timeout_ms == 0 {
            return Err(SeshatError::Configuration(
                "abandoned_tx_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SeshatConfig::new(3);
        assert_eq!(config.num_owners, 2);
        assert!(!config.groups.enabled);
        assert_eq!(config.isolation, TransactionIsolation::RepeatableRead);
        assert_eq!(config.prepare_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: SeshatConfig = serde_json::from_str(
            r#"{ "node_id": 4, "groups": { "enabled": true }, "isolation": "read_committed" }"#,
        )
        .unwrap();
        assert_eq!(config.node_id, 4);
        assert!(config.groups.enabled);
        assert_eq!(config.isolation, TransactionIsolation::ReadCommitted);
        assert_eq!(config.remote_timeout(), Duration::from_secs(15));
        assert_eq!(config.finished_tx_retention(), Duration::from_secs(60));
        assert_eq!(config.abandoned_tx_timeout(), Duration::from_secs(30));

        let round_trip: SeshatConfig =
            serde_json::from_str(&serde_json::to_string(&config).unwrap()).unwrap();
        assert_eq!(round_trip, config);
    }

    #[test]
    fn test_zero_owners_rejected() {
        let config = SeshatConfig::new(1).with_num_owners(0);
        assert!(matches!(
            config.validate(),
            Err(SeshatError::Configuration(_))
        ));
    }
}

//! Configuration management.
//!
//! Sources, later ones overriding earlier ones:
//! 1. built-in defaults
//! 2. an optional config file (any format the `config` crate reads)
//! 3. `BASTION__SECTION__KEY` environment variables

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::acl::models::normalize_datacenters;
use crate::error::{AclError, Result};
use crate::telemetry::TelemetryConfig;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// This node and its cluster
    #[serde(default)]
    pub node: NodeConfig,

    /// ACL behaviour
    #[serde(default)]
    pub acl: AclConfig,

    /// Replicated log
    #[serde(default)]
    pub consensus: ConsensusConfig,

    /// Logging and metrics
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Member ID of this node
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Datacenter this node serves
    #[serde(default = "default_datacenter")]
    pub datacenter: String,

    /// Directory holding the durable log
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// All cluster members, including this node
    #[serde(default)]
    pub members: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            datacenter: default_datacenter(),
            data_dir: default_data_dir(),
            members: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Members with this node always included.
    pub fn cluster_members(&self) -> Vec<String> {
        let mut members = self.members.clone();
        if !members.contains(&self.node_id) {
            members.push(self.node_id.clone());
        }
        members
    }
}

#[derive(Clone, Deserialize)]
pub struct AclConfig {
    /// Secret of the management token created on first start
    #[serde(default)]
    pub initial_management_token: Option<String>,

    /// Maximum cached token resolutions per node
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for AclConfig {
    fn default() -> Self {
        Self {
            initial_management_token: None,
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl std::fmt::Debug for AclConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AclConfig")
            .field(
                "initial_management_token",
                &self.initial_management_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("cache_capacity", &self.cache_capacity)
            .finish()
    }
}

/// Where committed log entries are kept.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// JSON-lines file under `node.data_dir`
    #[default]
    File,
    /// Process memory only
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsensusConfig {
    /// How long a write waits for commit and apply before `Timeout`
    #[serde(default = "default_apply_timeout", with = "humantime_serde")]
    pub apply_timeout: Duration,

    #[serde(default)]
    pub storage: StorageKind,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            apply_timeout: default_apply_timeout(),
            storage: StorageKind::default(),
        }
    }
}

// Default value functions
fn default_node_id() -> String { "node-1".to_string() }
fn default_datacenter() -> String { "dc1".to_string() }
fn default_data_dir() -> PathBuf { PathBuf::from("./data") }
fn default_cache_capacity() -> usize { 4096 }
fn default_apply_timeout() -> Duration { Duration::from_secs(10) }

impl Config {
    /// Load configuration from the environment, optionally layered over a file.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("BASTION").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the node cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.node.node_id.trim().is_empty() {
            return Err(AclError::configuration("node.node_id must not be empty"));
        }
        normalize_datacenters(std::slice::from_ref(&self.node.datacenter))
            .map_err(|e| AclError::configuration(format!("node.datacenter: {}", e.message())))?;
        if self.consensus.apply_timeout.is_zero() {
            return Err(AclError::configuration("consensus.apply_timeout must be positive"));
        }
        if self.acl.cache_capacity == 0 {
            return Err(AclError::configuration("acl.cache_capacity must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.node.datacenter, "dc1");
        assert_eq!(cfg.consensus.apply_timeout, Duration::from_secs(10));
        assert_eq!(cfg.consensus.storage, StorageKind::File);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_cluster_members_include_self() {
        let node = NodeConfig {
            members: vec!["node-2".into()],
            ..Default::default()
        };
        assert_eq!(node.cluster_members(), vec!["node-2", "node-1"]);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"node": {{"node_id": "a", "datacenter": "dc2"}}, "consensus": {{"apply_timeout": "250ms", "storage": "memory"}}}}"#
        )
        .unwrap();

        let cfg = Config::load(file.path().to_str()).unwrap();
        assert_eq!(cfg.node.node_id, "a");
        assert_eq!(cfg.node.datacenter, "dc2");
        assert_eq!(cfg.consensus.apply_timeout, Duration::from_millis(250));
        assert_eq!(cfg.consensus.storage, StorageKind::Memory);
    }

    #[test]
    fn test_invalid_datacenter_rejected() {
        let mut cfg = Config::default();
        cfg.node.datacenter = "dc 1".into();
        assert_eq!(cfg.validate().unwrap_err().code(), crate::error::ErrorCode::Configuration);
    }

    #[test]
    fn test_debug_hides_management_token() {
        let acl = AclConfig {
            initial_management_token: Some("root".into()),
            ..Default::default()
        };
        assert!(!format!("{:?}", acl).contains("root"));
    }
}

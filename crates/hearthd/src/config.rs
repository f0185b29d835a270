//! hearthd.toml configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use hearth_lifecycle::{ControllerConfig, ReconcileConfig};
use hearth_raft::StoreConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub cluster: ClusterConfig,
    pub reconcile: ReconcileSection,
    pub shutdown: ShutdownConfig,
    pub diagnostics: DiagnosticsConfig,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// Member name; falls back to the stored identity, then the hostname.
    pub name: Option<String>,
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: None,
            data_dir: PathBuf::from("/var/lib/hearth"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    pub api_listen: String,
    pub cluster_listen: String,
    /// Cluster address peers use to reach this node.
    pub advertise_address: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            api_listen: "0.0.0.0:8443".to_string(),
            cluster_listen: "0.0.0.0:8444".to_string(),
            advertise_address: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    /// Form a new cluster when not initialized and no seeds are given.
    pub bootstrap: bool,
    /// Seed members to ask for admission.
    pub join: Vec<String>,
    pub max_voters: usize,
    pub max_attempts: u32,
    pub leader_discovery_delay_ms: u64,
    pub write_timeout_ms: u64,
    pub read_wait_ms: u64,
    pub rpc_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bootstrap: true,
            join: Vec::new(),
            max_voters: 3,
            max_attempts: 5,
            leader_discovery_delay_ms: 500,
            write_timeout_ms: 5_000,
            read_wait_ms: 5_000,
            rpc_timeout_ms: 2_000,
            heartbeat_interval_ms: 250,
            election_timeout_min_ms: 1_000,
            election_timeout_max_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcileSection {
    pub concurrency: usize,
    pub start_attempts: u32,
    pub retry_delay_ms: u64,
    pub start_timeout_ms: u64,
}

impl Default for ReconcileSection {
    fn default() -> Self {
        Self {
            concurrency: 4,
            start_attempts: 3,
            retry_delay_ms: 5_000,
            start_timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShutdownConfig {
    pub drain_timeout_secs: u64,
    /// How long in-flight API requests may run after a quiesce.
    pub quiesce_grace_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 30,
            quiesce_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiagnosticsConfig {
    /// Defaults to `<data_dir>/memory-profile.json`.
    pub memory_profile_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Helper invoked as `<command> start|stop|kill|status <project/name>`.
    pub command: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command: PathBuf::from("/usr/libexec/hearth/runtime"),
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn database_dir(&self) -> PathBuf {
        self.node.data_dir.join("database")
    }

    pub fn local_db_path(&self) -> PathBuf {
        self.database_dir().join("local.redb")
    }

    pub fn cluster_db_path(&self) -> PathBuf {
        self.database_dir().join("cluster.redb")
    }

    pub fn memory_profile_path(&self) -> PathBuf {
        self.diagnostics
            .memory_profile_path
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("memory-profile.json"))
    }

    /// Address advertised to peers; the bound cluster address when unset.
    pub fn advertise_address(&self, bound: SocketAddr) -> String {
        self.network
            .advertise_address
            .clone()
            .unwrap_or_else(|| bound.to_string())
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_attempts: self.cluster.max_attempts,
            attempt_timeout: Duration::from_millis(self.cluster.write_timeout_ms),
            leader_discovery_delay: Duration::from_millis(self.cluster.leader_discovery_delay_ms),
            read_wait: Duration::from_millis(self.cluster.read_wait_ms),
        }
    }

    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            concurrency: self.reconcile.concurrency,
            start_attempts: self.reconcile.start_attempts,
            retry_delay: Duration::from_millis(self.reconcile.retry_delay_ms),
            start_timeout: Duration::from_millis(self.reconcile.start_timeout_ms),
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            drain_timeout: Duration::from_secs(self.shutdown.drain_timeout_secs),
            memory_profile_path: Some(self.memory_profile_path()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips_through_toml() {
        let config = DaemonConfig::default();
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("drain_timeout_secs = 30"));
        let parsed: DaemonConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed: DaemonConfig = toml::from_str(
            r#"
[node]
name = "node-2"
data_dir = "/srv/hearth"

[cluster]
join = ["10.0.0.1:8444"]

[shutdown]
drain_timeout_secs = 90
"#,
        )
        .unwrap();
        assert_eq!(parsed.node.name.as_deref(), Some("node-2"));
        assert_eq!(parsed.cluster.join, vec!["10.0.0.1:8444".to_string()]);
        assert_eq!(parsed.cluster.max_voters, 3);
        assert_eq!(parsed.controller_config().drain_timeout, Duration::from_secs(90));
        assert_eq!(
            parsed.memory_profile_path(),
            PathBuf::from("/srv/hearth/memory-profile.json")
        );
        assert_eq!(parsed.cluster_db_path(), PathBuf::from("/srv/hearth/database/cluster.redb"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = toml::from_str::<DaemonConfig>("[shutdown]\ndrain_timeout = 5\n");
        assert!(err.is_err());
    }

    #[test]
    fn advertise_defaults_to_bound_address() {
        let mut config = DaemonConfig::default();
        let bound: SocketAddr = "127.0.0.1:40123".parse().unwrap();
        assert_eq!(config.advertise_address(bound), "127.0.0.1:40123");
        config.network.advertise_address = Some("10.1.1.1:8444".into());
        assert_eq!(config.advertise_address(bound), "10.1.1.1:8444");
    }
}

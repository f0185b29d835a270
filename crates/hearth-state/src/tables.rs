//! redb table definitions for hearth databases.
//!
//! Record tables use `&str` keys and `&[u8]` values holding a JSON
//! [`StoredValue`](crate::types::StoredValue) envelope. Keys follow
//! `{project}/{name}` for instances and the member name for members.

use std::fmt;

use redb::TableDefinition;
use serde::{Deserialize, Serialize};

use crate::types::{InstanceRecord, MemberRecord};

/// Instance records keyed by `{project}/{name}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Cluster membership records keyed by member name.
pub const MEMBERS: TableDefinition<&str, &[u8]> = TableDefinition::new("members");

/// Cluster-wide configuration keyed by config key.
pub const CLUSTER_CONFIG: TableDefinition<&str, &[u8]> = TableDefinition::new("cluster_config");

/// Node-local configuration keyed by config key. Never replicated.
pub const NODE_CONFIG: TableDefinition<&str, &[u8]> = TableDefinition::new("node_config");

/// Bookkeeping counters (schema version, local revision).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("hearth_meta");

/// Which store a table lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Only ever read or written by the owning node.
    Local,
    /// Replicated through consensus across the cluster.
    Replicated,
}

/// A record table addressable by mutations and repair patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Instances,
    Members,
    ClusterConfig,
    NodeConfig,
}

impl Table {
    /// Tables held by the replicated store, in snapshot order.
    pub const REPLICATED: [Table; 3] = [Table::Instances, Table::Members, Table::ClusterConfig];

    pub fn definition(self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        match self {
            Table::Instances => INSTANCES,
            Table::Members => MEMBERS,
            Table::ClusterConfig => CLUSTER_CONFIG,
            Table::NodeConfig => NODE_CONFIG,
        }
    }

    pub fn scope(self) -> Scope {
        match self {
            Table::NodeConfig => Scope::Local,
            _ => Scope::Replicated,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Table::Instances => "instances",
            Table::Members => "members",
            Table::ClusterConfig => "cluster_config",
            Table::NodeConfig => "node_config",
        }
    }

    /// Config table for the given scope (used for bookkeeping rows).
    pub fn config_for(scope: Scope) -> Table {
        match scope {
            Scope::Local => Table::NodeConfig,
            Scope::Replicated => Table::ClusterConfig,
        }
    }

    /// Check that `data` is a well-formed row for `key` in this table.
    pub fn validate(self, key: &str, data: &str) -> Result<(), String> {
        match self {
            Table::Instances => {
                let record: InstanceRecord =
                    serde_json::from_str(data).map_err(|e| e.to_string())?;
                if record.key().to_string() != key {
                    return Err(format!("record identifies as {}", record.key()));
                }
                Ok(())
            }
            Table::Members => {
                let record: MemberRecord =
                    serde_json::from_str(data).map_err(|e| e.to_string())?;
                if record.name != key {
                    return Err(format!("record identifies as {}", record.name));
                }
                Ok(())
            }
            Table::ClusterConfig | Table::NodeConfig => Ok(()),
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Table {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "instances" => Ok(Table::Instances),
            "members" => Ok(Table::Members),
            "cluster_config" => Ok(Table::ClusterConfig),
            "node_config" => Ok(Table::NodeConfig),
            other => Err(format!("unknown table {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_roundtrip() {
        for table in [Table::Instances, Table::Members, Table::ClusterConfig, Table::NodeConfig] {
            assert_eq!(table.as_str().parse::<Table>().unwrap(), table);
        }
        assert!("images".parse::<Table>().is_err());
    }

    #[test]
    fn only_node_config_is_local() {
        assert_eq!(Table::NodeConfig.scope(), Scope::Local);
        for table in Table::REPLICATED {
            assert_eq!(table.scope(), Scope::Replicated);
        }
    }

    #[test]
    fn instance_rows_must_match_their_key() {
        let data = r#"{"project":"default","name":"web","node":"n1","power_state":"stopped"}"#;
        assert!(Table::Instances.validate("default/web", data).is_ok());
        assert!(Table::Instances.validate("default/db", data).is_err());
        assert!(Table::Instances.validate("default/web", "not json").is_err());
        assert!(Table::ClusterConfig.validate("anything", "not json").is_ok());
    }
}

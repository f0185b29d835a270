//! Domain types for hearth.
//!
//! These types represent the persisted records the daemon keeps about
//! workloads and cluster members. All types are serializable to/from JSON
//! for storage in redb tables.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Name of a cluster member (node).
pub type NodeName = String;

/// Config key that, when explicitly `false`, keeps an instance down at boot.
pub const CONFIG_BOOT_AUTOSTART: &str = "boot.autostart";

/// Config key that, when `true`, forbids starting the instance at all.
pub const CONFIG_PROTECTION_START: &str = "security.protection.start";

// ── Instances ─────────────────────────────────────────────────────

/// Project-scoped identity of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub project: String,
    pub name: String,
}

impl InstanceKey {
    pub fn new(project: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            name: name.into(),
        }
    }

    /// Parse a `{project}/{name}` table key.
    pub fn parse(key: &str) -> Option<Self> {
        let (project, name) = key.split_once('/')?;
        if project.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(project, name))
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.name)
    }
}

/// Last intentionally persisted power state of an instance.
///
/// Only explicit start/stop requests write this field. It is never a
/// live probe of the process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    Running,
    Stopped,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerState::Running => f.write_str("running"),
            PowerState::Stopped => f.write_str("stopped"),
        }
    }
}

/// Kind of workload an instance runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceKind {
    #[default]
    Container,
    VirtualMachine,
}

/// Desired-state record for one workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub project: String,
    pub name: String,
    /// Cluster member that owns (runs) this instance.
    pub node: NodeName,
    #[serde(default)]
    pub kind: InstanceKind,
    /// Opaque key/value configuration.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    /// Attached device definitions keyed by device name.
    #[serde(default)]
    pub devices: BTreeMap<String, BTreeMap<String, String>>,
    pub power_state: PowerState,
    /// Unix timestamp (seconds) when the record was created.
    #[serde(default)]
    pub created_at: u64,
    /// Unix timestamp (seconds) of last use, maintained by image and
    /// storage subsystems.
    #[serde(default)]
    pub last_used_at: u64,
}

impl InstanceRecord {
    pub fn new(project: &str, name: &str, node: &str) -> Self {
        Self {
            project: project.to_string(),
            name: name.to_string(),
            node: node.to_string(),
            kind: InstanceKind::Container,
            config: BTreeMap::new(),
            devices: BTreeMap::new(),
            power_state: PowerState::Stopped,
            created_at: epoch_secs(),
            last_used_at: 0,
        }
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(&self.project, &self.name)
    }

    /// Build the composite key for the instances table.
    pub fn table_key(&self) -> String {
        self.key().to_string()
    }

    /// Whether boot-time autostart has been explicitly disabled.
    pub fn autostart_disabled(&self) -> bool {
        self.config
            .get(CONFIG_BOOT_AUTOSTART)
            .is_some_and(|v| is_false(v))
    }

    /// Whether the instance is protected against being started.
    pub fn start_protected(&self) -> bool {
        self.config
            .get(CONFIG_PROTECTION_START)
            .is_some_and(|v| is_true(v))
    }
}

// ── Members ───────────────────────────────────────────────────────

/// Consensus role of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemberRole {
    /// Votes in elections and counts toward write quorum.
    Voter,
    /// Replicates the log and is first in line for promotion.
    StandBy,
    /// Replicates the log only.
    Spare,
}

impl MemberRole {
    pub fn is_voter(self) -> bool {
        self == MemberRole::Voter
    }
}

/// Operational state of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    #[default]
    Online,
    /// Workloads were moved away; nothing is auto-started here.
    Evacuated,
}

/// Cluster membership record, one per node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub name: NodeName,
    /// Address peers use to reach this member's cluster endpoint.
    pub address: String,
    /// Consensus-level node id.
    pub raft_id: u64,
    pub role: MemberRole,
    #[serde(default)]
    pub state: MemberState,
    /// Unix timestamp (seconds) of the join.
    #[serde(default)]
    pub joined_at: u64,
}

/// Identity of the local node, kept in the local store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub name: NodeName,
    pub raft_id: u64,
}

// ── Storage envelope ──────────────────────────────────────────────

/// On-disk row: the payload plus the revision that last wrote it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredValue {
    pub revision: u64,
    pub data: String,
}

impl StoredValue {
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// A record together with the revision it was read at.
///
/// Pass `revision` back as the expected revision of a conditional write
/// to detect lost updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub revision: u64,
    pub value: T,
}

// ── Helpers ───────────────────────────────────────────────────────

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn is_true(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

fn is_false(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "false" | "0" | "no" | "off")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_key_parse_and_display() {
        let key = InstanceKey::parse("default/web").unwrap();
        assert_eq!(key, InstanceKey::new("default", "web"));
        assert_eq!(key.to_string(), "default/web");
        assert!(InstanceKey::parse("noslash").is_none());
        assert!(InstanceKey::parse("/web").is_none());
    }

    #[test]
    fn power_state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&PowerState::Running).unwrap(), "\"running\"");
        let back: PowerState = serde_json::from_str("\"stopped\"").unwrap();
        assert_eq!(back, PowerState::Stopped);
    }

    #[test]
    fn boot_flags_follow_config() {
        let mut record = InstanceRecord::new("default", "web", "node-1");
        assert!(!record.autostart_disabled());
        assert!(!record.start_protected());

        record.config.insert(CONFIG_BOOT_AUTOSTART.into(), "false".into());
        record.config.insert(CONFIG_PROTECTION_START.into(), "true".into());
        assert!(record.autostart_disabled());
        assert!(record.start_protected());

        // An explicit "true" autostart is not "disabled".
        record.config.insert(CONFIG_BOOT_AUTOSTART.into(), "true".into());
        assert!(!record.autostart_disabled());
    }

    #[test]
    fn member_role_kebab_case() {
        assert_eq!(serde_json::to_string(&MemberRole::StandBy).unwrap(), "\"stand-by\"");
        assert!(MemberRole::Voter.is_voter());
        assert!(!MemberRole::Spare.is_voter());
    }
}

//! Membership manager — admits, promotes and removes cluster members.
//!
//! Raft membership is authoritative for who votes; the `members` table
//! mirrors it with names, addresses and roles so that quorum rules can
//! be checked before touching raft at all.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use hearth_state::{Expect, MemberRecord, MemberRole, MemberState, Versioned, epoch_secs};
use openraft::error::{ClientWriteError, InitializeError, RaftError};
use openraft::{BasicNode, ChangeMembers};
use tracing::{debug, info, warn};

use crate::error::{ClusterError, ClusterResult, MembershipError};
use crate::store::ReplicatedStore;

/// Voters admitted automatically before new members become stand-by.
pub const DEFAULT_MAX_VOTERS: usize = 3;

/// Raft node id for a member name: FNV-1a 64-bit, never zero.
pub fn raft_id_for(name: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in name.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    if hash == 0 { 1 } else { hash }
}

/// What must happen for a member to leave safely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalPlan {
    /// Stand-by member promoted to voter before the removal.
    pub promote: Option<String>,
}

fn quorum(voters: usize) -> usize {
    voters / 2 + 1
}

/// Decide whether `name` may leave, given the current member records.
///
/// Removing a voter is refused when it is the last voter or when the
/// remaining voters would fall below the current quorum, unless an
/// online stand-by can be promoted in its place.
pub fn plan_removal(members: &[MemberRecord], name: &str) -> Result<RemovalPlan, MembershipError> {
    let target = members
        .iter()
        .find(|m| m.name == name)
        .ok_or_else(|| MembershipError::UnknownMember(name.to_string()))?;
    if !target.role.is_voter() {
        return Ok(RemovalPlan { promote: None });
    }

    let promote = members
        .iter()
        .filter(|m| m.role == MemberRole::StandBy && m.state == MemberState::Online)
        .map(|m| m.name.clone())
        .min();
    if promote.is_some() {
        return Ok(RemovalPlan { promote });
    }

    check_voter_loss(members, name)?;
    Ok(RemovalPlan { promote: None })
}

/// Quorum check for a voter losing its vote without replacement.
pub fn check_voter_loss(members: &[MemberRecord], name: &str) -> Result<(), MembershipError> {
    let voters = members.iter().filter(|m| m.role.is_voter()).count();
    if voters <= 1 {
        return Err(MembershipError::LastVoter(name.to_string()));
    }
    let remaining = voters - 1;
    if remaining < quorum(voters) {
        return Err(MembershipError::BelowQuorum {
            name: name.to_string(),
            remaining,
            quorum: quorum(voters),
        });
    }
    Ok(())
}

fn change_err(e: RaftError<u64, ClientWriteError<u64, BasicNode>>) -> ClusterError {
    match e {
        RaftError::APIError(ClientWriteError::ForwardToLeader(f)) => ClusterError::NotLeader {
            leader: f.leader_id,
        },
        RaftError::APIError(ClientWriteError::ChangeMembershipError(e)) => {
            ClusterError::Unavailable(e.to_string())
        }
        RaftError::Fatal(f) => ClusterError::Fatal(f.to_string()),
    }
}

/// Manages cluster membership on top of a [`ReplicatedStore`].
pub struct MembershipManager {
    store: ReplicatedStore,
    max_voters: usize,
    leader_wait: Duration,
}

impl MembershipManager {
    pub fn new(store: ReplicatedStore) -> Self {
        Self {
            store,
            max_voters: DEFAULT_MAX_VOTERS,
            leader_wait: Duration::from_secs(10),
        }
    }

    pub fn with_max_voters(mut self, max_voters: usize) -> Self {
        self.max_voters = max_voters.max(1);
        self
    }

    pub fn with_leader_wait(mut self, wait: Duration) -> Self {
        self.leader_wait = wait;
        self
    }

    pub fn store(&self) -> &ReplicatedStore {
        &self.store
    }

    fn voter_ids(&self) -> BTreeSet<u64> {
        self.store
            .raft()
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .voter_ids()
            .collect()
    }

    async fn records(&self) -> ClusterResult<Vec<Versioned<MemberRecord>>> {
        self.store.list_members().await
    }

    fn require_leader(&self) -> ClusterResult<()> {
        if self.store.is_leader() {
            Ok(())
        } else {
            Err(ClusterError::NotLeader {
                leader: self.store.current_leader(),
            })
        }
    }

    /// Form a one-voter cluster around this node, or resume an existing one.
    pub async fn bootstrap(&self, name: &str, address: &str) -> ClusterResult<Option<MemberRecord>> {
        let id = self.store.node_id();
        let raft = self.store.raft();

        let mut nodes = BTreeMap::new();
        nodes.insert(id, BasicNode::new(address));
        match raft.initialize(nodes).await {
            Ok(()) => info!(%name, raft_id = id, "cluster initialized"),
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                debug!(%name, "raft already initialized, resuming");
                return Ok(None);
            }
            Err(e) => return Err(ClusterError::Fatal(e.to_string())),
        }

        raft.wait(Some(self.leader_wait))
            .current_leader(id, "bootstrap leadership")
            .await
            .map_err(|e| ClusterError::Unavailable(e.to_string()))?;

        let record = MemberRecord {
            name: name.to_string(),
            address: address.to_string(),
            raft_id: id,
            role: MemberRole::Voter,
            state: MemberState::Online,
            joined_at: epoch_secs(),
        };
        self.store.put_member(&record, Expect::Absent).await?;
        Ok(Some(record))
    }

    /// Admit a new member. Must run on the leader.
    pub async fn accept(&self, name: &str, address: &str) -> ClusterResult<MemberRecord> {
        self.require_leader()?;
        let members = self.records().await?;

        if let Some(existing) = members.iter().find(|m| m.value.name == name) {
            if existing.value.address == address {
                debug!(%name, "member already admitted");
                return Ok(existing.value.clone());
            }
            return Err(MembershipError::Duplicate(name.to_string()).into());
        }

        let raft_id = raft_id_for(name);
        if let Some(other) = members.iter().find(|m| m.value.raft_id == raft_id) {
            return Err(MembershipError::IdCollision {
                name: name.to_string(),
                raft_id,
                existing: other.value.name.clone(),
            }
            .into());
        }

        let raft = self.store.raft();
        raft.add_learner(raft_id, BasicNode::new(address), true)
            .await
            .map_err(change_err)?;

        let mut voters = self.voter_ids();
        let role = if voters.len() < self.max_voters {
            voters.insert(raft_id);
            raft.change_membership(voters, false)
                .await
                .map_err(change_err)?;
            MemberRole::Voter
        } else {
            MemberRole::StandBy
        };

        let record = MemberRecord {
            name: name.to_string(),
            address: address.to_string(),
            raft_id,
            role,
            state: MemberState::Online,
            joined_at: epoch_secs(),
        };
        self.store.put_member(&record, Expect::Absent).await?;
        info!(%name, %address, raft_id, ?role, "member joined");
        Ok(record)
    }

    /// Remove a member gracefully, promoting a stand-by when needed.
    pub async fn leave(&self, name: &str) -> ClusterResult<()> {
        let members = self.records().await?;
        let records: Vec<MemberRecord> = members.iter().map(|m| m.value.clone()).collect();
        let plan = plan_removal(&records, name)?;
        let raft = self.store.raft();

        if let Some(promote) = &plan.promote {
            self.assign_role(promote, MemberRole::Voter).await?;
        }

        let Some(target) = records.iter().find(|m| m.name == name) else {
            return Err(MembershipError::UnknownMember(name.to_string()).into());
        };
        let ids = BTreeSet::from([target.raft_id]);
        let change = if target.role.is_voter() {
            ChangeMembers::RemoveVoters(ids)
        } else {
            ChangeMembers::RemoveNodes(ids)
        };
        raft.change_membership(change, false)
            .await
            .map_err(change_err)?;

        self.store.delete_member(name).await?;
        info!(%name, promoted = ?plan.promote, "member left");
        Ok(())
    }

    /// Change a member's consensus role, honouring quorum on demotion.
    pub async fn assign_role(&self, name: &str, role: MemberRole) -> ClusterResult<MemberRecord> {
        let current = self
            .store
            .get_member(name)
            .await?
            .ok_or_else(|| MembershipError::UnknownMember(name.to_string()))?;
        let mut record = current.value;
        if record.role == role {
            return Ok(record);
        }

        let raft = self.store.raft();
        let ids = BTreeSet::from([record.raft_id]);
        if role.is_voter() {
            raft.change_membership(ChangeMembers::AddVoterIds(ids), false)
                .await
                .map_err(change_err)?;
        } else if record.role.is_voter() {
            let records: Vec<MemberRecord> =
                self.records().await?.into_iter().map(|m| m.value).collect();
            check_voter_loss(&records, name)?;
            raft.change_membership(ChangeMembers::RemoveVoters(ids), true)
                .await
                .map_err(change_err)?;
        }

        let from = record.role;
        record.role = role;
        self.store
            .put_member(&record, Expect::Revision(current.revision))
            .await?;
        info!(%name, ?from, to = ?role, "member role changed");
        Ok(record)
    }

    /// Mark a member evacuated (or back online).
    pub async fn set_evacuated(&self, name: &str, evacuated: bool) -> ClusterResult<MemberRecord> {
        let current = self
            .store
            .get_member(name)
            .await?
            .ok_or_else(|| MembershipError::UnknownMember(name.to_string()))?;
        let mut record = current.value;
        record.state = if evacuated {
            MemberState::Evacuated
        } else {
            MemberState::Online
        };
        self.store
            .put_member(&record, Expect::Revision(current.revision))
            .await?;
        if evacuated {
            warn!(%name, "member evacuated, its instances will not be auto-started");
        } else {
            info!(%name, "member restored");
        }
        Ok(record)
    }
}

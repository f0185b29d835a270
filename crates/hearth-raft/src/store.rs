//! ReplicatedStore — the cluster-wide record store.
//!
//! Writes go through raft: they are accepted only once a quorum has
//! persisted them, and followers forward them to the leader. Reads are
//! served from the local replica after it has applied this handle's
//! last write (session consistency); [`ReplicatedStore::read_leader`]
//! gives a linearizable barrier instead.
//!
//! Every record carries the log index that last wrote it. Typed writes
//! take that revision as a compare-and-swap precondition so that two
//! racing read-modify-write callers cannot both win.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use hearth_state::schema::{self, Schema};
use hearth_state::{
    Expect, InstanceKey, InstanceRecord, MemberRecord, Mutation, MutationError, Patch, PatchError,
    PatchOutcome, PatchTarget, PowerState, Table, Versioned,
};
use openraft::error::{CheckIsLeaderError, ClientWriteError, RaftError};
use openraft::network::RaftNetworkFactory;
use openraft::raft::ClientWriteResponse;
use openraft::{BasicNode, ServerState};
use redb::Database;
use tracing::{debug, info, warn};

use crate::error::{ClusterError, ClusterResult};
use crate::log_store::LogStore;
use crate::network::{ForwardError, LeaderForwarder};
use crate::reader::StateReader;
use crate::state_machine::StateMachine;
use crate::typ::{HearthRaft, Outcome, Request, TypeConfig};

/// Bounded-retry and freshness settings for store clients.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Attempts per write before giving up with `Unavailable`.
    pub max_attempts: u32,
    /// Time box for a single proposal or forward.
    pub attempt_timeout: Duration,
    /// Pause before retrying when no leader is known.
    pub leader_discovery_delay: Duration,
    /// How long a read waits for the replica to catch up to the session.
    pub read_wait: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            attempt_timeout: Duration::from_secs(5),
            leader_discovery_delay: Duration::from_millis(500),
            read_wait: Duration::from_secs(5),
        }
    }
}

/// Proof that a write committed at `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReceipt {
    pub index: u64,
}

/// Storage handed to `openraft::Raft::new`.
pub struct RaftStorage {
    pub log_store: LogStore,
    pub state_machine: StateMachine,
    pub reader: StateReader,
    /// Backup taken when opening upgraded the schema.
    pub backup: Option<PathBuf>,
}

impl RaftStorage {
    /// Open `cluster.redb`, bringing it to the cluster schema first.
    pub fn open(path: &Path) -> ClusterResult<Self> {
        let (db, backup) = schema::open_database(path, &Schema::cluster())?;
        info!(path = %path.display(), "cluster database opened");
        Self::from_db(Arc::new(db), backup)
    }

    pub fn open_in_memory() -> ClusterResult<Self> {
        let db = schema::open_in_memory(&Schema::cluster())?;
        Self::from_db(Arc::new(db), None)
    }

    fn from_db(db: Arc<Database>, backup: Option<PathBuf>) -> ClusterResult<Self> {
        let storage_err = |e: openraft::StorageError<u64>| ClusterError::Storage(e.to_string());
        Ok(Self {
            log_store: LogStore::open(Arc::clone(&db)).map_err(storage_err)?,
            state_machine: StateMachine::open(Arc::clone(&db)).map_err(storage_err)?,
            reader: StateReader::new(db),
            backup,
        })
    }
}

/// Client handle over one node's raft instance.
#[derive(Clone)]
pub struct ReplicatedStore {
    node_id: u64,
    raft: HearthRaft,
    reader: StateReader,
    forwarder: Option<Arc<dyn LeaderForwarder>>,
    config: StoreConfig,
    last_seen: Arc<AtomicU64>,
}

impl ReplicatedStore {
    pub fn new(node_id: u64, raft: HearthRaft, reader: StateReader) -> Self {
        Self {
            node_id,
            raft,
            reader,
            forwarder: None,
            config: StoreConfig::default(),
            last_seen: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start the raft node over `storage` and wrap it in a store handle.
    pub async fn launch<N>(
        node_id: u64,
        config: Arc<openraft::Config>,
        network: N,
        storage: RaftStorage,
    ) -> ClusterResult<Self>
    where
        N: RaftNetworkFactory<TypeConfig>,
    {
        let raft = openraft::Raft::new(
            node_id,
            config,
            network,
            storage.log_store,
            storage.state_machine,
        )
        .await
        .map_err(|e| ClusterError::Fatal(e.to_string()))?;
        debug!(node_id, "raft instance created");
        Ok(Self::new(node_id, raft, storage.reader))
    }

    pub fn with_forwarder(mut self, forwarder: Arc<dyn LeaderForwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// A handle sharing raft and replica but with its own session.
    pub fn new_session(&self) -> Self {
        Self {
            last_seen: Arc::new(AtomicU64::new(0)),
            ..self.clone()
        }
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn raft(&self) -> &HearthRaft {
        &self.raft
    }

    pub fn reader(&self) -> &StateReader {
        &self.reader
    }

    /// Highest commit index this session has observed.
    pub fn commit_index(&self) -> u64 {
        self.last_seen.load(Ordering::Acquire)
    }

    fn observe(&self, index: u64) {
        self.last_seen.fetch_max(index, Ordering::AcqRel);
    }

    /// Current leader as seen by the local node.
    pub fn current_leader(&self) -> Option<u64> {
        self.raft.metrics().borrow().current_leader
    }

    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().state == ServerState::Leader
    }

    /// Stop the local raft node. Other handles become unusable.
    pub async fn shutdown(&self) -> ClusterResult<()> {
        self.raft
            .shutdown()
            .await
            .map_err(|e| ClusterError::Fatal(e.to_string()))
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Commit `request` through consensus with bounded retry.
    pub async fn write(&self, request: impl Into<Request>) -> ClusterResult<WriteReceipt> {
        let request = request.into();
        let mut last_error = ClusterError::Unavailable("no attempt made".into());

        for attempt in 1..=self.config.max_attempts {
            let proposal = tokio::time::timeout(
                self.config.attempt_timeout,
                self.raft.client_write(request.clone()),
            )
            .await;

            let err = match proposal {
                Ok(Ok(resp)) => return self.finish(resp),
                Ok(Err(e)) => e,
                Err(_) => {
                    // The proposal may still commit; retrying could apply it twice.
                    return Err(ClusterError::Unavailable(format!(
                        "write not acknowledged by a quorum within {:?}",
                        self.config.attempt_timeout
                    )));
                }
            };

            match err {
                RaftError::APIError(ClientWriteError::ForwardToLeader(fwd)) => {
                    match (fwd.leader_id, &self.forwarder) {
                        (Some(leader), Some(forwarder)) if leader != self.node_id => {
                            match self
                                .forward(forwarder.as_ref(), leader, fwd.leader_node, &request)
                                .await
                            {
                                Ok(resp) => return self.finish(resp),
                                Err(e) if e.is_retryable() => last_error = e,
                                Err(e) => return Err(e),
                            }
                        }
                        (leader, _) => {
                            last_error = ClusterError::NotLeader { leader };
                        }
                    }
                }
                RaftError::APIError(ClientWriteError::ChangeMembershipError(e)) => {
                    return Err(ClusterError::Fatal(e.to_string()));
                }
                RaftError::Fatal(e) => return Err(ClusterError::Fatal(e.to_string())),
            }

            debug!(attempt, error = %last_error, "write attempt failed, retrying");
            if attempt < self.config.max_attempts {
                tokio::time::sleep(self.config.leader_discovery_delay).await;
            }
        }

        warn!(attempts = self.config.max_attempts, error = %last_error, "write gave up");
        Err(match last_error {
            e @ ClusterError::NotLeader { .. } => e,
            e => ClusterError::Unavailable(format!(
                "gave up after {} attempts: {e}",
                self.config.max_attempts
            )),
        })
    }

    async fn forward(
        &self,
        forwarder: &dyn LeaderForwarder,
        leader: u64,
        leader_node: Option<BasicNode>,
        request: &Request,
    ) -> ClusterResult<ClientWriteResponse<TypeConfig>> {
        let forwarded = tokio::time::timeout(
            self.config.attempt_timeout,
            forwarder.forward_write(leader, leader_node, request.clone()),
        )
        .await;

        match forwarded {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(ForwardError::Unreachable(reason))) => Err(ClusterError::Unavailable(reason)),
            Ok(Err(ForwardError::Raft(RaftError::APIError(ClientWriteError::ForwardToLeader(
                f,
            ))))) => Err(ClusterError::NotLeader {
                leader: f.leader_id,
            }),
            Ok(Err(ForwardError::Raft(e))) => Err(ClusterError::Fatal(e.to_string())),
            Err(_) => Err(ClusterError::Unavailable(format!(
                "leader {leader} did not answer within {:?}",
                self.config.attempt_timeout
            ))),
        }
    }

    fn finish(&self, resp: ClientWriteResponse<TypeConfig>) -> ClusterResult<WriteReceipt> {
        let index = resp.log_id.index;
        self.observe(index);
        match resp.data.outcome {
            Outcome::Committed => Ok(WriteReceipt { index }),
            Outcome::Rejected(e) => Err(ClusterError::from_mutation(e)),
        }
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Wait until the local replica has applied this session's writes.
    pub async fn catch_up(&self) -> ClusterResult<()> {
        let index = self.commit_index();
        if index == 0 {
            return Ok(());
        }
        self.raft
            .wait(Some(self.config.read_wait))
            .applied_index_at_least(Some(index), "session read")
            .await
            .map_err(|e| ClusterError::Unavailable(format!("replica behind session: {e}")))?;
        Ok(())
    }

    /// Linearizable barrier: confirm leadership with a quorum and wait
    /// for the local state machine to reach the leader's commit.
    pub async fn read_leader(&self) -> ClusterResult<()> {
        let confirmed = self.raft.ensure_linearizable().await.map_err(|e| match e {
            RaftError::APIError(CheckIsLeaderError::ForwardToLeader(f)) => {
                ClusterError::NotLeader {
                    leader: f.leader_id,
                }
            }
            RaftError::APIError(CheckIsLeaderError::QuorumNotEnough(q)) => {
                ClusterError::Unavailable(q.to_string())
            }
            RaftError::Fatal(f) => ClusterError::Fatal(f.to_string()),
        })?;
        if let Some(log_id) = confirmed {
            self.observe(log_id.index);
        }
        self.catch_up().await
    }

    // ── Instances ──────────────────────────────────────────────────

    pub async fn create_instance(
        &self,
        record: &InstanceRecord,
    ) -> ClusterResult<Versioned<InstanceRecord>> {
        let m = Mutation::put_json(Table::Instances, record.table_key(), record)
            .map_err(ClusterError::Rejected)?
            .with_expect(Expect::Absent);
        let receipt = self.write(m).await?;
        info!(instance = %record.key(), node = %record.node, "instance created");
        Ok(Versioned {
            revision: receipt.index,
            value: record.clone(),
        })
    }

    pub async fn get_instance(
        &self,
        project: &str,
        name: &str,
    ) -> ClusterResult<Option<Versioned<InstanceRecord>>> {
        self.catch_up().await?;
        let key = InstanceKey::new(project, name).to_string();
        Ok(self.reader.get(Table::Instances, &key)?)
    }

    pub async fn list_instances(&self) -> ClusterResult<Vec<Versioned<InstanceRecord>>> {
        self.catch_up().await?;
        Ok(self.reader.list(Table::Instances)?)
    }

    /// Instances owned by `node`.
    pub async fn list_instances_for_node(
        &self,
        node: &str,
    ) -> ClusterResult<Vec<Versioned<InstanceRecord>>> {
        Ok(self
            .list_instances()
            .await?
            .into_iter()
            .filter(|v| v.value.node == node)
            .collect())
    }

    /// Replace a record if it is still at `expected_revision`.
    pub async fn update_instance(
        &self,
        record: &InstanceRecord,
        expected_revision: u64,
    ) -> ClusterResult<Versioned<InstanceRecord>> {
        let m = Mutation::put_json(Table::Instances, record.table_key(), record)
            .map_err(ClusterError::Rejected)?
            .with_expect(Expect::Revision(expected_revision));
        let receipt = self.write(m).await?;
        Ok(Versioned {
            revision: receipt.index,
            value: record.clone(),
        })
    }

    /// Persist an intentional power transition (compare-and-swap).
    pub async fn set_power_state(
        &self,
        project: &str,
        name: &str,
        state: PowerState,
        expected_revision: u64,
    ) -> ClusterResult<Versioned<InstanceRecord>> {
        let current = self.get_instance_at(project, name, expected_revision).await?;
        let mut record = current.value;
        record.power_state = state;
        let updated = self.update_instance(&record, expected_revision).await?;
        info!(instance = %record.key(), power_state = %state, revision = updated.revision, "power state persisted");
        Ok(updated)
    }

    /// Delete a stopped instance (compare-and-swap).
    pub async fn delete_instance(
        &self,
        project: &str,
        name: &str,
        expected_revision: u64,
    ) -> ClusterResult<()> {
        let current = self.get_instance_at(project, name, expected_revision).await?;
        if current.value.power_state == PowerState::Running {
            return Err(ClusterError::Refused(format!(
                "instance {} is running, stop it first",
                current.value.key()
            )));
        }
        let m = Mutation::delete(Table::Instances, current.value.table_key())
            .with_expect(Expect::Revision(expected_revision));
        self.write(m).await?;
        info!(instance = %current.value.key(), "instance deleted");
        Ok(())
    }

    /// Read the record exactly as it was committed at `expected_revision`.
    ///
    /// The replica is first brought up to that index, so a lagging node
    /// never hands a stale body to a write guarded by a newer revision.
    pub async fn get_instance_at(
        &self,
        project: &str,
        name: &str,
        expected_revision: u64,
    ) -> ClusterResult<Versioned<InstanceRecord>> {
        self.catch_up().await?;
        let key = InstanceKey::new(project, name).to_string();
        let conflict = |actual: Option<u64>| {
            ClusterError::Conflict(MutationError::Conflict {
                table: Table::Instances,
                key: key.clone(),
                expected: Expect::Revision(expected_revision),
                actual,
            })
        };

        if self
            .raft
            .wait(Some(self.config.read_wait))
            .applied_index_at_least(Some(expected_revision), "conditional read")
            .await
            .is_err()
        {
            let actual = self
                .reader
                .get::<InstanceRecord>(Table::Instances, &key)?
                .map(|v| v.revision);
            return Err(conflict(actual));
        }

        let current = self
            .reader
            .get::<InstanceRecord>(Table::Instances, &key)?
            .ok_or_else(|| {
                ClusterError::State(hearth_state::StateError::NotFound(format!(
                    "instance {project}/{name}"
                )))
            })?;
        if current.revision != expected_revision {
            return Err(conflict(Some(current.revision)));
        }
        Ok(current)
    }

    // ── Members ────────────────────────────────────────────────────

    pub async fn get_member(&self, name: &str) -> ClusterResult<Option<Versioned<MemberRecord>>> {
        self.catch_up().await?;
        Ok(self.reader.get(Table::Members, name)?)
    }

    pub async fn list_members(&self) -> ClusterResult<Vec<Versioned<MemberRecord>>> {
        self.catch_up().await?;
        Ok(self.reader.list(Table::Members)?)
    }

    pub async fn put_member(&self, record: &MemberRecord, expect: Expect) -> ClusterResult<u64> {
        let m = Mutation::put_json(Table::Members, record.name.as_str(), record)
            .map_err(ClusterError::Rejected)?
            .with_expect(expect);
        Ok(self.write(m).await?.index)
    }

    pub async fn delete_member(&self, name: &str) -> ClusterResult<u64> {
        Ok(self.write(Mutation::delete(Table::Members, name)).await?.index)
    }

    // ── Cluster config ─────────────────────────────────────────────

    pub async fn get_cluster_config(&self, key: &str) -> ClusterResult<Option<String>> {
        self.catch_up().await?;
        Ok(self
            .reader
            .get_row(Table::ClusterConfig, key)?
            .map(|row| row.data))
    }

    pub async fn cluster_config(&self) -> ClusterResult<BTreeMap<String, String>> {
        self.catch_up().await?;
        Ok(self
            .reader
            .rows(Table::ClusterConfig)?
            .into_iter()
            .map(|(k, row)| (k, row.data))
            .collect())
    }

    pub async fn set_cluster_config(&self, key: &str, value: &str) -> ClusterResult<u64> {
        let m = Mutation::put(Table::ClusterConfig, key, value);
        Ok(self.write(m).await?.index)
    }

    // ── Repair ─────────────────────────────────────────────────────

    /// Commit a global repair patch as one raft entry.
    pub async fn apply_patch(&self, patch: &Patch) -> Result<PatchOutcome, PatchError> {
        if patch.target != PatchTarget::Global {
            return Err(PatchError::WrongTarget {
                path: patch.path.clone(),
                target: patch.target,
            });
        }
        match self.write(Request::Batch(patch.mutations())).await {
            Ok(_) => Ok(PatchOutcome::Applied {
                statements: patch.statements.len(),
            }),
            Err(ClusterError::Conflict(e)) | Err(ClusterError::Rejected(e)) => {
                patch.classify_failure(e)
            }
            Err(e) => Err(PatchError::Commit(e.to_string())),
        }
    }
}

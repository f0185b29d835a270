//! In-process transport for clusters living in one process.
//!
//! Every node registers its `Raft` handle with a shared router; RPCs are
//! direct method calls. Nodes can be isolated to simulate a partition:
//! an isolated node neither sends nor receives.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use openraft::BasicNode;
use openraft::error::{InstallSnapshotError, RPCError, RaftError, RemoteError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, ClientWriteResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};

use crate::network::{ForwardError, LeaderForwarder};
use crate::typ::{HearthRaft, Request, TypeConfig};

#[derive(Default)]
struct Registry {
    nodes: BTreeMap<u64, HearthRaft>,
    isolated: BTreeSet<u64>,
}

/// Shared switchboard between in-process nodes.
#[derive(Clone, Default)]
pub struct InProcessRouter {
    inner: Arc<Mutex<Registry>>,
}

impl InProcessRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Network factory for the node with id `source`.
    pub fn network(&self, source: u64) -> InProcessNetwork {
        InProcessNetwork {
            source,
            router: self.clone(),
        }
    }

    pub fn register(&self, id: u64, raft: HearthRaft) {
        self.registry().nodes.insert(id, raft);
    }

    pub fn unregister(&self, id: u64) {
        self.registry().nodes.remove(&id);
    }

    /// Cut `id` off from every other node.
    pub fn isolate(&self, id: u64) {
        self.registry().isolated.insert(id);
    }

    pub fn heal(&self, id: u64) {
        self.registry().isolated.remove(&id);
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        // A poisoned registry only means a test thread panicked mid-update.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolve `target` as seen from `source`, honouring partitions.
    fn route(&self, source: u64, target: u64) -> Result<HearthRaft, String> {
        let reg = self.registry();
        if reg.isolated.contains(&source) || reg.isolated.contains(&target) {
            return Err(format!("node {source} cannot reach node {target}: partitioned"));
        }
        reg.nodes
            .get(&target)
            .cloned()
            .ok_or_else(|| format!("node {target} is not registered"))
    }
}

/// Per-node view of the router, used as that node's network factory.
#[derive(Clone)]
pub struct InProcessNetwork {
    source: u64,
    router: InProcessRouter,
}

pub struct InProcessConnection {
    source: u64,
    target: u64,
    router: InProcessRouter,
}

fn unreachable<E: std::error::Error>(msg: String) -> RPCError<u64, BasicNode, E> {
    RPCError::Unreachable(Unreachable::new(&std::io::Error::other(msg)))
}

impl RaftNetworkFactory<TypeConfig> for InProcessNetwork {
    type Network = InProcessConnection;

    async fn new_client(&mut self, target: u64, _node: &BasicNode) -> Self::Network {
        InProcessConnection {
            source: self.source,
            target,
            router: self.router.clone(),
        }
    }
}

impl RaftNetwork<TypeConfig> for InProcessConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        let raft = self.router.route(self.source, self.target).map_err(unreachable)?;
        raft.append_entries(rpc)
            .await
            .map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<u64>,
        RPCError<u64, BasicNode, RaftError<u64, InstallSnapshotError>>,
    > {
        let raft = self.router.route(self.source, self.target).map_err(unreachable)?;
        raft.install_snapshot(rpc)
            .await
            .map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<u64>,
        _option: RPCOption,
    ) -> Result<VoteResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        let raft = self.router.route(self.source, self.target).map_err(unreachable)?;
        raft.vote(rpc)
            .await
            .map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }
}

#[async_trait]
impl LeaderForwarder for InProcessNetwork {
    async fn forward_write(
        &self,
        leader: u64,
        _leader_node: Option<BasicNode>,
        request: Request,
    ) -> Result<ClientWriteResponse<TypeConfig>, ForwardError> {
        let raft = self
            .router
            .route(self.source, leader)
            .map_err(ForwardError::Unreachable)?;
        raft.client_write(request).await.map_err(ForwardError::Raft)
    }
}

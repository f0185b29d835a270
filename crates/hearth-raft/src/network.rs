//! Raft network layer over plain HTTP/1.1.
//!
//! Implements `RaftNetworkFactory` and `RaftNetwork` so that openraft
//! can talk to peers. Each RPC POSTs the openraft request as JSON and
//! reads back a JSON `Result<Response, RaftError>`. The same client
//! forwards writes to the leader and carries join requests.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hearth_state::MemberRecord;
use http_body_util::{BodyExt, Full};
use openraft::BasicNode;
use openraft::error::{
    ClientWriteError, InstallSnapshotError, RPCError, RaftError, RemoteError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, ClientWriteResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::typ::{Request, TypeConfig};

pub const APPEND_PATH: &str = "/internal/raft/append";
pub const VOTE_PATH: &str = "/internal/raft/vote";
pub const SNAPSHOT_PATH: &str = "/internal/raft/snapshot";
pub const WRITE_PATH: &str = "/internal/cluster/write";
pub const JOIN_PATH: &str = "/internal/cluster/join";

/// Reply body of a forwarded write.
pub type WriteReply =
    Result<ClientWriteResponse<TypeConfig>, RaftError<u64, ClientWriteError<u64, BasicNode>>>;

/// A node asking to be admitted to the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub name: String,
    /// Cluster endpoint peers should use to reach the joiner.
    pub address: String,
}

/// Reply body of a join request.
pub type JoinReply = Result<MemberRecord, String>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("http: {0}")]
    Http(String),

    #[error("peer answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("encode: {0}")]
    Encode(String),

    #[error("decode: {0}")]
    Decode(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// POST `body` as JSON to `http://{addr}{path}` and decode the JSON reply.
pub async fn post_json<Req, Resp>(
    addr: &str,
    path: &str,
    body: &Req,
    timeout: Duration,
) -> Result<Resp, TransportError>
where
    Req: Serialize + ?Sized,
    Resp: DeserializeOwned,
{
    let payload = serde_json::to_vec(body).map_err(|e| TransportError::Encode(e.to_string()))?;
    let uri = format!("http://{addr}{path}");

    let exchange = async {
        let stream = tokio::net::TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::Connect {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "peer connection closed");
            }
        });

        let req = http::Request::builder()
            .method(http::Method::POST)
            .uri(&uri)
            .header(http::header::HOST, addr)
            .header(http::header::CONTENT_TYPE, "application/json")
            .header(http::header::USER_AGENT, "hearth-raft/0.1")
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        serde_json::from_slice(&body).map_err(|e| TransportError::Decode(e.to_string()))
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(timeout)),
    }
}

// ── Raft RPC ──────────────────────────────────────────────────────

/// Factory that creates per-peer HTTP connections.
#[derive(Debug, Clone)]
pub struct HttpNetworkFactory {
    timeout: Duration,
}

impl HttpNetworkFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HttpNetworkFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

/// A single peer endpoint.
pub struct HttpConnection {
    target: u64,
    addr: String,
    timeout: Duration,
}

impl HttpConnection {
    async fn call<Req, Resp, E>(
        &self,
        path: &str,
        rpc: &Req,
    ) -> Result<Resp, RPCError<u64, BasicNode, RaftError<u64, E>>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        E: std::error::Error + DeserializeOwned,
    {
        let reply: Result<Resp, RaftError<u64, E>> = post_json(&self.addr, path, rpc, self.timeout)
            .await
            .map_err(|e| {
                RPCError::Unreachable(Unreachable::new(&std::io::Error::other(format!(
                    "raft rpc to node {} ({}): {e}",
                    self.target, self.addr
                ))))
            })?;
        reply.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }
}

impl RaftNetworkFactory<TypeConfig> for HttpNetworkFactory {
    type Network = HttpConnection;

    async fn new_client(&mut self, target: u64, node: &BasicNode) -> Self::Network {
        debug!(target, addr = %node.addr, "creating raft network connection");
        HttpConnection {
            target,
            addr: node.addr.clone(),
            timeout: self.timeout,
        }
    }
}

impl RaftNetwork<TypeConfig> for HttpConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        self.call(APPEND_PATH, &rpc).await
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<u64>,
        RPCError<u64, BasicNode, RaftError<u64, InstallSnapshotError>>,
    > {
        self.call(SNAPSHOT_PATH, &rpc).await
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<u64>,
        _option: RPCOption,
    ) -> Result<VoteResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        self.call(VOTE_PATH, &rpc).await
    }
}

// ── Leader forwarding ─────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("leader unreachable: {0}")]
    Unreachable(String),

    #[error(transparent)]
    Raft(RaftError<u64, ClientWriteError<u64, BasicNode>>),
}

/// Delivers a client write to the current leader on behalf of a follower.
#[async_trait]
pub trait LeaderForwarder: Send + Sync + 'static {
    async fn forward_write(
        &self,
        leader: u64,
        leader_node: Option<BasicNode>,
        request: Request,
    ) -> Result<ClientWriteResponse<TypeConfig>, ForwardError>;
}

/// Forwards writes over the leader's `/internal/cluster/write` endpoint.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    timeout: Duration,
}

impl HttpForwarder {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl LeaderForwarder for HttpForwarder {
    async fn forward_write(
        &self,
        leader: u64,
        leader_node: Option<BasicNode>,
        request: Request,
    ) -> Result<ClientWriteResponse<TypeConfig>, ForwardError> {
        let node = leader_node.ok_or_else(|| {
            ForwardError::Unreachable(format!("address of leader {leader} unknown"))
        })?;
        debug!(leader, addr = %node.addr, "forwarding write to leader");
        let reply: WriteReply = post_json(&node.addr, WRITE_PATH, &request, self.timeout)
            .await
            .map_err(|e| ForwardError::Unreachable(e.to_string()))?;
        reply.map_err(ForwardError::Raft)
    }
}

/// Ask a seed member to admit this node.
pub async fn request_join(
    seed: &str,
    request: &JoinRequest,
    timeout: Duration,
) -> Result<JoinReply, TransportError> {
    post_json(seed, JOIN_PATH, request, timeout).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn factory_creates_connection() {
        let mut factory = HttpNetworkFactory::default();
        let node = BasicNode::new("127.0.0.1:9100");
        let conn = factory.new_client(1, &node).await;
        assert_eq!(conn.target, 1);
        assert_eq!(conn.addr, "127.0.0.1:9100");
    }

    #[tokio::test]
    async fn unreachable_peer_is_reported() {
        // Bind then drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let req = JoinRequest {
            name: "node-2".into(),
            address: "127.0.0.1:1".into(),
        };
        let err = request_join(&addr, &req, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }

    #[tokio::test]
    async fn forwarder_needs_leader_address() {
        let fwd = HttpForwarder::new(Duration::from_secs(1));
        let req = Request::Batch(Vec::new());
        let err = fwd.forward_write(7, None, req).await.unwrap_err();
        assert!(matches!(err, ForwardError::Unreachable(_)));
    }
}

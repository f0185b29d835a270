//! Peer-facing HTTP routes.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/internal/raft/append` | AppendEntries RPC |
//! | POST | `/internal/raft/vote` | RequestVote RPC |
//! | POST | `/internal/raft/snapshot` | InstallSnapshot RPC |
//! | POST | `/internal/cluster/write` | Client write forwarded by a follower |
//! | POST | `/internal/cluster/join` | Admission request from a new node |

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use openraft::error::{InstallSnapshotError, RaftError};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use tracing::{debug, info, warn};

use crate::error::ClusterError;
use crate::membership::MembershipManager;
use crate::network::{
    APPEND_PATH, JOIN_PATH, JoinReply, JoinRequest, SNAPSHOT_PATH, VOTE_PATH, WRITE_PATH,
    WriteReply, request_join,
};
use crate::typ::{HearthRaft, Request, TypeConfig};

const JOIN_FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct PeerState {
    raft: HearthRaft,
    membership: Option<Arc<MembershipManager>>,
}

/// Routes answering raft RPCs, forwarded writes and join requests.
///
/// Without a membership manager, join requests are refused.
pub fn raft_router(raft: HearthRaft, membership: Option<Arc<MembershipManager>>) -> Router {
    Router::new()
        .route(APPEND_PATH, post(append))
        .route(VOTE_PATH, post(vote))
        .route(SNAPSHOT_PATH, post(snapshot))
        .route(WRITE_PATH, post(write))
        .route(JOIN_PATH, post(join))
        .with_state(PeerState { raft, membership })
}

async fn append(
    State(s): State<PeerState>,
    Json(rpc): Json<AppendEntriesRequest<TypeConfig>>,
) -> Json<Result<AppendEntriesResponse<u64>, RaftError<u64>>> {
    Json(s.raft.append_entries(rpc).await)
}

async fn vote(
    State(s): State<PeerState>,
    Json(rpc): Json<VoteRequest<u64>>,
) -> Json<Result<VoteResponse<u64>, RaftError<u64>>> {
    Json(s.raft.vote(rpc).await)
}

async fn snapshot(
    State(s): State<PeerState>,
    Json(rpc): Json<InstallSnapshotRequest<TypeConfig>>,
) -> Json<Result<InstallSnapshotResponse<u64>, RaftError<u64, InstallSnapshotError>>> {
    Json(s.raft.install_snapshot(rpc).await)
}

async fn write(State(s): State<PeerState>, Json(req): Json<Request>) -> Json<WriteReply> {
    debug!(mutations = req.mutations().len(), "forwarded write received");
    Json(s.raft.client_write(req).await)
}

async fn join(State(s): State<PeerState>, Json(req): Json<JoinRequest>) -> Json<JoinReply> {
    let Some(membership) = s.membership else {
        return Json(Err("this node does not accept join requests".into()));
    };

    match membership.accept(&req.name, &req.address).await {
        Ok(record) => Json(Ok(record)),
        Err(ClusterError::NotLeader {
            leader: Some(leader),
        }) => {
            let addr = s
                .raft
                .metrics()
                .borrow()
                .membership_config
                .membership()
                .get_node(&leader)
                .map(|n| n.addr.clone());
            let Some(addr) = addr else {
                return Json(Err(format!("leader {leader} has no known address")));
            };
            info!(name = %req.name, %addr, "passing join request to leader");
            match request_join(&addr, &req, JOIN_FORWARD_TIMEOUT).await {
                Ok(reply) => Json(reply),
                Err(e) => Json(Err(format!("leader {leader} unreachable: {e}"))),
            }
        }
        Err(e) => {
            warn!(name = %req.name, error = %e, "join refused");
            Json(Err(e.to_string()))
        }
    }
}

//! REST API handlers.
//!
//! Each handler reads/writes via `ReplicatedStore` and returns JSON responses.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use hearth_raft::ClusterError;
use hearth_state::{InstanceKey, InstanceKind, InstanceRecord, PowerState, StateError};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    /// Set when the caller may retry the same request.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    retryable: bool,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
            retryable: false,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
            retryable: false,
        }),
    )
        .into_response()
}

fn cluster_error(e: ClusterError) -> Response {
    let status = match &e {
        ClusterError::NotLeader { .. } | ClusterError::Unavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ClusterError::Conflict(_) | ClusterError::Refused(_) => StatusCode::CONFLICT,
        ClusterError::Rejected(_) | ClusterError::Membership(_) => StatusCode::BAD_REQUEST,
        ClusterError::State(StateError::NotFound(_)) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(error = %e, %status, "request failed");
    }
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(e.to_string()),
            retryable: e.is_retryable(),
        }),
    )
        .into_response()
}

/// Optional compare-and-swap precondition.
#[derive(Debug, Default, Deserialize)]
pub struct RevisionQuery {
    pub revision: Option<u64>,
}

// ── Instances ──────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub node: Option<String>,
}

/// GET /api/v1/instances
pub async fn list_instances(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Response {
    let listed = match &query.node {
        Some(node) => state.store.list_instances_for_node(node).await,
        None => state.store.list_instances().await,
    };
    match listed {
        Ok(instances) => ApiResponse::ok(instances).into_response(),
        Err(e) => cluster_error(e),
    }
}

/// Instance definition body.
#[derive(Debug, Deserialize)]
pub struct CreateInstance {
    #[serde(default = "default_project")]
    pub project: String,
    pub name: String,
    /// Owning member; defaults to the node serving the request.
    pub node: Option<String>,
    #[serde(default)]
    pub kind: InstanceKind,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub devices: BTreeMap<String, BTreeMap<String, String>>,
}

fn default_project() -> String {
    "default".to_string()
}

fn valid_name(s: &str) -> bool {
    !s.is_empty() && !s.contains('/') && !s.chars().any(char::is_whitespace)
}

/// POST /api/v1/instances
pub async fn create_instance(
    State(state): State<ApiState>,
    Json(req): Json<CreateInstance>,
) -> Response {
    if !valid_name(&req.project) || !valid_name(&req.name) {
        return error_response("invalid project or instance name", StatusCode::BAD_REQUEST);
    }
    let node = req.node.unwrap_or_else(|| state.node.clone());
    let mut record = InstanceRecord::new(&req.project, &req.name, &node);
    record.kind = req.kind;
    record.config = req.config;
    record.devices = req.devices;

    match state.store.create_instance(&record).await {
        Ok(created) => (StatusCode::CREATED, ApiResponse::ok(created)).into_response(),
        Err(e) => cluster_error(e),
    }
}

/// GET /api/v1/instances/{project}/{name}
pub async fn get_instance(
    State(state): State<ApiState>,
    Path((project, name)): Path<(String, String)>,
) -> Response {
    match state.store.get_instance(&project, &name).await {
        Ok(Some(instance)) => ApiResponse::ok(instance).into_response(),
        Ok(None) => error_response("instance not found", StatusCode::NOT_FOUND),
        Err(e) => cluster_error(e),
    }
}

/// DELETE /api/v1/instances/{project}/{name}
pub async fn delete_instance(
    State(state): State<ApiState>,
    Path((project, name)): Path<(String, String)>,
    Query(query): Query<RevisionQuery>,
) -> Response {
    let expected = match query.revision {
        Some(revision) => revision,
        None => match state.store.get_instance(&project, &name).await {
            Ok(Some(current)) => current.revision,
            Ok(None) => return error_response("instance not found", StatusCode::NOT_FOUND),
            Err(e) => return cluster_error(e),
        },
    };
    match state.store.delete_instance(&project, &name, expected).await {
        Ok(()) => ApiResponse::ok("deleted").into_response(),
        Err(e) => cluster_error(e),
    }
}

/// POST /api/v1/instances/{project}/{name}/start
pub async fn start_instance(
    State(state): State<ApiState>,
    Path((project, name)): Path<(String, String)>,
    Query(query): Query<RevisionQuery>,
) -> Response {
    transition(state, InstanceKey::new(project, name), PowerState::Running, query).await
}

/// POST /api/v1/instances/{project}/{name}/stop
pub async fn stop_instance(
    State(state): State<ApiState>,
    Path((project, name)): Path<(String, String)>,
    Query(query): Query<RevisionQuery>,
) -> Response {
    transition(state, InstanceKey::new(project, name), PowerState::Stopped, query).await
}

async fn transition(
    state: ApiState,
    key: InstanceKey,
    target: PowerState,
    query: RevisionQuery,
) -> Response {
    // A named revision is read as committed, even on a lagging replica.
    let current = match query.revision {
        Some(revision) => {
            state
                .store
                .get_instance_at(&key.project, &key.name, revision)
                .await
                .map(Some)
        }
        None => state.store.get_instance(&key.project, &key.name).await,
    };
    let current = match current {
        Ok(Some(current)) => current,
        Ok(None) => return error_response("instance not found", StatusCode::NOT_FOUND),
        Err(e) => return cluster_error(e),
    };
    let expected = current.revision;
    if current.value.power_state == target {
        return ApiResponse::ok(current).into_response();
    }

    // Only the owning node touches the process.
    if let (Some(executor), true) = (&state.executor, current.value.node == state.node) {
        let result = match target {
            PowerState::Running => executor.start(&key).await,
            PowerState::Stopped => {
                let deadline = tokio::time::Instant::now() + state.stop_timeout;
                executor.graceful_stop(&key, deadline).await
            }
        };
        if let Err(e) = result {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    match state
        .store
        .set_power_state(&key.project, &key.name, target, expected)
        .await
    {
        Ok(updated) => {
            info!(instance = %key, power_state = %target, "power state changed");
            ApiResponse::ok(updated).into_response()
        }
        Err(e) => cluster_error(e),
    }
}

// ── Members ────────────────────────────────────────────────────

/// GET /api/v1/members
pub async fn list_members(State(state): State<ApiState>) -> Response {
    match state.store.list_members().await {
        Ok(members) => ApiResponse::ok(members).into_response(),
        Err(e) => cluster_error(e),
    }
}

/// GET /api/v1/members/{name}
pub async fn get_member(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.store.get_member(&name).await {
        Ok(Some(member)) => ApiResponse::ok(member).into_response(),
        Ok(None) => error_response("member not found", StatusCode::NOT_FOUND),
        Err(e) => cluster_error(e),
    }
}

// ── Cluster ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ClusterStatus {
    pub node: String,
    pub raft_id: u64,
    pub leader: Option<u64>,
    pub is_leader: bool,
    /// Highest commit this API session has observed.
    pub commit_index: u64,
    pub last_applied: Option<u64>,
}

/// GET /api/v1/cluster
pub async fn cluster_status(State(state): State<ApiState>) -> Response {
    let last_applied = state
        .store
        .raft()
        .metrics()
        .borrow()
        .last_applied
        .map(|l| l.index);
    ApiResponse::ok(ClusterStatus {
        node: state.node.clone(),
        raft_id: state.store.node_id(),
        leader: state.store.current_leader(),
        is_leader: state.store.is_leader(),
        commit_index: state.store.commit_index(),
        last_applied,
    })
    .into_response()
}

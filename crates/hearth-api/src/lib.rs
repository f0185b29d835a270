//! hearth-api — REST query surface over the replicated store.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/instances` | List instances (`?node=` filters by owner) |
//! | POST | `/api/v1/instances` | Define an instance (stopped) |
//! | GET | `/api/v1/instances/{project}/{name}` | Get one instance with its revision |
//! | DELETE | `/api/v1/instances/{project}/{name}` | Delete a stopped instance |
//! | POST | `/api/v1/instances/{project}/{name}/start` | Start and persist `running` |
//! | POST | `/api/v1/instances/{project}/{name}/stop` | Stop and persist `stopped` |
//! | GET | `/api/v1/members` | List cluster members |
//! | GET | `/api/v1/members/{name}` | Get one member |
//! | GET | `/api/v1/cluster` | Raft view of this node |
//!
//! Conditional writes take an optional `revision`; a stale one answers
//! 409. Lost quorum or leader answers 503 and may be retried.

pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use hearth_lifecycle::RuntimeExecutor;
use hearth_raft::ReplicatedStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: ReplicatedStore,
    /// This node's member name; owner of instances created here.
    pub node: String,
    /// Runs local workloads; without one only records change.
    pub executor: Option<Arc<dyn RuntimeExecutor>>,
    pub stop_timeout: Duration,
}

impl ApiState {
    pub fn new(store: ReplicatedStore, node: impl Into<String>) -> Self {
        Self {
            store,
            node: node.into(),
            executor: None,
            stop_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn RuntimeExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

/// Build the API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route(
            "/instances",
            get(handlers::list_instances).post(handlers::create_instance),
        )
        .route(
            "/instances/{project}/{name}",
            get(handlers::get_instance).delete(handlers::delete_instance),
        )
        .route("/instances/{project}/{name}/start", post(handlers::start_instance))
        .route("/instances/{project}/{name}/stop", post(handlers::stop_instance))
        .route("/members", get(handlers::list_members))
        .route("/members/{name}", get(handlers::get_member))
        .route("/cluster", get(handlers::cluster_status))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}

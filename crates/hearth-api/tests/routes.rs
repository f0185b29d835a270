//! Router tests over a one-node replicated store.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use hearth_api::{ApiState, build_router};
use hearth_lifecycle::{ExecutorError, ProcessStatus, RuntimeExecutor};
use hearth_raft::{
    InProcessRouter, MembershipManager, RaftStorage, ReplicatedStore, raft_config, raft_id_for,
};
use hearth_state::InstanceKey;
use serde_json::{Value, json};
use tokio::time::Instant;
use tower::ServiceExt;

#[derive(Default)]
struct Procs {
    running: Mutex<BTreeSet<InstanceKey>>,
}

#[async_trait]
impl RuntimeExecutor for Procs {
    async fn start(&self, id: &InstanceKey) -> Result<(), ExecutorError> {
        self.running.lock().unwrap().insert(id.clone());
        Ok(())
    }

    async fn graceful_stop(&self, id: &InstanceKey, _: Instant) -> Result<(), ExecutorError> {
        self.running.lock().unwrap().remove(id);
        Ok(())
    }

    async fn kill(&self, id: &InstanceKey) -> Result<(), ExecutorError> {
        self.running.lock().unwrap().remove(id);
        Ok(())
    }

    async fn status(&self, id: &InstanceKey) -> ProcessStatus {
        if self.running.lock().unwrap().contains(id) {
            ProcessStatus::Running
        } else {
            ProcessStatus::Stopped
        }
    }
}

async fn app() -> (Router, Arc<Procs>) {
    let router = InProcessRouter::new();
    let id = raft_id_for("node-1");
    let store = ReplicatedStore::launch(
        id,
        raft_config(50, 150, 300).unwrap(),
        router.network(id),
        RaftStorage::open_in_memory().unwrap(),
    )
    .await
    .unwrap();
    router.register(id, store.raft().clone());
    MembershipManager::new(store.clone())
        .bootstrap("node-1", "node-1")
        .await
        .unwrap();

    let procs = Arc::new(Procs::default());
    let state = ApiState::new(store, "node-1").with_executor(procs.clone());
    (build_router(state), procs)
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn instance_lifecycle_through_the_api() {
    let (app, procs) = app().await;

    let (status, body) = call(&app, "POST", "/api/v1/instances", Some(json!({"name": "web"}))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["value"]["node"], "node-1");
    assert_eq!(body["data"]["value"]["power_state"], "stopped");
    let created_rev = body["data"]["revision"].as_u64().unwrap();

    let (status, body) = call(&app, "POST", "/api/v1/instances/default/web/start", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["value"]["power_state"], "running");
    assert!(procs.running.lock().unwrap().contains(&InstanceKey::new("default", "web")));

    // A stale revision is a conflict and leaves the process alone.
    let uri = format!("/api/v1/instances/default/web/stop?revision={created_rev}");
    let (status, body) = call(&app, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
    assert!(procs.running.lock().unwrap().contains(&InstanceKey::new("default", "web")));

    let (status, _) = call(&app, "DELETE", "/api/v1/instances/default/web", None).await;
    assert_eq!(status, StatusCode::CONFLICT, "running instances cannot be deleted");

    let (status, _) = call(&app, "POST", "/api/v1/instances/default/web/stop", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(procs.running.lock().unwrap().is_empty());

    let (status, _) = call(&app, "DELETE", "/api/v1/instances/default/web", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, "GET", "/api/v1/instances/default/web", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_and_invalid_creates_are_refused() {
    let (app, _) = app().await;

    let body = json!({"project": "prod", "name": "db", "config": {"boot.autostart": "false"}});
    let (status, _) = call(&app, "POST", "/api/v1/instances", Some(body.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = call(&app, "POST", "/api/v1/instances", Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) =
        call(&app, "POST", "/api/v1/instances", Some(json!({"name": "a/b"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn instances_filter_by_node() {
    let (app, _) = app().await;
    call(&app, "POST", "/api/v1/instances", Some(json!({"name": "here"}))).await;
    call(
        &app,
        "POST",
        "/api/v1/instances",
        Some(json!({"name": "there", "node": "node-2"})),
    )
    .await;

    let (_, all) = call(&app, "GET", "/api/v1/instances", None).await;
    assert_eq!(all["data"].as_array().unwrap().len(), 2);
    let (_, mine) = call(&app, "GET", "/api/v1/instances?node=node-2", None).await;
    let mine = mine["data"].as_array().unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0]["value"]["name"], "there");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn members_and_cluster_status() {
    let (app, _) = app().await;

    let (status, body) = call(&app, "GET", "/api/v1/members", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["value"]["name"], "node-1");
    assert_eq!(body["data"][0]["value"]["role"], "voter");

    let (status, _) = call(&app, "GET", "/api/v1/members/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(&app, "GET", "/api/v1/cluster", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["is_leader"], true);
    assert_eq!(body["data"]["raft_id"], raft_id_for("node-1"));
}

//! Reconciler and drain against a one-node replicated store.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hearth_lifecycle::{
    ExecutorError, InstanceSource, ProcessStatus, Reconciler, RuntimeExecutor, SkipReason,
    StoreInstances, drain,
};
use hearth_raft::{
    InProcessRouter, MembershipManager, RaftStorage, ReplicatedStore, raft_config, raft_id_for,
};
use hearth_state::{InstanceKey, InstanceRecord, PowerState};
use tokio::time::Instant;

#[derive(Default)]
struct Table {
    running: Mutex<BTreeSet<InstanceKey>>,
}

#[async_trait]
impl RuntimeExecutor for Table {
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

async fn single_node(name: &str) -> (ReplicatedStore, MembershipManager) {
    let router = InProcessRouter::new();
    let id = raft_id_for(name);
    let store = ReplicatedStore::launch(
        id,
        raft_config(50, 150, 300).unwrap(),
        router.network(id),
        RaftStorage::open_in_memory().unwrap(),
    )
    .await
    .unwrap();
    router.register(id, store.raft().clone());
    let manager = MembershipManager::new(store.clone());
    manager.bootstrap(name, name).await.unwrap();
    (store, manager)
}

async fn create(store: &ReplicatedStore, name: &str, node: &str, state: PowerState) {
    let mut record = InstanceRecord::new("default", name, node);
    record.power_state = state;
    store.create_instance(&record).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn boot_starts_recorded_running_instances_of_this_node() {
    let (store, _manager) = single_node("node-1").await;
    create(&store, "web", "node-1", PowerState::Running).await;
    create(&store, "db", "node-1", PowerState::Stopped).await;
    create(&store, "elsewhere", "node-2", PowerState::Running).await;

    let runtime = Arc::new(Table::default());
    let report = Reconciler::new(runtime.clone())
        .reconcile(&store, "node-1")
        .await
        .unwrap();

    assert_eq!(report.started, vec![InstanceKey::new("default", "web")]);
    assert!(report.failed.is_empty());
    assert_eq!(
        runtime.status(&InstanceKey::new("default", "web")).await,
        ProcessStatus::Running
    );
    assert_eq!(
        runtime.status(&InstanceKey::new("default", "elsewhere")).await,
        ProcessStatus::Stopped
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn evacuated_node_starts_nothing() {
    let (store, manager) = single_node("node-1").await;
    create(&store, "web", "node-1", PowerState::Running).await;
    manager.set_evacuated("node-1", true).await.unwrap();

    let runtime = Arc::new(Table::default());
    let report = Reconciler::new(runtime).reconcile(&store, "node-1").await.unwrap();
    assert!(report.started.is_empty());
    assert_eq!(
        report.skipped,
        vec![(InstanceKey::new("default", "web"), SkipReason::NodeEvacuated)]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drain_leaves_recorded_power_state_running() {
    let (store, _manager) = single_node("node-1").await;
    create(&store, "web", "node-1", PowerState::Running).await;
    create(&store, "api", "node-1", PowerState::Running).await;
    let before = store.commit_index();

    let runtime = Arc::new(Table::default());
    let source = StoreInstances::new(store.clone(), "node-1");
    let instances = source.running_instances().await.unwrap();
    assert_eq!(instances.len(), 2);

    let report = drain(runtime, instances, Duration::from_secs(5)).await;
    assert_eq!(report.stopped.len(), 2);

    store.read_leader().await.unwrap();
    let records = store.list_instances_for_node("node-1").await.unwrap();
    assert!(records.iter().all(|r| r.value.power_state == PowerState::Running));
    assert!(records.iter().all(|r| r.revision <= before));
}

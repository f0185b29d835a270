//! End-to-end lifecycle scenarios against a scripted runtime.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hearth_lifecycle::{
    ControllerConfig, ExecutorError, ExitReason, InstanceSource, LifecycleController,
    LifecycleEvent, ProcessStatus, Reconciler, RuntimeExecutor,
};
use hearth_raft::ClusterResult;
use hearth_state::{InstanceKey, InstanceRecord, PowerState};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Process table where each instance takes a fixed time to stop, or never does.
#[derive(Default)]
struct Host {
    running: Mutex<BTreeSet<InstanceKey>>,
    stop_after: BTreeMap<String, Duration>,
    calls: Mutex<Vec<(String, String, Duration)>>,
    epoch: Mutex<Option<Instant>>,
}

impl Host {
    fn record(&self, action: &str, id: &InstanceKey) {
        let epoch = *self.epoch.lock().unwrap().get_or_insert_with(Instant::now);
        self.calls
            .lock()
            .unwrap()
            .push((action.to_string(), id.name.clone(), epoch.elapsed()));
    }

    fn calls(&self, action: &str) -> Vec<(String, Duration)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _, _)| a == action)
            .map(|(_, name, at)| (name.clone(), *at))
            .collect()
    }
}

#[async_trait]
impl RuntimeExecutor for Host {
    async fn start(&self, id: &InstanceKey) -> Result<(), ExecutorError> {
        self.record("start", id);
        self.running.lock().unwrap().insert(id.clone());
        Ok(())
    }

    async fn graceful_stop(&self, id: &InstanceKey, _deadline: Instant) -> Result<(), ExecutorError> {
        self.record("stop", id);
        match self.stop_after.get(&id.name) {
            Some(after) => {
                tokio::time::sleep(*after).await;
                self.running.lock().unwrap().remove(id);
                Ok(())
            }
            None => std::future::pending().await,
        }
    }

    async fn kill(&self, id: &InstanceKey) -> Result<(), ExecutorError> {
        self.record("kill", id);
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

/// Recorded state of one node; drained instances stay recorded as running.
struct Records(Vec<InstanceRecord>);

#[async_trait]
impl InstanceSource for Records {
    async fn running_instances(&self) -> ClusterResult<Vec<InstanceKey>> {
        Ok(self
            .0
            .iter()
            .filter(|r| r.power_state == PowerState::Running)
            .map(|r| r.key())
            .collect())
    }
}

fn running(name: &str) -> InstanceRecord {
    let mut r = InstanceRecord::new("default", name, "node-1");
    r.power_state = PowerState::Running;
    r
}

fn names(keys: &[InstanceKey]) -> Vec<&str> {
    keys.iter().map(|k| k.name.as_str()).collect()
}

#[tokio::test(start_paused = true)]
async fn host_shutdown_kills_the_unresponsive_instance_at_the_deadline() {
    let host = Arc::new(Host {
        stop_after: BTreeMap::from([
            ("a".to_string(), Duration::from_secs(5)),
            ("b".to_string(), Duration::from_secs(5)),
        ]),
        ..Default::default()
    });
    let records = Arc::new(Records(vec![running("a"), running("b"), running("c")]));
    for r in &records.0 {
        host.running.lock().unwrap().insert(r.key());
    }

    let controller = LifecycleController::new(
        host.clone(),
        records.clone(),
        ControllerConfig {
            drain_timeout: Duration::from_secs(30),
            memory_profile_path: None,
        },
    );
    let mut accepting = controller.shutdown_signal();
    let (tx, rx) = mpsc::channel(8);

    let start = Instant::now();
    let run = tokio::spawn(controller.run(rx));
    tx.send(LifecycleEvent::HostShutdown).await.unwrap();
    // Repeats and restarts while draining change nothing.
    tx.send(LifecycleEvent::HostShutdown).await.unwrap();
    tx.send(LifecycleEvent::Quiesce).await.unwrap();

    let reason = run.await.unwrap();
    assert_eq!(start.elapsed(), Duration::from_secs(30));
    assert!(*accepting.borrow_and_update());

    let ExitReason::Drained(report) = reason else {
        panic!("expected a drain, got {reason:?}");
    };
    assert!(report.timed_out);
    assert_eq!(names(&report.stopped), vec!["a", "b"]);
    assert_eq!(names(&report.killed), vec!["c"]);

    assert_eq!(host.calls("stop").len(), 3, "one stop per instance");
    assert_eq!(host.calls("kill"), vec![("c".to_string(), Duration::from_secs(30))]);

    // The store still says running for all three.
    assert!(records.0.iter().all(|r| r.power_state == PowerState::Running));
    assert!(host.running.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reboot_after_drain_restarts_every_instance_once() {
    let host = Arc::new(Host {
        stop_after: BTreeMap::from([("a".to_string(), Duration::from_secs(1))]),
        ..Default::default()
    });
    let records = Arc::new(Records(vec![running("a"), running("b"), running("c")]));
    for r in &records.0 {
        host.running.lock().unwrap().insert(r.key());
    }

    let controller =
        LifecycleController::new(host.clone(), records.clone(), ControllerConfig::default());
    let (tx, rx) = mpsc::channel(4);
    tx.send(LifecycleEvent::HostShutdown).await.unwrap();
    let reason = controller.run(rx).await;
    assert!(matches!(reason, ExitReason::Drained(_)));
    assert!(host.running.lock().unwrap().is_empty());

    // Next boot.
    let report = Reconciler::new(host.clone())
        .reconcile_records(records.0.clone(), false)
        .await;
    assert_eq!(names(&report.started), vec!["a", "b", "c"]);
    assert_eq!(host.calls("start").len(), 3);
    for r in &records.0 {
        assert_eq!(host.status(&r.key()).await, ProcessStatus::Running);
    }
}

#[tokio::test(start_paused = true)]
async fn quiesce_leaves_workloads_alone() {
    let host = Arc::new(Host::default());
    let records = Arc::new(Records(vec![running("a")]));
    host.running.lock().unwrap().insert(records.0[0].key());

    let controller =
        LifecycleController::new(host.clone(), records.clone(), ControllerConfig::default());
    let accepting = controller.shutdown_signal();
    let (tx, rx) = mpsc::channel(4);
    tx.send(LifecycleEvent::Quiesce).await.unwrap();

    assert_eq!(controller.run(rx).await, ExitReason::Quiesced);
    assert!(*accepting.borrow());
    assert!(host.calls.lock().unwrap().is_empty());
    assert_eq!(host.status(&records.0[0].key()).await, ProcessStatus::Running);
}

#[tokio::test]
async fn diagnostic_dumps_without_changing_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memory.json");
    let host = Arc::new(Host::default());
    let controller = LifecycleController::new(
        host,
        Arc::new(Records(Vec::new())),
        ControllerConfig {
            memory_profile_path: Some(path.clone()),
            ..Default::default()
        },
    );
    let accepting = controller.shutdown_signal();
    let (tx, rx) = mpsc::channel(4);
    tx.send(LifecycleEvent::Diagnostic).await.unwrap();
    drop(tx);

    // Closing the channel while running quiesces.
    assert_eq!(controller.run(rx).await, ExitReason::Quiesced);
    let dump: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(dump["state"], "running");
    assert!(*accepting.borrow());
}

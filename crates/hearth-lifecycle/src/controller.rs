//! Lifecycle signal controller.
//!
//! Consumes lifecycle events one at a time, feeds them through the pure
//! state machine and carries out the resulting actions until the machine
//! reaches `Exiting`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hearth_raft::{ClusterResult, ReplicatedStore};
use hearth_state::{InstanceKey, PowerState};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::diagnostics::{MemoryProfile, write_profile};
use crate::drain::{DEFAULT_DRAIN_TIMEOUT, DrainReport, drain};
use crate::executor::RuntimeExecutor;
use crate::machine::{Action, LifecycleEvent, LifecycleState, step};

/// Where the controller learns which workloads to drain.
#[async_trait]
pub trait InstanceSource: Send + Sync + 'static {
    /// Instances on this node whose recorded power state is running.
    async fn running_instances(&self) -> ClusterResult<Vec<InstanceKey>>;
}

/// Reads running instances of one node from the replicated store.
pub struct StoreInstances {
    store: ReplicatedStore,
    node: String,
}

impl StoreInstances {
    pub fn new(store: ReplicatedStore, node: impl Into<String>) -> Self {
        Self {
            store,
            node: node.into(),
        }
    }
}

#[async_trait]
impl InstanceSource for StoreInstances {
    async fn running_instances(&self) -> ClusterResult<Vec<InstanceKey>> {
        Ok(self
            .store
            .list_instances_for_node(&self.node)
            .await?
            .into_iter()
            .filter(|v| v.value.power_state == PowerState::Running)
            .map(|v| v.value.key())
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub drain_timeout: Duration,
    pub memory_profile_path: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            memory_profile_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Daemon exited and left workloads running.
    Quiesced,
    /// Workloads were drained before exit.
    Drained(DrainReport),
}

enum Wake {
    Event(LifecycleEvent),
    Closed,
    Drained(Result<DrainReport, JoinError>),
}

pub struct LifecycleController {
    executor: Arc<dyn RuntimeExecutor>,
    source: Arc<dyn InstanceSource>,
    config: ControllerConfig,
    state: LifecycleState,
    shutdown_tx: watch::Sender<bool>,
}

impl LifecycleController {
    pub fn new(
        executor: Arc<dyn RuntimeExecutor>,
        source: Arc<dyn InstanceSource>,
        config: ControllerConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            executor,
            source,
            config,
            state: LifecycleState::Running,
            shutdown_tx,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Flips to `true` when the API server should stop accepting.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Run until the state machine exits.
    ///
    /// If every sender is dropped while running, the controller quiesces.
    pub async fn run(mut self, mut events: mpsc::Receiver<LifecycleEvent>) -> ExitReason {
        let mut drain_task: Option<JoinHandle<DrainReport>> = None;
        let mut report: Option<DrainReport> = None;
        let mut events_open = true;

        loop {
            let wake = tokio::select! {
                ev = events.recv(), if events_open => match ev {
                    Some(ev) => Wake::Event(ev),
                    None => Wake::Closed,
                },
                joined = wait_drain(&mut drain_task) => Wake::Drained(joined),
            };

            let event = match wake {
                Wake::Event(ev) => ev,
                Wake::Closed => {
                    events_open = false;
                    if self.state != LifecycleState::Running {
                        continue;
                    }
                    debug!("event channel closed, quiescing");
                    LifecycleEvent::Quiesce
                }
                Wake::Drained(joined) => {
                    drain_task = None;
                    let finished = joined.unwrap_or_else(|e| {
                        error!(error = %e, "drain task failed");
                        DrainReport {
                            timed_out: true,
                            ..DrainReport::default()
                        }
                    });
                    let timed_out = finished.timed_out;
                    report = Some(finished);
                    LifecycleEvent::DrainFinished { timed_out }
                }
            };

            let transition = step(self.state, event);
            if transition.next == self.state && transition.actions.is_empty() {
                debug!(state = %self.state, ?event, "event ignored");
                continue;
            }
            info!(from = %self.state, to = %transition.next, ?event, "lifecycle transition");
            self.state = transition.next;

            for action in transition.actions {
                match action {
                    Action::StopAccepting => {
                        self.shutdown_tx.send_replace(true);
                    }
                    Action::BeginDrain => {
                        drain_task = Some(self.begin_drain().await);
                    }
                    Action::DumpMemoryProfile => self.dump_memory_profile(),
                    Action::Exit => {
                        return match report.take() {
                            Some(r) => ExitReason::Drained(r),
                            None => ExitReason::Quiesced,
                        };
                    }
                }
            }
        }
    }

    async fn begin_drain(&self) -> JoinHandle<DrainReport> {
        let instances = match self.source.running_instances().await {
            Ok(instances) => instances,
            Err(e) => {
                error!(error = %e, "cannot list running instances, draining none");
                Vec::new()
            }
        };
        tokio::spawn(drain(
            Arc::clone(&self.executor),
            instances,
            self.config.drain_timeout,
        ))
    }

    fn dump_memory_profile(&self) {
        let Some(path) = &self.config.memory_profile_path else {
            warn!("diagnostic requested but no memory profile path configured");
            return;
        };
        let profile = MemoryProfile::capture(self.state);
        match write_profile(path, &profile) {
            Ok(()) => info!(path = %path.display(), "memory profile written"),
            Err(e) => error!(path = %path.display(), error = %e, "memory profile failed"),
        }
    }
}

async fn wait_drain(task: &mut Option<JoinHandle<DrainReport>>) -> Result<DrainReport, JoinError> {
    match task.as_mut() {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

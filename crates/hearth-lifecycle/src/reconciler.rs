//! Startup reconciler — bring processes back in line with recorded state.
//!
//! Only the "should run but does not" direction is corrected. An instance
//! recorded as stopped whose process is found running is reported as a
//! stray and left alone.

use std::sync::Arc;
use std::time::Duration;

use hearth_raft::{ClusterResult, ReplicatedStore};
use hearth_state::{InstanceKey, InstanceRecord, MemberState, PowerState};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::executor::{ExecutorError, ProcessStatus, RuntimeExecutor};

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Instances reconciled at the same time.
    pub concurrency: usize,
    pub start_attempts: u32,
    pub retry_delay: Duration,
    /// Time box for a single start call.
    pub start_timeout: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            start_attempts: 3,
            retry_delay: Duration::from_secs(5),
            start_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyRunning,
    AutostartDisabled,
    StartProtected,
    NodeEvacuated,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub started: Vec<InstanceKey>,
    pub skipped: Vec<(InstanceKey, SkipReason)>,
    pub failed: Vec<(InstanceKey, String)>,
    /// Recorded stopped but found running.
    pub strays: Vec<InstanceKey>,
}

enum Verdict {
    Started,
    Skipped(SkipReason),
    Failed(String),
    Stray,
    Settled,
}

pub struct Reconciler {
    executor: Arc<dyn RuntimeExecutor>,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(executor: Arc<dyn RuntimeExecutor>) -> Self {
        Self {
            executor,
            config: ReconcileConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ReconcileConfig) -> Self {
        self.config = config;
        self
    }

    /// Reconcile every instance owned by `node` in the replicated store.
    pub async fn reconcile(
        &self,
        store: &ReplicatedStore,
        node: &str,
    ) -> ClusterResult<ReconcileReport> {
        let evacuated = store
            .get_member(node)
            .await?
            .is_some_and(|m| m.value.state == MemberState::Evacuated);
        let records = store
            .list_instances_for_node(node)
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect();
        Ok(self.reconcile_records(records, evacuated).await)
    }

    /// Reconcile an explicit set of records.
    pub async fn reconcile_records(
        &self,
        records: Vec<InstanceRecord>,
        evacuated: bool,
    ) -> ReconcileReport {
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        info!(instances = records.len(), evacuated, "reconciliation started");

        for record in records {
            let permits = Arc::clone(&permits);
            let executor = Arc::clone(&self.executor);
            let config = self.config.clone();
            tasks.spawn(async move {
                let key = record.key();
                let verdict = match permits.acquire_owned().await {
                    Ok(_permit) => reconcile_one(executor.as_ref(), &config, &record, evacuated).await,
                    Err(e) => Verdict::Failed(format!("reconciler closed: {e}")),
                };
                (key, verdict)
            });
        }

        let mut report = ReconcileReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, Verdict::Started)) => report.started.push(key),
                Ok((key, Verdict::Skipped(reason))) => report.skipped.push((key, reason)),
                Ok((key, Verdict::Failed(err))) => report.failed.push((key, err)),
                Ok((key, Verdict::Stray)) => report.strays.push(key),
                Ok((_, Verdict::Settled)) => {}
                Err(e) => error!(error = %e, "reconcile task failed"),
            }
        }

        report.started.sort();
        report.skipped.sort();
        report.failed.sort();
        report.strays.sort();
        info!(
            started = report.started.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            strays = report.strays.len(),
            "reconciliation finished"
        );
        report
    }
}

async fn reconcile_one(
    executor: &dyn RuntimeExecutor,
    config: &ReconcileConfig,
    record: &InstanceRecord,
    evacuated: bool,
) -> Verdict {
    let key = record.key();

    if record.power_state == PowerState::Stopped {
        if executor.status(&key).await == ProcessStatus::Running {
            warn!(instance = %key, "recorded stopped but running, leaving it alone");
            return Verdict::Stray;
        }
        return Verdict::Settled;
    }

    if evacuated {
        return Verdict::Skipped(SkipReason::NodeEvacuated);
    }
    if record.autostart_disabled() {
        debug!(instance = %key, "boot autostart disabled");
        return Verdict::Skipped(SkipReason::AutostartDisabled);
    }
    if record.start_protected() {
        debug!(instance = %key, "start protection set");
        return Verdict::Skipped(SkipReason::StartProtected);
    }
    if executor.status(&key).await == ProcessStatus::Running {
        return Verdict::Skipped(SkipReason::AlreadyRunning);
    }

    let attempts = config.start_attempts.max(1);
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        let result = match tokio::time::timeout(config.start_timeout, executor.start(&key)).await {
            Ok(r) => r,
            Err(_) => Err(ExecutorError::Timeout {
                action: "start",
                instance: key.to_string(),
            }),
        };
        match result {
            Ok(()) => {
                info!(instance = %key, attempt, "instance started");
                return Verdict::Started;
            }
            Err(e) => {
                warn!(instance = %key, attempt, error = %e, "start failed");
                last_error = e.to_string();
            }
        }
        if attempt < attempts {
            tokio::time::sleep(config.retry_delay).await;
        }
    }
    error!(instance = %key, attempts, "giving up on instance");
    Verdict::Failed(last_error)
}

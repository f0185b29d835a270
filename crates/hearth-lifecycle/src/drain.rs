//! Drain engine — stop every workload under one shared countdown.
//!
//! All graceful stops are issued at once. A stop that fails early is
//! escalated to a kill straight away; anything still unconfirmed when the
//! countdown expires is killed in a single concurrent sweep. Kills are cut
//! off [`KILL_GRACE`] after the countdown, so the drain always returns by
//! then. The drain
//! never writes to a store: recorded power states stay `running`, so the
//! next boot's reconciliation restarts the same workloads.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use hearth_state::InstanceKey;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::executor::{ExecutorError, RuntimeExecutor};

/// Default drain countdown.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on a single kill.
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// No kill outlives the countdown by more than this.
pub const KILL_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Stopped gracefully before the deadline.
    pub stopped: Vec<InstanceKey>,
    /// Forcibly killed, either after a failed stop or at the deadline.
    pub killed: Vec<InstanceKey>,
    pub kill_failed: Vec<(InstanceKey, String)>,
    /// Whether the countdown expired with stops still pending.
    pub timed_out: bool,
}

async fn kill_one(
    executor: Arc<dyn RuntimeExecutor>,
    id: InstanceKey,
    cutoff: Instant,
) -> (InstanceKey, Result<(), ExecutorError>) {
    let until = cutoff.min(Instant::now() + KILL_TIMEOUT);
    let result = match tokio::time::timeout_at(until, executor.kill(&id)).await {
        Ok(r) => r,
        Err(_) => Err(ExecutorError::Timeout {
            action: "kill",
            instance: id.to_string(),
        }),
    };
    (id, result)
}

/// Drain `instances`, returning once each is stopped or killed.
pub async fn drain(
    executor: Arc<dyn RuntimeExecutor>,
    instances: Vec<InstanceKey>,
    timeout: Duration,
) -> DrainReport {
    let deadline = Instant::now() + timeout;
    let cutoff = deadline + KILL_GRACE;
    let mut report = DrainReport::default();
    info!(instances = instances.len(), ?timeout, "drain started");

    let mut pending: BTreeSet<InstanceKey> = instances.iter().cloned().collect();
    let mut stops = JoinSet::new();
    for id in instances {
        let executor = Arc::clone(&executor);
        stops.spawn(async move {
            let result = executor.graceful_stop(&id, deadline).await;
            (id, result)
        });
    }
    let mut kills = JoinSet::new();

    let countdown = tokio::time::sleep_until(deadline);
    tokio::pin!(countdown);

    while !stops.is_empty() {
        tokio::select! {
            joined = stops.join_next() => match joined {
                Some(Ok((id, Ok(())))) => {
                    debug!(instance = %id, "stopped gracefully");
                    pending.remove(&id);
                    report.stopped.push(id);
                }
                Some(Ok((id, Err(e)))) => {
                    warn!(instance = %id, error = %e, "graceful stop failed, killing");
                    pending.remove(&id);
                    kills.spawn(kill_one(Arc::clone(&executor), id, cutoff));
                }
                Some(Err(e)) => {
                    // The instance stays pending and is killed below.
                    error!(error = %e, "stop task failed");
                }
                None => break,
            },
            _ = &mut countdown => {
                report.timed_out = true;
                warn!(pending = pending.len(), "drain countdown expired, killing stragglers");
                stops.abort_all();
                break;
            }
        }
    }

    for id in std::mem::take(&mut pending) {
        kills.spawn(kill_one(Arc::clone(&executor), id, cutoff));
    }

    while let Some(joined) = kills.join_next().await {
        match joined {
            Ok((id, Ok(()))) => {
                info!(instance = %id, "instance killed");
                report.killed.push(id);
            }
            Ok((id, Err(e))) => {
                error!(instance = %id, error = %e, "kill failed");
                report.kill_failed.push((id, e.to_string()));
            }
            Err(e) => error!(error = %e, "kill task failed"),
        }
    }

    report.stopped.sort();
    report.killed.sort();
    info!(
        stopped = report.stopped.len(),
        killed = report.killed.len(),
        kill_failed = report.kill_failed.len(),
        timed_out = report.timed_out,
        "drain finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ProcessStatus;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Stops `fast` after a second, fails `broken` at once and `late` just
    /// before a 10s countdown (whose kill then hangs), hangs on the rest.
    #[derive(Default)]
    struct Scripted {
        kills: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RuntimeExecutor for Scripted {
        async fn start(&self, _id: &InstanceKey) -> Result<(), ExecutorError> {
            Ok(())
        }

        async fn graceful_stop(
            &self,
            id: &InstanceKey,
            _deadline: Instant,
        ) -> Result<(), ExecutorError> {
            match id.name.as_str() {
                "fast" => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok(())
                }
                "late" => {
                    tokio::time::sleep(Duration::from_millis(9_500)).await;
                    Err(ExecutorError::Failed {
                        action: "stop",
                        instance: id.to_string(),
                        code: Some(1),
                        stderr: "refused".into(),
                    })
                }
                "broken" => Err(ExecutorError::Failed {
                    action: "stop",
                    instance: id.to_string(),
                    code: Some(1),
                    stderr: "refused".into(),
                }),
                _ => std::future::pending().await,
            }
        }

        async fn kill(&self, id: &InstanceKey) -> Result<(), ExecutorError> {
            self.kills.lock().unwrap().push(id.name.clone());
            if id.name == "late" {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn status(&self, _id: &InstanceKey) -> ProcessStatus {
            ProcessStatus::Unknown
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_drain_finishes_immediately() {
        let exec = Arc::new(Scripted::default());
        let start = Instant::now();
        let report = drain(exec, Vec::new(), DEFAULT_DRAIN_TIMEOUT).await;
        assert_eq!(report, DrainReport::default());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_stop_is_killed_before_the_deadline() {
        let exec = Arc::new(Scripted::default());
        let start = Instant::now();
        let report = drain(
            exec.clone(),
            vec![InstanceKey::new("p", "fast"), InstanceKey::new("p", "broken")],
            Duration::from_secs(30),
        )
        .await;
        assert!(!report.timed_out);
        assert_eq!(report.stopped, vec![InstanceKey::new("p", "fast")]);
        assert_eq!(report.killed, vec![InstanceKey::new("p", "broken")]);
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert_eq!(*exec.kills.lock().unwrap(), vec!["broken".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn stragglers_are_killed_together_at_the_deadline() {
        let exec = Arc::new(Scripted::default());
        let start = Instant::now();
        let report = drain(
            exec.clone(),
            vec![
                InstanceKey::new("p", "hung-a"),
                InstanceKey::new("p", "fast"),
                InstanceKey::new("p", "hung-b"),
            ],
            Duration::from_secs(10),
        )
        .await;
        assert!(report.timed_out);
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert_eq!(
            report.killed,
            vec![InstanceKey::new("p", "hung-a"), InstanceKey::new("p", "hung-b")]
        );
        let mut kills = exec.kills.lock().unwrap().clone();
        kills.sort();
        assert_eq!(kills, vec!["hung-a".to_string(), "hung-b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn late_kill_is_cut_off_just_after_the_countdown() {
        let exec = Arc::new(Scripted::default());
        let start = Instant::now();
        let report = drain(
            exec.clone(),
            vec![InstanceKey::new("p", "late")],
            Duration::from_secs(10),
        )
        .await;
        assert_eq!(start.elapsed(), Duration::from_secs(10) + KILL_GRACE);
        assert!(report.killed.is_empty());
        assert_eq!(report.kill_failed.len(), 1);
        assert_eq!(report.kill_failed[0].0, InstanceKey::new("p", "late"));
    }
}

//! Runtime executor — the seam to whatever actually runs workloads.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use hearth_state::InstanceKey;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::debug;

/// Observed process state of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Stopped,
    Unknown,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("{action} {instance} failed (exit {code:?}): {stderr}")]
    Failed {
        action: &'static str,
        instance: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{action} {instance} timed out")]
    Timeout {
        action: &'static str,
        instance: String,
    },
}

/// Starts, stops and inspects workload processes.
#[async_trait]
pub trait RuntimeExecutor: Send + Sync + 'static {
    async fn start(&self, id: &InstanceKey) -> Result<(), ExecutorError>;

    /// Ask the workload to stop; it should be gone by `deadline`.
    async fn graceful_stop(&self, id: &InstanceKey, deadline: Instant)
    -> Result<(), ExecutorError>;

    async fn kill(&self, id: &InstanceKey) -> Result<(), ExecutorError>;

    async fn status(&self, id: &InstanceKey) -> ProcessStatus;
}

/// Executor backed by an external helper program.
///
/// Invoked as `<program> start|stop|kill|status <project/name>`; `stop`
/// additionally receives `--timeout <secs>`. For `status`, exit code 0
/// means running and 1 means stopped.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: PathBuf,
    status_timeout: Duration,
}

impl CommandExecutor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            status_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_status_timeout(mut self, timeout: Duration) -> Self {
        self.status_timeout = timeout;
        self
    }

    fn command(&self, action: &str, id: &InstanceKey) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(action)
            .arg(id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(
        &self,
        action: &'static str,
        id: &InstanceKey,
        mut cmd: Command,
    ) -> Result<(), ExecutorError> {
        debug!(program = %self.program.display(), action, instance = %id, "invoking runtime helper");
        let output = cmd.output().await.map_err(|e| ExecutorError::Spawn {
            program: self.program.display().to_string(),
            reason: e.to_string(),
        })?;
        if output.status.success() {
            return Ok(());
        }
        Err(ExecutorError::Failed {
            action,
            instance: id.to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl RuntimeExecutor for CommandExecutor {
    async fn start(&self, id: &InstanceKey) -> Result<(), ExecutorError> {
        self.run("start", id, self.command("start", id)).await
    }

    async fn graceful_stop(
        &self,
        id: &InstanceKey,
        deadline: Instant,
    ) -> Result<(), ExecutorError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let mut cmd = self.command("stop", id);
        cmd.arg("--timeout").arg(remaining.as_secs().to_string());
        match tokio::time::timeout_at(deadline, self.run("stop", id, cmd)).await {
            Ok(result) => result,
            Err(_) => Err(ExecutorError::Timeout {
                action: "stop",
                instance: id.to_string(),
            }),
        }
    }

    async fn kill(&self, id: &InstanceKey) -> Result<(), ExecutorError> {
        self.run("kill", id, self.command("kill", id)).await
    }

    async fn status(&self, id: &InstanceKey) -> ProcessStatus {
        let mut cmd = self.command("status", id);
        let status = match tokio::time::timeout(self.status_timeout, cmd.status()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                debug!(instance = %id, error = %e, "status helper failed to spawn");
                return ProcessStatus::Unknown;
            }
            Err(_) => return ProcessStatus::Unknown,
        };
        match status.code() {
            Some(0) => ProcessStatus::Running,
            Some(1) => ProcessStatus::Stopped,
            _ => ProcessStatus::Unknown,
        }
    }
}

//! Process-scoped daemon context.
//!
//! Built once boot has applied every repair patch, owned by the run loop
//! and torn down when the lifecycle controller exits.

use std::sync::Arc;
use std::time::Duration;

use hearth_lifecycle::RuntimeExecutor;
use hearth_raft::ReplicatedStore;
use hearth_state::{LocalStore, NodeIdentity};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::DaemonConfig;

const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

pub struct DaemonContext {
    pub config: DaemonConfig,
    pub identity: NodeIdentity,
    pub local: LocalStore,
    pub store: ReplicatedStore,
    pub executor: Arc<dyn RuntimeExecutor>,
    pub(crate) cluster_server: JoinHandle<()>,
    pub(crate) cluster_shutdown: watch::Sender<bool>,
}

impl DaemonContext {
    pub fn node_name(&self) -> &str {
        &self.identity.name
    }

    /// Stop consensus and the cluster listener, then wait for the cluster
    /// database to close so the data dir can be reopened.
    pub async fn shutdown(self) {
        let database = self.store.reader().downgrade();
        if let Err(e) = self.store.shutdown().await {
            warn!(error = %e, "raft shutdown failed");
        }
        self.cluster_shutdown.send_replace(true);
        if tokio::time::timeout(SHUTDOWN_WAIT, self.cluster_server)
            .await
            .is_err()
        {
            warn!("cluster server did not stop in time");
        }
        drop(self.store);

        // Raft workers drop their storage handles after shutdown returns.
        let released = async {
            while database.strong_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_WAIT, released).await.is_err() {
            warn!("cluster database still open after shutdown");
        }
        info!(node = %self.identity.name, "daemon context torn down");
    }
}

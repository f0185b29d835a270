//! Boot sequence and run loop.
//!
//! local repair → Local Store → identity → raft + cluster server →
//! bootstrap or join → global repair → context → reconcile → API →
//! lifecycle controller → teardown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use hearth_api::{ApiState, build_router};
use hearth_lifecycle::{
    ExitReason, LifecycleController, LifecycleEvent, Reconciler, RuntimeExecutor, StoreInstances,
};
use hearth_raft::network::{JoinRequest, request_join};
use hearth_raft::{
    HttpForwarder, HttpNetworkFactory, MembershipManager, RaftStorage, ReplicatedStore,
    raft_config, raft_id_for, raft_router,
};
use hearth_state::local::KEY_HTTPS_ADDRESS;
use hearth_state::{
    LocalStore, MemberRecord, NodeIdentity, PatchLoader, PatchOutcome, PatchTarget,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::config::DaemonConfig;
use crate::context::DaemonContext;

const JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// A booted daemon, ready to serve.
pub struct Daemon {
    pub context: DaemonContext,
    pub cluster_addr: SocketAddr,
}

/// Current hostname, used as the default member name.
pub fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for writes of buf.len() bytes.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..end].to_vec())
        .ok()
        .filter(|s| !s.is_empty())
}

fn resolve_identity(local: &LocalStore, configured: Option<&str>) -> anyhow::Result<NodeIdentity> {
    if let Some(stored) = local.identity()? {
        if let Some(name) = configured {
            if name != stored.name {
                bail!(
                    "data directory belongs to node {}, configuration names {name}",
                    stored.name
                );
            }
        }
        return Ok(stored);
    }

    let name = configured
        .map(str::to_string)
        .or_else(hostname)
        .ok_or_else(|| anyhow!("node name not configured and hostname unavailable"))?;
    let identity = NodeIdentity {
        raft_id: raft_id_for(&name),
        name,
    };
    local.set_identity(&identity)?;
    info!(node = %identity.name, raft_id = identity.raft_id, "node identity created");
    Ok(identity)
}

async fn join_cluster(
    config: &DaemonConfig,
    request: &JoinRequest,
) -> anyhow::Result<MemberRecord> {
    let attempts = config.cluster.max_attempts.max(1);
    let delay = Duration::from_millis(config.cluster.leader_discovery_delay_ms);
    for attempt in 1..=attempts {
        for seed in &config.cluster.join {
            match request_join(seed, request, JOIN_TIMEOUT).await {
                Ok(Ok(record)) => {
                    info!(%seed, role = ?record.role, "joined cluster");
                    return Ok(record);
                }
                Ok(Err(reason)) => warn!(%seed, attempt, %reason, "join refused"),
                Err(e) => warn!(%seed, attempt, error = %e, "seed unreachable"),
            }
        }
        tokio::time::sleep(delay).await;
    }
    bail!("no seed admitted {} after {attempts} attempts", request.name)
}

async fn form_or_join(
    config: &DaemonConfig,
    store: &ReplicatedStore,
    membership: &MembershipManager,
    identity: &NodeIdentity,
    advertise: &str,
) -> anyhow::Result<()> {
    let initialized = store
        .raft()
        .is_initialized()
        .await
        .map_err(|e| anyhow!("raft: {e}"))?;
    if initialized {
        info!(node = %identity.name, "resuming cluster membership");
        return Ok(());
    }

    if !config.cluster.join.is_empty() {
        let request = JoinRequest {
            name: identity.name.clone(),
            address: advertise.to_string(),
        };
        join_cluster(config, &request).await?;
        store
            .raft()
            .wait(Some(Duration::from_millis(config.cluster.read_wait_ms)))
            .metrics(|m| m.current_leader.is_some(), "leader known after join")
            .await
            .map_err(|e| anyhow!("joined but no leader visible: {e}"))?;
    } else if config.cluster.bootstrap {
        membership.bootstrap(&identity.name, advertise).await?;
    } else {
        warn!(node = %identity.name, "not a cluster member and no seeds configured");
    }
    Ok(())
}

/// Bring the node up to the point where it can serve.
///
/// Fails if either repair patch fails; the patch file is then kept.
pub async fn boot(config: DaemonConfig, executor: Arc<dyn RuntimeExecutor>) -> anyhow::Result<Daemon> {
    info!(data_dir = %config.node.data_dir.display(), "hearthd starting");
    std::fs::create_dir_all(config.database_dir())
        .with_context(|| format!("create {}", config.database_dir().display()))?;
    let loader = PatchLoader::new(&config.node.data_dir);

    // ── Local store ──────────────────────────────────────────────
    // The local patch commits ahead of any schema update.
    let (local, outcome) = loader
        .open_local(&config.local_db_path())
        .context("local repair patch failed")?;
    if let Some(backup) = local.backup() {
        info!(backup = %backup.display(), "local database upgraded");
    }
    if outcome != PatchOutcome::Absent {
        info!(?outcome, "local repair patch done");
    }
    let identity = resolve_identity(&local, config.node.name.as_deref())?;
    local.set_config(KEY_HTTPS_ADDRESS, &config.network.api_listen)?;

    // ── Raft ─────────────────────────────────────────────────────
    let storage = RaftStorage::open(&config.cluster_db_path())?;
    if let Some(backup) = &storage.backup {
        info!(backup = %backup.display(), "cluster database upgraded");
    }
    let raft_cfg = raft_config(
        config.cluster.heartbeat_interval_ms,
        config.cluster.election_timeout_min_ms,
        config.cluster.election_timeout_max_ms,
    )?;
    let store = ReplicatedStore::launch(
        identity.raft_id,
        raft_cfg,
        HttpNetworkFactory::new(Duration::from_millis(config.cluster.rpc_timeout_ms)),
        storage,
    )
    .await?
    .with_forwarder(Arc::new(HttpForwarder::new(Duration::from_millis(
        config.cluster.write_timeout_ms,
    ))))
    .with_config(config.store_config());
    let membership =
        Arc::new(MembershipManager::new(store.clone()).with_max_voters(config.cluster.max_voters));

    // ── Cluster server ───────────────────────────────────────────
    let listener = TcpListener::bind(&config.network.cluster_listen)
        .await
        .with_context(|| format!("bind cluster listener {}", config.network.cluster_listen))?;
    let cluster_addr = listener.local_addr()?;
    let (cluster_shutdown, mut cluster_stop) = watch::channel(false);
    let app = raft_router(store.raft().clone(), Some(Arc::clone(&membership)));
    let cluster_server = tokio::spawn(async move {
        let stopped = async move {
            let _ = cluster_stop.wait_for(|stop| *stop).await;
        };
        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(stopped).await {
            error!(error = %e, "cluster server error");
        }
    });
    info!(%cluster_addr, "cluster server listening");

    let context = DaemonContext {
        config,
        identity,
        local,
        store,
        executor,
        cluster_server,
        cluster_shutdown,
    };
    if let Err(e) = join_and_repair(&context, &membership, &loader, cluster_addr).await {
        drop(membership);
        context.shutdown().await;
        return Err(e);
    }

    Ok(Daemon {
        context,
        cluster_addr,
    })
}

async fn join_and_repair(
    ctx: &DaemonContext,
    membership: &MembershipManager,
    loader: &PatchLoader,
    cluster_addr: SocketAddr,
) -> anyhow::Result<()> {
    let advertise = ctx.config.advertise_address(cluster_addr);
    form_or_join(&ctx.config, &ctx.store, membership, &ctx.identity, &advertise).await?;

    // ── Global repair, before any other traffic ─────────────────
    // Runs after the cluster schema is open: the patch is a replicated
    // write and needs a formed cluster to commit.
    if let Some(patch) = loader.load(PatchTarget::Global)? {
        let outcome = ctx
            .store
            .apply_patch(&patch)
            .await
            .context("global repair patch failed")?;
        loader.complete(&patch, &outcome)?;
    }
    Ok(())
}

impl Daemon {
    /// Reconcile, serve the API on `api_listener` and run the lifecycle
    /// controller on `events` until it exits.
    pub async fn run(
        self,
        api_listener: TcpListener,
        events: mpsc::Receiver<LifecycleEvent>,
    ) -> anyhow::Result<ExitReason> {
        let ctx = self.context;
        let node = ctx.node_name().to_string();

        // ── Startup reconciliation ───────────────────────────────
        let reconciler =
            Reconciler::new(Arc::clone(&ctx.executor)).with_config(ctx.config.reconcile_config());
        match reconciler.reconcile(&ctx.store, &node).await {
            Ok(report) => {
                for (instance, err) in &report.failed {
                    warn!(%instance, error = %err, "instance not started at boot");
                }
            }
            Err(e) => warn!(error = %e, "startup reconciliation skipped"),
        }

        // ── Lifecycle controller + API ───────────────────────────
        let controller = LifecycleController::new(
            Arc::clone(&ctx.executor),
            Arc::new(StoreInstances::new(ctx.store.new_session(), node.clone())),
            ctx.config.controller_config(),
        );
        let mut stop_accepting = controller.shutdown_signal();

        let api_state = ApiState::new(ctx.store.clone(), node.clone())
            .with_executor(Arc::clone(&ctx.executor))
            .with_stop_timeout(Duration::from_secs(ctx.config.shutdown.drain_timeout_secs));
        let api_addr = api_listener.local_addr()?;
        let api = tokio::spawn(async move {
            let stopped = async move {
                let _ = stop_accepting.wait_for(|stop| *stop).await;
            };
            if let Err(e) = axum::serve(api_listener, build_router(api_state))
                .with_graceful_shutdown(stopped)
                .await
            {
                error!(error = %e, "API server error");
            }
        });
        info!(%api_addr, node = %node, "hearthd ready");

        let reason = controller.run(events).await;

        let grace = Duration::from_secs(ctx.config.shutdown.quiesce_grace_secs);
        if tokio::time::timeout(grace, api).await.is_err() {
            warn!(?grace, "API requests still running after grace period");
        }
        ctx.shutdown().await;
        match &reason {
            ExitReason::Quiesced => info!("hearthd exiting, workloads left running"),
            ExitReason::Drained(report) => info!(
                stopped = report.stopped.len(),
                killed = report.killed.len(),
                "hearthd exiting after drain"
            ),
        }
        Ok(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hearth_lifecycle::{ExecutorError, ProcessStatus};
    use hearth_state::InstanceKey;
    use tokio::time::Instant;

    struct Idle;

    #[async_trait]
    impl RuntimeExecutor for Idle {
        async fn start(&self, _: &InstanceKey) -> Result<(), ExecutorError> {
            Ok(())
        }
        async fn graceful_stop(&self, _: &InstanceKey, _: Instant) -> Result<(), ExecutorError> {
            Ok(())
        }
        async fn kill(&self, _: &InstanceKey) -> Result<(), ExecutorError> {
            Ok(())
        }
        async fn status(&self, _: &InstanceKey) -> ProcessStatus {
            ProcessStatus::Stopped
        }
    }

    fn test_config(dir: &std::path::Path) -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.node.name = Some("node-1".into());
        config.node.data_dir = dir.to_path_buf();
        config.network.api_listen = "127.0.0.1:0".into();
        config.network.cluster_listen = "127.0.0.1:0".into();
        config.cluster.heartbeat_interval_ms = 50;
        config.cluster.election_timeout_min_ms = 150;
        config.cluster.election_timeout_max_ms = 300;
        config.shutdown.quiesce_grace_secs = 1;
        config
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn boot_applies_patches_and_quiesces() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::create_dir_all(config.database_dir()).unwrap();
        std::fs::write(
            config.database_dir().join("patch.local"),
            "put node_config images.cache_path /srv/cache\n",
        )
        .unwrap();
        std::fs::write(
            config.database_dir().join("patch.global"),
            "# seed cluster settings\ninsert cluster_config core.motd hello world\n",
        )
        .unwrap();

        let daemon = boot(config.clone(), Arc::new(Idle)).await.unwrap();
        let ctx = &daemon.context;
        assert_eq!(ctx.identity.raft_id, raft_id_for("node-1"));
        assert_eq!(
            ctx.local.get_config("images.cache_path").unwrap().as_deref(),
            Some("/srv/cache")
        );
        assert_eq!(
            ctx.store.get_cluster_config("core.motd").await.unwrap().as_deref(),
            Some("hello world")
        );
        assert!(!config.database_dir().join("patch.local").exists());
        assert!(!config.database_dir().join("patch.global").exists());
        assert!(ctx.store.get_member("node-1").await.unwrap().is_some());

        let api = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = mpsc::channel(4);
        tx.send(LifecycleEvent::Quiesce).await.unwrap();
        let reason = daemon.run(api, rx).await.unwrap();
        assert_eq!(reason, ExitReason::Quiesced);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_local_patch_stops_boot_and_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::create_dir_all(config.database_dir()).unwrap();
        let patch = config.database_dir().join("patch.local");
        std::fs::write(&patch, "update node_config never.set value\n").unwrap();

        let err = boot(config, Arc::new(Idle)).await.err().unwrap();
        assert!(format!("{err:#}").contains("local repair patch failed"));
        assert!(patch.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_global_patch_stops_boot_and_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let daemon = boot(config.clone(), Arc::new(Idle)).await.unwrap();
        daemon.context.store.set_cluster_config("keep", "old").await.unwrap();
        daemon.context.shutdown().await;

        let patch = config.database_dir().join("patch.global");
        std::fs::write(
            &patch,
            "put cluster_config keep new
update cluster_config ghost value
",
        )
        .unwrap();
        let err = boot(config.clone(), Arc::new(Idle)).await.err().unwrap();
        assert!(format!("{err:#}").contains("global repair patch failed"), "{err:#}");
        assert!(patch.exists());

        std::fs::remove_file(&patch).unwrap();
        let daemon = boot(config, Arc::new(Idle)).await.unwrap();
        let store = &daemon.context.store;
        assert_eq!(
            store.get_cluster_config("keep").await.unwrap().as_deref(),
            Some("old")
        );
        assert_eq!(store.get_cluster_config("ghost").await.unwrap(), None);
        daemon.context.shutdown().await;
    }

    #[test]
    fn identity_is_sticky() {
        let local = LocalStore::open_in_memory().unwrap();
        let first = resolve_identity(&local, Some("node-7")).unwrap();
        assert_eq!(first.raft_id, raft_id_for("node-7"));
        let again = resolve_identity(&local, None).unwrap();
        assert_eq!(again, first);
        assert!(resolve_identity(&local, Some("node-8")).is_err());
    }
}

//! hearthd — the hearth node daemon.
//!
//! Assembles the node:
//! - Local store and repair patches (redb)
//! - Replicated store and membership (openraft over HTTP)
//! - Startup reconciliation
//! - Lifecycle controller driven by OS signals
//! - REST API
//!
//! # Usage
//!
//! ```text
//! hearthd run --config /etc/hearth/hearthd.toml
//! hearthd run --name node-2 --join 10.0.0.1:8444
//! hearthd init-config > /etc/hearth/hearthd.toml
//! ```

mod boot;
mod config;
mod context;
mod signals;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use hearth_lifecycle::{CommandExecutor, ExitReason};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::DaemonConfig;

#[derive(Parser)]
#[command(name = "hearthd", about = "hearth node daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Boot the node and serve until a lifecycle signal ends the process.
    Run {
        /// Path to hearthd.toml; defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory holding the databases and patch files.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Member name (defaults to the stored identity, then the hostname).
        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        api_listen: Option<String>,

        #[arg(long)]
        cluster_listen: Option<String>,

        /// Cluster address peers should use to reach this node.
        #[arg(long)]
        advertise: Option<String>,

        /// Seed member to join through. Repeatable.
        #[arg(long = "join")]
        join: Vec<String>,

        /// Seconds to wait for workloads to stop on host shutdown.
        #[arg(long)]
        drain_timeout_secs: Option<u64>,

        /// Runtime helper executable.
        #[arg(long)]
        runtime_command: Option<PathBuf>,
    },
    /// Print the default configuration as TOML.
    InitConfig,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hearthd=debug,hearth=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::InitConfig => {
            print!("{}", DaemonConfig::default().to_toml_string()?);
            Ok(())
        }
        Command::Run {
            config,
            data_dir,
            name,
            api_listen,
            cluster_listen,
            advertise,
            join,
            drain_timeout_secs,
            runtime_command,
        } => {
            init_tracing(cli.log_json);
            let mut config = match config {
                Some(path) => DaemonConfig::from_file(&path)?,
                None => DaemonConfig::default(),
            };

            // Flags override the file.
            if let Some(dir) = data_dir {
                config.node.data_dir = dir;
            }
            if name.is_some() {
                config.node.name = name;
            }
            if let Some(addr) = api_listen {
                config.network.api_listen = addr;
            }
            if let Some(addr) = cluster_listen {
                config.network.cluster_listen = addr;
            }
            if advertise.is_some() {
                config.network.advertise_address = advertise;
            }
            if !join.is_empty() {
                config.cluster.join = join;
            }
            if let Some(secs) = drain_timeout_secs {
                config.shutdown.drain_timeout_secs = secs;
            }
            if let Some(cmd) = runtime_command {
                config.runtime.command = cmd;
            }

            run(config).await
        }
    }
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    // Signals are captured before boot so an early SIGTERM is not lost.
    let (events_tx, mut events_rx) = mpsc::channel(16);
    let requeue = events_tx.clone();
    let _bridge = signals::spawn_bridge(events_tx)?;

    let executor = Arc::new(CommandExecutor::new(config.runtime.command.clone()));
    let api_listen = config.network.api_listen.clone();
    let mut deferred = None;
    let daemon = tokio::select! {
        booted = boot::boot(config, executor) => booted?,
        () = signals::quiesce_during_boot(&mut events_rx, &mut deferred) => {
            warn!("quiesce requested during boot, exiting");
            return Ok(());
        }
    };
    if let Some(event) = deferred {
        requeue.send(event).await?;
    }
    drop(requeue);
    info!(cluster_addr = %daemon.cluster_addr, node = %daemon.context.node_name(), "boot complete");

    let api_listener = TcpListener::bind(&api_listen).await?;
    match daemon.run(api_listener, events_rx).await? {
        ExitReason::Quiesced => info!("hearthd stopped (quiesced)"),
        ExitReason::Drained(report) => info!(
            timed_out = report.timed_out,
            kill_failed = report.kill_failed.len(),
            "hearthd stopped (drained)"
        ),
    }
    Ok(())
}

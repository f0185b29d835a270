// openraft's StorageError is 224 bytes and rides in every storage Result.
#![allow(clippy::result_large_err)]

//! hearth replicated store — openraft + redb state machine.
//!
//! Cluster-wide records (instances, members, cluster config) live in a
//! redb database replicated through openraft. Writes become visible only
//! once a quorum has persisted them; conditional writes are checked on
//! every replica at apply time so they behave as compare-and-swap.
//!
//! # Architecture
//!
//! - **`typ`** — Type configuration (`TypeConfig`, `Request`, `Response`)
//! - **`log_store`** — Raft log storage backed by redb
//! - **`state_machine`** — Applies committed mutation batches atomically
//! - **`store`** — `ReplicatedStore` client handle with retry and sessions
//! - **`membership`** — Join, leave and role changes under quorum rules
//! - **`network`** — HTTP transport for peer RPCs and leader forwarding
//! - **`server`** — axum routes answering peer RPCs
//! - **`router`** — In-process transport for single-process clusters

use std::fmt::Display;
use std::sync::Arc;

use openraft::{ErrorSubject, ErrorVerb, StorageError};

pub mod error;
pub mod log_store;
pub mod membership;
pub mod network;
pub mod reader;
pub mod router;
pub mod server;
pub mod state_machine;
pub mod store;
pub mod typ;

pub use error::{ClusterError, ClusterResult, MembershipError};
pub use log_store::LogStore;
pub use membership::{MembershipManager, RemovalPlan, plan_removal, raft_id_for};
pub use network::{HttpForwarder, HttpNetworkFactory, JoinRequest, LeaderForwarder};
pub use reader::StateReader;
pub use router::{InProcessNetwork, InProcessRouter};
pub use server::raft_router;
pub use state_machine::StateMachine;
pub use store::{RaftStorage, ReplicatedStore, StoreConfig, WriteReceipt};
pub use typ::{HearthRaft, Outcome, Request, Response, TypeConfig};

pub(crate) fn read_err(e: impl Display) -> StorageError<u64> {
    StorageError::from_io_error(
        ErrorSubject::Store,
        ErrorVerb::Read,
        std::io::Error::other(e.to_string()),
    )
}

pub(crate) fn write_err(e: impl Display) -> StorageError<u64> {
    StorageError::from_io_error(
        ErrorSubject::Store,
        ErrorVerb::Write,
        std::io::Error::other(e.to_string()),
    )
}

/// Raft timing for a hearth cluster, in milliseconds.
pub fn raft_config(
    heartbeat_interval: u64,
    election_timeout_min: u64,
    election_timeout_max: u64,
) -> ClusterResult<Arc<openraft::Config>> {
    let config = openraft::Config {
        cluster_name: "hearth".to_string(),
        heartbeat_interval,
        election_timeout_min,
        election_timeout_max,
        ..Default::default()
    }
    .validate()
    .map_err(|e| ClusterError::Fatal(format!("raft config: {e}")))?;
    Ok(Arc::new(config))
}

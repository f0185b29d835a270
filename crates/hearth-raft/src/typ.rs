//! Raft type configuration for hearth.
//!
//! Defines the `TypeConfig` that wires together all openraft
//! associated types: node IDs, request/response payloads, and
//! the async runtime.

use std::io::Cursor;

use hearth_state::{Mutation, MutationError};
use openraft::TokioRuntime;
use serde::{Deserialize, Serialize};

/// Client write request submitted to the Raft cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    /// A single conditional mutation.
    Mutate(Mutation),
    /// Mutations applied all-or-nothing in one state machine transaction.
    Batch(Vec<Mutation>),
}

impl Request {
    pub fn mutations(&self) -> &[Mutation] {
        match self {
            Request::Mutate(m) => std::slice::from_ref(m),
            Request::Batch(ms) => ms,
        }
    }
}

impl From<Mutation> for Request {
    fn from(m: Mutation) -> Self {
        Request::Mutate(m)
    }
}

impl From<Vec<Mutation>> for Request {
    fn from(ms: Vec<Mutation>) -> Self {
        Request::Batch(ms)
    }
}

/// What the state machine did with a committed entry.
///
/// A rejected batch is still a committed log entry; it simply had no
/// effect on the replicated tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Committed,
    Rejected(MutationError),
}

/// Response returned after a write is applied to the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub outcome: Outcome,
}

impl Response {
    pub fn committed() -> Self {
        Self {
            outcome: Outcome::Committed,
        }
    }

    pub fn rejected(err: MutationError) -> Self {
        Self {
            outcome: Outcome::Rejected(err),
        }
    }
}

openraft::declare_raft_types!(
    /// hearth Raft type configuration.
    pub TypeConfig:
        D = Request,
        R = Response,
        NodeId = u64,
        Node = openraft::BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

/// Convenience alias for the Raft instance.
pub type HearthRaft = openraft::Raft<TypeConfig>;

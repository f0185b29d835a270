//! Error types for the replicated store.

use hearth_state::{MutationError, StateError};
use thiserror::Error;

/// Result type alias for replicated store operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    /// This node cannot order writes; `leader` is the last known leader.
    #[error("not the leader (leader: {leader:?})")]
    NotLeader { leader: Option<u64> },

    /// Quorum or leader unreachable within the retry budget.
    #[error("cluster unavailable: {0}")]
    Unavailable(String),

    /// A conditional write lost a race; re-read and retry.
    #[error(transparent)]
    Conflict(MutationError),

    /// The state machine refused the write as malformed.
    #[error("write rejected: {0}")]
    Rejected(MutationError),

    /// The request is valid but not allowed in the record's current state.
    #[error("refused: {0}")]
    Refused(String),

    #[error(transparent)]
    Membership(#[from] MembershipError),

    #[error("raft fatal error: {0}")]
    Fatal(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("raft storage error: {0}")]
    Storage(String),
}

impl ClusterError {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClusterError::NotLeader { .. } | ClusterError::Unavailable(_))
    }

    pub(crate) fn from_mutation(err: MutationError) -> Self {
        if err.is_conflict() {
            ClusterError::Conflict(err)
        } else {
            ClusterError::Rejected(err)
        }
    }
}

/// Membership changes refused by quorum rules.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MembershipError {
    #[error("unknown member {0}")]
    UnknownMember(String),

    #[error("member {0} already exists")]
    Duplicate(String),

    #[error("{0} is the last voter")]
    LastVoter(String),

    #[error("removing {name} leaves {remaining} voters, below the quorum of {quorum}")]
    BelowQuorum {
        name: String,
        remaining: usize,
        quorum: usize,
    },

    #[error("raft id {raft_id} of {name} collides with member {existing}")]
    IdCollision {
        name: String,
        raft_id: u64,
        existing: String,
    },
}

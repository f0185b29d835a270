//! hearth-state — record model and node-local persistence for hearth.
//!
//! Backed by [redb](https://docs.rs/redb). This crate owns everything that
//! touches a database file directly:
//!
//! - **`types`** — Instance and Membership records, power state, versioned reads
//! - **`tables`** — redb table definitions and their replication scope
//! - **`mutation`** — conditional (compare-and-swap) mutations applied
//!   all-or-nothing inside one write transaction
//! - **`schema`** — versioned schema updates with pre-upgrade backup snapshots
//! - **`local`** — the node-local store (address, join token, cache paths)
//! - **`patch`** — operator-supplied repair patches
//!
//! # Row format
//!
//! Every row is a JSON [`StoredValue`] envelope carrying the revision that
//! last wrote it. For replicated tables the revision is the raft log index
//! of the committing entry; for the local store it is a local counter.

pub mod error;
pub mod local;
pub mod mutation;
pub mod patch;
pub mod schema;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use local::LocalStore;
pub use mutation::{Expect, Mutation, MutationError, MutationOp, apply_mutations};
pub use patch::{Patch, PatchError, PatchLoader, PatchOutcome, PatchTarget};
pub use schema::Schema;
pub use tables::{Scope, Table};
pub use types::*;

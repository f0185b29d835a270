//! hearth-lifecycle — keeping running workloads in line with the store.
//!
//! - **`executor`** — `RuntimeExecutor` seam and a helper-command backend
//! - **`reconciler`** — boot-time start of instances recorded as running
//! - **`machine`** — pure `Running → Draining → Exiting` state machine
//! - **`drain`** — concurrent graceful stop under one shared countdown
//! - **`controller`** — event loop driving the machine and its actions
//! - **`diagnostics`** — memory profile dumps

pub mod controller;
pub mod diagnostics;
pub mod drain;
pub mod executor;
pub mod machine;
pub mod reconciler;

pub use controller::{ControllerConfig, ExitReason, InstanceSource, LifecycleController, StoreInstances};
pub use diagnostics::MemoryProfile;
pub use drain::{DEFAULT_DRAIN_TIMEOUT, DrainReport, drain};
pub use executor::{CommandExecutor, ExecutorError, ProcessStatus, RuntimeExecutor};
pub use machine::{Action, LifecycleEvent, LifecycleState, Transition, step};
pub use reconciler::{ReconcileConfig, ReconcileReport, Reconciler, SkipReason};

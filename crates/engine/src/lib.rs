//! zoneshift engine: moves PV-backed volumes between availability zones.
//!
//! [`Orchestrator`] runs one state machine per task under a concurrency cap and
//! exposes the status table while it does. [`Coordinator`] wraps a run with the
//! cluster-wide pause and restore of workloads and sync automation.

#![forbid(unsafe_code)]

mod coordinator;
mod orchestrator;
mod plan;
mod store;
mod task;

pub use coordinator::{
    CompensationRecord, Coordinator, CoordinatorError, CoordinatorSettings, Discovery, ExecutionReport,
    NamespaceDiscovery, NamespaceScope, PausedWorkload, RestoreFailure, RestoreReport, RestoreTarget, ScaleMode,
    DEFAULT_DRAIN_TIMEOUT, DEFAULT_SYNC_NAMESPACES,
};
pub use orchestrator::Orchestrator;
pub use store::StatusStore;
pub use task::Outcome;

pub use tokio_util::sync::CancellationToken;

//! zoneshift core types: task identity, the migration step vocabulary, plan shapes
//! and the two gateway seams the engine drives.

#![forbid(unsafe_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};

mod capacity;
mod gateway;
mod plan;
mod status;

pub use capacity::{capacity_to_gib, quantity_bytes, CapacityError, GIB};
pub use gateway::{
    ClaimInfo, ClusterGateway, SnapshotState, SyncApp, VolumeGateway, VolumeInfo, VolumeState,
    Workload, WorkloadKind,
};
pub use plan::{MigrationPlan, PlanAction, PlanItem};
pub use status::{RunSummary, Step, TaskStatus};

/// Namespace assumed for task names without a `/`.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Split a task name (`"<namespace>/<claim>"`) on its first `/`.
///
/// Never fails: a name without a separator lands in [`DEFAULT_NAMESPACE`], and a
/// leading `/` yields the empty namespace.
pub fn parse_task_name(full: &str) -> (&str, &str) {
    match full.split_once('/') {
        Some((ns, claim)) => (ns, claim),
        None => (DEFAULT_NAMESPACE, full),
    }
}

pub fn task_name(namespace: &str, claim: &str) -> String {
    format!("{}/{}", namespace, claim)
}

/// Name of the statically provisioned PV created for a migrated claim.
pub fn static_volume_name(claim: &str) -> String {
    format!("{}-static", claim)
}

/// Poll cadence of the snapshot and volume waits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollIntervals {
    pub snapshot: Duration,
    pub volume: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self { snapshot: Duration::from_secs(5), volume: Duration::from_secs(3) }
    }
}

/// Immutable run configuration handed to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationConfig {
    pub namespaces: Vec<String>,
    pub target_zone: String,
    pub storage_class: String,
    pub max_concurrency: usize,
    /// Task names, `"<namespace>/<claim>"`.
    pub tasks: Vec<String>,
    pub dry_run: bool,
    #[serde(default)]
    pub poll: PollIntervals,
}

impl MigrationConfig {
    pub fn new(target_zone: impl Into<String>, storage_class: impl Into<String>) -> Self {
        Self {
            namespaces: Vec::new(),
            target_zone: target_zone.into(),
            storage_class: storage_class.into(),
            max_concurrency: 5,
            tasks: Vec::new(),
            dry_run: false,
            poll: PollIntervals::default(),
        }
    }

    /// Drop duplicate task names (first occurrence wins) and clamp concurrency to at least 1.
    pub fn normalized(mut self) -> Self {
        let mut seen = std::collections::HashSet::new();
        self.tasks.retain(|t| seen.insert(t.clone()));
        self.max_concurrency = self.max_concurrency.max(1);
        self
    }
}

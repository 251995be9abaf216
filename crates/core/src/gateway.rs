//! Narrow seams to the cluster and the cloud provider. The engine only ever talks
//! to these traits; concrete kube/EC2 implementations live in their own crates.

use std::fmt;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// What the cluster knows about a bound claim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimInfo {
    /// Name of the PV the claim is bound to.
    pub volume_name: String,
    /// Cloud block-storage id backing that PV.
    pub volume_id: String,
    /// Requested storage as a quantity string (e.g. `50Gi`).
    pub capacity: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::StatefulSet => "StatefulSet",
        }
    }

    /// Resource name as understood by `kubectl`.
    pub fn kubectl_resource(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "deployment",
            WorkloadKind::StatefulSet => "statefulset",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scalable workload and a replica count (the original count when recorded for restore).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workload {
    pub kind: WorkloadKind,
    pub name: String,
    pub replicas: i32,
}

impl Workload {
    pub fn new(kind: WorkloadKind, name: impl Into<String>, replicas: i32) -> Self {
        Self { kind, name: name.into(), replicas }
    }
}

/// An external sync-automation entry (an Argo CD Application with automated sync)
/// together with its original automated policy, kept verbatim for restore.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncApp {
    pub name: String,
    pub namespace: String,
    pub automated_policy: serde_json::Value,
}

impl SyncApp {
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SnapshotState {
    Pending,
    Completed,
    Error,
}

impl SnapshotState {
    /// Map a provider state string; anything not terminal counts as pending.
    pub fn from_provider(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "completed" => SnapshotState::Completed,
            "error" => SnapshotState::Error,
            _ => SnapshotState::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolumeState {
    Creating,
    Available,
    Error,
    Other(String),
}

impl VolumeState {
    pub fn from_provider(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "creating" => VolumeState::Creating,
            "available" => VolumeState::Available,
            "error" => VolumeState::Error,
            other => VolumeState::Other(other.to_string()),
        }
    }

    /// Coarse progress estimate while waiting for a volume.
    pub fn progress_hint(&self) -> u8 {
        match self {
            VolumeState::Available => 100,
            VolumeState::Creating => 25,
            VolumeState::Error => 0,
            VolumeState::Other(_) => 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeInfo {
    pub volume_id: String,
    pub zone: String,
    pub state: VolumeState,
}

/// Claim, volume and workload lifecycle on the orchestration platform.
#[async_trait::async_trait]
pub trait ClusterGateway: Send + Sync {
    async fn list_claims(&self, namespace: &str) -> Result<Vec<String>>;

    /// Fails when the claim is absent or not bound to a volume.
    async fn claim_info(&self, namespace: &str, claim: &str) -> Result<ClaimInfo>;

    /// Best effort: clears finalizers, deletes claim then volume, tolerates absence.
    async fn delete_claim_and_volume(&self, namespace: &str, claim: &str, volume_name: &str) -> Result<()>;

    async fn create_static_volume(
        &self,
        name: &str,
        cloud_volume_id: &str,
        capacity: &str,
        storage_class: &str,
        zone: &str,
    ) -> Result<()>;

    async fn create_bound_claim(
        &self,
        namespace: &str,
        claim: &str,
        volume_name: &str,
        capacity: &str,
        storage_class: &str,
    ) -> Result<()>;

    /// Scale every workload with replicas > 0 to zero; returns their original counts.
    async fn scale_workloads_to_zero(&self, namespace: &str) -> Result<Vec<Workload>>;

    async fn wait_until_no_pods_running(&self, namespace: &str, timeout: Duration) -> Result<()>;

    async fn restore_workload_replicas(&self, namespace: &str, workload: &Workload) -> Result<()>;

    /// Workloads currently asking for at least one replica.
    async fn running_workloads(&self, namespace: &str) -> Result<Vec<Workload>>;

    /// Sync-automation entries deploying into `namespace`, looked up in `search_namespaces`.
    async fn find_sync_automation(&self, namespace: &str, search_namespaces: &[String]) -> Result<Vec<SyncApp>>;

    async fn disable_sync_automation(&self, app: &SyncApp) -> Result<()>;

    /// Re-applies `app.automated_policy`.
    async fn enable_sync_automation(&self, app: &SyncApp) -> Result<()>;
}

/// Snapshot and volume lifecycle on the cloud provider.
#[async_trait::async_trait]
pub trait VolumeGateway: Send + Sync {
    async fn create_snapshot(&self, volume_id: &str, claim: &str, target_zone: &str) -> Result<String>;

    /// Progress in percent (0-100) and the current state.
    async fn snapshot_progress(&self, snapshot_id: &str) -> Result<(u8, SnapshotState)>;

    async fn create_volume(
        &self,
        snapshot_id: &str,
        zone: &str,
        claim: &str,
        namespace: &str,
        size_gib: i32,
    ) -> Result<String>;

    async fn volume_state(&self, volume_id: &str) -> Result<VolumeState>;

    async fn volume_info(&self, volume_id: &str) -> Result<VolumeInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_states_from_provider() {
        assert_eq!(SnapshotState::from_provider("completed"), SnapshotState::Completed);
        assert_eq!(SnapshotState::from_provider("ERROR"), SnapshotState::Error);
        assert_eq!(SnapshotState::from_provider("pending"), SnapshotState::Pending);
        assert_eq!(SnapshotState::from_provider("recoverable"), SnapshotState::Pending);
    }

    #[test]
    fn volume_progress_hints() {
        assert_eq!(VolumeState::from_provider("creating").progress_hint(), 25);
        assert_eq!(VolumeState::from_provider("available").progress_hint(), 100);
        assert_eq!(VolumeState::from_provider("in-use"), VolumeState::Other("in-use".into()));
        assert_eq!(VolumeState::from_provider("in-use").progress_hint(), 50);
    }
}

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use zoneshift_core::{
    ClaimInfo, ClusterGateway, MigrationConfig, PollIntervals, SnapshotState, SyncApp, VolumeGateway, VolumeInfo,
    VolumeState, Workload,
};

pub const FROM_ZONE: &str = "us-east-1b";
pub const TO_ZONE: &str = "us-east-1a";

/// Millisecond polls so waits finish quickly.
pub fn config(tasks: &[&str]) -> MigrationConfig {
    let mut cfg = MigrationConfig::new(TO_ZONE, "gp3");
    cfg.tasks = tasks.iter().map(|t| t.to_string()).collect();
    cfg.namespaces = tasks
        .iter()
        .map(|t| zoneshift_core::parse_task_name(t).0.to_string())
        .collect::<FxHashSet<_>>()
        .into_iter()
        .collect();
    cfg.poll = PollIntervals { snapshot: Duration::from_millis(2), volume: Duration::from_millis(2) };
    cfg
}

/// In-memory cluster. Mutating calls are appended to `calls`.
#[derive(Default)]
pub struct FakeCluster {
    claims: Mutex<FxHashMap<String, ClaimInfo>>,
    unbound: Mutex<FxHashSet<String>>,
    workloads: Mutex<FxHashMap<String, Vec<Workload>>>,
    sync_apps: Mutex<FxHashMap<String, Vec<SyncApp>>>,
    calls: Mutex<Vec<String>>,
    restore_calls: AtomicUsize,
    failing_restores: Mutex<FxHashSet<usize>>,
    failing_ops: Mutex<FxHashSet<&'static str>>,
    failing_lists: Mutex<FxHashSet<String>>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bound claim backed by cloud volume `volume_id`.
    pub fn with_claim(self: &Arc<Self>, ns: &str, claim: &str, volume_id: &str, capacity: &str) -> Arc<Self> {
        self.claims.lock().unwrap().insert(
            format!("{}/{}", ns, claim),
            ClaimInfo { volume_name: format!("pv-{}", claim), volume_id: volume_id.to_string(), capacity: capacity.to_string() },
        );
        Arc::clone(self)
    }

    pub fn with_unbound_claim(self: &Arc<Self>, ns: &str, claim: &str) -> Arc<Self> {
        self.unbound.lock().unwrap().insert(format!("{}/{}", ns, claim));
        Arc::clone(self)
    }

    pub fn with_workload(self: &Arc<Self>, ns: &str, workload: Workload) -> Arc<Self> {
        self.workloads.lock().unwrap().entry(ns.to_string()).or_default().push(workload);
        Arc::clone(self)
    }

    pub fn with_sync_app(self: &Arc<Self>, target_ns: &str, app: SyncApp) -> Arc<Self> {
        self.sync_apps.lock().unwrap().entry(target_ns.to_string()).or_default().push(app);
        Arc::clone(self)
    }

    /// Make the n-th (1-based) restore call of either kind fail.
    pub fn fail_restore_call(self: &Arc<Self>, n: usize) -> Arc<Self> {
        self.failing_restores.lock().unwrap().insert(n);
        Arc::clone(self)
    }

    /// Fail every call to the named operation (`"cleanup"`, `"drain"`, `"disable"`, `"scale"`, ...).
    pub fn fail_op(self: &Arc<Self>, op: &'static str) -> Arc<Self> {
        self.failing_ops.lock().unwrap().insert(op);
        Arc::clone(self)
    }

    pub fn fail_listing(self: &Arc<Self>, ns: &str) -> Arc<Self> {
        self.failing_lists.lock().unwrap().insert(ns.to_string());
        Arc::clone(self)
    }

    /// Change a workload's live replica count, as an autoscaler would.
    pub fn set_replicas(&self, ns: &str, name: &str, replicas: i32) {
        if let Some(ws) = self.workloads.lock().unwrap().get_mut(ns) {
            for w in ws.iter_mut().filter(|w| w.name == name) {
                w.replicas = replicas;
            }
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls().into_iter().filter(|c| c.starts_with(prefix)).collect()
    }

    pub fn replicas(&self, ns: &str, name: &str) -> Option<i32> {
        self.workloads
            .lock()
            .unwrap()
            .get(ns)
            .and_then(|ws| ws.iter().find(|w| w.name == name).map(|w| w.replicas))
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn check(&self, op: &'static str) -> Result<()> {
        if self.failing_ops.lock().unwrap().contains(op) {
            bail!("injected {} failure", op);
        }
        Ok(())
    }

    fn next_restore(&self) -> Result<()> {
        let n = self.restore_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing_restores.lock().unwrap().contains(&n) {
            bail!("injected restore failure #{}", n);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClusterGateway for FakeCluster {
    async fn list_claims(&self, namespace: &str) -> Result<Vec<String>> {
        if self.failing_lists.lock().unwrap().contains(namespace) {
            bail!("forbidden: cannot list persistentvolumeclaims in {}", namespace);
        }
        let prefix = format!("{}/", namespace);
        let mut out: Vec<String> = self
            .claims
            .lock()
            .unwrap()
            .keys()
            .chain(self.unbound.lock().unwrap().iter())
            .filter_map(|k| k.strip_prefix(&prefix).map(|s| s.to_string()))
            .collect();
        out.sort();
        Ok(out)
    }

    async fn claim_info(&self, namespace: &str, claim: &str) -> Result<ClaimInfo> {
        let key = format!("{}/{}", namespace, claim);
        if self.unbound.lock().unwrap().contains(&key) {
            bail!("PVC {} is not bound to any PV", claim);
        }
        self.claims
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| anyhow!("persistentvolumeclaims \"{}\" not found", claim))
    }

    async fn delete_claim_and_volume(&self, namespace: &str, claim: &str, volume_name: &str) -> Result<()> {
        self.log(format!("delete {}/{} {}", namespace, claim, volume_name));
        self.check("cleanup")
    }

    async fn create_static_volume(
        &self,
        name: &str,
        cloud_volume_id: &str,
        capacity: &str,
        storage_class: &str,
        zone: &str,
    ) -> Result<()> {
        self.log(format!("create_pv {} {} {} {} {}", name, cloud_volume_id, capacity, storage_class, zone));
        self.check("create_pv")
    }

    async fn create_bound_claim(
        &self,
        namespace: &str,
        claim: &str,
        volume_name: &str,
        capacity: &str,
        storage_class: &str,
    ) -> Result<()> {
        self.log(format!("create_pvc {}/{} {} {} {}", namespace, claim, volume_name, capacity, storage_class));
        self.check("create_pvc")
    }

    async fn scale_workloads_to_zero(&self, namespace: &str) -> Result<Vec<Workload>> {
        self.log(format!("scale {}", namespace));
        self.check("scale")?;
        let mut map = self.workloads.lock().unwrap();
        let mut originals = Vec::new();
        for w in map.entry(namespace.to_string()).or_default().iter_mut() {
            if w.replicas > 0 {
                originals.push(w.clone());
                w.replicas = 0;
            }
        }
        Ok(originals)
    }

    async fn wait_until_no_pods_running(&self, namespace: &str, _timeout: Duration) -> Result<()> {
        self.log(format!("drain {}", namespace));
        if self.failing_ops.lock().unwrap().contains("drain") {
            bail!("timeout waiting for pods in namespace {} to terminate", namespace);
        }
        Ok(())
    }

    async fn restore_workload_replicas(&self, namespace: &str, workload: &Workload) -> Result<()> {
        self.log(format!("restore {}/{}", namespace, workload.name));
        self.next_restore()?;
        if let Some(ws) = self.workloads.lock().unwrap().get_mut(namespace) {
            for w in ws.iter_mut().filter(|w| w.kind == workload.kind && w.name == workload.name) {
                w.replicas = workload.replicas;
            }
        }
        Ok(())
    }

    async fn running_workloads(&self, namespace: &str) -> Result<Vec<Workload>> {
        Ok(self
            .workloads
            .lock()
            .unwrap()
            .get(namespace)
            .map(|ws| ws.iter().filter(|w| w.replicas > 0).cloned().collect())
            .unwrap_or_default())
    }

    async fn find_sync_automation(&self, namespace: &str, _search: &[String]) -> Result<Vec<SyncApp>> {
        Ok(self.sync_apps.lock().unwrap().get(namespace).cloned().unwrap_or_default())
    }

    async fn disable_sync_automation(&self, app: &SyncApp) -> Result<()> {
        self.log(format!("disable {}", app.qualified_name()));
        self.check("disable")
    }

    async fn enable_sync_automation(&self, app: &SyncApp) -> Result<()> {
        self.log(format!("enable {}", app.qualified_name()));
        self.next_restore()
    }
}

/// In-memory cloud. Snapshots and volumes report "in progress" for a fixed number
/// of polls before settling.
pub struct FakeVolumes {
    zones: Mutex<FxHashMap<String, String>>,
    snapshot_polls: Mutex<FxHashMap<String, usize>>,
    volume_polls: Mutex<FxHashMap<String, usize>>,
    pub pending_polls: usize,
    /// `false` keeps snapshots pending forever.
    pub snapshot_completes: bool,
    /// Snapshots end in the error state instead of completing.
    pub snapshot_fails: bool,
    /// New volumes end in the error state instead of becoming available.
    pub volume_fails: bool,
    pub info_delay: Duration,
    next_id: AtomicUsize,
    pub snapshots_created: AtomicUsize,
    pub volumes_created: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl Default for FakeVolumes {
    fn default() -> Self {
        Self {
            zones: Mutex::new(FxHashMap::default()),
            snapshot_polls: Mutex::new(FxHashMap::default()),
            volume_polls: Mutex::new(FxHashMap::default()),
            pending_polls: 2,
            snapshot_completes: true,
            snapshot_fails: false,
            volume_fails: false,
            info_delay: Duration::ZERO,
            next_id: AtomicUsize::new(1),
            snapshots_created: AtomicUsize::new(0),
            volumes_created: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }
}

impl FakeVolumes {
    pub fn with_volumes(volumes: &[(&str, &str)]) -> Self {
        let v = Self::default();
        {
            let mut zones = v.zones.lock().unwrap();
            for (id, zone) in volumes {
                zones.insert(id.to_string(), zone.to_string());
            }
        }
        v
    }

    pub fn mutating_calls(&self) -> usize {
        self.snapshots_created.load(Ordering::SeqCst) + self.volumes_created.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl VolumeGateway for FakeVolumes {
    async fn create_snapshot(&self, volume_id: &str, _claim: &str, _target_zone: &str) -> Result<String> {
        if !self.zones.lock().unwrap().contains_key(volume_id) {
            bail!("InvalidVolume.NotFound: {}", volume_id);
        }
        self.snapshots_created.fetch_add(1, Ordering::SeqCst);
        let id = format!("snap-{:04}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.snapshot_polls.lock().unwrap().insert(id.clone(), 0);
        Ok(id)
    }

    async fn snapshot_progress(&self, snapshot_id: &str) -> Result<(u8, SnapshotState)> {
        let mut polls = self.snapshot_polls.lock().unwrap();
        let n = polls.get_mut(snapshot_id).ok_or_else(|| anyhow!("snapshot {} not found", snapshot_id))?;
        *n += 1;
        if self.snapshot_fails && *n > self.pending_polls {
            Ok(((*n * 10).min(99) as u8, SnapshotState::Error))
        } else if self.snapshot_completes && *n > self.pending_polls {
            Ok((100, SnapshotState::Completed))
        } else {
            Ok(((*n * 10).min(99) as u8, SnapshotState::Pending))
        }
    }

    async fn create_volume(
        &self,
        snapshot_id: &str,
        zone: &str,
        _claim: &str,
        _namespace: &str,
        size_gib: i32,
    ) -> Result<String> {
        if !self.snapshot_polls.lock().unwrap().contains_key(snapshot_id) {
            bail!("snapshot {} not found", snapshot_id);
        }
        if size_gib < 1 {
            bail!("invalid size {}", size_gib);
        }
        self.volumes_created.fetch_add(1, Ordering::SeqCst);
        let id = format!("vol-new{:04}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.zones.lock().unwrap().insert(id.clone(), zone.to_string());
        self.volume_polls.lock().unwrap().insert(id.clone(), 0);
        Ok(id)
    }

    async fn volume_state(&self, volume_id: &str) -> Result<VolumeState> {
        let mut polls = self.volume_polls.lock().unwrap();
        let n = polls.get_mut(volume_id).ok_or_else(|| anyhow!("volume {} not found", volume_id))?;
        *n += 1;
        if self.volume_fails && *n > self.pending_polls {
            Ok(VolumeState::Error)
        } else if *n > self.pending_polls {
            Ok(VolumeState::Available)
        } else {
            Ok(VolumeState::Creating)
        }
    }

    async fn volume_info(&self, volume_id: &str) -> Result<VolumeInfo> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.info_delay.is_zero() {
            tokio::time::sleep(self.info_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let zone = self
            .zones
            .lock()
            .unwrap()
            .get(volume_id)
            .cloned()
            .ok_or_else(|| anyhow!("InvalidVolume.NotFound: {}", volume_id))?;
        Ok(VolumeInfo { volume_id: volume_id.to_string(), zone, state: VolumeState::Available })
    }
}

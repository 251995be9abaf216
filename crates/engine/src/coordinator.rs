//! Pre-flight and post-flight around a run: pause sync automation and workloads,
//! run the orchestrator, then put everything back however the run went.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use zoneshift_core::{task_name, ClusterGateway, RunSummary, SyncApp, Workload};

use crate::orchestrator::Orchestrator;

/// Namespaces searched for sync-automation entries when none are configured.
pub const DEFAULT_SYNC_NAMESPACES: [&str; 3] = ["argocd", "argo-cd", "gitops"];

pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleMode {
    /// Workloads are scaled to zero by the coordinator.
    #[default]
    Auto,
    /// The operator scales them; the coordinator only records and waits.
    Manual,
}

impl std::str::FromStr for ScaleMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(ScaleMode::Auto),
            "manual" => Ok(ScaleMode::Manual),
            other => Err(anyhow!("invalid scale mode {:?} (expected auto or manual)", other)),
        }
    }
}

/// One namespace in scope. An empty `claims` list means every claim in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceScope {
    pub name: String,
    #[serde(default)]
    pub claims: Vec<String>,
}

impl NamespaceScope {
    pub fn all(name: impl Into<String>) -> Self {
        Self { name: name.into(), claims: Vec::new() }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub namespaces: Vec<NamespaceScope>,
    /// `None` skips sync-automation handling entirely.
    pub sync_search_namespaces: Option<Vec<String>>,
    pub dry_run: bool,
    pub scale_mode: ScaleMode,
    pub drain_timeout: Duration,
}

impl CoordinatorSettings {
    pub fn new(namespaces: Vec<NamespaceScope>) -> Self {
        Self {
            namespaces,
            sync_search_namespaces: Some(DEFAULT_SYNC_NAMESPACES.iter().map(|s| s.to_string()).collect()),
            dry_run: false,
            scale_mode: ScaleMode::Auto,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Namespace names in configured order, without repeats.
    pub fn namespace_names(&self) -> Vec<String> {
        let mut seen = FxHashSet::default();
        self.namespaces
            .iter()
            .filter(|s| seen.insert(s.name.as_str()))
            .map(|s| s.name.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NamespaceDiscovery {
    pub namespace: String,
    pub workloads: Vec<Workload>,
    pub sync_apps: Vec<SyncApp>,
}

/// What pre-flight will touch, gathered before any mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Discovery {
    pub namespaces: Vec<NamespaceDiscovery>,
}

impl Discovery {
    pub fn workload_count(&self) -> usize {
        self.namespaces.iter().map(|n| n.workloads.len()).sum()
    }

    pub fn sync_app_count(&self) -> usize {
        self.namespaces.iter().map(|n| n.sync_apps.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PausedWorkload {
    pub namespace: String,
    pub workload: Workload,
}

/// Everything pre-flight changed, appended to before each change is made.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompensationRecord {
    pub workloads: Vec<PausedWorkload>,
    pub sync_apps: Vec<SyncApp>,
}

impl CompensationRecord {
    pub fn is_empty(&self) -> bool {
        self.workloads.is_empty() && self.sync_apps.is_empty()
    }

    /// Add `workload`, or take its replica count if it is already recorded.
    fn record_workload(&mut self, namespace: &str, workload: &Workload) {
        let known = self
            .workloads
            .iter_mut()
            .find(|p| p.namespace == namespace && p.workload.kind == workload.kind && p.workload.name == workload.name);
        match known {
            Some(p) => p.workload.replicas = workload.replicas,
            None => self.workloads.push(PausedWorkload { namespace: namespace.to_string(), workload: workload.clone() }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RestoreTarget {
    Workload { namespace: String, workload: Workload },
    SyncApp(SyncApp),
}

impl RestoreTarget {
    /// A command an operator can run to finish the restore by hand.
    pub fn manual_action(&self) -> String {
        match self {
            RestoreTarget::Workload { namespace, workload } => format!(
                "kubectl scale {} {} -n {} --replicas={}",
                workload.kind.kubectl_resource(),
                workload.name,
                namespace,
                workload.replicas
            ),
            RestoreTarget::SyncApp(app) => {
                let patch = serde_json::json!({ "spec": { "syncPolicy": { "automated": app.automated_policy } } });
                format!(
                    "kubectl patch application {} -n {} --type merge -p '{}'",
                    app.name, app.namespace, patch
                )
            }
        }
    }
}

impl fmt::Display for RestoreTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreTarget::Workload { namespace, workload } => {
                write!(f, "{} {}/{} ({} replicas)", workload.kind, namespace, workload.name, workload.replicas)
            }
            RestoreTarget::SyncApp(app) => write!(f, "sync automation {}", app.qualified_name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreFailure {
    pub target: RestoreTarget,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RestoreReport {
    pub attempted: usize,
    pub restored: usize,
    pub failures: Vec<RestoreFailure>,
}

impl RestoreReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("discovery failed: {0:#}")]
    Discovery(anyhow::Error),
    #[error("pre-flight failed: {cause:#}")]
    Preflight { cause: anyhow::Error, restore: RestoreReport },
    #[error("no PVCs found in the configured namespaces")]
    NoTasks,
}

#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub summary: RunSummary,
    pub restore: RestoreReport,
    pub record: CompensationRecord,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> bool {
        !self.summary.has_failures() && self.restore.is_clean()
    }
}

/// Sequences pause, run and resume for one invocation.
pub struct Coordinator {
    cluster: Arc<dyn ClusterGateway>,
    settings: CoordinatorSettings,
}

impl Coordinator {
    pub fn new(cluster: Arc<dyn ClusterGateway>, settings: CoordinatorSettings) -> Self {
        Self { cluster, settings }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Task names for the configured scope: explicit claims, else every claim in the
    /// namespace. First occurrence wins.
    pub async fn resolve_tasks(&self) -> Result<Vec<String>, CoordinatorError> {
        let mut seen = FxHashSet::default();
        let mut tasks = Vec::new();
        for scope in &self.settings.namespaces {
            let claims = if scope.claims.is_empty() {
                self.cluster
                    .list_claims(&scope.name)
                    .await
                    .with_context(|| format!("list PVCs in namespace {}", scope.name))
                    .map_err(CoordinatorError::Discovery)?
            } else {
                scope.claims.clone()
            };
            for claim in claims {
                let name = task_name(&scope.name, &claim);
                if seen.insert(name.clone()) {
                    tasks.push(name);
                }
            }
        }
        if tasks.is_empty() {
            return Err(CoordinatorError::NoTasks);
        }
        Ok(tasks)
    }

    /// Find running workloads and sync automation per namespace. Read-only.
    pub async fn discover(&self) -> Result<Discovery, CoordinatorError> {
        let mut out = Discovery::default();
        for ns in self.settings.namespace_names() {
            let sync_apps = match &self.settings.sync_search_namespaces {
                Some(search) => self
                    .cluster
                    .find_sync_automation(&ns, search)
                    .await
                    .with_context(|| format!("find sync automation for namespace {}", ns))
                    .map_err(CoordinatorError::Discovery)?,
                None => Vec::new(),
            };
            let workloads = self
                .cluster
                .running_workloads(&ns)
                .await
                .with_context(|| format!("list workloads in namespace {}", ns))
                .map_err(CoordinatorError::Discovery)?;
            info!(ns = %ns, workloads = workloads.len(), sync_apps = sync_apps.len(), "discovered");
            out.namespaces.push(NamespaceDiscovery { namespace: ns, workloads, sync_apps });
        }
        Ok(out)
    }

    /// Disable sync automation, scale workloads down and wait for pods to drain.
    /// `record` grows before each mutation, so it is complete even when this fails.
    pub async fn pause(
        &self,
        discovery: &Discovery,
        record: &mut CompensationRecord,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        if self.settings.dry_run {
            info!("dry run: leaving workloads and sync automation untouched");
            return Ok(());
        }

        for nd in &discovery.namespaces {
            for app in &nd.sync_apps {
                record.sync_apps.push(app.clone());
                self.cluster
                    .disable_sync_automation(app)
                    .await
                    .with_context(|| format!("disable sync automation {}", app.qualified_name()))?;
                info!(app = %app.qualified_name(), "sync automation disabled");
            }
        }

        for nd in &discovery.namespaces {
            if nd.workloads.is_empty() {
                continue;
            }
            let ns = nd.namespace.as_str();
            for w in &nd.workloads {
                record.record_workload(ns, w);
            }
            if self.settings.scale_mode == ScaleMode::Auto {
                let scaled = self
                    .cluster
                    .scale_workloads_to_zero(ns)
                    .await
                    .with_context(|| format!("scale down workloads in namespace {}", ns))?;
                // Counts returned by the scale-down are the ones to restore.
                for w in &scaled {
                    record.record_workload(ns, w);
                }
                info!(ns = %ns, scaled = scaled.len(), "workloads scaled to zero");
            }
        }

        for nd in discovery.namespaces.iter().filter(|n| !n.workloads.is_empty()) {
            let ns = nd.namespace.as_str();
            info!(ns = %ns, timeout_secs = self.settings.drain_timeout.as_secs(), "waiting for pods to stop");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(anyhow!("cancelled while waiting for pods in namespace {} to stop", ns));
                }
                res = tokio::time::timeout(
                    self.settings.drain_timeout,
                    self.cluster.wait_until_no_pods_running(ns, self.settings.drain_timeout),
                ) => {
                    res.map_err(|_| anyhow!("timed out after {:?}", self.settings.drain_timeout))
                        .and_then(|r| r)
                        .with_context(|| format!("wait for pods in namespace {} to stop", ns))?;
                }
            }
        }
        Ok(())
    }

    /// Put back everything in `record`: workloads first, then sync automation.
    /// Every entry is attempted; failures are collected, never short-circuited.
    pub async fn resume(&self, record: &CompensationRecord) -> RestoreReport {
        let mut report = RestoreReport::default();

        for paused in &record.workloads {
            report.attempted += 1;
            match self.cluster.restore_workload_replicas(&paused.namespace, &paused.workload).await {
                Ok(()) => {
                    report.restored += 1;
                    info!(ns = %paused.namespace, workload = %paused.workload.name, replicas = paused.workload.replicas, "workload restored");
                }
                Err(e) => {
                    let error = format!("{:#}", e);
                    warn!(ns = %paused.namespace, workload = %paused.workload.name, error = %error, "workload restore failed");
                    metrics::counter!("zoneshift_restore_failures_total", 1);
                    report.failures.push(RestoreFailure {
                        target: RestoreTarget::Workload { namespace: paused.namespace.clone(), workload: paused.workload.clone() },
                        error,
                    });
                }
            }
        }

        for app in &record.sync_apps {
            report.attempted += 1;
            match self.cluster.enable_sync_automation(app).await {
                Ok(()) => {
                    report.restored += 1;
                    info!(app = %app.qualified_name(), "sync automation re-enabled");
                }
                Err(e) => {
                    let error = format!("{:#}", e);
                    warn!(app = %app.qualified_name(), error = %error, "sync automation restore failed");
                    metrics::counter!("zoneshift_restore_failures_total", 1);
                    report.failures.push(RestoreFailure { target: RestoreTarget::SyncApp(app.clone()), error });
                }
            }
        }
        report
    }

    /// Pause, run `orch`, resume. A failed pause is compensated immediately and
    /// reported as [`CoordinatorError::Preflight`]; the run itself never is.
    pub async fn execute(
        &self,
        orch: &Orchestrator,
        discovery: &Discovery,
        cancel: CancellationToken,
    ) -> Result<ExecutionReport, CoordinatorError> {
        let mut record = CompensationRecord::default();
        if let Err(cause) = self.pause(discovery, &mut record, &cancel).await {
            warn!(error = %cause, "pre-flight failed; restoring");
            let restore = self.resume(&record).await;
            return Err(CoordinatorError::Preflight { cause, restore });
        }

        let summary = orch.run(cancel).await;
        let restore = self.resume(&record).await;
        Ok(ExecutionReport { summary, restore, record })
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rustc_hash::FxHashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use zoneshift_core::{ClusterGateway, MigrationConfig, RunSummary, TaskStatus, VolumeGateway};

use crate::store::StatusStore;
use crate::task::TaskRunner;

pub(crate) struct Shared {
    pub config: MigrationConfig,
    pub cluster: Arc<dyn ClusterGateway>,
    pub volumes: Arc<dyn VolumeGateway>,
    pub store: StatusStore,
}

/// Runs many task state machines under a concurrency cap. Cheap to clone; clones
/// observe the same status table.
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) shared: Arc<Shared>,
    started: Arc<AtomicBool>,
    done: Arc<AtomicBool>,
}

impl Orchestrator {
    /// Every task in `config` starts out `Pending`.
    pub fn new(config: MigrationConfig, cluster: Arc<dyn ClusterGateway>, volumes: Arc<dyn VolumeGateway>) -> Self {
        let config = config.normalized();
        let store = StatusStore::new(&config.tasks);
        Self {
            shared: Arc::new(Shared { config, cluster, volumes, store }),
            started: Arc::new(AtomicBool::new(false)),
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.shared.config
    }

    pub fn statuses(&self) -> FxHashMap<String, TaskStatus> {
        self.shared.store.snapshot()
    }

    pub fn status(&self, name: &str) -> Option<TaskStatus> {
        self.shared.store.get(name)
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary::from_statuses(self.shared.store.snapshot().values())
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Execute every task and block until all are terminal. Tasks not admitted before
    /// `cancel` fires are marked failed. Only the first call does any work; later
    /// calls return the current summary.
    pub async fn run(&self, cancel: CancellationToken) -> RunSummary {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!("run already started; not running tasks again");
            return self.summary();
        }
        let cfg = &self.shared.config;
        info!(tasks = cfg.tasks.len(), concurrency = cfg.max_concurrency, dry_run = cfg.dry_run, zone = %cfg.target_zone, "run starting");

        let sem = Arc::new(Semaphore::new(cfg.max_concurrency));
        let mut set = JoinSet::new();
        for name in cfg.tasks.iter().cloned() {
            if self.shared.store.get(&name).map_or(true, |s| s.is_terminal()) {
                continue;
            }
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                p = sem.clone().acquire_owned() => p.ok(),
            };
            let Some(permit) = permit else { break };
            let shared = Arc::clone(&self.shared);
            let cancel = cancel.clone();
            set.spawn(async move {
                let _permit = permit;
                let started = Instant::now();
                let runner = TaskRunner {
                    config: &shared.config,
                    cluster: shared.cluster.as_ref(),
                    volumes: shared.volumes.as_ref(),
                    store: &shared.store,
                    cancel: &cancel,
                };
                let outcome = runner.run(&name).await;
                metrics::counter!("zoneshift_tasks_total", 1, "outcome" => outcome.as_str());
                metrics::histogram!("zoneshift_task_duration_ms", started.elapsed().as_millis() as f64);
                outcome
            });
        }

        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "task runner aborted");
            }
        }

        let reason = if cancel.is_cancelled() { "cancelled before start" } else { "task runner exited early" };
        for name in self.shared.store.unfinished() {
            self.shared.store.fail(&name, reason);
        }

        self.done.store(true, Ordering::Release);
        let summary = self.summary();
        info!(
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            failed = summary.failed,
            "run finished"
        );
        summary
    }
}

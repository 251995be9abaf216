//! The per-volume state machine: snapshot, new volume in the target zone, rebind.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zoneshift_core::{
    capacity_to_gib, parse_task_name, static_volume_name, ClusterGateway, MigrationConfig,
    SnapshotState, Step, VolumeGateway, VolumeState,
};

use crate::store::StatusStore;

/// How a task runner finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Migrated,
    /// Already in the target zone.
    Skipped,
    /// Dry run: would have migrated.
    Previewed,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Migrated => "migrated",
            Outcome::Skipped => "skipped",
            Outcome::Previewed => "previewed",
            Outcome::Failed => "failed",
        }
    }
}

/// Drives one task through its steps. Borrowed from the orchestrator for the
/// lifetime of a single run.
pub(crate) struct TaskRunner<'a> {
    pub config: &'a MigrationConfig,
    pub cluster: &'a dyn ClusterGateway,
    pub volumes: &'a dyn VolumeGateway,
    pub store: &'a StatusStore,
    pub cancel: &'a CancellationToken,
}

impl TaskRunner<'_> {
    /// Run to a terminal status. Every error ends up here and nowhere else.
    pub async fn run(&self, name: &str) -> Outcome {
        match self.drive(name).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let msg = format!("{:#}", e);
                if self.store.fail(name, msg.as_str()) {
                    warn!(task = %name, error = %msg, "migration failed");
                } else {
                    warn!(task = %name, error = %msg, "task stopped; status already final");
                }
                Outcome::Failed
            }
        }
    }

    async fn drive(&self, name: &str) -> Result<Outcome> {
        let cfg = self.config;
        let (ns, claim) = parse_task_name(name);

        self.enter(name, Step::GetInfo, 0)?;
        let info = self.cluster.claim_info(ns, claim).await.context("get info")?;
        self.store.update(name, |st| {
            st.old_volume_id = Some(info.volume_id.clone());
            st.volume_name = Some(info.volume_name.clone());
            st.capacity = Some(info.capacity.clone());
        });
        let current = self.volumes.volume_info(&info.volume_id).await.context("get volume info")?;
        self.store.update(name, |st| st.current_zone = Some(current.zone.clone()));

        if current.zone == cfg.target_zone {
            info!(task = %name, zone = %current.zone, "already in target zone");
            self.enter(name, Step::Skipped, 100)?;
            return Ok(Outcome::Skipped);
        }

        // Size is resolved before the first mutation.
        let size_gib = capacity_to_gib(&info.capacity).context("get info")?;

        if cfg.dry_run {
            info!(task = %name, from = %current.zone, to = %cfg.target_zone, size_gib, "dry run: would migrate");
            self.enter(name, Step::Done, 100)?;
            return Ok(Outcome::Previewed);
        }

        self.ensure_live("create snapshot")?;
        self.enter(name, Step::Snapshot, 0)?;
        let snapshot_id = self
            .volumes
            .create_snapshot(&info.volume_id, claim, &cfg.target_zone)
            .await
            .context("create snapshot")?;
        info!(task = %name, snapshot = %snapshot_id, "snapshot started");
        self.store.update(name, |st| st.snapshot_id = Some(snapshot_id.clone()));

        self.enter(name, Step::WaitSnapshot, 0)?;
        self.wait_snapshot(name, &snapshot_id).await?;

        self.ensure_live("create volume")?;
        self.enter(name, Step::CreateVolume, 0)?;
        let new_volume_id = self
            .volumes
            .create_volume(&snapshot_id, &cfg.target_zone, claim, ns, size_gib)
            .await
            .context("create volume")?;
        info!(task = %name, volume = %new_volume_id, zone = %cfg.target_zone, "volume requested");
        self.store.update(name, |st| st.new_volume_id = Some(new_volume_id.clone()));

        self.enter(name, Step::WaitVolume, 0)?;
        self.wait_volume(name, &new_volume_id).await?;

        // The replacement PV must exist before the old claim and PV go away.
        self.ensure_live("create PV")?;
        self.enter(name, Step::CreatePV, 0)?;
        let pv_name = static_volume_name(claim);
        self.cluster
            .create_static_volume(&pv_name, &new_volume_id, &info.capacity, &cfg.storage_class, &cfg.target_zone)
            .await
            .context("create PV")?;

        self.ensure_live("cleanup")?;
        self.enter(name, Step::Cleanup, 0)?;
        self.cluster
            .delete_claim_and_volume(ns, claim, &info.volume_name)
            .await
            .context("cleanup")?;

        // No cancellation check here: the claim is gone and must be recreated.
        self.enter(name, Step::CreatePVC, 0)?;
        self.cluster
            .create_bound_claim(ns, claim, &pv_name, &info.capacity, &cfg.storage_class)
            .await
            .context("create PVC")?;

        self.enter(name, Step::Done, 100)?;
        info!(task = %name, volume = %new_volume_id, "migrated");
        Ok(Outcome::Migrated)
    }

    async fn wait_snapshot(&self, name: &str, snapshot_id: &str) -> Result<()> {
        loop {
            let (percent, state) = self
                .volumes
                .snapshot_progress(snapshot_id)
                .await
                .context("get snapshot progress")?;
            match state {
                SnapshotState::Completed => {
                    self.store.set_progress(name, 100);
                    return Ok(());
                }
                SnapshotState::Error => bail!("snapshot {} entered error state", snapshot_id),
                SnapshotState::Pending => {
                    debug!(task = %name, snapshot = %snapshot_id, percent, "snapshot pending");
                    self.store.set_progress(name, percent);
                }
            }
            self.sleep_or_cancel(self.config.poll.snapshot, "snapshot").await?;
        }
    }

    async fn wait_volume(&self, name: &str, volume_id: &str) -> Result<()> {
        loop {
            let state = self.volumes.volume_state(volume_id).await.context("get volume state")?;
            match &state {
                VolumeState::Available => {
                    self.store.set_progress(name, 100);
                    return Ok(());
                }
                VolumeState::Error => bail!("volume {} entered error state", volume_id),
                other => {
                    debug!(task = %name, volume = %volume_id, state = ?other, "volume not ready");
                    self.store.set_progress(name, other.progress_hint());
                }
            }
            self.sleep_or_cancel(self.config.poll.volume, "volume").await?;
        }
    }

    async fn sleep_or_cancel(&self, every: Duration, what: &str) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(anyhow!("cancelled while waiting for {}", what)),
            _ = tokio::time::sleep(every) => Ok(()),
        }
    }

    /// Move to `step`, or stop if the stored status is already final.
    fn enter(&self, name: &str, step: Step, progress: u8) -> Result<()> {
        if !self.store.advance(name, step, progress) {
            bail!("status of {} is already final; not entering {}", name, step);
        }
        Ok(())
    }

    fn ensure_live(&self, next: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            bail!("cancelled before {}", next);
        }
        Ok(())
    }
}

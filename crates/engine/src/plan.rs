//! Read-only preview: what a run would do, without touching anything.

use anyhow::Result;
use futures::{stream, StreamExt};
use tracing::debug;
use zoneshift_core::{parse_task_name, MigrationPlan, PlanAction, PlanItem};

use crate::orchestrator::Orchestrator;

impl Orchestrator {
    /// Classify every task as `Migrate`, `Skip` or `Error`. Lookups run concurrently
    /// (bounded by the configured concurrency) but rows keep task order.
    pub async fn generate_plan(&self) -> Result<MigrationPlan> {
        let cfg = self.config();
        let items: Vec<PlanItem> = stream::iter(cfg.tasks.iter())
            .map(|name| self.plan_item(name))
            .buffered(cfg.max_concurrency)
            .collect()
            .await;

        for item in &items {
            metrics::counter!("zoneshift_plan_items_total", 1, "action" => item.action.label());
        }

        Ok(MigrationPlan {
            items,
            target_zone: cfg.target_zone.clone(),
            storage_class: cfg.storage_class.clone(),
            dry_run: cfg.dry_run,
            namespaces: cfg.namespaces.clone(),
            concurrency: cfg.max_concurrency,
        })
    }

    async fn plan_item(&self, name: &str) -> PlanItem {
        let cfg = self.config();
        let (ns, claim) = parse_task_name(name);
        let mut item = PlanItem {
            name: name.to_string(),
            namespace: ns.to_string(),
            claim: claim.to_string(),
            volume_name: None,
            volume_id: None,
            capacity: None,
            current_zone: None,
            target_zone: cfg.target_zone.clone(),
            action: PlanAction::Error,
            reason: None,
        };

        let info = match self.shared.cluster.claim_info(ns, claim).await {
            Ok(info) => info,
            Err(e) => {
                item.reason = Some(format!("Failed to get PVC info: {:#}", e));
                return item;
            }
        };
        item.volume_name = Some(info.volume_name);
        item.capacity = Some(info.capacity);
        item.volume_id = Some(info.volume_id.clone());

        let volume = match self.shared.volumes.volume_info(&info.volume_id).await {
            Ok(v) => v,
            Err(e) => {
                item.reason = Some(format!("Failed to get volume info: {:#}", e));
                return item;
            }
        };
        if volume.zone == cfg.target_zone {
            item.action = PlanAction::Skip;
            item.reason = Some("Already in target zone".to_string());
        } else {
            item.action = PlanAction::Migrate;
        }
        item.current_zone = Some(volume.zone);
        debug!(task = %name, action = %item.action, "planned");
        item
    }
}

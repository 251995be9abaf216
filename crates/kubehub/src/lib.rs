//! zoneshift kubehub: kube client bootstrap and the cluster gateway over kube-rs.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, PersistentVolume,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeSpec, Pod, VolumeNodeAffinity,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::config::KubeConfigOptions;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Client, Config};
use metrics::histogram;
use tracing::{debug, info, warn};
use zoneshift_core::{ClaimInfo, ClusterGateway, SyncApp, Workload, WorkloadKind};

pub const EBS_CSI_DRIVER: &str = "ebs.csi.aws.com";
pub const ZONE_LABEL: &str = "topology.kubernetes.io/zone";
pub const MIGRATED_LABEL: &str = "migrated";

/// Build a client from the kubeconfig, using `context` when given, else the usual
/// inference (in-cluster, then current context).
pub async fn kube_client(context: Option<&str>) -> Result<Client> {
    let config = match context {
        Some(ctx) => {
            let opts = KubeConfigOptions { context: Some(ctx.to_string()), ..Default::default() };
            Config::from_kubeconfig(&opts)
                .await
                .with_context(|| format!("loading kubeconfig context {}", ctx))?
        }
        None => Config::infer().await.context("inferring kube config")?,
    };
    Client::try_from(config).context("building kube client")
}

/// [`ClusterGateway`] over a live cluster.
#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
    pod_poll: Duration,
    settle: Duration,
}

impl KubeGateway {
    pub fn new(client: Client) -> Self {
        Self { client, pod_poll: Duration::from_secs(2), settle: Duration::from_secs(2) }
    }

    pub async fn connect(context: Option<&str>) -> Result<Self> {
        Ok(Self::new(kube_client(context).await?))
    }

    pub fn with_pod_poll(mut self, every: Duration) -> Self {
        self.pod_poll = every;
        self
    }

    fn claims(&self, ns: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), ns)
    }

    fn volumes(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }

    fn applications(&self, ns: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), ns, &application_resource())
    }

    async fn set_replicas(&self, ns: &str, kind: WorkloadKind, name: &str, replicas: i32) -> Result<()> {
        let pp = PatchParams::default();
        let payload = serde_json::json!({"spec": {"replicas": replicas}});
        match kind {
            WorkloadKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), ns);
                api.patch(name, &pp, &Patch::Merge(&payload)).await?;
            }
            WorkloadKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), ns);
                api.patch(name, &pp, &Patch::Merge(&payload)).await?;
            }
        }
        Ok(())
    }

    async fn count_active_pods(&self, ns: &str) -> Result<usize> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        let list = pods.list(&ListParams::default()).await.with_context(|| format!("list pods in {}", ns))?;
        Ok(list
            .items
            .iter()
            .filter(|p| is_active_phase(p.status.as_ref().and_then(|s| s.phase.as_deref())))
            .count())
    }
}

#[async_trait::async_trait]
impl ClusterGateway for KubeGateway {
    async fn list_claims(&self, namespace: &str) -> Result<Vec<String>> {
        let list = self
            .claims(namespace)
            .list(&ListParams::default())
            .await
            .with_context(|| format!("list PVCs in namespace {}", namespace))?;
        Ok(list.items.into_iter().filter_map(|c| c.metadata.name).collect())
    }

    async fn claim_info(&self, namespace: &str, claim: &str) -> Result<ClaimInfo> {
        let pvc = self
            .claims(namespace)
            .get(claim)
            .await
            .with_context(|| format!("get PVC {}/{}", namespace, claim))?;
        let volume_name = pvc
            .spec
            .as_ref()
            .and_then(|s| s.volume_name.clone())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow!("PVC {} is not bound to any PV", claim))?;
        let capacity = claim_capacity(&pvc).ok_or_else(|| anyhow!("PVC {} has no storage request", claim))?;

        let pv = self.volumes().get(&volume_name).await.with_context(|| format!("get PV {}", volume_name))?;
        let volume_id =
            backing_volume_id(&pv).ok_or_else(|| anyhow!("PV {} is not backed by an EBS volume", volume_name))?;
        Ok(ClaimInfo { volume_name, volume_id, capacity })
    }

    async fn delete_claim_and_volume(&self, namespace: &str, claim: &str, volume_name: &str) -> Result<()> {
        let pp = PatchParams::default();
        let clear = serde_json::json!({"metadata": {"finalizers": null}});
        let claims = self.claims(namespace);
        let volumes = self.volumes();

        if let Err(e) = claims.patch(claim, &pp, &Patch::Merge(&clear)).await {
            log_best_effort("clear PVC finalizers", claim, &e);
        }
        let dp = DeleteParams {
            grace_period_seconds: Some(0),
            propagation_policy: Some(PropagationPolicy::Foreground),
            ..Default::default()
        };
        if let Err(e) = claims.delete(claim, &dp).await {
            log_best_effort("delete PVC", claim, &e);
        }

        if let Err(e) = volumes.patch(volume_name, &pp, &Patch::Merge(&clear)).await {
            log_best_effort("clear PV finalizers", volume_name, &e);
        }
        let dp = DeleteParams { grace_period_seconds: Some(0), ..Default::default() };
        if let Err(e) = volumes.delete(volume_name, &dp).await {
            log_best_effort("delete PV", volume_name, &e);
        }

        // Give the API server a moment before the claim name is reused.
        tokio::time::sleep(self.settle).await;
        info!(ns = %namespace, pvc = %claim, pv = %volume_name, "old PVC and PV removed");
        Ok(())
    }

    async fn create_static_volume(
        &self,
        name: &str,
        cloud_volume_id: &str,
        capacity: &str,
        storage_class: &str,
        zone: &str,
    ) -> Result<()> {
        let pv = static_volume(name, cloud_volume_id, capacity, storage_class, zone);
        self.volumes()
            .create(&PostParams::default(), &pv)
            .await
            .with_context(|| format!("create PV {}", name))?;
        info!(pv = %name, volume = %cloud_volume_id, zone = %zone, "static PV created");
        Ok(())
    }

    async fn create_bound_claim(
        &self,
        namespace: &str,
        claim: &str,
        volume_name: &str,
        capacity: &str,
        storage_class: &str,
    ) -> Result<()> {
        let pvc = bound_claim(namespace, claim, volume_name, capacity, storage_class);
        self.claims(namespace)
            .create(&PostParams::default(), &pvc)
            .await
            .with_context(|| format!("create PVC {}/{}", namespace, claim))?;
        info!(ns = %namespace, pvc = %claim, pv = %volume_name, "PVC created");
        Ok(())
    }

    async fn scale_workloads_to_zero(&self, namespace: &str) -> Result<Vec<Workload>> {
        let running = self.running_workloads(namespace).await?;
        for w in &running {
            self.set_replicas(namespace, w.kind, &w.name, 0)
                .await
                .with_context(|| format!("scale {} {}/{} to 0", w.kind, namespace, w.name))?;
            debug!(ns = %namespace, kind = %w.kind, name = %w.name, from = w.replicas, "scaled to zero");
        }
        Ok(running)
    }

    async fn wait_until_no_pods_running(&self, namespace: &str, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            let active = self.count_active_pods(namespace).await?;
            if active == 0 {
                histogram!("zoneshift_pod_drain_ms", started.elapsed().as_secs_f64() * 1000.0);
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!("timeout waiting for {} pod(s) in namespace {} to terminate", active, namespace);
            }
            debug!(ns = %namespace, active, "pods still running");
            tokio::time::sleep(self.pod_poll).await;
        }
    }

    async fn restore_workload_replicas(&self, namespace: &str, workload: &Workload) -> Result<()> {
        self.set_replicas(namespace, workload.kind, &workload.name, workload.replicas)
            .await
            .with_context(|| format!("scale {} {}/{} to {}", workload.kind, namespace, workload.name, workload.replicas))
    }

    async fn running_workloads(&self, namespace: &str) -> Result<Vec<Workload>> {
        let mut out = Vec::new();
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        for d in deployments.list(&ListParams::default()).await.context("list deployments")?.items {
            let replicas = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            if let (Some(name), true) = (d.metadata.name, replicas > 0) {
                out.push(Workload::new(WorkloadKind::Deployment, name, replicas));
            }
        }
        let sets: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        for s in sets.list(&ListParams::default()).await.context("list statefulsets")?.items {
            let replicas = s.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            if let (Some(name), true) = (s.metadata.name, replicas > 0) {
                out.push(Workload::new(WorkloadKind::StatefulSet, name, replicas));
            }
        }
        Ok(out)
    }

    async fn find_sync_automation(&self, namespace: &str, search_namespaces: &[String]) -> Result<Vec<SyncApp>> {
        let mut out = Vec::new();
        for search in search_namespaces {
            // Missing CRD or RBAC in one namespace is not fatal.
            let list = match self.applications(search).list(&ListParams::default()).await {
                Ok(l) => l,
                Err(e) => {
                    debug!(ns = %search, error = %e, "cannot list applications; skipping");
                    continue;
                }
            };
            for app in list.items {
                let Some(name) = app.metadata.name.clone() else { continue };
                if let Some(policy) = automated_policy_for(&app.data, namespace) {
                    out.push(SyncApp { name, namespace: search.clone(), automated_policy: policy });
                }
            }
        }
        Ok(out)
    }

    async fn disable_sync_automation(&self, app: &SyncApp) -> Result<()> {
        let payload = serde_json::json!({"spec": {"syncPolicy": {"automated": null}}});
        self.applications(&app.namespace)
            .patch(&app.name, &PatchParams::default(), &Patch::Merge(&payload))
            .await
            .with_context(|| format!("patch application {}", app.qualified_name()))?;
        Ok(())
    }

    async fn enable_sync_automation(&self, app: &SyncApp) -> Result<()> {
        let payload = serde_json::json!({"spec": {"syncPolicy": {"automated": app.automated_policy}}});
        self.applications(&app.namespace)
            .patch(&app.name, &PatchParams::default(), &Patch::Merge(&payload))
            .await
            .with_context(|| format!("patch application {}", app.qualified_name()))?;
        Ok(())
    }
}

fn log_best_effort(what: &str, name: &str, err: &kube::Error) {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => debug!(%name, "{}: already gone", what),
        _ => warn!(%name, error = %err, "{} failed; continuing", what),
    }
}

/// Argo CD `Application` (argoproj.io/v1alpha1).
pub fn application_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk("argoproj.io", "v1alpha1", "Application"), "applications")
}

/// The automated sync policy of an application deploying into `target_ns`, if it has one.
pub fn automated_policy_for(app: &serde_json::Value, target_ns: &str) -> Option<serde_json::Value> {
    let spec = app.get("spec")?;
    let dest = spec.get("destination")?.get("namespace")?.as_str()?;
    if dest != target_ns {
        return None;
    }
    let automated = spec.get("syncPolicy")?.get("automated")?;
    if automated.is_null() {
        return None;
    }
    Some(automated.clone())
}

/// Cloud volume id behind a PV: the CSI handle, or the last segment of a legacy
/// in-tree EBS id (`aws://us-east-1a/vol-123`).
pub fn backing_volume_id(pv: &PersistentVolume) -> Option<String> {
    let spec = pv.spec.as_ref()?;
    let id = match (&spec.csi, &spec.aws_elastic_block_store) {
        (Some(csi), _) => csi.volume_handle.clone(),
        (None, Some(ebs)) => ebs.volume_id.rsplit('/').next().unwrap_or_default().to_string(),
        (None, None) => return None,
    };
    (!id.is_empty()).then_some(id)
}

fn claim_capacity(pvc: &PersistentVolumeClaim) -> Option<String> {
    let requested = pvc
        .spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"));
    let actual = pvc.status.as_ref().and_then(|s| s.capacity.as_ref()).and_then(|c| c.get("storage"));
    requested.or(actual).map(|q| q.0.clone())
}

fn is_active_phase(phase: Option<&str>) -> bool {
    matches!(phase, Some("Running") | Some("Pending"))
}

fn migrated_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(MIGRATED_LABEL.to_string(), "true".to_string())])
}

fn storage(capacity: &str) -> BTreeMap<String, Quantity> {
    BTreeMap::from([("storage".to_string(), Quantity(capacity.to_string()))])
}

/// Retained, RWO filesystem PV pinned to `zone` and pointing at an existing cloud volume.
pub fn static_volume(name: &str, volume_id: &str, capacity: &str, storage_class: &str, zone: &str) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta { name: Some(name.to_string()), labels: Some(migrated_labels()), ..Default::default() },
        spec: Some(PersistentVolumeSpec {
            capacity: Some(storage(capacity)),
            volume_mode: Some("Filesystem".to_string()),
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            persistent_volume_reclaim_policy: Some("Retain".to_string()),
            storage_class_name: Some(storage_class.to_string()),
            csi: Some(CSIPersistentVolumeSource {
                driver: EBS_CSI_DRIVER.to_string(),
                volume_handle: volume_id.to_string(),
                fs_type: Some("ext4".to_string()),
                ..Default::default()
            }),
            node_affinity: Some(VolumeNodeAffinity {
                required: Some(NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: Some(vec![NodeSelectorRequirement {
                            key: ZONE_LABEL.to_string(),
                            operator: "In".to_string(),
                            values: Some(vec![zone.to_string()]),
                        }]),
                        ..Default::default()
                    }],
                }),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// RWO claim pre-bound to `volume_name`.
pub fn bound_claim(
    namespace: &str,
    claim: &str,
    volume_name: &str,
    capacity: &str,
    storage_class: &str,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(claim.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(migrated_labels()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: Some(storage_class.to_string()),
            volume_name: Some(volume_name.to_string()),
            resources: Some(VolumeResourceRequirements { requests: Some(storage(capacity)), ..Default::default() }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::AWSElasticBlockStoreVolumeSource;

    fn pv_with(spec: PersistentVolumeSpec) -> PersistentVolume {
        PersistentVolume { spec: Some(spec), ..Default::default() }
    }

    #[test]
    fn backing_id_from_csi_or_legacy_ebs() {
        let csi = pv_with(PersistentVolumeSpec {
            csi: Some(CSIPersistentVolumeSource {
                driver: EBS_CSI_DRIVER.into(),
                volume_handle: "vol-0abc".into(),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(backing_volume_id(&csi).as_deref(), Some("vol-0abc"));

        let legacy = pv_with(PersistentVolumeSpec {
            aws_elastic_block_store: Some(AWSElasticBlockStoreVolumeSource {
                volume_id: "aws://us-east-1b/vol-0def".into(),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(backing_volume_id(&legacy).as_deref(), Some("vol-0def"));

        assert_eq!(backing_volume_id(&pv_with(PersistentVolumeSpec::default())), None);
        assert_eq!(backing_volume_id(&PersistentVolume::default()), None);
    }

    #[test]
    fn static_volume_is_pinned_and_retained() {
        let pv = static_volume("data-static", "vol-new", "50Gi", "gp3", "us-east-1a");
        assert_eq!(pv.metadata.name.as_deref(), Some("data-static"));
        assert_eq!(pv.metadata.labels.as_ref().unwrap()["migrated"], "true");
        let spec = pv.spec.unwrap();
        assert_eq!(spec.persistent_volume_reclaim_policy.as_deref(), Some("Retain"));
        assert_eq!(spec.capacity.unwrap()["storage"].0, "50Gi");
        let csi = spec.csi.unwrap();
        assert_eq!((csi.driver.as_str(), csi.volume_handle.as_str()), (EBS_CSI_DRIVER, "vol-new"));
        let term = &spec.node_affinity.unwrap().required.unwrap().node_selector_terms[0];
        let req = &term.match_expressions.as_ref().unwrap()[0];
        assert_eq!(req.key, ZONE_LABEL);
        assert_eq!(req.values.as_deref(), Some(&["us-east-1a".to_string()][..]));
    }

    #[test]
    fn bound_claim_targets_static_volume() {
        let pvc = bound_claim("prod", "data", "data-static", "50Gi", "gp3");
        assert_eq!(pvc.metadata.namespace.as_deref(), Some("prod"));
        let spec = pvc.spec.as_ref().unwrap();
        assert_eq!(spec.volume_name.as_deref(), Some("data-static"));
        assert_eq!(spec.storage_class_name.as_deref(), Some("gp3"));
        assert_eq!(claim_capacity(&pvc).as_deref(), Some("50Gi"));
    }

    #[test]
    fn automated_policy_matches_destination() {
        let app = serde_json::json!({
            "spec": {
                "destination": {"namespace": "prod"},
                "syncPolicy": {"automated": {"prune": true}}
            }
        });
        assert_eq!(automated_policy_for(&app, "prod"), Some(serde_json::json!({"prune": true})));
        assert_eq!(automated_policy_for(&app, "stage"), None);

        let manual = serde_json::json!({"spec": {"destination": {"namespace": "prod"}, "syncPolicy": {}}});
        assert_eq!(automated_policy_for(&manual, "prod"), None);
        let nulled = serde_json::json!({"spec": {"destination": {"namespace": "prod"}, "syncPolicy": {"automated": null}}});
        assert_eq!(automated_policy_for(&nulled, "prod"), None);
    }

    #[test]
    fn only_running_and_pending_pods_block_drain() {
        assert!(is_active_phase(Some("Running")));
        assert!(is_active_phase(Some("Pending")));
        assert!(!is_active_phase(Some("Succeeded")));
        assert!(!is_active_phase(None));
    }

    #[test]
    fn application_resource_uses_plural() {
        let ar = application_resource();
        assert_eq!((ar.group.as_str(), ar.version.as_str(), ar.plural.as_str()), ("argoproj.io", "v1alpha1", "applications"));
        assert_eq!(ar.api_version, "argoproj.io/v1alpha1");
    }
}

//! zoneshift cloud: EBS snapshots and volumes behind the volume gateway.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use aws_config::BehaviorVersion;
use aws_sdk_ec2::error::DisplayErrorContext;
use aws_sdk_ec2::types::{ResourceType, Tag, TagSpecification, VolumeType};
use aws_sdk_ec2::Client;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};
use zoneshift_core::{SnapshotState, VolumeGateway, VolumeInfo, VolumeState};

/// Characters EC2 accepts in tag values; everything else becomes `_`.
static TAG_UNSAFE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z0-9\s_.:/=+\-@]").expect("tag sanitizer regex"));

pub fn sanitize_tag(value: &str) -> String {
    TAG_UNSAFE.replace_all(value, "_").into_owned()
}

/// `"45%"` -> 45. Anything unparsable reads as 0; values are clamped to 100.
pub fn parse_progress(raw: Option<&str>) -> u8 {
    raw.map(|s| s.trim().trim_end_matches('%').trim())
        .and_then(|s| s.parse::<u32>().ok())
        .map(|p| p.min(100) as u8)
        .unwrap_or(0)
}

fn tag(key: &str, value: &str) -> Tag {
    Tag::builder().key(key).value(sanitize_tag(value)).build()
}

fn sdk_err<E: std::error::Error>(e: E) -> anyhow::Error {
    anyhow!("{}", DisplayErrorContext(e))
}

/// [`VolumeGateway`] over the EC2 API.
#[derive(Clone)]
pub struct Ec2Gateway {
    client: Client,
}

impl Ec2Gateway {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Region and credentials from the standard AWS environment/profile chain.
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        Self::new(Client::new(&config))
    }
}

#[async_trait::async_trait]
impl VolumeGateway for Ec2Gateway {
    async fn create_snapshot(&self, volume_id: &str, claim: &str, target_zone: &str) -> Result<String> {
        let tags = TagSpecification::builder()
            .resource_type(ResourceType::Snapshot)
            .tags(tag("Name", &format!("migrate-{}", claim)))
            .tags(tag("MigratedPVC", claim))
            .build();
        let out = self
            .client
            .create_snapshot()
            .volume_id(volume_id)
            .description(sanitize_tag(&format!("Migrate {} to {}", claim, target_zone)))
            .tag_specifications(tags)
            .send()
            .await
            .map_err(sdk_err)
            .with_context(|| format!("create snapshot of {}", volume_id))?;
        let id = out
            .snapshot_id()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("create snapshot of {} returned no snapshot id", volume_id))?;
        info!(volume = %volume_id, snapshot = %id, "snapshot created");
        Ok(id)
    }

    async fn snapshot_progress(&self, snapshot_id: &str) -> Result<(u8, SnapshotState)> {
        let out = self
            .client
            .describe_snapshots()
            .snapshot_ids(snapshot_id)
            .send()
            .await
            .map_err(sdk_err)
            .with_context(|| format!("describe snapshot {}", snapshot_id))?;
        let snap = out.snapshots().first().ok_or_else(|| anyhow!("snapshot {} not found", snapshot_id))?;
        let state = SnapshotState::from_provider(snap.state().map(|s| s.as_str()).unwrap_or("pending"));
        let progress = parse_progress(snap.progress());
        debug!(snapshot = %snapshot_id, progress, ?state, "snapshot polled");
        Ok((progress, state))
    }

    async fn create_volume(
        &self,
        snapshot_id: &str,
        zone: &str,
        claim: &str,
        namespace: &str,
        size_gib: i32,
    ) -> Result<String> {
        let tags = TagSpecification::builder()
            .resource_type(ResourceType::Volume)
            .tags(tag("Name", &format!("migrated-{}", claim)))
            .tags(tag("MigratedPVC", claim))
            .tags(tag("kubernetes.io/created-for/pvc/name", claim))
            .tags(tag("kubernetes.io/created-for/pvc/namespace", namespace))
            .build();
        let out = self
            .client
            .create_volume()
            .snapshot_id(snapshot_id)
            .availability_zone(zone)
            .volume_type(VolumeType::Gp3)
            .size(size_gib)
            .tag_specifications(tags)
            .send()
            .await
            .map_err(sdk_err)
            .with_context(|| format!("create volume from {} in {}", snapshot_id, zone))?;
        let id = out
            .volume_id()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("create volume from {} returned no volume id", snapshot_id))?;
        info!(snapshot = %snapshot_id, volume = %id, zone = %zone, size_gib, "volume created");
        Ok(id)
    }

    async fn volume_state(&self, volume_id: &str) -> Result<VolumeState> {
        Ok(self.volume_info(volume_id).await?.state)
    }

    async fn volume_info(&self, volume_id: &str) -> Result<VolumeInfo> {
        let out = self
            .client
            .describe_volumes()
            .volume_ids(volume_id)
            .send()
            .await
            .map_err(sdk_err)
            .with_context(|| format!("describe volume {}", volume_id))?;
        let vol = out.volumes().first().ok_or_else(|| anyhow!("volume {} not found", volume_id))?;
        let zone = vol
            .availability_zone()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("volume {} has no availability zone", volume_id))?;
        let state = VolumeState::from_provider(vol.state().map(|s| s.as_str()).unwrap_or("unknown"));
        Ok(VolumeInfo { volume_id: volume_id.to_string(), zone, state })
    }
}

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use rand::Rng;
use tracing::info;

use crate::{
    aws::ec2::{Ec2Api, VolumeRequest},
    targets::TargetTable,
    zones::AzMapping,
};

/// Tags for a restored volume: the system's own tags plus where it came from.
pub fn volume_tags(
    system: &str,
    device: &str,
    system_tags: &BTreeMap<String, String>,
    tag_prefix: &str,
) -> BTreeMap<String, String> {
    let mut tags = system_tags.clone();
    tags.insert("source-system".to_string(), system.to_string());
    tags.insert("device".to_string(), device.to_string());
    tags.insert("Name".to_string(), format!("{tag_prefix}-volume"));
    tags
}

/// Create one encrypted volume per declared snapshot of every pending system.
///
/// Each system gets a single zone, picked at random, so all of its volumes and
/// (later) its instance end up together.
pub async fn provision_volumes<C, R>(
    api: &C,
    table: &mut TargetTable,
    zones: &AzMapping,
    tag_prefix: &str,
    rng: &mut R,
) -> Result<()>
where
    C: Ec2Api,
    R: Rng + ?Sized,
{
    for (system, record) in table.iter_mut().filter(|(_, r)| r.is_pending()) {
        info!(system = %system, "processing system");

        let zone = zones
            .choose_zone(rng)
            .context("no availability zone to place volumes in")?
            .to_string();
        let subnet = zones
            .subnet_for(&zone)
            .with_context(|| format!("no subnet in zone {zone}"))?;
        record.subnet_id = Some(subnet.to_string());

        for (device, snapshot) in &record.spec.source_snapshots {
            info!(
                system = %system,
                device = %device,
                snapshot = %snapshot,
                zone = %zone,
                "creating volume"
            );
            let request = VolumeRequest {
                snapshot_id: snapshot.clone(),
                zone: zone.clone(),
                tags: volume_tags(system, device, &record.spec.tags, tag_prefix),
            };
            let volume_id = api
                .create_volume(&request)
                .await
                .with_context(|| format!("create volume for {system}/{device}"))?;
            info!(system = %system, device = %device, volume = %volume_id, "created volume");
            record
                .provisioned_volumes
                .insert(device.clone(), volume_id);
        }
    }
    Ok(())
}

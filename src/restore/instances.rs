use std::collections::BTreeMap;

use anyhow::{Context, Result};
use tracing::info;

use crate::{
    aws::ec2::{Ec2Api, InstanceRequest},
    targets::TargetTable,
};

use super::RestoreOptions;

pub fn instance_tags(
    system: &str,
    system_tags: &BTreeMap<String, String>,
    tag_prefix: &str,
) -> BTreeMap<String, String> {
    let mut tags = system_tags.clone();
    tags.insert("Name".to_string(), format!("{tag_prefix}-{system}-instance"));
    tags
}

/// Launch one bare instance per pending system, in the subnet picked for its
/// volumes. Returns the launched instance ids in table order.
pub async fn launch_instances<C: Ec2Api>(
    api: &C,
    table: &mut TargetTable,
    options: &RestoreOptions,
) -> Result<Vec<String>> {
    let mut launched = vec![];
    for (system, record) in table.iter_mut().filter(|(_, r)| r.is_pending()) {
        let subnet_id = record
            .subnet_id
            .clone()
            .with_context(|| format!("no subnet assigned to {system}"))?;
        let request = InstanceRequest {
            image_id: record.spec.image_id.clone(),
            instance_type: record
                .spec
                .instance_type
                .clone()
                .unwrap_or_else(|| options.default_instance_type.clone()),
            key_name: record.spec.key_name.clone(),
            security_group: options.security_group.clone(),
            subnet_id,
            tags: instance_tags(system, &record.spec.tags, &options.tag_prefix),
        };
        let instance_id = api
            .run_instance(&request)
            .await
            .with_context(|| format!("launch instance for {system}"))?;
        info!(
            system = %system,
            instance = %instance_id,
            subnet = %request.subnet_id,
            "launched instance"
        );
        record.instance_id = Some(instance_id.clone());
        launched.push(instance_id);
    }
    Ok(launched)
}

/// Give the guests time to boot, then stop every launched instance.
pub async fn stop_after_boot<C: Ec2Api>(
    api: &C,
    instance_ids: &[String],
    options: &RestoreOptions,
) -> Result<()> {
    if instance_ids.is_empty() {
        return Ok(());
    }
    let grace = options.timings.boot_grace;
    info!(seconds = grace.as_secs(), "waiting for instances to boot");
    tokio::time::sleep(grace).await;

    for batch in instance_ids.chunks(options.batch_size.max(1)) {
        info!(count = batch.len(), "stopping instances");
        api.stop_instances(batch).await?;
    }
    Ok(())
}

pub async fn start_instances<C: Ec2Api>(
    api: &C,
    instance_ids: &[String],
    batch_size: usize,
) -> Result<()> {
    for batch in instance_ids.chunks(batch_size.max(1)) {
        info!(count = batch.len(), "starting instances");
        api.start_instances(batch).await?;
    }
    Ok(())
}

//! Per-system root volume swap.
//!
//! ```text
//! pending -> stopped -> volumes available -> root detached -> root deleted
//!         -> volumes attached -> completed
//! ```
//!
//! Any wait that times out or errors moves the system to `failed` before anything
//! destructive happens to it. The old root volume is only touched once the
//! instance is stopped and every restored volume is `available`.

use std::collections::BTreeMap;

use anyhow::Result;
use aws_sdk_ec2::types::{InstanceStateName, VolumeState};
use tracing::{error, info, warn};

use crate::{
    aws::ec2::Ec2Api,
    targets::{Attachment, Status, TargetRecord, TargetTable},
    wait::{poll_until, PollOutcome, PollPolicy},
};

use super::Timings;

pub async fn swap_roots<C: Ec2Api>(api: &C, table: &mut TargetTable, timings: &Timings) {
    for (system, record) in table.iter_mut().filter(|(_, r)| r.is_pending()) {
        swap_root(api, system, record, timings).await;
        match record.status {
            Status::Completed => info!(system = %system, "root volume replaced"),
            _ => error!(
                system = %system,
                reason = record.failure.as_deref().unwrap_or("unknown"),
                "skipping system"
            ),
        }
    }
}

/// Instance ids of every system that completed, in table order.
pub fn completed_instances(table: &TargetTable) -> Vec<String> {
    table
        .values()
        .filter(|r| r.status == Status::Completed)
        .filter_map(|r| r.instance_id.clone())
        .collect()
}

/// `completed` only if every restored volume attached.
pub fn status_from_attachments(attachments: &BTreeMap<String, Attachment>) -> Status {
    if !attachments.is_empty() && attachments.values().all(|a| a.attached) {
        Status::Completed
    } else {
        Status::Failed
    }
}

async fn swap_root<C: Ec2Api>(
    api: &C,
    system: &str,
    record: &mut TargetRecord,
    timings: &Timings,
) {
    let Some(instance_id) = record.instance_id.clone() else {
        record.fail("no instance was launched");
        return;
    };

    let stopped =
        wait_for_instance(api, &instance_id, InstanceStateName::Stopped, timings.poll).await;
    match stopped {
        Ok(PollOutcome::Ready) => {}
        Ok(PollOutcome::TimedOut) => {
            record.fail(format!("timed out waiting for {instance_id} to stop"));
            return;
        }
        Err(e) => {
            record.fail(format!("failed waiting for {instance_id} to stop: {e:#}"));
            return;
        }
    }

    if let Err(reason) = wait_for_volumes(api, &record.provisioned_volumes, timings.poll).await {
        record.fail(reason);
        return;
    }

    let root = match api.root_volume(&instance_id).await {
        Ok(Some(root)) => root,
        Ok(None) => {
            record.fail(format!("no root volume found on {instance_id}"));
            return;
        }
        Err(e) => {
            record.fail(format!("failed to look up root volume of {instance_id}: {e:#}"));
            return;
        }
    };
    record.root_volume_id = Some(root.clone());

    info!(system = %system, instance = %instance_id, volume = %root, "detaching root volume");
    if let Err(e) = api.detach_volume(&root).await {
        record.fail(format!("{e:#}"));
        return;
    }
    tokio::time::sleep(timings.detach_settle).await;

    info!(system = %system, volume = %root, "deleting old root volume");
    match api.delete_volume(&root).await {
        Ok(()) => record.root_volume_deleted = true,
        Err(e) => warn!(system = %system, volume = %root, "old root volume left behind: {e:#}"),
    }

    for (device, volume_id) in &record.provisioned_volumes {
        let path = format!("/dev/{device}");
        info!(
            system = %system,
            instance = %instance_id,
            volume = %volume_id,
            device = %path,
            "attaching restored volume"
        );
        let attachment = match api.attach_volume(volume_id, &instance_id, &path).await {
            Ok(()) => Attachment {
                volume_id: volume_id.clone(),
                attached: true,
                error: None,
            },
            Err(e) => {
                error!(system = %system, volume = %volume_id, "failed to attach: {e:#}");
                Attachment {
                    volume_id: volume_id.clone(),
                    attached: false,
                    error: Some(format!("{e:#}")),
                }
            }
        };
        record.attachments.insert(device.clone(), attachment);
    }

    match status_from_attachments(&record.attachments) {
        Status::Completed => record.status = Status::Completed,
        _ => {
            let failed: Vec<&str> = record
                .attachments
                .iter()
                .filter(|(_, a)| !a.attached)
                .map(|(device, _)| device.as_str())
                .collect();
            let reason = format!("failed to attach {}", failed.join(", "));
            record.fail(reason);
        }
    }
}

async fn wait_for_instance<C: Ec2Api>(
    api: &C,
    instance_id: &str,
    target: InstanceStateName,
    policy: PollPolicy,
) -> Result<PollOutcome> {
    poll_until(policy, instance_id, || {
        let target = target.clone();
        async move {
            let state = api.instance_state(instance_id).await?;
            Ok::<_, anyhow::Error>(state == target)
        }
    })
    .await
}

/// Wait for every volume to become available. Errors while polling count as
/// "not ready".
async fn wait_for_volumes<C: Ec2Api>(
    api: &C,
    volumes: &BTreeMap<String, String>,
    policy: PollPolicy,
) -> Result<(), String> {
    for volume_id in volumes.values() {
        let outcome = poll_until(policy, volume_id, || async move {
            let state = api.volume_state(volume_id).await?;
            Ok::<_, anyhow::Error>(state == VolumeState::Available)
        })
        .await;
        match outcome {
            Ok(PollOutcome::Ready) => {}
            Ok(PollOutcome::TimedOut) => {
                return Err(format!("timed out waiting for {volume_id} to become available"))
            }
            Err(e) => return Err(format!("volume {volume_id} not ready: {e:#}")),
        }
    }
    Ok(())
}

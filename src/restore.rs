//! Restore one generation of instances from snapshots.
//!
//! The stages run strictly in order over the whole target table:
//!
//! 1. resolve the candidate subnets to availability zones,
//! 2. create a volume per declared snapshot ([`volumes`]),
//! 3. launch and stop a bare instance per system ([`instances`]),
//! 4. swap each instance's root volume for the restored ones ([`swap`]),
//! 5. start the instances whose swap completed.
//!
//! Only entries in the `pending` state are touched. The table is written to the
//! output file whether or not the run succeeds, so it always shows which systems
//! need attention.

use std::{collections::BTreeMap, path::Path, time::Duration};

use anyhow::Result;
use rand::Rng;
use tracing::{error, info, warn};

use crate::{
    aws::ec2::Ec2Api,
    targets::{save_targets, validate, Status, TargetTable},
    wait::PollPolicy,
    zones::AzMapping,
};

pub mod instances;
pub mod swap;
pub mod volumes;

pub const DEFAULT_INSTANCE_TYPE: &str = "t2.micro";
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Fixed delays of the restore workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Pause between launching the instances and stopping them.
    pub boot_grace: Duration,
    /// Waiting for instances to stop and volumes to become available.
    pub poll: PollPolicy,
    /// Pause between detaching the old root volume and deleting it.
    pub detach_settle: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            boot_grace: Duration::from_secs(60),
            poll: PollPolicy::default(),
            detach_settle: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub security_group: String,
    pub subnet_ids: Vec<String>,
    /// Prefix of the `Name` tag on created volumes and instances.
    pub tag_prefix: String,
    pub default_instance_type: String,
    /// Most instance ids sent in one stop or start request.
    pub batch_size: usize,
    pub timings: Timings,
}

impl RestoreOptions {
    pub fn new(security_group: impl Into<String>, subnet_ids: Vec<String>) -> Self {
        Self {
            security_group: security_group.into(),
            subnet_ids,
            tag_prefix: "restored".to_string(),
            default_instance_type: DEFAULT_INSTANCE_TYPE.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            timings: Timings::default(),
        }
    }
}

/// Where every system ended up after a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    /// Failed after the original root volume was deleted.
    pub stranded: Vec<String>,
    pub pending: Vec<String>,
}

impl RestoreSummary {
    pub fn from_table(table: &TargetTable) -> Self {
        let mut summary = Self::default();
        for (system, record) in table {
            match record.status {
                Status::Completed => summary.completed.push(system.clone()),
                Status::Failed if record.is_stranded() => summary.stranded.push(system.clone()),
                Status::Failed => summary.failed.push(system.clone()),
                Status::Pending => summary.pending.push(system.clone()),
            }
        }
        summary
    }

    pub fn log(&self, table: &TargetTable) {
        info!(
            completed = self.completed.len(),
            failed = self.failed.len(),
            stranded = self.stranded.len(),
            "restore finished"
        );
        for system in &self.failed {
            let reason = table.get(system).and_then(|r| r.failure.as_deref());
            warn!(
                system = %system,
                reason = reason.unwrap_or("unknown"),
                "system failed, instance left stopped"
            );
        }
        for system in &self.stranded {
            let record = table.get(system);
            error!(
                system = %system,
                instance = record.and_then(|r| r.instance_id.as_deref()).unwrap_or("unknown"),
                reason = record.and_then(|r| r.failure.as_deref()).unwrap_or("unknown"),
                "system is stopped without a root volume and needs manual repair"
            );
        }
    }
}

/// Run every stage over the pending entries of `table`, mutating it in place.
///
/// Provider errors while resolving subnets or creating resources abort the run;
/// whatever was recorded up to that point stays in `table`. Timeouts and
/// per-volume problems only fail the system they belong to.
pub async fn run<C, R>(
    api: &C,
    table: &mut TargetTable,
    options: &RestoreOptions,
    rng: &mut R,
) -> Result<RestoreSummary>
where
    C: Ec2Api,
    R: Rng + ?Sized,
{
    let pending = table.values().filter(|r| r.is_pending()).count();
    if pending == 0 {
        info!("no pending systems, nothing to restore");
        return Ok(RestoreSummary::from_table(table));
    }
    info!(systems = pending, "restoring systems from snapshots");

    let zones = AzMapping::resolve(api, &options.subnet_ids).await?;
    volumes::provision_volumes(api, table, &zones, &options.tag_prefix, rng).await?;

    let launched = instances::launch_instances(api, table, options).await?;
    instances::stop_after_boot(api, &launched, options).await?;

    swap::swap_roots(api, table, &options.timings).await;

    let completed = swap::completed_instances(table);
    instances::start_instances(api, &completed, options.batch_size).await?;

    Ok(RestoreSummary::from_table(table))
}

/// Validate `entries`, run the restore, and write the table to `output`.
///
/// Nothing is created and nothing is written when validation fails.
pub async fn execute<C, R>(
    api: &C,
    entries: BTreeMap<String, serde_yaml::Value>,
    output: &Path,
    options: &RestoreOptions,
    rng: &mut R,
) -> Result<RestoreSummary>
where
    C: Ec2Api,
    R: Rng + ?Sized,
{
    let mut table = validate(entries)?;

    let result = run(api, &mut table, options, rng).await;
    let saved = save_targets(output, &table);
    if let Err(e) = &saved {
        error!(output = %output.display(), "failed to save results: {e:#}");
    } else {
        info!(output = %output.display(), "saved results");
    }

    RestoreSummary::from_table(&table).log(&table);
    let summary = result?;
    saved?;
    Ok(summary)
}

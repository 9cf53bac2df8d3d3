//! Snapshot the volumes of running instances and write a target file for
//! [`restore`](crate::restore).
//!
//! Every entry keeps the volumes it was taken from under `sourceVolumes`; the
//! restore loader rejects entries whose snapshot set is incomplete.

use std::{collections::BTreeMap, fs::read_to_string, path::Path, time::Duration};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::{
    aws::ec2::{Ec2Api, InstanceSummary},
    targets::{device_name, save_yaml, Status, TargetSpec},
};

pub const MISSING: &str = "MISSING";
pub const DEFAULT_RETENTION_AMI: &str = "14";
pub const DEFAULT_RETENTION_SNAP: i64 = 7;
/// Longest snapshot retention accepted from the `retention-snap` tag.
pub const MAX_RETENTION_DAYS: i64 = 36_500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    #[serde(flatten)]
    pub spec: TargetSpec,
    /// Restore status; snapshotting leaves it `pending`.
    pub status: Status,
    pub source_instance_id: String,
    /// device name -> volume the snapshot was taken from
    pub source_volumes: BTreeMap<String, String>,
}

pub type SnapshotTable = BTreeMap<String, SnapshotRecord>;

#[derive(Debug, Clone)]
pub struct SnapshotOptions {
    /// Prefix restored instances were named with; stripped from snapshot names.
    pub tag_prefix: String,
    pub batch_size: usize,
    /// Pause between two snapshot requests.
    pub pause: Duration,
    pub today: NaiveDate,
}

impl SnapshotOptions {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            tag_prefix: "restored".to_string(),
            batch_size: crate::restore::DEFAULT_BATCH_SIZE,
            pause: Duration::from_secs(5),
            today,
        }
    }
}

/// Instance ids, one per line; blank lines are skipped.
pub fn parse_instance_ids(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(ToString::to_string)
        .collect()
}

pub fn read_instance_ids(path: &Path) -> Result<Vec<String>> {
    let contents = read_to_string(path)
        .with_context(|| format!("failed to read instance list {}", path.display()))?;
    Ok(parse_instance_ids(&contents))
}

/// Strip the restore naming (`<prefix>-...-instance`) back to the system name.
pub fn base_name<'a>(name: &'a str, tag_prefix: &str) -> &'a str {
    let name = name
        .strip_prefix(tag_prefix)
        .and_then(|n| n.strip_prefix('-'))
        .unwrap_or(name);
    name.strip_suffix("-instance").unwrap_or(name)
}

fn target_tags(instance: &InstanceSummary) -> BTreeMap<String, String> {
    let get = |key: &str, default: &str| {
        instance
            .tags
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    };
    BTreeMap::from([
        ("Name".to_string(), get("Name", MISSING)),
        ("environment".to_string(), get("environment", MISSING)),
        ("project".to_string(), get("project", MISSING)),
        ("retention-ami".to_string(), get("retention-ami", DEFAULT_RETENTION_AMI)),
        (
            "retention-snap".to_string(),
            get("retention-snap", &DEFAULT_RETENTION_SNAP.to_string()),
        ),
    ])
}

fn target_from_instance(instance: &InstanceSummary) -> Option<SnapshotRecord> {
    let (Some(image_id), Some(key_name)) = (&instance.image_id, &instance.key_name) else {
        warn!(instance = %instance.instance_id, "instance has no image or key pair, skipping");
        return None;
    };
    let source_volumes = instance
        .volumes
        .iter()
        .map(|(device, volume)| (device_name(device).to_string(), volume.clone()))
        .collect();
    Some(SnapshotRecord {
        spec: TargetSpec {
            image_id: image_id.clone(),
            instance_type: instance.instance_type.clone(),
            key_name: key_name.clone(),
            source_snapshots: BTreeMap::new(),
            tags: target_tags(instance),
        },
        status: Status::Pending,
        source_instance_id: instance.instance_id.clone(),
        source_volumes,
    })
}

/// Describe the instances and build one entry per instance, keyed by its `Name` tag.
pub async fn prepare_targets<C: Ec2Api>(
    api: &C,
    instance_ids: &[String],
    batch_size: usize,
) -> Result<SnapshotTable> {
    info!(instances = instance_ids.len(), "fetching instance information");
    let mut table = SnapshotTable::new();

    for batch in instance_ids.chunks(batch_size.max(1)) {
        let described = api.describe_instances(batch).await?;
        for missing in batch
            .iter()
            .filter(|id| !described.iter().any(|i| &i.instance_id == *id))
        {
            warn!(instance = %missing, "instance not found");
        }

        for instance in &described {
            let Some(record) = target_from_instance(instance) else {
                continue;
            };
            let name = instance
                .tags
                .get("Name")
                .cloned()
                .unwrap_or_else(|| instance.instance_id.clone());
            let key = if table.contains_key(&name) {
                let key = format!("{name}-{}", instance.instance_id);
                warn!(name = %name, key = %key, "duplicate instance name");
                key
            } else {
                name
            };
            table.insert(key, record);
        }
    }
    Ok(table)
}

fn retention_days(record: &SnapshotRecord, system: &str) -> i64 {
    match record.spec.tags.get("retention-snap").map(|v| v.parse::<i64>()) {
        Some(Ok(days)) if (0..=MAX_RETENTION_DAYS).contains(&days) => days,
        Some(_) => {
            warn!(
                system = %system,
                "retention-snap is not a number of days up to {MAX_RETENTION_DAYS}, \
                 using {DEFAULT_RETENTION_SNAP} days"
            );
            DEFAULT_RETENTION_SNAP
        }
        None => DEFAULT_RETENTION_SNAP,
    }
}

/// Date a snapshot taken on `date` may be deleted. Out-of-range retentions use
/// the default; a date past the calendar's end stays at `date`.
pub fn delete_on(date: NaiveDate, days: i64) -> NaiveDate {
    let days = if (0..=MAX_RETENTION_DAYS).contains(&days) {
        days
    } else {
        DEFAULT_RETENTION_SNAP
    };
    date.checked_add_signed(chrono::Duration::days(days))
        .unwrap_or(date)
}

/// Request a snapshot of every source volume, recording snapshot ids as they come back.
pub async fn request_snapshots<C: Ec2Api>(
    api: &C,
    table: &mut SnapshotTable,
    options: &SnapshotOptions,
) -> Result<()> {
    let date = options.today;
    let description = format!("Created by snaprestore on {date}");
    let mut requested = 0usize;

    for (system, record) in table.iter_mut() {
        info!(system = %system, "processing snapshots");

        let deletion = delete_on(date, retention_days(record, system));
        let name = record
            .spec
            .tags
            .get("Name")
            .map(String::as_str)
            .unwrap_or(system.as_str());
        let base = base_name(name, &options.tag_prefix).to_string();
        let tag = |key: &str| {
            record
                .spec
                .tags
                .get(key)
                .cloned()
                .unwrap_or_else(|| MISSING.to_string())
        };
        let shared = BTreeMap::from([
            ("Date".to_string(), date.to_string()),
            ("DeleteOn".to_string(), deletion.to_string()),
            ("environment".to_string(), tag("environment")),
            ("project".to_string(), tag("project")),
        ]);

        for (device, volume) in &record.source_volumes {
            if requested > 0 {
                tokio::time::sleep(options.pause).await;
            }
            let mut tags = shared.clone();
            tags.insert("Name".to_string(), format!("SNAP-{base}-{device}-{date}"));

            let snapshot = api
                .create_snapshot(volume, &description, &tags)
                .await
                .with_context(|| format!("snapshot {device} of {system}"))?;
            requested += 1;
            info!(system = %system, volume = %volume, snapshot = %snapshot, "snapshot requested");
            record.spec.source_snapshots.insert(device.clone(), snapshot);
        }
    }
    Ok(())
}

/// Snapshot every instance in `instance_ids` and write the target file to `output`.
pub async fn execute<C: Ec2Api>(
    api: &C,
    instance_ids: &[String],
    output: &Path,
    options: &SnapshotOptions,
) -> Result<SnapshotTable> {
    let mut table = SnapshotTable::new();
    let result = async {
        table = prepare_targets(api, instance_ids, options.batch_size).await?;
        request_snapshots(api, &mut table, options).await
    }
    .await;

    let saved = save_yaml(output, &table);
    if let Err(e) = &saved {
        error!(output = %output.display(), "failed to save results: {e:#}");
    } else {
        info!(output = %output.display(), systems = table.len(), "saved results");
    }
    result?;
    saved?;
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::targets::{load_targets, validate};
    use crate::testing::{Call, FakeEc2};
    use tokio::time::Instant;

    fn instance(id: &str, name: Option<&str>, volumes: &[(&str, &str)]) -> InstanceSummary {
        let mut tags = BTreeMap::new();
        if let Some(name) = name {
            tags.insert("Name".to_string(), name.to_string());
        }
        tags.insert("project".to_string(), "drill".to_string());
        InstanceSummary {
            instance_id: id.to_string(),
            image_id: Some("ami-00000001".to_string()),
            key_name: Some("ops".to_string()),
            instance_type: Some("t3.small".to_string()),
            tags,
            volumes: volumes
                .iter()
                .map(|(d, v)| (d.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("restored-web-1-instance", "restored"), "web-1");
        assert_eq!(base_name("web-1", "restored"), "web-1");
        // only the literal prefix is stripped, not a set of characters
        assert_eq!(base_name("storage-1", "restored"), "storage-1");
    }

    #[test]
    fn test_parse_instance_ids() {
        let ids = parse_instance_ids("i-1\n\n  i-2  \n\n");
        assert_eq!(ids, vec!["i-1", "i-2"]);
    }

    #[tokio::test]
    async fn test_prepare_targets() {
        let mut web = instance(
            "i-1",
            Some("restored-web-1-instance"),
            &[("/dev/sda1", "vol-a")],
        );
        web.tags.insert("retention-snap".into(), "3".into());
        let api = FakeEc2::with_instances(vec![
            web,
            instance("i-2", None, &[("/dev/xvda", "vol-b")]),
            InstanceSummary {
                key_name: None,
                ..instance("i-3", Some("no-key"), &[])
            },
        ]);
        let ids = parse_instance_ids("i-1\ni-2\ni-3\ni-4\n");

        let table = prepare_targets(&api, &ids, 2).await.unwrap();
        assert_eq!(
            table.keys().collect::<Vec<_>>(),
            vec!["i-2", "restored-web-1-instance"]
        );
        let web = &table["restored-web-1-instance"];
        assert_eq!(web.source_volumes["sda1"], "vol-a");
        assert_eq!(web.spec.tags["environment"], MISSING);
        assert_eq!(web.spec.tags["retention-ami"], "14");
        assert_eq!(web.spec.tags["retention-snap"], "3");
        assert_eq!(table["i-2"].spec.tags["Name"], MISSING);
        let describes = api.calls_matching(|c| matches!(c, Call::DescribeInstances(_)));
        assert_eq!(describes.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshots_become_restore_input() {
        let mut web = instance(
            "i-1",
            Some("restored-web-1-instance"),
            &[("/dev/sda1", "vol-a"), ("/dev/xvdf", "vol-b")],
        );
        web.tags.insert("retention-snap".into(), "3".into());
        let db = instance("i-2", Some("db-1"), &[("/dev/sda1", "vol-c")]);
        let api = FakeEc2::with_instances(vec![web, db]);
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("snap-out.yml");

        let start = Instant::now();
        let ids = ["i-1".to_string(), "i-2".to_string()];
        let table = execute(&api, &ids, &output, &SnapshotOptions::new(today()))
            .await
            .unwrap();
        // a pause between each of the three requests, none after the last
        assert_eq!(start.elapsed(), Duration::from_secs(10));

        let snaps: Vec<_> = api
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::CreateSnapshot {
                    volume_id,
                    description,
                    tags,
                } => Some((volume_id, description, tags)),
                _ => None,
            })
            .collect();
        assert_eq!(snaps.len(), 3);
        let (volume, description, tags) = &snaps[1];
        assert_eq!(volume, "vol-a");
        assert_eq!(description, "Created by snaprestore on 2026-10-19");
        assert_eq!(tags["Name"], "SNAP-web-1-sda1-2026-10-19");
        assert_eq!(tags["DeleteOn"], "2026-10-22");
        assert_eq!(tags["project"], "drill");
        assert_eq!(snaps[0].2["DeleteOn"], "2026-10-26");

        let web = &table["restored-web-1-instance"];
        assert_eq!(web.spec.source_snapshots.len(), 2);
        assert_eq!(web.source_volumes["xvdf"], "vol-b");

        let restored = validate(load_targets(&output).unwrap()).unwrap();
        assert_eq!(restored.len(), 2);
        assert!(restored.values().all(|r| r.status == Status::Pending));
        assert_eq!(restored["db-1"].spec.source_snapshots["sda1"], "snap-00000001");
    }

    #[test]
    fn test_delete_on_stays_in_range() {
        assert_eq!(delete_on(today(), 3).to_string(), "2026-10-22");
        assert_eq!(delete_on(NaiveDate::MAX, 3), NaiveDate::MAX);
        assert_eq!(delete_on(today(), i64::MAX).to_string(), "2026-10-26");
        assert_eq!(delete_on(today(), -1).to_string(), "2026-10-26");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unusable_retention_falls_back_and_output_is_saved() {
        let mut huge = instance("i-1", Some("web-1"), &[("/dev/sda1", "vol-a")]);
        huge.tags.insert("retention-snap".into(), "1000000000".into());
        let mut negative = instance("i-2", Some("web-2"), &[("/dev/sda1", "vol-b")]);
        negative.tags.insert("retention-snap".into(), "-1000000000".into());
        let api = FakeEc2::with_instances(vec![huge, negative]);
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("snap-out.yml");

        let ids = ["i-1".to_string(), "i-2".to_string()];
        execute(&api, &ids, &output, &SnapshotOptions::new(today()))
            .await
            .unwrap();

        assert!(output.exists());
        let delete_dates: Vec<String> = api
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::CreateSnapshot { tags, .. } => Some(tags["DeleteOn"].clone()),
                _ => None,
            })
            .collect();
        assert_eq!(delete_dates, vec!["2026-10-26", "2026-10-26"]);
    }
}

//! The target file: which systems to restore, and what happened to them.
//!
//! Input and output share one YAML shape, keyed by system name:
//!
//! ```yaml
//! my-instance-name-tag:
//!   imageId: ami-1234567812345678
//!   instanceType: t2.micro
//!   keyName: my-ssh-key
//!   volumes:
//!     sda1: snap-1234567812345678
//!   tags:
//!     project: something-interesting
//! ```
//!
//! The output adds `status`, `subnetId`, `instanceId` and the provisioning details
//! to each entry, so an output file can be fed back as input.

use std::{
    collections::BTreeMap,
    fmt,
    fs::read_to_string,
    io::{BufWriter, Write},
    path::Path,
};

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use tempfile::NamedTempFile;
use tracing::error;

pub type TargetTable = BTreeMap<String, TargetRecord>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Pending => write!(f, "pending"),
            Status::Completed => write!(f, "completed"),
            Status::Failed => write!(f, "failed"),
        }
    }
}

/// A system as declared in the input file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSpec {
    pub image_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    pub key_name: String,
    /// device name -> snapshot id
    #[serde(rename = "volumes")]
    pub source_snapshots: BTreeMap<String, String>,
    #[serde(
        default,
        deserialize_with = "tag_values",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub tags: BTreeMap<String, String>,
}

/// Outcome of attaching one restored volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub volume_id: String,
    pub attached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Working state of one system, mutated in place by the restore stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRecord {
    #[serde(flatten)]
    pub spec: TargetSpec,
    #[serde(default)]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// device name -> volume id created from the matching snapshot
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provisioned_volumes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_volume_id: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub root_volume_deleted: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attachments: BTreeMap<String, Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl TargetRecord {
    pub fn pending(spec: TargetSpec) -> Self {
        Self {
            spec,
            status: Status::Pending,
            subnet_id: None,
            instance_id: None,
            provisioned_volumes: BTreeMap::new(),
            root_volume_id: None,
            root_volume_deleted: false,
            attachments: BTreeMap::new(),
            failure: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == Status::Pending
    }

    /// Failed after its original root volume was deleted: stopped and unbootable.
    pub fn is_stranded(&self) -> bool {
        self.status == Status::Failed && self.root_volume_deleted
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = Status::Failed;
        self.failure = Some(reason.into());
    }
}

// Tag values are strings on the EC2 side, but hand-written files often carry
// numbers (`retention-snap: 7`).
fn tag_values<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, serde_yaml::Value>>::deserialize(deserializer)?;
    raw.unwrap_or_default()
        .into_iter()
        .map(|(k, v)| match scalar_to_string(&v) {
            Some(s) => Ok((k, s)),
            None => Err(serde::de::Error::custom(format!(
                "tag {k} must be a scalar value"
            ))),
        })
        .collect()
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    use serde_yaml::Value;
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Every field optional, so a bad entry can be reported field by field.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTarget {
    image_id: Option<String>,
    instance_type: Option<String>,
    key_name: Option<String>,
    volumes: Option<BTreeMap<String, String>>,
    #[serde(default, deserialize_with = "tag_values")]
    tags: BTreeMap<String, String>,
    status: Option<Status>,
    /// Written by the snapshot command: every volume a snapshot was requested for.
    source_volumes: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub system: String,
    pub problem: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "target {}: {}", self.system, self.problem)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("found {} tainted configuration items", .violations.len())]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

/// Read the target file as untyped entries, keyed by system name.
pub fn load_targets(path: &Path) -> Result<BTreeMap<String, serde_yaml::Value>> {
    let contents = read_to_string(path)
        .with_context(|| format!("failed to read target file {}", path.display()))?;
    parse_targets(&contents).with_context(|| format!("invalid target file {}", path.display()))
}

pub fn parse_targets(contents: &str) -> Result<BTreeMap<String, serde_yaml::Value>> {
    if contents.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let entries: Option<BTreeMap<String, serde_yaml::Value>> = serde_yaml::from_str(contents)?;
    Ok(entries.unwrap_or_default())
}

lazy_static! {
    static ref SNAPSHOT_ID: Regex = Regex::new(r"^snap-[0-9a-f]{8,17}$").unwrap();
    static ref DEVICE_NAME: Regex = Regex::new(r"^[a-z]+[a-z0-9]*$").unwrap();
}

/// Strip an optional `/dev/` prefix.
pub fn device_name(device: &str) -> &str {
    device.strip_prefix("/dev/").unwrap_or(device)
}

/// Check every entry before anything is created.
///
/// Keeps going after the first bad entry so that all problems are reported in
/// one pass. Entries already marked `completed` are carried over as-is; every
/// other entry starts out `pending`.
pub fn validate(
    entries: BTreeMap<String, serde_yaml::Value>,
) -> Result<TargetTable, ValidationError> {
    let mut violations = vec![];
    let mut table = TargetTable::new();

    for (system, value) in entries {
        let mut report = |problem: String| {
            error!(system = %system, "{problem}");
            violations.push(Violation {
                system: system.clone(),
                problem,
            });
        };

        let raw: RawTarget = match serde_yaml::from_value(value.clone()) {
            Ok(raw) => raw,
            Err(e) => {
                report(format!("unreadable entry: {e}"));
                continue;
            }
        };

        if raw.status == Some(Status::Completed) {
            match serde_yaml::from_value::<TargetRecord>(value) {
                Ok(record) => {
                    table.insert(system, record);
                }
                Err(e) => report(format!("unreadable completed entry: {e}")),
            }
            continue;
        }

        let mut missing = false;
        if raw.image_id.is_none() {
            report("missing item imageId".to_string());
            missing = true;
        }
        if raw.key_name.is_none() {
            report("missing item keyName".to_string());
            missing = true;
        }
        let mut snapshots = BTreeMap::new();
        match &raw.volumes {
            None => {
                report("missing item volumes".to_string());
                missing = true;
            }
            Some(volumes) if volumes.is_empty() => {
                report("volumes is empty".to_string());
                missing = true;
            }
            Some(volumes) => {
                for (device, snapshot) in volumes {
                    let device = device_name(device);
                    if !DEVICE_NAME.is_match(device) {
                        report(format!("invalid device name {device}"));
                        missing = true;
                    } else if !SNAPSHOT_ID.is_match(snapshot) {
                        report(format!("invalid snapshot id {snapshot} for {device}"));
                        missing = true;
                    } else if snapshots
                        .insert(device.to_string(), snapshot.clone())
                        .is_some()
                    {
                        report(format!("duplicate device {device}"));
                        missing = true;
                    }
                }
                if let Some(sources) = &raw.source_volumes {
                    let absent: Vec<&str> = sources
                        .keys()
                        .map(|d| device_name(d))
                        .filter(|d| !snapshots.contains_key(*d))
                        .collect();
                    if !absent.is_empty() {
                        report(format!("no snapshot taken of {}", absent.join(", ")));
                        missing = true;
                    }
                }
            }
        }
        if missing {
            continue;
        }

        if let (Some(image_id), Some(key_name)) = (raw.image_id, raw.key_name) {
            let spec = TargetSpec {
                image_id,
                instance_type: raw.instance_type,
                key_name,
                source_snapshots: snapshots,
                tags: raw.tags,
            };
            table.insert(system, TargetRecord::pending(spec));
        }
    }

    if violations.is_empty() {
        Ok(table)
    } else {
        error!(
            count = violations.len(),
            "found tainted configuration items, aborting"
        );
        Err(ValidationError { violations })
    }
}

/// Write `data` as YAML to `path` via a temporary file in the same directory.
pub fn save_yaml<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut outfile = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temporary file in {}", dir.display()))?;
    let mut writer = BufWriter::new(&mut outfile);
    serde_yaml::to_writer(&mut writer, data).context("failed to serialize output")?;
    writer.flush()?;
    drop(writer);
    outfile
        .persist(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

pub fn save_targets(path: &Path, table: &TargetTable) -> Result<()> {
    save_yaml(path, table)
}

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use aws_sdk_ec2 as ec2;
use ec2::{
    types::{
        Instance, InstanceStateName, InstanceType, ResourceType, Tag, TagSpecification,
        VolumeState, VolumeType,
    },
    Client,
};
use tracing::debug;

/// Request for one encrypted volume restored from a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRequest {
    pub snapshot_id: String,
    pub zone: String,
    pub tags: BTreeMap<String, String>,
}

/// Request for one bare instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRequest {
    pub image_id: String,
    pub instance_type: String,
    pub key_name: String,
    pub security_group: String,
    pub subnet_id: String,
    pub tags: BTreeMap<String, String>,
}

/// What the snapshot workflow needs to know about a running instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceSummary {
    pub instance_id: String,
    pub image_id: Option<String>,
    pub key_name: Option<String>,
    pub instance_type: Option<String>,
    pub tags: BTreeMap<String, String>,
    /// device name (as reported, e.g. `/dev/sda1`) -> volume id
    pub volumes: BTreeMap<String, String>,
}

/// The EC2 operations the workflows are built on.
///
/// Implemented for [`aws_sdk_ec2::Client`]; tests drive the workflows through an
/// in-memory implementation instead.
#[allow(async_fn_in_trait)]
pub trait Ec2Api {
    /// Subnet id -> availability zone, for the given subnets.
    async fn subnet_zones(&self, subnet_ids: &[String]) -> Result<Vec<(String, String)>>;

    /// Create a volume and return its id.
    async fn create_volume(&self, request: &VolumeRequest) -> Result<String>;

    async fn volume_state(&self, volume_id: &str) -> Result<VolumeState>;

    /// Launch a single instance and return its id.
    async fn run_instance(&self, request: &InstanceRequest) -> Result<String>;

    async fn instance_state(&self, instance_id: &str) -> Result<InstanceStateName>;

    /// Volume id of the instance's root device, if it has one.
    async fn root_volume(&self, instance_id: &str) -> Result<Option<String>>;

    async fn stop_instances(&self, instance_ids: &[String]) -> Result<()>;

    async fn start_instances(&self, instance_ids: &[String]) -> Result<()>;

    async fn detach_volume(&self, volume_id: &str) -> Result<()>;

    async fn delete_volume(&self, volume_id: &str) -> Result<()>;

    async fn attach_volume(&self, volume_id: &str, instance_id: &str, device: &str)
        -> Result<()>;

    async fn describe_instances(&self, instance_ids: &[String]) -> Result<Vec<InstanceSummary>>;

    /// Request a snapshot of a volume and return the snapshot id.
    async fn create_snapshot(
        &self,
        volume_id: &str,
        description: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<String>;
}

pub async fn get_instance(client: &Client, id: &str) -> Result<Instance> {
    let res = client
        .describe_instances()
        .set_instance_ids(Some(vec![id.to_string()]))
        .send()
        .await
        .with_context(|| format!("describe instance {id}"))?;
    let instance = res
        .reservations()
        .unwrap_or_default()
        .iter()
        .flat_map(|r| r.instances().unwrap_or_default())
        .next()
        .with_context(|| format!("no ec2 instance found for {id}"))?;
    Ok(instance.clone())
}

fn tag_specification(
    resource: ResourceType,
    tags: &BTreeMap<String, String>,
) -> TagSpecification {
    let tags = tags
        .iter()
        .map(|(k, v)| Tag::builder().key(k).value(v).build())
        .collect();
    TagSpecification::builder()
        .resource_type(resource)
        .set_tags(Some(tags))
        .build()
}

/// Root volume of `instance`: the mapping for its root device, else the first mapping.
pub fn root_volume_of(instance: &Instance) -> Option<String> {
    let mappings = instance.block_device_mappings().unwrap_or_default();
    let root = instance.root_device_name();
    mappings
        .iter()
        .find(|m| root.is_some() && m.device_name() == root)
        .or_else(|| mappings.first())
        .and_then(|m| m.ebs())
        .and_then(|ebs| ebs.volume_id())
        .map(ToString::to_string)
}

impl Ec2Api for Client {
    async fn subnet_zones(&self, subnet_ids: &[String]) -> Result<Vec<(String, String)>> {
        let res = self
            .describe_subnets()
            .set_subnet_ids(Some(subnet_ids.to_vec()))
            .send()
            .await
            .context("describe subnets")?;
        let zones = res
            .subnets()
            .unwrap_or_default()
            .iter()
            .filter_map(|s| {
                Some((
                    s.subnet_id()?.to_string(),
                    s.availability_zone()?.to_string(),
                ))
            })
            .collect();
        Ok(zones)
    }

    async fn create_volume(&self, request: &VolumeRequest) -> Result<String> {
        let res = self
            .create_volume()
            .availability_zone(&request.zone)
            .encrypted(true)
            .snapshot_id(&request.snapshot_id)
            .volume_type(VolumeType::Gp2)
            .tag_specifications(tag_specification(ResourceType::Volume, &request.tags))
            .send()
            .await
            .with_context(|| format!("create volume from {}", request.snapshot_id))?;
        let id = res
            .volume_id()
            .with_context(|| format!("no volume id returned for {}", request.snapshot_id))?;
        Ok(id.to_string())
    }

    async fn volume_state(&self, volume_id: &str) -> Result<VolumeState> {
        let res = self
            .describe_volumes()
            .volume_ids(volume_id)
            .send()
            .await
            .with_context(|| format!("describe volume {volume_id}"))?;
        res.volumes()
            .unwrap_or_default()
            .first()
            .and_then(|v| v.state())
            .cloned()
            .with_context(|| format!("no state reported for volume {volume_id}"))
    }

    async fn run_instance(&self, request: &InstanceRequest) -> Result<String> {
        let res = self
            .run_instances()
            .image_id(&request.image_id)
            .instance_type(InstanceType::from(request.instance_type.as_str()))
            .key_name(&request.key_name)
            .min_count(1)
            .max_count(1)
            .security_group_ids(&request.security_group)
            .subnet_id(&request.subnet_id)
            .tag_specifications(tag_specification(ResourceType::Instance, &request.tags))
            .send()
            .await
            .with_context(|| format!("run instance from {}", request.image_id))?;
        let id = res
            .instances()
            .unwrap_or_default()
            .first()
            .and_then(|i| i.instance_id())
            .context("no instance id returned by run instances")?;
        Ok(id.to_string())
    }

    async fn instance_state(&self, instance_id: &str) -> Result<InstanceStateName> {
        let instance = get_instance(self, instance_id).await?;
        instance
            .state()
            .and_then(|s| s.name())
            .cloned()
            .with_context(|| format!("no state reported for instance {instance_id}"))
    }

    async fn root_volume(&self, instance_id: &str) -> Result<Option<String>> {
        let instance = get_instance(self, instance_id).await?;
        Ok(root_volume_of(&instance))
    }

    async fn stop_instances(&self, instance_ids: &[String]) -> Result<()> {
        let _res = self
            .stop_instances()
            .set_instance_ids(Some(instance_ids.to_vec()))
            .send()
            .await
            .context("stop instances")?;
        Ok(())
    }

    async fn start_instances(&self, instance_ids: &[String]) -> Result<()> {
        let _res = self
            .start_instances()
            .set_instance_ids(Some(instance_ids.to_vec()))
            .send()
            .await
            .context("start instances")?;
        Ok(())
    }

    async fn detach_volume(&self, volume_id: &str) -> Result<()> {
        let _res = self
            .detach_volume()
            .volume_id(volume_id)
            .send()
            .await
            .with_context(|| format!("detach volume {volume_id}"))?;
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let _res = self
            .delete_volume()
            .volume_id(volume_id)
            .send()
            .await
            .with_context(|| format!("delete volume {volume_id}"))?;
        Ok(())
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<()> {
        let _res = self
            .attach_volume()
            .device(device)
            .instance_id(instance_id)
            .volume_id(volume_id)
            .send()
            .await
            .with_context(|| format!("attach volume {volume_id} to {instance_id}"))?;
        Ok(())
    }

    async fn describe_instances(&self, instance_ids: &[String]) -> Result<Vec<InstanceSummary>> {
        let res = self
            .describe_instances()
            .set_instance_ids(Some(instance_ids.to_vec()))
            .send()
            .await
            .context("describe instances")?;

        let summaries = res
            .reservations()
            .unwrap_or_default()
            .iter()
            .flat_map(|r| r.instances().unwrap_or_default())
            .filter_map(|ins| {
                let instance_id = ins.instance_id()?.to_string();
                let tags = ins
                    .tags()
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|t| Some((t.key()?.to_string(), t.value()?.to_string())))
                    .collect();
                let volumes = ins
                    .block_device_mappings()
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|m| {
                        Some((
                            m.device_name()?.to_string(),
                            m.ebs()?.volume_id()?.to_string(),
                        ))
                    })
                    .collect();
                Some(InstanceSummary {
                    instance_id,
                    image_id: ins.image_id().map(ToString::to_string),
                    key_name: ins.key_name().map(ToString::to_string),
                    instance_type: ins.instance_type().map(|t| t.as_str().to_string()),
                    tags,
                    volumes,
                })
            })
            .collect::<Vec<_>>();
        debug!(requested = instance_ids.len(), found = summaries.len(), "described instances");
        Ok(summaries)
    }

    async fn create_snapshot(
        &self,
        volume_id: &str,
        description: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<String> {
        let res = self
            .create_snapshot()
            .volume_id(volume_id)
            .description(description)
            .tag_specifications(tag_specification(ResourceType::Snapshot, tags))
            .send()
            .await
            .with_context(|| format!("create snapshot of {volume_id}"))?;
        let id = res
            .snapshot_id()
            .with_context(|| format!("no snapshot id returned for {volume_id}"))?;
        Ok(id.to_string())
    }
}

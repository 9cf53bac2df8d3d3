//! In-memory EC2 for driving the workflows in tests.
//!
//! Ids are handed out in call order (`vol-0001`, `i-0001`, `snap-00000001`, ...) and
//! each launched instance gets a root volume `vol-root-<n>`. Everything becomes
//! ready on the first check unless told otherwise.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Mutex,
};

use anyhow::{bail, Result};
use aws_sdk_ec2::types::{InstanceStateName, VolumeState};

use crate::aws::ec2::{Ec2Api, InstanceRequest, InstanceSummary, VolumeRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    SubnetZones(Vec<String>),
    CreateVolume(VolumeRequest),
    VolumeState(String),
    RunInstance(InstanceRequest),
    InstanceState(String),
    RootVolume(String),
    StopInstances(Vec<String>),
    StartInstances(Vec<String>),
    Detach(String),
    Delete(String),
    Attach {
        volume_id: String,
        instance_id: String,
        device: String,
    },
    DescribeInstances(Vec<String>),
    CreateSnapshot {
        volume_id: String,
        description: String,
        tags: BTreeMap<String, String>,
    },
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    volumes: usize,
    instances: usize,
    snapshots: usize,
    never_stops: HashSet<String>,
    never_available: HashSet<String>,
    describe_fails: HashSet<String>,
    attach_fails: HashSet<String>,
    detach_fails: HashSet<String>,
    delete_fails: HashSet<String>,
    no_root: HashSet<String>,
    create_volume_limit: Option<usize>,
}

#[derive(Default)]
pub struct FakeEc2 {
    subnets: Vec<(String, String)>,
    described: Vec<InstanceSummary>,
    state: Mutex<State>,
}

impl FakeEc2 {
    pub fn with_subnets(subnets: &[(&str, &str)]) -> Self {
        Self {
            subnets: subnets
                .iter()
                .map(|(s, z)| (s.to_string(), z.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    pub fn with_instances(instances: Vec<InstanceSummary>) -> Self {
        Self {
            described: instances,
            ..Default::default()
        }
    }

    pub fn zone_of(&self, subnet: &str) -> Option<String> {
        self.subnets
            .iter()
            .find(|(s, _)| s == subnet)
            .map(|(_, z)| z.clone())
    }

    pub fn never_stops(&self, instance_id: &str) {
        self.state().never_stops.insert(instance_id.to_string());
    }

    pub fn never_available(&self, volume_id: &str) {
        self.state().never_available.insert(volume_id.to_string());
    }

    pub fn describe_fails(&self, volume_id: &str) {
        self.state().describe_fails.insert(volume_id.to_string());
    }

    pub fn attach_fails(&self, volume_id: &str) {
        self.state().attach_fails.insert(volume_id.to_string());
    }

    pub fn detach_fails(&self, volume_id: &str) {
        self.state().detach_fails.insert(volume_id.to_string());
    }

    pub fn delete_fails(&self, volume_id: &str) {
        self.state().delete_fails.insert(volume_id.to_string());
    }

    /// Report no block device mappings for `instance_id`.
    pub fn no_root(&self, instance_id: &str) {
        self.state().no_root.insert(instance_id.to_string());
    }

    /// Let `n` volume creations succeed, then fail every later one.
    pub fn create_volume_fails_after(&self, n: usize) {
        self.state().create_volume_limit = Some(n);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn calls_matching(&self, f: impl Fn(&Call) -> bool) -> Vec<Call> {
        self.state().calls.iter().filter(|c| f(c)).cloned().collect()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn record(&self, call: Call) {
        self.state().calls.push(call);
    }
}

impl Ec2Api for FakeEc2 {
    async fn subnet_zones(&self, subnet_ids: &[String]) -> Result<Vec<(String, String)>> {
        self.record(Call::SubnetZones(subnet_ids.to_vec()));
        Ok(self
            .subnets
            .iter()
            .filter(|(s, _)| subnet_ids.contains(s))
            .cloned()
            .collect())
    }

    async fn create_volume(&self, request: &VolumeRequest) -> Result<String> {
        self.record(Call::CreateVolume(request.clone()));
        let mut state = self.state();
        if state.create_volume_limit == Some(state.volumes) {
            bail!("VolumeLimitExceeded");
        }
        state.volumes += 1;
        Ok(format!("vol-{:04}", state.volumes))
    }

    async fn volume_state(&self, volume_id: &str) -> Result<VolumeState> {
        self.record(Call::VolumeState(volume_id.to_string()));
        let state = self.state();
        if state.describe_fails.contains(volume_id) {
            bail!("InvalidVolume.NotFound: {volume_id}");
        }
        if state.never_available.contains(volume_id) {
            Ok(VolumeState::Creating)
        } else {
            Ok(VolumeState::Available)
        }
    }

    async fn run_instance(&self, request: &InstanceRequest) -> Result<String> {
        self.record(Call::RunInstance(request.clone()));
        let mut state = self.state();
        state.instances += 1;
        Ok(format!("i-{:04}", state.instances))
    }

    async fn instance_state(&self, instance_id: &str) -> Result<InstanceStateName> {
        self.record(Call::InstanceState(instance_id.to_string()));
        if self.state().never_stops.contains(instance_id) {
            Ok(InstanceStateName::Stopping)
        } else {
            Ok(InstanceStateName::Stopped)
        }
    }

    async fn root_volume(&self, instance_id: &str) -> Result<Option<String>> {
        self.record(Call::RootVolume(instance_id.to_string()));
        if self.state().no_root.contains(instance_id) {
            return Ok(None);
        }
        Ok(instance_id
            .strip_prefix("i-")
            .map(|n| format!("vol-root-{n}")))
    }

    async fn stop_instances(&self, instance_ids: &[String]) -> Result<()> {
        self.record(Call::StopInstances(instance_ids.to_vec()));
        Ok(())
    }

    async fn start_instances(&self, instance_ids: &[String]) -> Result<()> {
        self.record(Call::StartInstances(instance_ids.to_vec()));
        Ok(())
    }

    async fn detach_volume(&self, volume_id: &str) -> Result<()> {
        self.record(Call::Detach(volume_id.to_string()));
        if self.state().detach_fails.contains(volume_id) {
            bail!("IncorrectState: {volume_id} is busy");
        }
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        self.record(Call::Delete(volume_id.to_string()));
        if self.state().delete_fails.contains(volume_id) {
            bail!("VolumeInUse: {volume_id}");
        }
        Ok(())
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<()> {
        self.record(Call::Attach {
            volume_id: volume_id.to_string(),
            instance_id: instance_id.to_string(),
            device: device.to_string(),
        });
        if self.state().attach_fails.contains(volume_id) {
            bail!("IncorrectState: {volume_id} is not available");
        }
        Ok(())
    }

    async fn describe_instances(&self, instance_ids: &[String]) -> Result<Vec<InstanceSummary>> {
        self.record(Call::DescribeInstances(instance_ids.to_vec()));
        Ok(self
            .described
            .iter()
            .filter(|i| instance_ids.contains(&i.instance_id))
            .cloned()
            .collect())
    }

    async fn create_snapshot(
        &self,
        volume_id: &str,
        description: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<String> {
        self.record(Call::CreateSnapshot {
            volume_id: volume_id.to_string(),
            description: description.to_string(),
            tags: tags.clone(),
        });
        let mut state = self.state();
        state.snapshots += 1;
        Ok(format!("snap-{:08x}", state.snapshots))
    }
}

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use rand::{seq::IteratorRandom, Rng};
use tracing::{debug, info};

use crate::aws::ec2::Ec2Api;

/// Subnet <-> availability zone lookup for the subnets a run may place systems in.
///
/// Volumes are pinned to a zone and instances to a subnet, so every system picks a
/// zone here once and uses the matching subnet for its instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AzMapping {
    by_subnet: BTreeMap<String, String>,
    by_zone: BTreeMap<String, String>,
}

impl AzMapping {
    pub async fn resolve<C: Ec2Api>(api: &C, subnet_ids: &[String]) -> Result<Self> {
        info!(subnets = subnet_ids.len(), "mapping subnets to availability zones");
        let mapping = Self::from_pairs(api.subnet_zones(subnet_ids).await?);
        if mapping.by_zone.is_empty() {
            bail!("none of the subnets {subnet_ids:?} were found");
        }
        for (subnet, zone) in &mapping.by_subnet {
            debug!(subnet = %subnet, zone = %zone, "resolved subnet");
        }
        Ok(mapping)
    }

    /// When several subnets share a zone, the last one wins.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut mapping = Self::default();
        for (subnet, zone) in pairs {
            mapping.by_zone.insert(zone.clone(), subnet.clone());
            mapping.by_subnet.insert(subnet, zone);
        }
        mapping
    }

    /// Pick a zone uniformly at random.
    pub fn choose_zone<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&str> {
        self.by_zone.keys().choose(rng).map(String::as_str)
    }

    pub fn subnet_for(&self, zone: &str) -> Option<&str> {
        self.by_zone.get(zone).map(String::as_str)
    }

    pub fn zone_of(&self, subnet: &str) -> Option<&str> {
        self.by_subnet.get(subnet).map(String::as_str)
    }

    pub fn zones(&self) -> impl Iterator<Item = &str> {
        self.by_zone.keys().map(String::as_str)
    }
}

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::restore::{DEFAULT_BATCH_SIZE, DEFAULT_INSTANCE_TYPE};

pub const APP_NAME: &str = "snaprestore";

/// Defaults shared by both commands, stored by `confy` under the `defaults`
/// config name. Command line flags win over anything in here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub region: String,
    pub tag_prefix: String,
    pub instance_type: String,
    pub batch_size: usize,
    pub profile: Option<String>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            region: "eu-west-2".to_string(),
            tag_prefix: "restored".to_string(),
            instance_type: DEFAULT_INSTANCE_TYPE.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            profile: None,
        }
    }
}

impl Defaults {
    pub fn load() -> Result<Self> {
        let defaults: Self = confy::load(APP_NAME, Some("defaults"))
            .context("failed to load snaprestore defaults")?;
        defaults.check()?;
        Ok(defaults)
    }

    pub fn check(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        if self.region.is_empty() {
            bail!("region must not be empty");
        }
        Ok(())
    }
}

/// A flag if given, the configured value otherwise.
pub fn pick<T: Clone>(flag: Option<T>, configured: &T) -> T {
    flag.unwrap_or_else(|| configured.clone())
}

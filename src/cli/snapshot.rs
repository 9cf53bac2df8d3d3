use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Args;
use snaprestore::{
    aws::ec2_client,
    config::{pick, Defaults},
    snapshot::{execute, read_instance_ids, SnapshotOptions},
};

#[derive(Args)]
pub struct SnapshotArgs {
    /// File of instance ids, one per line
    #[arg(long, short = 'i')]
    input: PathBuf,

    /// Where to write the target file for `restore`
    #[arg(long, short = 'o', default_value = "snap-out.yml")]
    output: PathBuf,

    /// Region (default: from configuration)
    #[arg(long, short = 'r')]
    region: Option<String>,

    /// Name tag prefix to strip from snapshot names
    #[arg(long, short = 't')]
    tag_prefix: Option<String>,

    /// Most instances per describe request
    #[arg(long)]
    batch_size: Option<usize>,

    /// AWS profile to load credentials from
    #[arg(long)]
    profile: Option<String>,
}

impl SnapshotArgs {
    pub async fn main(self) -> Result<()> {
        let defaults = Defaults::load()?;
        let instance_ids = read_instance_ids(&self.input)?;
        if instance_ids.is_empty() {
            bail!("no instance ids in {}", self.input.display());
        }

        let mut options = SnapshotOptions::new(chrono::Local::now().date_naive());
        options.tag_prefix = pick(self.tag_prefix, &defaults.tag_prefix);
        options.batch_size = pick(self.batch_size, &defaults.batch_size);
        if options.batch_size == 0 {
            bail!("--batch-size must be at least 1");
        }

        let region = pick(self.region, &defaults.region);
        let profile = self.profile.or(defaults.profile);
        let sdk_config = super::connect(profile.as_deref(), &region).await?;
        let client = ec2_client(&sdk_config);

        execute(&client, &instance_ids, &self.output, &options).await?;
        Ok(())
    }
}

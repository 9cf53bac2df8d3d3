use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Args;
use snaprestore::{
    aws::ec2_client,
    config::{pick, Defaults},
    restore::{execute, RestoreOptions},
    targets::{load_targets, validate},
};

#[derive(Args)]
pub struct RestoreArgs {
    /// Security group for the launched instances
    #[arg(long, short = 'g')]
    security_group: String,

    /// Target file (YAML)
    #[arg(long, short = 'i')]
    input: PathBuf,

    /// Where to write the final state of every system
    #[arg(long, short = 'o', default_value = "output.yml")]
    output: PathBuf,

    /// Region (default: from configuration)
    #[arg(long, short = 'r')]
    region: Option<String>,

    /// Candidate subnet; repeat for several availability zones
    #[arg(long = "subnet-id", short = 's', visible_alias = "sn", required = true)]
    subnet_ids: Vec<String>,

    /// Name tag prefix of created volumes and instances
    #[arg(long, short = 't')]
    tag_prefix: Option<String>,

    /// Instance type for entries that don't name one
    #[arg(long)]
    instance_type: Option<String>,

    /// Most instances per stop/start request
    #[arg(long)]
    batch_size: Option<usize>,

    /// AWS profile to load credentials from
    #[arg(long)]
    profile: Option<String>,

    /// Validate the target file and print what would be restored
    #[arg(long)]
    dry_run: bool,
}

impl RestoreArgs {
    pub async fn main(self) -> Result<()> {
        let defaults = Defaults::load()?;
        let mut options = RestoreOptions::new(self.security_group, self.subnet_ids);
        options.tag_prefix = pick(self.tag_prefix, &defaults.tag_prefix);
        options.default_instance_type = pick(self.instance_type, &defaults.instance_type);
        options.batch_size = pick(self.batch_size, &defaults.batch_size);
        if options.batch_size == 0 {
            bail!("--batch-size must be at least 1");
        }

        let entries = load_targets(&self.input)?;
        if self.dry_run {
            let table = validate(entries)?;
            for (system, record) in table.iter().filter(|(_, r)| r.is_pending()) {
                let instance_type = record
                    .spec
                    .instance_type
                    .as_deref()
                    .unwrap_or(&options.default_instance_type);
                println!("{system}: {} {instance_type}", record.spec.image_id);
                for (device, snapshot) in &record.spec.source_snapshots {
                    println!("  {device} <- {snapshot}");
                }
            }
            return Ok(());
        }

        let region = pick(self.region, &defaults.region);
        let profile = self.profile.or(defaults.profile);
        let sdk_config = super::connect(profile.as_deref(), &region).await?;
        let client = ec2_client(&sdk_config);

        let summary = execute(
            &client,
            entries,
            &self.output,
            &options,
            &mut rand::thread_rng(),
        )
        .await?;
        if !summary.failed.is_empty() || !summary.stranded.is_empty() {
            eprintln!(
                "{} of {} systems need attention, see {}",
                summary.failed.len() + summary.stranded.len(),
                summary.failed.len() + summary.stranded.len() + summary.completed.len(),
                self.output.display()
            );
        }
        Ok(())
    }
}

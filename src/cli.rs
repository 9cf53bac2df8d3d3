mod restore;
mod snapshot;

pub use restore::RestoreArgs;
pub use snapshot::SnapshotArgs;

use anyhow::Result;
use aws_config::SdkConfig;
use snaprestore::aws::{sdk_config, sts::caller_identity};
use tracing::info;

/// Load the SDK config and make sure its credentials resolve before any EC2 call.
async fn connect(profile: Option<&str>, region: &str) -> Result<SdkConfig> {
    let config = sdk_config(profile, region).await;
    let identity = caller_identity(&config).await?;
    info!(
        account = %identity.account,
        arn = %identity.arn,
        region = %region,
        "using AWS credentials"
    );
    Ok(config)
}

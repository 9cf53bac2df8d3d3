use anyhow::{Context, Result};
use aws_config::SdkConfig;
use aws_sdk_sts::Config;

/// The principal the loaded credentials resolve to.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub account: String,
    pub arn: String,
}

/// Resolve the credentials in `sdk_config` before anything else touches the account.
pub async fn caller_identity(sdk_config: &SdkConfig) -> Result<CallerIdentity> {
    let client = aws_sdk_sts::Client::from_conf(Config::new(sdk_config));
    let res = client
        .get_caller_identity()
        .send()
        .await
        .context("credentials check failed (sts get-caller-identity)")?;

    Ok(CallerIdentity {
        account: res.account().unwrap_or("unknown").to_string(),
        arn: res.arn().unwrap_or("unknown").to_string(),
    })
}

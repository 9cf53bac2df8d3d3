use aws_config::SdkConfig;
use aws_types::region::Region;

pub mod ec2;
pub mod sts;

/// Load the AWS configuration for `region`, optionally from a named profile.
pub async fn sdk_config(profile: Option<&str>, region: &str) -> SdkConfig {
    let loader = aws_config::from_env().region(Region::new(region.to_string()));
    let loader = match profile {
        Some(name) => loader.profile_name(name),
        None => loader,
    };
    loader.load().await
}

/// The single EC2 client a run talks through.
pub fn ec2_client(sdk_config: &SdkConfig) -> aws_sdk_ec2::Client {
    let config = aws_sdk_ec2::config::Builder::from(sdk_config).build();
    aws_sdk_ec2::Client::from_conf(config)
}

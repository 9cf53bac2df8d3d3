mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use cli::{RestoreArgs, SnapshotArgs};
use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Restore instances from snapshots listed in a target file
    Restore(RestoreArgs),
    /// Snapshot the volumes of running instances into a target file
    Snapshot(SnapshotArgs),
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy()
        .add_directive("aws_config=warn".parse()?)
        .add_directive("aws_smithy_http_tower=warn".parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    use Commands::*;
    match cli.command {
        Restore(args) => args.main().await,
        Snapshot(args) => args.main().await,
    }
}

//! `tierfsd`: the TierFS daemon entry point. Loads configuration, runs
//! startup checks, and serves the FUSE mounts and IPC control plane until
//! asked to shut down (spec §6).

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// TierFS background service.
#[derive(Debug, Parser)]
#[command(name = "tierfsd", version, about = "FUSE merge filesystem service")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "~/.tierfs/config.json")]
    config: String,

    /// Path to the persisted file index.
    #[arg(long, default_value = "~/.tierfs/index.json")]
    index: String,

    /// Path to the persisted runtime state file.
    #[arg(long, default_value = "~/.tierfs/runtime.json")]
    runtime_state: String,

    /// Unix socket the control plane listens on for the UI process.
    #[arg(long, default_value = "~/.tierfs/control.sock")]
    socket: String,

    /// Directory log files are written to.
    #[arg(long, default_value = "~/.tierfs/logs")]
    log_dir: String,
}

fn resolve(raw: &str) -> PathBuf {
    tierfs::config::expand_home(raw)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tierfs::service::run(
        resolve(&cli.config),
        resolve(&cli.index),
        resolve(&cli.runtime_state),
        resolve(&cli.socket),
        resolve(&cli.log_dir),
    )
    .await
}

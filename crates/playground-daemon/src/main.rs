//! playground-daemon entrypoint.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use playground_daemon::config::{DaemonConfig, LoggingConfig};
use playground_daemon::daemon::Daemon;
use playground_daemon::service;
use tracing_subscriber::EnvFilter;

/// p2p-playground daemon.
#[derive(Parser, Debug)]
#[command(name = "playground-daemon")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon in the foreground.
    Run {
        /// Path to the daemon configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Install the daemon as a systemd service.
    Install {
        /// Configuration file the service should run with.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Remove the systemd service.
    Uninstall,

    /// Start the systemd service.
    Start,

    /// Stop the systemd service.
    Stop,

    /// Restart the systemd service.
    Restart,

    /// Show the systemd service status.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run(config).await,
        Commands::Install { config } => Ok(service::install(config.as_deref())?),
        Commands::Uninstall => Ok(service::uninstall()?),
        Commands::Start => Ok(service::start()?),
        Commands::Stop => Ok(service::stop()?),
        Commands::Restart => Ok(service::restart()?),
        Commands::Status => Ok(service::status()?),
    }
}

async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let config = DaemonConfig::load(config_path.as_deref())?;
    init_tracing(&config.logging);

    let daemon = Daemon::start(config).await?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }

    daemon.stop().await;
    Ok(())
}

fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

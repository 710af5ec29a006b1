//! playground-ctl entrypoint.

use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod context;

use config::{ControllerConfig, LoggingConfig};
use context::ControllerContext;

/// Controller for the p2p-playground fabric.
#[derive(Parser, Debug)]
#[command(name = "playground-ctl")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the controller configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deploy a prebuilt package to nodes.
    Deploy {
        /// Package archive (`<name>-<version>.tar.gz`).
        package: PathBuf,

        /// Target node peer id; all discovered nodes when absent.
        #[arg(long)]
        node: Option<String>,

        /// Start the application after deployment.
        #[arg(long)]
        start: bool,
    },

    /// List applications deployed on nodes.
    List {
        /// Target node peer id; all discovered nodes when absent.
        #[arg(long)]
        node: Option<String>,
    },

    /// Fetch or follow an application's logs.
    Logs {
        /// Application id (`<name>-<version>`).
        app_id: String,

        /// Target node peer id.
        #[arg(long)]
        node: Option<String>,

        /// Keep streaming new lines.
        #[arg(short, long)]
        follow: bool,

        /// Return only the last N lines (0 = all).
        #[arg(long, default_value_t = 0)]
        tail: u64,
    },

    /// Show nodes currently visible through discovery.
    Nodes,

    /// Pack, sign, deploy and tail an application directory.
    Run {
        /// Application directory containing manifest.yaml.
        dir: PathBuf,

        /// Target node peer id; all discovered nodes when absent.
        #[arg(long)]
        node: Option<String>,

        /// Private key used to sign the package.
        #[arg(long)]
        private_key: Option<PathBuf>,

        /// Remove the package (and signature) after deployment.
        #[arg(long, action = ArgAction::Set, default_value_t = true)]
        cleanup: bool,

        /// Skip package signing.
        #[arg(long)]
        no_sign: bool,
    },

    /// Generate the controller signing keypair.
    Keygen {
        /// Output directory (defaults to the configured keys directory).
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },

    /// Sign a package, writing the `.sig` sidecar.
    Sign {
        /// Package archive to sign.
        package: PathBuf,

        /// Private key file (defaults to the configured controller key).
        #[arg(short = 'k', long)]
        key: Option<PathBuf>,
    },

    /// Generate a pre-shared network key.
    Psk {
        /// Output file (defaults to the configured PSK path).
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ControllerConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Keygen { out_dir } => commands::keygen::run(&config, out_dir),
        Commands::Sign { package, key } => commands::sign::run(&config, package, key),
        Commands::Psk { out } => commands::psk::run(&config, out),

        Commands::Deploy {
            package,
            node,
            start,
        } => {
            let ctx = ControllerContext::connect(config).await?;
            let result = commands::deploy::run(&ctx, package, node, start).await;
            ctx.close().await;
            result
        }
        Commands::List { node } => {
            let ctx = ControllerContext::connect(config).await?;
            let result = commands::list::run(&ctx, node).await;
            ctx.close().await;
            result
        }
        Commands::Logs {
            app_id,
            node,
            follow,
            tail,
        } => {
            let ctx = ControllerContext::connect(config).await?;
            let result = commands::logs::run(&ctx, app_id, node, follow, tail).await;
            ctx.close().await;
            result
        }
        Commands::Nodes => {
            let ctx = ControllerContext::connect(config).await?;
            let result = commands::nodes::run(&ctx).await;
            ctx.close().await;
            result
        }
        Commands::Run {
            dir,
            node,
            private_key,
            cleanup,
            no_sign,
        } => {
            let ctx = ControllerContext::connect(config).await?;
            let result = commands::run::run(
                &ctx,
                commands::run::RunArgs {
                    dir,
                    node,
                    private_key,
                    cleanup,
                    no_sign,
                },
            )
            .await;
            ctx.close().await;
            result
        }
    }
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

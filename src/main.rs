//! # Collector Entry Point

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use collector::{
    agent::{Agent, shutdown_on_ctrl_c},
    config::ConfigLoader,
    telemetry::init_tracing,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "collector", version, about = "Refocus data collector")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the collector and heartbeat until stopped
    Start {
        /// Additional env file applied after the layered `.env` files
        #[arg(long)]
        env_file: Option<PathBuf>,
        /// Collector name; overrides COLLECTOR_COLLECTOR_NAME
        #[arg(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start { env_file, name } => {
            let mut loader = ConfigLoader::new();
            if let Some(path) = env_file {
                loader = loader.with_env_file(path);
            }
            if let Some(name) = name {
                loader = loader.with_collector_name(name);
            }
            let config = loader.load().context("loading configuration")?;

            init_tracing(&config).context("initializing telemetry")?;
            info!(profile = %config.profile, "Loaded configuration");
            if let Ok(redacted_json) = config.redacted_json() {
                info!(config = %redacted_json, "Effective configuration");
            }

            let agent = Agent::new(&config).context("building collector")?;
            let shutdown = CancellationToken::new();
            shutdown_on_ctrl_c(shutdown.clone());
            agent.run(shutdown).await.context("running collector")?;
        }
    }

    Ok(())
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use tether_worker::client::ControlPlaneClient;
use tether_worker::config::WorkerConfig;
use tether_worker::executor::SandboxExecutor;
use tether_worker::scheduler::TaskScheduler;

#[derive(Parser, Debug)]
#[command(name = "tether-worker")]
#[command(about = "Self-hosted test execution worker", long_about = None)]
struct Cli {
    /// Path to the TOML config file (default: tether.toml if present).
    #[arg(long, global = true, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Claim and execute tasks until shutdown (or job-mode exit).
    Run,

    /// Load and validate the configuration, then exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = WorkerConfig::load(cli.config.as_deref()).context("load worker config")?;

    match cli.command {
        Command::Run => run(cfg).await,
        Command::CheckConfig => {
            tracing::info!(config = ?cfg, "configuration ok");
            Ok(())
        }
    }
}

async fn run(cfg: WorkerConfig) -> anyhow::Result<()> {
    let client = Arc::new(
        ControlPlaneClient::new(cfg.client_config()).context("build control plane client")?,
    );
    let executor = Arc::new(SandboxExecutor::new(cfg.executor_config()));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!(event = "tether.worker.shutdown", "shutdown requested");
                shutdown.cancel();
            }
        });
    }

    let scheduler = TaskScheduler::new(client, executor, cfg.scheduler_config(), shutdown);
    scheduler.run().await
}

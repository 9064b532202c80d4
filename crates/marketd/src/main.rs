//! marketd - compute marketplace daemon
//!
//! Runs the job lifecycle and escrow engine against a ledger, persisting
//! its state to a snapshot directory.

#![forbid(unsafe_code)]

mod config;
mod tasks;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use job_market::heartbeat::{start_heartbeat_monitor, HeartbeatMonitorConfig};
use job_market::JobController;
use ledger_gateway::{Address, ADDRESS_LEN};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{DaemonConfig, LogFormat};

#[derive(Parser)]
#[command(name = "marketd")]
#[command(about = "Compute marketplace job lifecycle and escrow daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Run {
        /// Path to config file
        #[arg(short, long, env = "MARKETD_CONFIG", default_value = "/etc/marketd/marketd.toml")]
        config: PathBuf,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/marketd/marketd.toml")]
        output: PathBuf,

        /// Escrow custodian address
        #[arg(long)]
        escrow_address: Option<String>,
    },

    /// Validate a config file and exit
    CheckConfig {
        /// Path to config file
        #[arg(short, long, env = "MARKETD_CONFIG", default_value = "/etc/marketd/marketd.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let config = DaemonConfig::load(&config)?;
            init_tracing(config.log_format)?;
            run(config).await?;
        }

        Commands::InitConfig {
            output,
            escrow_address,
        } => {
            init_config(output, escrow_address)?;
        }

        Commands::CheckConfig { config } => {
            DaemonConfig::load(&config)?;
            println!("{} is valid", config.display());
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("marketd=info".parse()?)
        .add_directive("job_market=info".parse()?);
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
    Ok(())
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    info!(
        state_dir = %config.state_dir.display(),
        ledger = ?config.ledger.backend,
        "starting marketd"
    );

    let gateway = config.gateway()?;
    let controller = JobController::new(config.market.clone(), gateway)?;

    std::fs::create_dir_all(&config.state_dir).with_context(|| {
        format!("failed to create state dir {}", config.state_dir.display())
    })?;
    if controller.store().load_snapshot(&config.state_dir)? {
        let store = controller.store();
        info!(
            jobs = store.jobs().len(),
            providers = store.providers().len(),
            "restored snapshot"
        );
        controller.resume();
    }

    let cancel = CancellationToken::new();
    let event_log = tokio::spawn(tasks::run_event_log(
        controller.events().subscribe_all(),
        cancel.clone(),
    ));
    let snapshots = tokio::spawn(tasks::run_snapshots(
        controller.clone(),
        config.state_dir.clone(),
        config.snapshot_interval(),
        cancel.clone(),
    ));
    let heartbeat = start_heartbeat_monitor(
        controller.clone(),
        HeartbeatMonitorConfig::from(&config.market),
    );

    info!("marketd running, press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");

    heartbeat.stop();
    cancel.cancel();
    controller.shutdown();
    for (name, task) in [("event log", event_log), ("snapshots", snapshots)] {
        if let Err(e) = task.await {
            warn!(task = name, error = %e, "background task ended abnormally");
        }
    }

    match controller.save_snapshot(&config.state_dir) {
        Ok(path) => info!(path = %path.display(), "final snapshot written"),
        Err(e) => error!(error = %e, "final snapshot failed"),
    }
    Ok(())
}

fn init_config(output: PathBuf, escrow_address: Option<String>) -> anyhow::Result<()> {
    let mut config = DaemonConfig::default();
    if let Some(address) = escrow_address {
        config.market = config.market.with_escrow_address(Address::parse(&address)?);
    }
    config.save(&output)?;

    println!("Config written to {}", output.display());
    if config.market.escrow_address.is_none() {
        println!();
        println!(
            "Set market.escrow_address to the custodian's {ADDRESS_LEN}-character ledger address, then run:"
        );
    } else {
        println!();
        println!("Start the daemon with:");
    }
    println!("  marketd run --config {}", output.display());

    Ok(())
}

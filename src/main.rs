//! route-machine
//!
//! ```text
//!                  ┌──────────────────────── supervisor ───────────────────────┐
//!                  │  spawn / respawn      stats barrier → Prometheus exporter │
//!                  └──────┬───────────────────────▲──────────────────────▲─────┘
//!                         │ fork/exec             │ IPC (stdout JSON)    │
//!                  ┌──────▼──────┐         ┌──────┴──────┐        ┌──────┴──────┐
//!  clients ──────▶ │  worker #1  │   ...   │  worker #2  │  ...   │  worker #N  │
//!  (SO_REUSEPORT)  │  registry   │         │  registry   │        │  registry   │
//!                  └──────┬──────┘         └──────┬──────┘        └──────┬──────┘
//!                         │ register/unregister/list (control bus)       │
//!                         └────────────────────────┴─────────────────────┘
//! ```

use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;

use route_machine::cluster::ipc::IpcSender;
use route_machine::cluster::worker;
use route_machine::cluster::{ClusterSupervisor, WorkerCommand};
use route_machine::config::{load_config, ProxyConfig};
use route_machine::lifecycle::wait_for_termination;
use route_machine::observability::logging;
use route_machine::observability::metrics::{init_metrics, PrometheusSink};

#[derive(Parser)]
#[command(name = "route-machine", version, about = "Dynamic HTTP/WebSocket router")]
struct Cli {
    /// TOML configuration file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Spawn and supervise the worker processes (default)
    Supervise,
    /// Run a single worker; started by the supervisor
    #[command(hide = true)]
    Worker,
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    match cli.command.unwrap_or(Command::Supervise) {
        Command::Supervise => runtime.block_on(supervise(cli.config, config)),
        Command::Worker => {
            let (ipc, outbox) = IpcSender::channel(std::process::id());
            logging::init_worker(&config.observability.log_level, ipc.clone());
            runtime.block_on(worker::run(config, ipc, outbox))?;
            Ok(())
        }
    }
}

async fn supervise(config_path: Option<PathBuf>, config: ProxyConfig) -> Result<(), Box<dyn Error>> {
    logging::init_supervisor(&config.observability.log_level);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        workers = config.server.workers,
        port = config.listener.port,
        addresses = ?config.listener.addresses,
        bus = %config.bus.address,
        "route-machine starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let mut command = WorkerCommand::new(std::env::current_exe()?);
    if let Some(path) = config_path {
        command = command.arg("--config").arg(path);
    }
    let command = command.arg("worker");

    let supervisor = ClusterSupervisor::new(command, config.server.workers, Box::new(PrometheusSink));
    supervisor
        .run(async {
            match wait_for_termination().await {
                Ok(signal) => tracing::info!(signal = %signal, "Shutting down"),
                Err(e) => tracing::error!(error = %e, "Failed to listen for signals"),
            }
        })
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

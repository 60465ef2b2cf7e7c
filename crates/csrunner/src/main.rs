mod config;
mod control;
mod domain;
mod error;
mod handler;
mod health;
mod logs;
mod ports;
mod process;
mod runtime;
mod store;

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::control::ControlState;
use crate::logs::LogManager;
use crate::ports::PortAllocator;
use crate::process::ProcessManager;
use crate::store::ConfigStore;

#[derive(Parser)]
#[command(
    name = "csrunner",
    about = "Local supervisor for client/server development stacks",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Data directory (default: ~/.clientserverrunner)
    #[arg(long, global = true)]
    data_dir: Option<String>,

    /// Diagnostic log level (RUST_LOG overrides)
    #[arg(long, global = true, default_value = "info",
          value_parser = ["debug", "info", "warn", "error"])]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control surface on standard I/O (the default)
    Serve,
}

fn build_state(cfg: &ServerConfig) -> ControlState {
    let store = Arc::new(ConfigStore::new(cfg.configurations_dir()));
    let logs = Arc::new(LogManager::new(
        cfg.logs_dir(),
        cfg.log_retention_runs,
        cfg.log_max_size_mb,
    ));
    let ports = Arc::new(PortAllocator::new());
    let registry = Arc::new(handler::default_registry());
    let manager = ProcessManager::new(
        store.clone(),
        logs.clone(),
        ports,
        registry.clone(),
        Duration::from_secs(cfg.stop_timeout_secs),
    );
    ControlState {
        store,
        manager,
        logs,
        registry,
        data_dir: cfg.data_dir.clone(),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    runtime::init_tracing(&cli.log_level);

    let data_dir = cli.data_dir.as_deref().map(config::expand_tilde);
    let cfg = match ServerConfig::load(data_dir) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load server configuration");
            std::process::exit(1);
        }
    };
    if let Err(e) = runtime::ensure_data_dirs(&cfg) {
        error!(error = %e, "data directory is not usable");
        std::process::exit(2);
    }
    info!(data_dir = %cfg.data_dir.display(), "csrunner starting");

    let state = build_state(&cfg);
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {}
    }

    // Stdin EOF and signals both mean: drain children, then exit clean.
    tokio::select! {
        result = control::serve_stdio(state.clone()) => {
            if let Err(e) = result {
                error!(error = %e, "control surface failed");
            }
        }
        _ = runtime::wait_for_shutdown() => {}
    }

    state.manager.shutdown_all().await;
    info!("shutdown complete");
    std::process::exit(0);
}

//! Palisade gateway daemon.
//!
//! Reads configuration from `PALISADE_*` environment variables (CLI flags
//! override the bind address and state directory), builds the composition
//! root, and serves the HTTP control plane until shutdown.

use std::{net::SocketAddr, path::PathBuf, process::ExitCode};

use clap::Parser;
use palisade_core::{config::GatewayConfig, gateway};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "palisade-daemon", version, about = "Palisade agent gateway")]
struct Cli {
    /// Bind address, e.g. 127.0.0.1:18890
    #[arg(long, env = "PALISADE_BIND")]
    bind: Option<SocketAddr>,

    /// Directory for all persisted gateway state
    #[arg(long, env = "PALISADE_STATE_DIR")]
    state_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,palisade_core=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(state_dir) = cli.state_dir {
        config.state_dir = state_dir;
    }

    let state = match gateway::AppState::from_config(config) {
        Ok(state) => state,
        Err(err) => {
            tracing::error!(%err, "failed to build gateway state");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = gateway::serve(state).await {
        tracing::error!(%err, "gateway terminated");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

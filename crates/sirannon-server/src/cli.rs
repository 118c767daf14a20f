//! Command-line entrypoint: `sirannond serve [CONFIG]`.

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::registry::DatabaseRegistry;
use crate::router::build_app_router;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "sirannond", version, about = "sirannon embedded SQL server")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start serving the databases named in a configuration file.
    Serve(ServeCmd),
}

#[derive(Parser, Debug)]
pub struct ServeCmd {
    /// Path to a TOML configuration file (env: SIRANNON_CONFIG).
    #[arg(value_name = "CONFIG", env = "SIRANNON_CONFIG")]
    pub config: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread")]
#[tracing::instrument(skip_all)]
pub async fn start() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve(cmd) => do_serve(cmd).await,
    };

    result.map_or_else(
        |e| {
            error!("sirannond failed to start: {e}");
            ExitCode::FAILURE
        },
        |_| {
            info!("sirannond shut down cleanly");
            ExitCode::SUCCESS
        },
    )
}

#[tracing::instrument(skip_all)]
async fn do_serve(cmd: ServeCmd) -> Result<()> {
    let config = ServerConfig::load(cmd.config.as_deref())?;
    info!(
        bind = %config.bind_address,
        databases = config.databases.len(),
        "starting sirannond"
    );

    let registry = Arc::new(DatabaseRegistry::open(&config).await?);
    let app = build_app_router(registry.clone());

    let listener = TcpListener::bind(&config.bind_address)
        .await
        .map_err(Error::Io)?;
    info!(addr = %config.bind_address, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(Error::Io)?;

    registry.close_all().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

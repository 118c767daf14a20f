pub mod cli;
pub mod config;
pub mod error;
pub mod http;
pub mod registry;
pub mod router;
pub mod ws;

use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_file(true).with_line_number(true))
        .init();

    info!("logging initialized");
    cli::start()
}

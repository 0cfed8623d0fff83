mod args;
mod commands;

use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::args::Cli;

/// Exit status for configuration problems and errors that stopped the whole run.
const EXIT_FATAL: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up tracing; RUST_LOG wins over --log-level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .ok();

    match commands::run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!(error = %err, "eless stopped");
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

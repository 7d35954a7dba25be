//! zfsbackrest - encrypted, incremental ZFS backups.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::error;

use zfsbackrest::cli::{self, Cli};
use zfsbackrest::config::Config;
use zfsbackrest::shutdown::Shutdown;
use zfsbackrest::utils;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            eprintln!("failed to load config {}: {err}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };

    let level = if config.debug { "debug" } else { "info" };
    if let Err(err) = utils::logger::init(level) {
        eprintln!("failed to initialize logging: {err}");
        return ExitCode::FAILURE;
    }

    let shutdown = Shutdown::new();
    shutdown.install_signal_handlers();

    match cli::run(cli.command, config, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

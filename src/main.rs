//! portsync: keep host port forwards in sync with running containers
//!
//! This is the main entry point for the portsync binary. It handles CLI
//! argument parsing, configuration loading and logging setup, then hands over
//! to the daemon.
//!
//! # Output
//!
//! - **Diagnostic logging**: `tracing` records on stderr, filtered by `-v`,
//!   `RUST_LOG` or `general.log_level`
//! - **Audit logging**: Optional JSON events to syslog (`telemetry.syslog`)

use anyhow::{Context, Result};
use clap::Parser;
use portsync::{cli::Cli, config::ConfigLoader, daemon};
use tracing::debug;

fn main() -> Result<()> {
    // Parse CLI arguments first (before any other initialization)
    let cli = Cli::parse();

    // Configuration decides the default log level, so it loads before tracing
    let config = ConfigLoader::new()
        .and_then(|loader| loader.load(&cli))
        .context("Failed to load configuration")?;

    init_tracing(cli.verbose, config.general.log_level())?;

    debug!("Parsed CLI arguments: {:?}", cli);
    debug!("Loaded configuration: {:?}", config);

    daemon::run(&cli, &config)
}

/// Initialize the tracing subscriber for diagnostic logging.
///
/// This is separate from the audit telemetry which goes to syslog.
///
/// # Verbosity Levels
/// - 0 (default): `RUST_LOG` if set, else the configured log level
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8, default_level: &str) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(default_level))
            .context("Invalid log level")?,
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}

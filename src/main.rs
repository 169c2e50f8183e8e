//! hsm-egress: outbound mTLS proxy with HSM-held client keys
//!
//! Entry point: parses the CLI, sets up diagnostic logging and dispatches
//! to the selected subcommand.
//!
//! # Logging
//!
//! - **Audit logging**: security events go to syslog as JSON (see
//!   [`hsm_egress::telemetry`])
//! - **Diagnostic logging**: `tracing` output on stderr, filtered by `-v` or
//!   `RUST_LOG`, falling back to `general.log_level` from the configuration

use anyhow::{Context, Result};
use clap::Parser;
use hsm_egress::{cli::Cli, cli_handler, config::ConfigLoader};
use tracing::debug;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Loaded before tracing starts so `general.log_level` can apply.
    let loader = ConfigLoader::new();
    let config = loader.load(&cli);
    let level = match &config {
        Ok(config) if !config.general.log_level.is_empty() => config.general.log_level.as_str(),
        _ => "info",
    };

    init_tracing(cli.verbose, level)?;
    debug!("Parsed CLI arguments: {:?}", cli);

    cli_handler::handle_command(&cli, loader, config)
}

/// Initialize the tracing subscriber for diagnostic logging.
///
/// # Verbosity Levels
/// - 0 (default): `RUST_LOG`, else `default_level`
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8, default_level: &str) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
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

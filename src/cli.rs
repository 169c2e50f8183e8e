//! Command-line interface definitions for hsm-egress.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Outbound mTLS proxy with HSM-held client keys.
///
/// hsm-egress forwards HTTP requests to configured upstreams over mutually
/// authenticated TLS. The client certificate's private key stays in the
/// key store; only the handshake signature is requested from it.
#[derive(Parser, Debug)]
#[command(name = "hsm-egress")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to run (defaults to `run`).
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to additional config file.
    ///
    /// This config file is merged on top of system and user configs,
    /// giving it the highest priority.
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// Subcommands for hsm-egress.
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Load configuration and serve (the default).
    Run,

    /// Load and validate configuration, then print routes and identities.
    #[command(name = "check-config")]
    CheckConfig,

    /// Write a throwaway CA, server certificate and client identity.
    ///
    /// The client key is meant for the software key store; never use this
    /// material outside development.
    #[command(name = "dev-pki")]
    DevPki {
        /// Output directory.
        #[arg(long = "out", value_name = "DIR")]
        out: PathBuf,

        /// Common name of the client certificate.
        #[arg(long = "client-name", default_value = "edge-client")]
        client_name: String,

        /// Host name on the server certificate.
        #[arg(long = "server-name", default_value = "localhost")]
        server_name: String,
    },
}

impl Cli {
    /// The command to run, `run` when none was given.
    pub fn command(&self) -> &Commands {
        self.command.as_ref().unwrap_or(&Commands::Run)
    }
}

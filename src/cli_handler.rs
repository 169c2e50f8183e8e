//! Subcommand handling for hsm-egress.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use crate::app;
use crate::cli::{Cli, Commands};
use crate::config::{Config, ConfigError, ConfigLoader};
use crate::identity::DevPki;

/// Run the command selected on the command line.
///
/// `config` is the result of loading configuration with `loader`;
/// `dev-pki` runs even when it failed.
pub fn handle_command(
    cli: &Cli,
    loader: ConfigLoader,
    config: Result<Config, ConfigError>,
) -> Result<()> {
    match cli.command() {
        Commands::Run => {
            let config = config.context("Failed to load configuration")?;
            app::run(cli, loader, config)
        }
        Commands::CheckConfig => {
            let config = config.context("Failed to load configuration")?;
            print_summary(&config, &mut std::io::stdout().lock())
        }
        Commands::DevPki {
            out,
            client_name,
            server_name,
        } => write_dev_pki(out, client_name, server_name),
    }
}

/// Print routes and identities from a validated configuration.
fn print_summary(config: &Config, out: &mut impl Write) -> Result<()> {
    writeln!(out, "Configuration OK")?;
    writeln!(out, "Listener: {}", config.listener.address())?;
    writeln!(out, "Identities ({}):", config.identities.len())?;
    for (name, identity) in &config.identities {
        writeln!(
            out,
            "  {:<16} key={} algorithm={:?} chain={}",
            name,
            identity.key_label,
            identity.algorithm,
            identity.chain.display()
        )?;
    }
    writeln!(out, "Routes ({}):", config.routes.len())?;
    for (name, route) in &config.routes {
        let anchors = if route.trust_anchors.is_empty() {
            "system roots".to_string()
        } else {
            format!("{} anchor file(s)", route.trust_anchors.len())
        };
        writeln!(
            out,
            "  {:<16} {} sni={} identity={} {:?} ({})",
            name,
            route.address,
            route.server_name().unwrap_or("-"),
            route.identity_name(),
            route.hostname_verification,
            anchors
        )?;
    }
    Ok(())
}

fn write_dev_pki(out: &Path, client_name: &str, server_name: &str) -> Result<()> {
    let pki = DevPki::generate("hsm-egress dev CA").context("Failed to generate dev CA")?;
    let files = pki
        .write_bundle(out, client_name, server_name)
        .context("Failed to write dev PKI")?;

    println!("CA certificate:     {}", files.ca_cert.display());
    println!("Server certificate: {}", files.server_cert.display());
    println!("Server key:         {}", files.server_key.display());
    println!("Client certificate: {}", files.client_cert.display());
    println!("Client key:         {}", files.client_key.display());
    println!();
    println!("Example configuration:");
    println!();
    println!("[hsm.keys]");
    println!("{} = {:?}", client_name, files.client_key);
    println!();
    println!("[identities.default]");
    println!("chain = {:?}", files.client_cert);
    println!("key_label = {:?}", client_name);
    Ok(())
}

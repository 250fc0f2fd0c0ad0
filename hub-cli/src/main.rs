mod cli;
mod commands;
mod config;

use crate::{
    cli::{Args, Commands},
    commands::CommandExecutor,
    config::AppConfig,
};
use anyhow::Result;
use clap::Parser;
use hub_client::HubClient;
use std::process;
use tracing::{Level, debug, error};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("Application error: {e:#}");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    init_logging(args.verbose, args.quiet)?;

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(base_url) = args.base_url {
        config.client.base_url = base_url;
    }
    debug!(base_url = %config.client.base_url, "Configuration loaded");

    if let Commands::Config { show, reset } = args.command {
        if reset {
            let path = AppConfig::reset(args.config.as_deref())?;
            println!("Configuration reset: {}", path.display());
        }
        if show || !reset {
            print!("{}", config.show()?);
        }
        return Ok(());
    }

    let client = HubClient::new(config.client)?;
    let executor = CommandExecutor::new(client, args.output);

    match args.command {
        Commands::Login { identifier, secret } => executor.login(&identifier, secret).await,
        Commands::LoginFederated { token } => executor.login_federated(&token).await,
        Commands::Logout => executor.logout().await,
        Commands::Whoami => executor.whoami().await,
        Commands::Notifications { action } => executor.notifications(action).await,
        Commands::Watch { no_initial } => executor.watch(!no_initial).await,
        Commands::Config { .. } => Ok(()),
    }
}

/// Logs go to stderr so command output on stdout stays machine readable.
fn init_logging(verbose: bool, quiet: bool) -> Result<()> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_level(verbose),
        )
        .init();

    Ok(())
}

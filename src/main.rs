use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use berth::cli::{self, Cli, Command};
use berth::config::BerthConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .without_time()
        .init();

    let config = BerthConfig::load(&cli.config)?;

    match cli.command {
        Command::Check => {
            cli::check::run(&config)?;
        }

        Command::Deploy(args) => {
            cli::deploy::run(config, args).await?;
        }

        Command::Rollback { app, commit } => {
            cli::rollback::run(config, &app, &commit).await?;
        }
    }

    Ok(())
}

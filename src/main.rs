//! # DistVault CLI Application
//!
//! Main entry point for the DistVault peer-to-peer file storage node.

use anyhow::Result;
use clap::Parser;
use colored::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use distvault::cli::{self, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "distvault=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    if let Err(e) = match cli.command {
        Commands::Init { listen, bootstrap, key } => cli::init(&cli.config, listen, bootstrap, key).await,
        Commands::Serve => cli::serve(&cli.config).await,
        Commands::Put { key, file } => cli::put(&cli.config, &key, &file).await,
        Commands::Get { key, output } => cli::get(&cli.config, &key, output).await,
    } {
        eprintln!("{} {}\n{}", "Error:".red().bold(), e.to_string().red(), "Tip: Run with --help for usage information.".yellow());
        std::process::exit(1);
    }
    Ok(())
}

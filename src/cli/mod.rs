pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file overriding the default profile
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the feed monitor worker
    Monitor,

    /// Run the archiver worker
    Archiver,

    /// Run the QR-login worker
    Login,

    /// Serve the control surface
    Serve,

    /// Run all workers and the control surface in one process
    All,

    /// Show the active configuration
    Config,
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Monitor => commands::monitor(config_path, cli.verbose).await,
        Commands::Archiver => commands::archiver(config_path, cli.verbose).await,
        Commands::Login => commands::login(config_path, cli.verbose).await,
        Commands::Serve => commands::serve(config_path, cli.verbose).await,
        Commands::All => commands::all(config_path, cli.verbose).await,
        Commands::Config => commands::show_config(config_path).await,
    }
}

//! Pulse CLI - Command-line interface for the Pulse jobs service.
//!
//! Provides commands for job and health management.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{health, job};
use output::OutputFormat;

/// Pulse - Job Scheduling Service CLI
#[derive(Parser)]
#[command(
    name = "pulse",
    version = "0.1.0",
    about = "Pulse - Job Scheduling Service",
    long_about = "CLI tool for managing scheduled jobs on a Pulse deployment.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// API server URL
    #[arg(long, global = true, env = "PULSE_API_URL")]
    api_url: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Job management operations
    #[command(subcommand)]
    Job(job::JobCommands),

    /// Check service health
    Health(health::HealthArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let api_url = cli
        .api_url
        .clone()
        .unwrap_or_else(|| "http://localhost:8580".to_string());

    let client = client::ApiClient::new(&api_url)?;
    let format = cli.output;

    let result = match cli.command {
        Commands::Job(cmd) => job::execute(cmd, &client, format).await,
        Commands::Health(args) => health::execute(args, &client, format).await,
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}

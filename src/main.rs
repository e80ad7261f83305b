//! Scenario harness CLI
//!
//! Runs declarative end-to-end scenarios against a CLI under test and the
//! HTTP API behind it.

use clap::Parser;
use harness::{cli, commands};
use commands::Commands;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "harness", about = "Scenario-driven end-to-end test runner")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Debug-level logging for the harness
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Configuration file (default: platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = cli::dispatch(cli.command, cli.verbose, cli.config).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

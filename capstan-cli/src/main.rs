//! capstan - cluster-lifecycle operation controller CLI.

mod client;
mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// capstan - install, upgrade, and reconfigure on-prem clusters as
/// resumable operations.
#[derive(Parser)]
#[command(name = "capstan")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Cluster-configuration operations
    #[command(subcommand)]
    Config(commands::config::ConfigCommands),

    /// Operate on the active operation's plan
    #[command(subcommand)]
    Plan(commands::plan::PlanCommands),

    /// Run a peer agent on this node
    Agent(commands::agent::AgentOpts),
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "capstan=info",
        1 => "capstan=debug",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Config(cmd) => commands::config::run(cmd).await,
        Commands::Plan(cmd) => commands::plan::run(cmd).await,
        Commands::Agent(opts) => commands::agent::run(opts).await,
    }
}

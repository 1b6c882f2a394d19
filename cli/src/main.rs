//! Tether CLI - drive the sync engine from the command line.
//!
//! Replays scenario files against the in-memory store and remote and prints a
//! JSON report of what the engine did.

mod error;
mod scenario;

use crate::error::CliError;
use crate::scenario::{ReplayOptions, Scenario};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tether_engine::EngineConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tether")]
#[command(author, version, about = "Offline-first sync engine driver")]
struct Cli {
    /// Log engine events
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a scenario file and print the report
    Replay {
        /// Path to the scenario JSON
        path: PathBuf,

        /// Number of sync passes
        #[arg(short, long, default_value = "1")]
        rounds: usize,

        /// Run every consistency check instead of the quick ones
        #[arg(long)]
        full_check: bool,

        /// Write the engine snapshot here after the replay
        #[arg(long)]
        snapshot: Option<PathBuf>,

        /// Pretty-print the report
        #[arg(long)]
        pretty: bool,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "tether_engine=debug,tether_cli=debug"
    } else {
        "tether_engine=info,tether_cli=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = EngineConfig::from_env()?;
    config.validate()?;

    match cli.command {
        Commands::Replay {
            path,
            rounds,
            full_check,
            snapshot,
            pretty,
        } => {
            let scenario = Scenario::load(&path)?;
            tracing::info!(
                path = %path.display(),
                operations = scenario.operations.len(),
                "replaying scenario"
            );
            let report = scenario::replay(
                scenario,
                config,
                ReplayOptions {
                    rounds,
                    full_check,
                    snapshot,
                },
            )
            .await?;

            let out = if pretty {
                serde_json::to_string_pretty(&report)
            } else {
                serde_json::to_string(&report)
            }
            .map_err(CliError::from)?;
            println!("{out}");
        }
        Commands::Config => {
            println!("{config:#?}");
        }
    }

    Ok(())
}

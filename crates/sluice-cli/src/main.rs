//! Sluice CLI - headless driver for the streaming core
//!
//! Inspect the merged player configuration or play a segment-list fixture
//! against a null sink and report playback statistics.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod output;
mod transport;

#[derive(Parser)]
#[command(name = "sluice")]
#[command(author, version, about = "Sluice - adaptive streaming client core driver")]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(short, long, global = true, default_value = "text")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the player configuration with overrides merged over the defaults
    Config {
        /// JSON file with partial configuration overrides
        #[arg(short, long)]
        overrides: Option<PathBuf>,
    },

    /// Play a segment-list manifest fixture and report statistics
    Play {
        /// Segment-list manifest (JSON)
        fixture: PathBuf,

        /// JSON file with partial configuration overrides
        #[arg(short, long)]
        overrides: Option<PathBuf>,

        /// Start position in seconds
        #[arg(short, long)]
        start: Option<f64>,

        /// Stop after this many seconds of wall-clock time
        #[arg(short, long, default_value = "120")]
        duration: u64,

        /// Disable ABR and stay on this rendition
        #[arg(short, long)]
        rendition: Option<u32>,

        /// Preferred audio language
        #[arg(long)]
        audio_language: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Config { overrides } => {
            commands::config(overrides.as_deref(), &cli.format)?;
        }
        Commands::Play {
            fixture,
            overrides,
            start,
            duration,
            rendition,
            audio_language,
        } => {
            let options = commands::PlayOptions {
                overrides,
                start,
                duration,
                rendition,
                audio_language,
            };
            commands::play(&fixture, options, &cli.format).await?;
        }
    }

    Ok(())
}

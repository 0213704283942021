//! Parley - realtime chat delivery server.
//!
//! Main entry point for the Parley CLI.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::{config, start, stats};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Parley - realtime chat delivery server
#[derive(Parser)]
#[command(name = "parley")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the Parley server
    Start(start::StartArgs),

    /// Show connection and cache statistics of a running server
    Stats(stats::StatsArgs),

    /// Configuration management
    Config(config::ConfigArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Console (human-readable) + rotating JSON file
    let filter = if cli.verbose {
        "parley=debug,parley_server=debug,parley_cache=debug,parley_config=debug,info"
    } else {
        "parley=info,parley_server=info,parley_cache=info,warn"
    };

    let log_dir = parley_config::xdg_config_dir()
        .map(|d| d.join("logs"))
        .unwrap_or_else(|| std::path::PathBuf::from("logs"));
    let file_appender = tracing_appender::rolling::daily(&log_dir, "parley.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_filter(tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(tracing_subscriber::EnvFilter::new(
                    "parley=trace,parley_server=trace,parley_cache=trace,parley_config=trace,info",
                )),
        )
        .init();

    let ctx = commands::Context {
        json_output: cli.json,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Start(args) => start::run(args, &ctx).await,
        Commands::Stats(args) => stats::run(args, &ctx).await,
        Commands::Config(args) => config::run(args, &ctx).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_start_overrides() {
        let cli = Cli::try_parse_from([
            "parley",
            "--verbose",
            "start",
            "--port",
            "9001",
            "--redis-url",
            "redis://cache:6379",
        ])
        .unwrap();
        assert!(cli.verbose);
        let Commands::Start(args) = cli.command else {
            panic!("expected start");
        };
        assert_eq!(args.port, Some(9001));
        assert_eq!(args.redis_url.as_deref(), Some("redis://cache:6379"));
    }
}

//! # trellis
//!
//! Collaboration store for agents: guarded collections, leases, the event
//! log and its live tail, served over HTTP.
//!
//! ## Commands
//!
//! - `trellis serve` - HTTP API plus the periodic lease sweep
//! - `trellis sweep` - reclaim dead leases once
//! - `trellis reconcile` - backfill task transitions missing from the log
//! - `trellis status` - task, lease and agent counts
//! - `trellis events [--since N]` - print logged events as NDJSON
//! - `trellis config show|validate` - configuration management
//!
//! Only one process may open a data directory. While `serve` runs, the other
//! commands are refused and the same work is available over HTTP.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

mod commands;
mod http;

use commands::ConfigCommand;

/// Collaboration store for multi-agent task pools
#[derive(Parser)]
#[command(name = "trellis")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides TRELLIS_CONFIG and ./trellis.yaml)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "TRELLIS_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API and run the lease sweep
    Serve {
        /// Bind host (overrides server.host)
        #[arg(long)]
        host: Option<String>,

        /// Bind port (overrides server.port)
        #[arg(long)]
        port: Option<u16>,

        /// Skip the startup reconciliation pass
        #[arg(long)]
        no_reconcile: bool,
    },

    /// Reclaim every dead lease once
    Sweep,

    /// Append backfill events for transitions the log is missing
    Reconcile,

    /// Print task, lease and agent counts
    Status,

    /// Print logged events as NDJSON
    Events {
        /// Only events with a seq greater than this
        #[arg(long, default_value_t = 0)]
        since: u64,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Serve {
            host,
            port,
            no_reconcile,
        } => commands::serve(config, host, port, !no_reconcile).await,
        Commands::Sweep => commands::sweep(config).await,
        Commands::Reconcile => commands::reconcile(config).await,
        Commands::Status => commands::status(config).await,
        Commands::Events { since } => commands::events(config, since).await,
        Commands::Config { command } => commands::config(command, config),
    }
}

/// `RUST_LOG` wins over `--log-level`.
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    Ok(())
}

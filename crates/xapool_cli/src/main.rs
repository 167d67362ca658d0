//! xapool CLI
//!
//! Command-line tools for xapool configurations.
//!
//! # Commands
//!
//! - `check-config` - Validate a data source configuration file
//! - `simulate` - Run a transactional workload against an in-memory resource
//! - `recover` - Leave in-doubt branches behind and run a recovery pass

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// xapool command-line tools.
#[derive(Parser)]
#[command(name = "xapool")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a JSON data source configuration
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    CheckConfig {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run a transactional workload against an in-memory resource
    Simulate {
        /// Number of concurrent clients
        #[arg(short, long, default_value = "4")]
        threads: usize,

        /// Transactions per client
        #[arg(short = 'n', long, default_value = "100")]
        transactions: usize,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Simulate a coordinator crash and run a recovery pass
    Recover {
        /// Branches whose commit decision was logged before the crash
        #[arg(long, default_value = "1")]
        decided: usize,

        /// Branches prepared without a logged decision
        #[arg(long, default_value = "1")]
        orphaned: usize,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::CheckConfig { format } => {
            let path = cli.config.ok_or("Configuration path required for check-config")?;
            commands::check_config::run(&path, &format)?;
        }
        Commands::Simulate {
            threads,
            transactions,
            format,
        } => {
            let config = commands::load_or_default(cli.config.as_deref())?;
            commands::simulate::run(config, threads, transactions, &format)?;
        }
        Commands::Recover {
            decided,
            orphaned,
            format,
        } => {
            let config = commands::load_or_default(cli.config.as_deref())?;
            commands::recover::run(config, decided, orphaned, &format)?;
        }
        Commands::Version => {
            println!("xapool CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("xapool core v{}", xapool_core::VERSION);
        }
    }

    Ok(())
}

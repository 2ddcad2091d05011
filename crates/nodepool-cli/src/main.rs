//! nodepool — inspect and exercise per-node connection pools.
//!
//! # Usage
//!
//! ```text
//! nodepool init --address 10.0.0.1:3000
//! nodepool check --config nodepool.toml
//! nodepool probe --config nodepool.toml --rounds 100 --concurrency 8
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "nodepool",
    about = "Per-node connection pools for cluster database clients",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter nodepool.toml
    Init {
        /// Address of the first node (host:port)
        #[arg(short, long)]
        address: String,
        /// Output file
        #[arg(short, long, default_value = "nodepool.toml")]
        output: PathBuf,
    },
    /// Load and validate a config file, then print the resolved settings
    Check {
        #[arg(short, long, default_value = "nodepool.toml")]
        config: PathBuf,
    },
    /// Borrow, use, and release connections against every configured node.
    ///
    /// Each node gets `concurrency` tasks running `rounds` cycles. Per-node
    /// pool statistics are printed as JSON when the run finishes.
    Probe {
        #[arg(short, long, default_value = "nodepool.toml")]
        config: PathBuf,
        /// Borrow/release cycles per task
        #[arg(short, long, default_value = "10")]
        rounds: usize,
        /// Concurrent tasks per node
        #[arg(long, default_value = "4")]
        concurrency: usize,
        /// Bytes sent (and read back) on each borrowed connection
        #[arg(short, long)]
        payload: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Init { address, output } => commands::init::init(&address, &output),
        Commands::Check { config } => commands::check::check(&config),
        Commands::Probe {
            config,
            rounds,
            concurrency,
            payload,
        } => commands::probe::probe(&config, rounds, concurrency, payload).await,
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,nodepool=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

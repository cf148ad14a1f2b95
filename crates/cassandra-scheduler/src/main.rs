//! cassandra-scheduler — the Cassandra scheduler daemon.
//!
//! Single binary with three modes:
//! - `store-node`: one member of the consensus record store
//! - `run`: configuration manager + REST API against the consensus store
//! - `standalone`: the same, backed by an embedded on-disk store
//!
//! # Usage
//!
//! ```text
//! cassandra-scheduler store-node --id 1 --listen 10.0.0.1:2281 --data-dir /var/lib/cassandra-store
//! cassandra-scheduler store-node --id 2 --listen 10.0.0.2:2281 --data-dir /var/lib/cassandra-store --join 10.0.0.1:2281
//! cassandra-scheduler run --config scheduler.toml
//! ```

mod scheduler;
mod store_node;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(name = "cassandra-scheduler", about = "Cassandra scheduler daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a consensus store node.
    StoreNode {
        /// Raft node id, unique within the store cluster.
        #[arg(long)]
        id: u64,

        /// Address to listen on; also the address peers use to reach this node.
        #[arg(long)]
        listen: String,

        /// Data directory for the node's log and records.
        #[arg(long, default_value = "/var/lib/cassandra-store")]
        data_dir: PathBuf,

        /// Address of an existing member to join. Bootstraps a new cluster
        /// when absent.
        #[arg(long)]
        join: Option<String>,
    },

    /// Run the scheduler against the consensus store named in the config.
    Run {
        /// Path to scheduler.toml.
        #[arg(long, default_value = "scheduler.toml")]
        config: PathBuf,
    },

    /// Run the scheduler with an embedded single-node store.
    Standalone {
        /// Path to scheduler.toml. The `[store]` endpoints are ignored.
        #[arg(long, default_value = "scheduler.toml")]
        config: PathBuf,

        /// Data directory for the embedded store.
        #[arg(long, default_value = "/var/lib/cassandra-scheduler")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| {
                    tracing_subscriber::EnvFilter::try_new(
                        "info,cassandra_scheduler=debug,cassandra=debug",
                    )
                })?,
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::StoreNode {
            id,
            listen,
            data_dir,
            join,
        } => store_node::run_store_node(id, listen, data_dir, join).await,
        Command::Run { config } => {
            info!(config = ?config, "Cassandra scheduler starting");
            scheduler::run_consensus(&config).await
        }
        Command::Standalone { config, data_dir } => {
            info!(config = ?config, "Cassandra scheduler starting in standalone mode");
            scheduler::run_standalone(&config, data_dir).await
        }
    }
}

/// Resolve on Ctrl-C.
pub(crate) async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for CTRL+C");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

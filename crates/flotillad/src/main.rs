//! flotillad — the Flotilla daemon.
//!
//! One binary, two modes:
//!
//! - **controller** — owns the cluster: runs the engine, the foreman,
//!   one cloud reconciler per (provider, region, namespace), and the
//!   query/deploy API.
//! - **minion** — runs on every cluster node: serves the config RPC
//!   and, when elected leader, the blueprint updater and the container
//!   scheduler.
//!
//! # Usage
//!
//! ```text
//! flotillad controller --listen unix:///var/run/flotilla.sock
//! flotillad controller --listen tcp://0.0.0.0:9000 --admin-key-file ~/.ssh/id_rsa.pub
//! flotillad minion
//! ```

mod controller;
mod minion;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "flotillad", about = "Flotilla cluster orchestrator daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller: engine, foreman, cloud reconcilers, API.
    Controller {
        /// API listen address (unix:///path or tcp://host:port).
        #[arg(long, default_value = "unix:///var/run/flotilla.sock")]
        listen: String,

        /// File holding the administrator's SSH public key, granted on
        /// every machine in addition to the blueprint's keys.
        #[arg(long)]
        admin_key_file: Option<PathBuf>,
    },

    /// Run a cluster node: config RPC server, updater, scheduler.
    Minion {
        /// Config RPC listen address.
        #[arg(long, default_value = "0.0.0.0:9999")]
        listen: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,flotillad=debug,flotilla=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Controller {
            listen,
            admin_key_file,
        } => controller::run_controller(listen, admin_key_file).await,
        Command::Minion { listen } => minion::run_minion(listen).await,
    }
}

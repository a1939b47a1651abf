//! keldad — the Kelda daemon.
//!
//! One binary, two modes:
//!
//! - **daemon** — the control plane: blueprint API, machine reconcilers,
//!   foreman, role assignment, counters debug endpoint
//! - **minion** — the per-host agent: configuration RPC, supervisor, and
//!   the OVN network master loop on the etcd leader
//!
//! # Usage
//!
//! ```text
//! keldad daemon --api-port 9000 --minion-port 9999 --tls-dir /var/lib/kelda/tls
//! keldad minion --rpc-port 9999 --tls-dir /var/lib/kelda/tls
//! keldad gen-tls --out-dir /var/lib/kelda/tls --host 10.0.0.1
//! ```

mod api;
mod daemon;
mod drivers;
mod host;
mod minion_mode;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "keldad", about = "Kelda daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    Daemon {
        /// HTTP port for the blueprint API and debug endpoints.
        #[arg(long, default_value = "9000")]
        api_port: u16,

        /// Port the minions' configuration RPC listens on.
        #[arg(long, default_value = "9999")]
        minion_port: u16,

        /// Directory holding ca.pem, cert.pem, and key.pem; plaintext RPC
        /// when omitted.
        #[arg(long)]
        tls_dir: Option<PathBuf>,
    },

    /// Run the per-host agent.
    Minion {
        /// Port to serve the configuration RPC on.
        #[arg(long, default_value = "9999")]
        rpc_port: u16,

        /// Directory holding ca.pem, cert.pem, and key.pem; plaintext RPC
        /// when omitted.
        #[arg(long)]
        tls_dir: Option<PathBuf>,
    },

    /// Generate a deployment CA and identity for the minion channel.
    GenTls {
        /// Directory to write the PEM files into.
        #[arg(long)]
        out_dir: PathBuf,

        /// Addresses to include as subject alternative names.
        #[arg(long = "host")]
        hosts: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    match Cli::parse().command {
        Command::Daemon {
            api_port,
            minion_port,
            tls_dir,
        } => daemon::run_daemon(api_port, minion_port, tls_dir).await,
        Command::Minion { rpc_port, tls_dir } => minion_mode::run_minion(rpc_port, tls_dir).await,
        Command::GenTls { out_dir, hosts } => daemon::generate_tls(&out_dir, &hosts),
    }
}

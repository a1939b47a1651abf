//! Minion mode: the host-side agent.
//!
//! Serves the configuration RPC the foreman drives, runs the supervisor
//! over the local Docker daemon, and (when this host leads etcd) the OVN
//! network master loop.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use kelda_db::Conn;
use kelda_minion::{CachingRuntime, ExecRunner, MinionRpc, Supervisor};

use crate::daemon::load_server_tls;
use crate::host::{DockerCli, HostExec, NbctlClient};

/// Run the minion until interrupted.
pub async fn run_minion(rpc_port: u16, tls_dir: Option<PathBuf>) -> anyhow::Result<()> {
    info!("keldad starting in minion mode");
    let conn = Conn::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Configuration RPC ────────────────────────────────────────
    let rpc = MinionRpc::new(&conn);
    let mut builder = tonic::transport::Server::builder();
    if let Some(dir) = &tls_dir {
        builder = builder.tls_config(load_server_tls(dir)?)?;
    }
    let addr = SocketAddr::from(([0, 0, 0, 0], rpc_port));
    info!(%addr, "minion RPC server starting");
    let rpc_handle = tokio::spawn(async move {
        if let Err(err) = builder.add_service(rpc.into_service()).serve(addr).await {
            error!(error = %err, "minion RPC server error");
        }
    });

    // ── Supervisor ───────────────────────────────────────────────
    let exec: Arc<dyn ExecRunner> = Arc::new(HostExec);
    let runtime = Arc::new(CachingRuntime::new(DockerCli::new(Arc::clone(&exec))));
    let supervisor = Supervisor::new(&conn, runtime, Arc::clone(&exec));
    let supervisor_handle = tokio::spawn(supervisor.run(shutdown_rx.clone()));

    // ── Network master loop ──────────────────────────────────────
    let ovsdb = Arc::new(NbctlClient::new(exec));
    let network_handle = tokio::spawn(kelda_minion::network::run(
        conn.clone(),
        ovsdb,
        shutdown_rx.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C handler");
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    rpc_handle.abort();
    let _ = supervisor_handle.await;
    let _ = network_handle.await;
    info!("minion stopped");
    Ok(())
}

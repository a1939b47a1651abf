//! Daemon mode: the control-plane side.
//!
//! Runs the blueprint API, the cloud director (machine reconcilers, the
//! foreman, role assignment), and the counters debug endpoint, all against
//! one in-memory store that is rebuilt from the cloud on restart.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use kelda_db::Conn;
use kelda_foreman::{Foreman, TonicClientFactory};
use kelda_proto::tls::CertKeyPair;

use crate::{api, drivers};

/// Run the control plane until interrupted.
pub async fn run_daemon(
    api_port: u16,
    minion_port: u16,
    tls_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    info!("keldad starting in daemon mode");
    let conn = Conn::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Foreman sessions ─────────────────────────────────────────
    let tls = match &tls_dir {
        Some(dir) => Some(load_client_tls(dir)?),
        None => None,
    };
    let factory = Arc::new(TonicClientFactory::new(minion_port, tls));
    let foreman = Foreman::new(&conn, factory);

    // ── Cloud director ───────────────────────────────────────────
    let cloud = tokio::spawn(kelda_cloud::director::run(
        conn.clone(),
        Arc::new(drivers::Registry),
        foreman,
        shutdown_rx.clone(),
    ));

    // ── API server ───────────────────────────────────────────────
    let router = api::router(conn.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], api_port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = cloud.await;
    info!("daemon stopped");
    Ok(())
}

fn load_client_tls(dir: &Path) -> anyhow::Result<tonic::transport::ClientTlsConfig> {
    let (ca, identity) = load_identity(dir)?;
    Ok(kelda_proto::tls::client_tls(&ca, &identity))
}

pub(crate) fn load_server_tls(dir: &Path) -> anyhow::Result<tonic::transport::ServerTlsConfig> {
    let (ca, identity) = load_identity(dir)?;
    Ok(kelda_proto::tls::server_tls(&ca, &identity))
}

fn load_identity(dir: &Path) -> anyhow::Result<(String, CertKeyPair)> {
    let read = |name: &str| {
        std::fs::read_to_string(dir.join(name))
            .map_err(|err| anyhow::anyhow!("read {}: {err}", dir.join(name).display()))
    };
    let ca = read("ca.pem")?;
    let identity = CertKeyPair {
        cert_pem: read("cert.pem")?,
        key_pem: read("key.pem")?,
    };
    Ok((ca, identity))
}

/// Generate a deployment CA and one identity signed by it.
pub fn generate_tls(out_dir: &Path, hosts: &[String]) -> anyhow::Result<()> {
    std::fs::create_dir_all(out_dir)?;
    let ca = kelda_proto::tls::generate_ca()?;
    let identity = ca.node_cert("kelda", hosts)?;
    std::fs::write(out_dir.join("ca.pem"), &ca.pair.cert_pem)?;
    std::fs::write(out_dir.join("ca-key.pem"), &ca.pair.key_pem)?;
    std::fs::write(out_dir.join("cert.pem"), &identity.cert_pem)?;
    std::fs::write(out_dir.join("key.pem"), &identity.key_pem)?;
    info!(dir = %out_dir.display(), "wrote TLS material");
    Ok(())
}

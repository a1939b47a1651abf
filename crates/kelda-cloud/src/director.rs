//! The cloud director: one task per `(Provider, Region)` partition, plus
//! the foreman and role assignment on a shared cadence.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use kelda_counter::EventTimer;
use kelda_db::{Author, Conn, Machine, ProviderName, StoreError, Table};
use kelda_foreman::Foreman;

use crate::cluster::{assign_roles, Cluster, STATUS_REBOOTING};
use crate::provider::{Provider, ProviderFactory};

struct PartitionTask {
    provider: Arc<dyn Provider>,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Run the cloud side until `shutdown` flips: keep a reconciler alive for
/// every machine partition, tick the foreman, translate its reboot verdicts
/// into machine status, and keep roles and etcd membership assigned.
pub async fn run(
    conn: Conn,
    factory: Arc<dyn ProviderFactory>,
    mut foreman: Foreman,
    mut shutdown: watch::Receiver<bool>,
) {
    foreman.init().await;

    let mut trigger = conn.trigger_tick(30, &[Table::Machine, Table::Blueprint]);
    let mut partitions: HashMap<(ProviderName, String), PartitionTask> = HashMap::new();
    let mut timer = EventTimer::new("Cloud");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            fire = trigger.c.recv() => {
                if fire.is_none() {
                    break;
                }
            }
        }
        timer.log_start();
        sync_partitions(&conn, factory.as_ref(), &mut partitions);
        foreman.run_once().await;
        flag_reboots(&conn, &foreman);
        if let Err(err) = assign_roles(&conn) {
            warn!(error = %err, "role assignment aborted");
        }
        timer.log_end();
    }

    for (_, task) in partitions {
        let _ = task.stop.send(true);
        let _ = task.handle.await;
    }
}

/// Ensure one reconciler task per live partition; clean up the rest.
fn sync_partitions(
    conn: &Conn,
    factory: &dyn ProviderFactory,
    partitions: &mut HashMap<(ProviderName, String), PartitionTask>,
) {
    let (live, namespace) = match conn.txn(&[]).run(|view| {
        let live: HashSet<(ProviderName, String)> = view
            .all::<Machine>()
            .into_iter()
            .map(|m| (m.provider, m.region))
            .collect();
        let namespace = view
            .all::<kelda_db::Blueprint>()
            .into_iter()
            .next()
            .map(|row| row.namespace)
            .unwrap_or_default();
        Ok::<_, StoreError>((live, namespace))
    }) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!(error = %err, "failed to snapshot partitions");
            return;
        }
    };

    for key in live.iter() {
        if partitions.contains_key(key) {
            continue;
        }
        let (name, region) = key.clone();
        let provider = match factory.provider(name, &region, &namespace) {
            Ok(provider) => provider,
            Err(err) => {
                warn!(provider = %name, %region, error = %err,
                      "failed to construct provider");
                continue;
            }
        };
        info!(provider = %name, %region, "starting machine reconciler");
        let (stop_tx, stop_rx) = watch::channel(false);
        let cluster = Cluster::new(conn, Arc::clone(&provider), name, &region);
        let mut trigger = conn.trigger_tick(30, &[Table::Machine, Table::Blueprint]);
        let handle = tokio::spawn(async move {
            let mut stop = stop_rx;
            loop {
                tokio::select! {
                    _ = stop.changed() => return,
                    fire = trigger.c.recv() => {
                        if fire.is_none() {
                            return;
                        }
                    }
                }
                cluster.run_once().await;
            }
        });
        partitions.insert(
            key.clone(),
            PartitionTask {
                provider,
                stop: stop_tx,
                handle,
            },
        );
    }

    let dead: Vec<_> = partitions
        .keys()
        .filter(|key| !live.contains(*key))
        .cloned()
        .collect();
    for key in dead {
        if let Some(task) = partitions.remove(&key) {
            info!(provider = %key.0, region = %key.1, "stopping machine reconciler");
            let _ = task.stop.send(true);
            task.handle.abort();
            let provider = task.provider;
            tokio::spawn(async move {
                if let Err(err) = provider.cleanup().await {
                    warn!(error = %err, "provider cleanup failed");
                }
            });
        }
    }
}

/// Set `rebooting` status on machines the foreman has given up on.
fn flag_reboots(conn: &Conn, foreman: &Foreman) {
    let candidates = foreman.reboot_candidates();
    if candidates.is_empty() {
        return;
    }
    let result = conn
        .scoped(Author::Cluster)
        .txn(&[Table::Machine])
        .run(|view| {
            for public_ip in &candidates {
                let rows = view.select_from::<Machine>(|m| {
                    m.public_ip == *public_ip && m.status != STATUS_REBOOTING
                });
                for mut row in rows {
                    warn!(%public_ip, "scheduling reboot for mismatched minion");
                    row.status = STATUS_REBOOTING.to_string();
                    view.commit(row)?;
                }
            }
            Ok::<_, StoreError>(())
        });
    if let Err(err) = result {
        warn!(error = %err, "failed to flag reboots");
    }
}

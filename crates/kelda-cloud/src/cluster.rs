//! The machine reconciler.
//!
//! One `Cluster` instance owns a `(Provider, Region)` partition of the
//! machine table. Each pass reconciles the store against the cloud, decides
//! boots and stops with a score join, then converges floating IPs and
//! security rules. Transient failures are logged and retried next tick.
//!
//! The machine table holds two kinds of rows. Desired rows are written by
//! the engine and have no cloud id. Observed rows are written here: one per
//! cloud machine, plus a placeholder (empty cloud id, boot-failure status)
//! for each spec whose boot failed, so the next tick does not immediately
//! retry it.

use std::sync::Arc;

use tracing::{info, warn};

use kelda_counter::Counter;
use kelda_db::{Author, Conn, Etcd, Machine, ProviderName, Role, StoreError, Table};
use kelda_join::{hash_join, score_join};

use crate::provider::{Acl, Provider};

/// Status of a spec whose most recent boot failed.
pub const STATUS_BOOT_FAILURE: &str = "boot failure";
/// Status of a machine the foreman wants power-cycled.
pub const STATUS_REBOOTING: &str = "rebooting";
/// Status of a healthy cloud-backed machine.
pub const STATUS_RUNNING: &str = "running";

/// The reconciler for one `(Provider, Region)` partition.
pub struct Cluster {
    conn: Conn,
    provider: Arc<dyn Provider>,
    name: ProviderName,
    region: String,
    counter: Counter,
}

/// The outside-world work one pass decided on.
#[derive(Debug, Default)]
struct Actions {
    to_boot: Vec<Machine>,
    to_stop: Vec<Machine>,
    floating: Vec<Machine>,
    acls: Vec<Acl>,
}

impl Cluster {
    pub fn new(conn: &Conn, provider: Arc<dyn Provider>, name: ProviderName, region: &str) -> Cluster {
        let counter = Counter::new("Cluster");
        counter.inc("New");
        Cluster {
            conn: conn.scoped(Author::Cluster),
            provider,
            name,
            region: region.to_string(),
            counter,
        }
    }

    /// One reconcile pass. Never fails the tick; errors are logged and the
    /// next tick retries.
    pub async fn run_once(&self) {
        self.counter.inc("Run");

        self.counter.inc("List");
        let cloud = match self.provider.list().await {
            Ok(cloud) => cloud,
            Err(err) => {
                warn!(provider = %self.name, region = %self.region, error = %err,
                      "failed to list machines");
                return;
            }
        };

        let actions = match self.reconcile(cloud) {
            Ok(actions) => actions,
            Err(err) => {
                warn!(provider = %self.name, region = %self.region, error = %err,
                      "machine reconcile aborted");
                return;
            }
        };
        self.apply(actions).await;
    }

    /// Fold the cloud listing into the store and decide boots and stops.
    fn reconcile(&self, cloud: Vec<Machine>) -> Result<Actions, StoreError> {
        let name = self.name;
        let region = self.region.clone();
        self.conn.txn(&[Table::Machine]).run(|view| {
            let in_partition = |m: &Machine| m.provider == name && m.region == region;

            // Observed rows against the cloud listing, matched by cloud id.
            let observed_backed = view
                .select_from::<Machine>(|m| in_partition(m) && !m.cloud_id.is_empty());
            let joined = hash_join(
                observed_backed,
                cloud,
                |m: &Machine| m.cloud_id.clone(),
                |m: &Machine| m.cloud_id.clone(),
            );
            for (mut row, seen) in joined.pairs {
                row.public_ip = seen.public_ip;
                row.private_ip = seen.private_ip;
                row.size = seen.size;
                if seen.disk_size != 0 {
                    row.disk_size = seen.disk_size;
                }
                if row.status.is_empty() {
                    row.status = STATUS_RUNNING.to_string();
                }
                view.commit(row)?;
            }
            for gone in joined.left {
                view.remove(&gone);
            }
            for unknown in joined.right {
                let mut row = view.insert::<Machine>();
                let id = row.id;
                row = unknown;
                row.id = id;
                row.provider = name;
                row.region = region.clone();
                row.status = STATUS_RUNNING.to_string();
                view.commit(row)?;
                info!(provider = %name, region = %region, "adopted unknown cloud machine");
            }

            // Desired specs against observed rows. Machines flagged for
            // reboot are stopped, not paired.
            let desired = view.select_from::<Machine>(|m| {
                in_partition(m) && m.cloud_id.is_empty() && m.status != STATUS_BOOT_FAILURE
            });
            let observed = view.select_from::<Machine>(|m| {
                in_partition(m)
                    && (!m.cloud_id.is_empty() || m.status == STATUS_BOOT_FAILURE)
            });
            let (rebooting, pairable): (Vec<_>, Vec<_>) = observed
                .into_iter()
                .partition(|m| m.status == STATUS_REBOOTING);

            let joined = score_join(desired, pairable, machine_score);

            let mut actions = Actions::default();
            for (spec, mut row) in joined.pairs {
                if row.role != spec.role || row.floating_ip != spec.floating_ip {
                    row.role = spec.role;
                    row.floating_ip = spec.floating_ip;
                    view.commit(row)?;
                }
            }
            actions.to_boot = joined.left;
            for extra in joined.right {
                if extra.cloud_id.is_empty() {
                    // A stale boot-failure placeholder; its spec is gone.
                    view.remove(&extra);
                } else {
                    actions.to_stop.push(extra);
                }
            }
            actions.to_stop.extend(rebooting);

            actions.floating = view.select_from::<Machine>(|m| {
                in_partition(m) && !m.cloud_id.is_empty()
            });
            actions.acls = build_acls(view);
            Ok(actions)
        })
    }

    /// Carry out the decided actions against the provider.
    async fn apply(&self, actions: Actions) {
        if !actions.to_boot.is_empty() {
            self.counter.inc("Boot");
            info!(provider = %self.name, region = %self.region,
                  count = actions.to_boot.len(), "booting machines");
            match self.provider.boot(actions.to_boot.clone()).await {
                Ok(ids) => {
                    info!(provider = %self.name, region = %self.region,
                          count = ids.len(), "boot issued");
                }
                Err(err) => {
                    warn!(provider = %self.name, region = %self.region, error = %err,
                          "partial boot failure");
                    let failed = actions.to_boot[err.booted.len()..].to_vec();
                    self.record_boot_failures(failed);
                }
            }
        }

        if !actions.to_stop.is_empty() {
            self.counter.inc("Stop");
            info!(provider = %self.name, region = %self.region,
                  count = actions.to_stop.len(), "stopping machines");
            match self.provider.stop(actions.to_stop.clone()).await {
                Ok(()) => self.forget(&actions.to_stop),
                Err(err) => warn!(provider = %self.name, region = %self.region,
                                  error = %err, "failed to stop machines"),
            }
        }

        self.counter.inc("UpdateFloatingIPs");
        if let Err(err) = self.provider.update_floating_ips(actions.floating).await {
            warn!(provider = %self.name, region = %self.region, error = %err,
                  "failed to update floating IPs");
        }

        self.counter.inc("SetACLs");
        if let Err(err) = self.provider.set_acls(actions.acls).await {
            warn!(provider = %self.name, region = %self.region, error = %err,
                  "failed to set ACLs");
        }
    }

    /// Persist a boot-failure placeholder for each spec that did not come
    /// up, so the next tick pairs the spec instead of re-booting it.
    fn record_boot_failures(&self, failed: Vec<Machine>) {
        let result = self.conn.txn(&[Table::Machine]).run(|view| {
            for spec in &failed {
                let mut row = view.insert::<Machine>();
                row.provider = spec.provider;
                row.region = spec.region.clone();
                row.size = spec.size.clone();
                row.disk_size = spec.disk_size;
                row.preemptible = spec.preemptible;
                row.role = spec.role;
                row.status = STATUS_BOOT_FAILURE.to_string();
                view.commit(row)?;
            }
            Ok::<_, StoreError>(())
        });
        if let Err(err) = result {
            warn!(error = %err, "failed to record boot failures");
        }
    }

    /// Drop the rows of machines we just told the provider to terminate;
    /// the next listing confirms, or resurrects them for another try.
    fn forget(&self, stopped: &[Machine]) {
        let result = self.conn.txn(&[Table::Machine]).run(|view| {
            for machine in stopped {
                view.remove(machine);
            }
            Ok::<_, StoreError>(())
        });
        if let Err(err) = result {
            warn!(error = %err, "failed to drop stopped machine rows");
        }
    }
}

/// Compatibility score between a desired spec and an observed machine.
/// Negative means the machine can never satisfy the spec.
fn machine_score(spec: &Machine, actual: &Machine) -> i32 {
    if spec.size != actual.size || spec.preemptible != actual.preemptible {
        return -1;
    }
    if spec.disk_size != 0 && actual.disk_size != 0 && spec.disk_size != actual.disk_size {
        return -1;
    }
    let mut score = 0;
    if spec.role != actual.role {
        score += 1;
    }
    if spec.floating_ip != actual.floating_ip {
        score += 1;
    }
    score
}

/// The namespace's inbound allowances: the blueprint's admin ACL over the
/// full port range, plus every connection whose source is the public
/// internet.
fn build_acls(view: &kelda_db::Database<'_>) -> Vec<Acl> {
    let mut acls = Vec::new();
    if let Some(row) = view.all::<kelda_db::Blueprint>().into_iter().next() {
        if let Ok(bp) = kelda_blueprint::Blueprint::from_json(&row.blueprint) {
            for cidr in &bp.admin_acl {
                acls.push(Acl {
                    cidr_ip: cidr.clone(),
                    min_port: 1,
                    max_port: 65535,
                });
            }
            for conn in &bp.connections {
                if conn.from.iter().any(|f| f == "public") {
                    acls.push(Acl {
                        cidr_ip: "0.0.0.0/0".to_string(),
                        min_port: i32::from(conn.min_port),
                        max_port: i32::from(conn.max_port),
                    });
                }
            }
        }
    }
    acls.sort();
    acls.dedup();
    acls
}

/// Promote machines to satisfy the blueprint's master count and recompute
/// the etcd membership row. Runs once per director tick, across all
/// partitions.
pub fn assign_roles(conn: &Conn) -> Result<(), StoreError> {
    let conn = conn.scoped(Author::Cluster);
    conn.txn(&[Table::Machine, Table::Etcd]).run(|view| {
        let target = view
            .all::<kelda_db::Blueprint>()
            .into_iter()
            .next()
            .and_then(|row| kelda_blueprint::Blueprint::from_json(&row.blueprint).ok())
            .map(|bp| bp.master_count())
            .unwrap_or(0);

        let mut machines = view.select_from::<Machine>(|m| !m.cloud_id.is_empty());
        machines.sort_by_key(|m| m.id);

        let mut masters = machines.iter().filter(|m| m.role == Role::Master).count();
        for machine in &mut machines {
            if masters >= target {
                break;
            }
            if machine.role == Role::None {
                machine.role = Role::Master;
                masters += 1;
                info!(private_ip = %machine.private_ip, "promoted machine to master");
                view.commit(machine.clone())?;
            }
        }

        let mut etcd_ips: Vec<String> = machines
            .iter()
            .filter(|m| m.role == Role::Master && !m.private_ip.is_empty())
            .map(|m| m.private_ip.clone())
            .collect();
        etcd_ips.sort();
        etcd_ips.dedup();

        let mut etcd = match view.etcd() {
            Some(etcd) => etcd,
            None => view.insert::<Etcd>(),
        };
        let leader_valid = etcd_ips.iter().any(|ip| *ip == etcd.leader_ip);
        let leader_ip = if etcd_ips.is_empty() {
            String::new()
        } else if leader_valid {
            etcd.leader_ip.clone()
        } else {
            etcd_ips[0].clone()
        };
        if etcd.etcd_ips != etcd_ips || etcd.leader_ip != leader_ip {
            etcd.etcd_ips = etcd_ips;
            etcd.leader_ip = leader_ip;
            view.commit(etcd)?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::provider::BootError;

    const REGION: &str = "us-west-1";

    #[derive(Default)]
    struct FakeCloud {
        machines: Vec<Machine>,
        boot_calls: Vec<Vec<Machine>>,
        stop_calls: Vec<Vec<Machine>>,
        floating_calls: Vec<Vec<Machine>>,
        acl_calls: Vec<Vec<Acl>>,
        next_id: u32,
        fail_boot: bool,
    }

    #[derive(Clone, Default)]
    struct FakeProvider {
        cloud: Arc<Mutex<FakeCloud>>,
    }

    impl FakeProvider {
        fn seed(&self, size: &str, cloud_id: &str, private_ip: &str) {
            let mut cloud = self.cloud.lock().unwrap();
            cloud.machines.push(Machine {
                cloud_id: cloud_id.to_string(),
                provider: ProviderName::Amazon,
                region: REGION.to_string(),
                size: size.to_string(),
                public_ip: format!("pub-{cloud_id}"),
                private_ip: private_ip.to_string(),
                ..Machine::default()
            });
        }
    }

    #[async_trait]
    impl Provider for FakeProvider {
        async fn list(&self) -> anyhow::Result<Vec<Machine>> {
            Ok(self.cloud.lock().unwrap().machines.clone())
        }

        async fn boot(&self, machines: Vec<Machine>) -> Result<Vec<String>, BootError> {
            let mut cloud = self.cloud.lock().unwrap();
            cloud.boot_calls.push(machines.clone());
            if cloud.fail_boot {
                return Err(BootError {
                    booted: Vec::new(),
                    source: anyhow::anyhow!("instance quota exceeded"),
                });
            }
            let mut ids = Vec::new();
            for spec in machines {
                cloud.next_id += 1;
                let next_id = cloud.next_id;
                let cloud_id = format!("i-{}", next_id);
                ids.push(cloud_id.clone());
                cloud.machines.push(Machine {
                    cloud_id,
                    public_ip: format!("54.0.0.{}", next_id),
                    private_ip: format!("10.0.0.{}", next_id),
                    role: Role::None,
                    floating_ip: String::new(),
                    status: String::new(),
                    id: 0,
                    ..spec
                });
            }
            Ok(ids)
        }

        async fn stop(&self, machines: Vec<Machine>) -> anyhow::Result<()> {
            let mut cloud = self.cloud.lock().unwrap();
            let doomed: Vec<String> = machines.iter().map(|m| m.cloud_id.clone()).collect();
            cloud.machines.retain(|m| !doomed.contains(&m.cloud_id));
            cloud.stop_calls.push(machines);
            Ok(())
        }

        async fn update_floating_ips(&self, machines: Vec<Machine>) -> anyhow::Result<()> {
            self.cloud.lock().unwrap().floating_calls.push(machines);
            Ok(())
        }

        async fn set_acls(&self, acls: Vec<Acl>) -> anyhow::Result<()> {
            self.cloud.lock().unwrap().acl_calls.push(acls);
            Ok(())
        }

        async fn cleanup(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn cluster(conn: &Conn) -> (Cluster, FakeProvider) {
        let fake = FakeProvider::default();
        let cluster = Cluster::new(
            conn,
            Arc::new(fake.clone()),
            ProviderName::Amazon,
            REGION,
        );
        (cluster, fake)
    }

    fn insert_desired(conn: &Conn, size: &str, role: Role, floating_ip: &str) {
        conn.scoped(Author::Engine)
            .txn(&[Table::Machine])
            .run(|view| {
                let mut m = view.insert::<Machine>();
                m.provider = ProviderName::Amazon;
                m.region = REGION.to_string();
                m.size = size.to_string();
                m.role = role;
                m.floating_ip = floating_ip.to_string();
                view.commit(m)?;
                Ok::<_, StoreError>(())
            })
            .unwrap();
    }

    fn machines(conn: &Conn) -> Vec<Machine> {
        conn.txn(&[])
            .run(|view| Ok::<_, StoreError>(view.all::<Machine>()))
            .unwrap()
    }

    #[tokio::test]
    async fn boots_missing_machines_once() {
        let conn = Conn::new();
        let (cluster, fake) = cluster(&conn);

        insert_desired(&conn, "m3.medium", Role::Master, "");
        insert_desired(&conn, "m3.medium", Role::Worker, "");

        cluster.run_once().await;
        assert_eq!(fake.cloud.lock().unwrap().boot_calls.len(), 1);
        assert_eq!(fake.cloud.lock().unwrap().boot_calls[0].len(), 2);

        // The next pass adopts the listed machines instead of re-booting.
        cluster.run_once().await;
        assert_eq!(fake.cloud.lock().unwrap().boot_calls.len(), 1);
        let rows = machines(&conn);
        assert_eq!(rows.iter().filter(|m| !m.cloud_id.is_empty()).count(), 2);
    }

    #[tokio::test]
    async fn stops_machines_with_no_spec() {
        let conn = Conn::new();
        let (cluster, fake) = cluster(&conn);
        fake.seed("m3.medium", "i-1", "10.0.0.1");

        cluster.run_once().await;

        let cloud = fake.cloud.lock().unwrap();
        assert!(cloud.boot_calls.is_empty());
        assert_eq!(cloud.stop_calls.len(), 1);
        assert_eq!(cloud.stop_calls[0][0].cloud_id, "i-1");
        assert!(cloud.machines.is_empty());
    }

    #[tokio::test]
    async fn matched_machines_adopt_role_and_floating_ip() {
        let conn = Conn::new();
        let (cluster, fake) = cluster(&conn);
        fake.seed("m3.medium", "i-1", "10.0.0.1");
        insert_desired(&conn, "m3.medium", Role::Master, "8.8.8.8");

        cluster.run_once().await;

        let cloud = fake.cloud.lock().unwrap();
        assert!(cloud.boot_calls.is_empty());
        assert!(cloud.stop_calls.is_empty());
        drop(cloud);

        let adopted: Vec<Machine> = machines(&conn)
            .into_iter()
            .filter(|m| m.cloud_id == "i-1")
            .collect();
        assert_eq!(adopted.len(), 1);
        assert_eq!(adopted[0].role, Role::Master);
        assert_eq!(adopted[0].floating_ip, "8.8.8.8");
        assert_eq!(adopted[0].status, STATUS_RUNNING);
    }

    #[tokio::test]
    async fn failed_boots_are_not_immediately_retried() {
        let conn = Conn::new();
        let (cluster, fake) = cluster(&conn);
        fake.cloud.lock().unwrap().fail_boot = true;

        insert_desired(&conn, "m3.medium", Role::Worker, "");

        cluster.run_once().await;
        assert_eq!(fake.cloud.lock().unwrap().boot_calls.len(), 1);

        let placeholders: Vec<Machine> = machines(&conn)
            .into_iter()
            .filter(|m| m.status == STATUS_BOOT_FAILURE)
            .collect();
        assert_eq!(placeholders.len(), 1);
        assert_eq!(placeholders[0].size, "m3.medium");

        cluster.run_once().await;
        assert_eq!(fake.cloud.lock().unwrap().boot_calls.len(), 1);
    }

    #[tokio::test]
    async fn stale_boot_failures_are_dropped_with_their_spec() {
        let conn = Conn::new();
        let (cluster, fake) = cluster(&conn);
        fake.cloud.lock().unwrap().fail_boot = true;

        insert_desired(&conn, "m3.medium", Role::Worker, "");
        cluster.run_once().await;

        // Blueprint change: the engine withdraws the spec.
        conn.scoped(Author::Engine)
            .txn(&[Table::Machine])
            .run(|view| {
                for m in view.select_from::<Machine>(|m| m.cloud_id.is_empty()
                    && m.status != STATUS_BOOT_FAILURE)
                {
                    view.remove(&m);
                }
                Ok::<_, StoreError>(())
            })
            .unwrap();

        cluster.run_once().await;
        assert!(machines(&conn).is_empty());
    }

    #[tokio::test]
    async fn rebooting_machines_are_stopped() {
        let conn = Conn::new();
        let (cluster, fake) = cluster(&conn);
        fake.seed("m3.medium", "i-1", "10.0.0.1");
        insert_desired(&conn, "m3.medium", Role::Worker, "");

        cluster.run_once().await;
        assert!(fake.cloud.lock().unwrap().stop_calls.is_empty());

        conn.txn(&[Table::Machine])
            .run(|view| {
                for mut m in view.select_from::<Machine>(|m| m.cloud_id == "i-1") {
                    m.status = STATUS_REBOOTING.to_string();
                    view.commit(m)?;
                }
                Ok::<_, StoreError>(())
            })
            .unwrap();

        cluster.run_once().await;
        let cloud = fake.cloud.lock().unwrap();
        assert_eq!(cloud.stop_calls.len(), 1);
        assert_eq!(cloud.stop_calls[0][0].cloud_id, "i-1");
    }

    #[tokio::test]
    async fn acls_cover_admin_cidrs_and_public_connections() {
        let conn = Conn::new();
        let (cluster, fake) = cluster(&conn);

        let blueprint = r#"{
            "Namespace": "prod",
            "AdminACL": ["1.2.3.4/32"],
            "Connections": [
                {"From": ["public"], "To": ["web"], "MinPort": 80, "MaxPort": 80},
                {"From": ["web"], "To": ["db"], "MinPort": 5432, "MaxPort": 5432}
            ]
        }"#;
        conn.txn(&[Table::Blueprint])
            .run(|view| {
                let mut row = view.insert::<kelda_db::Blueprint>();
                row.blueprint = blueprint.to_string();
                row.namespace = "prod".to_string();
                view.commit(row)?;
                Ok::<_, StoreError>(())
            })
            .unwrap();

        cluster.run_once().await;

        let cloud = fake.cloud.lock().unwrap();
        assert_eq!(
            *cloud.acl_calls.last().unwrap(),
            vec![
                Acl {
                    cidr_ip: "0.0.0.0/0".to_string(),
                    min_port: 80,
                    max_port: 80,
                },
                Acl {
                    cidr_ip: "1.2.3.4/32".to_string(),
                    min_port: 1,
                    max_port: 65535,
                },
            ]
        );
    }

    #[tokio::test]
    async fn floating_ips_run_against_the_post_action_snapshot() {
        let conn = Conn::new();
        let (cluster, fake) = cluster(&conn);
        fake.seed("m3.medium", "i-1", "10.0.0.1");
        insert_desired(&conn, "m3.medium", Role::Worker, "8.8.8.8");

        cluster.run_once().await;

        let cloud = fake.cloud.lock().unwrap();
        let last = cloud.floating_calls.last().unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].cloud_id, "i-1");
        assert_eq!(last[0].floating_ip, "8.8.8.8");
    }

    fn insert_observed(conn: &Conn, cloud_id: &str, private_ip: &str, role: Role) {
        conn.scoped(Author::Cluster)
            .txn(&[Table::Machine])
            .run(|view| {
                let mut m = view.insert::<Machine>();
                m.provider = ProviderName::Amazon;
                m.region = REGION.to_string();
                m.cloud_id = cloud_id.to_string();
                m.private_ip = private_ip.to_string();
                m.role = role;
                view.commit(m)?;
                Ok::<_, StoreError>(())
            })
            .unwrap();
    }

    fn insert_blueprint(conn: &Conn, masters: usize) {
        let machine = r#"{"Provider": "Amazon", "Region": "us-west-1", "Role": "Master"}"#;
        let machines = vec![machine; masters].join(",");
        let raw = format!(r#"{{"Namespace": "prod", "Machines": [{machines}]}}"#);
        conn.txn(&[Table::Blueprint])
            .run(|view| {
                let mut row = view.insert::<kelda_db::Blueprint>();
                row.blueprint = raw.clone();
                row.namespace = "prod".to_string();
                view.commit(row)?;
                Ok::<_, StoreError>(())
            })
            .unwrap();
    }

    #[test]
    fn assign_roles_promotes_lowest_ids() {
        let conn = Conn::new();
        insert_blueprint(&conn, 2);
        insert_observed(&conn, "i-1", "10.0.0.3", Role::None);
        insert_observed(&conn, "i-2", "10.0.0.1", Role::None);
        insert_observed(&conn, "i-3", "10.0.0.2", Role::None);

        assign_roles(&conn).unwrap();

        let rows = conn
            .txn(&[])
            .run(|view| Ok::<_, StoreError>(view.all::<Machine>()))
            .unwrap();
        let masters: Vec<&Machine> = rows.iter().filter(|m| m.role == Role::Master).collect();
        assert_eq!(masters.len(), 2);
        // Lowest row ids win, regardless of IP ordering.
        assert!(masters.iter().any(|m| m.cloud_id == "i-1"));
        assert!(masters.iter().any(|m| m.cloud_id == "i-2"));

        let etcd = conn
            .txn(&[])
            .run(|view| Ok::<_, StoreError>(view.etcd().unwrap()))
            .unwrap();
        assert_eq!(etcd.etcd_ips, vec!["10.0.0.1", "10.0.0.3"]);
        assert_eq!(etcd.leader_ip, "10.0.0.1");

        // Idempotent on a second pass.
        assign_roles(&conn).unwrap();
        let again = conn
            .txn(&[])
            .run(|view| Ok::<_, StoreError>(view.etcd().unwrap()))
            .unwrap();
        assert_eq!(again.etcd_ips, vec!["10.0.0.1", "10.0.0.3"]);
    }

    #[test]
    fn leader_ip_stays_within_the_member_set() {
        let conn = Conn::new();
        insert_blueprint(&conn, 1);
        insert_observed(&conn, "i-1", "10.0.0.1", Role::Master);
        conn.txn(&[Table::Etcd])
            .run(|view| {
                let mut etcd = view.insert::<Etcd>();
                etcd.etcd_ips = vec!["10.0.0.9".to_string()];
                etcd.leader_ip = "10.0.0.9".to_string();
                view.commit(etcd)?;
                Ok::<_, StoreError>(())
            })
            .unwrap();

        assign_roles(&conn).unwrap();

        let etcd = conn
            .txn(&[])
            .run(|view| Ok::<_, StoreError>(view.etcd().unwrap()))
            .unwrap();
        assert_eq!(etcd.etcd_ips, vec!["10.0.0.1"]);
        assert_eq!(etcd.leader_ip, "10.0.0.1");
    }

    #[test]
    fn machine_score_rejects_incompatible_specs() {
        let spec = Machine {
            size: "m3.medium".to_string(),
            ..Machine::default()
        };
        let same = Machine {
            size: "m3.medium".to_string(),
            cloud_id: "i-1".to_string(),
            ..Machine::default()
        };
        let bigger = Machine {
            size: "m3.large".to_string(),
            cloud_id: "i-2".to_string(),
            ..Machine::default()
        };
        let preemptible = Machine {
            size: "m3.medium".to_string(),
            preemptible: true,
            cloud_id: "i-3".to_string(),
            ..Machine::default()
        };
        assert_eq!(machine_score(&spec, &same), 0);
        assert!(machine_score(&spec, &bigger) < 0);
        assert!(machine_score(&spec, &preemptible) < 0);
    }
}

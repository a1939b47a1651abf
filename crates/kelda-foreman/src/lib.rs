//! kelda-foreman — the configuration channel to every minion.
//!
//! The foreman keeps one session per booted machine, keyed by public IP.
//! Each tick it reads back the minion's self-reported role, pushes the
//! desired config (role, private IP, blueprint, etcd members), and records
//! the reported roles in the store. A machine that keeps reporting the
//! wrong role for three ticks becomes a reboot candidate for the cluster
//! reconciler.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use kelda_counter::Counter;
use kelda_db::{Author, Conn, Machine, Minion, Role, StoreError, Table};
use kelda_join::hash_join;
use kelda_proto::{pb_to_role, role_to_pb, MinionConfig};

mod rpc;

pub use rpc::TonicClientFactory;

/// Consecutive mismatched ticks before a machine is power-cycled.
const MISMATCH_TICKS_BEFORE_REBOOT: u32 = 3;

/// The two-operation contract of a minion session.
#[async_trait]
pub trait MinionClient: Send {
    async fn set_minion(&mut self, config: MinionConfig) -> anyhow::Result<()>;
    async fn get_minion(&mut self) -> anyhow::Result<MinionConfig>;
}

/// Opens sessions. Injected so tests can count and fake connections.
pub trait ClientFactory: Send + Sync {
    fn new_client(&self, public_ip: &str) -> anyhow::Result<Box<dyn MinionClient>>;
}

struct Session {
    machine: Machine,
    client: Box<dyn MinionClient>,
    reported_role: Role,
    mismatch_ticks: u32,
}

/// The session multiplexer.
pub struct Foreman {
    conn: Conn,
    factory: Arc<dyn ClientFactory>,
    minions: HashMap<String, Session>,
    counter: Counter,
}

impl Foreman {
    pub fn new(conn: &Conn, factory: Arc<dyn ClientFactory>) -> Foreman {
        Foreman {
            conn: conn.scoped(Author::Foreman),
            factory,
            minions: HashMap::new(),
            counter: Counter::new("Foreman"),
        }
    }

    /// Seed sessions and read back roles without pushing config. Called once
    /// at startup so a restarted daemon learns the fleet's current roles
    /// before assigning any.
    pub async fn init(&mut self) {
        self.update_sessions();
        for session in self.minions.values_mut() {
            match session.client.get_minion().await {
                Ok(config) => session.reported_role = pb_to_role(config.role),
                Err(err) => {
                    debug!(public_ip = %session.machine.public_ip, error = %err,
                           "minion not yet reachable");
                }
            }
        }
        if let Err(err) = self.write_minion_rows() {
            warn!(error = %err, "failed to record minion roles");
        }
    }

    /// One foreman tick: converge sessions, read roles, push configs.
    pub async fn run_once(&mut self) {
        self.counter.inc("Run");
        self.update_sessions();

        let (etcd_members, blueprint) = self.snapshot();

        for session in self.minions.values_mut() {
            match session.client.get_minion().await {
                Ok(config) => {
                    session.reported_role = pb_to_role(config.role);
                    let assigned = session.machine.role;
                    if assigned != Role::None && session.reported_role != Role::None
                        && session.reported_role != assigned
                    {
                        session.mismatch_ticks += 1;
                        warn!(public_ip = %session.machine.public_ip,
                              assigned = %assigned, reported = %session.reported_role,
                              ticks = session.mismatch_ticks, "minion role mismatch");
                    } else {
                        session.mismatch_ticks = 0;
                    }
                }
                Err(err) => {
                    debug!(public_ip = %session.machine.public_ip, error = %err,
                           "failed to read minion config");
                }
            }

            // Pushed every tick, changed or not; the minion treats it
            // idempotently.
            let config = MinionConfig {
                private_ip: session.machine.private_ip.clone(),
                role: role_to_pb(session.machine.role) as i32,
                etcd_members: etcd_members.clone(),
                blueprint: blueprint.clone(),
            };
            if let Err(err) = session.client.set_minion(config).await {
                debug!(public_ip = %session.machine.public_ip, error = %err,
                       "failed to push minion config");
            }
        }

        if let Err(err) = self.write_minion_rows() {
            warn!(error = %err, "failed to record minion roles");
        }
    }

    /// The role the minion at `public_ip` most recently reported.
    pub fn machine_role(&self, public_ip: &str) -> Role {
        self.minions
            .get(public_ip)
            .map(|s| s.reported_role)
            .unwrap_or(Role::None)
    }

    /// Public IPs of machines that kept reporting the wrong role and should
    /// be power-cycled by the cluster reconciler.
    pub fn reboot_candidates(&self) -> Vec<String> {
        self.minions
            .values()
            .filter(|s| s.mismatch_ticks >= MISMATCH_TICKS_BEFORE_REBOOT)
            .map(|s| s.machine.public_ip.clone())
            .collect()
    }

    /// Open sessions for new machines, drop sessions whose machine is gone,
    /// and refresh the machine snapshot of the rest.
    fn update_sessions(&mut self) {
        let machines = self
            .conn
            .txn(&[])
            .run(|view| {
                Ok::<_, StoreError>(view.select_from::<Machine>(|m| {
                    !m.public_ip.is_empty() && !m.cloud_id.is_empty()
                }))
            })
            .unwrap_or_default();

        let sessions = std::mem::take(&mut self.minions);
        let joined = hash_join(
            sessions.into_iter().collect::<Vec<_>>(),
            machines,
            |(ip, _): &(String, Session)| ip.clone(),
            |m: &Machine| m.public_ip.clone(),
        );

        for ((ip, mut session), machine) in joined.pairs {
            session.machine = machine;
            self.minions.insert(ip, session);
        }
        for (ip, _dropped) in joined.left {
            info!(public_ip = %ip, "closing minion session");
        }
        for machine in joined.right {
            match self.factory.new_client(&machine.public_ip) {
                Ok(client) => {
                    self.counter.inc("New Minion Client");
                    info!(public_ip = %machine.public_ip, "opened minion session");
                    self.minions.insert(
                        machine.public_ip.clone(),
                        Session {
                            machine,
                            client,
                            reported_role: Role::None,
                            mismatch_ticks: 0,
                        },
                    );
                }
                Err(err) => {
                    debug!(public_ip = %machine.public_ip, error = %err,
                           "failed to open minion session");
                }
            }
        }
    }

    /// The master set and blueprint blob pushed to every minion this tick.
    fn snapshot(&self) -> (Vec<String>, Vec<u8>) {
        self.conn
            .txn(&[])
            .run(|view| {
                let mut members: Vec<String> = view
                    .select_from::<Machine>(|m| {
                        m.role == Role::Master && !m.private_ip.is_empty() && !m.cloud_id.is_empty()
                    })
                    .into_iter()
                    .map(|m| m.private_ip)
                    .collect();
                members.sort();
                members.dedup();

                let blueprint = view
                    .all::<kelda_db::Blueprint>()
                    .into_iter()
                    .next()
                    .map(|row| row.blueprint.into_bytes())
                    .unwrap_or_default();
                Ok::<_, StoreError>((members, blueprint))
            })
            .unwrap_or_default()
    }

    /// Mirror each session's self-reported role into foreman-authored
    /// `Minion` rows.
    fn write_minion_rows(&self) -> Result<(), StoreError> {
        let reported: Vec<(String, Role)> = self
            .minions
            .values()
            .filter(|s| !s.machine.private_ip.is_empty())
            .map(|s| (s.machine.private_ip.clone(), s.reported_role))
            .collect();

        self.conn.txn(&[Table::Minion]).run(|view| {
            let existing = view.select_from::<Minion>(|m| !m.is_self);
            let joined = hash_join(
                reported,
                existing,
                |(ip, _): &(String, Role)| ip.clone(),
                |m: &Minion| m.private_ip.clone(),
            );
            for ((_, role), mut row) in joined.pairs {
                if row.role != role {
                    row.role = role;
                    view.commit(row)?;
                }
            }
            for (ip, role) in joined.left {
                let mut row = view.insert::<Minion>();
                row.private_ip = ip;
                row.role = role;
                view.commit(row)?;
            }
            for gone in joined.right {
                view.remove(&gone);
            }
            Ok(())
        })
    }
}

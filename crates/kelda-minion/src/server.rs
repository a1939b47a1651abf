//! The minion side of the configuration channel.
//!
//! `SetMinionConfig` records the foreman's intent in the local store: the
//! self row, the etcd membership, and the blueprint blob. `GetMinionConfig`
//! reports the minion's current self-view back. Both are idempotent; the
//! foreman calls them every tick.

use sha2::{Digest, Sha256};
use tonic::{Request, Response, Status};
use tracing::info;

use kelda_db::{Author, Conn, Etcd, Minion as MinionRow, StoreError, Table};
use kelda_proto::proto::minion_server::Minion;
use kelda_proto::{pb_to_role, role_to_pb, MinionConfig, Reply};

/// The gRPC service backing the minion endpoint.
pub struct MinionRpc {
    conn: Conn,
}

impl MinionRpc {
    pub fn new(conn: &Conn) -> MinionRpc {
        MinionRpc {
            conn: conn.scoped(Author::Minion),
        }
    }

    /// The tonic service for mounting on the listener.
    pub fn into_service(self) -> kelda_proto::MinionServer<MinionRpc> {
        kelda_proto::MinionServer::new(self)
    }
}

fn blueprint_id(blueprint: &[u8]) -> String {
    if blueprint.is_empty() {
        return String::new();
    }
    format!("{:x}", Sha256::digest(blueprint))
}

#[tonic::async_trait]
impl Minion for MinionRpc {
    async fn set_minion_config(
        &self,
        request: Request<MinionConfig>,
    ) -> Result<Response<Reply>, Status> {
        let config = request.into_inner();
        let role = pb_to_role(config.role);

        let result = self
            .conn
            .txn(&[Table::Minion, Table::Etcd, Table::Blueprint])
            .run(|view| {
                let mut own = match view.minion_self() {
                    Some(own) => own,
                    None => {
                        let mut row = view.insert::<MinionRow>();
                        row.is_self = true;
                        view.commit(row.clone())?;
                        row
                    }
                };
                let id = blueprint_id(&config.blueprint);
                if own.private_ip != config.private_ip
                    || own.role != role
                    || own.blueprint_id != id
                {
                    own.private_ip = config.private_ip.clone();
                    own.role = role;
                    own.blueprint_id = id;
                    view.commit(own)?;
                    info!(role = %role, "minion config updated");
                }

                let mut members = config.etcd_members.clone();
                members.sort();
                members.dedup();
                let mut etcd = match view.etcd() {
                    Some(etcd) => etcd,
                    None => view.insert::<Etcd>(),
                };
                if etcd.etcd_ips != members {
                    etcd.etcd_ips = members;
                    // The new member set wins unconditionally; leadership
                    // is etcd's problem, not ours.
                    if !etcd.etcd_ips.iter().any(|ip| *ip == etcd.leader_ip) {
                        etcd.leader_ip.clear();
                        etcd.leader = false;
                    }
                    view.commit(etcd)?;
                }

                if !config.blueprint.is_empty() {
                    let raw = String::from_utf8_lossy(&config.blueprint).into_owned();
                    let mut row = match view.all::<kelda_db::Blueprint>().into_iter().next() {
                        Some(row) => row,
                        None => view.insert::<kelda_db::Blueprint>(),
                    };
                    if row.blueprint != raw {
                        row.blueprint = raw;
                        view.commit(row)?;
                    }
                }
                Ok::<_, StoreError>(())
            });

        match result {
            Ok(()) => Ok(Response::new(Reply {})),
            Err(err) => Err(Status::internal(err.to_string())),
        }
    }

    async fn get_minion_config(
        &self,
        _request: Request<kelda_proto::Request>,
    ) -> Result<Response<MinionConfig>, Status> {
        let result = self.conn.txn(&[]).run(|view| {
            let own = view.minion_self().unwrap_or_default();
            let etcd_members = view.etcd().map(|e| e.etcd_ips).unwrap_or_default();
            let blueprint = view
                .all::<kelda_db::Blueprint>()
                .into_iter()
                .next()
                .map(|row| row.blueprint.into_bytes())
                .unwrap_or_default();
            Ok::<_, StoreError>(MinionConfig {
                private_ip: own.private_ip,
                role: role_to_pb(own.role) as i32,
                etcd_members,
                blueprint,
            })
        });

        match result {
            Ok(config) => Ok(Response::new(config)),
            Err(err) => Err(Status::internal(err.to_string())),
        }
    }
}

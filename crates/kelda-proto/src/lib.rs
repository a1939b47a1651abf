//! kelda-proto — the minion RPC surface.
//!
//! The foreman pushes a `MinionConfig` to every booted machine and reads
//! back the minion's self-view over the same channel. The channel is
//! TLS-authenticated; identity material is generated with `rcgen`.

pub mod tls;

/// Generated protobuf types and gRPC service stubs.
pub mod proto {
    tonic::include_proto!("kelda.minion");
}

pub use proto::minion_client::MinionClient;
pub use proto::minion_server::{Minion, MinionServer};
pub use proto::{MinionConfig, Reply, Request};

use kelda_db::Role;

/// Convert a store role to its wire form.
pub fn role_to_pb(role: Role) -> proto::minion_config::Role {
    match role {
        Role::None => proto::minion_config::Role::None,
        Role::Worker => proto::minion_config::Role::Worker,
        Role::Master => proto::minion_config::Role::Master,
    }
}

/// Convert a wire role to the store form. Unrecognized values degrade to
/// `None` so a speaking-newer peer doesn't wedge the control plane.
pub fn pb_to_role(role: i32) -> Role {
    match proto::minion_config::Role::try_from(role) {
        Ok(proto::minion_config::Role::Worker) => Role::Worker,
        Ok(proto::minion_config::Role::Master) => Role::Master,
        _ => Role::None,
    }
}

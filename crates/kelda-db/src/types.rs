//! Row types for every table in the store.
//!
//! A row is a plain record; identity comes from its id, which the store
//! assigns at insert and never reuses within a process. Desired-state rows
//! are written by the engine, observed-state rows by the reconciler that
//! owns the matching external system.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A row id, unique within a table for the life of the process.
pub type RowId = u64;

/// The tables the store recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Table {
    Machine,
    Minion,
    Etcd,
    Container,
    Hostname,
    LoadBalancer,
    Connection,
    Placement,
    Blueprint,
    Image,
}

impl Table {
    /// Every table, for transactions that span the whole store.
    pub fn all() -> &'static [Table] {
        &[
            Table::Machine,
            Table::Minion,
            Table::Etcd,
            Table::Container,
            Table::Hostname,
            Table::LoadBalancer,
            Table::Connection,
            Table::Placement,
            Table::Blueprint,
            Table::Image,
        ]
    }
}

/// The role a machine assumes within the cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Machines that haven't been assigned a role yet.
    #[default]
    None,
    /// Worker machines run application containers.
    Worker,
    /// Masters provide services for the workers.
    Master,
}

impl Role {
    /// Parse the string form used in blueprints and on the wire.
    pub fn parse(s: &str) -> Result<Role, UnknownRole> {
        match s {
            "Master" => Ok(Role::Master),
            "Worker" => Ok(Role::Worker),
            "" => Ok(Role::None),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::None => write!(f, ""),
            Role::Worker => write!(f, "Worker"),
            Role::Master => write!(f, "Master"),
        }
    }
}

/// Error for a role string that is neither empty, `Worker`, nor `Master`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

/// One of the supported cloud providers. The strings must exactly match the
/// names used in blueprints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProviderName {
    #[default]
    Amazon,
    Google,
    DigitalOcean,
    Vagrant,
}

impl ProviderName {
    /// All providers Kelda supports.
    pub fn all() -> &'static [ProviderName] {
        &[
            ProviderName::Amazon,
            ProviderName::Google,
            ProviderName::DigitalOcean,
            ProviderName::Vagrant,
        ]
    }

    pub fn parse(s: &str) -> Result<ProviderName, UnknownProvider> {
        match s {
            "Amazon" => Ok(ProviderName::Amazon),
            "Google" => Ok(ProviderName::Google),
            "DigitalOcean" => Ok(ProviderName::DigitalOcean),
            "Vagrant" => Ok(ProviderName::Vagrant),
            other => Err(UnknownProvider(other.to_string())),
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderName::Amazon => write!(f, "Amazon"),
            ProviderName::Google => write!(f, "Google"),
            ProviderName::DigitalOcean => write!(f, "DigitalOcean"),
            ProviderName::Vagrant => write!(f, "Vagrant"),
        }
    }
}

/// Error for an unrecognized provider name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown provider: {0}")]
pub struct UnknownProvider(pub String);

/// A virtual machine, desired (no cloud id yet) or observed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub id: RowId,
    pub cloud_id: String,
    pub provider: ProviderName,
    pub region: String,
    pub role: Role,
    pub size: String,
    pub disk_size: u32,
    pub preemptible: bool,
    pub public_ip: String,
    pub private_ip: String,
    pub floating_ip: String,
    pub status: String,
}

/// A per-host self-view row, written on the minion side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Minion {
    pub id: RowId,
    /// True on exactly the row describing this host.
    pub is_self: bool,
    pub private_ip: String,
    pub role: Role,
    pub blueprint_id: String,
}

/// The etcd singleton: membership and leadership as currently known.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Etcd {
    pub id: RowId,
    /// Sorted private IPs of the master machines.
    pub etcd_ips: Vec<String>,
    pub leader_ip: String,
    /// True when this host is the etcd leader.
    pub leader: bool,
}

/// An application container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: RowId,
    pub ip: String,
    pub hostname: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub filepath_to_content: BTreeMap<String, String>,
    /// Private IP of the worker this container is scheduled on, or empty.
    pub minion: String,
    pub status: String,
}

/// A hostname to IP mapping entry. Hostnames are unique.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hostname {
    pub id: RowId,
    pub hostname: String,
    pub ip: String,
}

/// A load balancer fronting a set of container hostnames.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub id: RowId,
    pub name: String,
    pub ip: String,
    pub hostnames: BTreeSet<String>,
}

/// A connection policy: the `from` set may open `min_port..=max_port` to the
/// `to` set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: RowId,
    pub from: BTreeSet<String>,
    pub to: BTreeSet<String>,
    pub min_port: u16,
    pub max_port: u16,
}

/// Placement constraints for a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub id: RowId,
    pub target_container: String,
    pub exclusive: bool,
    pub provider: String,
    pub region: String,
    pub size: String,
    pub floating_ip: String,
    pub preemptible: bool,
}

/// The compiled blueprint blob currently being enforced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    pub id: RowId,
    pub blueprint: String,
    pub namespace: String,
}

/// A user-built image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: RowId,
    pub name: String,
    pub dockerfile: String,
    pub docker_id: String,
    pub status: String,
}

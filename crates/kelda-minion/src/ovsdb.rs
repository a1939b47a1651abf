//! The OVSDB client contract.
//!
//! The network master loop drives OVN exclusively through this trait; the
//! real client speaks the OVSDB protocol to the local northbound database,
//! tests use a recording fake.

use std::collections::BTreeMap;

use async_trait::async_trait;

/// A logical switch port. OVN represents plain network interfaces with an
/// empty `port_type`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwitchPort {
    pub name: String,
    pub port_type: String,
    pub addresses: Vec<String>,
    pub options: BTreeMap<String, String>,
}

/// A logical router port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterPort {
    pub name: String,
    pub mac: String,
    pub networks: Vec<String>,
}

/// A load balancer: one virtual IP fronting a pool of container IPs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LoadBalancerVip {
    pub name: String,
    pub vip: String,
    pub ips: Vec<String>,
}

/// One allowed flow, as installed into OVN's ACL table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AclRule {
    pub from_ip: String,
    pub to_ip: String,
    pub min_port: u16,
    pub max_port: u16,
}

#[async_trait]
pub trait OvsdbClient: Send + Sync {
    async fn logical_switch_exists(&self, name: &str) -> anyhow::Result<bool>;
    async fn create_logical_switch(&self, name: &str) -> anyhow::Result<()>;
    async fn list_switch_ports(&self) -> anyhow::Result<Vec<SwitchPort>>;
    async fn create_switch_port(&self, switch: &str, port: SwitchPort) -> anyhow::Result<()>;
    async fn delete_switch_port(&self, switch: &str, port: SwitchPort) -> anyhow::Result<()>;

    async fn logical_router_exists(&self, name: &str) -> anyhow::Result<bool>;
    async fn create_logical_router(&self, name: &str) -> anyhow::Result<()>;
    async fn list_router_ports(&self) -> anyhow::Result<Vec<RouterPort>>;
    async fn create_router_port(&self, router: &str, port: RouterPort) -> anyhow::Result<()>;
    async fn delete_router_port(&self, router: &str, port: RouterPort) -> anyhow::Result<()>;

    async fn list_load_balancers(&self) -> anyhow::Result<Vec<LoadBalancerVip>>;
    async fn create_load_balancer(&self, switch: &str, lb: LoadBalancerVip)
        -> anyhow::Result<()>;
    async fn delete_load_balancer(&self, switch: &str, lb: LoadBalancerVip)
        -> anyhow::Result<()>;

    async fn list_acls(&self) -> anyhow::Result<Vec<AclRule>>;
    async fn create_acl(&self, switch: &str, acl: AclRule) -> anyhow::Result<()>;
    async fn delete_acl(&self, switch: &str, acl: AclRule) -> anyhow::Result<()>;
}

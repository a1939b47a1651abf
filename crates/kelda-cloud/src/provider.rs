//! The uniform contract every cloud driver implements.
//!
//! Drivers (EC2, GCE, DigitalOcean, Vagrant) live outside the core; the
//! reconciler only sees this trait. Providers partition the machine table
//! by `(Provider, Region)`, and each partition gets its own reconciler.

use async_trait::async_trait;

use kelda_db::{Machine, ProviderName};

/// An inbound allowance for the namespace, before protocol expansion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Acl {
    pub cidr_ip: String,
    pub min_port: i32,
    pub max_port: i32,
}

/// Protocols a security rule may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

/// One provider-level security rule. ICMP rules use the `-1..-1` sentinel
/// port range.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecurityRule {
    pub cidr_ip: String,
    pub protocol: Protocol,
    pub min_port: i32,
    pub max_port: i32,
}

/// Expand each allowance into the concrete rules a driver installs: one tcp
/// and one udp rule over the port range, and one icmp rule.
pub fn expand_acls(acls: &[Acl]) -> Vec<SecurityRule> {
    let mut rules = Vec::with_capacity(acls.len() * 3);
    for acl in acls {
        rules.push(SecurityRule {
            cidr_ip: acl.cidr_ip.clone(),
            protocol: Protocol::Tcp,
            min_port: acl.min_port,
            max_port: acl.max_port,
        });
        rules.push(SecurityRule {
            cidr_ip: acl.cidr_ip.clone(),
            protocol: Protocol::Udp,
            min_port: acl.min_port,
            max_port: acl.max_port,
        });
        rules.push(SecurityRule {
            cidr_ip: acl.cidr_ip.clone(),
            protocol: Protocol::Icmp,
            min_port: -1,
            max_port: -1,
        });
    }
    rules
}

/// A `Boot` that started some machines and then failed. `booted` holds the
/// cloud ids that did come up, in creation order.
#[derive(Debug, thiserror::Error)]
#[error("boot failed after {} machines: {source}", booted.len())]
pub struct BootError {
    pub booted: Vec<String>,
    #[source]
    pub source: anyhow::Error,
}

/// One cloud driver bound to a namespace and region.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Every machine belonging to this namespace in this region. Stable
    /// between changes.
    async fn list(&self) -> anyhow::Result<Vec<Machine>>;

    /// Start machines matching the given specs. Returns cloud ids in
    /// creation order; may report partial success through `BootError`.
    async fn boot(&self, machines: Vec<Machine>) -> Result<Vec<String>, BootError>;

    /// Terminate by cloud id. Missing ids are not an error.
    async fn stop(&self, machines: Vec<Machine>) -> anyhow::Result<()>;

    /// Reconcile each machine's floating IP to the desired value.
    async fn update_floating_ips(&self, machines: Vec<Machine>) -> anyhow::Result<()>;

    /// Replace the namespace's inbound rules with the given set.
    async fn set_acls(&self, acls: Vec<Acl>) -> anyhow::Result<()>;

    /// Remove provider-side resources owned by this namespace. Idempotent.
    async fn cleanup(&self) -> anyhow::Result<()>;
}

/// Constructs the driver for one `(Provider, Region)` partition. The daemon
/// supplies the real drivers; tests supply recording fakes.
pub trait ProviderFactory: Send + Sync {
    fn provider(
        &self,
        name: ProviderName,
        region: &str,
        namespace: &str,
    ) -> anyhow::Result<std::sync::Arc<dyn Provider>>;
}

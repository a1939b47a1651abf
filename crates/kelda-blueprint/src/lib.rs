//! kelda-blueprint — the compiled blueprint document.
//!
//! The blueprint compiler (out of scope) emits a JSON document describing
//! the deployment's intent. This crate holds the serde model of that
//! document, validates it, and derives the stable natural key each element
//! is diffed by. Field names keep the compiler's casing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use kelda_db::{ProviderName, Role};

/// Blueprint parsing and validation errors. These are user-input errors:
/// reported once, and the engine leaves the store untouched.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed blueprint: {0}")]
    Json(#[from] serde_json::Error),

    #[error("machine {index}: {source}")]
    BadProvider {
        index: usize,
        source: kelda_db::UnknownProvider,
    },

    #[error("machine {index}: {source}")]
    BadRole {
        index: usize,
        source: kelda_db::UnknownRole,
    },

    #[error("connection from {from:?} to {to:?}: min port {min} exceeds max port {max}")]
    BadPortRange {
        from: Vec<String>,
        to: Vec<String>,
        min: u16,
        max: u16,
    },

    #[error("hostname {0} is declared twice")]
    DuplicateHostname(String),
}

/// The compiled blueprint document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Blueprint {
    #[serde(rename = "Namespace")]
    pub namespace: String,
    #[serde(rename = "Machines")]
    pub machines: Vec<Machine>,
    #[serde(rename = "Containers")]
    pub containers: Vec<Container>,
    #[serde(rename = "Hostnames")]
    pub hostnames: Vec<Hostname>,
    #[serde(rename = "LoadBalancers")]
    pub load_balancers: Vec<LoadBalancer>,
    #[serde(rename = "Connections")]
    pub connections: Vec<Connection>,
    #[serde(rename = "Placements")]
    pub placements: Vec<Placement>,
    #[serde(rename = "AdminACL")]
    pub admin_acl: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Machine {
    #[serde(rename = "Provider")]
    pub provider: String,
    #[serde(rename = "Region")]
    pub region: String,
    #[serde(rename = "Size")]
    pub size: String,
    #[serde(rename = "DiskSize")]
    pub disk_size: u32,
    #[serde(rename = "Preemptible")]
    pub preemptible: bool,
    #[serde(rename = "Role")]
    pub role: String,
    #[serde(rename = "FloatingIP")]
    pub floating_ip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Container {
    #[serde(rename = "Hostname")]
    pub hostname: String,
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "Command")]
    pub command: Vec<String>,
    #[serde(rename = "Env")]
    pub env: BTreeMap<String, String>,
    #[serde(rename = "FilepathToContent")]
    pub filepath_to_content: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hostname {
    #[serde(rename = "Hostname")]
    pub hostname: String,
    #[serde(rename = "IP")]
    pub ip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancer {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Hostnames")]
    pub hostnames: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Connection {
    #[serde(rename = "From")]
    pub from: Vec<String>,
    #[serde(rename = "To")]
    pub to: Vec<String>,
    #[serde(rename = "MinPort")]
    pub min_port: u16,
    #[serde(rename = "MaxPort")]
    pub max_port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Placement {
    #[serde(rename = "TargetContainer")]
    pub target_container: String,
    #[serde(rename = "Exclusive")]
    pub exclusive: bool,
    #[serde(rename = "Provider")]
    pub provider: String,
    #[serde(rename = "Region")]
    pub region: String,
    #[serde(rename = "Size")]
    pub size: String,
    #[serde(rename = "FloatingIP")]
    pub floating_ip: String,
    #[serde(rename = "Preemptible")]
    pub preemptible: bool,
}

impl Blueprint {
    /// Parse and validate a compiled blueprint.
    pub fn from_json(raw: &str) -> Result<Blueprint, ParseError> {
        let bp: Blueprint = serde_json::from_str(raw)?;
        bp.validate()?;
        Ok(bp)
    }

    fn validate(&self) -> Result<(), ParseError> {
        for (index, m) in self.machines.iter().enumerate() {
            ProviderName::parse(&m.provider)
                .map_err(|source| ParseError::BadProvider { index, source })?;
            Role::parse(&m.role).map_err(|source| ParseError::BadRole { index, source })?;
        }
        for c in &self.connections {
            if c.min_port > c.max_port {
                return Err(ParseError::BadPortRange {
                    from: c.from.clone(),
                    to: c.to.clone(),
                    min: c.min_port,
                    max: c.max_port,
                });
            }
        }
        // Hostnames must be unique within their section; the compiler
        // mirrors container hostnames into the Hostnames section, so the
        // two sections legitimately overlap.
        for section in [
            self.hostnames.iter().map(|h| &h.hostname).collect::<Vec<_>>(),
            self.containers.iter().map(|c| &c.hostname).collect(),
        ] {
            let mut seen = std::collections::HashSet::new();
            for h in section {
                if !h.is_empty() && !seen.insert(h.clone()) {
                    return Err(ParseError::DuplicateHostname(h.clone()));
                }
            }
        }
        Ok(())
    }

    /// The number of machines the blueprint declares as masters; the role
    /// assignment target.
    pub fn master_count(&self) -> usize {
        self.machines.iter().filter(|m| m.role == "Master").count()
    }
}

/// The stable natural key of one blueprint element: a digest of its
/// canonical JSON form. Identical declarations always produce the same key.
pub fn natural_key<T: Serialize>(element: &T) -> String {
    let canonical = serde_json::to_string(element).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{digest:x}")
}

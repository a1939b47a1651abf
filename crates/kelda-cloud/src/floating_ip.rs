//! Floating IP reconciliation planning.
//!
//! Drivers share this logic: given the machines' desired floating IPs and
//! the region's reserved addresses with their current attachments, compute
//! the minimal disassociate/associate sequence. Disassociating an address
//! that isn't attached is a no-op; asking for an address the region never
//! reserved is an error naming the IP and region.

use thiserror::Error;

use kelda_db::Machine;

/// A reserved address in the region and the machine it is attached to, if
/// any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    pub floating_ip: String,
    /// Cloud id of the attached machine, or empty when unattached.
    pub cloud_id: String,
}

/// One step of a floating IP reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpAction {
    Associate { floating_ip: String, cloud_id: String },
    Disassociate { floating_ip: String, cloud_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("floating IP {ip} is not reserved in {region}")]
pub struct UnreservedIp {
    pub ip: String,
    pub region: String,
}

/// Plan the actions bringing `reserved` in line with the machines' desired
/// floating IPs.
pub fn plan(
    machines: &[Machine],
    reserved: &[Association],
    region: &str,
) -> Result<Vec<IpAction>, UnreservedIp> {
    let mut actions = Vec::new();
    for machine in machines {
        if machine.cloud_id.is_empty() {
            continue;
        }
        let attached = reserved
            .iter()
            .find(|a| a.cloud_id == machine.cloud_id)
            .map(|a| a.floating_ip.clone());

        if machine.floating_ip.is_empty() {
            if let Some(ip) = attached {
                actions.push(IpAction::Disassociate {
                    floating_ip: ip,
                    cloud_id: machine.cloud_id.clone(),
                });
            }
            continue;
        }

        if attached.as_deref() == Some(machine.floating_ip.as_str()) {
            continue;
        }

        let target = reserved
            .iter()
            .find(|a| a.floating_ip == machine.floating_ip)
            .ok_or_else(|| UnreservedIp {
                ip: machine.floating_ip.clone(),
                region: region.to_string(),
            })?;

        // Free the address's current holder, and this machine's current
        // address, before attaching.
        if !target.cloud_id.is_empty() {
            actions.push(IpAction::Disassociate {
                floating_ip: target.floating_ip.clone(),
                cloud_id: target.cloud_id.clone(),
            });
        }
        if let Some(ip) = attached {
            actions.push(IpAction::Disassociate {
                floating_ip: ip,
                cloud_id: machine.cloud_id.clone(),
            });
        }
        actions.push(IpAction::Associate {
            floating_ip: machine.floating_ip.clone(),
            cloud_id: machine.cloud_id.clone(),
        });
    }
    Ok(actions)
}

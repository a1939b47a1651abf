//! Network constants and address derivation for the container dataplane.

use std::net::Ipv4Addr;

/// The OVS bridge every container attaches to.
pub const BRIDGE: &str = "kelda";

/// The logical switch port packets for unknown destinations land on.
pub const LOCAL_PORT: &str = "local";

/// The container subnet, in CIDR notation.
pub const SUBNET: &str = "10.0.0.0/8";

/// The gateway address on the bridge.
pub const GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

/// Derive the deterministic MAC for an address: a locally-administered
/// prefix followed by the four address octets.
pub fn ip_to_mac(ip: Ipv4Addr) -> String {
    let [a, b, c, d] = ip.octets();
    format!("02:00:{a:02x}:{b:02x}:{c:02x}:{d:02x}")
}

/// `ip_to_mac` over a textual address; unparsable input yields an empty
/// string so the caller's reconcile simply skips the port.
pub fn ip_str_to_mac(ip: &str) -> String {
    ip.parse::<Ipv4Addr>().map(ip_to_mac).unwrap_or_default()
}

/// The MAC of the load balancer router port.
pub fn load_balancer_mac() -> String {
    ip_to_mac(GATEWAY_IP)
}

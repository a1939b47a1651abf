//! The network master loop.
//!
//! Runs only on the etcd leader. Each tick snapshots containers, load
//! balancers, connections, and the hostname map, then reconciles the OVN
//! logical switch, the load balancer router, the load balancer pools, and
//! the ACLs against that snapshot. OVSDB errors are logged and retried next
//! tick; there is no partial rollback.

use std::collections::HashMap;

use tokio::sync::watch;
use tracing::{error, info, warn};

use kelda_counter::{Counter, EventTimer};
use kelda_db::{Connection, Conn, Container, LoadBalancer, StoreError, Table};
use kelda_join::hash_join;

use crate::ipdef;
use crate::ovsdb::{AclRule, LoadBalancerVip, OvsdbClient, RouterPort, SwitchPort};

const SWITCH: &str = "kelda";
const LOAD_BALANCER_ROUTER: &str = "loadBalancerRouter";
const LOAD_BALANCER_SWITCH_PORT: &str = "loadBalancerSwitchPort";
const LOAD_BALANCER_ROUTER_PORT: &str = "loadBalancerRouterPort";

/// Run the network master loop until `shutdown` flips.
pub async fn run(conn: Conn, client: std::sync::Arc<dyn OvsdbClient>, mut shutdown: watch::Receiver<bool>) {
    let counter = Counter::new("Network");
    let mut trigger = conn.trigger_tick(
        30,
        &[
            Table::Container,
            Table::Hostname,
            Table::Connection,
            Table::LoadBalancer,
            Table::Etcd,
        ],
    );
    let mut timer = EventTimer::new("Network");
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            fire = trigger.c.recv() => {
                if fire.is_none() {
                    return;
                }
            }
        }
        if !conn.etcd_leader() {
            continue;
        }
        timer.log_start();
        run_master(&conn, client.as_ref(), &counter).await;
        timer.log_end();
    }
}

/// One pass of the leader's OVN reconciliation.
pub async fn run_master(conn: &Conn, client: &dyn OvsdbClient, counter: &Counter) {
    counter.inc("Run Master");

    let snapshot = conn.txn(&[]).run(|view| {
        let load_balancers = view.select_from::<LoadBalancer>(|lb| !lb.ip.is_empty());
        let containers = view.select_from::<Container>(|c| !c.ip.is_empty());
        let connections = view.all::<Connection>();
        let hostname_to_ip = view.hostname_mappings();
        Ok::<_, StoreError>((load_balancers, containers, connections, hostname_to_ip))
    });
    let (load_balancers, containers, connections, hostname_to_ip) = match snapshot {
        Ok(snapshot) => snapshot,
        Err(err) => {
            error!(error = %err, "failed to snapshot network tables");
            return;
        }
    };

    update_logical_switch(client, &containers).await;
    update_load_balancer_router(client).await;
    update_load_balancers(client, &load_balancers, &hostname_to_ip).await;
    update_acls(client, &connections, &load_balancers, &hostname_to_ip).await;
}

/// The switch ports the snapshot calls for: one per container IP, the
/// local port, and the router attachment for load balancing.
fn expected_switch_ports(containers: &[Container]) -> Vec<SwitchPort> {
    let mut ports = vec![
        SwitchPort {
            name: LOAD_BALANCER_SWITCH_PORT.to_string(),
            port_type: "router".to_string(),
            options: [(
                "router-port".to_string(),
                LOAD_BALANCER_ROUTER_PORT.to_string(),
            )]
            .into_iter()
            .collect(),
            ..SwitchPort::default()
        },
        // A switch delivers packets with unmatched destinations to ports
        // with an "unknown" address; DNS and public traffic leave OVN
        // through the local port this way.
        SwitchPort {
            name: ipdef::LOCAL_PORT.to_string(),
            port_type: "localport".to_string(),
            addresses: vec!["unknown".to_string()],
            ..SwitchPort::default()
        },
    ];
    for container in containers {
        ports.push(SwitchPort {
            name: container.ip.clone(),
            port_type: String::new(),
            addresses: vec![format!(
                "{} {}",
                ipdef::ip_str_to_mac(&container.ip),
                container.ip
            )],
            ..SwitchPort::default()
        });
    }
    ports
}

async fn update_logical_switch(client: &dyn OvsdbClient, containers: &[Container]) {
    match client.logical_switch_exists(SWITCH).await {
        Ok(true) => {}
        Ok(false) => {
            if let Err(err) = client.create_logical_switch(SWITCH).await {
                error!(error = %err, "failed to create logical switch");
                return;
            }
        }
        Err(err) => {
            error!(error = %err, "failed to check existence of logical switch");
            return;
        }
    }

    let current = match client.list_switch_ports().await {
        Ok(ports) => ports,
        Err(err) => {
            error!(error = %err, "failed to list switch ports");
            return;
        }
    };

    let joined = hash_join(
        expected_switch_ports(containers),
        current,
        |p: &SwitchPort| p.name.clone(),
        |p: &SwitchPort| p.name.clone(),
    );
    for port in joined.left {
        let name = port.name.clone();
        match client.create_switch_port(SWITCH, port).await {
            Ok(()) => info!(%name, "new logical switch port"),
            Err(err) => warn!(%name, error = %err, "failed to create switch port"),
        }
    }
    for port in joined.right {
        let name = port.name.clone();
        match client.delete_switch_port(SWITCH, port).await {
            Ok(()) => info!(%name, "delete logical switch port"),
            Err(err) => warn!(%name, error = %err, "failed to delete switch port"),
        }
    }
}

async fn update_load_balancer_router(client: &dyn OvsdbClient) {
    match client.logical_router_exists(LOAD_BALANCER_ROUTER).await {
        Ok(true) => {}
        Ok(false) => {
            if let Err(err) = client.create_logical_router(LOAD_BALANCER_ROUTER).await {
                error!(error = %err, "failed to create load balancer router");
                return;
            }
        }
        Err(err) => {
            error!(error = %err, "failed to check existence of load balancer router");
            return;
        }
    }

    let current = match client.list_router_ports().await {
        Ok(ports) => ports,
        Err(err) => {
            error!(error = %err, "failed to list router ports");
            return;
        }
    };

    let expected = vec![RouterPort {
        name: LOAD_BALANCER_ROUTER_PORT.to_string(),
        mac: ipdef::load_balancer_mac(),
        networks: vec![ipdef::SUBNET.to_string()],
    }];
    let joined = hash_join(
        expected,
        current,
        |p: &RouterPort| p.name.clone(),
        |p: &RouterPort| p.name.clone(),
    );
    for port in joined.left {
        let name = port.name.clone();
        match client.create_router_port(LOAD_BALANCER_ROUTER, port).await {
            Ok(()) => info!(%name, "new logical router port"),
            Err(err) => warn!(%name, error = %err, "failed to create router port"),
        }
    }
    for port in joined.right {
        let name = port.name.clone();
        match client.delete_router_port(LOAD_BALANCER_ROUTER, port).await {
            Ok(()) => info!(%name, "delete logical router port"),
            Err(err) => warn!(%name, error = %err, "failed to delete router port"),
        }
    }
}

/// The pools the snapshot calls for: each load balancer's IP fronting its
/// member hostnames' IPs.
fn expected_load_balancers(
    load_balancers: &[LoadBalancer],
    hostname_to_ip: &HashMap<String, String>,
) -> Vec<LoadBalancerVip> {
    load_balancers
        .iter()
        .map(|lb| {
            let mut ips: Vec<String> = lb
                .hostnames
                .iter()
                .filter_map(|h| hostname_to_ip.get(h).cloned())
                .collect();
            ips.sort();
            LoadBalancerVip {
                name: lb.name.clone(),
                vip: lb.ip.clone(),
                ips,
            }
        })
        .collect()
}

async fn update_load_balancers(
    client: &dyn OvsdbClient,
    load_balancers: &[LoadBalancer],
    hostname_to_ip: &HashMap<String, String>,
) {
    let current = match client.list_load_balancers().await {
        Ok(lbs) => lbs,
        Err(err) => {
            error!(error = %err, "failed to list load balancers");
            return;
        }
    };

    // Pool membership changes are handled as delete-and-recreate, so the
    // join key covers the whole record.
    let joined = hash_join(
        expected_load_balancers(load_balancers, hostname_to_ip),
        current,
        |lb: &LoadBalancerVip| lb.clone(),
        |lb: &LoadBalancerVip| lb.clone(),
    );
    for lb in joined.left {
        let name = lb.name.clone();
        match client.create_load_balancer(SWITCH, lb).await {
            Ok(()) => info!(%name, "new load balancer"),
            Err(err) => warn!(%name, error = %err, "failed to create load balancer"),
        }
    }
    for lb in joined.right {
        let name = lb.name.clone();
        match client.delete_load_balancer(SWITCH, lb).await {
            Ok(()) => info!(%name, "delete load balancer"),
            Err(err) => warn!(%name, error = %err, "failed to delete load balancer"),
        }
    }
}

/// Expand connections into `(from IP, to IP, port range)` tuples through
/// the hostname map. Load balancer names resolve to the balancer's own IP.
fn expected_acls(
    connections: &[Connection],
    load_balancers: &[LoadBalancer],
    hostname_to_ip: &HashMap<String, String>,
) -> Vec<AclRule> {
    let mut lookup: HashMap<&str, &str> = hostname_to_ip
        .iter()
        .map(|(host, ip)| (host.as_str(), ip.as_str()))
        .collect();
    for lb in load_balancers {
        lookup.insert(lb.name.as_str(), lb.ip.as_str());
    }

    let mut rules = Vec::new();
    for connection in connections {
        let from_ips: Vec<&str> = connection
            .from
            .iter()
            .filter_map(|h| lookup.get(h.as_str()).copied())
            .collect();
        let to_ips: Vec<&str> = connection
            .to
            .iter()
            .filter_map(|h| lookup.get(h.as_str()).copied())
            .collect();
        for from_ip in &from_ips {
            for to_ip in &to_ips {
                rules.push(AclRule {
                    from_ip: from_ip.to_string(),
                    to_ip: to_ip.to_string(),
                    min_port: connection.min_port,
                    max_port: connection.max_port,
                });
            }
        }
    }
    rules.sort();
    rules.dedup();
    rules
}

async fn update_acls(
    client: &dyn OvsdbClient,
    connections: &[Connection],
    load_balancers: &[LoadBalancer],
    hostname_to_ip: &HashMap<String, String>,
) {
    let current = match client.list_acls().await {
        Ok(acls) => acls,
        Err(err) => {
            error!(error = %err, "failed to list ACLs");
            return;
        }
    };

    let joined = hash_join(
        expected_acls(connections, load_balancers, hostname_to_ip),
        current,
        |a: &AclRule| a.clone(),
        |a: &AclRule| a.clone(),
    );
    for acl in joined.left {
        if let Err(err) = client.create_acl(SWITCH, acl.clone()).await {
            warn!(?acl, error = %err, "failed to create ACL");
        }
    }
    for acl in joined.right {
        if let Err(err) = client.delete_acl(SWITCH, acl.clone()).await {
            warn!(?acl, error = %err, "failed to delete ACL");
        }
    }
}

//! The per-host supervisor.
//!
//! Keeps the host's infrastructure containers (OVS, etcd, OVN, kubelet,
//! registry) converged with what the local `Minion` and `Etcd` rows call
//! for, brings up the OVS bridge on worker startup, and keeps the OVN
//! external-ids flap-free by only writing them when a value differs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{info, warn};

use kelda_counter::{Counter, EventTimer};
use kelda_db::{Conn, Etcd, Minion, Role, Table};
use kelda_join::hash_join;

use crate::docker::{ContainerRuntime, DockerError, Mount, RunOptions};
use crate::ipdef;

// Friendly container names, usable with `docker logs`.
pub const ETCD_NAME: &str = "etcd";
pub const OVNCONTROLLER_NAME: &str = "ovn-controller";
pub const OVNNORTHD_NAME: &str = "ovn-northd";
pub const OVSDB_NAME: &str = "ovsdb-server";
pub const OVSVSWITCHD_NAME: &str = "ovs-vswitchd";
pub const REGISTRY_NAME: &str = "registry";
pub const KUBELET_NAME: &str = "kubelet";

const OVS_IMAGE: &str = "keldaio/ovs";
const ETCD_IMAGE: &str = "quay.io/coreos/etcd:v3.3";
const REGISTRY_IMAGE: &str = "registry:2.6.2";
const KUBE_IMAGE: &str = "keldaio/kube";

// The tunneling protocol between machines. "stt" and "geneve" are
// supported.
const TUNNELING_PROTOCOL: &str = "stt";

const ETCD_HEARTBEAT_INTERVAL: &str = "500";
const ETCD_ELECTION_TIMEOUT: &str = "5000";

const TLS_DIR: &str = "/var/lib/kelda/tls";

/// Runs host commands. Injected so tests observe them instead of the host.
#[async_trait]
pub trait ExecRunner: Send + Sync {
    /// Run a program to completion, returning its stdout.
    async fn run(&self, program: &str, args: &[String]) -> anyhow::Result<String>;
}

fn node_name(ip: &str) -> String {
    format!("master-{ip}")
}

fn initial_cluster_string(etcd_ips: &[String]) -> String {
    etcd_ips
        .iter()
        .map(|ip| format!("{}=http://{ip}:2380", node_name(ip)))
        .collect::<Vec<_>>()
        .join(",")
}

fn ovs_container(name: &str, arg: &str) -> RunOptions {
    RunOptions {
        name: name.to_string(),
        image: OVS_IMAGE.to_string(),
        args: vec![arg.to_string()],
        volumes_from: vec!["minion".to_string()],
        privileged: name == OVSVSWITCHD_NAME,
        ..RunOptions::default()
    }
}

/// Run etcd with a data directory mounted on the host disk, so a restarted
/// container finds its previous state.
fn etcd_container(args: Vec<String>) -> RunOptions {
    let mut env = BTreeMap::new();
    env.insert("ETCD_DATA_DIR".to_string(), "/etcd-data".to_string());
    RunOptions {
        name: ETCD_NAME.to_string(),
        image: ETCD_IMAGE.to_string(),
        args,
        env,
        network_mode: "host".to_string(),
        volumes_from: vec!["minion".to_string()],
        mounts: vec![Mount {
            source: "/var/lib/etcd".to_string(),
            target: "/etcd-data".to_string(),
            shared: false,
        }],
        ..RunOptions::default()
    }
}

fn kubeconfig(leader_ip: &str) -> String {
    format!(
        "apiVersion: v1\n\
         kind: Config\n\
         clusters:\n\
         - cluster:\n\
             server: https://{leader_ip}:6443\n\
             certificate-authority: {TLS_DIR}/ca.crt\n\
           name: kelda\n\
         contexts:\n\
         - context:\n\
             cluster: kelda\n\
             user: kelda\n\
           name: kelda\n\
         current-context: kelda\n\
         users:\n\
         - name: kelda\n\
           user:\n\
             client-certificate: {TLS_DIR}/kelda.crt\n\
             client-key: {TLS_DIR}/kelda.key\n"
    )
}

fn kubelet_args(my_ip: &str) -> Vec<String> {
    [
        "kubelet",
        "--pod-cidr=10.0.0.0/24",
        "--network-plugin=cni",
        "--make-iptables-util-chains=false",
        "--kubeconfig=/var/lib/kubelet/kubeconfig",
        "--hostname-override",
        my_ip,
        "--anonymous-auth=false",
        "--client-ca-file",
        &format!("{TLS_DIR}/ca.crt"),
        "--tls-cert-file",
        &format!("{TLS_DIR}/kelda.crt"),
        "--tls-private-key-file",
        &format!("{TLS_DIR}/kelda.key"),
        "--allow-privileged",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn kubelet_container(my_ip: &str, leader_ip: &str) -> RunOptions {
    let mut files = BTreeMap::new();
    files.insert(
        "/var/lib/kubelet/kubeconfig".to_string(),
        kubeconfig(leader_ip),
    );
    RunOptions {
        name: KUBELET_NAME.to_string(),
        image: KUBE_IMAGE.to_string(),
        args: kubelet_args(my_ip),
        filepath_to_content: files,
        pid_mode: "host".to_string(),
        privileged: true,
        volumes_from: vec!["minion".to_string()],
        mounts: vec![
            Mount {
                source: "/dev".to_string(),
                target: "/dev".to_string(),
                shared: false,
            },
            Mount {
                source: "/sys".to_string(),
                target: "/sys".to_string(),
                shared: false,
            },
            Mount {
                source: "/var/run".to_string(),
                target: "/var/run".to_string(),
                shared: false,
            },
            Mount {
                source: "/var/lib/docker".to_string(),
                target: "/var/lib/docker".to_string(),
                shared: false,
            },
            // The kubelet creates mounts under its own directory (e.g.
            // tmpfs for secret volumes); they must propagate to other
            // containers.
            Mount {
                source: "/var/lib/kubelet".to_string(),
                target: "/var/lib/kubelet".to_string(),
                shared: true,
            },
            Mount {
                source: TLS_DIR.to_string(),
                target: TLS_DIR.to_string(),
                shared: false,
            },
        ],
        ..RunOptions::default()
    }
}

/// The infrastructure containers this host should be running.
pub fn desired_containers(minion: &Minion, etcd: Option<&Etcd>) -> Vec<RunOptions> {
    let mut desired = vec![
        ovs_container(OVSDB_NAME, "ovsdb-server"),
        ovs_container(OVSVSWITCHD_NAME, "ovs-vswitchd"),
    ];

    let etcd_ips = etcd.map(|e| e.etcd_ips.as_slice()).unwrap_or_default();
    let leader_ip = etcd.map(|e| e.leader_ip.as_str()).unwrap_or_default();

    match minion.role {
        Role::Master => {
            if !etcd_ips.is_empty() {
                desired.push(etcd_container(vec![
                    format!("--name={}", node_name(&minion.private_ip)),
                    format!("--initial-cluster={}", initial_cluster_string(etcd_ips)),
                    format!(
                        "--advertise-client-urls=http://{}:2379",
                        minion.private_ip
                    ),
                    format!(
                        "--initial-advertise-peer-urls=http://{}:2380",
                        minion.private_ip
                    ),
                    "--listen-client-urls=http://0.0.0.0:2379".to_string(),
                    "--listen-peer-urls=http://0.0.0.0:2380".to_string(),
                    format!("--heartbeat-interval={ETCD_HEARTBEAT_INTERVAL}"),
                    format!("--election-timeout={ETCD_ELECTION_TIMEOUT}"),
                ]));
            }
            desired.push(ovs_container(OVNNORTHD_NAME, "ovn-northd"));
            desired.push(RunOptions {
                name: REGISTRY_NAME.to_string(),
                image: REGISTRY_IMAGE.to_string(),
                network_mode: "host".to_string(),
                ..RunOptions::default()
            });
        }
        Role::Worker | Role::None => {
            if !etcd_ips.is_empty() {
                desired.push(etcd_container(vec![
                    format!("--initial-cluster={}", initial_cluster_string(etcd_ips)),
                    format!("--heartbeat-interval={ETCD_HEARTBEAT_INTERVAL}"),
                    format!("--election-timeout={ETCD_ELECTION_TIMEOUT}"),
                    "--proxy=on".to_string(),
                ]));
            }
            if !minion.private_ip.is_empty() && !leader_ip.is_empty() {
                desired.push(ovs_container(OVNCONTROLLER_NAME, "ovn-controller"));
                desired.push(kubelet_container(&minion.private_ip, leader_ip));
            }
        }
    }
    desired
}

/// Converge the running containers with `desired`, joining on name.
/// Containers whose image or arguments changed are restarted.
pub async fn join_containers(
    runtime: &dyn ContainerRuntime,
    desired: &[RunOptions],
    counter: &Counter,
) {
    let running = match runtime.running().await {
        Ok(running) => running,
        Err(err) => {
            warn!(error = %err, "could not list running containers");
            return;
        }
    };

    let joined = hash_join(
        desired.to_vec(),
        running,
        |opts: &RunOptions| opts.name.clone(),
        |c| c.name.clone(),
    );

    let mut to_start = joined.left;
    for (opts, current) in joined.pairs {
        if opts.image != current.image || opts.args != current.args {
            remove_container(runtime, &current.name).await;
            to_start.push(opts);
        }
    }
    for extra in joined.right {
        remove_container(runtime, &extra.name).await;
    }

    for opts in to_start {
        counter.inc(&format!("Docker Run {}", opts.name));
        if let Err(err) = runtime.pull(&opts.image).await {
            warn!(image = %opts.image, error = %err, "failed to pull image");
            continue;
        }
        info!(name = %opts.name, "start container");
        if let Err(err) = runtime.run(opts.clone()).await {
            warn!(name = %opts.name, error = %err, "failed to run container");
        }
    }
}

async fn remove_container(runtime: &dyn ContainerRuntime, name: &str) {
    info!(%name, "removing container");
    match runtime.remove(name).await {
        Ok(()) | Err(DockerError::NoSuchContainer) => {}
        Err(err) => warn!(%name, error = %err, "failed to remove container"),
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Install the OVS bridge with its deterministic MAC.
async fn setup_bridge(exec: &dyn ExecRunner) -> anyhow::Result<()> {
    let mac = ipdef::ip_to_mac(ipdef::GATEWAY_IP);
    exec.run(
        "ovs-vsctl",
        &strings(&[
            "add-br",
            ipdef::BRIDGE,
            "--",
            "set",
            "bridge",
            ipdef::BRIDGE,
            "fail_mode=secure",
            &format!("other_config:hwaddr=\"{mac}\""),
        ]),
    )
    .await?;
    Ok(())
}

/// Assign the gateway address to the bridge and bring it up.
async fn cfg_gateway(exec: &dyn ExecRunner) -> anyhow::Result<()> {
    exec.run(
        "ip",
        &strings(&["link", "set", "up", "dev", ipdef::BRIDGE]),
    )
    .await?;
    let cidr_bits = ipdef::SUBNET.split('/').nth(1).unwrap_or("8");
    exec.run(
        "ip",
        &strings(&[
            "addr",
            "add",
            &format!("{}/{cidr_bits}", ipdef::GATEWAY_IP),
            "dev",
            ipdef::BRIDGE,
        ]),
    )
    .await?;
    Ok(())
}

/// Worker bring-up: bridge, then gateway, each retried until it sticks.
pub async fn setup_worker(exec: &dyn ExecRunner, backoff: Duration) {
    loop {
        match setup_bridge(exec).await {
            Ok(()) => break,
            Err(err) => {
                warn!(error = %err, "failed to set up bridge");
                tokio::time::sleep(backoff).await;
            }
        }
    }
    loop {
        match cfg_gateway(exec).await {
            Ok(()) => break,
            Err(err) => {
                warn!(error = %err, "failed to configure gateway");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Point the local OVS node at the OVN controller. The values are compared
/// with one `get` first; `set` only runs when something differs, keeping
/// the OVS config flap-free.
pub async fn cfg_ovn(
    exec: &dyn ExecRunner,
    counter: &Counter,
    my_ip: &str,
    leader_ip: &str,
) -> anyhow::Result<()> {
    // The values must match the exact output of `ovs-vsctl get`; most are
    // quoted, ovn-encap-type is not.
    let conf = [
        (
            "external_ids:ovn-remote",
            format!("\"tcp:{leader_ip}:6640\""),
        ),
        ("external_ids:ovn-encap-ip", format!("\"{my_ip}\"")),
        (
            "external_ids:ovn-encap-type",
            TUNNELING_PROTOCOL.to_string(),
        ),
        (
            "external_ids:api_server",
            format!("\"http://{leader_ip}:9000\""),
        ),
        ("external_ids:system-id", format!("\"{my_ip}\"")),
    ];

    let mut expected = String::new();
    let mut get_args = strings(&["--if-exists", "get", "Open_vSwitch", "."]);
    let mut set_args = strings(&["set", "Open_vSwitch", "."]);
    for (key, value) in &conf {
        expected.push_str(value);
        expected.push('\n');
        get_args.push(key.to_string());
        set_args.push(format!("{key}={value}"));
    }

    let actual = exec
        .run("ovs-vsctl", &get_args)
        .await
        .map_err(|err| anyhow::anyhow!("get OVN config: {err}"))?;

    if actual != expected {
        counter.inc("Update OVN config");
        exec.run("ovs-vsctl", &set_args)
            .await
            .map_err(|err| anyhow::anyhow!("set OVN config: {err}"))?;
    }
    Ok(())
}

/// The supervisor loop for one host.
pub struct Supervisor {
    conn: Conn,
    runtime: Arc<dyn ContainerRuntime>,
    exec: Arc<dyn ExecRunner>,
    counter: Counter,
}

impl Supervisor {
    pub fn new(
        conn: &Conn,
        runtime: Arc<dyn ContainerRuntime>,
        exec: Arc<dyn ExecRunner>,
    ) -> Supervisor {
        Supervisor {
            conn: conn.clone(),
            runtime,
            exec,
            counter: Counter::new("Supervisor"),
        }
    }

    /// Run until `shutdown` flips, reconciling on `Minion`/`Etcd` writes or
    /// every thirty seconds.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if let Ok(minion) = self.conn.minion_self() {
            if minion.role == Role::Worker {
                setup_worker(self.exec.as_ref(), Duration::from_secs(5)).await;
            }
        }

        let mut trigger = self.conn.trigger_tick(30, &[Table::Minion, Table::Etcd]);
        let mut timer = EventTimer::new("Supervisor");
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                fire = trigger.c.recv() => {
                    if fire.is_none() {
                        return;
                    }
                }
            }
            timer.log_start();
            self.run_once().await;
            timer.log_end();
        }
    }

    /// One reconcile pass.
    pub async fn run_once(&self) {
        let minion = match self.conn.minion_self() {
            Ok(minion) => minion,
            Err(_) => return,
        };
        let etcd = self
            .conn
            .txn(&[])
            .run(|view| Ok::<_, kelda_db::StoreError>(view.etcd()))
            .unwrap_or(None);

        if minion.role != Role::Master && !minion.private_ip.is_empty() {
            if let Some(leader_ip) = etcd.as_ref().map(|e| e.leader_ip.as_str()) {
                if !leader_ip.is_empty() {
                    if let Err(err) =
                        cfg_ovn(self.exec.as_ref(), &self.counter, &minion.private_ip, leader_ip)
                            .await
                    {
                        warn!(error = %err, "failed to configure OVN");
                    }
                }
            }
        }

        let desired = desired_containers(&minion, etcd.as_ref());
        join_containers(self.runtime.as_ref(), &desired, &self.counter).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::docker::fake::FakeRuntime;

    fn minion(role: Role, private_ip: &str) -> Minion {
        Minion {
            is_self: true,
            role,
            private_ip: private_ip.to_string(),
            ..Minion::default()
        }
    }

    fn etcd(ips: &[&str], leader: &str) -> Etcd {
        Etcd {
            etcd_ips: ips.iter().map(|s| s.to_string()).collect(),
            leader_ip: leader.to_string(),
            ..Etcd::default()
        }
    }

    fn names(desired: &[RunOptions]) -> Vec<&str> {
        desired.iter().map(|o| o.name.as_str()).collect()
    }

    #[test]
    fn fresh_worker_runs_only_ovs() {
        let desired = desired_containers(&minion(Role::Worker, "10.0.0.5"), None);
        assert_eq!(names(&desired), vec![OVSDB_NAME, OVSVSWITCHD_NAME]);
        assert!(desired[1].privileged);
    }

    #[test]
    fn worker_with_members_runs_an_etcd_proxy() {
        let etcd = etcd(&["10.0.0.2", "10.0.0.3"], "");
        let desired = desired_containers(&minion(Role::Worker, "10.0.0.5"), Some(&etcd));
        assert_eq!(names(&desired), vec![OVSDB_NAME, OVSVSWITCHD_NAME, ETCD_NAME]);

        let etcd_args = &desired[2].args;
        let expected = "--initial-cluster=\
             master-10.0.0.2=http://10.0.0.2:2380,\
             master-10.0.0.3=http://10.0.0.3:2380";
        assert!(etcd_args.contains(&expected.to_string()));
        assert!(etcd_args.contains(&"--proxy=on".to_string()));
    }

    #[test]
    fn worker_with_leader_runs_controller_and_kubelet() {
        let etcd = etcd(&["10.0.0.2"], "10.0.0.2");
        let desired = desired_containers(&minion(Role::Worker, "10.0.0.5"), Some(&etcd));
        assert_eq!(
            names(&desired),
            vec![
                OVSDB_NAME,
                OVSVSWITCHD_NAME,
                ETCD_NAME,
                OVNCONTROLLER_NAME,
                KUBELET_NAME
            ]
        );

        let kubelet = desired.iter().find(|o| o.name == KUBELET_NAME).unwrap();
        let kubeconfig = &kubelet.filepath_to_content["/var/lib/kubelet/kubeconfig"];
        assert!(kubeconfig.contains("https://10.0.0.2:6443"));
        assert!(kubelet.mounts.iter().any(|m| m.target == "/var/lib/kubelet" && m.shared));
    }

    #[test]
    fn master_runs_voting_etcd_northd_and_registry() {
        let etcd = etcd(&["10.0.0.2", "10.0.0.3"], "10.0.0.2");
        let desired = desired_containers(&minion(Role::Master, "10.0.0.2"), Some(&etcd));
        assert_eq!(
            names(&desired),
            vec![
                OVSDB_NAME,
                OVSVSWITCHD_NAME,
                ETCD_NAME,
                OVNNORTHD_NAME,
                REGISTRY_NAME
            ]
        );
        let etcd_args = &desired[2].args;
        assert!(etcd_args.contains(&"--name=master-10.0.0.2".to_string()));
        assert!(!etcd_args.contains(&"--proxy=on".to_string()));
    }

    #[tokio::test]
    async fn join_containers_converges_the_set() {
        let fake = FakeRuntime::default();
        let counter = Counter::new("SupervisorTest");

        let desired = vec![
            ovs_container(OVSDB_NAME, "ovsdb-server"),
            ovs_container(OVSVSWITCHD_NAME, "ovs-vswitchd"),
        ];
        join_containers(&fake, &desired, &counter).await;
        assert_eq!(fake.state.lock().unwrap().containers.len(), 2);

        // A second pass is a no-op.
        join_containers(&fake, &desired, &counter).await;
        assert_eq!(fake.state.lock().unwrap().runs.len(), 2);

        // Dropping one from the desired set removes it.
        let desired = vec![ovs_container(OVSDB_NAME, "ovsdb-server")];
        join_containers(&fake, &desired, &counter).await;
        let state = fake.state.lock().unwrap();
        assert_eq!(state.containers.len(), 1);
        assert_eq!(state.containers[0].name, OVSDB_NAME);
    }

    #[tokio::test]
    async fn changed_args_restart_the_container() {
        let fake = FakeRuntime::default();
        let counter = Counter::new("SupervisorTest");

        let mut etcd = etcd_container(vec!["--proxy=on".to_string()]);
        join_containers(&fake, std::slice::from_ref(&etcd), &counter).await;
        assert_eq!(fake.state.lock().unwrap().runs.len(), 1);

        etcd.args = vec!["--proxy=on".to_string(), "--debug".to_string()];
        join_containers(&fake, &[etcd], &counter).await;
        let state = fake.state.lock().unwrap();
        assert_eq!(state.removes, vec![ETCD_NAME]);
        assert_eq!(state.runs.len(), 2);
        assert_eq!(state.containers.len(), 1);
    }

    /// Emulates `ovs-vsctl` get/set over an external-ids map, plus a call
    /// ledger.
    #[derive(Default)]
    struct FakeExec {
        values: Mutex<HashMap<String, String>>,
        calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    #[async_trait]
    impl ExecRunner for FakeExec {
        async fn run(&self, program: &str, args: &[String]) -> anyhow::Result<String> {
            self.calls
                .lock()
                .unwrap()
                .push((program.to_string(), args.to_vec()));
            if program != "ovs-vsctl" {
                return Ok(String::new());
            }
            let values = &mut *self.values.lock().unwrap();
            match args.first().map(String::as_str) {
                Some("--if-exists") => {
                    let mut out = String::new();
                    for key in &args[4..] {
                        out.push_str(values.get(key).map(String::as_str).unwrap_or(""));
                        out.push('\n');
                    }
                    Ok(out)
                }
                Some("set") => {
                    for pair in &args[3..] {
                        if let Some((key, value)) = pair.split_once('=') {
                            values.insert(key.to_string(), value.to_string());
                        }
                    }
                    Ok(String::new())
                }
                _ => Ok(String::new()),
            }
        }
    }

    fn set_count(exec: &FakeExec) -> usize {
        exec.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, args)| args.first().map(String::as_str) == Some("set"))
            .count()
    }

    #[tokio::test]
    async fn ovn_config_is_flap_free() {
        let exec = FakeExec::default();
        let counter = Counter::new("SupervisorOvnTest");

        cfg_ovn(&exec, &counter, "10.0.0.5", "10.0.0.2").await.unwrap();
        assert_eq!(set_count(&exec), 1);

        // Same values: read-only pass.
        cfg_ovn(&exec, &counter, "10.0.0.5", "10.0.0.2").await.unwrap();
        assert_eq!(set_count(&exec), 1);

        // Leader moved: one more set.
        cfg_ovn(&exec, &counter, "10.0.0.5", "10.0.0.3").await.unwrap();
        assert_eq!(set_count(&exec), 2);
    }

    #[tokio::test]
    async fn bridge_setup_uses_the_deterministic_mac() {
        let exec = FakeExec::default();
        setup_worker(&exec, Duration::from_millis(1)).await;

        let calls = exec.calls.lock().unwrap();
        let bridge_call = &calls[0];
        assert_eq!(bridge_call.0, "ovs-vsctl");
        assert!(bridge_call
            .1
            .iter()
            .any(|arg| arg.contains("02:00:0a:00:00:01")));
        assert!(calls.iter().any(|(p, args)| p == "ip" && args.contains(&"addr".to_string())));
    }
}

//! Host adapters: thin exec-backed implementations of the container
//! runtime and OVSDB contracts, driving the `docker` and `ovn-nbctl`
//! binaries on the minion host.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::warn;

use kelda_minion::docker::{ContainerRuntime, DockerError, RunOptions, RunningContainer};
use kelda_minion::ovsdb::{AclRule, LoadBalancerVip, OvsdbClient, RouterPort, SwitchPort};
use kelda_minion::ExecRunner;

/// Label put on every container this daemon manages, so the supervisor's
/// reconcile never touches application containers.
const INFRA_LABEL: &str = "kelda.infrastructure=true";

const ACL_PRIORITY: &str = "1000";

/// Runs programs on the host.
pub struct HostExec;

#[async_trait]
impl ExecRunner for HostExec {
    async fn run(&self, program: &str, args: &[String]) -> anyhow::Result<String> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("spawn {program}"))?;
        if !output.status.success() {
            anyhow::bail!(
                "{program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// The local Docker daemon, driven through its CLI.
pub struct DockerCli {
    exec: Arc<dyn ExecRunner>,
}

impl DockerCli {
    pub fn new(exec: Arc<dyn ExecRunner>) -> DockerCli {
        DockerCli { exec }
    }

    async fn docker(&self, args: Vec<String>) -> Result<String, DockerError> {
        self.exec
            .run("docker", &args)
            .await
            .map_err(|err| {
                let message = err.to_string();
                if message.contains("No such container") {
                    DockerError::NoSuchContainer
                } else {
                    DockerError::Api(message)
                }
            })
    }
}

fn create_args(opts: &RunOptions) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        opts.name.clone(),
        "--label".to_string(),
        INFRA_LABEL.to_string(),
    ];
    if opts.privileged {
        args.push("--privileged".to_string());
    }
    if !opts.network_mode.is_empty() {
        args.push("--net".to_string());
        args.push(opts.network_mode.clone());
    }
    if !opts.pid_mode.is_empty() {
        args.push("--pid".to_string());
        args.push(opts.pid_mode.clone());
    }
    for (key, value) in &opts.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    for from in &opts.volumes_from {
        args.push("--volumes-from".to_string());
        args.push(from.clone());
    }
    for mount in &opts.mounts {
        let mut spec = format!("type=bind,source={},target={}", mount.source, mount.target);
        if mount.shared {
            spec.push_str(",bind-propagation=shared");
        }
        args.push("--mount".to_string());
        args.push(spec);
    }
    args.push(opts.image.clone());
    args.extend(opts.args.iter().cloned());
    args
}

/// Pull `[{"Config": {"Image": ..., "Cmd": [...]}}]` apart into the fields
/// the reconcile joins on.
fn parse_inspect(raw: &str) -> Option<(String, Vec<String>)> {
    let doc: serde_json::Value = serde_json::from_str(raw).ok()?;
    let config = doc.get(0)?.get("Config")?;
    let image = config.get("Image")?.as_str()?.to_string();
    let args = config
        .get("Cmd")
        .and_then(|cmd| cmd.as_array())
        .map(|cmd| {
            cmd.iter()
                .filter_map(|a| a.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    Some((image, args))
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn pull(&self, image: &str) -> Result<(), DockerError> {
        self.docker(vec!["pull".to_string(), image.to_string()])
            .await?;
        Ok(())
    }

    async fn run(&self, opts: RunOptions) -> Result<String, DockerError> {
        let cid = self.docker(create_args(&opts)).await?.trim().to_string();

        for (index, (path, content)) in opts.filepath_to_content.iter().enumerate() {
            let staging = std::env::temp_dir().join(format!("kelda-{cid}-{index}"));
            std::fs::write(&staging, content)
                .map_err(|err| DockerError::Api(err.to_string()))?;
            let copied = self
                .docker(vec![
                    "cp".to_string(),
                    staging.display().to_string(),
                    format!("{cid}:{path}"),
                ])
                .await;
            let _ = std::fs::remove_file(&staging);
            copied?;
        }

        self.docker(vec!["start".to_string(), cid.clone()]).await?;
        Ok(cid)
    }

    async fn remove(&self, name: &str) -> Result<(), DockerError> {
        self.docker(vec!["rm".to_string(), "-f".to_string(), name.to_string()])
            .await?;
        Ok(())
    }

    async fn running(&self) -> Result<Vec<RunningContainer>, DockerError> {
        let names = self
            .docker(vec![
                "ps".to_string(),
                "--filter".to_string(),
                format!("label={INFRA_LABEL}"),
                "--format".to_string(),
                "{{.Names}}".to_string(),
            ])
            .await?;

        let mut containers = Vec::new();
        for name in names.lines().filter(|l| !l.is_empty()) {
            let inspected = self
                .docker(vec!["inspect".to_string(), name.to_string()])
                .await?;
            match parse_inspect(&inspected) {
                Some((image, args)) => containers.push(RunningContainer {
                    name: name.to_string(),
                    image,
                    args,
                }),
                None => warn!(%name, "unparsable docker inspect output"),
            }
        }
        Ok(containers)
    }
}

/// OVN's northbound database, driven through `ovn-nbctl`.
pub struct NbctlClient {
    exec: Arc<dyn ExecRunner>,
}

impl NbctlClient {
    pub fn new(exec: Arc<dyn ExecRunner>) -> NbctlClient {
        NbctlClient { exec }
    }

    async fn nbctl(&self, args: &[&str]) -> anyhow::Result<String> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.exec.run("ovn-nbctl", &args).await
    }

    async fn name_listed(&self, list_cmd: &str, name: &str) -> anyhow::Result<bool> {
        let out = self.nbctl(&[list_cmd]).await?;
        Ok(out.lines().any(|line| line.contains(&format!("({name})"))))
    }
}

/// The match expression installed for one allowed flow, and its inverse.
fn acl_match(acl: &AclRule) -> String {
    format!(
        "ip4.src == {} && ip4.dst == {} && {} <= tcp.dst && tcp.dst <= {}",
        acl.from_ip, acl.to_ip, acl.min_port, acl.max_port
    )
}

/// Recover an `AclRule` from a match expression we installed earlier.
/// Foreign ACLs yield `None` and are left alone.
fn parse_acl_match(expr: &str) -> Option<AclRule> {
    let parts: Vec<&str> = expr.split(" && ").collect();
    if parts.len() != 4 {
        return None;
    }
    let from_ip = parts[0].strip_prefix("ip4.src == ")?.to_string();
    let to_ip = parts[1].strip_prefix("ip4.dst == ")?.to_string();
    let min_port = parts[2].strip_suffix(" <= tcp.dst")?.parse().ok()?;
    let max_port = parts[3].strip_prefix("tcp.dst <= ")?.parse().ok()?;
    Some(AclRule {
        from_ip,
        to_ip,
        min_port,
        max_port,
    })
}

/// One row of `ovn-nbctl --format=csv list`, split on unquoted commas.
fn split_csv_row(row: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in row.chars() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                fields.push(current.clone());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

fn unquote(field: &str) -> String {
    field.trim().trim_matches('"').to_string()
}

#[async_trait]
impl OvsdbClient for NbctlClient {
    async fn logical_switch_exists(&self, name: &str) -> anyhow::Result<bool> {
        self.name_listed("ls-list", name).await
    }

    async fn create_logical_switch(&self, name: &str) -> anyhow::Result<()> {
        self.nbctl(&["ls-add", name]).await?;
        Ok(())
    }

    async fn list_switch_ports(&self) -> anyhow::Result<Vec<SwitchPort>> {
        let out = self
            .nbctl(&[
                "--format=csv",
                "--no-headings",
                "--columns=name,type,addresses",
                "list",
                "Logical_Switch_Port",
            ])
            .await?;
        Ok(out
            .lines()
            .filter(|line| !line.is_empty())
            .filter_map(|line| {
                let fields = split_csv_row(line);
                Some(SwitchPort {
                    name: unquote(fields.first()?),
                    port_type: unquote(fields.get(1)?),
                    addresses: unquote(fields.get(2)?)
                        .trim_matches(|c| c == '[' || c == ']')
                        .split(", ")
                        .filter(|a| !a.is_empty())
                        .map(str::to_string)
                        .collect(),
                    options: BTreeMap::new(),
                })
            })
            .collect())
    }

    async fn create_switch_port(&self, switch: &str, port: SwitchPort) -> anyhow::Result<()> {
        self.nbctl(&["lsp-add", switch, &port.name]).await?;
        if !port.port_type.is_empty() {
            self.nbctl(&["lsp-set-type", &port.name, &port.port_type])
                .await?;
        }
        if !port.addresses.is_empty() {
            let mut args = vec!["lsp-set-addresses", port.name.as_str()];
            args.extend(port.addresses.iter().map(String::as_str));
            self.nbctl(&args).await?;
        }
        for (key, value) in &port.options {
            let option = format!("{key}={value}");
            self.nbctl(&["lsp-set-options", &port.name, &option]).await?;
        }
        Ok(())
    }

    async fn delete_switch_port(&self, _switch: &str, port: SwitchPort) -> anyhow::Result<()> {
        self.nbctl(&["lsp-del", &port.name]).await?;
        Ok(())
    }

    async fn logical_router_exists(&self, name: &str) -> anyhow::Result<bool> {
        self.name_listed("lr-list", name).await
    }

    async fn create_logical_router(&self, name: &str) -> anyhow::Result<()> {
        self.nbctl(&["lr-add", name]).await?;
        Ok(())
    }

    async fn list_router_ports(&self) -> anyhow::Result<Vec<RouterPort>> {
        let out = self
            .nbctl(&[
                "--format=csv",
                "--no-headings",
                "--columns=name,mac,networks",
                "list",
                "Logical_Router_Port",
            ])
            .await?;
        Ok(out
            .lines()
            .filter(|line| !line.is_empty())
            .filter_map(|line| {
                let fields = split_csv_row(line);
                Some(RouterPort {
                    name: unquote(fields.first()?),
                    mac: unquote(fields.get(1)?),
                    networks: unquote(fields.get(2)?)
                        .trim_matches(|c| c == '[' || c == ']')
                        .split(", ")
                        .filter(|n| !n.is_empty())
                        .map(str::to_string)
                        .collect(),
                })
            })
            .collect())
    }

    async fn create_router_port(&self, router: &str, port: RouterPort) -> anyhow::Result<()> {
        let mut args = vec!["lrp-add", router, port.name.as_str(), port.mac.as_str()];
        args.extend(port.networks.iter().map(String::as_str));
        self.nbctl(&args).await?;
        Ok(())
    }

    async fn delete_router_port(&self, _router: &str, port: RouterPort) -> anyhow::Result<()> {
        self.nbctl(&["lrp-del", &port.name]).await?;
        Ok(())
    }

    async fn list_load_balancers(&self) -> anyhow::Result<Vec<LoadBalancerVip>> {
        let out = self
            .nbctl(&[
                "--format=csv",
                "--no-headings",
                "--columns=name,vips",
                "list",
                "Load_Balancer",
            ])
            .await?;
        Ok(out
            .lines()
            .filter(|line| !line.is_empty())
            .filter_map(|line| {
                let fields = split_csv_row(line);
                let name = unquote(fields.first()?);
                // vips renders as {"vip"="ip1,ip2"}; one entry per balancer.
                let vips = unquote(fields.get(1)?);
                let body = vips.trim_matches(|c| c == '{' || c == '}');
                let (vip, ips) = body.split_once('=')?;
                let mut ips: Vec<String> = ips
                    .trim_matches('"')
                    .split(',')
                    .filter(|ip| !ip.is_empty())
                    .map(str::to_string)
                    .collect();
                ips.sort();
                Some(LoadBalancerVip {
                    name,
                    vip: vip.trim_matches('"').to_string(),
                    ips,
                })
            })
            .collect())
    }

    async fn create_load_balancer(
        &self,
        switch: &str,
        lb: LoadBalancerVip,
    ) -> anyhow::Result<()> {
        let backends = lb.ips.join(",");
        self.nbctl(&["lb-add", &lb.name, &lb.vip, &backends]).await?;
        self.nbctl(&["ls-lb-add", switch, &lb.name]).await?;
        Ok(())
    }

    async fn delete_load_balancer(
        &self,
        switch: &str,
        lb: LoadBalancerVip,
    ) -> anyhow::Result<()> {
        self.nbctl(&["ls-lb-del", switch, &lb.name]).await?;
        self.nbctl(&["lb-del", &lb.name]).await?;
        Ok(())
    }

    async fn list_acls(&self) -> anyhow::Result<Vec<AclRule>> {
        let out = self
            .nbctl(&[
                "--format=csv",
                "--no-headings",
                "--columns=match",
                "list",
                "ACL",
            ])
            .await?;
        Ok(out
            .lines()
            .filter(|line| !line.is_empty())
            .filter_map(|line| parse_acl_match(&unquote(line)))
            .collect())
    }

    async fn create_acl(&self, switch: &str, acl: AclRule) -> anyhow::Result<()> {
        self.nbctl(&[
            "acl-add",
            switch,
            "to-lport",
            ACL_PRIORITY,
            &acl_match(&acl),
            "allow",
        ])
        .await?;
        Ok(())
    }

    async fn delete_acl(&self, switch: &str, acl: AclRule) -> anyhow::Result<()> {
        self.nbctl(&[
            "acl-del",
            switch,
            "to-lport",
            ACL_PRIORITY,
            &acl_match(&acl),
        ])
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kelda_minion::docker::Mount;

    #[test]
    fn create_args_cover_the_run_options() {
        let opts = RunOptions {
            name: "etcd".to_string(),
            image: "quay.io/coreos/etcd:v3.3".to_string(),
            args: vec!["--proxy=on".to_string()],
            env: [("ETCD_DATA_DIR".to_string(), "/etcd-data".to_string())]
                .into_iter()
                .collect(),
            network_mode: "host".to_string(),
            privileged: true,
            volumes_from: vec!["minion".to_string()],
            mounts: vec![Mount {
                source: "/var/lib/etcd".to_string(),
                target: "/etcd-data".to_string(),
                shared: true,
            }],
            ..RunOptions::default()
        };

        let args = create_args(&opts);
        let joined = args.join(" ");
        assert!(joined.starts_with("create --name etcd"));
        assert!(joined.contains("--privileged"));
        assert!(joined.contains("--net host"));
        assert!(joined.contains("-e ETCD_DATA_DIR=/etcd-data"));
        assert!(joined.contains("--volumes-from minion"));
        assert!(joined.contains(
            "--mount type=bind,source=/var/lib/etcd,target=/etcd-data,bind-propagation=shared"
        ));
        assert!(joined.ends_with("quay.io/coreos/etcd:v3.3 --proxy=on"));
    }

    #[test]
    fn inspect_parsing() {
        let raw = r#"[{"Config": {"Image": "keldaio/ovs", "Cmd": ["ovsdb-server"]}}]"#;
        assert_eq!(
            parse_inspect(raw),
            Some(("keldaio/ovs".to_string(), vec!["ovsdb-server".to_string()]))
        );
        assert_eq!(parse_inspect("[]"), None);
        assert_eq!(parse_inspect("not json"), None);
    }

    #[test]
    fn acl_match_round_trips() {
        let acl = AclRule {
            from_ip: "10.0.0.3".to_string(),
            to_ip: "10.0.0.9".to_string(),
            min_port: 80,
            max_port: 81,
        };
        assert_eq!(parse_acl_match(&acl_match(&acl)), Some(acl));
        assert_eq!(parse_acl_match("outport == \"foo\""), None);
    }

    #[test]
    fn csv_rows_respect_quotes() {
        assert_eq!(
            split_csv_row(r#""10.0.0.2","",x"#),
            vec!["10.0.0.2", "", "x"]
        );
        assert_eq!(
            split_csv_row(r#"name,"a, b",c"#),
            vec!["name", "a, b", "c"]
        );
    }
}

//! kelda-engine — translates a compiled blueprint into desired-state rows.
//!
//! Runs only when a new blueprint arrives, never on a ticker. Each section
//! is diffed against the engine's existing rows with a hash join on the
//! section's natural key, and rows are added, removed, or updated in place
//! so untouched declarations keep their row ids. A parse error leaves the
//! store exactly as it was.

use tracing::info;

use kelda_blueprint::{natural_key, ParseError};
use kelda_db::{
    Author, Conn, Connection, Container, Database, Hostname, LoadBalancer, Machine, Placement,
    ProviderName, Role, StoreError, Table,
};
use kelda_join::hash_join;

/// Why a blueprint could not be applied. Either way the store is exactly as
/// it was before the call.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Ingest a compiled blueprint, converging the desired-state rows to it.
pub fn update_policy(conn: &Conn, raw: &str) -> Result<(), EngineError> {
    let blueprint = kelda_blueprint::Blueprint::from_json(raw).map_err(EngineError::Parse)?;

    let conn = conn.scoped(Author::Engine);
    conn.txn(&[
        Table::Machine,
        Table::Container,
        Table::Hostname,
        Table::LoadBalancer,
        Table::Connection,
        Table::Placement,
        Table::Blueprint,
    ])
    .run(|view| {
        update_blueprint_row(view, raw, &blueprint.namespace)?;
        update_machines(view, &blueprint.machines)?;
        update_containers(view, &blueprint.containers)?;
        update_hostnames(view, &blueprint.hostnames)?;
        update_load_balancers(view, &blueprint.load_balancers)?;
        update_connections(view, &blueprint.connections)?;
        update_placements(view, &blueprint.placements)?;
        Ok::<_, StoreError>(())
    })?;

    info!(namespace = %blueprint.namespace, "blueprint applied");
    Ok(())
}

fn update_blueprint_row(
    view: &mut Database<'_>,
    raw: &str,
    namespace: &str,
) -> Result<(), StoreError> {
    let mut row = match view.all::<kelda_db::Blueprint>().into_iter().next() {
        Some(row) => row,
        None => view.insert::<kelda_db::Blueprint>(),
    };
    if row.blueprint != raw || row.namespace != namespace {
        row.blueprint = raw.to_string();
        row.namespace = namespace.to_string();
        view.commit(row)?;
    }
    Ok(())
}

/// The machine element a desired row was created from, for re-keying.
fn machine_element(row: &Machine) -> kelda_blueprint::Machine {
    kelda_blueprint::Machine {
        provider: row.provider.to_string(),
        region: row.region.clone(),
        size: row.size.clone(),
        disk_size: row.disk_size,
        preemptible: row.preemptible,
        role: row.role.to_string(),
        floating_ip: row.floating_ip.clone(),
    }
}

fn update_machines(
    view: &mut Database<'_>,
    declared: &[kelda_blueprint::Machine],
) -> Result<(), StoreError> {
    let existing = view.select_from::<Machine>(|m| m.cloud_id.is_empty() && m.status.is_empty());
    let joined = hash_join(
        declared.to_vec(),
        existing,
        natural_key,
        |row: &Machine| natural_key(&machine_element(row)),
    );
    for element in joined.left {
        let mut row = view.insert::<Machine>();
        // Validated at parse time.
        row.provider = ProviderName::parse(&element.provider).unwrap_or_default();
        row.region = element.region;
        row.size = element.size;
        row.disk_size = element.disk_size;
        row.preemptible = element.preemptible;
        row.role = Role::parse(&element.role).unwrap_or_default();
        row.floating_ip = element.floating_ip;
        view.commit(row)?;
    }
    for row in joined.right {
        view.remove(&row);
    }
    Ok(())
}

/// The identity of a container: everything but its hostname, which may be
/// renamed in place.
fn container_key(
    image: &str,
    command: &[String],
    env: &std::collections::BTreeMap<String, String>,
    files: &std::collections::BTreeMap<String, String>,
) -> String {
    natural_key(&(image, command, env, files))
}

fn update_containers(
    view: &mut Database<'_>,
    declared: &[kelda_blueprint::Container],
) -> Result<(), StoreError> {
    let existing = view.all::<Container>();
    let joined = hash_join(
        declared.to_vec(),
        existing,
        |c: &kelda_blueprint::Container| {
            container_key(&c.image, &c.command, &c.env, &c.filepath_to_content)
        },
        |row: &Container| {
            container_key(&row.image, &row.command, &row.env, &row.filepath_to_content)
        },
    );
    for (element, mut row) in joined.pairs {
        if row.hostname != element.hostname {
            row.hostname = element.hostname;
            view.commit(row)?;
        }
    }
    for element in joined.left {
        let mut row = view.insert::<Container>();
        row.hostname = element.hostname;
        row.image = element.image;
        row.command = element.command;
        row.env = element.env;
        row.filepath_to_content = element.filepath_to_content;
        view.commit(row)?;
    }
    for row in joined.right {
        view.remove(&row);
    }
    Ok(())
}

fn update_hostnames(
    view: &mut Database<'_>,
    declared: &[kelda_blueprint::Hostname],
) -> Result<(), StoreError> {
    let existing = view.all::<Hostname>();
    let joined = hash_join(
        declared.to_vec(),
        existing,
        |h: &kelda_blueprint::Hostname| h.hostname.clone(),
        |row: &Hostname| row.hostname.clone(),
    );
    for element in joined.left {
        let mut row = view.insert::<Hostname>();
        row.hostname = element.hostname;
        row.ip = element.ip;
        view.commit(row)?;
    }
    for row in joined.right {
        view.remove(&row);
    }
    Ok(())
}

fn update_load_balancers(
    view: &mut Database<'_>,
    declared: &[kelda_blueprint::LoadBalancer],
) -> Result<(), StoreError> {
    let existing = view.all::<LoadBalancer>();
    let joined = hash_join(
        declared.to_vec(),
        existing,
        |lb: &kelda_blueprint::LoadBalancer| lb.name.clone(),
        |row: &LoadBalancer| row.name.clone(),
    );
    for (element, mut row) in joined.pairs {
        let hostnames: std::collections::BTreeSet<String> =
            element.hostnames.into_iter().collect();
        if row.hostnames != hostnames {
            row.hostnames = hostnames;
            view.commit(row)?;
        }
    }
    for element in joined.left {
        let mut row = view.insert::<LoadBalancer>();
        row.name = element.name;
        row.hostnames = element.hostnames.into_iter().collect();
        view.commit(row)?;
    }
    for row in joined.right {
        view.remove(&row);
    }
    Ok(())
}

fn update_connections(
    view: &mut Database<'_>,
    declared: &[kelda_blueprint::Connection],
) -> Result<(), StoreError> {
    let existing = view.all::<Connection>();
    let joined = hash_join(
        declared.to_vec(),
        existing,
        natural_key,
        |row: &Connection| {
            natural_key(&kelda_blueprint::Connection {
                from: row.from.iter().cloned().collect(),
                to: row.to.iter().cloned().collect(),
                min_port: row.min_port,
                max_port: row.max_port,
            })
        },
    );
    for element in joined.left {
        let mut row = view.insert::<Connection>();
        row.from = element.from.into_iter().collect();
        row.to = element.to.into_iter().collect();
        row.min_port = element.min_port;
        row.max_port = element.max_port;
        view.commit(row)?;
    }
    for row in joined.right {
        view.remove(&row);
    }
    Ok(())
}

fn update_placements(
    view: &mut Database<'_>,
    declared: &[kelda_blueprint::Placement],
) -> Result<(), StoreError> {
    let existing = view.all::<Placement>();
    let joined = hash_join(
        declared.to_vec(),
        existing,
        natural_key,
        |row: &Placement| {
            natural_key(&kelda_blueprint::Placement {
                target_container: row.target_container.clone(),
                exclusive: row.exclusive,
                provider: row.provider.clone(),
                region: row.region.clone(),
                size: row.size.clone(),
                floating_ip: row.floating_ip.clone(),
                preemptible: row.preemptible,
            })
        },
    );
    for element in joined.left {
        let mut row = view.insert::<Placement>();
        row.target_container = element.target_container;
        row.exclusive = element.exclusive;
        row.provider = element.provider;
        row.region = element.region;
        row.size = element.size;
        row.floating_ip = element.floating_ip;
        row.preemptible = element.preemptible;
        view.commit(row)?;
    }
    for row in joined.right {
        view.remove(&row);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLUEPRINT: &str = r#"{
        "Namespace": "prod",
        "Machines": [
            {"Provider": "Amazon", "Region": "us-west-1", "Size": "m3.medium", "Role": "Master"},
            {"Provider": "Amazon", "Region": "us-west-1", "Size": "m3.medium", "Role": "Worker"}
        ],
        "Containers": [
            {"Hostname": "web", "Image": "nginx", "Command": ["nginx"]},
            {"Hostname": "db", "Image": "postgres:13"}
        ],
        "Hostnames": [{"Hostname": "web"}, {"Hostname": "db"}, {"Hostname": "lb"}],
        "LoadBalancers": [{"Name": "lb", "Hostnames": ["web"]}],
        "Connections": [{"From": ["public"], "To": ["lb"], "MinPort": 80, "MaxPort": 80}],
        "Placements": [{"TargetContainer": "db", "Exclusive": true}]
    }"#;

    fn rows<R: kelda_db::Record>(conn: &Conn) -> Vec<R> {
        conn.txn(&[])
            .run(|view| Ok::<_, StoreError>(view.all::<R>()))
            .unwrap()
    }

    #[test]
    fn first_run_populates_every_section() {
        let conn = Conn::new();
        update_policy(&conn, BLUEPRINT).unwrap();

        assert_eq!(rows::<Machine>(&conn).len(), 2);
        assert_eq!(rows::<Container>(&conn).len(), 2);
        assert_eq!(rows::<Hostname>(&conn).len(), 3);
        assert_eq!(rows::<LoadBalancer>(&conn).len(), 1);
        assert_eq!(rows::<Connection>(&conn).len(), 1);
        assert_eq!(rows::<Placement>(&conn).len(), 1);

        let blueprint = rows::<kelda_db::Blueprint>(&conn);
        assert_eq!(blueprint.len(), 1);
        assert_eq!(blueprint[0].namespace, "prod");
    }

    #[test]
    fn identical_blueprint_is_a_noop() {
        let conn = Conn::new();
        update_policy(&conn, BLUEPRINT).unwrap();
        let before: Vec<u64> = rows::<Container>(&conn).iter().map(|c| c.id).collect();

        update_policy(&conn, BLUEPRINT).unwrap();
        let after: Vec<u64> = rows::<Container>(&conn).iter().map(|c| c.id).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn changed_image_replaces_the_container() {
        let conn = Conn::new();
        update_policy(&conn, BLUEPRINT).unwrap();
        let old_db = rows::<Container>(&conn)
            .into_iter()
            .find(|c| c.hostname == "db")
            .unwrap();

        let updated = BLUEPRINT.replace("postgres:13", "postgres:14");
        update_policy(&conn, &updated).unwrap();

        let new_db = rows::<Container>(&conn)
            .into_iter()
            .find(|c| c.hostname == "db")
            .unwrap();
        assert_eq!(new_db.image, "postgres:14");
        assert_ne!(new_db.id, old_db.id);
    }

    #[test]
    fn renamed_container_is_updated_in_place() {
        let conn = Conn::new();
        update_policy(&conn, BLUEPRINT).unwrap();
        let old_web = rows::<Container>(&conn)
            .into_iter()
            .find(|c| c.hostname == "web")
            .unwrap();

        let renamed = BLUEPRINT
            .replace(r#""Hostname": "web", "Image": "nginx""#, r#""Hostname": "frontend", "Image": "nginx""#)
            .replace(r#"{"Hostname": "web"}"#, r#"{"Hostname": "frontend"}"#)
            .replace(r#""Hostnames": ["web"]"#, r#""Hostnames": ["frontend"]"#);
        update_policy(&conn, &renamed).unwrap();

        let new_web = rows::<Container>(&conn)
            .into_iter()
            .find(|c| c.hostname == "frontend")
            .unwrap();
        assert_eq!(new_web.id, old_web.id);
    }

    #[test]
    fn removed_machine_drops_only_its_row() {
        let conn = Conn::new();
        update_policy(&conn, BLUEPRINT).unwrap();
        let before = rows::<Machine>(&conn);
        let keep_id = before.iter().find(|m| m.role == Role::Master).unwrap().id;

        let mut doc: serde_json::Value = serde_json::from_str(BLUEPRINT).unwrap();
        doc["Machines"]
            .as_array_mut()
            .unwrap()
            .retain(|m| m["Role"] == "Master");
        update_policy(&conn, &doc.to_string()).unwrap();

        let after = rows::<Machine>(&conn);
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, keep_id);
        assert_eq!(after[0].role, Role::Master);
    }

    #[test]
    fn parse_error_leaves_rows_untouched() {
        let conn = Conn::new();
        update_policy(&conn, BLUEPRINT).unwrap();
        let before = rows::<Container>(&conn);

        assert!(update_policy(&conn, "{not json").is_err());
        assert!(update_policy(&conn, r#"{"Machines": [{"Provider": "Azure"}]}"#).is_err());

        assert_eq!(rows::<Container>(&conn), before);
    }

    #[test]
    fn observed_machines_are_not_engine_rows() {
        let conn = Conn::new();
        // A cloud-backed row written by the cluster reconciler.
        conn.scoped(Author::Cluster)
            .txn(&[Table::Machine])
            .run(|view| {
                let mut m = view.insert::<Machine>();
                m.cloud_id = "i-1".to_string();
                m.provider = ProviderName::Amazon;
                m.region = "us-west-1".to_string();
                m.size = "m3.medium".to_string();
                m.status = "running".to_string();
                view.commit(m)?;
                Ok::<_, StoreError>(())
            })
            .unwrap();

        update_policy(&conn, r#"{"Namespace": "prod"}"#).unwrap();

        // The empty blueprint removed no observed rows.
        let machines = rows::<Machine>(&conn);
        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].cloud_id, "i-1");
    }
}

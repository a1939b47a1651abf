//! Loading a compiled blueprint from a file or a fragment directory.

use std::path::Path;

use anyhow::Context;

use crate::priority::sort_by_priority_prefix;

const SECTIONS: &[&str] = &[
    "Machines",
    "Containers",
    "Hostnames",
    "LoadBalancers",
    "Connections",
    "Placements",
    "AdminACL",
];

/// Read a blueprint document. A directory is treated as fragments merged in
/// priority-prefix order: array sections concatenate, the last non-empty
/// namespace wins.
pub fn load_blueprint(path: &Path) -> anyhow::Result<String> {
    if !path.is_dir() {
        return std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()));
    }

    let mut names: Vec<String> = std::fs::read_dir(path)
        .with_context(|| format!("read directory {}", path.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".json"))
        .collect();
    if names.is_empty() {
        anyhow::bail!("no blueprint fragments in {}", path.display());
    }
    sort_by_priority_prefix(&mut names);

    let mut merged = serde_json::json!({});
    for name in &names {
        let fragment_path = path.join(name);
        let raw = std::fs::read_to_string(&fragment_path)
            .with_context(|| format!("read {}", fragment_path.display()))?;
        let fragment: serde_json::Value =
            serde_json::from_str(&raw).with_context(|| format!("parse {name}"))?;
        merge(&mut merged, fragment);
    }
    Ok(merged.to_string())
}

fn merge(into: &mut serde_json::Value, fragment: serde_json::Value) {
    if let Some(namespace) = fragment.get("Namespace").and_then(|n| n.as_str()) {
        if !namespace.is_empty() {
            into["Namespace"] = namespace.into();
        }
    }
    for section in SECTIONS {
        let Some(elements) = fragment.get(*section).and_then(|s| s.as_array()) else {
            continue;
        };
        if into.get(*section).is_none() {
            into[*section] = serde_json::json!([]);
        }
        if let Some(target) = into[*section].as_array_mut() {
            target.extend(elements.iter().cloned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_file_loads_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bp.json");
        std::fs::write(&path, r#"{"Namespace": "prod"}"#).unwrap();

        assert_eq!(load_blueprint(&path).unwrap(), r#"{"Namespace": "prod"}"#);
    }

    #[test]
    fn fragments_merge_in_priority_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("10-base.json"),
            r#"{"Namespace": "prod", "Machines": [{"Provider": "Amazon", "Role": "Master"}]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("99-extra.json"),
            r#"{"Machines": [{"Provider": "Amazon", "Role": "Worker"}]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let merged = load_blueprint(dir.path()).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&merged).unwrap();
        assert_eq!(doc["Namespace"], "prod");
        let machines = doc["Machines"].as_array().unwrap();
        assert_eq!(machines.len(), 2);
        assert_eq!(machines[0]["Role"], "Master");
        assert_eq!(machines[1]["Role"], "Worker");
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_blueprint(dir.path()).is_err());
    }
}

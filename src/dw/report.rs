//! Typed records for the CLI's `show_*` reports. Older CLI revisions emit
//! Python-repr dictionaries (single quotes, `u'...'` prefixes) instead of
//! JSON, so every report is normalized before parsing. Unknown keys are
//! ignored and missing fields default to zero/empty.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::common::error::DwOpResult;
use crate::UserId;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Pool {
    pub id: String,
    pub units: String,
    pub granularity: u64,
    pub quantity: u64,
    pub free: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Instance {
    pub id: u32,
    pub bytes: u64,
    pub label: String,
}

#[derive(Debug, Clone, Default)]
pub struct Session {
    pub id: u32,
    pub token: String,
    pub used: bool,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Default)]
pub struct Configuration {
    pub id: u32,
    pub instance: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InstanceWire {
    id: u32,
    capacity: CapacityWire,
    label: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CapacityWire {
    bytes: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SessionWire {
    id: u32,
    token: String,
    used: bool,
    owner: UserId,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigurationWire {
    id: u32,
    links: LinksWire,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LinksWire {
    instance: u32,
}

/// Convert a Python-repr dictionary dump to JSON: single quotes become
/// double quotes outside quoted spans, and a `u` immediately before a quote
/// is dropped.
pub fn normalize_python_repr(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut quoted = false;
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\'' {
            out.push('"');
            quoted = !quoted;
        } else if c == 'u' && !quoted && chars.peek() == Some(&'\'') {
            // Skip over unicode flag
        } else {
            out.push(c);
        }
    }
    out
}

/// Parse a report body. The CLI wraps each report in a single-key object
/// (`{"pools": [...]}`); a bare top-level array is accepted too. Entries
/// that do not decode are skipped.
fn parse_report<W: DeserializeOwned>(raw: &str, what: &str) -> DwOpResult<Vec<W>> {
    let normalized = normalize_python_repr(raw);
    let value: Value = serde_json::from_str(normalized.trim())
        .map_err(|e| anyhow::anyhow!("Cannot parse {what} report: {e}"))?;

    // Reports are usually wrapped in a single-key object holding an array;
    // a bare array or a single bare record are accepted as well.
    let items: Vec<Value> = match value {
        Value::Array(items) => items,
        Value::Object(map) => {
            let nested = map.values().find(|v| v.is_array()).cloned();
            match nested {
                Some(Value::Array(items)) => items,
                _ if map.is_empty() => Vec::new(),
                _ => vec![Value::Object(map)],
            }
        }
        other => anyhow::bail!("Unexpected {what} report shape: {other}"),
    };

    let mut records = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value(item.clone()) {
            Ok(record) => records.push(record),
            Err(e) => log::warn!("Skipping malformed {what} entry {item}: {e}"),
        }
    }
    Ok(records)
}

pub fn parse_pools(raw: &str) -> DwOpResult<Vec<Pool>> {
    parse_report(raw, "pools")
}

pub fn parse_instances(raw: &str) -> DwOpResult<Vec<Instance>> {
    let wires: Vec<InstanceWire> = parse_report(raw, "instances")?;
    Ok(wires
        .into_iter()
        .map(|w| Instance {
            id: w.id,
            bytes: w.capacity.bytes,
            label: w.label,
        })
        .collect())
}

pub fn parse_sessions(raw: &str) -> DwOpResult<Vec<Session>> {
    let wires: Vec<SessionWire> = parse_report(raw, "sessions")?;
    Ok(wires
        .into_iter()
        .map(|w| Session {
            id: w.id,
            token: w.token,
            used: w.used,
            user_id: w.owner,
        })
        .collect())
}

pub fn parse_configurations(raw: &str) -> DwOpResult<Vec<Configuration>> {
    let wires: Vec<ConfigurationWire> = parse_report(raw, "configurations")?;
    Ok(wires
        .into_iter()
        .map(|w| Configuration {
            id: w.id,
            instance: w.links.instance,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_python_repr() {
        assert_eq!(
            normalize_python_repr("{u'id': 1, u'label': u'a'}"),
            r#"{"id": 1, "label": "a"}"#
        );
        // A 'u' inside a quoted span survives
        assert_eq!(normalize_python_repr("{'id': 'auth'}"), r#"{"id": "auth"}"#);
    }

    #[test]
    fn test_parse_pools() {
        let raw = r#"{"pools": [
            {"id": "wlm_pool", "units": "bytes", "granularity": 16777216,
             "quantity": 2048, "free": 2000, "extra": true},
            {"id": "nodes", "units": "nodes", "granularity": 1,
             "quantity": 10, "free": 5}
        ]}"#;
        let pools = parse_pools(raw).unwrap();
        assert_eq!(pools.len(), 2);
        assert_eq!(pools[0].id, "wlm_pool");
        assert_eq!(pools[0].granularity, 16777216);
        assert_eq!(pools[1].quantity, 10);
    }

    #[test]
    fn test_parse_bare_python_dict() {
        let instances = parse_instances("{u'id': 1, u'label': u'a'}").unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, 1);
        assert_eq!(instances[0].label, "a");
    }

    #[test]
    fn test_parse_instances_python_style() {
        let raw = "{u'instances': [{u'id': 1, u'capacity': {u'bytes': 1073741824}, u'label': u'a'}]}";
        let instances = parse_instances(raw).unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, 1);
        assert_eq!(instances[0].bytes, 1 << 30);
        assert_eq!(instances[0].label, "a");
    }

    #[test]
    fn test_parse_sessions_owner_mapping() {
        let raw = r#"{"sessions": [
            {"id": 7, "token": "1234", "used": true, "owner": 1001},
            {"id": 8, "token": "scratch"}
        ]}"#;
        let sessions = parse_sessions(raw).unwrap();
        assert_eq!(sessions[0].user_id, 1001);
        assert!(sessions[0].used);
        assert_eq!(sessions[1].token, "scratch");
        assert_eq!(sessions[1].user_id, 0);
        assert!(!sessions[1].used);
    }

    #[test]
    fn test_parse_configurations_links() {
        let raw = r#"{"configurations": [{"id": 3, "links": {"instance": 9}}]}"#;
        let configs = parse_configurations(raw).unwrap();
        assert_eq!(configs[0].id, 3);
        assert_eq!(configs[0].instance, 9);
    }

    #[test]
    fn test_malformed_entries_skipped() {
        let raw = r#"{"sessions": [{"id": 1, "token": "a"}, 42]}"#;
        let sessions = parse_sessions(raw).unwrap();
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn test_garbage_report() {
        assert!(parse_pools("no pools here").is_err());
    }
}

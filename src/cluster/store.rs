//! Process-wide shared state: named dictionaries, named locks, and the JSON
//! codec for persisted topology.
//!
//! The dictionaries span every client in the process, so a freshly created
//! client can skip its `CLUSTER SLOTS` bootstrap when another client already
//! cached the topology under the same dict name. Reads and writes are both
//! best effort.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use serde_json::{json, Value};

use crate::cluster::topology::{RawNode, RawSlotRange};
use crate::error::{Error, Result};

static DICTS: OnceLock<RwLock<HashMap<String, Arc<SharedDict>>>> = OnceLock::new();
static LOCKS: OnceLock<RwLock<HashMap<String, Arc<tokio::sync::Mutex<()>>>>> = OnceLock::new();

/// A named, process-wide `String → String` dictionary.
pub struct SharedDict {
    entries: RwLock<HashMap<String, String>>,
}

impl SharedDict {
    /// Look up (or create) the dictionary registered under `name`.
    pub fn named(name: &str) -> Arc<SharedDict> {
        let registry = DICTS.get_or_init(|| RwLock::new(HashMap::new()));
        if let Some(dict) = registry.read().get(name) {
            return Arc::clone(dict);
        }
        let mut registry = registry.write();
        Arc::clone(registry.entry(name.to_string()).or_insert_with(|| {
            Arc::new(SharedDict {
                entries: RwLock::new(HashMap::new()),
            })
        }))
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: String) {
        self.entries.write().insert(key.to_string(), value);
    }

    pub fn remove(&self, key: &str) {
        self.entries.write().remove(key);
    }
}

/// Look up (or create) the process-wide lock registered under `key`.
///
/// Callers decide the scope through the key they derive: the bootstrap lock
/// uses the cluster name, the refresh lock the configured refresh-lock key.
/// A non-blocking acquisition is `try_lock` on the returned mutex.
pub fn named_lock(key: &str) -> Arc<tokio::sync::Mutex<()>> {
    let registry = LOCKS.get_or_init(|| RwLock::new(HashMap::new()));
    if let Some(lock) = registry.read().get(key) {
        return Arc::clone(lock);
    }
    let mut registry = registry.write();
    Arc::clone(
        registry
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
    )
}

/// Encode a topology as the raw `CLUSTER SLOTS` JSON shape:
/// `[[start, end, [ip, port, id], [ip, port, id]…]…]`.
pub fn encode_topology(ranges: &[RawSlotRange]) -> String {
    let entries: Vec<Value> = ranges
        .iter()
        .map(|range| {
            let mut entry = vec![json!(range.start), json!(range.end)];
            for node in &range.nodes {
                let mut fields = vec![json!(node.ip), json!(node.port)];
                if let Some(id) = &node.id {
                    fields.push(json!(id));
                }
                entry.push(Value::Array(fields));
            }
            Value::Array(entry)
        })
        .collect();
    Value::Array(entries).to_string()
}

/// Decode the JSON produced by [`encode_topology`].
pub fn decode_topology(raw: &str) -> Result<Vec<RawSlotRange>> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| Error::Protocol(format!("undecodable slots info: {e}")))?;
    let entries = value
        .as_array()
        .ok_or_else(|| Error::Protocol("slots info is not an array".into()))?;

    let mut ranges = Vec::with_capacity(entries.len());
    for entry in entries {
        let items = entry
            .as_array()
            .ok_or_else(|| Error::Protocol("slots info entry is not an array".into()))?;
        if items.len() < 3 {
            return Err(Error::Protocol("slots info entry too short".into()));
        }
        let start = decode_slot(&items[0])?;
        let end = decode_slot(&items[1])?;
        let mut nodes = Vec::with_capacity(items.len() - 2);
        for item in &items[2..] {
            nodes.push(decode_node(item)?);
        }
        ranges.push(RawSlotRange { start, end, nodes });
    }
    if ranges.is_empty() {
        return Err(Error::Protocol("slots info is empty".into()));
    }
    Ok(ranges)
}

fn decode_slot(value: &Value) -> Result<u16> {
    value
        .as_u64()
        .filter(|&n| n < 16384)
        .map(|n| n as u16)
        .ok_or_else(|| Error::Protocol(format!("invalid slot number: {value}")))
}

fn decode_node(value: &Value) -> Result<RawNode> {
    let fields = value
        .as_array()
        .ok_or_else(|| Error::Protocol("slots info node is not an array".into()))?;
    if fields.len() < 2 {
        return Err(Error::Protocol("slots info node too short".into()));
    }
    let ip = fields[0]
        .as_str()
        .ok_or_else(|| Error::Protocol("invalid node ip".into()))?
        .to_string();
    let port = fields[1]
        .as_u64()
        .filter(|&p| p <= u16::MAX as u64)
        .map(|p| p as u16)
        .ok_or_else(|| Error::Protocol("invalid node port".into()))?;
    let id = fields.get(2).and_then(|v| v.as_str()).map(str::to_string);
    Ok(RawNode { ip, port, id })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_topology() -> Vec<RawSlotRange> {
        vec![
            RawSlotRange {
                start: 0,
                end: 5460,
                nodes: vec![
                    RawNode { ip: "10.0.0.1".into(), port: 7000, id: Some("aaa".into()) },
                    RawNode { ip: "10.0.0.4".into(), port: 7003, id: Some("ddd".into()) },
                ],
            },
            RawSlotRange {
                start: 5461,
                end: 16383,
                nodes: vec![RawNode { ip: "10.0.0.2".into(), port: 7001, id: None }],
            },
        ]
    }

    #[test]
    fn dicts_are_shared_by_name() {
        let a = SharedDict::named("store_test_dict");
        let b = SharedDict::named("store_test_dict");
        a.set("k", "v".into());
        assert_eq!(b.get("k"), Some("v".to_string()));

        let other = SharedDict::named("store_test_other");
        assert_eq!(other.get("k"), None);

        a.remove("k");
        assert_eq!(b.get("k"), None);
    }

    #[test]
    fn locks_are_shared_by_key() {
        let a = named_lock("store_test_lock");
        let b = named_lock("store_test_lock");
        assert!(Arc::ptr_eq(&a, &b));

        let guard = a.try_lock().unwrap();
        assert!(b.try_lock().is_err());
        drop(guard);
        assert!(b.try_lock().is_ok());
    }

    #[test]
    fn topology_round_trip() {
        let topology = sample_topology();
        let encoded = encode_topology(&topology);
        let decoded = decode_topology(&encoded).unwrap();
        assert_eq!(decoded, topology);
    }

    #[test]
    fn encoded_layout_matches_cluster_slots() {
        let encoded = encode_topology(&sample_topology());
        let value: Value = serde_json::from_str(&encoded).unwrap();
        // [[0, 5460, ["10.0.0.1", 7000, "aaa"], ["10.0.0.4", 7003, "ddd"]], …]
        assert_eq!(value[0][0], json!(0));
        assert_eq!(value[0][1], json!(5460));
        assert_eq!(value[0][2], json!(["10.0.0.1", 7000, "aaa"]));
        assert_eq!(value[1][2], json!(["10.0.0.2", 7001]));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_topology("not json").is_err());
        assert!(decode_topology("{}").is_err());
        assert!(decode_topology("[]").is_err());
        assert!(decode_topology("[[0]]").is_err());
        assert!(decode_topology("[[0, 99999, [\"h\", 1]]]").is_err());
        assert!(decode_topology("[[0, 1, [\"h\"]]]").is_err());
    }
}

//! Tamper evidence: canonical hashing, the per-aggregate event chain, and
//! global block checkpoints.

pub mod blocks;
pub mod events;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Render a JSON value in canonical form: object keys sorted, no
/// whitespace. Two semantically equal payloads always hash identically.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string serializes"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Event hash: SHA256(prev_hash ‖ canonical(event_data)), hex-encoded.
/// The first event in a chain hashes with an empty prefix.
pub fn event_hash(prev_hash: Option<&str>, event_data: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.unwrap_or("").as_bytes());
    hasher.update(canonical_json(event_data).as_bytes());
    hex::encode(hasher.finalize())
}

/// Block hash: SHA256(prev_block_hash ‖ events_hash).
pub fn block_hash(prev_block_hash: Option<&str>, events_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_block_hash.unwrap_or("").as_bytes());
    hasher.update(events_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Incremental SHA-256 over member event hashes, fed in ascending
/// sequence order one batch at a time.
pub struct EventsHasher {
    hasher: Sha256,
    count: i64,
}

impl EventsHasher {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            count: 0,
        }
    }

    pub fn update(&mut self, event_hash: &str) {
        self.hasher.update(event_hash.as_bytes());
        self.count += 1;
    }

    pub fn count(&self) -> i64 {
        self.count
    }

    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl Default for EventsHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let value = json!({"b": 1, "a": {"z": true, "m": [3, {"y": 2, "x": 1}]}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"m":[3,{"x":1,"y":2}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn canonical_json_is_order_insensitive() {
        let a = json!({"amount": 100, "currency": "USD"});
        let b = json!({"currency": "USD", "amount": 100});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(event_hash(None, &a), event_hash(None, &b));
    }

    #[test]
    fn event_hash_chains_on_the_previous_hash() {
        let data = json!({"k": "v"});
        let first = event_hash(None, &data);
        let second = event_hash(Some(&first), &data);
        assert_ne!(first, second);
        // First hash uses an empty prefix, same as hashing the bare payload.
        assert_eq!(first, sha256_hex(canonical_json(&data).as_bytes()));
    }

    #[test]
    fn events_hasher_matches_one_shot_concat() {
        let hashes = ["aa", "bb", "cc"];
        let mut incremental = EventsHasher::new();
        for h in &hashes {
            incremental.update(h);
        }
        assert_eq!(incremental.count(), 3);
        assert_eq!(incremental.finalize(), sha256_hex(b"aabbcc"));
    }

    #[test]
    fn block_hash_binds_predecessor_and_members() {
        let events = sha256_hex(b"members");
        let genesis = block_hash(None, &events);
        let chained = block_hash(Some(&genesis), &events);
        assert_ne!(genesis, chained);
    }
}

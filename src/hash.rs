//! Deterministic content hashing for drift detection.
//!
//! Values are serialized to JSON and written into SHA-256 with object keys
//! sorted at every level, so field order and map iteration order never
//! affect the result. `Option` fields hash by their contents.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::crd::ClusterSpec;
use crate::error::Result;

/// Number of hex characters kept; fits in a label value.
const HASH_LEN: usize = 16;

/// Hash any serializable value.
pub fn compute_hash<T: Serialize>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    let mut hasher = Sha256::new();
    write_canonical(&value, &mut hasher);
    let digest = hex::encode(hasher.finalize());
    Ok(digest[..HASH_LEN].to_string())
}

/// Drift hash of a cluster spec. The pause flag is excluded: pausing is a
/// lifecycle request, not a change to what gets deployed.
pub fn spec_hash(spec: &ClusterSpec) -> Result<String> {
    let mut spec = spec.clone();
    spec.paused = false;
    compute_hash(&spec)
}

fn write_canonical(value: &Value, hasher: &mut Sha256) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for key in keys {
                write_canonical(&Value::String(key.clone()), hasher);
                hasher.update(b":");
                write_canonical(&map[key], hasher);
                hasher.update(b",");
            }
            hasher.update(b"}");
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                write_canonical(item, hasher);
                hasher.update(b",");
            }
            hasher.update(b"]");
        }
        // Scalars use their JSON encoding so "1" and 1 stay distinct.
        scalar => hasher.update(scalar.to_string().as_bytes()),
    }
}

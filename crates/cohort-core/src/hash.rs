//! Stable hashing helpers for cache keys, task-set fingerprints, and framed records.
//!
//! Everything that feeds a content address goes through [`hash_canonical`], which
//! serializes to JSON with object keys sorted at every depth. Two values that differ
//! only in map/field ordering therefore hash identically.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Error;

/// A blake3 digest; rendered as 64 lowercase hex chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        blake3::Hash::from_hex(hex).ok().map(|h| Hash256(*h.as_bytes()))
    }
}

impl std::fmt::Display for Hash256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

pub fn hash_bytes(bytes: &[u8]) -> Hash256 {
    Hash256(*blake3::hash(bytes).as_bytes())
}

/// Hash any serde-serializable value via its plain JSON encoding.
/// Field order follows the type's serialization order; use [`hash_canonical`]
/// for anything that contains maps.
pub fn hash_serde<T: Serialize>(v: &T) -> Result<Hash256, Error> {
    serde_json::to_vec(v)
        .map(|bytes| hash_bytes(&bytes))
        .map_err(Error::from)
}

/// Hash a value after canonicalizing it (object keys sorted recursively).
pub fn hash_canonical<T: Serialize>(v: &T) -> Result<Hash256, Error> {
    let value = canonicalize(serde_json::to_value(v)?);
    Ok(hash_bytes(&serde_json::to_vec(&value)?))
}

/// Rebuild `value` with every object's keys inserted in sorted order.
///
/// serde_json's default map is already ordered, but `preserve_order` may be
/// switched on by any crate in a dependency graph, so sort explicitly.
pub fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = Map::with_capacity(entries.len());
            for (k, v) in entries {
                out.insert(k, canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

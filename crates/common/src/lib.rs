use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Genesis predecessor hash for hash-chained logs: 64 zero hex digits.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug)]
pub enum CanonError {
    Json(serde_json::Error),
}

impl fmt::Display for CanonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanonError::Json(e) => write!(f, "json: {}", e),
        }
    }
}

impl std::error::Error for CanonError {}

impl From<serde_json::Error> for CanonError {
    fn from(value: serde_json::Error) -> Self {
        CanonError::Json(value)
    }
}

/// Lowercase 64-char hex sha256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    hex::encode(h.finalize())
}

/// Serialize a JSON value with object keys sorted recursively and no
/// incidental whitespace. Two structurally equal values always produce the
/// same bytes, whatever order their keys were inserted in.
pub fn canonical_json_bytes(v: &Value) -> Result<Vec<u8>, CanonError> {
    fn canonicalize_value(v: &Value) -> Value {
        match v {
            Value::Object(map) => {
                let mut keys: Vec<_> = map.iter().collect();
                keys.sort_by(|a, b| a.0.cmp(b.0));
                let mut out = serde_json::Map::new();
                for (k, v) in keys {
                    out.insert(k.clone(), canonicalize_value(v));
                }
                Value::Object(out)
            }
            Value::Array(arr) => Value::Array(arr.iter().map(canonicalize_value).collect()),
            _ => v.clone(),
        }
    }

    let canon = canonicalize_value(v);
    Ok(serde_json::to_vec(&canon)?)
}

/// Canonical sha256 of a JSON value: hash of its canonical byte form.
pub fn sha256_of_value(v: &Value) -> Result<String, CanonError> {
    Ok(sha256_hex(&canonical_json_bytes(v)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_bytes_ignore_key_order() {
        let mut a = serde_json::Map::new();
        a.insert("x".to_string(), json!(1));
        a.insert("y".to_string(), json!([{"b": 2, "a": 1}]));
        let mut b = serde_json::Map::new();
        b.insert("y".to_string(), json!([{"a": 1, "b": 2}]));
        b.insert("x".to_string(), json!(1));

        let ba = canonical_json_bytes(&Value::Object(a)).unwrap();
        let bb = canonical_json_bytes(&Value::Object(b)).unwrap();
        assert_eq!(ba, bb);
    }

    #[test]
    fn sha256_is_bare_lowercase_hex() {
        let h = sha256_hex(b"warden");
        assert_eq!(h.len(), 64);
        assert!(h
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn genesis_hash_shape() {
        assert_eq!(GENESIS_HASH.len(), 64);
        assert!(GENESIS_HASH.chars().all(|c| c == '0'));
    }
}

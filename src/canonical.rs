//! Canonical serialization and content hashing.
//!
//! Every provenance hash in the engine goes through this module:
//! - values are lowered to `serde_json::Value`
//! - object keys are emitted in byte-wise sorted order at every depth
//! - arrays keep their order (callers sort them when order is not meaningful)
//! - the resulting string is digested with SHA-256 and hex encoded
//!
//! Two structurally equal values canonicalize to the same string no matter
//! how their maps were built.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum CanonicalError {
    #[error("value is not representable as JSON: {0}")]
    Unrepresentable(#[from] serde_json::Error),
}

/// Render a JSON value with sorted keys and no insignificant whitespace.
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_value(item, out);
            }
            out.push('}');
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    // serde_json escaping: quotes, backslash, control chars as \uXXXX
    out.push_str(&Value::String(s.to_string()).to_string());
}

/// Hex-encoded SHA-256 of a string.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Canonical string of any serializable value.
///
/// Non-finite floats lower to `null`; callers that hash numeric state check
/// finiteness first (see `resolver::check_weight_invariants`).
pub fn canonical_string<T: Serialize + ?Sized>(value: &T) -> Result<String, CanonicalError> {
    let lowered = serde_json::to_value(value)?;
    Ok(canonicalize(&lowered))
}

/// Lower any serializable value to JSON and hash its canonical form.
pub fn canonical_hash<T: Serialize + ?Sized>(value: &T) -> Result<String, CanonicalError> {
    Ok(sha256_hex(&canonical_string(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};

    #[test]
    fn test_key_order_independent() {
        let a = json!({"b": 1, "a": {"y": [1, 2], "x": null}});
        let mut inner = serde_json::Map::new();
        inner.insert("x".to_string(), Value::Null);
        inner.insert("y".to_string(), json!([1, 2]));
        let mut outer = serde_json::Map::new();
        outer.insert("a".to_string(), Value::Object(inner));
        outer.insert("b".to_string(), json!(1));
        assert_eq!(canonicalize(&a), canonicalize(&Value::Object(outer)));
        assert_eq!(canonicalize(&a), r#"{"a":{"x":null,"y":[1,2]},"b":1}"#);
    }

    #[test]
    fn test_hashmap_and_btreemap_agree() {
        let mut h: HashMap<String, f64> = HashMap::new();
        let mut b: BTreeMap<String, f64> = BTreeMap::new();
        for (k, v) in [("zed", 0.5), ("amy", 0.25), ("kim", 0.25)] {
            h.insert(k.to_string(), v);
            b.insert(k.to_string(), v);
        }
        assert_eq!(canonical_hash(&h).unwrap(), canonical_hash(&b).unwrap());
    }

    #[test]
    fn test_array_order_is_significant() {
        let h1 = canonical_hash(&json!([1, 2, 3])).unwrap();
        let h2 = canonical_hash(&json!([3, 2, 1])).unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_string_escaping() {
        let v = json!({"q\"k": "line\nbreak"});
        assert_eq!(canonicalize(&v), r#"{"q\"k":"line\nbreak"}"#);
    }

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(sha256_hex("").len(), 64);
    }
}

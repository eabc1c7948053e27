use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Deterministic serialisation used for content-addressing: object keys
/// sorted recursively by code-point order, arrays in insertion order,
/// numbers in serde_json's shortest round-trip form.
pub fn canonical_json(value: &Value) -> Result<String> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

/// Lowercase hex SHA-256 of the canonical JSON bytes.
pub fn content_hash(value: &Value) -> Result<String> {
    let canon = canonical_json(value)?;
    Ok(hash_bytes(canon.as_bytes()))
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn write_canonical(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => out.push_str(&escape(s)?),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            // UTF-8 byte order equals code-point order.
            entries.sort_by_key(|(k, _)| k.as_bytes());
            out.push('{');
            for (i, (key, val)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&escape(key)?);
                out.push(':');
                write_canonical(val, out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn escape(s: &str) -> Result<String> {
    serde_json::to_string(s).map_err(|e| Error::corruption("json string", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_is_irrelevant() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(canonical_json(&a).unwrap(), canonical_json(&b).unwrap());
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }

    #[test]
    fn nested_objects_sort_recursively() {
        let a = json!({"outer": {"z": [1, 2], "a": null}, "x": true});
        assert_eq!(
            canonical_json(&a).unwrap(),
            r#"{"outer":{"a":null,"z":[1,2]},"x":true}"#
        );
    }

    #[test]
    fn arrays_keep_insertion_order() {
        let a = json!([3, 1, 2]);
        assert_eq!(canonical_json(&a).unwrap(), "[3,1,2]");
    }

    #[test]
    fn numbers_round_trip_shortest_form() {
        let a = json!({"f": 0.1, "i": 42, "neg": -7});
        assert_eq!(canonical_json(&a).unwrap(), r#"{"f":0.1,"i":42,"neg":-7}"#);
    }

    #[test]
    fn strings_are_escaped() {
        let a = json!({"k": "line\nbreak"});
        assert_eq!(canonical_json(&a).unwrap(), r#"{"k":"line\nbreak"}"#);
    }

    #[test]
    fn hash_is_stable() {
        let a = json!({"a": 1});
        assert_eq!(content_hash(&a).unwrap(), content_hash(&a).unwrap());
        assert_eq!(content_hash(&a).unwrap().len(), 64);
    }
}

//! Canonical JSON encoding used for every digest the node computes over
//! a structured value: transaction preimages, sponsor authorization
//! preimages, checkpoint state hashes and chunk payloads all hash the
//! bytes produced here rather than `serde_json`'s default output, so
//! that signatures and digests are stable across serializer versions
//! and languages.

use crate::{BlockchainError, Result};
use serde::Serialize;
use serde_json::Value;

/// Serializes `value` to its canonical byte representation: object keys
/// sorted lexicographically at every nesting level, no insignificant
/// whitespace, and numbers/strings emitted exactly as `serde_json`
/// would for a compact encoding.
///
/// # Errors
///
/// Returns an error if `value` cannot be serialized to JSON.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_value(value)
        .map_err(|e| BlockchainError::SerializationError(e.to_string()))?;
    let sorted = sort_keys(json);
    serde_json::to_vec(&sorted).map_err(|e| BlockchainError::SerializationError(e.to_string()))
}

/// Like [`encode`], but returns the canonical bytes as a lowercase hex
/// string, convenient for embedding in other canonical structures.
///
/// # Errors
///
/// Returns an error if `value` cannot be serialized to JSON.
pub fn encode_hex<T: Serialize>(value: &T) -> Result<String> {
    Ok(hex::encode(encode(value)?))
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> =
                map.into_iter().map(|(k, v)| (k, sort_keys(v))).collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = serde_json::Map::new();
            for (key, val) in entries {
                sorted.insert(key, val);
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Unsorted {
        z: u32,
        a: u32,
        m: Nested,
    }

    #[derive(Serialize)]
    struct Nested {
        y: u32,
        b: u32,
    }

    #[test]
    fn encode_sorts_keys_at_every_level() {
        let value = Unsorted {
            z: 1,
            a: 2,
            m: Nested { y: 3, b: 4 },
        };

        let bytes = encode(&value).unwrap();
        let text = String::from_utf8(bytes).unwrap();

        assert_eq!(text, r#"{"a":2,"m":{"b":4,"y":3},"z":1}"#);
    }

    #[test]
    fn encode_is_deterministic() {
        let value = Unsorted {
            z: 1,
            a: 2,
            m: Nested { y: 3, b: 4 },
        };

        assert_eq!(encode(&value).unwrap(), encode(&value).unwrap());
    }

    #[test]
    fn encode_hex_matches_hex_of_encode() {
        let value = Unsorted {
            z: 1,
            a: 2,
            m: Nested { y: 3, b: 4 },
        };

        assert_eq!(encode_hex(&value).unwrap(), hex::encode(encode(&value).unwrap()));
    }
}

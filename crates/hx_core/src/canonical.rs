//! # Canonical JSON
//!
//! One stable textual form for every payload that feeds a hash.
//!
//! `serde_json`'s default object map is BTree-backed, so any
//! `serde_json::Value` serializes with lexicographically sorted keys. The
//! compact form matches `separators=(",", ":")`; the pretty form is the
//! 2-space-indent rendering used for persisted saves. Re-serializing a parsed
//! payload through either function is idempotent.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Compact, key-sorted canonical form. Every hash input goes through this.
pub fn canonical_string(value: &Value) -> String {
    serde_json::to_string(value).expect("canonical serialization of a Value cannot fail")
}

/// 2-space-indent, key-sorted form for persisted saves.
pub fn pretty_string(value: &Value) -> String {
    serde_json::to_string_pretty(value).expect("canonical serialization of a Value cannot fail")
}

/// Lowercase hex SHA-256.
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// SHA-256 of the canonical form of a payload.
pub fn hash_value(value: &Value) -> String {
    sha256_hex(canonical_string(value).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_regardless_of_insertion_order() {
        let mut map = serde_json::Map::new();
        map.insert("zulu".to_string(), json!(1));
        map.insert("alpha".to_string(), json!(2));
        map.insert("mike".to_string(), json!(3));
        assert_eq!(
            canonical_string(&Value::Object(map)),
            r#"{"alpha":2,"mike":3,"zulu":1}"#
        );
    }

    #[test]
    fn canonical_form_is_idempotent_through_parse() {
        let payload = json!({"b": [1, {"y": 2, "x": 3}], "a": null});
        let first = canonical_string(&payload);
        let reparsed: Value = serde_json::from_str(&first).unwrap();
        assert_eq!(canonical_string(&reparsed), first);
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn pretty_form_round_trips_to_same_value() {
        let payload = json!({"nested": {"k": [1, 2, 3]}, "n": 1.5});
        let pretty = pretty_string(&payload);
        let reparsed: Value = serde_json::from_str(&pretty).unwrap();
        assert_eq!(reparsed, payload);
    }
}

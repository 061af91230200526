//! # JSON param bags
//!
//! Accessors for the free-form `params` objects carried by commands and
//! events. Every accessor is total: shape mismatches yield `None` so that
//! callers can turn them into structured intent rejections instead of
//! panics.

use serde_json::{Map, Value};

/// The object type used for command/event params and rules-state partitions.
///
/// `serde_json`'s default map is BTree-backed, so iteration (and therefore
/// serialization) is always key-sorted - canonical JSON falls out for free.
pub type JsonMap = Map<String, Value>;

/// Non-empty string field.
pub fn get_str<'a>(map: &'a JsonMap, key: &str) -> Option<&'a str> {
    match map.get(key)?.as_str() {
        Some(s) if !s.is_empty() => Some(s),
        _ => None,
    }
}

/// Non-negative integer field.
pub fn get_u64(map: &JsonMap, key: &str) -> Option<u64> {
    map.get(key)?.as_u64()
}

pub fn get_i64(map: &JsonMap, key: &str) -> Option<i64> {
    map.get(key)?.as_i64()
}

pub fn get_f64(map: &JsonMap, key: &str) -> Option<f64> {
    map.get(key)?.as_f64()
}

pub fn get_bool(map: &JsonMap, key: &str) -> Option<bool> {
    map.get(key)?.as_bool()
}

pub fn get_object<'a>(map: &'a JsonMap, key: &str) -> Option<&'a JsonMap> {
    map.get(key)?.as_object()
}

pub fn get_array<'a>(map: &'a JsonMap, key: &str) -> Option<&'a Vec<Value>> {
    map.get(key)?.as_array()
}

/// String list field; non-string elements reject the whole list.
pub fn get_string_list(map: &JsonMap, key: &str) -> Option<Vec<String>> {
    let raw = map.get(key)?.as_array()?;
    let mut out = Vec::with_capacity(raw.len());
    for item in raw {
        out.push(item.as_str()?.to_string());
    }
    Some(out)
}

/// Tags field: defaults to empty, and any non-string entry empties the list.
pub fn tags_or_empty(map: &JsonMap, key: &str) -> Vec<String> {
    match map.get(key) {
        Some(Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(s) => out.push(s.to_string()),
                    None => return Vec::new(),
                }
            }
            out
        }
        _ => Vec::new(),
    }
}

/// Round to 8 decimal places for hash-surface floats.
pub fn round8(value: f64) -> f64 {
    (value * 1e8).round() / 1e8
}

/// JSON number from a rounded float; non-finite values collapse to 0.
pub fn number8(value: f64) -> Value {
    serde_json::Number::from_f64(round8(value))
        .map(Value::Number)
        .unwrap_or_else(|| Value::Number(0.into()))
}

/// Deduplicate while preserving first-seen order, then keep the newest `cap`
/// entries. This is the shared FIFO discipline for action-uid ledgers.
pub fn normalize_uid_fifo(values: &[Value], cap: usize) -> Vec<String> {
    let mut ordered: Vec<String> = Vec::new();
    for raw in values {
        let uid = match raw.as_str() {
            Some(s) if !s.is_empty() => s,
            _ => continue,
        };
        if !ordered.iter().any(|seen| seen == uid) {
            ordered.push(uid.to_string());
        }
    }
    if ordered.len() > cap {
        ordered.drain(..ordered.len() - cap);
    }
    ordered
}

/// Append a uid to a FIFO ledger under the same discipline.
pub fn push_uid_fifo(ledger: &mut Vec<String>, uid: &str, cap: usize) {
    if uid.is_empty() || ledger.iter().any(|seen| seen == uid) {
        return;
    }
    ledger.push(uid.to_string());
    if ledger.len() > cap {
        let excess = ledger.len() - cap;
        ledger.drain(..excess);
    }
}

/// Read a FIFO uid ledger stored under `key` in a rules-state partition.
pub fn uid_ledger(map: &JsonMap, key: &str, cap: usize) -> Vec<String> {
    match map.get(key) {
        Some(Value::Array(values)) => normalize_uid_fifo(values, cap),
        _ => Vec::new(),
    }
}

/// Store a uid ledger back into a rules-state partition.
pub fn set_uid_ledger(map: &mut JsonMap, key: &str, ledger: &[String]) {
    map.insert(
        key.to_string(),
        Value::Array(ledger.iter().map(|uid| Value::String(uid.clone())).collect()),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> JsonMap {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn accessors_reject_shape_mismatch() {
        let params = map(json!({"a": "x", "b": 3, "c": "", "d": true}));
        assert_eq!(get_str(&params, "a"), Some("x"));
        assert_eq!(get_str(&params, "c"), None);
        assert_eq!(get_u64(&params, "b"), Some(3));
        assert_eq!(get_u64(&params, "a"), None);
        assert_eq!(get_bool(&params, "d"), Some(true));
    }

    #[test]
    fn tags_collapse_on_non_string_entries() {
        let params = map(json!({"tags": ["a", "b"], "bad": ["a", 3]}));
        assert_eq!(tags_or_empty(&params, "tags"), vec!["a", "b"]);
        assert!(tags_or_empty(&params, "bad").is_empty());
        assert!(tags_or_empty(&params, "missing").is_empty());
    }

    #[test]
    fn uid_fifo_dedupes_and_caps() {
        let raw = vec![json!("a"), json!("b"), json!("a"), json!(""), json!("c")];
        assert_eq!(normalize_uid_fifo(&raw, 10), vec!["a", "b", "c"]);
        assert_eq!(normalize_uid_fifo(&raw, 2), vec!["b", "c"]);

        let mut ledger = vec!["a".to_string(), "b".to_string()];
        push_uid_fifo(&mut ledger, "c", 2);
        assert_eq!(ledger, vec!["b", "c"]);
        push_uid_fifo(&mut ledger, "c", 2);
        assert_eq!(ledger, vec!["b", "c"]);
    }

    #[test]
    fn round8_is_stable() {
        assert_eq!(round8(0.123456789), 0.12345679);
        assert_eq!(round8(1.0), 1.0);
    }
}

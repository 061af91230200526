//! # Encounter tables
//!
//! `{schema_version, table_id, description?, entries: [{entry_id,
//! weight >= 1, tags?, payload(object)}]}`. Entry ids are unique and entries
//! keep insertion order: the weighted cumulative scan walks them in payload
//! order, so reordering entries changes selection.

use serde_json::Value;

use crate::items::{non_empty_str, string_tags};
use crate::{ContentError, ContentResult, CONTENT_SCHEMA_VERSION};

#[derive(Debug, Clone, PartialEq)]
pub struct EncounterEntry {
    pub entry_id: String,
    pub weight: u64,
    pub tags: Vec<String>,
    pub payload: hx_types::JsonMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncounterTable {
    pub table_id: String,
    pub description: Option<String>,
    pub entries: Vec<EncounterEntry>,
}

impl EncounterTable {
    pub fn total_weight(&self) -> u64 {
        self.entries.iter().map(|entry| entry.weight).sum()
    }

    pub fn from_payload(payload: &Value) -> ContentResult<Self> {
        let root = payload
            .as_object()
            .ok_or_else(|| ContentError::new("encounter table payload must be an object"))?;

        let schema_version = root
            .get("schema_version")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                ContentError::new("encounter table must contain integer field: schema_version")
            })?;
        if schema_version != CONTENT_SCHEMA_VERSION {
            return Err(ContentError::new(format!(
                "unsupported encounter table schema_version: {schema_version}"
            )));
        }

        let table_id = non_empty_str(root.get("table_id"))
            .ok_or_else(|| {
                ContentError::new("encounter table must contain non-empty string field: table_id")
            })?
            .to_string();

        let description = match root.get("description") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => {
                return Err(ContentError::new(
                    "encounter table field description must be a string when present",
                ))
            }
        };

        let rows = root.get("entries").and_then(Value::as_array).ok_or_else(|| {
            ContentError::new("encounter table must contain non-empty list field: entries")
        })?;
        if rows.is_empty() {
            return Err(ContentError::new(
                "encounter table must contain non-empty list field: entries",
            ));
        }

        let mut seen = std::collections::BTreeSet::new();
        let mut entries = Vec::with_capacity(rows.len());
        for (index, row) in rows.iter().enumerate() {
            let row = row
                .as_object()
                .ok_or_else(|| ContentError::new(format!("entries[{index}] must be an object")))?;

            let entry_id = non_empty_str(row.get("entry_id"))
                .ok_or_else(|| {
                    ContentError::new(format!(
                        "entries[{index}] must contain non-empty string field: entry_id"
                    ))
                })?
                .to_string();
            if !seen.insert(entry_id.clone()) {
                return Err(ContentError::new(format!(
                    "duplicate encounter entry_id: {entry_id}"
                )));
            }

            let weight = row
                .get("weight")
                .and_then(Value::as_u64)
                .filter(|w| *w >= 1)
                .ok_or_else(|| {
                    ContentError::new(format!("entries[{index}] must contain integer weight >= 1"))
                })?;

            let tags = string_tags(row.get("tags"), &format!("entries[{index}].tags"))?;

            let payload = row
                .get("payload")
                .and_then(Value::as_object)
                .ok_or_else(|| {
                    ContentError::new(format!("entries[{index}] field payload must be an object"))
                })?
                .clone();

            entries.push(EncounterEntry {
                entry_id,
                weight,
                tags,
                payload,
            });
        }

        Ok(EncounterTable {
            table_id,
            description,
            entries,
        })
    }
}

/// The basic encounter table used by tests and bootstrap saves.
pub fn builtin_basic_table() -> EncounterTable {
    let payload = serde_json::json!({
        "schema_version": 1,
        "table_id": "basic_encounters",
        "description": "Starter wilderness table",
        "entries": [
            {"entry_id": "wolf_pack", "weight": 3, "tags": ["hostile"],
             "payload": {"signal_id": "howls.distant",
                         "actions": [{"action_type": "signal_intent", "template_id": "howls.distant",
                                      "params": {"ttl_ticks": 6}}]}},
            {"entry_id": "merchant_caravan", "weight": 2, "tags": ["neutral"],
             "payload": {"signal_id": "caravan.bells"}},
            {"entry_id": "strange_lights", "weight": 1, "tags": ["omen"],
             "payload": {"actions": [{"action_type": "track_intent", "template_id": "tracks.scorched",
                                      "params": {"ttl_ticks": 12}}]}}
        ]
    });
    EncounterTable::from_payload(&payload).expect("builtin encounter payload is valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtin_table_keeps_insertion_order() {
        let table = builtin_basic_table();
        let ids: Vec<&str> = table.entries.iter().map(|e| e.entry_id.as_str()).collect();
        assert_eq!(ids, vec!["wolf_pack", "merchant_caravan", "strange_lights"]);
        assert_eq!(table.total_weight(), 6);
    }

    #[test]
    fn duplicate_entry_id_rejected() {
        let payload = json!({
            "schema_version": 1,
            "table_id": "t",
            "entries": [
                {"entry_id": "a", "weight": 1, "payload": {}},
                {"entry_id": "a", "weight": 2, "payload": {}}
            ]
        });
        assert!(EncounterTable::from_payload(&payload).is_err());
    }

    #[test]
    fn zero_weight_rejected() {
        let payload = json!({
            "schema_version": 1,
            "table_id": "t",
            "entries": [{"entry_id": "a", "weight": 0, "payload": {}}]
        });
        assert!(EncounterTable::from_payload(&payload).is_err());
    }

    #[test]
    fn empty_entries_rejected() {
        let payload = json!({"schema_version": 1, "table_id": "t", "entries": []});
        assert!(EncounterTable::from_payload(&payload).is_err());
    }
}

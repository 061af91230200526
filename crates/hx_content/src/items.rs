//! # Item registry
//!
//! `{schema_version, items: [{item_id, name, stackable, unit_mass, tags?}]}`.
//! Only stackable items exist at this schema version.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::{ContentError, ContentResult, CONTENT_SCHEMA_VERSION};

#[derive(Debug, Clone, PartialEq)]
pub struct ItemDef {
    pub item_id: String,
    pub name: String,
    pub stackable: bool,
    pub unit_mass: f64,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ItemRegistry {
    pub items: Vec<ItemDef>,
}

impl ItemRegistry {
    pub fn by_id(&self) -> BTreeMap<&str, &ItemDef> {
        self.items
            .iter()
            .map(|item| (item.item_id.as_str(), item))
            .collect()
    }

    pub fn item_ids(&self) -> std::collections::BTreeSet<String> {
        self.items.iter().map(|item| item.item_id.clone()).collect()
    }

    pub fn from_payload(payload: &Value) -> ContentResult<Self> {
        let root = payload
            .as_object()
            .ok_or_else(|| ContentError::new("item registry payload must be an object"))?;

        let schema_version = root
            .get("schema_version")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                ContentError::new("item registry must contain integer field: schema_version")
            })?;
        if schema_version != CONTENT_SCHEMA_VERSION {
            return Err(ContentError::new(format!(
                "unsupported item registry schema_version: {schema_version}"
            )));
        }

        let rows = root
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| ContentError::new("item registry must contain list field: items"))?;

        let mut seen = std::collections::BTreeSet::new();
        let mut items = Vec::with_capacity(rows.len());
        for (index, row) in rows.iter().enumerate() {
            let row = row
                .as_object()
                .ok_or_else(|| ContentError::new(format!("items[{index}] must be an object")))?;

            let item_id = non_empty_str(row.get("item_id"))
                .ok_or_else(|| {
                    ContentError::new(format!("items[{index}].item_id must be a non-empty string"))
                })?
                .to_string();
            if !seen.insert(item_id.clone()) {
                return Err(ContentError::new(format!("duplicate item_id: {item_id}")));
            }

            let name = non_empty_str(row.get("name"))
                .ok_or_else(|| {
                    ContentError::new(format!("items[{index}].name must be a non-empty string"))
                })?
                .to_string();

            if row.get("stackable").and_then(Value::as_bool) != Some(true) {
                return Err(ContentError::new(format!(
                    "items[{index}].stackable must be true at this schema version"
                )));
            }

            let unit_mass = row
                .get("unit_mass")
                .and_then(Value::as_f64)
                .ok_or_else(|| {
                    ContentError::new(format!("items[{index}].unit_mass must be numeric"))
                })?;
            if unit_mass < 0.0 {
                return Err(ContentError::new(format!(
                    "items[{index}].unit_mass must be >= 0"
                )));
            }

            let tags = string_tags(row.get("tags"), &format!("items[{index}].tags"))?;

            items.push(ItemDef {
                item_id,
                name,
                stackable: true,
                unit_mass,
                tags,
            });
        }

        items.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        Ok(ItemRegistry { items })
    }
}

pub(crate) fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    match value?.as_str() {
        Some(s) if !s.is_empty() => Some(s),
        _ => None,
    }
}

pub(crate) fn string_tags(value: Option<&Value>, field: &str) -> ContentResult<Vec<String>> {
    let mut tags = Vec::new();
    match value {
        None => {}
        Some(Value::Array(rows)) => {
            for (index, row) in rows.iter().enumerate() {
                let tag = row.as_str().filter(|s| !s.is_empty()).ok_or_else(|| {
                    ContentError::new(format!("{field}[{index}] must be a non-empty string"))
                })?;
                if !tags.iter().any(|seen: &String| seen == tag) {
                    tags.push(tag.to_string());
                }
            }
        }
        Some(_) => {
            return Err(ContentError::new(format!(
                "{field} must be a list when present"
            )))
        }
    }
    tags.sort();
    Ok(tags)
}

/// The basic item set used by tests and bootstrap saves.
pub fn builtin_basic_items() -> ItemRegistry {
    let payload = serde_json::json!({
        "schema_version": 1,
        "items": [
            {"item_id": "rations", "name": "Rations", "stackable": true, "unit_mass": 0.5, "tags": ["food"]},
            {"item_id": "scrap_iron", "name": "Scrap Iron", "stackable": true, "unit_mass": 2.0, "tags": ["material"]},
            {"item_id": "torch", "name": "Torch", "stackable": true, "unit_mass": 1.0, "tags": ["light"]},
            {"item_id": "waterskin", "name": "Waterskin", "stackable": true, "unit_mass": 1.5, "tags": ["food"]}
        ]
    });
    ItemRegistry::from_payload(&payload).expect("builtin item payload is valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtin_items_load_sorted() {
        let registry = builtin_basic_items();
        let ids: Vec<&str> = registry.items.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(ids, vec!["rations", "scrap_iron", "torch", "waterskin"]);
        assert!(registry.by_id().contains_key("torch"));
    }

    #[test]
    fn duplicate_item_id_rejected() {
        let payload = json!({
            "schema_version": 1,
            "items": [
                {"item_id": "torch", "name": "Torch", "stackable": true, "unit_mass": 1.0},
                {"item_id": "torch", "name": "Torch Again", "stackable": true, "unit_mass": 1.0}
            ]
        });
        let err = ItemRegistry::from_payload(&payload).unwrap_err();
        assert!(err.to_string().contains("duplicate item_id"));
    }

    #[test]
    fn non_stackable_rejected() {
        let payload = json!({
            "schema_version": 1,
            "items": [{"item_id": "anvil", "name": "Anvil", "stackable": false, "unit_mass": 40.0}]
        });
        assert!(ItemRegistry::from_payload(&payload).is_err());
    }

    #[test]
    fn wrong_schema_version_rejected() {
        let payload = json!({"schema_version": 2, "items": []});
        assert!(ItemRegistry::from_payload(&payload).is_err());
    }
}

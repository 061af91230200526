//! # Supply profiles
//!
//! `{schema_version, profiles: [{profile_id, consumes: [{item_id,
//! quantity > 0, interval_ticks > 0}]}]}`. Item ids within one profile are
//! distinct; profiles and consume lines normalize to sorted order.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::items::non_empty_str;
use crate::{ContentError, ContentResult, CONTENT_SCHEMA_VERSION};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupplyConsumeDef {
    pub item_id: String,
    pub quantity: u64,
    pub interval_ticks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupplyProfileDef {
    pub profile_id: String,
    pub consumes: Vec<SupplyConsumeDef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SupplyProfileRegistry {
    pub profiles: Vec<SupplyProfileDef>,
}

impl SupplyProfileRegistry {
    pub fn by_id(&self) -> BTreeMap<&str, &SupplyProfileDef> {
        self.profiles
            .iter()
            .map(|profile| (profile.profile_id.as_str(), profile))
            .collect()
    }

    pub fn from_payload(payload: &Value) -> ContentResult<Self> {
        let root = payload
            .as_object()
            .ok_or_else(|| ContentError::new("supply profile payload must be an object"))?;

        let schema_version = root
            .get("schema_version")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                ContentError::new("supply profile payload must contain integer field: schema_version")
            })?;
        if schema_version != CONTENT_SCHEMA_VERSION {
            return Err(ContentError::new(format!(
                "unsupported supply profile schema_version: {schema_version}"
            )));
        }

        let rows = root.get("profiles").and_then(Value::as_array).ok_or_else(|| {
            ContentError::new("supply profile payload must contain list field: profiles")
        })?;

        let mut seen = std::collections::BTreeSet::new();
        let mut profiles = Vec::with_capacity(rows.len());
        for (index, row) in rows.iter().enumerate() {
            let row = row
                .as_object()
                .ok_or_else(|| ContentError::new(format!("profiles[{index}] must be an object")))?;

            let profile_id = non_empty_str(row.get("profile_id"))
                .ok_or_else(|| {
                    ContentError::new(format!(
                        "profiles[{index}].profile_id must be a non-empty string"
                    ))
                })?
                .to_string();
            if !seen.insert(profile_id.clone()) {
                return Err(ContentError::new(format!(
                    "duplicate supply profile_id: {profile_id}"
                )));
            }

            let consume_rows = row.get("consumes").and_then(Value::as_array).ok_or_else(|| {
                ContentError::new(format!("profiles[{index}].consumes must be a non-empty list"))
            })?;
            if consume_rows.is_empty() {
                return Err(ContentError::new(format!(
                    "profiles[{index}].consumes must be a non-empty list"
                )));
            }

            let mut seen_items = std::collections::BTreeSet::new();
            let mut consumes = Vec::with_capacity(consume_rows.len());
            for (consume_index, consume_row) in consume_rows.iter().enumerate() {
                let consume_row = consume_row.as_object().ok_or_else(|| {
                    ContentError::new(format!(
                        "profiles[{index}].consumes[{consume_index}] must be an object"
                    ))
                })?;

                let item_id = non_empty_str(consume_row.get("item_id"))
                    .ok_or_else(|| {
                        ContentError::new(format!(
                            "profiles[{index}].consumes[{consume_index}].item_id must be a non-empty string"
                        ))
                    })?
                    .to_string();
                if !seen_items.insert(item_id.clone()) {
                    return Err(ContentError::new(format!(
                        "profiles[{index}] duplicate consumes.item_id: {item_id}"
                    )));
                }

                let quantity = consume_row
                    .get("quantity")
                    .and_then(Value::as_u64)
                    .filter(|q| *q > 0)
                    .ok_or_else(|| {
                        ContentError::new(format!(
                            "profiles[{index}].consumes[{consume_index}].quantity must be integer > 0"
                        ))
                    })?;

                let interval_ticks = consume_row
                    .get("interval_ticks")
                    .and_then(Value::as_u64)
                    .filter(|i| *i > 0)
                    .ok_or_else(|| {
                        ContentError::new(format!(
                            "profiles[{index}].consumes[{consume_index}].interval_ticks must be integer > 0"
                        ))
                    })?;

                consumes.push(SupplyConsumeDef {
                    item_id,
                    quantity,
                    interval_ticks,
                });
            }

            consumes.sort_by(|a, b| a.item_id.cmp(&b.item_id));
            profiles.push(SupplyProfileDef {
                profile_id,
                consumes,
            });
        }

        profiles.sort_by(|a, b| a.profile_id.cmp(&b.profile_id));
        Ok(SupplyProfileRegistry { profiles })
    }
}

/// The traveler profile used by tests and bootstrap saves.
pub fn builtin_traveler_profiles() -> SupplyProfileRegistry {
    let payload = serde_json::json!({
        "schema_version": 1,
        "profiles": [
            {
                "profile_id": "traveler",
                "consumes": [
                    {"item_id": "rations", "quantity": 1, "interval_ticks": 240},
                    {"item_id": "torch", "quantity": 1, "interval_ticks": 120}
                ]
            }
        ]
    });
    SupplyProfileRegistry::from_payload(&payload).expect("builtin supply payload is valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtin_profile_normalizes_sorted() {
        let registry = builtin_traveler_profiles();
        let profile = registry.by_id()["traveler"];
        let items: Vec<&str> = profile.consumes.iter().map(|c| c.item_id.as_str()).collect();
        assert_eq!(items, vec!["rations", "torch"]);
    }

    #[test]
    fn duplicate_consume_item_rejected() {
        let payload = json!({
            "schema_version": 1,
            "profiles": [{
                "profile_id": "p",
                "consumes": [
                    {"item_id": "torch", "quantity": 1, "interval_ticks": 10},
                    {"item_id": "torch", "quantity": 2, "interval_ticks": 20}
                ]
            }]
        });
        assert!(SupplyProfileRegistry::from_payload(&payload).is_err());
    }

    #[test]
    fn zero_quantity_rejected() {
        let payload = json!({
            "schema_version": 1,
            "profiles": [{
                "profile_id": "p",
                "consumes": [{"item_id": "torch", "quantity": 0, "interval_ticks": 10}]
            }]
        });
        assert!(SupplyProfileRegistry::from_payload(&payload).is_err());
    }
}

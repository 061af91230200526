//! # Payload schemas
//!
//! Structural validation for world-map and save payloads. Validation runs
//! before any state is constructed; a rejection mutates nothing.

use serde_json::Value;

use crate::{ContentError, ContentResult, CONTENT_SCHEMA_VERSION};

pub const VALID_SITE_TYPES: [&str; 3] = ["none", "town", "dungeon"];
pub const VALID_TOPOLOGY_TYPES: [&str; 3] = ["custom", "hex_disk", "hex_rectangle"];

/// Validate a world-map payload (`schema_version`, `world_hash`,
/// `topology_type`, `topology_params`, `hexes`, optional space/record maps).
pub fn validate_world_payload(payload: &Value) -> ContentResult<()> {
    let root = payload
        .as_object()
        .ok_or_else(|| ContentError::new("world payload must be an object"))?;

    check_schema_version(root, "world")?;

    if crate::items::non_empty_str(root.get("world_hash")).is_none() {
        return Err(ContentError::new(
            "world payload must contain string field: world_hash",
        ));
    }

    let topology_type = root
        .get("topology_type")
        .and_then(Value::as_str)
        .ok_or_else(|| ContentError::new("world payload must contain string field: topology_type"))?;
    if !VALID_TOPOLOGY_TYPES.contains(&topology_type) {
        return Err(ContentError::new(format!(
            "unsupported topology_type: {topology_type}"
        )));
    }

    if root.get("topology_params").and_then(Value::as_object).is_none() {
        return Err(ContentError::new(
            "world payload must contain object field: topology_params",
        ));
    }

    let hexes = root
        .get("hexes")
        .and_then(Value::as_array)
        .ok_or_else(|| ContentError::new("world payload must contain a list field: hexes"))?;

    for (index, row) in hexes.iter().enumerate() {
        let row = row
            .as_object()
            .ok_or_else(|| ContentError::new(format!("hex row {index} must be an object")))?;

        let coord = row
            .get("coord")
            .and_then(Value::as_object)
            .ok_or_else(|| ContentError::new(format!("hex row {index} missing coord or record")))?;
        if !coord.contains_key("q") || !coord.contains_key("r") {
            return Err(ContentError::new(format!("hex row {index} invalid coord")));
        }

        let record = row
            .get("record")
            .and_then(Value::as_object)
            .ok_or_else(|| ContentError::new(format!("hex row {index} missing coord or record")))?;

        for field in ["terrain_type", "site_type", "metadata"] {
            if !record.contains_key(field) {
                return Err(ContentError::new(format!(
                    "hex row {index} missing record field: {field}"
                )));
            }
        }

        let site_type = record.get("site_type").and_then(Value::as_str).unwrap_or("");
        if !VALID_SITE_TYPES.contains(&site_type) {
            return Err(ContentError::new(format!(
                "hex row {index} invalid site_type: {site_type}"
            )));
        }

        if record.get("metadata").and_then(Value::as_object).is_none() {
            return Err(ContentError::new(format!(
                "hex row {index} metadata must be object"
            )));
        }
    }

    Ok(())
}

/// Validate a save payload (`schema_version`, `save_hash`, `world_state`,
/// `simulation_state`, `input_log`, optional `metadata`).
pub fn validate_save_payload(payload: &Value) -> ContentResult<()> {
    let root = payload
        .as_object()
        .ok_or_else(|| ContentError::new("save payload must be an object"))?;

    check_schema_version(root, "save")?;

    if crate::items::non_empty_str(root.get("save_hash")).is_none() {
        return Err(ContentError::new(
            "save payload must contain string field: save_hash",
        ));
    }
    if root.get("world_state").and_then(Value::as_object).is_none() {
        return Err(ContentError::new(
            "save payload must contain object field: world_state",
        ));
    }
    if root.get("simulation_state").and_then(Value::as_object).is_none() {
        return Err(ContentError::new(
            "save payload must contain object field: simulation_state",
        ));
    }
    if root.get("input_log").and_then(Value::as_array).is_none() {
        return Err(ContentError::new(
            "save payload must contain list field: input_log",
        ));
    }
    if let Some(metadata) = root.get("metadata") {
        if !metadata.is_object() {
            return Err(ContentError::new(
                "save payload field metadata must be an object when present",
            ));
        }
    }

    Ok(())
}

fn check_schema_version(root: &hx_types::JsonMap, kind: &str) -> ContentResult<()> {
    let schema_version = root
        .get("schema_version")
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            ContentError::new(format!(
                "{kind} payload must contain integer field: schema_version"
            ))
        })?;
    if schema_version != CONTENT_SCHEMA_VERSION {
        return Err(ContentError::new(format!(
            "unsupported schema_version: {schema_version}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_world() -> Value {
        json!({
            "schema_version": 1,
            "world_hash": "abc",
            "topology_type": "hex_disk",
            "topology_params": {"radius": 2},
            "hexes": [
                {"coord": {"q": 0, "r": 0},
                 "record": {"terrain_type": "plains", "site_type": "none", "metadata": {}}}
            ]
        })
    }

    #[test]
    fn minimal_world_validates() {
        assert!(validate_world_payload(&minimal_world()).is_ok());
    }

    #[test]
    fn bad_site_type_rejected() {
        let mut payload = minimal_world();
        payload["hexes"][0]["record"]["site_type"] = json!("volcano");
        let err = validate_world_payload(&payload).unwrap_err();
        assert!(err.to_string().contains("invalid site_type"));
    }

    #[test]
    fn unsupported_topology_rejected() {
        let mut payload = minimal_world();
        payload["topology_type"] = json!("voronoi");
        assert!(validate_world_payload(&payload).is_err());
    }

    #[test]
    fn save_payload_shape_checked() {
        let payload = json!({
            "schema_version": 1,
            "save_hash": "abc",
            "world_state": {},
            "simulation_state": {},
            "input_log": []
        });
        assert!(validate_save_payload(&payload).is_ok());

        let payload = json!({
            "schema_version": 1,
            "save_hash": "abc",
            "world_state": {},
            "simulation_state": {},
            "input_log": [],
            "metadata": "not-an-object"
        });
        assert!(validate_save_payload(&payload).is_err());
    }
}

//! # Local arena templates
//!
//! Structural templates applied to lazily-created tactical spaces.
//! `{schema_version, templates: [{template_id, topology_type="square_grid",
//! topology_params{width>0, height>0, ...}, role="local", anchors, doors,
//! interactables, metadata}], default_template_id}`.
//!
//! Template payloads are integer-only: float values anywhere in a template
//! reject the whole registry, keeping applied arenas on the content-addressed
//! hash surface.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::items::non_empty_str;
use crate::{ContentError, ContentResult, CONTENT_SCHEMA_VERSION};

pub const SUPPORTED_ARENA_TOPOLOGY: &str = "square_grid";
pub const LOCAL_ROLE: &str = "local";

#[derive(Debug, Clone, PartialEq)]
pub struct ArenaAnchor {
    pub anchor_id: String,
    pub coord_x: i64,
    pub coord_y: i64,
    pub tags: Vec<String>,
    pub metadata: hx_types::JsonMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalArenaTemplate {
    pub template_id: String,
    pub topology_type: String,
    pub topology_params: hx_types::JsonMap,
    pub role: String,
    pub anchors: Vec<ArenaAnchor>,
    pub doors: Vec<hx_types::JsonMap>,
    pub interactables: Vec<hx_types::JsonMap>,
    pub metadata: hx_types::JsonMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalArenaTemplateRegistry {
    pub templates: Vec<LocalArenaTemplate>,
    pub default_template_id: String,
}

impl LocalArenaTemplateRegistry {
    pub fn by_id(&self) -> BTreeMap<&str, &LocalArenaTemplate> {
        self.templates
            .iter()
            .map(|template| (template.template_id.as_str(), template))
            .collect()
    }

    pub fn from_payload(payload: &Value) -> ContentResult<Self> {
        let root = payload
            .as_object()
            .ok_or_else(|| ContentError::new("local arena templates payload must be an object"))?;

        let schema_version = root
            .get("schema_version")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                ContentError::new(
                    "local arena templates must contain integer field: schema_version",
                )
            })?;
        if schema_version != CONTENT_SCHEMA_VERSION {
            return Err(ContentError::new(format!(
                "unsupported local arena templates schema_version: {schema_version}"
            )));
        }

        let rows = root.get("templates").and_then(Value::as_array).ok_or_else(|| {
            ContentError::new("local arena templates must contain non-empty list field: templates")
        })?;
        if rows.is_empty() {
            return Err(ContentError::new(
                "local arena templates must contain non-empty list field: templates",
            ));
        }

        let mut seen = std::collections::BTreeSet::new();
        let mut templates = Vec::with_capacity(rows.len());
        for (index, row) in rows.iter().enumerate() {
            templates.push(template_from_row(index, row, &mut seen)?);
        }
        templates.sort_by(|a, b| a.template_id.cmp(&b.template_id));

        let default_template_id = non_empty_str(root.get("default_template_id"))
            .ok_or_else(|| {
                ContentError::new(
                    "local arena templates must contain non-empty string field: default_template_id",
                )
            })?
            .to_string();
        if !seen.contains(&default_template_id) {
            return Err(ContentError::new(format!(
                "default_template_id references unknown template: {default_template_id}"
            )));
        }

        Ok(LocalArenaTemplateRegistry {
            templates,
            default_template_id,
        })
    }
}

fn template_from_row(
    index: usize,
    row: &Value,
    seen: &mut std::collections::BTreeSet<String>,
) -> ContentResult<LocalArenaTemplate> {
    let row = row
        .as_object()
        .ok_or_else(|| ContentError::new(format!("templates[{index}] must be an object")))?;

    let template_id = non_empty_str(row.get("template_id"))
        .ok_or_else(|| {
            ContentError::new(format!(
                "templates[{index}] must contain non-empty string field: template_id"
            ))
        })?
        .to_string();
    if !seen.insert(template_id.clone()) {
        return Err(ContentError::new(format!(
            "duplicate local arena template_id: {template_id}"
        )));
    }

    let topology_type = non_empty_str(row.get("topology_type"))
        .ok_or_else(|| {
            ContentError::new(format!(
                "templates[{index}] must contain non-empty string field: topology_type"
            ))
        })?
        .to_string();
    if topology_type != SUPPORTED_ARENA_TOPOLOGY {
        return Err(ContentError::new(format!(
            "templates[{index}] unsupported topology_type: {topology_type}"
        )));
    }

    let topology_params = row
        .get("topology_params")
        .and_then(Value::as_object)
        .ok_or_else(|| {
            ContentError::new(format!(
                "templates[{index}] field topology_params must be an object"
            ))
        })?
        .clone();
    reject_floats(
        &Value::Object(topology_params.clone()),
        &format!("templates[{index}].topology_params"),
    )?;
    for dimension in ["width", "height"] {
        let value = topology_params
            .get(dimension)
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if value == 0 {
            return Err(ContentError::new(format!(
                "templates[{index}].topology_params.{dimension} must be integer > 0"
            )));
        }
    }

    if row.get("role").and_then(Value::as_str) != Some(LOCAL_ROLE) {
        return Err(ContentError::new(format!(
            "templates[{index}] role must be 'local'"
        )));
    }

    let mut anchors = Vec::new();
    let mut seen_anchor_ids = std::collections::BTreeSet::new();
    if let Some(rows) = row.get("anchors") {
        let rows = rows.as_array().ok_or_else(|| {
            ContentError::new(format!(
                "templates[{index}] field anchors must be a list when present"
            ))
        })?;
        for (anchor_index, anchor) in rows.iter().enumerate() {
            let field = format!("templates[{index}].anchors[{anchor_index}]");
            let anchor = anchor
                .as_object()
                .ok_or_else(|| ContentError::new(format!("{field} must be an object")))?;
            let anchor_id = non_empty_str(anchor.get("anchor_id"))
                .ok_or_else(|| {
                    ContentError::new(format!("{field}.anchor_id must be non-empty string"))
                })?
                .to_string();
            if !seen_anchor_ids.insert(anchor_id.clone()) {
                return Err(ContentError::new(format!(
                    "templates[{index}] duplicate anchor_id: {anchor_id}"
                )));
            }
            let coord = anchor
                .get("coord")
                .and_then(Value::as_object)
                .ok_or_else(|| ContentError::new(format!("{field}.coord must be an object")))?;
            let coord_x = coord
                .get("x")
                .and_then(Value::as_i64)
                .ok_or_else(|| ContentError::new(format!("{field}.coord.x must be an integer")))?;
            let coord_y = coord
                .get("y")
                .and_then(Value::as_i64)
                .ok_or_else(|| ContentError::new(format!("{field}.coord.y must be an integer")))?;
            let tags = crate::items::string_tags(anchor.get("tags"), &format!("{field}.tags"))?;
            let metadata = anchor
                .get("metadata")
                .map(|value| {
                    reject_floats(value, &format!("{field}.metadata"))?;
                    value.as_object().cloned().ok_or_else(|| {
                        ContentError::new(format!("{field}.metadata must be an object"))
                    })
                })
                .transpose()?
                .unwrap_or_default();
            anchors.push(ArenaAnchor {
                anchor_id,
                coord_x,
                coord_y,
                tags,
                metadata,
            });
        }
    }
    anchors.sort_by(|a, b| a.anchor_id.cmp(&b.anchor_id));

    let doors = structural_rows(row.get("doors"), index, "doors", "door_id")?;
    let interactables = structural_rows(row.get("interactables"), index, "interactables", "interactable_id")?;

    let metadata = row
        .get("metadata")
        .map(|value| {
            reject_floats(value, &format!("templates[{index}].metadata"))?;
            value.as_object().cloned().ok_or_else(|| {
                ContentError::new(format!("templates[{index}].metadata must be an object"))
            })
        })
        .transpose()?
        .unwrap_or_default();

    Ok(LocalArenaTemplate {
        template_id,
        topology_type,
        topology_params,
        role: LOCAL_ROLE.to_string(),
        anchors,
        doors,
        interactables,
        metadata,
    })
}

fn structural_rows(
    value: Option<&Value>,
    index: usize,
    field: &str,
    id_field: &str,
) -> ContentResult<Vec<hx_types::JsonMap>> {
    let mut out = Vec::new();
    let Some(value) = value else {
        return Ok(out);
    };
    let rows = value.as_array().ok_or_else(|| {
        ContentError::new(format!(
            "templates[{index}] field {field} must be a list when present"
        ))
    })?;
    let mut seen = std::collections::BTreeSet::new();
    for (row_index, row) in rows.iter().enumerate() {
        let map = row.as_object().ok_or_else(|| {
            ContentError::new(format!("templates[{index}].{field}[{row_index}] must be an object"))
        })?;
        let row_id = non_empty_str(map.get(id_field)).ok_or_else(|| {
            ContentError::new(format!(
                "templates[{index}].{field}[{row_index}].{id_field} must be non-empty string"
            ))
        })?;
        if !seen.insert(row_id.to_string()) {
            return Err(ContentError::new(format!(
                "templates[{index}] duplicate {id_field}: {row_id}"
            )));
        }
        reject_floats(row, &format!("templates[{index}].{field}[{row_index}]"))?;
        out.push(map.clone());
    }
    out.sort_by(|a, b| {
        let a_id = a.get(id_field).and_then(Value::as_str).unwrap_or("");
        let b_id = b.get(id_field).and_then(Value::as_str).unwrap_or("");
        a_id.cmp(b_id)
    });
    Ok(out)
}

fn reject_floats(value: &Value, field: &str) -> ContentResult<()> {
    match value {
        Value::Number(n) if !n.is_i64() && !n.is_u64() => Err(ContentError::new(format!(
            "{field} must not contain float values"
        ))),
        Value::Array(items) => {
            for item in items {
                reject_floats(item, field)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for nested in map.values() {
                reject_floats(nested, field)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// The default arena set used by tests and bootstrap saves.
pub fn builtin_default_arenas() -> LocalArenaTemplateRegistry {
    let payload = serde_json::json!({
        "schema_version": 1,
        "default_template_id": "clearing_10x10",
        "templates": [
            {
                "template_id": "clearing_10x10",
                "topology_type": "square_grid",
                "topology_params": {"width": 10, "height": 10, "origin": {"x": 0, "y": 0}},
                "role": "local",
                "anchors": [
                    {"anchor_id": "entry", "coord": {"x": 0, "y": 0}, "tags": ["entry"]}
                ],
                "doors": [],
                "interactables": [],
                "metadata": {"biome": "clearing"}
            }
        ]
    });
    LocalArenaTemplateRegistry::from_payload(&payload).expect("builtin arena payload is valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtin_registry_resolves_default() {
        let registry = builtin_default_arenas();
        assert_eq!(registry.default_template_id, "clearing_10x10");
        let template = registry.by_id()["clearing_10x10"];
        assert_eq!(template.anchors[0].anchor_id, "entry");
        assert_eq!(template.role, "local");
    }

    #[test]
    fn float_in_template_rejected() {
        let payload = json!({
            "schema_version": 1,
            "default_template_id": "t",
            "templates": [{
                "template_id": "t",
                "topology_type": "square_grid",
                "topology_params": {"width": 4, "height": 4, "drift": 0.5},
                "role": "local"
            }]
        });
        let err = LocalArenaTemplateRegistry::from_payload(&payload).unwrap_err();
        assert!(err.to_string().contains("float"));
    }

    #[test]
    fn unknown_default_rejected() {
        let payload = json!({
            "schema_version": 1,
            "default_template_id": "missing",
            "templates": [{
                "template_id": "t",
                "topology_type": "square_grid",
                "topology_params": {"width": 4, "height": 4},
                "role": "local"
            }]
        });
        assert!(LocalArenaTemplateRegistry::from_payload(&payload).is_err());
    }

    #[test]
    fn non_local_role_rejected() {
        let payload = json!({
            "schema_version": 1,
            "default_template_id": "t",
            "templates": [{
                "template_id": "t",
                "topology_type": "square_grid",
                "topology_params": {"width": 4, "height": 4},
                "role": "campaign"
            }]
        });
        assert!(LocalArenaTemplateRegistry::from_payload(&payload).is_err());
    }
}

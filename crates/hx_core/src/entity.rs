//! # Entities
//!
//! Continuous-position actors. An entity lives in exactly one space; its
//! discrete cell is derived from the continuous position through that
//! space's topology.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use hx_api::{EngineError, SimResult};
use hx_types::{
    axial_to_world_xy, json, world_xy_to_axial, HexCoord, JsonMap, Tick,
    DEFAULT_OVERWORLD_SPACE_ID,
};

use crate::MAX_WOUNDS;

pub const DEFAULT_SPEED_PER_TICK: f64 = 0.15;

/// One wound entry in an entity's bounded FIFO wound list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wound {
    pub region: String,
    pub severity: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    pub inflicted_tick: Tick,
    pub source: Option<String>,
}

/// A simulated actor.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityState {
    pub entity_id: String,
    pub position_x: f64,
    pub position_y: f64,
    pub speed_per_tick: f64,
    pub move_input_x: f64,
    pub move_input_y: f64,
    pub target_position: Option<(f64, f64)>,
    pub space_id: String,
    pub facing: u8,
    pub cooldown_until_tick: Tick,
    pub wounds: Vec<Wound>,
    pub stats: JsonMap,
    pub template_id: Option<String>,
    pub source_action_uid: Option<String>,
    pub inventory_container_id: Option<String>,
    pub supply_profile_id: Option<String>,
    pub selected_entity_id: Option<String>,
}

impl EntityState {
    pub fn new(entity_id: impl Into<String>, position_x: f64, position_y: f64) -> Self {
        EntityState {
            entity_id: entity_id.into(),
            position_x,
            position_y,
            speed_per_tick: DEFAULT_SPEED_PER_TICK,
            move_input_x: 0.0,
            move_input_y: 0.0,
            target_position: None,
            space_id: DEFAULT_OVERWORLD_SPACE_ID.to_string(),
            facing: 0,
            cooldown_until_tick: Tick::ZERO,
            wounds: Vec::new(),
            stats: JsonMap::new(),
            template_id: None,
            source_action_uid: None,
            inventory_container_id: None,
            supply_profile_id: None,
            selected_entity_id: None,
        }
    }

    pub fn from_hex(entity_id: impl Into<String>, hex_coord: HexCoord) -> Self {
        let (x, y) = axial_to_world_xy(hex_coord);
        EntityState::new(entity_id, x, y)
    }

    /// Nearest overworld hex for the continuous position.
    pub fn hex_coord(&self) -> HexCoord {
        world_xy_to_axial(self.position_x, self.position_y)
    }

    pub fn world_xy(&self) -> (f64, f64) {
        (self.position_x, self.position_y)
    }

    /// Append with the FIFO wound cap.
    pub fn push_wound(&mut self, wound: Wound) {
        self.wounds.push(wound);
        if self.wounds.len() > MAX_WOUNDS {
            let excess = self.wounds.len() - MAX_WOUNDS;
            self.wounds.drain(..excess);
        }
    }

    /// Canonical payload: floats rounded to 8 decimals so the save file and
    /// the hash surface agree byte-for-byte.
    pub fn to_value(&self) -> Value {
        let hex = self.hex_coord();
        let mut payload = JsonMap::new();
        payload.insert("entity_id".into(), Value::String(self.entity_id.clone()));
        payload.insert("space_id".into(), Value::String(self.space_id.clone()));
        payload.insert("hex_coord".into(), serde_json::json!({"q": hex.q, "r": hex.r}));
        payload.insert("position_x".into(), json::number8(self.position_x));
        payload.insert("position_y".into(), json::number8(self.position_y));
        payload.insert("move_input_x".into(), json::number8(self.move_input_x));
        payload.insert("move_input_y".into(), json::number8(self.move_input_y));
        payload.insert("speed_per_tick".into(), json::number8(self.speed_per_tick));
        payload.insert(
            "target_position".into(),
            match self.target_position {
                Some((x, y)) => Value::Array(vec![json::number8(x), json::number8(y)]),
                None => Value::Null,
            },
        );
        payload.insert("facing".into(), Value::from(self.facing));
        payload.insert(
            "cooldown_until_tick".into(),
            Value::from(self.cooldown_until_tick.as_u64()),
        );
        payload.insert(
            "wounds".into(),
            Value::Array(
                self.wounds
                    .iter()
                    .map(|wound| serde_json::to_value(wound).expect("wound serializes"))
                    .collect(),
            ),
        );
        payload.insert("stats".into(), Value::Object(self.stats.clone()));
        payload.insert("template_id".into(), optional_string(&self.template_id));
        payload.insert(
            "source_action_uid".into(),
            optional_string(&self.source_action_uid),
        );
        payload.insert(
            "inventory_container_id".into(),
            optional_string(&self.inventory_container_id),
        );
        payload.insert(
            "supply_profile_id".into(),
            optional_string(&self.supply_profile_id),
        );
        payload.insert(
            "selected_entity_id".into(),
            optional_string(&self.selected_entity_id),
        );
        Value::Object(payload)
    }

    pub fn from_value(value: &Value) -> SimResult<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| EngineError::InvalidPayload("entity must be an object".into()))?;
        let entity_id = map
            .get("entity_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                EngineError::InvalidPayload("entity_id must be a non-empty string".into())
            })?;

        let mut entity = EntityState::new(
            entity_id,
            require_f64(map, "position_x")?,
            require_f64(map, "position_y")?,
        );
        entity.space_id = map
            .get("space_id")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_OVERWORLD_SPACE_ID)
            .to_string();
        entity.speed_per_tick = map
            .get("speed_per_tick")
            .and_then(Value::as_f64)
            .unwrap_or(DEFAULT_SPEED_PER_TICK);
        entity.move_input_x = map.get("move_input_x").and_then(Value::as_f64).unwrap_or(0.0);
        entity.move_input_y = map.get("move_input_y").and_then(Value::as_f64).unwrap_or(0.0);
        entity.target_position = match map.get("target_position") {
            None | Some(Value::Null) => None,
            Some(Value::Array(pair)) if pair.len() == 2 => {
                let x = pair[0].as_f64().ok_or_else(|| {
                    EngineError::InvalidPayload("target_position must hold numbers".into())
                })?;
                let y = pair[1].as_f64().ok_or_else(|| {
                    EngineError::InvalidPayload("target_position must hold numbers".into())
                })?;
                Some((x, y))
            }
            Some(_) => {
                return Err(EngineError::InvalidPayload(
                    "target_position must be a two-element list when present".into(),
                ))
            }
        };
        entity.facing = map
            .get("facing")
            .and_then(Value::as_u64)
            .map(|f| (f % 6) as u8)
            .unwrap_or(0);
        entity.cooldown_until_tick =
            Tick(map.get("cooldown_until_tick").and_then(Value::as_u64).unwrap_or(0));
        if let Some(rows) = map.get("wounds").and_then(Value::as_array) {
            for row in rows {
                let wound: Wound = serde_json::from_value(row.clone())
                    .map_err(|err| EngineError::InvalidPayload(format!("wound: {err}")))?;
                entity.push_wound(wound);
            }
        }
        entity.stats = map
            .get("stats")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        entity.template_id = optional_string_field(map, "template_id");
        entity.source_action_uid = optional_string_field(map, "source_action_uid");
        entity.inventory_container_id = optional_string_field(map, "inventory_container_id");
        entity.supply_profile_id = optional_string_field(map, "supply_profile_id");
        entity.selected_entity_id = optional_string_field(map, "selected_entity_id");
        Ok(entity)
    }
}

fn optional_string(value: &Option<String>) -> Value {
    match value {
        Some(s) => Value::String(s.clone()),
        None => Value::Null,
    }
}

fn optional_string_field(map: &JsonMap, key: &str) -> Option<String> {
    map.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn require_f64(map: &JsonMap, key: &str) -> SimResult<f64> {
    map.get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| EngineError::InvalidPayload(format!("entity.{key} must be numeric")))
}

//! # Commands
//!
//! Recorded external intents. A command never mutates state directly; the
//! tick engine drains the input log in order and routes each command to the
//! first rule module that claims it, falling back to the built-in router.
//!
//! The command surface is a fixed tag set for schema_version 1. New types are
//! added by extending the constants below and the router, never at runtime.

use serde::{Deserialize, Serialize};

use hx_types::{JsonMap, Tick};

pub const SET_MOVE_VECTOR: &str = "set_move_vector";
pub const SET_TARGET_POSITION: &str = "set_target_position";
pub const STOP: &str = "stop";
pub const TRANSITION_SPACE: &str = "transition_space";
pub const ENTER_SITE: &str = "enter_site";
pub const SET_SELECTED_ENTITY: &str = "set_selected_entity";
pub const CLEAR_SELECTED_ENTITY: &str = "clear_selected_entity";
pub const ATTACK_INTENT: &str = "attack_intent";
pub const TURN_INTENT: &str = "turn_intent";
pub const INTERACTION_INTENT: &str = "interaction_intent";
pub const EXPLORE_INTENT: &str = "explore_intent";
pub const ENTITY_STAT_INTENT: &str = "entity_stat_intent";
pub const INVENTORY_INTENT: &str = "inventory_intent";
pub const EMIT_SIGNAL_INTENT: &str = "emit_signal_intent";
pub const PERCEIVE_SIGNAL_INTENT: &str = "perceive_signal_intent";
pub const END_LOCAL_ENCOUNTER_INTENT: &str = "end_local_encounter_intent";
pub const NOOP_INPUT: &str = "noop_input";
pub const DEBUG_MARKER: &str = "debug_marker";

/// A single recorded command intent.
///
/// `entity_id` is the acting entity where the intent has one; admin-style
/// intents (`debug_marker`, global selection) leave it empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimCommand {
    /// Tick at which the command is drained.
    pub tick: Tick,
    /// Acting entity, when the intent has one.
    pub entity_id: Option<String>,
    /// One of the command-type constants above (modules may add their own).
    pub command_type: String,
    /// Free-form JSON parameters; schema is per command type.
    #[serde(default)]
    pub params: JsonMap,
}

impl SimCommand {
    pub fn new(
        tick: Tick,
        entity_id: Option<&str>,
        command_type: &str,
        params: JsonMap,
    ) -> Self {
        SimCommand {
            tick,
            entity_id: entity_id.map(str::to_string),
            command_type: command_type.to_string(),
            params,
        }
    }

    /// Deterministic idempotence key for the command at its input-log slot.
    pub fn action_uid(&self, command_index: usize) -> String {
        format!("{}:{}", self.tick.as_u64(), command_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_round_trips_through_json() {
        let mut params = JsonMap::new();
        params.insert("x".to_string(), json!(1.0));
        params.insert("y".to_string(), json!(-1.0));
        let command = SimCommand::new(Tick(4), Some("runner"), SET_MOVE_VECTOR, params);

        let encoded = serde_json::to_string(&command).unwrap();
        let decoded: SimCommand = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, command);
    }

    #[test]
    fn action_uid_is_tick_and_slot() {
        let command = SimCommand::new(Tick(7), None, NOOP_INPUT, JsonMap::new());
        assert_eq!(command.action_uid(3), "7:3");
    }
}

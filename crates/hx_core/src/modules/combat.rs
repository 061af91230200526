//! # Combat
//!
//! Attack and turn intents on the tactical plane. Attacks validate through
//! a fixed reason chain (stable strings, spec'd order), gate on a cooldown,
//! and land a default torso wound on the resolved target. Campaign-role
//! spaces reject tactical intents outright.

use serde_json::Value;

use hx_api::commands::{ATTACK_INTENT, TURN_INTENT};
use hx_api::{SimCommand, SimResult};
use hx_types::{
    hex_neighbor_direction, json, normalize_facing_token, CellCoord, JsonMap, Tick,
};

use crate::entity::Wound;
use crate::rules::RuleModule;
use crate::sim::Simulation;
use crate::world::CAMPAIGN_SPACE_ROLE;
use crate::MAX_AFFECTED_PER_ACTION;

pub const COMBAT_OUTCOME_EVENT: &str = "combat_outcome";
pub const TURN_OUTCOME_EVENT: &str = "turn_outcome";

const DEFAULT_CALLED_REGION: &str = "torso";
const DEFAULT_WOUND_SEVERITY: u64 = 1;
/// Ticks an attacker is locked out after a resolved attack.
pub const PLACEHOLDER_COOLDOWN_TICKS: u64 = 1;

#[derive(Default)]
pub struct CombatExecutionModule;

impl CombatExecutionModule {
    pub const NAME: &'static str = "combat";

    pub fn new() -> Self {
        CombatExecutionModule
    }

    fn is_campaign_space_entity(sim: &Simulation, entity_id: &str) -> bool {
        sim.entity(entity_id)
            .and_then(|entity| sim.state.world.spaces.get(&entity.space_id))
            .map(|space| space.role == CAMPAIGN_SPACE_ROLE)
            .unwrap_or(false)
    }

    fn mode_is_melee(mode: &str) -> bool {
        let normalized = mode.trim().to_ascii_lowercase();
        normalized == "melee" || normalized.starts_with("melee_")
    }

    /// First entity occupying a cell, by sorted entity id.
    fn entity_id_at_cell(sim: &Simulation, space_id: &str, coord: CellCoord) -> Option<String> {
        sim.state
            .entities
            .iter()
            .filter(|(entity_id, entity)| {
                entity.space_id == space_id && sim.entity_cell(entity_id) == Some(coord)
            })
            .map(|(entity_id, _)| entity_id.clone())
            .next()
    }

    /// Parse an optional `{space_id, coord}` cell reference.
    /// Returns `(cell, error_reason)`.
    fn parse_cell_ref(
        sim: &Simulation,
        payload: Option<&Value>,
    ) -> (Option<(String, CellCoord)>, Option<&'static str>) {
        let Some(payload) = payload else {
            return (None, None);
        };
        if payload.is_null() {
            return (None, None);
        }
        let Some(map) = payload.as_object() else {
            return (None, Some("invalid_target_cell"));
        };
        let Some(space_id) = json::get_str(map, "space_id") else {
            return (None, Some("invalid_target_cell"));
        };
        let Some(space) = sim.state.world.spaces.get(space_id) else {
            return (None, Some("invalid_target_cell"));
        };
        let Some(coord) = map.get("coord").and_then(CellCoord::from_value) else {
            return (None, Some("invalid_target_cell"));
        };
        if !space.is_valid_cell(&coord) {
            return (None, Some("invalid_target_cell_coord_for_space"));
        }
        (Some((space_id.to_string(), coord)), None)
    }

    /// Melee arc check: the target direction must fall within the attacker's
    /// 3-hex forward arc. Square-grid spaces skip the arc entirely.
    fn validate_melee_arc(
        sim: &Simulation,
        attacker_id: &str,
        target_id: &str,
    ) -> Option<&'static str> {
        let attacker = sim.entity(attacker_id)?;
        let target = sim.entity(target_id)?;
        if attacker.space_id != target.space_id {
            return Some("space_mismatch");
        }
        let space = sim.state.world.spaces.get(&attacker.space_id)?;
        if space.topology_type == hx_types::SQUARE_GRID_TOPOLOGY {
            return None;
        }
        let attacker_coord = sim.entity_cell(attacker_id).and_then(|c| c.as_hex());
        let target_coord = sim.entity_cell(target_id).and_then(|c| c.as_hex());
        let (Some(attacker_coord), Some(target_coord)) = (attacker_coord, target_coord) else {
            return Some("invalid_arc_coord");
        };
        let Some(direction) = hex_neighbor_direction(attacker_coord, target_coord) else {
            return Some("invalid_arc_coord");
        };
        let facing = (attacker.facing % 6) as usize;
        let allowed = [(facing + 5) % 6, facing, (facing + 1) % 6];
        if allowed.contains(&direction) {
            None
        } else {
            Some("invalid_arc")
        }
    }

    fn handle_attack(&self, sim: &mut Simulation, command: &SimCommand, command_index: usize) {
        let params = &command.params;
        let attacker_id = json::get_str(params, "attacker_id").map(str::to_string);
        let mode = json::get_str(params, "mode").map(str::to_string);
        let target_id_param = json::get_str(params, "target_id").map(str::to_string);
        let weapon_ref = json::get_str(params, "weapon_ref").map(str::to_string);
        let called_region = json::get_str(params, "target_region")
            .unwrap_or(DEFAULT_CALLED_REGION)
            .to_string();
        let tags = json::tags_or_empty(params, "tags");

        let mut reason: &'static str = "resolved";
        let mut applied = false;
        let mut target_cell: Option<(String, CellCoord)> = None;
        let mut resolved_target_id: Option<String> = None;

        'validate: {
            let Some(attacker_id) = attacker_id.as_deref() else {
                reason = "invalid_attacker";
                break 'validate;
            };
            let Some(mode_value) = mode.as_deref() else {
                reason = "invalid_mode";
                break 'validate;
            };
            if sim.entity(attacker_id).is_none() {
                reason = "invalid_attacker";
                break 'validate;
            }
            if Self::is_campaign_space_entity(sim, attacker_id) {
                reason = "tactical_not_allowed_in_campaign_space";
                break 'validate;
            }
            let target_cell_payload = params.get("target_cell");
            if target_id_param.is_none()
                && target_cell_payload.map(Value::is_null).unwrap_or(true)
            {
                reason = "invalid_target";
                break 'validate;
            }
            if let Some(target_id) = target_id_param.as_deref() {
                if sim.entity(target_id).is_none() {
                    reason = "invalid_target";
                    break 'validate;
                }
            }

            let (parsed_cell, cell_error) = Self::parse_cell_ref(sim, target_cell_payload);
            if let Some(cell_error) = cell_error {
                reason = cell_error;
                break 'validate;
            }
            target_cell = parsed_cell;

            let attacker_space = sim
                .entity(attacker_id)
                .map(|entity| entity.space_id.clone())
                .expect("attacker presence checked above");

            if let Some(target_id) = target_id_param.as_deref() {
                let target_space = sim
                    .entity(target_id)
                    .map(|entity| entity.space_id.clone())
                    .expect("target presence checked above");
                if attacker_space != target_space {
                    reason = "space_mismatch";
                    break 'validate;
                }
                if let Some((cell_space, cell_coord)) = &target_cell {
                    let Some(target_coord) = sim.entity_cell(target_id) else {
                        reason = "invalid_target";
                        break 'validate;
                    };
                    if *cell_space != target_space || *cell_coord != target_coord {
                        reason = "target_cell_mismatch";
                        break 'validate;
                    }
                }
                if target_cell.is_none() {
                    let Some(target_coord) = sim.entity_cell(target_id) else {
                        reason = "invalid_target";
                        break 'validate;
                    };
                    let target_space = sim
                        .entity(target_id)
                        .map(|entity| entity.space_id.clone())
                        .expect("target presence checked above");
                    target_cell = Some((target_space, target_coord));
                }
                resolved_target_id = Some(target_id.to_string());
            }

            if let Some((cell_space, _)) = &target_cell {
                if attacker_space != *cell_space {
                    reason = "space_mismatch";
                    break 'validate;
                }
            }

            if resolved_target_id.is_none() {
                let (cell_space, cell_coord) =
                    target_cell.clone().expect("a target form is present");
                match Self::entity_id_at_cell(sim, &cell_space, cell_coord) {
                    Some(found) => resolved_target_id = Some(found),
                    None => {
                        reason = "no_target_in_cell";
                        break 'validate;
                    }
                }
            }

            if Self::mode_is_melee(mode_value) {
                let Some(attacker_cell) = sim.entity_cell(attacker_id) else {
                    reason = "invalid_arc_coord";
                    break 'validate;
                };
                let (_, cell_coord) = target_cell.clone().expect("resolved above");
                let adjacent = match (attacker_cell, cell_coord) {
                    (CellCoord::Hex { .. }, CellCoord::Hex { .. }) => {
                        hx_types::hex_distance(
                            attacker_cell.as_hex().expect("hex checked"),
                            cell_coord.as_hex().expect("hex checked"),
                        ) == 1
                    }
                    (CellCoord::Square { x: ax, y: ay }, CellCoord::Square { x: bx, y: by }) => {
                        (ax - bx).abs() + (ay - by).abs() == 1
                    }
                    _ => false,
                };
                if !adjacent {
                    reason = "out_of_range";
                    break 'validate;
                }
                if let Some(arc_reason) = Self::validate_melee_arc(
                    sim,
                    attacker_id,
                    resolved_target_id.as_deref().expect("resolved above"),
                ) {
                    reason = arc_reason;
                    break 'validate;
                }
            }

            let cooldown_until = sim
                .entity(attacker_id)
                .map(|entity| entity.cooldown_until_tick)
                .expect("attacker presence checked above");
            if cooldown_until > command.tick {
                reason = "cooldown_blocked";
                break 'validate;
            }

            applied = true;
            if let Some(entity) = sim.entity_mut(attacker_id) {
                entity.cooldown_until_tick = command.tick + PLACEHOLDER_COOLDOWN_TICKS;
            }
        }

        let affected = self.build_affected(sim, resolved_target_id.as_deref(), &called_region, applied, reason);

        let mut outcome = JsonMap::new();
        outcome.insert("tick".into(), Value::from(command.tick.as_u64()));
        outcome.insert("intent".into(), Value::String(ATTACK_INTENT.into()));
        outcome.insert(
            "action_uid".into(),
            Value::String(command.action_uid(command_index)),
        );
        outcome.insert(
            "attacker_id".into(),
            attacker_id.map(Value::String).unwrap_or(Value::Null),
        );
        outcome.insert(
            "target_id".into(),
            target_id_param
                .or(resolved_target_id.clone())
                .map(Value::String)
                .unwrap_or(Value::Null),
        );
        outcome.insert(
            "target_cell".into(),
            match &target_cell {
                Some((space_id, coord)) => serde_json::json!({
                    "space_id": space_id,
                    "coord": coord.to_value(),
                }),
                None => Value::Null,
            },
        );
        outcome.insert("mode".into(), mode.map(Value::String).unwrap_or(Value::Null));
        outcome.insert(
            "weapon_ref".into(),
            weapon_ref.map(Value::String).unwrap_or(Value::Null),
        );
        outcome.insert("called_region".into(), Value::String(called_region.clone()));
        outcome.insert(
            "region_hit".into(),
            if applied {
                Value::String(called_region.clone())
            } else {
                Value::Null
            },
        );
        outcome.insert("applied".into(), Value::Bool(applied));
        outcome.insert("reason".into(), Value::String(reason.to_string()));
        outcome.insert("wound_deltas".into(), Value::Array(Vec::new()));
        outcome.insert("roll_trace".into(), Value::Array(Vec::new()));
        outcome.insert(
            "tags".into(),
            Value::Array(tags.into_iter().map(Value::String).collect()),
        );

        if !affected.is_empty() {
            let affected =
                self.apply_wounds(sim, command.tick, &outcome, &called_region, affected);
            outcome.insert(
                "affected".into(),
                Value::Array(affected.into_iter().map(Value::Object).collect()),
            );
        }

        sim.append_combat_outcome(outcome);
    }

    fn build_affected(
        &self,
        sim: &Simulation,
        resolved_target_id: Option<&str>,
        called_region: &str,
        applied: bool,
        reason: &str,
    ) -> Vec<JsonMap> {
        if !applied {
            return Vec::new();
        }
        let Some(target_id) = resolved_target_id else {
            return Vec::new();
        };
        let (Some(target), Some(coord)) = (sim.entity(target_id), sim.entity_cell(target_id))
        else {
            return Vec::new();
        };

        let mut entry = JsonMap::new();
        entry.insert("entity_id".into(), Value::String(target_id.to_string()));
        entry.insert(
            "cell".into(),
            serde_json::json!({"space_id": target.space_id, "coord": coord.to_value()}),
        );
        entry.insert("called_region".into(), Value::String(called_region.to_string()));
        entry.insert("region_hit".into(), Value::String(called_region.to_string()));
        entry.insert("wound_deltas".into(), Value::Array(Vec::new()));
        entry.insert("applied".into(), Value::Bool(true));
        entry.insert("reason".into(), Value::String(reason.to_string()));

        let mut entries = vec![entry];
        entries.sort_by_key(|entry| {
            let cell = entry
                .get("cell")
                .and_then(Value::as_object)
                .and_then(|cell| cell.get("coord"))
                .and_then(CellCoord::from_value);
            let entity = entry
                .get("entity_id")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            (cell, entity)
        });
        entries.truncate(MAX_AFFECTED_PER_ACTION);
        entries
    }

    fn apply_wounds(
        &self,
        sim: &mut Simulation,
        tick: Tick,
        outcome: &JsonMap,
        called_region: &str,
        mut affected: Vec<JsonMap>,
    ) -> Vec<JsonMap> {
        let attacker_id = outcome
            .get("attacker_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        for entry in affected.iter_mut() {
            if entry.get("applied") != Some(&Value::Bool(true)) {
                continue;
            }
            let Some(entity_id) = entry.get("entity_id").and_then(Value::as_str).map(str::to_string)
            else {
                continue;
            };
            let region = entry
                .get("region_hit")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .unwrap_or(called_region)
                .to_string();
            let wound = Wound {
                region,
                severity: DEFAULT_WOUND_SEVERITY,
                tags: Vec::new(),
                inflicted_tick: tick,
                source: attacker_id.clone(),
            };
            let Some(entity) = sim.entity_mut(&entity_id) else {
                continue;
            };
            entity.push_wound(wound.clone());
            let delta = serde_json::json!({
                "op": "append",
                "wound": serde_json::to_value(&wound).expect("wound serializes"),
            });
            entry.insert("wound_deltas".into(), Value::Array(vec![delta]));
        }
        affected
    }

    fn handle_turn(&self, sim: &mut Simulation, command: &SimCommand, command_index: usize) {
        let params = &command.params;
        let entity_id = json::get_str(params, "entity_id").map(str::to_string);
        let tags = json::tags_or_empty(params, "tags");

        let mut applied = false;
        let mut reason = "resolved";
        let mut normalized_facing = 0u8;

        match entity_id.as_deref() {
            None => reason = "invalid_entity",
            Some(id) if sim.entity(id).is_none() => reason = "invalid_entity",
            Some(id) if Self::is_campaign_space_entity(sim, id) => {
                reason = "tactical_not_allowed_in_campaign_space"
            }
            Some(id) => match params.get("facing").and_then(|raw| normalize_facing_token(raw)) {
                None => reason = "invalid_facing",
                Some(facing) => {
                    normalized_facing = facing;
                    if let Some(entity) = sim.entity_mut(id) {
                        entity.facing = facing;
                        applied = true;
                    }
                }
            },
        }

        let mut outcome = JsonMap::new();
        outcome.insert("tick".into(), Value::from(command.tick.as_u64()));
        outcome.insert("intent".into(), Value::String(TURN_INTENT.into()));
        outcome.insert(
            "action_uid".into(),
            Value::String(command.action_uid(command_index)),
        );
        outcome.insert(
            "entity_id".into(),
            entity_id.map(Value::String).unwrap_or(Value::Null),
        );
        outcome.insert(
            "facing".into(),
            if applied {
                Value::from(normalized_facing)
            } else {
                Value::Null
            },
        );
        outcome.insert("applied".into(), Value::Bool(applied));
        outcome.insert("reason".into(), Value::String(reason.to_string()));
        outcome.insert(
            "tags".into(),
            Value::Array(tags.into_iter().map(Value::String).collect()),
        );
        sim.schedule_event_at(command.tick, TURN_OUTCOME_EVENT, outcome);
    }
}

impl RuleModule for CombatExecutionModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_command(
        &mut self,
        sim: &mut Simulation,
        command: &SimCommand,
        command_index: usize,
    ) -> SimResult<bool> {
        match command.command_type.as_str() {
            TURN_INTENT => {
                self.handle_turn(sim, command, command_index);
                Ok(true)
            }
            ATTACK_INTENT => {
                self.handle_attack(sim, command, command_index);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityState;
    use crate::world::{SpaceState, WorldState, LOCAL_SPACE_ROLE};
    use hx_api::SimCommand;
    use hx_types::{MasterSeed, SQUARE_GRID_TOPOLOGY};
    use serde_json::json;

    fn params(value: Value) -> JsonMap {
        value.as_object().unwrap().clone()
    }

    /// Hex-disk overworld plus a local square arena at "arena".
    fn tactical_sim(seed: u64) -> Simulation {
        let mut topology = JsonMap::new();
        topology.insert("radius".into(), Value::from(4));
        let mut world =
            WorldState::create_with_topology(MasterSeed(seed), "hex_disk", &topology).unwrap();
        let mut square_params = JsonMap::new();
        square_params.insert("width".into(), Value::from(8));
        square_params.insert("height".into(), Value::from(8));
        world.spaces.insert(
            "arena".into(),
            SpaceState::new("arena", SQUARE_GRID_TOPOLOGY, LOCAL_SPACE_ROLE, square_params)
                .unwrap(),
        );
        let mut sim = Simulation::new(world, MasterSeed(seed));
        sim.register_rule_module(Box::new(CombatExecutionModule::new()))
            .unwrap();
        sim
    }

    fn arena_entity(entity_id: &str, x: i64, y: i64) -> EntityState {
        let mut entity = EntityState::new(entity_id, x as f64, y as f64);
        entity.space_id = "arena".into();
        entity
    }

    fn attack(tick: u64, attacker: &str, target: &str) -> SimCommand {
        SimCommand::new(
            Tick(tick),
            Some(attacker),
            ATTACK_INTENT,
            params(json!({
                "attacker_id": attacker,
                "target_id": target,
                "mode": "melee",
            })),
        )
    }

    #[test]
    fn cooldown_gates_repeat_attacks() {
        let mut sim = tactical_sim(4);
        sim.add_entity(arena_entity("raider", 0, 0));
        sim.add_entity(arena_entity("guard", 1, 0));

        sim.append_command(attack(0, "raider", "guard"));
        sim.append_command(attack(0, "raider", "guard"));
        sim.append_command(attack(1, "raider", "guard"));
        sim.advance_ticks(3).unwrap();

        let reasons: Vec<&str> = sim
            .combat_log()
            .iter()
            .map(|outcome| outcome.get("reason").unwrap().as_str().unwrap())
            .collect();
        assert_eq!(reasons, vec!["resolved", "cooldown_blocked", "resolved"]);

        let guard = sim.entity("guard").unwrap();
        assert_eq!(guard.wounds.len(), 2);
        assert!(guard.wounds.iter().all(|wound| wound.region == "torso"));
        assert!(guard.wounds.iter().all(|wound| wound.severity == 1));
    }

    #[test]
    fn campaign_space_rejects_tactical_intents() {
        let mut sim = tactical_sim(5);
        sim.add_entity(EntityState::from_hex("wanderer", hx_types::HexCoord::new(0, 0)));
        sim.add_entity(EntityState::from_hex("bandit", hx_types::HexCoord::new(1, 0)));

        sim.append_command(attack(0, "wanderer", "bandit"));
        sim.advance_ticks(1).unwrap();

        assert_eq!(
            sim.combat_log()[0].get("reason").unwrap().as_str().unwrap(),
            "tactical_not_allowed_in_campaign_space"
        );
        assert!(sim.entity("bandit").unwrap().wounds.is_empty());
    }

    #[test]
    fn melee_requires_adjacency() {
        let mut sim = tactical_sim(6);
        sim.add_entity(arena_entity("raider", 0, 0));
        sim.add_entity(arena_entity("guard", 3, 0));

        sim.append_command(attack(0, "raider", "guard"));
        sim.advance_ticks(1).unwrap();
        assert_eq!(
            sim.combat_log()[0].get("reason").unwrap().as_str().unwrap(),
            "out_of_range"
        );
    }

    #[test]
    fn target_cell_must_match_target_position() {
        let mut sim = tactical_sim(7);
        sim.add_entity(arena_entity("raider", 0, 0));
        sim.add_entity(arena_entity("guard", 1, 0));

        sim.append_command(SimCommand::new(
            Tick(0),
            Some("raider"),
            ATTACK_INTENT,
            params(json!({
                "attacker_id": "raider",
                "target_id": "guard",
                "target_cell": {"space_id": "arena", "coord": {"x": 2, "y": 2}},
                "mode": "melee",
            })),
        ));
        sim.advance_ticks(1).unwrap();
        assert_eq!(
            sim.combat_log()[0].get("reason").unwrap().as_str().unwrap(),
            "target_cell_mismatch"
        );
    }

    #[test]
    fn cell_only_attack_resolves_occupant() {
        let mut sim = tactical_sim(8);
        sim.add_entity(arena_entity("raider", 0, 0));
        sim.add_entity(arena_entity("guard", 0, 1));

        sim.append_command(SimCommand::new(
            Tick(0),
            Some("raider"),
            ATTACK_INTENT,
            params(json!({
                "attacker_id": "raider",
                "target_cell": {"space_id": "arena", "coord": {"x": 0, "y": 1}},
                "mode": "melee",
            })),
        ));
        sim.advance_ticks(1).unwrap();

        let outcome = &sim.combat_log()[0];
        assert_eq!(outcome.get("reason").unwrap().as_str().unwrap(), "resolved");
        let affected = outcome.get("affected").unwrap().as_array().unwrap();
        assert_eq!(
            affected[0].get("entity_id").unwrap().as_str().unwrap(),
            "guard"
        );
        assert_eq!(sim.entity("guard").unwrap().wounds.len(), 1);
    }

    #[test]
    fn empty_cell_attack_reports_no_target() {
        let mut sim = tactical_sim(9);
        sim.add_entity(arena_entity("raider", 0, 0));

        sim.append_command(SimCommand::new(
            Tick(0),
            Some("raider"),
            ATTACK_INTENT,
            params(json!({
                "attacker_id": "raider",
                "target_cell": {"space_id": "arena", "coord": {"x": 0, "y": 1}},
                "mode": "melee",
            })),
        ));
        sim.advance_ticks(1).unwrap();
        assert_eq!(
            sim.combat_log()[0].get("reason").unwrap().as_str().unwrap(),
            "no_target_in_cell"
        );
    }

    #[test]
    fn turn_intent_sets_facing_in_local_space() {
        let mut sim = tactical_sim(10);
        sim.add_entity(arena_entity("raider", 0, 0));

        sim.append_command(SimCommand::new(
            Tick(0),
            Some("raider"),
            TURN_INTENT,
            params(json!({"entity_id": "raider", "facing": 3})),
        ));
        sim.advance_ticks(1).unwrap();

        assert_eq!(sim.entity("raider").unwrap().facing, 3);
        let outcome = sim
            .get_event_trace()
            .iter()
            .find(|entry| entry.event_type == TURN_OUTCOME_EVENT)
            .unwrap();
        assert_eq!(outcome.params.get("applied"), Some(&Value::Bool(true)));
    }

    #[test]
    fn invalid_facing_rejected() {
        let mut sim = tactical_sim(11);
        sim.add_entity(arena_entity("raider", 0, 0));
        sim.append_command(SimCommand::new(
            Tick(0),
            Some("raider"),
            TURN_INTENT,
            params(json!({"entity_id": "raider", "facing": 9})),
        ));
        sim.advance_ticks(1).unwrap();
        let outcome = sim
            .get_event_trace()
            .iter()
            .find(|entry| entry.event_type == TURN_OUTCOME_EVENT)
            .unwrap();
        assert_eq!(
            outcome.params.get("reason"),
            Some(&Value::String("invalid_facing".into()))
        );
    }
}

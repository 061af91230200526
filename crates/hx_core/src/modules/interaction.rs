//! # Interaction
//!
//! Door, anchor, and interactable intents. Intents schedule a delayed
//! execute event; execution validates against the live world, applies door
//! state changes (writing through the occlusion API), and turns anchor
//! exits into follow-up `transition_space`/`enter_site` commands.

use serde_json::Value;

use hx_api::commands::{ENTER_SITE, INTERACTION_INTENT, TRANSITION_SPACE};
use hx_api::{SimCommand, SimEvent, SimResult};
use hx_types::{json, JsonMap, LocationRef, Tick};

use crate::rules::RuleModule;
use crate::sim::Simulation;
use crate::MAX_EXECUTED_ACTION_UIDS;

pub const INTERACTION_EXECUTE_EVENT: &str = "interaction_execute";
pub const INTERACTION_OUTCOME_EVENT: &str = "interaction_outcome";

const SUPPORTED_TYPES: [&str; 6] = ["open", "close", "toggle", "inspect", "use", "exit"];
const SUPPORTED_TARGETS: [&str; 3] = ["door", "anchor", "interactable"];
const LEDGER_KEY: &str = "executed_action_uids";

#[derive(Default)]
pub struct InteractionExecutionModule;

impl InteractionExecutionModule {
    pub const NAME: &'static str = "interaction";

    pub fn new() -> Self {
        InteractionExecutionModule
    }

    fn ledger(sim: &Simulation) -> Vec<String> {
        json::uid_ledger(&sim.get_rules_state(Self::NAME), LEDGER_KEY, MAX_EXECUTED_ACTION_UIDS)
    }

    fn mark_executed(sim: &mut Simulation, action_uid: &str) {
        let mut state = sim.get_rules_state(Self::NAME);
        let mut ledger = json::uid_ledger(&state, LEDGER_KEY, MAX_EXECUTED_ACTION_UIDS);
        json::push_uid_fifo(&mut ledger, action_uid, MAX_EXECUTED_ACTION_UIDS);
        json::set_uid_ledger(&mut state, LEDGER_KEY, &ledger);
        sim.set_rules_state(Self::NAME, state);
    }

    fn normalize_target(payload: Option<&Value>) -> Option<(String, String)> {
        let map = payload?.as_object()?;
        let kind = json::get_str(map, "kind")?;
        let id = json::get_str(map, "id")?;
        if !SUPPORTED_TARGETS.contains(&kind) {
            return None;
        }
        Some((kind.to_string(), id.to_string()))
    }

    fn handle_intent(&self, sim: &mut Simulation, command: &SimCommand, command_index: usize) {
        let action_uid = command.action_uid(command_index);
        let params = &command.params;
        let interaction_type = json::get_str(params, "interaction_type").map(str::to_string);
        let duration_ticks = json::get_u64(params, "duration_ticks");
        let target = Self::normalize_target(params.get("target"));

        let entity_id = command.entity_id.clone();
        let entity_known = entity_id
            .as_deref()
            .map(|id| sim.entity(id).is_some())
            .unwrap_or(false);
        let location = entity_id
            .as_deref()
            .and_then(|id| sim.entity_location_ref(id));

        let rejection = if !entity_known {
            Some("unknown_entity")
        } else if interaction_type
            .as_deref()
            .map(|t| !SUPPORTED_TYPES.contains(&t))
            .unwrap_or(true)
        {
            Some("invalid_interaction_type")
        } else if duration_ticks.is_none() {
            Some("invalid_duration_ticks")
        } else if target.is_none() {
            Some("invalid_target")
        } else {
            None
        };

        if let Some(detail) = rejection {
            let mut details = JsonMap::new();
            details.insert("reason".into(), Value::String(detail.to_string()));
            self.schedule_outcome(
                sim,
                command.tick,
                entity_id.as_deref(),
                interaction_type.as_deref().unwrap_or(""),
                params.get("target").cloned().unwrap_or(Value::Null),
                &action_uid,
                "invalid_params",
                details,
                location,
            );
            return;
        }

        let (target_kind, target_id) = target.expect("validated above");
        let mut execute_params = JsonMap::new();
        execute_params.insert("tick".into(), Value::from(command.tick.as_u64()));
        execute_params.insert(
            "entity_id".into(),
            entity_id.map(Value::String).unwrap_or(Value::Null),
        );
        execute_params.insert(
            "interaction_type".into(),
            Value::String(interaction_type.expect("validated above")),
        );
        execute_params.insert(
            "target".into(),
            serde_json::json!({"kind": target_kind, "id": target_id}),
        );
        execute_params.insert("action_uid".into(), Value::String(action_uid));
        execute_params.insert("duration_ticks".into(), Value::from(duration_ticks.unwrap()));
        sim.schedule_event_at(
            command.tick + duration_ticks.unwrap(),
            INTERACTION_EXECUTE_EVENT,
            execute_params,
        );
    }

    fn handle_execute(&self, sim: &mut Simulation, event: &SimEvent) {
        let action_uid = json::get_str(&event.params, "action_uid")
            .unwrap_or("")
            .to_string();
        let interaction_type = json::get_str(&event.params, "interaction_type")
            .unwrap_or("")
            .to_string();
        let target = Self::normalize_target(event.params.get("target"));
        let entity_id = json::get_str(&event.params, "entity_id").map(str::to_string);
        let location = entity_id
            .as_deref()
            .and_then(|id| sim.entity_location_ref(id));

        if Self::ledger(sim).iter().any(|uid| uid == &action_uid) {
            self.schedule_outcome(
                sim,
                event.tick,
                entity_id.as_deref(),
                &interaction_type,
                event.params.get("target").cloned().unwrap_or(Value::Null),
                &action_uid,
                "already_applied",
                JsonMap::new(),
                location,
            );
            return;
        }

        if action_uid.is_empty()
            || target.is_none()
            || !SUPPORTED_TYPES.contains(&interaction_type.as_str())
        {
            Self::mark_executed(sim, &action_uid);
            self.schedule_outcome(
                sim,
                event.tick,
                entity_id.as_deref(),
                &interaction_type,
                event.params.get("target").cloned().unwrap_or(Value::Null),
                &action_uid,
                "invalid_params",
                JsonMap::new(),
                location,
            );
            return;
        }

        let (target_kind, target_id) = target.expect("checked above");
        let mut outcome = "unknown_target";
        let mut details = JsonMap::new();

        if let Some(entity_id) = entity_id.as_deref() {
            if let Some(space_id) = sim.entity(entity_id).map(|e| e.space_id.clone()) {
                match target_kind.as_str() {
                    "door" => {
                        (outcome, details) = Self::apply_door(
                            sim,
                            &space_id,
                            &target_id,
                            &interaction_type,
                        );
                    }
                    "interactable" => {
                        let kind = sim
                            .state
                            .world
                            .spaces
                            .get(&space_id)
                            .and_then(|space| space.interactables.get(&target_id))
                            .map(|interactable| interactable.kind.clone());
                        if let Some(kind) = kind {
                            if interaction_type == "inspect" || interaction_type == "use" {
                                outcome = "applied";
                                details.insert("kind".into(), Value::String(kind));
                            } else {
                                outcome = "invalid_params";
                            }
                        }
                    }
                    "anchor" => {
                        (outcome, details) = Self::apply_anchor(
                            sim,
                            &space_id,
                            &target_id,
                            &interaction_type,
                            entity_id,
                            event.tick,
                        );
                    }
                    _ => {}
                }
            }
        }

        Self::mark_executed(sim, &action_uid);
        self.schedule_outcome(
            sim,
            event.tick,
            entity_id.as_deref(),
            &interaction_type,
            serde_json::json!({"kind": target_kind, "id": target_id}),
            &action_uid,
            outcome,
            details,
            location,
        );
    }

    /// Door transitions also write through the world occlusion API: a closed
    /// door holds a default edge of 1, an open door holds none.
    fn apply_door(
        sim: &mut Simulation,
        space_id: &str,
        door_id: &str,
        interaction_type: &str,
    ) -> (&'static str, JsonMap) {
        let Some(door) = sim
            .state
            .world
            .spaces
            .get(space_id)
            .and_then(|space| space.doors.get(door_id))
            .cloned()
        else {
            return ("unknown_target", JsonMap::new());
        };

        if door.flags.locked || door.flags.blocked {
            return ("blocked", JsonMap::new());
        }
        if !matches!(interaction_type, "open" | "close" | "toggle") {
            return ("invalid_params", JsonMap::new());
        }

        let prior_state = door.state.clone();
        let next_state = match interaction_type {
            "open" => "open",
            "close" => "closed",
            _ => {
                if door.is_open() {
                    "closed"
                } else {
                    "open"
                }
            }
        };

        if let Some(space) = sim.state.world.spaces.get_mut(space_id) {
            if let Some(door) = space.doors.get_mut(door_id) {
                door.state = next_state.to_string();
            }
        }
        let occlusion_value = if next_state == "closed" { 1 } else { 0 };
        sim.state
            .world
            .set_structure_occlusion_edge(space_id, door.a, door.b, occlusion_value);

        let mut details = JsonMap::new();
        details.insert("no_change".into(), Value::Bool(prior_state == next_state));
        details.insert("state".into(), Value::String(next_state.to_string()));
        ("applied", details)
    }

    fn apply_anchor(
        sim: &mut Simulation,
        space_id: &str,
        anchor_id: &str,
        interaction_type: &str,
        entity_id: &str,
        tick: Tick,
    ) -> (&'static str, JsonMap) {
        let Some(anchor) = sim
            .state
            .world
            .spaces
            .get(space_id)
            .and_then(|space| space.anchors.get(anchor_id))
            .cloned()
        else {
            return ("unknown_target", JsonMap::new());
        };
        if interaction_type != "exit" {
            return ("invalid_params", JsonMap::new());
        }

        match anchor.target.target_type.as_str() {
            "space" => {
                let Some(target_space_id) = anchor.target.space_id.as_deref() else {
                    return ("invalid_params", JsonMap::new());
                };
                let Some(destination) = sim.state.world.spaces.get(target_space_id) else {
                    return ("unknown_target", JsonMap::new());
                };
                let to_location = LocationRef::new(
                    target_space_id,
                    destination.topology_type.clone(),
                    destination.default_spawn_coord(),
                );
                let mut params = JsonMap::new();
                params.insert("to_location".into(), to_location.to_value());
                params.insert(
                    "reason".into(),
                    Value::String("interaction_anchor_exit".into()),
                );
                sim.append_command(SimCommand::new(
                    tick + 1,
                    Some(entity_id),
                    TRANSITION_SPACE,
                    params,
                ));
                ("applied", JsonMap::new())
            }
            "site" => {
                let Some(site_id) = anchor.target.site_id.as_deref() else {
                    return ("invalid_params", JsonMap::new());
                };
                let has_entrance = sim
                    .state
                    .world
                    .sites
                    .get(site_id)
                    .map(|site| site.entrance.is_some())
                    .unwrap_or(false);
                if !has_entrance {
                    return ("unknown_target", JsonMap::new());
                }
                let mut params = JsonMap::new();
                params.insert("site_id".into(), Value::String(site_id.to_string()));
                sim.append_command(SimCommand::new(tick + 1, Some(entity_id), ENTER_SITE, params));
                ("applied", JsonMap::new())
            }
            _ => ("invalid_params", JsonMap::new()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn schedule_outcome(
        &self,
        sim: &mut Simulation,
        tick: Tick,
        entity_id: Option<&str>,
        interaction_type: &str,
        target: Value,
        action_uid: &str,
        outcome: &str,
        details: JsonMap,
        location: Option<LocationRef>,
    ) {
        let mut params = JsonMap::new();
        params.insert("tick".into(), Value::from(tick.as_u64()));
        params.insert(
            "entity_id".into(),
            entity_id
                .map(|id| Value::String(id.to_string()))
                .unwrap_or(Value::Null),
        );
        params.insert(
            "interaction_type".into(),
            Value::String(interaction_type.to_string()),
        );
        params.insert("target".into(), target);
        params.insert("action_uid".into(), Value::String(action_uid.to_string()));
        params.insert("outcome".into(), Value::String(outcome.to_string()));
        params.insert("details".into(), Value::Object(details));
        if let Some(location) = location {
            params.insert("location".into(), location.to_value());
        }
        sim.schedule_event_at(tick, INTERACTION_OUTCOME_EVENT, params);
    }
}

impl RuleModule for InteractionExecutionModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_command(
        &mut self,
        sim: &mut Simulation,
        command: &SimCommand,
        command_index: usize,
    ) -> SimResult<bool> {
        if command.command_type != INTERACTION_INTENT {
            return Ok(false);
        }
        self.handle_intent(sim, command, command_index);
        Ok(true)
    }

    fn on_event_executed(&mut self, sim: &mut Simulation, event: &SimEvent) -> SimResult<()> {
        if event.event_type == INTERACTION_EXECUTE_EVENT {
            self.handle_execute(sim, event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityState;
    use crate::world::{
        AnchorRecord, AnchorTarget, DoorFlags, DoorRecord, SpaceState, WorldState, LOCAL_SPACE_ROLE,
    };
    use hx_types::{CellCoord, MasterSeed, SQUARE_GRID_TOPOLOGY};
    use serde_json::json;

    fn params(value: Value) -> JsonMap {
        value.as_object().unwrap().clone()
    }

    fn sim_with_door(seed: u64, door_state: &str, locked: bool) -> Simulation {
        let mut topology = JsonMap::new();
        topology.insert("radius".into(), Value::from(3));
        let mut world =
            WorldState::create_with_topology(MasterSeed(seed), "hex_disk", &topology).unwrap();
        let mut square_params = JsonMap::new();
        square_params.insert("width".into(), Value::from(6));
        square_params.insert("height".into(), Value::from(6));
        let mut space =
            SpaceState::new("cellar", SQUARE_GRID_TOPOLOGY, LOCAL_SPACE_ROLE, square_params)
                .unwrap();
        space.doors.insert(
            "d1".into(),
            DoorRecord {
                door_id: "d1".into(),
                space_id: "cellar".into(),
                a: CellCoord::square(1, 1),
                b: CellCoord::square(2, 1),
                state: door_state.into(),
                flags: DoorFlags {
                    locked,
                    blocked: false,
                },
                metadata: JsonMap::new(),
            },
        );
        space.anchors.insert(
            "way_out".into(),
            AnchorRecord {
                anchor_id: "way_out".into(),
                space_id: "cellar".into(),
                coord: CellCoord::square(0, 0),
                kind: "exit".into(),
                target: AnchorTarget {
                    target_type: "space".into(),
                    space_id: Some("overworld".into()),
                    site_id: None,
                },
                metadata: JsonMap::new(),
            },
        );
        world.spaces.insert("cellar".into(), space);
        world.ensure_closed_door_occlusion_defaults();

        let mut sim = Simulation::new(world, MasterSeed(seed));
        sim.register_rule_module(Box::new(InteractionExecutionModule::new()))
            .unwrap();
        let mut entity = EntityState::new("sapper", 1.0, 1.0);
        entity.space_id = "cellar".into();
        sim.add_entity(entity);
        sim
    }

    fn door_intent(tick: u64, interaction_type: &str, duration: u64) -> hx_api::SimCommand {
        hx_api::SimCommand::new(
            Tick(tick),
            Some("sapper"),
            INTERACTION_INTENT,
            params(json!({
                "interaction_type": interaction_type,
                "target": {"kind": "door", "id": "d1"},
                "duration_ticks": duration,
            })),
        )
    }

    #[test]
    fn opening_a_door_clears_its_occlusion_edge() {
        let mut sim = sim_with_door(1, "closed", false);
        assert_eq!(
            sim.state.world.get_structure_occlusion_value(
                "cellar",
                CellCoord::square(1, 1),
                CellCoord::square(2, 1)
            ),
            1
        );

        sim.append_command(door_intent(0, "open", 2));
        sim.advance_ticks(3).unwrap();

        let space = &sim.state.world.spaces["cellar"];
        assert_eq!(space.doors["d1"].state, "open");
        assert_eq!(
            sim.state.world.get_structure_occlusion_value(
                "cellar",
                CellCoord::square(1, 1),
                CellCoord::square(2, 1)
            ),
            0
        );
    }

    #[test]
    fn toggling_restores_the_default_edge() {
        let mut sim = sim_with_door(2, "open", false);
        sim.append_command(door_intent(0, "toggle", 0));
        sim.advance_ticks(1).unwrap();

        assert_eq!(sim.state.world.spaces["cellar"].doors["d1"].state, "closed");
        assert_eq!(
            sim.state.world.get_structure_occlusion_value(
                "cellar",
                CellCoord::square(1, 1),
                CellCoord::square(2, 1)
            ),
            1
        );
    }

    #[test]
    fn locked_door_reports_blocked() {
        let mut sim = sim_with_door(3, "closed", true);
        sim.append_command(door_intent(0, "open", 0));
        sim.advance_ticks(1).unwrap();

        let outcome = sim
            .get_event_trace()
            .iter()
            .find(|entry| entry.event_type == INTERACTION_OUTCOME_EVENT)
            .unwrap();
        assert_eq!(
            outcome.params.get("outcome"),
            Some(&Value::String("blocked".into()))
        );
        assert_eq!(sim.state.world.spaces["cellar"].doors["d1"].state, "closed");
    }

    #[test]
    fn anchor_exit_appends_transition_command() {
        let mut sim = sim_with_door(4, "closed", false);
        sim.append_command(hx_api::SimCommand::new(
            Tick(0),
            Some("sapper"),
            INTERACTION_INTENT,
            params(json!({
                "interaction_type": "exit",
                "target": {"kind": "anchor", "id": "way_out"},
                "duration_ticks": 0,
            })),
        ));
        sim.advance_ticks(2).unwrap();

        // The anchor queued a transition for tick 1; by tick 2 the sapper is
        // back on the overworld at its default spawn.
        assert_eq!(sim.entity("sapper").unwrap().space_id, "overworld");
        assert!(sim
            .input_log()
            .iter()
            .any(|command| command.command_type == TRANSITION_SPACE));
    }

    #[test]
    fn duplicate_execute_reports_already_applied() {
        let mut sim = sim_with_door(5, "closed", false);
        let execute_params = params(json!({
            "tick": 0,
            "entity_id": "sapper",
            "interaction_type": "open",
            "target": {"kind": "door", "id": "d1"},
            "action_uid": "0:0",
            "duration_ticks": 0,
        }));
        sim.schedule_event_at(Tick(0), INTERACTION_EXECUTE_EVENT, execute_params.clone());
        sim.schedule_event_at(Tick(0), INTERACTION_EXECUTE_EVENT, execute_params);
        sim.advance_ticks(1).unwrap();

        let outcomes: Vec<&str> = sim
            .get_event_trace()
            .iter()
            .filter(|entry| entry.event_type == INTERACTION_OUTCOME_EVENT)
            .map(|entry| entry.params.get("outcome").unwrap().as_str().unwrap())
            .collect();
        assert_eq!(outcomes, vec!["applied", "already_applied"]);
    }
}

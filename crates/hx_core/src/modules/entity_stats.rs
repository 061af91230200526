//! # Entity stats
//!
//! Delayed set/remove patches against the per-entity stats bag. Values are
//! restricted to JSON primitives so stats stay on the hash surface.

use serde_json::Value;

use hx_api::commands::ENTITY_STAT_INTENT;
use hx_api::{SimCommand, SimEvent, SimResult};
use hx_types::{json, JsonMap, Tick};

use crate::rules::RuleModule;
use crate::sim::Simulation;
use crate::MAX_EXECUTED_ACTION_UIDS;

pub const ENTITY_STAT_EXECUTE_EVENT: &str = "entity_stat_execute";
pub const ENTITY_STAT_OUTCOME_EVENT: &str = "entity_stat_outcome";

const LEDGER_KEY: &str = "executed_action_uids";

#[derive(Default)]
pub struct EntityStatsExecutionModule;

impl EntityStatsExecutionModule {
    pub const NAME: &'static str = "entity_stats";

    pub fn new() -> Self {
        EntityStatsExecutionModule
    }

    fn ledger(sim: &Simulation) -> Vec<String> {
        json::uid_ledger(&sim.get_rules_state(Self::NAME), LEDGER_KEY, MAX_EXECUTED_ACTION_UIDS)
    }

    fn mark_executed(sim: &mut Simulation, action_uid: &str) {
        if action_uid.is_empty() {
            return;
        }
        let mut state = sim.get_rules_state(Self::NAME);
        let mut ledger = json::uid_ledger(&state, LEDGER_KEY, MAX_EXECUTED_ACTION_UIDS);
        json::push_uid_fifo(&mut ledger, action_uid, MAX_EXECUTED_ACTION_UIDS);
        json::set_uid_ledger(&mut state, LEDGER_KEY, &ledger);
        sim.set_rules_state(Self::NAME, state);
    }

    fn handle_intent(&self, sim: &mut Simulation, command: &SimCommand, command_index: usize) {
        let action_uid = command.action_uid(command_index);
        let params = &command.params;
        let op = json::get_str(params, "op").map(str::to_string);
        let key = json::get_str(params, "key").map(str::to_string);
        let duration_ticks = json::get_u64(params, "duration_ticks");
        let target_entity_id = json::get_str(params, "target_entity_id")
            .map(str::to_string)
            .or_else(|| command.entity_id.clone());

        let rejection = if op.as_deref().map(|o| o != "set" && o != "remove").unwrap_or(true) {
            Some("invalid_op")
        } else if key.is_none() {
            Some("invalid_key")
        } else if duration_ticks.is_none() {
            Some("invalid_duration_ticks")
        } else if op.as_deref() == Some("set") && !params.contains_key("value") {
            Some("missing_value")
        } else {
            None
        };

        if let Some(detail) = rejection {
            self.schedule_outcome(
                sim,
                command.tick,
                &action_uid,
                target_entity_id.as_deref(),
                op.as_deref().unwrap_or(""),
                key.as_deref().unwrap_or(""),
                "invalid_params",
                Some(detail),
            );
            return;
        }

        let mut execute_params = JsonMap::new();
        execute_params.insert("action_uid".into(), Value::String(action_uid));
        execute_params.insert(
            "entity_id".into(),
            target_entity_id.map(Value::String).unwrap_or(Value::Null),
        );
        execute_params.insert("op".into(), Value::String(op.expect("validated above")));
        execute_params.insert("key".into(), Value::String(key.expect("validated above")));
        if let Some(value) = params.get("value") {
            execute_params.insert("value".into(), value.clone());
        }
        sim.schedule_event_at(
            command.tick + duration_ticks.unwrap(),
            ENTITY_STAT_EXECUTE_EVENT,
            execute_params,
        );
    }

    fn handle_execute(&self, sim: &mut Simulation, event: &SimEvent) {
        let action_uid = json::get_str(&event.params, "action_uid")
            .unwrap_or("")
            .to_string();
        let entity_id = json::get_str(&event.params, "entity_id")
            .unwrap_or("")
            .to_string();
        let op = json::get_str(&event.params, "op").unwrap_or("").to_string();
        let key = json::get_str(&event.params, "key").unwrap_or("").to_string();

        if Self::ledger(sim).iter().any(|uid| uid == &action_uid) {
            self.schedule_outcome(
                sim,
                event.tick,
                &action_uid,
                Some(&entity_id),
                &op,
                &key,
                "already_applied",
                None,
            );
            return;
        }

        if action_uid.is_empty()
            || (op != "set" && op != "remove")
            || key.is_empty()
            || (op == "set" && !event.params.contains_key("value"))
        {
            self.schedule_outcome(
                sim,
                event.tick,
                &action_uid,
                Some(&entity_id),
                &op,
                &key,
                "invalid_params",
                Some("invalid_execute_payload"),
            );
            Self::mark_executed(sim, &action_uid);
            return;
        }

        if sim.entity(&entity_id).is_none() {
            self.schedule_outcome(
                sim,
                event.tick,
                &action_uid,
                Some(&entity_id),
                &op,
                &key,
                "unknown_entity",
                None,
            );
            Self::mark_executed(sim, &action_uid);
            return;
        }

        let mut patch = JsonMap::new();
        patch.insert("op".into(), Value::String(op.clone()));
        patch.insert("key".into(), Value::String(key.clone()));
        if let Some(value) = event.params.get("value") {
            patch.insert("value".into(), value.clone());
        }
        let stats = sim.entity(&entity_id).map(|e| e.stats.clone()).unwrap_or_default();
        match Simulation::apply_stat_patch(&stats, &patch) {
            Ok(updated) => {
                if let Some(entity) = sim.entity_mut(&entity_id) {
                    entity.stats = updated;
                }
                Self::mark_executed(sim, &action_uid);
                self.schedule_outcome(
                    sim,
                    event.tick,
                    &action_uid,
                    Some(&entity_id),
                    &op,
                    &key,
                    "applied",
                    None,
                );
            }
            Err(_) => {
                Self::mark_executed(sim, &action_uid);
                self.schedule_outcome(
                    sim,
                    event.tick,
                    &action_uid,
                    Some(&entity_id),
                    &op,
                    &key,
                    "invalid_params",
                    Some("invalid_stat_value"),
                );
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn schedule_outcome(
        &self,
        sim: &mut Simulation,
        tick: Tick,
        action_uid: &str,
        entity_id: Option<&str>,
        op: &str,
        key: &str,
        outcome: &str,
        detail: Option<&str>,
    ) {
        let mut params = JsonMap::new();
        params.insert("tick".into(), Value::from(tick.as_u64()));
        params.insert("action_uid".into(), Value::String(action_uid.to_string()));
        params.insert(
            "entity_id".into(),
            entity_id
                .map(|id| Value::String(id.to_string()))
                .unwrap_or(Value::Null),
        );
        params.insert("op".into(), Value::String(op.to_string()));
        params.insert("key".into(), Value::String(key.to_string()));
        params.insert("outcome".into(), Value::String(outcome.to_string()));
        let mut details = JsonMap::new();
        if let Some(detail) = detail {
            details.insert("reason".into(), Value::String(detail.to_string()));
        }
        params.insert("details".into(), Value::Object(details));
        sim.schedule_event_at(tick, ENTITY_STAT_OUTCOME_EVENT, params);
    }
}

impl RuleModule for EntityStatsExecutionModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_command(
        &mut self,
        sim: &mut Simulation,
        command: &SimCommand,
        command_index: usize,
    ) -> SimResult<bool> {
        if command.command_type != ENTITY_STAT_INTENT {
            return Ok(false);
        }
        self.handle_intent(sim, command, command_index);
        Ok(true)
    }

    fn on_event_executed(&mut self, sim: &mut Simulation, event: &SimEvent) -> SimResult<()> {
        if event.event_type == ENTITY_STAT_EXECUTE_EVENT {
            self.handle_execute(sim, event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityState;
    use crate::world::WorldState;
    use hx_types::{HexCoord, MasterSeed};
    use serde_json::json;

    fn params(value: Value) -> JsonMap {
        value.as_object().unwrap().clone()
    }

    fn stats_sim(seed: u64) -> Simulation {
        let mut topology = JsonMap::new();
        topology.insert("radius".into(), Value::from(3));
        let world =
            WorldState::create_with_topology(MasterSeed(seed), "hex_disk", &topology).unwrap();
        let mut sim = Simulation::new(world, MasterSeed(seed));
        sim.register_rule_module(Box::new(EntityStatsExecutionModule::new()))
            .unwrap();
        sim.add_entity(EntityState::from_hex("scout", HexCoord::new(0, 0)));
        sim
    }

    #[test]
    fn set_patch_applies_after_duration() {
        let mut sim = stats_sim(1);
        sim.append_command(hx_api::SimCommand::new(
            Tick(0),
            Some("scout"),
            ENTITY_STAT_INTENT,
            params(json!({"op": "set", "key": "hearing", "value": 40, "duration_ticks": 2})),
        ));
        sim.advance_ticks(2).unwrap();
        assert!(sim.entity("scout").unwrap().stats.is_empty());
        sim.advance_ticks(1).unwrap();
        assert_eq!(
            sim.entity("scout").unwrap().stats.get("hearing"),
            Some(&Value::from(40))
        );
    }

    #[test]
    fn remove_patch_deletes_key() {
        let mut sim = stats_sim(2);
        sim.entity_mut("scout")
            .unwrap()
            .stats
            .insert("luck".into(), Value::from(7));
        sim.append_command(hx_api::SimCommand::new(
            Tick(0),
            Some("scout"),
            ENTITY_STAT_INTENT,
            params(json!({"op": "remove", "key": "luck", "duration_ticks": 0})),
        ));
        sim.advance_ticks(1).unwrap();
        assert!(!sim.entity("scout").unwrap().stats.contains_key("luck"));
    }

    #[test]
    fn non_primitive_value_rejected() {
        let mut sim = stats_sim(3);
        sim.append_command(hx_api::SimCommand::new(
            Tick(0),
            Some("scout"),
            ENTITY_STAT_INTENT,
            params(json!({"op": "set", "key": "gear", "value": {"nested": true}, "duration_ticks": 0})),
        ));
        sim.advance_ticks(1).unwrap();

        let outcome = sim
            .get_event_trace()
            .iter()
            .find(|entry| entry.event_type == ENTITY_STAT_OUTCOME_EVENT)
            .unwrap();
        assert_eq!(
            outcome.params.get("outcome"),
            Some(&Value::String("invalid_params".into()))
        );
        assert!(sim.entity("scout").unwrap().stats.is_empty());
    }

    #[test]
    fn duplicate_execute_reports_already_applied() {
        let mut sim = stats_sim(4);
        let execute_params = params(json!({
            "action_uid": "0:0",
            "entity_id": "scout",
            "op": "set",
            "key": "vigor",
            "value": 3,
        }));
        sim.schedule_event_at(Tick(0), ENTITY_STAT_EXECUTE_EVENT, execute_params.clone());
        sim.schedule_event_at(Tick(0), ENTITY_STAT_EXECUTE_EVENT, execute_params);
        sim.advance_ticks(1).unwrap();

        let outcomes: Vec<&str> = sim
            .get_event_trace()
            .iter()
            .filter(|entry| entry.event_type == ENTITY_STAT_OUTCOME_EVENT)
            .map(|entry| entry.params.get("outcome").unwrap().as_str().unwrap())
            .collect();
        assert_eq!(outcomes, vec!["applied", "already_applied"]);
        assert_eq!(
            sim.entity("scout").unwrap().stats.get("vigor"),
            Some(&Value::from(3))
        );
    }

    #[test]
    fn missing_value_for_set_rejected_at_intent() {
        let mut sim = stats_sim(5);
        sim.append_command(hx_api::SimCommand::new(
            Tick(0),
            Some("scout"),
            ENTITY_STAT_INTENT,
            params(json!({"op": "set", "key": "vigor", "duration_ticks": 1})),
        ));
        sim.advance_ticks(1).unwrap();
        let outcome = sim
            .get_event_trace()
            .iter()
            .find(|entry| entry.event_type == ENTITY_STAT_OUTCOME_EVENT)
            .unwrap();
        assert_eq!(
            outcome.params.get("outcome"),
            Some(&Value::String("invalid_params".into()))
        );
    }
}

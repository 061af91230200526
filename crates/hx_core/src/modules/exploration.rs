//! # Exploration
//!
//! Timed search/listen/rest actions with scheduled completion outcomes.

use serde_json::Value;

use hx_api::commands::EXPLORE_INTENT;
use hx_api::{SimCommand, SimEvent, SimResult};
use hx_types::{json, JsonMap, LocationRef, Tick};

use crate::rules::RuleModule;
use crate::sim::Simulation;
use crate::MAX_EXECUTED_ACTION_UIDS;

pub const EXPLORE_EXECUTE_EVENT: &str = "explore_execute";
pub const EXPLORATION_OUTCOME_EVENT: &str = "exploration_outcome";

const SUPPORTED_ACTIONS: [&str; 3] = ["search", "listen", "rest"];
const SCHEDULED_KEY: &str = "scheduled_action_uids";
const COMPLETED_KEY: &str = "completed_action_uids";

#[derive(Default)]
pub struct ExplorationExecutionModule;

impl ExplorationExecutionModule {
    pub const NAME: &'static str = "exploration";

    pub fn new() -> Self {
        ExplorationExecutionModule
    }

    fn ledgers(sim: &Simulation) -> (Vec<String>, Vec<String>) {
        let state = sim.get_rules_state(Self::NAME);
        (
            json::uid_ledger(&state, SCHEDULED_KEY, MAX_EXECUTED_ACTION_UIDS),
            json::uid_ledger(&state, COMPLETED_KEY, MAX_EXECUTED_ACTION_UIDS),
        )
    }

    fn store_ledgers(sim: &mut Simulation, scheduled: &[String], completed: &[String]) {
        let mut state = sim.get_rules_state(Self::NAME);
        json::set_uid_ledger(&mut state, SCHEDULED_KEY, scheduled);
        json::set_uid_ledger(&mut state, COMPLETED_KEY, completed);
        sim.set_rules_state(Self::NAME, state);
    }

    fn handle_intent(&self, sim: &mut Simulation, command: &SimCommand, command_index: usize) {
        let action_uid = command.action_uid(command_index);
        let (mut scheduled, completed) = Self::ledgers(sim);

        let action = json::get_str(&command.params, "action").map(str::to_string);
        let duration_ticks = json::get_u64(&command.params, "duration_ticks");
        let entity_id = command.entity_id.clone();

        if action
            .as_deref()
            .map(|a| !SUPPORTED_ACTIONS.contains(&a))
            .unwrap_or(true)
        {
            self.schedule_outcome(
                sim,
                command.tick,
                entity_id.as_deref(),
                action.as_deref().unwrap_or(""),
                &action_uid,
                "invalid_action",
                None,
            );
            return;
        }
        let action = action.expect("checked above");
        if duration_ticks.filter(|d| *d > 0).is_none() {
            self.schedule_outcome(
                sim,
                command.tick,
                entity_id.as_deref(),
                &action,
                &action_uid,
                "invalid_duration_ticks",
                None,
            );
            return;
        }
        let Some(entity_id) = entity_id.filter(|id| sim.entity(id).is_some()) else {
            self.schedule_outcome(
                sim,
                command.tick,
                command.entity_id.as_deref(),
                &action,
                &action_uid,
                "unknown_entity",
                None,
            );
            return;
        };
        if scheduled.iter().any(|uid| uid == &action_uid)
            || completed.iter().any(|uid| uid == &action_uid)
        {
            let location = sim.entity_location_ref(&entity_id);
            self.schedule_outcome(
                sim,
                command.tick,
                Some(&entity_id),
                &action,
                &action_uid,
                "already_scheduled",
                location,
            );
            return;
        }

        let mut execute_params = JsonMap::new();
        execute_params.insert("entity_id".into(), Value::String(entity_id));
        execute_params.insert("action".into(), Value::String(action));
        execute_params.insert("action_uid".into(), Value::String(action_uid.clone()));
        sim.schedule_event_at(
            command.tick + duration_ticks.unwrap(),
            EXPLORE_EXECUTE_EVENT,
            execute_params,
        );

        json::push_uid_fifo(&mut scheduled, &action_uid, MAX_EXECUTED_ACTION_UIDS);
        Self::store_ledgers(sim, &scheduled, &completed);
    }

    fn handle_execute(&self, sim: &mut Simulation, event: &SimEvent) {
        let action_uid = json::get_str(&event.params, "action_uid")
            .unwrap_or("")
            .to_string();
        if action_uid.is_empty() {
            return;
        }

        let (mut scheduled, mut completed) = Self::ledgers(sim);
        if completed.iter().any(|uid| uid == &action_uid) {
            return;
        }

        let entity_id = json::get_str(&event.params, "entity_id").map(str::to_string);
        let action = json::get_str(&event.params, "action").unwrap_or("").to_string();
        let location = entity_id
            .as_deref()
            .and_then(|id| sim.entity_location_ref(id));

        self.schedule_outcome(
            sim,
            event.tick,
            entity_id.as_deref(),
            &action,
            &action_uid,
            "completed",
            location,
        );

        scheduled.retain(|uid| uid != &action_uid);
        json::push_uid_fifo(&mut completed, &action_uid, MAX_EXECUTED_ACTION_UIDS);
        Self::store_ledgers(sim, &scheduled, &completed);
    }

    fn schedule_outcome(
        &self,
        sim: &mut Simulation,
        tick: Tick,
        entity_id: Option<&str>,
        action: &str,
        action_uid: &str,
        outcome: &str,
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
        params.insert("action".into(), Value::String(action.to_string()));
        params.insert("action_uid".into(), Value::String(action_uid.to_string()));
        params.insert("outcome".into(), Value::String(outcome.to_string()));
        if let Some(location) = location {
            params.insert("location".into(), location.to_value());
        }
        sim.schedule_event_at(tick, EXPLORATION_OUTCOME_EVENT, params);
    }
}

impl RuleModule for ExplorationExecutionModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_command(
        &mut self,
        sim: &mut Simulation,
        command: &SimCommand,
        command_index: usize,
    ) -> SimResult<bool> {
        if command.command_type != EXPLORE_INTENT {
            return Ok(false);
        }
        self.handle_intent(sim, command, command_index);
        Ok(true)
    }

    fn on_event_executed(&mut self, sim: &mut Simulation, event: &SimEvent) -> SimResult<()> {
        if event.event_type == EXPLORE_EXECUTE_EVENT {
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

    fn explorer_sim(seed: u64) -> Simulation {
        let mut topology = JsonMap::new();
        topology.insert("radius".into(), Value::from(3));
        let world =
            WorldState::create_with_topology(MasterSeed(seed), "hex_disk", &topology).unwrap();
        let mut sim = Simulation::new(world, MasterSeed(seed));
        sim.register_rule_module(Box::new(ExplorationExecutionModule::new()))
            .unwrap();
        sim.add_entity(EntityState::from_hex("scout", HexCoord::new(0, 0)));
        sim
    }

    #[test]
    fn search_completes_after_duration() {
        let mut sim = explorer_sim(1);
        sim.append_command(hx_api::SimCommand::new(
            Tick(0),
            Some("scout"),
            EXPLORE_INTENT,
            params(json!({"action": "search", "duration_ticks": 3})),
        ));
        sim.advance_ticks(4).unwrap();

        let outcome = sim
            .get_event_trace()
            .iter()
            .find(|entry| entry.event_type == EXPLORATION_OUTCOME_EVENT)
            .unwrap();
        assert_eq!(outcome.tick, Tick(3));
        assert_eq!(
            outcome.params.get("outcome"),
            Some(&Value::String("completed".into()))
        );
        assert!(outcome.params.contains_key("location"));
    }

    #[test]
    fn unsupported_action_rejected() {
        let mut sim = explorer_sim(2);
        sim.append_command(hx_api::SimCommand::new(
            Tick(0),
            Some("scout"),
            EXPLORE_INTENT,
            params(json!({"action": "burrow", "duration_ticks": 3})),
        ));
        sim.advance_ticks(1).unwrap();

        let outcome = sim
            .get_event_trace()
            .iter()
            .find(|entry| entry.event_type == EXPLORATION_OUTCOME_EVENT)
            .unwrap();
        assert_eq!(
            outcome.params.get("outcome"),
            Some(&Value::String("invalid_action".into()))
        );
    }

    #[test]
    fn zero_duration_rejected() {
        let mut sim = explorer_sim(3);
        sim.append_command(hx_api::SimCommand::new(
            Tick(0),
            Some("scout"),
            EXPLORE_INTENT,
            params(json!({"action": "rest", "duration_ticks": 0})),
        ));
        sim.advance_ticks(1).unwrap();

        let outcome = sim
            .get_event_trace()
            .iter()
            .find(|entry| entry.event_type == EXPLORATION_OUTCOME_EVENT)
            .unwrap();
        assert_eq!(
            outcome.params.get("outcome"),
            Some(&Value::String("invalid_duration_ticks".into()))
        );
    }

    #[test]
    fn duplicate_execute_is_ignored() {
        let mut sim = explorer_sim(4);
        let execute_params = params(json!({
            "entity_id": "scout",
            "action": "listen",
            "action_uid": "0:0",
        }));
        sim.schedule_event_at(Tick(0), EXPLORE_EXECUTE_EVENT, execute_params.clone());
        sim.schedule_event_at(Tick(0), EXPLORE_EXECUTE_EVENT, execute_params);
        sim.advance_ticks(1).unwrap();

        let completions = sim
            .get_event_trace()
            .iter()
            .filter(|entry| entry.event_type == EXPLORATION_OUTCOME_EVENT)
            .count();
        assert_eq!(completions, 1);
    }
}

//! # Encounter action execution
//!
//! Turns normalized action stubs into world records. Each action carries a
//! deterministic `"<source_event_id>:<action_index>"` uid against a sorted
//! ledger; every action emits exactly one outcome event with a mutation tag.

use serde_json::Value;

use hx_api::{SimEvent, SimResult};
use hx_types::{json, JsonMap};

use crate::modules::encounter::ENCOUNTER_ACTION_STUB_EVENT;
use crate::modules::local_encounter::LOCAL_ENCOUNTER_REQUEST_EVENT;
use crate::rules::RuleModule;
use crate::sim::Simulation;
use crate::world::CAMPAIGN_SPACE_ROLE;
use crate::MAX_EXECUTED_ACTION_UIDS;

pub const ENCOUNTER_ACTION_EXECUTE_EVENT: &str = "encounter_action_execute";
pub const ENCOUNTER_ACTION_OUTCOME_EVENT: &str = "encounter_action_outcome";

const LEDGER_KEY: &str = "executed_action_uids";
const SUPPORTED_ACTION_TYPES: [&str; 4] = [
    "signal_intent",
    "track_intent",
    "spawn_intent",
    "local_encounter_intent",
];

#[derive(Default)]
pub struct EncounterActionExecutionModule;

impl EncounterActionExecutionModule {
    pub const NAME: &'static str = "encounter_action_execution";

    pub fn new() -> Self {
        EncounterActionExecutionModule
    }

    fn ledger(sim: &Simulation) -> Vec<String> {
        json::uid_ledger(&sim.get_rules_state(Self::NAME), LEDGER_KEY, MAX_EXECUTED_ACTION_UIDS)
    }

    fn store_ledger(sim: &mut Simulation, ledger: &[String]) {
        let mut state = sim.get_rules_state(Self::NAME);
        json::set_uid_ledger(&mut state, LEDGER_KEY, ledger);
        sim.set_rules_state(Self::NAME, state);
    }

    /// Shift the stub one tick and stamp its provenance.
    fn schedule_execute(&self, sim: &mut Simulation, event: &SimEvent) {
        let mut params = event.params.clone();
        params.insert("source_event_id".into(), Value::String(event.event_id.clone()));
        params.insert("source_tick".into(), Value::from(event.tick.as_u64()));
        sim.schedule_event_at(event.tick + 1, ENCOUNTER_ACTION_EXECUTE_EVENT, params);
    }

    fn optional_expires_tick(params: &JsonMap, created_tick: u64) -> Option<u64> {
        if let Some(expires) = json::get_u64(params, "expires_tick") {
            return Some(expires);
        }
        json::get_u64(params, "ttl_ticks").map(|ttl| created_tick + ttl)
    }

    fn passthrough_blob(params: &JsonMap) -> JsonMap {
        let mut blob = JsonMap::new();
        for key in [
            "tick", "context", "trigger", "location", "roll", "category", "table_id", "entry_id",
            "entry_tags",
        ] {
            blob.insert(
                key.to_string(),
                params.get(key).cloned().unwrap_or(Value::Null),
            );
        }
        blob
    }

    fn execute_actions(&self, sim: &mut Simulation, event: &SimEvent) {
        let source_event_id = json::get_str(&event.params, "source_event_id")
            .unwrap_or("")
            .to_string();
        let Some(location) = event.params.get("location").and_then(Value::as_object).cloned()
        else {
            return;
        };
        let actions: Vec<JsonMap> = event
            .params
            .get("actions")
            .and_then(Value::as_array)
            .map(|rows| rows.iter().filter_map(Value::as_object).cloned().collect())
            .unwrap_or_default();

        let mut ledger = Self::ledger(sim);

        for (action_index, action) in actions.iter().enumerate() {
            let action_uid = format!("{source_event_id}:{action_index}");
            let action_type = json::get_str(action, "action_type").unwrap_or("").to_string();
            let template_id = json::get_str(action, "template_id").unwrap_or("").to_string();
            let action_params = action
                .get("params")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let quantity = json::get_u64(action, "quantity")
                .or_else(|| json::get_u64(&action_params, "quantity"))
                .unwrap_or(1)
                .max(1);

            let mut outcome = "executed";
            let mut mutation = "none";

            if ledger.iter().any(|uid| uid == &action_uid) {
                outcome = "already_executed";
            } else if !SUPPORTED_ACTION_TYPES.contains(&action_type.as_str()) {
                outcome = "ignored_unsupported";
                json::push_uid_fifo(&mut ledger, &action_uid, MAX_EXECUTED_ACTION_UIDS);
            } else {
                match action_type.as_str() {
                    "signal_intent" => {
                        let mut record = JsonMap::new();
                        record.insert("signal_uid".into(), Value::String(action_uid.clone()));
                        record.insert("template_id".into(), Value::String(template_id.clone()));
                        record.insert("location".into(), Value::Object(location.clone()));
                        record.insert("created_tick".into(), Value::from(event.tick.as_u64()));
                        record.insert("params".into(), Value::Object(action_params.clone()));
                        record.insert(
                            "expires_tick".into(),
                            Self::optional_expires_tick(&action_params, event.tick.as_u64())
                                .map(Value::from)
                                .unwrap_or(Value::Null),
                        );
                        let created = sim.state.world.upsert_signal(record);
                        mutation = if created { "signal_created" } else { "signal_existing" };
                        json::push_uid_fifo(&mut ledger, &action_uid, MAX_EXECUTED_ACTION_UIDS);
                    }
                    "track_intent" => {
                        let mut record = JsonMap::new();
                        record.insert("track_uid".into(), Value::String(action_uid.clone()));
                        record.insert("template_id".into(), Value::String(template_id.clone()));
                        record.insert("location".into(), Value::Object(location.clone()));
                        record.insert("created_tick".into(), Value::from(event.tick.as_u64()));
                        record.insert("params".into(), Value::Object(action_params.clone()));
                        record.insert(
                            "expires_tick".into(),
                            Self::optional_expires_tick(&action_params, event.tick.as_u64())
                                .map(Value::from)
                                .unwrap_or(Value::Null),
                        );
                        let created = sim.state.world.upsert_track(record);
                        mutation = if created { "track_created" } else { "track_existing" };
                        json::push_uid_fifo(&mut ledger, &action_uid, MAX_EXECUTED_ACTION_UIDS);
                    }
                    "spawn_intent" => {
                        let mut descriptor = JsonMap::new();
                        descriptor.insert("created_tick".into(), Value::from(event.tick.as_u64()));
                        descriptor.insert("location".into(), Value::Object(location.clone()));
                        descriptor.insert("template_id".into(), Value::String(template_id.clone()));
                        descriptor.insert("quantity".into(), Value::from(quantity));
                        descriptor.insert(
                            "expires_tick".into(),
                            Self::optional_expires_tick(&action_params, event.tick.as_u64())
                                .map(Value::from)
                                .unwrap_or(Value::Null),
                        );
                        descriptor.insert(
                            "source_event_id".into(),
                            Value::String(source_event_id.clone()),
                        );
                        descriptor.insert("action_uid".into(), Value::String(action_uid.clone()));
                        descriptor.insert("params".into(), Value::Object(action_params.clone()));
                        for (key, value) in action {
                            if descriptor.contains_key(key)
                                || ["action_type", "template_id", "quantity", "params"]
                                    .contains(&key.as_str())
                            {
                                continue;
                            }
                            descriptor.insert(key.clone(), value.clone());
                        }
                        sim.state.world.append_spawn_descriptor(descriptor);
                        mutation = "spawn_descriptor_recorded";
                        json::push_uid_fifo(&mut ledger, &action_uid, MAX_EXECUTED_ACTION_UIDS);
                    }
                    "local_encounter_intent" => {
                        let from_space_id = json::get_str(&location, "space_id").unwrap_or("");
                        let is_campaign = sim
                            .state
                            .world
                            .spaces
                            .get(from_space_id)
                            .map(|space| space.role == CAMPAIGN_SPACE_ROLE)
                            .unwrap_or(false);
                        if !is_campaign {
                            outcome = "ignored_invalid_origin";
                            json::push_uid_fifo(&mut ledger, &action_uid, MAX_EXECUTED_ACTION_UIDS);
                        } else {
                            let passthrough = Self::passthrough_blob(&event.params);
                            let suggested = json::get_str(&action_params, "suggested_local_template_id")
                                .map(str::to_string)
                                .or_else(|| {
                                    if template_id.is_empty() {
                                        None
                                    } else {
                                        Some(template_id.clone())
                                    }
                                });
                            let mut request = JsonMap::new();
                            request.insert("action_uid".into(), Value::String(action_uid.clone()));
                            request.insert(
                                "from_space_id".into(),
                                Value::String(from_space_id.to_string()),
                            );
                            request.insert("from_location".into(), Value::Object(location.clone()));
                            request.insert(
                                "suggested_local_template_id".into(),
                                suggested.map(Value::String).unwrap_or(Value::Null),
                            );
                            for (key, value) in &passthrough {
                                request.insert(key.clone(), value.clone());
                            }
                            request.insert(
                                "encounter_context_passthrough".into(),
                                Value::Object(passthrough),
                            );
                            sim.schedule_event_at(
                                event.tick + 1,
                                LOCAL_ENCOUNTER_REQUEST_EVENT,
                                request,
                            );
                            mutation = "local_encounter_requested";
                            json::push_uid_fifo(&mut ledger, &action_uid, MAX_EXECUTED_ACTION_UIDS);
                        }
                    }
                    _ => unreachable!("supported set checked above"),
                }
            }

            let mut outcome_params = JsonMap::new();
            outcome_params.insert(
                "source_event_id".into(),
                Value::String(source_event_id.clone()),
            );
            outcome_params.insert(
                "execute_event_id".into(),
                Value::String(event.event_id.clone()),
            );
            outcome_params.insert("action_index".into(), Value::from(action_index as u64));
            outcome_params.insert("action_uid".into(), Value::String(action_uid));
            outcome_params.insert("action_type".into(), Value::String(action_type));
            outcome_params.insert("template_id".into(), Value::String(template_id));
            outcome_params.insert("location".into(), Value::Object(location.clone()));
            outcome_params.insert("quantity".into(), Value::from(quantity));
            outcome_params.insert("outcome".into(), Value::String(outcome.to_string()));
            outcome_params.insert("mutation".into(), Value::String(mutation.to_string()));
            sim.schedule_event_at(event.tick + 1, ENCOUNTER_ACTION_OUTCOME_EVENT, outcome_params);
        }

        Self::store_ledger(sim, &ledger);
    }
}

impl RuleModule for EncounterActionExecutionModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_event_executed(&mut self, sim: &mut Simulation, event: &SimEvent) -> SimResult<()> {
        match event.event_type.as_str() {
            ENCOUNTER_ACTION_STUB_EVENT => self.schedule_execute(sim, event),
            ENCOUNTER_ACTION_EXECUTE_EVENT => self.execute_actions(sim, event),
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::simulation_hash;
    use crate::world::WorldState;
    use hx_types::{MasterSeed, Tick};
    use serde_json::json;

    fn params(value: Value) -> JsonMap {
        value.as_object().unwrap().clone()
    }

    fn exec_sim(seed: u64) -> Simulation {
        let mut topology = JsonMap::new();
        topology.insert("radius".into(), Value::from(4));
        let world =
            WorldState::create_with_topology(MasterSeed(seed), "hex_disk", &topology).unwrap();
        let mut sim = Simulation::new(world, MasterSeed(seed));
        sim.register_rule_module(Box::new(EncounterActionExecutionModule::new()))
            .unwrap();
        sim
    }

    fn execute_event_params(actions: Value) -> JsonMap {
        params(json!({
            "source_event_id": "evt-900",
            "source_tick": 0,
            "location": {"space_id": "overworld", "topology_type": "overworld_hex", "coord": {"q": 0, "r": 0}},
            "actions": actions,
        }))
    }

    #[test]
    fn mixed_action_list_executes_in_order() {
        let mut sim = exec_sim(17);
        sim.schedule_event_at(
            Tick(0),
            ENCOUNTER_ACTION_EXECUTE_EVENT,
            execute_event_params(json!([
                {"action_type": "signal_intent", "template_id": "omens.crows", "params": {"ttl_ticks": 3}},
                {"action_type": "weather_shift", "template_id": "cold.front", "params": {}},
                {"action_type": "track_intent", "template_id": "tracks.bootprint", "params": {}},
            ])),
        );
        sim.advance_ticks(8).unwrap();

        let outcomes: Vec<(String, String)> = sim
            .get_event_trace()
            .iter()
            .filter(|entry| entry.event_type == ENCOUNTER_ACTION_OUTCOME_EVENT)
            .map(|entry| {
                (
                    json::get_str(&entry.params, "outcome").unwrap().to_string(),
                    json::get_str(&entry.params, "mutation").unwrap().to_string(),
                )
            })
            .collect();
        assert_eq!(
            outcomes,
            vec![
                ("executed".into(), "signal_created".into()),
                ("ignored_unsupported".into(), "none".into()),
                ("executed".into(), "track_created".into()),
            ]
        );
        assert_eq!(sim.state.world.signals.len(), 1);
        assert_eq!(sim.state.world.tracks.len(), 1);
        assert_eq!(
            sim.state.world.signals[0].get("expires_tick"),
            Some(&Value::from(3))
        );
    }

    #[test]
    fn action_execution_regression_two_runs_match() {
        let run = |_: ()| {
            let mut sim = exec_sim(17);
            sim.schedule_event_at(
                Tick(0),
                ENCOUNTER_ACTION_EXECUTE_EVENT,
                execute_event_params(json!([
                    {"action_type": "signal_intent", "template_id": "omens.crows", "params": {"ttl_ticks": 3}},
                    {"action_type": "weather_shift", "template_id": "cold.front", "params": {}},
                    {"action_type": "track_intent", "template_id": "tracks.bootprint", "params": {}},
                ])),
            );
            sim.advance_ticks(8).unwrap();
            simulation_hash(&sim)
        };
        assert_eq!(run(()), run(()));
    }

    #[test]
    fn replayed_execute_reports_already_executed_without_mutation() {
        let mut sim = exec_sim(5);
        let event_params = execute_event_params(json!([
            {"action_type": "signal_intent", "template_id": "omens.crows", "params": {}},
        ]));
        sim.schedule_event_at(Tick(0), ENCOUNTER_ACTION_EXECUTE_EVENT, event_params.clone());
        sim.schedule_event_at(Tick(0), ENCOUNTER_ACTION_EXECUTE_EVENT, event_params);
        sim.advance_ticks(2).unwrap();

        let outcomes: Vec<&str> = sim
            .get_event_trace()
            .iter()
            .filter(|entry| entry.event_type == ENCOUNTER_ACTION_OUTCOME_EVENT)
            .map(|entry| json::get_str(&entry.params, "outcome").unwrap())
            .collect();
        assert_eq!(outcomes, vec!["executed", "already_executed"]);
        assert_eq!(sim.state.world.signals.len(), 1);
    }

    #[test]
    fn spawn_intent_records_descriptor_with_uid() {
        let mut sim = exec_sim(6);
        sim.schedule_event_at(
            Tick(0),
            ENCOUNTER_ACTION_EXECUTE_EVENT,
            execute_event_params(json!([
                {"action_type": "spawn_intent", "template_id": "npc.bandit", "quantity": 2, "params": {}},
            ])),
        );
        sim.advance_ticks(1).unwrap();

        assert_eq!(sim.state.world.spawn_descriptors.len(), 1);
        let descriptor = &sim.state.world.spawn_descriptors[0];
        assert_eq!(
            json::get_str(descriptor, "action_uid"),
            Some("evt-900:0")
        );
        assert_eq!(json::get_u64(descriptor, "quantity"), Some(2));
    }

    #[test]
    fn local_encounter_intent_from_local_space_is_ignored() {
        let mut sim = exec_sim(7);
        // Point the origin at a local-role space.
        let mut square_params = JsonMap::new();
        square_params.insert("width".into(), Value::from(4));
        square_params.insert("height".into(), Value::from(4));
        sim.state.world.spaces.insert(
            "den".into(),
            crate::world::SpaceState::new(
                "den",
                hx_types::SQUARE_GRID_TOPOLOGY,
                crate::world::LOCAL_SPACE_ROLE,
                square_params,
            )
            .unwrap(),
        );
        sim.schedule_event_at(
            Tick(0),
            ENCOUNTER_ACTION_EXECUTE_EVENT,
            params(json!({
                "source_event_id": "evt-901",
                "location": {"space_id": "den", "topology_type": "square_grid", "coord": {"x": 0, "y": 0}},
                "actions": [{"action_type": "local_encounter_intent", "template_id": "", "params": {}}],
            })),
        );
        sim.advance_ticks(2).unwrap();

        let outcome = sim
            .get_event_trace()
            .iter()
            .find(|entry| entry.event_type == ENCOUNTER_ACTION_OUTCOME_EVENT)
            .unwrap();
        assert_eq!(
            json::get_str(&outcome.params, "outcome"),
            Some("ignored_invalid_origin")
        );
    }
}

//! # Encounter pipeline (front half)
//!
//! Check, roll, categorization, table selection, and action normalization.
//! Every step schedules its successor one tick later, so a resolve request
//! always takes the same number of ticks to reach execution regardless of
//! where a save/load split falls.

use serde_json::Value;

use hx_api::events::TRAVEL_STEP;
use hx_api::{SimEvent, SimResult};
use hx_content::EncounterTable;
use hx_types::{json, JsonMap, LocationRef};

use crate::rules::RuleModule;
use crate::sim::Simulation;

pub const ENCOUNTER_CHECK_EVENT: &str = "encounter_check";
pub const ENCOUNTER_ROLL_EVENT: &str = "encounter_roll";
pub const ENCOUNTER_RESULT_STUB_EVENT: &str = "encounter_result_stub";
pub const ENCOUNTER_RESOLVE_REQUEST_EVENT: &str = "encounter_resolve_request";
pub const ENCOUNTER_SELECTION_STUB_EVENT: &str = "encounter_selection_stub";
pub const ENCOUNTER_ACTION_STUB_EVENT: &str = "encounter_action_stub";

pub const ENCOUNTER_CHECK_INTERVAL: u64 = 10;
pub const ENCOUNTER_CHANCE_PERCENT: u64 = 20;
pub const ENCOUNTER_COOLDOWN_TICKS: u64 = 30;
pub const ENCOUNTER_CONTEXT_GLOBAL: &str = "global";
pub const ENCOUNTER_TRIGGER_IDLE: &str = "idle";
pub const ENCOUNTER_TRIGGER_TRAVEL: &str = "travel";

// ============================================================================
// Check module
// ============================================================================

/// Deterministic eligibility gate: a periodic check task plus travel-step
/// triggers, rolling on the `encounter_check` stream behind a cooldown.
#[derive(Default)]
pub struct EncounterCheckModule;

impl EncounterCheckModule {
    pub const NAME: &'static str = "encounter_check";
    const TASK_NAME: &'static str = "encounter_check:global";
    const RNG_STREAM: &'static str = "encounter_check";

    const STATE_LAST_CHECK_TICK: &'static str = "last_check_tick";
    const STATE_CHECKS_EMITTED: &'static str = "checks_emitted";
    const STATE_ELIGIBLE_COUNT: &'static str = "eligible_count";
    const STATE_INELIGIBLE_STREAK: &'static str = "ineligible_streak";
    const STATE_COOLDOWN_UNTIL_TICK: &'static str = "cooldown_until_tick";

    pub fn new() -> Self {
        EncounterCheckModule
    }

    fn normalized_state(sim: &Simulation) -> JsonMap {
        let raw = sim.get_rules_state(Self::NAME);
        let mut state = JsonMap::new();
        state.insert(
            Self::STATE_LAST_CHECK_TICK.into(),
            Value::from(json::get_i64(&raw, Self::STATE_LAST_CHECK_TICK).unwrap_or(-1)),
        );
        state.insert(
            Self::STATE_CHECKS_EMITTED.into(),
            Value::from(json::get_u64(&raw, Self::STATE_CHECKS_EMITTED).unwrap_or(0)),
        );
        state.insert(
            Self::STATE_ELIGIBLE_COUNT.into(),
            Value::from(json::get_u64(&raw, Self::STATE_ELIGIBLE_COUNT).unwrap_or(0)),
        );
        state.insert(
            Self::STATE_INELIGIBLE_STREAK.into(),
            Value::from(json::get_u64(&raw, Self::STATE_INELIGIBLE_STREAK).unwrap_or(0)),
        );
        state.insert(
            Self::STATE_COOLDOWN_UNTIL_TICK.into(),
            Value::from(json::get_i64(&raw, Self::STATE_COOLDOWN_UNTIL_TICK).unwrap_or(-1)),
        );
        state
    }

    /// Default check location: the first entity's hex, else the first hex of
    /// the overworld.
    fn idle_location(sim: &Simulation) -> LocationRef {
        if let Some(entity) = sim.state.entities.values().next() {
            return LocationRef::from_overworld_hex(entity.hex_coord());
        }
        let first_hex = sim
            .state
            .world
            .overworld()
            .hexes
            .keys()
            .next()
            .copied()
            .unwrap_or_default();
        LocationRef::from_overworld_hex(first_hex)
    }

    fn category_for_roll(roll: u64) -> &'static str {
        if roll <= 40 {
            "hostile"
        } else if roll <= 75 {
            "neutral"
        } else {
            "omen"
        }
    }

    fn on_check(&self, sim: &mut Simulation, event: &SimEvent) {
        let mut state = Self::normalized_state(sim);
        let check_tick = json::get_u64(&event.params, "tick").unwrap_or(event.tick.as_u64());
        let trigger = json::get_str(&event.params, "trigger")
            .unwrap_or(ENCOUNTER_TRIGGER_IDLE)
            .to_string();
        let location = event
            .params
            .get("location")
            .and_then(LocationRef::from_value)
            .unwrap_or_else(|| Self::idle_location(sim));

        state.insert(Self::STATE_LAST_CHECK_TICK.into(), Value::from(check_tick));
        let emitted = json::get_u64(&state, Self::STATE_CHECKS_EMITTED).unwrap_or(0) + 1;
        state.insert(Self::STATE_CHECKS_EMITTED.into(), Value::from(emitted));

        let cooldown_until = json::get_i64(&state, Self::STATE_COOLDOWN_UNTIL_TICK).unwrap_or(-1);
        if (check_tick as i64) < cooldown_until {
            let streak = json::get_u64(&state, Self::STATE_INELIGIBLE_STREAK).unwrap_or(0) + 1;
            state.insert(Self::STATE_INELIGIBLE_STREAK.into(), Value::from(streak));
            sim.set_rules_state(Self::NAME, state);
            return;
        }

        let eligible_roll = sim.rng_stream(Self::RNG_STREAM).randrange(100);
        if eligible_roll < ENCOUNTER_CHANCE_PERCENT {
            let eligible = json::get_u64(&state, Self::STATE_ELIGIBLE_COUNT).unwrap_or(0) + 1;
            state.insert(Self::STATE_ELIGIBLE_COUNT.into(), Value::from(eligible));
            state.insert(Self::STATE_INELIGIBLE_STREAK.into(), Value::from(0));
            state.insert(
                Self::STATE_COOLDOWN_UNTIL_TICK.into(),
                Value::from(check_tick + ENCOUNTER_COOLDOWN_TICKS),
            );

            let encounter_roll = 1 + sim.rng_stream(Self::RNG_STREAM).randrange(100);
            let mut params = JsonMap::new();
            params.insert("tick".into(), Value::from(check_tick));
            params.insert(
                "context".into(),
                Value::String(ENCOUNTER_CONTEXT_GLOBAL.into()),
            );
            params.insert("roll".into(), Value::from(encounter_roll));
            params.insert("trigger".into(), Value::String(trigger));
            params.insert("location".into(), location.to_value());
            sim.schedule_event_at(event.tick + 1, ENCOUNTER_ROLL_EVENT, params);
        } else {
            let streak = json::get_u64(&state, Self::STATE_INELIGIBLE_STREAK).unwrap_or(0) + 1;
            state.insert(Self::STATE_INELIGIBLE_STREAK.into(), Value::from(streak));
        }

        sim.set_rules_state(Self::NAME, state);
    }

    fn on_roll(&self, sim: &mut Simulation, event: &SimEvent) {
        let roll = json::get_u64(&event.params, "roll").unwrap_or(0);
        let mut params = JsonMap::new();
        params.insert(
            "tick".into(),
            Value::from(json::get_u64(&event.params, "tick").unwrap_or(event.tick.as_u64())),
        );
        params.insert(
            "context".into(),
            event
                .params
                .get("context")
                .cloned()
                .unwrap_or_else(|| Value::String(ENCOUNTER_CONTEXT_GLOBAL.into())),
        );
        params.insert("roll".into(), Value::from(roll));
        params.insert(
            "category".into(),
            Value::String(Self::category_for_roll(roll).into()),
        );
        params.insert(
            "trigger".into(),
            event
                .params
                .get("trigger")
                .cloned()
                .unwrap_or_else(|| Value::String(ENCOUNTER_TRIGGER_IDLE.into())),
        );
        params.insert(
            "location".into(),
            event.params.get("location").cloned().unwrap_or(Value::Null),
        );
        sim.schedule_event_at(event.tick + 1, ENCOUNTER_RESULT_STUB_EVENT, params);
    }

    fn on_result_stub(&self, sim: &mut Simulation, event: &SimEvent) {
        let mut params = JsonMap::new();
        for key in ["tick", "context", "trigger", "location", "roll", "category"] {
            params.insert(
                key.to_string(),
                event.params.get(key).cloned().unwrap_or(Value::Null),
            );
        }
        sim.schedule_event_at(event.tick + 1, ENCOUNTER_RESOLVE_REQUEST_EVENT, params);
    }

    fn on_travel_step(&self, sim: &mut Simulation, event: &SimEvent) {
        let mut params = JsonMap::new();
        params.insert(
            "tick".into(),
            Value::from(json::get_u64(&event.params, "tick").unwrap_or(event.tick.as_u64())),
        );
        params.insert(
            "context".into(),
            Value::String(ENCOUNTER_CONTEXT_GLOBAL.into()),
        );
        params.insert(
            "trigger".into(),
            Value::String(ENCOUNTER_TRIGGER_TRAVEL.into()),
        );
        params.insert(
            "location".into(),
            event
                .params
                .get("location_to")
                .cloned()
                .unwrap_or(Value::Null),
        );
        sim.schedule_event_at(event.tick + 1, ENCOUNTER_CHECK_EVENT, params);
    }
}

impl RuleModule for EncounterCheckModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_simulation_start(&mut self, sim: &mut Simulation) -> SimResult<()> {
        let state = Self::normalized_state(sim);
        sim.set_rules_state(Self::NAME, state);
        sim.register_periodic_task(Self::TASK_NAME, ENCOUNTER_CHECK_INTERVAL, hx_types::Tick::ZERO)?;
        sim.set_task_callback(
            Self::TASK_NAME,
            Box::new(|sim, tick| {
                let location = EncounterCheckModule::idle_location(sim);
                let mut params = JsonMap::new();
                params.insert("tick".into(), Value::from(tick.as_u64()));
                params.insert(
                    "context".into(),
                    Value::String(ENCOUNTER_CONTEXT_GLOBAL.into()),
                );
                params.insert(
                    "trigger".into(),
                    Value::String(ENCOUNTER_TRIGGER_IDLE.into()),
                );
                params.insert("location".into(), location.to_value());
                sim.schedule_event_at(tick + 1, ENCOUNTER_CHECK_EVENT, params);
            }),
        )?;
        Ok(())
    }

    fn on_event_executed(&mut self, sim: &mut Simulation, event: &SimEvent) -> SimResult<()> {
        match event.event_type.as_str() {
            TRAVEL_STEP => self.on_travel_step(sim, event),
            ENCOUNTER_CHECK_EVENT => self.on_check(sim, event),
            ENCOUNTER_ROLL_EVENT => self.on_roll(sim, event),
            ENCOUNTER_RESULT_STUB_EVENT => self.on_result_stub(sim, event),
            _ => {}
        }
        Ok(())
    }
}

// ============================================================================
// Selection module
// ============================================================================

/// Weighted table selection on a dedicated RNG stream. Side-effect free:
/// emits descriptive selection stubs only.
pub struct EncounterSelectionModule {
    table: EncounterTable,
}

impl EncounterSelectionModule {
    pub const NAME: &'static str = "encounter_selection";
    const RNG_STREAM: &'static str = "encounter_selection";

    pub fn new(table: EncounterTable) -> Self {
        EncounterSelectionModule { table }
    }

    fn select_entry_index(&self, sim: &mut Simulation) -> usize {
        let total_weight = self.table.total_weight();
        let draw = sim.rng_stream(Self::RNG_STREAM).randrange(total_weight);
        let mut cumulative = 0u64;
        for (index, entry) in self.table.entries.iter().enumerate() {
            cumulative += entry.weight;
            if draw < cumulative {
                return index;
            }
        }
        // total_weight is the sum of entry weights, so the scan always lands.
        self.table.entries.len() - 1
    }
}

impl RuleModule for EncounterSelectionModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_event_executed(&mut self, sim: &mut Simulation, event: &SimEvent) -> SimResult<()> {
        if event.event_type != ENCOUNTER_RESOLVE_REQUEST_EVENT {
            return Ok(());
        }

        let index = self.select_entry_index(sim);
        let entry = &self.table.entries[index];

        let mut params = JsonMap::new();
        for key in ["tick", "context", "trigger", "location", "roll", "category"] {
            params.insert(
                key.to_string(),
                event.params.get(key).cloned().unwrap_or(Value::Null),
            );
        }
        params.insert("table_id".into(), Value::String(self.table.table_id.clone()));
        params.insert("entry_id".into(), Value::String(entry.entry_id.clone()));
        params.insert("entry_payload".into(), Value::Object(entry.payload.clone()));
        params.insert(
            "entry_tags".into(),
            Value::Array(entry.tags.iter().cloned().map(Value::String).collect()),
        );
        sim.schedule_event_at(event.tick + 1, ENCOUNTER_SELECTION_STUB_EVENT, params);
        Ok(())
    }
}

// ============================================================================
// Action module
// ============================================================================

/// Normalizes a selected entry's declarative actions. Entries without an
/// `actions` list fall back to a single `signal_intent` on the entry's
/// `signal_id` (or the entry id itself).
#[derive(Default)]
pub struct EncounterActionModule;

impl EncounterActionModule {
    pub const NAME: &'static str = "encounter_action";

    pub fn new() -> Self {
        EncounterActionModule
    }

    fn actions_for_selection(entry_id: Option<&str>, entry_payload: &JsonMap) -> Vec<JsonMap> {
        match entry_payload.get("actions").and_then(Value::as_array) {
            Some(actions) => actions
                .iter()
                .filter_map(Value::as_object)
                .map(Self::normalize_action)
                .collect(),
            None => {
                let template_id = json::get_str(entry_payload, "signal_id")
                    .or(entry_id)
                    .unwrap_or("unknown")
                    .to_string();
                let mut fallback = JsonMap::new();
                fallback.insert("action_type".into(), Value::String("signal_intent".into()));
                fallback.insert("template_id".into(), Value::String(template_id));
                let mut params = JsonMap::new();
                params.insert(
                    "source".into(),
                    Value::String(ENCOUNTER_SELECTION_STUB_EVENT.into()),
                );
                fallback.insert("params".into(), Value::Object(params));
                vec![fallback]
            }
        }
    }

    fn normalize_action(action: &JsonMap) -> JsonMap {
        let mut normalized = JsonMap::new();
        normalized.insert(
            "action_type".into(),
            Value::String(json::get_str(action, "action_type").unwrap_or("").to_string()),
        );
        let template_id = json::get_str(action, "template_id")
            .or_else(|| json::get_str(action, "action_id"))
            .unwrap_or("")
            .to_string();
        normalized.insert("template_id".into(), Value::String(template_id));
        normalized.insert(
            "params".into(),
            action
                .get("params")
                .cloned()
                .unwrap_or(Value::Object(JsonMap::new())),
        );
        for (key, value) in action {
            if normalized.contains_key(key) || key == "action_id" {
                continue;
            }
            normalized.insert(key.clone(), value.clone());
        }
        normalized
    }
}

impl RuleModule for EncounterActionModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_event_executed(&mut self, sim: &mut Simulation, event: &SimEvent) -> SimResult<()> {
        if event.event_type != ENCOUNTER_SELECTION_STUB_EVENT {
            return Ok(());
        }
        let mut params = event.params.clone();
        let entry_payload = event
            .params
            .get("entry_payload")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let actions = Self::actions_for_selection(
            json::get_str(&event.params, "entry_id"),
            &entry_payload,
        );
        params.insert(
            "actions".into(),
            Value::Array(actions.into_iter().map(Value::Object).collect()),
        );
        sim.schedule_event_at(event.tick + 1, ENCOUNTER_ACTION_STUB_EVENT, params);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::simulation_hash;
    use crate::world::WorldState;
    use hx_content::encounters::builtin_basic_table;
    use hx_types::{MasterSeed, Tick};
    use serde_json::json;

    fn params(value: Value) -> JsonMap {
        value.as_object().unwrap().clone()
    }

    fn pipeline_sim(seed: u64) -> Simulation {
        let mut topology = JsonMap::new();
        topology.insert("radius".into(), Value::from(4));
        let world =
            WorldState::create_with_topology(MasterSeed(seed), "hex_disk", &topology).unwrap();
        let mut sim = Simulation::new(world, MasterSeed(seed));
        sim.register_rule_module(Box::new(EncounterCheckModule::new()))
            .unwrap();
        sim.register_rule_module(Box::new(EncounterSelectionModule::new(builtin_basic_table())))
            .unwrap();
        sim.register_rule_module(Box::new(EncounterActionModule::new()))
            .unwrap();
        sim
    }

    fn resolve_request(tick: u64) -> JsonMap {
        params(json!({
            "tick": tick,
            "context": "global",
            "trigger": "idle",
            "location": {"space_id": "overworld", "topology_type": "overworld_hex", "coord": {"q": 0, "r": 0}},
            "roll": 37,
            "category": "hostile",
        }))
    }

    #[test]
    fn category_thresholds() {
        assert_eq!(EncounterCheckModule::category_for_roll(1), "hostile");
        assert_eq!(EncounterCheckModule::category_for_roll(40), "hostile");
        assert_eq!(EncounterCheckModule::category_for_roll(41), "neutral");
        assert_eq!(EncounterCheckModule::category_for_roll(75), "neutral");
        assert_eq!(EncounterCheckModule::category_for_roll(76), "omen");
        assert_eq!(EncounterCheckModule::category_for_roll(100), "omen");
    }

    #[test]
    fn resolve_request_yields_exactly_one_selection_and_action_stub() {
        let mut sim = pipeline_sim(17);
        sim.schedule_event_at(Tick(0), ENCOUNTER_RESOLVE_REQUEST_EVENT, resolve_request(0));
        sim.advance_ticks(4).unwrap();

        let selections = sim
            .get_event_trace()
            .iter()
            .filter(|entry| entry.event_type == ENCOUNTER_SELECTION_STUB_EVENT)
            .count();
        let action_stubs = sim
            .get_event_trace()
            .iter()
            .filter(|entry| entry.event_type == ENCOUNTER_ACTION_STUB_EVENT)
            .count();
        assert_eq!(selections, 1);
        assert_eq!(action_stubs, 1);
    }

    #[test]
    fn selection_regression_two_runs_match() {
        let run = |_: ()| {
            let mut sim = pipeline_sim(17);
            sim.schedule_event_at(Tick(0), ENCOUNTER_RESOLVE_REQUEST_EVENT, resolve_request(0));
            sim.schedule_event_at(Tick(2), ENCOUNTER_RESOLVE_REQUEST_EVENT, resolve_request(2));
            sim.advance_ticks(12).unwrap();
            simulation_hash(&sim)
        };
        assert_eq!(run(()), run(()));
    }

    #[test]
    fn selection_survives_save_load_split() {
        let mut straight = pipeline_sim(29);
        straight.schedule_event_at(Tick(0), ENCOUNTER_RESOLVE_REQUEST_EVENT, resolve_request(0));
        straight.advance_ticks(6).unwrap();

        let mut split = pipeline_sim(29);
        split.schedule_event_at(Tick(0), ENCOUNTER_RESOLVE_REQUEST_EVENT, resolve_request(0));
        split.advance_ticks(2).unwrap();

        let world = WorldState::from_value(&split.state.world.to_value()).unwrap();
        let mut resumed = Simulation::from_payload(
            world,
            &split.simulation_payload(),
            &split.input_log_payload(),
        )
        .unwrap();
        resumed
            .register_rule_module(Box::new(EncounterCheckModule::new()))
            .unwrap();
        resumed
            .register_rule_module(Box::new(EncounterSelectionModule::new(builtin_basic_table())))
            .unwrap();
        resumed
            .register_rule_module(Box::new(EncounterActionModule::new()))
            .unwrap();
        resumed.advance_ticks(4).unwrap();

        assert_eq!(simulation_hash(&resumed), simulation_hash(&straight));
    }

    #[test]
    fn fallback_action_uses_signal_id() {
        let payload = params(json!({"signal_id": "howls.distant"}));
        let actions = EncounterActionModule::actions_for_selection(Some("wolf_pack"), &payload);
        assert_eq!(actions.len(), 1);
        assert_eq!(
            actions[0].get("action_type"),
            Some(&Value::String("signal_intent".into()))
        );
        assert_eq!(
            actions[0].get("template_id"),
            Some(&Value::String("howls.distant".into()))
        );
    }

    #[test]
    fn periodic_checks_respect_cooldown() {
        let mut sim = pipeline_sim(3);
        sim.advance_ticks(60).unwrap();

        let state = sim.get_rules_state(EncounterCheckModule::NAME);
        let emitted = state.get("checks_emitted").unwrap().as_u64().unwrap();
        assert!(emitted >= 5, "periodic task fired every 10 ticks");

        // Rolls only happen outside the cooldown window; the eligible count
        // can never exceed the number of cooldown windows that fit.
        let eligible = state.get("eligible_count").unwrap().as_u64().unwrap();
        assert!(eligible <= 2);
    }
}

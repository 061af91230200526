//! # Supply consumption
//!
//! Per-entity periodic consumption driven through the inventory layer. Each
//! `(entity, profile, item)` line registers a periodic task whose callback
//! issues an idempotent `inventory_intent`; the inventory outcome is folded
//! into a supply outcome on the event trace.

use std::collections::BTreeSet;

use serde_json::Value;
use sha2::{Digest, Sha256};

use hx_api::commands::INVENTORY_INTENT;
use hx_api::events::INVENTORY_OUTCOME;
use hx_api::{SimCommand, SimResult, TraceEntry};
use hx_content::{SupplyConsumeDef, SupplyProfileRegistry};
use hx_types::{json, JsonMap, Tick};

use crate::rules::RuleModule;
use crate::sim::Simulation;
use crate::MAX_EXECUTED_ACTION_UIDS;

pub const SUPPLY_OUTCOME_EVENT: &str = "supply_outcome";
pub const SUPPLY_CONSUMPTION_TASK_PREFIX: &str = "supply.consume";

const MAX_SUPPLY_WARNINGS: usize = 200;
const APPLIED_KEY: &str = "applied_action_uids";
const WARNINGS_KEY: &str = "warnings";

pub struct SupplyConsumptionModule {
    profiles: SupplyProfileRegistry,
    known_item_ids: BTreeSet<String>,
}

impl SupplyConsumptionModule {
    pub const NAME: &'static str = "supply_consumption";

    pub fn new(profiles: SupplyProfileRegistry, known_item_ids: BTreeSet<String>) -> Self {
        SupplyConsumptionModule {
            profiles,
            known_item_ids,
        }
    }

    fn task_name(entity_id: &str, profile_id: &str, item_id: &str) -> String {
        format!("{SUPPLY_CONSUMPTION_TASK_PREFIX}:{entity_id}:{profile_id}:{item_id}")
    }

    /// `supply:<tick>:<first-16-hex-of-sha256("supply:<tick>:<task>")>`
    fn action_uid(tick: Tick, task_name: &str) -> String {
        let digest = Sha256::digest(format!("supply:{}:{task_name}", tick.as_u64()).as_bytes());
        let mut hex = String::with_capacity(16);
        for byte in digest.iter().take(8) {
            hex.push_str(&format!("{byte:02x}"));
        }
        format!("supply:{}:{hex}", tick.as_u64())
    }

    fn apply_consumption(
        sim: &mut Simulation,
        tick: Tick,
        entity_id: &str,
        consume: &SupplyConsumeDef,
        task_name: &str,
        known_item_ids: &BTreeSet<String>,
    ) {
        if sim.entity(entity_id).is_none() {
            return;
        }

        let mut state = sim.get_rules_state(Self::NAME);
        let mut applied = json::uid_ledger(&state, APPLIED_KEY, MAX_EXECUTED_ACTION_UIDS);
        let action_uid = Self::action_uid(tick, task_name);

        if applied.iter().any(|uid| uid == &action_uid) {
            Self::append_outcome(sim, tick, entity_id, consume, &action_uid, "already_applied", None);
            return;
        }
        if !known_item_ids.contains(&consume.item_id) {
            Self::append_outcome(sim, tick, entity_id, consume, &action_uid, "unknown_item", None);
            return;
        }
        let container_id = sim
            .entity(entity_id)
            .and_then(|entity| entity.inventory_container_id.clone())
            .filter(|id| sim.state.world.containers.contains_key(id));
        let Some(container_id) = container_id else {
            Self::append_outcome(
                sim,
                tick,
                entity_id,
                consume,
                &action_uid,
                "no_inventory_container",
                None,
            );
            return;
        };

        let mut intent_params = JsonMap::new();
        intent_params.insert("src_container_id".into(), Value::String(container_id.clone()));
        intent_params.insert("dst_container_id".into(), Value::Null);
        intent_params.insert("item_id".into(), Value::String(consume.item_id.clone()));
        intent_params.insert("quantity".into(), Value::from(consume.quantity));
        intent_params.insert("reason".into(), Value::String("consume".into()));
        intent_params.insert("action_uid".into(), Value::String(action_uid.clone()));
        let command = SimCommand::new(tick, Some(entity_id), INVENTORY_INTENT, intent_params);
        sim.execute_inventory_intent(&command, 0);

        // The inventory outcome landed on the trace synchronously; fold it.
        let inventory_outcome = sim
            .get_event_trace()
            .iter()
            .rev()
            .find(|entry| {
                entry.event_type == INVENTORY_OUTCOME
                    && json::get_str(&entry.params, "action_uid") == Some(action_uid.as_str())
            })
            .and_then(|entry| json::get_str(&entry.params, "outcome"))
            .unwrap_or("already_applied")
            .to_string();

        let supply_outcome = match inventory_outcome.as_str() {
            "applied" => {
                json::push_uid_fifo(&mut applied, &action_uid, MAX_EXECUTED_ACTION_UIDS);
                "consumed".to_string()
            }
            "insufficient_quantity" => {
                let mut warnings = state
                    .get(WARNINGS_KEY)
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                warnings.push(serde_json::json!({
                    "tick": tick.as_u64(),
                    "entity_id": entity_id,
                    "item_id": consume.item_id,
                    "action_uid": action_uid,
                }));
                if warnings.len() > MAX_SUPPLY_WARNINGS {
                    let excess = warnings.len() - MAX_SUPPLY_WARNINGS;
                    warnings.drain(..excess);
                }
                state.insert(WARNINGS_KEY.into(), Value::Array(warnings));
                "insufficient_supply".to_string()
            }
            other => other.to_string(),
        };

        json::set_uid_ledger(&mut state, APPLIED_KEY, &applied);
        sim.set_rules_state(Self::NAME, state);

        let remaining = sim
            .state
            .world
            .containers
            .get(&container_id)
            .map(|container| container.quantity(&consume.item_id));
        Self::append_outcome(
            sim,
            tick,
            entity_id,
            consume,
            &action_uid,
            &supply_outcome,
            remaining,
        );
    }

    fn append_outcome(
        sim: &mut Simulation,
        tick: Tick,
        entity_id: &str,
        consume: &SupplyConsumeDef,
        action_uid: &str,
        outcome: &str,
        remaining: Option<u64>,
    ) {
        let mut params = JsonMap::new();
        params.insert("tick".into(), Value::from(tick.as_u64()));
        params.insert("entity_id".into(), Value::String(entity_id.to_string()));
        params.insert("item_id".into(), Value::String(consume.item_id.clone()));
        params.insert("quantity".into(), Value::from(consume.quantity));
        params.insert("interval_ticks".into(), Value::from(consume.interval_ticks));
        params.insert("action_uid".into(), Value::String(action_uid.to_string()));
        params.insert("outcome".into(), Value::String(outcome.to_string()));
        if let Some(remaining) = remaining {
            params.insert("remaining_quantity".into(), Value::from(remaining));
        }
        sim.append_trace_entry(TraceEntry {
            tick,
            event_id: Simulation::trace_event_id_for(&format!("supply:{action_uid}:{outcome}")),
            event_type: SUPPLY_OUTCOME_EVENT.to_string(),
            params,
            module_hooks_called: true,
        });
    }
}

impl RuleModule for SupplyConsumptionModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_simulation_start(&mut self, sim: &mut Simulation) -> SimResult<()> {
        let profile_map = self.profiles.by_id();
        let mut registrations: Vec<(String, String, SupplyConsumeDef)> = Vec::new();
        for (entity_id, entity) in &sim.state.entities {
            let Some(profile_id) = entity.supply_profile_id.as_deref() else {
                continue;
            };
            let Some(profile) = profile_map.get(profile_id) else {
                continue;
            };
            for consume in &profile.consumes {
                registrations.push((
                    entity_id.clone(),
                    Self::task_name(entity_id, profile_id, &consume.item_id),
                    consume.clone(),
                ));
            }
        }

        for (entity_id, task_name, consume) in registrations {
            sim.register_periodic_task(&task_name, consume.interval_ticks, Tick::ZERO)?;
            let known_item_ids = self.known_item_ids.clone();
            let callback_task = task_name.clone();
            sim.set_task_callback(
                &task_name,
                Box::new(move |sim, tick| {
                    Self::apply_consumption(
                        sim,
                        tick,
                        &entity_id,
                        &consume,
                        &callback_task,
                        &known_item_ids,
                    );
                }),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityState;
    use crate::world::WorldState;
    use hx_content::supplies::builtin_traveler_profiles;
    use hx_types::{HexCoord, MasterSeed};

    fn supplied_sim(seed: u64, torches: u64) -> Simulation {
        let mut topology = JsonMap::new();
        topology.insert("radius".into(), Value::from(3));
        let world =
            WorldState::create_with_topology(MasterSeed(seed), "hex_disk", &topology).unwrap();
        let mut sim = Simulation::new(world, MasterSeed(seed));
        sim.set_known_item_ids(
            ["torch", "rations"].into_iter().map(str::to_string).collect(),
        );

        let mut traveler = EntityState::from_hex("traveler", HexCoord::new(0, 0));
        traveler.supply_profile_id = Some("traveler".into());
        sim.add_entity(traveler);
        let inv_id = sim
            .entity("traveler")
            .unwrap()
            .inventory_container_id
            .clone()
            .unwrap();
        sim.state
            .world
            .containers
            .get_mut(&inv_id)
            .unwrap()
            .add("torch", torches);
        sim.state
            .world
            .containers
            .get_mut(&inv_id)
            .unwrap()
            .add("rations", 10);

        sim.register_rule_module(Box::new(SupplyConsumptionModule::new(
            builtin_traveler_profiles(),
            sim.known_item_ids().clone(),
        )))
        .unwrap();
        sim
    }

    fn supply_outcomes(sim: &Simulation, item_id: &str) -> Vec<String> {
        sim.get_event_trace()
            .iter()
            .filter(|entry| entry.event_type == SUPPLY_OUTCOME_EVENT)
            .filter(|entry| json::get_str(&entry.params, "item_id") == Some(item_id))
            .map(|entry| {
                json::get_str(&entry.params, "outcome")
                    .unwrap_or("")
                    .to_string()
            })
            .collect()
    }

    #[test]
    fn torch_consumed_on_interval() {
        let mut sim = supplied_sim(1, 5);
        // traveler profile burns one torch every 120 ticks, starting tick 0.
        sim.advance_ticks(121).unwrap();

        let inv_id = sim
            .entity("traveler")
            .unwrap()
            .inventory_container_id
            .clone()
            .unwrap();
        assert_eq!(sim.state.world.containers[&inv_id].quantity("torch"), 3);
        assert_eq!(supply_outcomes(&sim, "torch"), vec!["consumed", "consumed"]);
    }

    #[test]
    fn insufficient_supply_appends_bounded_warning() {
        let mut sim = supplied_sim(2, 0);
        sim.advance_ticks(1).unwrap();

        assert_eq!(supply_outcomes(&sim, "torch"), vec!["insufficient_supply"]);
        let state = sim.get_rules_state(SupplyConsumptionModule::NAME);
        let warnings = state.get("warnings").unwrap().as_array().unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(
            warnings[0].get("item_id").unwrap().as_str().unwrap(),
            "torch"
        );
    }

    #[test]
    fn consumption_survives_save_load_without_double_consume() {
        let mut sim = supplied_sim(3, 5);
        sim.advance_ticks(1).unwrap();
        let inv_id = sim
            .entity("traveler")
            .unwrap()
            .inventory_container_id
            .clone()
            .unwrap();
        assert_eq!(sim.state.world.containers[&inv_id].quantity("torch"), 4);

        // Save mid-run and restore; re-register the module as a loader would.
        let world_payload = sim.state.world.to_value();
        let sim_payload = sim.simulation_payload();
        let log_payload = sim.input_log_payload();
        let world = WorldState::from_value(&world_payload).unwrap();
        let mut restored = Simulation::from_payload(world, &sim_payload, &log_payload).unwrap();
        restored.set_known_item_ids(sim.known_item_ids().clone());
        restored
            .register_rule_module(Box::new(SupplyConsumptionModule::new(
                builtin_traveler_profiles(),
                restored.known_item_ids().clone(),
            )))
            .unwrap();

        restored.advance_ticks(120).unwrap();
        assert_eq!(
            restored.state.world.containers[&inv_id].quantity("torch"),
            3,
            "one further interval elapsed, exactly one more torch burned"
        );
    }
}

//! # Rumor pipeline
//!
//! Hop-bounded derivation from executed encounter outcomes. Base rumors
//! spawn at the outcome's location; a periodic task walks live rumors and
//! emits one child per interval toward a digest-chosen neighbor hex.
//! Rumor ids are digest-derived so they are platform-independent.

use serde_json::Value;
use sha2::{Digest, Sha256};

use hx_api::{SimEvent, SimResult};
use hx_types::{hex_neighbors, json, HexCoord, JsonMap, LocationRef, Tick, OVERWORLD_HEX_TOPOLOGY};

use crate::modules::execution::ENCOUNTER_ACTION_OUTCOME_EVENT;
use crate::rules::RuleModule;
use crate::sim::Simulation;
use crate::world::RumorRecord;
use crate::MAX_EXECUTED_ACTION_UIDS;

pub const RUMOR_PROPAGATION_TASK: &str = "rumor_pipeline:propagate";
pub const RUMOR_PROPAGATION_INTERVAL_TICKS: u64 = 50;
pub const RUMOR_HOP_CAP: u64 = 4;
pub const RUMOR_TTL_TICKS: u64 = 200;

const BASE_CONFIDENCE: f64 = 0.75;
const LEDGER_KEY: &str = "emitted_ledger_keys";

#[derive(Default)]
pub struct RumorPipelineModule;

impl RumorPipelineModule {
    pub const NAME: &'static str = "rumor_pipeline";

    pub fn new() -> Self {
        RumorPipelineModule
    }

    fn ledger(sim: &Simulation) -> Vec<String> {
        json::uid_ledger(&sim.get_rules_state(Self::NAME), LEDGER_KEY, MAX_EXECUTED_ACTION_UIDS)
    }

    fn store_ledger(sim: &mut Simulation, ledger: &[String]) {
        let mut state = sim.get_rules_state(Self::NAME);
        json::set_uid_ledger(&mut state, LEDGER_KEY, ledger);
        sim.set_rules_state(Self::NAME, state);
    }

    /// `rumor-<first-20-hex-of-sha256(identity)>`
    fn rumor_id_for_identity(identity: &str) -> String {
        let digest = Sha256::digest(identity.as_bytes());
        let mut hex = String::with_capacity(20);
        for byte in digest.iter().take(10) {
            hex.push_str(&format!("{byte:02x}"));
        }
        format!("rumor-{hex}")
    }

    /// Stable neighbor preference from the digest of `<rumor_id>:<hop>`.
    fn stable_index(value: &str, width: usize) -> usize {
        let digest = Sha256::digest(value.as_bytes());
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&digest[..4]);
        (u32::from_be_bytes(bytes) as usize) % width
    }

    fn on_outcome(&self, sim: &mut Simulation, event: &SimEvent) {
        if json::get_str(&event.params, "outcome") != Some("executed") {
            return;
        }
        let Some(action_uid) = json::get_str(&event.params, "action_uid") else {
            return;
        };
        let ledger_key = format!("base:{action_uid}");
        let mut ledger = Self::ledger(sim);
        if ledger.iter().any(|key| key == &ledger_key) {
            return;
        }
        let Some(location) = event.params.get("location").and_then(LocationRef::from_value)
        else {
            return;
        };

        let action_type = json::get_str(&event.params, "action_type").unwrap_or("unknown");
        let mutation = json::get_str(&event.params, "mutation").unwrap_or("none");
        let created_tick = event.tick.as_u64();
        let mut payload = JsonMap::new();
        payload.insert(
            "source_outcome_event_id".into(),
            Value::String(event.event_id.clone()),
        );
        payload.insert("mutation".into(), Value::String(mutation.to_string()));

        let record = RumorRecord {
            rumor_id: Self::rumor_id_for_identity(&ledger_key),
            created_tick,
            location: location.to_value(),
            template_id: format!("rumor.{action_type}"),
            source_action_uid: action_uid.to_string(),
            confidence: BASE_CONFIDENCE,
            hop: 0,
            expires_tick: created_tick + RUMOR_TTL_TICKS,
            payload: Some(payload),
        };
        if sim.state.world.append_rumor(&record).is_ok() {
            json::push_uid_fifo(&mut ledger, &ledger_key, MAX_EXECUTED_ACTION_UIDS);
            Self::store_ledger(sim, &ledger);
        }
    }

    fn propagate(sim: &mut Simulation, tick: Tick) {
        let mut ledger = Self::ledger(sim);

        // Flag expired rumors in place; expiry never removes them.
        for rumor in sim.state.world.rumors.iter_mut() {
            let expires_tick = json::get_u64(rumor, "expires_tick").unwrap_or(0);
            if tick.as_u64() <= expires_tick {
                continue;
            }
            let mut payload = rumor
                .get("payload")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            if payload.get("expired") == Some(&Value::Bool(true)) {
                continue;
            }
            payload.insert("expired".into(), Value::Bool(true));
            payload.insert("expired_tick".into(), Value::from(tick.as_u64()));
            rumor.insert("payload".into(), Value::Object(payload));
        }

        let snapshot = sim.state.world.rumors.clone();
        for rumor in &snapshot {
            let hop = json::get_u64(rumor, "hop").unwrap_or(0);
            if hop >= RUMOR_HOP_CAP {
                continue;
            }
            if tick.as_u64() > json::get_u64(rumor, "expires_tick").unwrap_or(0) {
                continue;
            }
            let Some(next_location) = Self::propagated_location(sim, rumor) else {
                continue;
            };
            let Some(next_hex) = next_location.coord.as_hex() else {
                continue;
            };

            let rumor_id = json::get_str(rumor, "rumor_id").unwrap_or("?");
            let next_hop = hop + 1;
            let ledger_key = format!("prop:{rumor_id}:{next_hop}:{}:{}", next_hex.q, next_hex.r);
            if ledger.iter().any(|key| key == &ledger_key) {
                continue;
            }

            let parent_confidence = json::get_f64(rumor, "confidence").unwrap_or(0.0);
            let confidence = ((parent_confidence * 0.8) * 1e4).round() / 1e4;
            let confidence = confidence.max(0.1);
            let mut payload = JsonMap::new();
            payload.insert("derived_from".into(), Value::String(rumor_id.to_string()));
            let child = RumorRecord {
                rumor_id: Self::rumor_id_for_identity(&ledger_key),
                created_tick: tick.as_u64(),
                location: next_location.to_value(),
                template_id: json::get_str(rumor, "template_id")
                    .unwrap_or("rumor.unknown")
                    .to_string(),
                source_action_uid: json::get_str(rumor, "source_action_uid")
                    .unwrap_or("")
                    .to_string(),
                confidence,
                hop: next_hop,
                expires_tick: tick.as_u64() + RUMOR_TTL_TICKS,
                payload: Some(payload),
            };
            if child.source_action_uid.is_empty() {
                continue;
            }
            if sim.state.world.append_rumor(&child).is_ok() {
                json::push_uid_fifo(&mut ledger, &ledger_key, MAX_EXECUTED_ACTION_UIDS);
            }
        }

        Self::store_ledger(sim, &ledger);
    }

    /// First existing neighbor hex, starting from the digest-preferred index.
    fn propagated_location(sim: &Simulation, rumor: &JsonMap) -> Option<LocationRef> {
        let location = rumor.get("location").and_then(LocationRef::from_value)?;
        if location.topology_type != OVERWORLD_HEX_TOPOLOGY {
            return None;
        }
        let source = location.coord.as_hex()?;
        let neighbors: [HexCoord; 6] = hex_neighbors(source);
        let identity = format!(
            "{}:{}",
            json::get_str(rumor, "rumor_id").unwrap_or(""),
            json::get_u64(rumor, "hop").unwrap_or(0)
        );
        let preferred = Self::stable_index(&identity, neighbors.len());
        for offset in 0..neighbors.len() {
            let candidate = neighbors[(preferred + offset) % neighbors.len()];
            if sim.state.world.get_hex_record(candidate).is_some() {
                return Some(LocationRef::from_overworld_hex(candidate));
            }
        }
        None
    }
}

impl RuleModule for RumorPipelineModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_simulation_start(&mut self, sim: &mut Simulation) -> SimResult<()> {
        let ledger = Self::ledger(sim);
        Self::store_ledger(sim, &ledger);
        sim.register_periodic_task(
            RUMOR_PROPAGATION_TASK,
            RUMOR_PROPAGATION_INTERVAL_TICKS,
            Tick::ZERO,
        )?;
        sim.set_task_callback(
            RUMOR_PROPAGATION_TASK,
            Box::new(|sim, tick| RumorPipelineModule::propagate(sim, tick)),
        )?;
        Ok(())
    }

    fn on_event_executed(&mut self, sim: &mut Simulation, event: &SimEvent) -> SimResult<()> {
        if event.event_type == ENCOUNTER_ACTION_OUTCOME_EVENT {
            self.on_outcome(sim, event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::WorldState;
    use hx_types::MasterSeed;
    use serde_json::json;

    fn params(value: Value) -> JsonMap {
        value.as_object().unwrap().clone()
    }

    fn rumor_sim(seed: u64) -> Simulation {
        let mut topology = JsonMap::new();
        topology.insert("radius".into(), Value::from(4));
        let world =
            WorldState::create_with_topology(MasterSeed(seed), "hex_disk", &topology).unwrap();
        let mut sim = Simulation::new(world, MasterSeed(seed));
        sim.register_rule_module(Box::new(RumorPipelineModule::new()))
            .unwrap();
        sim
    }

    fn executed_outcome(tick: u64, action_uid: &str) -> JsonMap {
        params(json!({
            "source_event_id": "evt-900",
            "action_index": 0,
            "action_uid": action_uid,
            "action_type": "signal_intent",
            "template_id": "omens.crows",
            "location": {"space_id": "overworld", "topology_type": "overworld_hex", "coord": {"q": 0, "r": 0}},
            "quantity": 1,
            "outcome": "executed",
            "mutation": "signal_created",
            "tick": tick,
        }))
    }

    #[test]
    fn executed_outcome_emits_one_base_rumor() {
        let mut sim = rumor_sim(1);
        sim.schedule_event_at(
            Tick(0),
            ENCOUNTER_ACTION_OUTCOME_EVENT,
            executed_outcome(0, "evt-900:0"),
        );
        sim.schedule_event_at(
            Tick(1),
            ENCOUNTER_ACTION_OUTCOME_EVENT,
            executed_outcome(1, "evt-900:0"),
        );
        sim.advance_ticks(2).unwrap();

        assert_eq!(sim.state.world.rumors.len(), 1);
        let rumor = &sim.state.world.rumors[0];
        assert_eq!(json::get_u64(rumor, "hop"), Some(0));
        assert_eq!(json::get_f64(rumor, "confidence"), Some(0.75));
        assert_eq!(
            json::get_str(rumor, "template_id"),
            Some("rumor.signal_intent")
        );
        assert!(json::get_str(rumor, "rumor_id").unwrap().starts_with("rumor-"));
    }

    #[test]
    fn propagation_decays_confidence_and_bumps_hop() {
        let mut sim = rumor_sim(2);
        sim.schedule_event_at(
            Tick(0),
            ENCOUNTER_ACTION_OUTCOME_EVENT,
            executed_outcome(0, "evt-900:0"),
        );
        // One propagation interval after the base rumor lands.
        sim.advance_ticks(RUMOR_PROPAGATION_INTERVAL_TICKS + 1).unwrap();

        assert_eq!(sim.state.world.rumors.len(), 2);
        let child = &sim.state.world.rumors[1];
        assert_eq!(json::get_u64(child, "hop"), Some(1));
        assert_eq!(json::get_f64(child, "confidence"), Some(0.6));
        assert_eq!(
            json::get_str(child, "template_id"),
            Some("rumor.signal_intent")
        );
    }

    #[test]
    fn hop_cap_bounds_derivation() {
        let mut sim = rumor_sim(3);
        sim.schedule_event_at(
            Tick(0),
            ENCOUNTER_ACTION_OUTCOME_EVENT,
            executed_outcome(0, "evt-900:0"),
        );
        // Enough intervals for every hop to happen within the TTL.
        sim.advance_ticks(RUMOR_PROPAGATION_INTERVAL_TICKS * 4 + 1)
            .unwrap();

        let max_hop = sim
            .state
            .world
            .rumors
            .iter()
            .filter_map(|rumor| json::get_u64(rumor, "hop"))
            .max()
            .unwrap();
        assert!(max_hop <= RUMOR_HOP_CAP);
        for rumor in &sim.state.world.rumors {
            let confidence = json::get_f64(rumor, "confidence").unwrap();
            assert!((0.0..=1.0).contains(&confidence));
        }
    }

    #[test]
    fn expired_rumors_are_flagged_not_removed() {
        let mut sim = rumor_sim(4);
        sim.schedule_event_at(
            Tick(0),
            ENCOUNTER_ACTION_OUTCOME_EVENT,
            executed_outcome(0, "evt-900:0"),
        );
        sim.advance_ticks(RUMOR_TTL_TICKS + RUMOR_PROPAGATION_INTERVAL_TICKS + 2)
            .unwrap();

        let base = sim
            .state
            .world
            .rumors
            .iter()
            .find(|rumor| json::get_u64(rumor, "hop") == Some(0))
            .unwrap();
        let payload = base.get("payload").unwrap().as_object().unwrap();
        assert_eq!(payload.get("expired"), Some(&Value::Bool(true)));
    }
}

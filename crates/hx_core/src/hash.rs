//! # Hashing
//!
//! World / simulation / save hashes: SHA-256 over canonical JSON. Every
//! payload is rebuilt through the canonical codec immediately before
//! hashing, so the hash surface and the persisted form can never drift.

use serde_json::Value;

use hx_types::JsonMap;

use crate::canonical::hash_value;
use crate::sim::Simulation;
use crate::world::WorldState;
use crate::SCHEMA_VERSION;

/// Hash of the canonical world payload.
pub fn world_hash(world: &WorldState) -> String {
    hash_value(&world.to_value())
}

/// Hash of the full simulation surface: seed, RNG states, clock, world,
/// entities, input log, rules state, queues, trace, and selection.
pub fn simulation_hash(sim: &Simulation) -> String {
    let mut payload = JsonMap::new();
    payload.insert("seed".into(), Value::from(sim.master_seed().as_u64()));
    payload.insert("day".into(), Value::from(sim.get_day_index()));
    payload.insert("tick_in_day".into(), Value::from(sim.get_tick_in_day()));
    payload.insert("world".into(), sim.state.world.to_value());
    payload.insert("input_log".into(), sim.input_log_payload());
    let simulation_state = sim
        .simulation_payload()
        .as_object()
        .expect("simulation payload is an object")
        .clone();
    for (key, value) in simulation_state {
        payload.insert(key, value);
    }
    hash_value(&Value::Object(payload))
}

/// Hash of the defined save sub-objects (excludes `save_hash` itself and
/// free-form metadata).
pub fn save_hash(payload: &JsonMap) -> String {
    let mut hashed = JsonMap::new();
    for key in ["schema_version", "world_state", "simulation_state", "input_log"] {
        hashed.insert(
            key.to_string(),
            payload.get(key).cloned().unwrap_or(Value::Null),
        );
    }
    hash_value(&Value::Object(hashed))
}

/// Assemble the full save payload (with its hash embedded).
pub fn build_save_payload(sim: &Simulation) -> JsonMap {
    let mut payload = JsonMap::new();
    payload.insert("schema_version".into(), Value::from(SCHEMA_VERSION));
    payload.insert("world_state".into(), sim.state.world.to_value());
    payload.insert("simulation_state".into(), sim.simulation_payload());
    payload.insert("input_log".into(), sim.input_log_payload());
    let digest = save_hash(&payload);
    payload.insert("save_hash".into(), Value::String(digest));
    if let Some(metadata) = sim.save_metadata() {
        payload.insert("metadata".into(), Value::Object(metadata.clone()));
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use hx_types::{HexCoord, MasterSeed};

    fn sim(seed: u64) -> Simulation {
        let mut topology = JsonMap::new();
        topology.insert("radius".into(), Value::from(3));
        let world =
            WorldState::create_with_topology(MasterSeed(seed), "hex_disk", &topology).unwrap();
        Simulation::new(world, MasterSeed(seed))
    }

    #[test]
    fn world_hash_is_stable_and_seed_sensitive() {
        let a = sim(21);
        let b = sim(21);
        let c = sim(22);
        assert_eq!(world_hash(&a.state.world), world_hash(&b.state.world));
        assert_ne!(world_hash(&a.state.world), world_hash(&c.state.world));
    }

    #[test]
    fn simulation_hash_reflects_time_state() {
        let mut a = sim(21);
        let mut b = sim(21);
        a.state.tick = hx_types::Tick(330);
        b.state.tick = hx_types::Tick(330);
        a.state.time.epoch_tick = 7;
        b.state.time.epoch_tick = 7;
        assert_eq!(simulation_hash(&a), simulation_hash(&b));

        b.state.time.epoch_tick = 8;
        assert_ne!(simulation_hash(&a), simulation_hash(&b));
    }

    #[test]
    fn simulation_hash_covers_event_trace() {
        let mut a = sim(13);
        let before = simulation_hash(&a);
        a.schedule_event_at(hx_types::Tick(0), "debug_marker", JsonMap::new());
        a.advance_ticks(1).unwrap();
        assert_ne!(simulation_hash(&a), before);
    }

    #[test]
    fn save_hash_skips_metadata() {
        let mut a = sim(9);
        a.add_entity(crate::entity::EntityState::from_hex("runner", HexCoord::new(0, 0)));
        let bare = build_save_payload(&a);

        let mut metadata = JsonMap::new();
        metadata.insert("note".into(), Value::String("side channel".into()));
        a.set_save_metadata(Some(metadata));
        let annotated = build_save_payload(&a);

        assert_eq!(
            bare.get("save_hash").unwrap(),
            annotated.get("save_hash").unwrap()
        );
    }
}

//! # Spawn materialization
//!
//! Turns spawn descriptors into entities at tick start. Descriptors stay in
//! the world after materialization; the materialized-id ledger provides the
//! at-most-once guarantee. Unsupported location topologies record a bounded
//! warning and skip.

use serde_json::Value;

use hx_api::SimResult;
use hx_types::{
    axial_to_world_xy, json, square_cell_to_world_xy, CellCoord, JsonMap, LocationRef, Tick,
    OVERWORLD_HEX_TOPOLOGY, SQUARE_GRID_TOPOLOGY,
};

use crate::entity::EntityState;
use crate::rules::RuleModule;
use crate::sim::Simulation;

pub const SPAWN_ENTITY_ID_PREFIX: &str = "spawn";

const MAX_SPAWN_WARNINGS: usize = 200;
const MATERIALIZED_KEY: &str = "materialized_entity_ids";
const WARNINGS_KEY: &str = "warnings";

#[derive(Default)]
pub struct SpawnMaterializationModule;

impl SpawnMaterializationModule {
    pub const NAME: &'static str = "spawn_materialization";

    pub fn new() -> Self {
        SpawnMaterializationModule
    }

    fn entity_id(action_uid: &str, index: u64) -> String {
        format!("{SPAWN_ENTITY_ID_PREFIX}:{action_uid}:{index}")
    }

    fn placement(location: &LocationRef) -> Option<(String, f64, f64)> {
        match (&location.topology_type, location.coord) {
            (topology, CellCoord::Hex { q, r }) if topology == OVERWORLD_HEX_TOPOLOGY => {
                let (x, y) = axial_to_world_xy(hx_types::HexCoord::new(q, r));
                Some((location.space_id.clone(), x, y))
            }
            (topology, CellCoord::Square { x, y }) if topology == SQUARE_GRID_TOPOLOGY => {
                let (world_x, world_y) = square_cell_to_world_xy(x, y);
                Some((location.space_id.clone(), world_x, world_y))
            }
            _ => None,
        }
    }

    fn materialize(&self, sim: &mut Simulation) {
        let mut state = sim.get_rules_state(Self::NAME);
        let mut materialized = json::uid_ledger(&state, MATERIALIZED_KEY, usize::MAX);
        let mut warnings = state
            .get(WARNINGS_KEY)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut changed = false;

        let descriptors = sim.state.world.spawn_descriptors.clone();
        for descriptor in &descriptors {
            let Some(action_uid) = json::get_str(descriptor, "action_uid") else {
                continue;
            };
            let Some(template_id) = json::get_str(descriptor, "template_id") else {
                continue;
            };
            let quantity = json::get_u64(descriptor, "quantity").unwrap_or(0);
            if quantity == 0 {
                continue;
            }

            let location = descriptor.get("location").and_then(LocationRef::from_value);
            let placement = location.as_ref().and_then(Self::placement);
            let Some((space_id, position_x, position_y)) = placement else {
                let topology_type = descriptor
                    .get("location")
                    .and_then(Value::as_object)
                    .and_then(|map| json::get_str(map, "topology_type"))
                    .unwrap_or("")
                    .to_string();
                let duplicate = warnings.iter().any(|warning| {
                    warning.get("action_uid").and_then(Value::as_str) == Some(action_uid)
                        && warning.get("reason").and_then(Value::as_str)
                            == Some("unsupported_topology")
                });
                if !duplicate {
                    warnings.push(serde_json::json!({
                        "action_uid": action_uid,
                        "reason": "unsupported_topology",
                        "topology_type": topology_type,
                    }));
                    changed = true;
                }
                continue;
            };

            for index in 0..quantity {
                let entity_id = Self::entity_id(action_uid, index);
                if sim.entity(&entity_id).is_some() {
                    if !materialized.iter().any(|id| id == &entity_id) {
                        materialized.push(entity_id);
                        changed = true;
                    }
                    continue;
                }
                if materialized.iter().any(|id| id == &entity_id) {
                    continue;
                }
                let mut entity = EntityState::new(&entity_id, position_x, position_y);
                entity.space_id = space_id.clone();
                entity.speed_per_tick = 0.0;
                entity.template_id = Some(template_id.to_string());
                entity.source_action_uid = Some(action_uid.to_string());
                sim.add_entity(entity);
                materialized.push(entity_id);
                changed = true;
            }
        }

        if changed {
            materialized.sort();
            if warnings.len() > MAX_SPAWN_WARNINGS {
                let excess = warnings.len() - MAX_SPAWN_WARNINGS;
                warnings.drain(..excess);
            }
            json::set_uid_ledger(&mut state, MATERIALIZED_KEY, &materialized);
            state.insert(WARNINGS_KEY.into(), Value::Array(warnings));
            sim.set_rules_state(Self::NAME, state);
        }
    }
}

impl RuleModule for SpawnMaterializationModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_simulation_start(&mut self, sim: &mut Simulation) -> SimResult<()> {
        let state = sim.get_rules_state(Self::NAME);
        sim.set_rules_state(Self::NAME, state);
        Ok(())
    }

    fn on_tick_start(&mut self, sim: &mut Simulation, _tick: Tick) -> SimResult<()> {
        self.materialize(sim);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::WorldState;
    use hx_types::MasterSeed;
    use serde_json::json;

    fn spawn_sim(seed: u64) -> Simulation {
        let mut topology = JsonMap::new();
        topology.insert("radius".into(), Value::from(3));
        let world =
            WorldState::create_with_topology(MasterSeed(seed), "hex_disk", &topology).unwrap();
        let mut sim = Simulation::new(world, MasterSeed(seed));
        sim.register_rule_module(Box::new(SpawnMaterializationModule::new()))
            .unwrap();
        sim
    }

    fn descriptor(action_uid: &str, quantity: u64, topology: &str) -> JsonMap {
        let coord = if topology == "square_grid" {
            json!({"x": 1, "y": 1})
        } else {
            json!({"q": 1, "r": -1})
        };
        json!({
            "created_tick": 0,
            "location": {
                "space_id": "overworld",
                "topology_type": topology,
                "coord": coord,
            },
            "template_id": "npc.bandit",
            "quantity": quantity,
            "action_uid": action_uid,
            "params": {},
        })
        .as_object()
        .unwrap()
        .clone()
    }

    #[test]
    fn descriptors_materialize_once_with_stamped_provenance() {
        let mut sim = spawn_sim(1);
        sim.state
            .world
            .append_spawn_descriptor(descriptor("evt-9:0", 2, "overworld_hex"));
        sim.advance_ticks(3).unwrap();

        assert!(sim.entity("spawn:evt-9:0:0").is_some());
        assert!(sim.entity("spawn:evt-9:0:1").is_some());
        assert_eq!(sim.state.entities.len(), 2, "re-scans must not duplicate");

        let spawned = sim.entity("spawn:evt-9:0:0").unwrap();
        assert_eq!(spawned.template_id.as_deref(), Some("npc.bandit"));
        assert_eq!(spawned.source_action_uid.as_deref(), Some("evt-9:0"));
        assert_eq!(spawned.speed_per_tick, 0.0);
        assert_eq!(spawned.hex_coord(), hx_types::HexCoord::new(1, -1));
        // Descriptors stay in place after materialization.
        assert_eq!(sim.state.world.spawn_descriptors.len(), 1);
    }

    #[test]
    fn unsupported_topology_records_one_warning() {
        let mut sim = spawn_sim(2);
        let mut bad = descriptor("evt-9:1", 1, "overworld_hex");
        bad.insert(
            "location".into(),
            json!({"space_id": "overworld", "topology_type": "voronoi", "coord": {"q": 0, "r": 0}}),
        );
        sim.state.world.append_spawn_descriptor(bad);
        sim.advance_ticks(3).unwrap();

        let state = sim.get_rules_state(SpawnMaterializationModule::NAME);
        let warnings = state.get("warnings").unwrap().as_array().unwrap();
        assert_eq!(warnings.len(), 1, "warning is deduplicated across re-scans");
        assert_eq!(
            warnings[0].get("reason").unwrap().as_str().unwrap(),
            "unsupported_topology"
        );
        assert!(sim.state.entities.is_empty());
    }

    #[test]
    fn materialized_ledger_survives_save_load() {
        let mut sim = spawn_sim(3);
        sim.state
            .world
            .append_spawn_descriptor(descriptor("evt-9:2", 1, "overworld_hex"));
        sim.advance_ticks(1).unwrap();
        assert_eq!(sim.state.entities.len(), 1);

        let world = WorldState::from_value(&sim.state.world.to_value()).unwrap();
        let mut restored = Simulation::from_payload(
            world,
            &sim.simulation_payload(),
            &sim.input_log_payload(),
        )
        .unwrap();
        restored
            .register_rule_module(Box::new(SpawnMaterializationModule::new()))
            .unwrap();
        restored.advance_ticks(2).unwrap();
        assert_eq!(restored.state.entities.len(), 1);
    }
}

//! End-to-end scenarios against the full standard module set.

use serde_json::{json, Value};

use hx_api::commands;
use hx_api::SimCommand;
use hx_core::hash::simulation_hash;
use hx_core::modules::encounter::ENCOUNTER_RESOLVE_REQUEST_EVENT;
use hx_core::modules::execution::ENCOUNTER_ACTION_OUTCOME_EVENT;
use hx_core::{EntityState, Simulation, WorldState};
use hx_testkit::TestScenario;
use hx_types::{axial_to_world_xy, HexCoord, JsonMap, Tick};

fn params(value: Value) -> JsonMap {
    value.as_object().unwrap().clone()
}

/// Deterministic basic move: two independent runs of the same scripted
/// journey produce identical simulation hashes.
#[test]
fn deterministic_basic_move() {
    let run = |_: ()| {
        let mut runner = EntityState::from_hex("runner", HexCoord::new(0, 0));
        runner.speed_per_tick = 0.17;
        let mut sim = TestScenario::hex_disk(42)
            .with_entity_state(runner)
            .with_standard_modules()
            .build();

        sim.append_command(SimCommand::new(
            Tick(0),
            Some("runner"),
            commands::SET_MOVE_VECTOR,
            params(json!({"x": 1.0, "y": 1.0})),
        ));
        sim.advance_ticks(8).unwrap();

        sim.append_command(SimCommand::new(
            Tick(8),
            Some("runner"),
            commands::STOP,
            JsonMap::new(),
        ));
        let (x, y) = axial_to_world_xy(HexCoord::new(1, -1));
        sim.append_command(SimCommand::new(
            Tick(8),
            Some("runner"),
            commands::SET_TARGET_POSITION,
            params(json!({"x": x, "y": y})),
        ));
        sim.advance_ticks(10).unwrap();
        sim.advance_days(1).unwrap();
        simulation_hash(&sim)
    };

    assert_eq!(run(()), run(()));
}

/// The pipeline produces exactly one selection, one action stub, and one
/// outcome per action per resolve request, even when a save/load split
/// falls mid-pipeline.
#[test]
fn encounter_pipeline_counts_survive_save_load_split() {
    let resolve_request = params(json!({
        "tick": 0,
        "context": "global",
        "trigger": "idle",
        "location": {"space_id": "overworld", "topology_type": "overworld_hex", "coord": {"q": 0, "r": 0}},
        "roll": 12,
        "category": "hostile",
    }));

    let count_outcomes = |sim: &Simulation| {
        sim.get_event_trace()
            .iter()
            .filter(|entry| entry.event_type == ENCOUNTER_ACTION_OUTCOME_EVENT)
            .count()
    };

    // Straight run.
    let mut straight = TestScenario::hex_disk(99)
        .with_entity("runner", 0, 0)
        .with_standard_modules()
        .build();
    straight.schedule_event_at(Tick(0), ENCOUNTER_RESOLVE_REQUEST_EVENT, resolve_request.clone());
    straight.advance_ticks(8).unwrap();

    // Split run: save after two ticks, reload, finish.
    let mut split = TestScenario::hex_disk(99)
        .with_entity("runner", 0, 0)
        .with_standard_modules()
        .build();
    split.schedule_event_at(Tick(0), ENCOUNTER_RESOLVE_REQUEST_EVENT, resolve_request);
    split.advance_ticks(2).unwrap();

    let world = WorldState::from_value(&split.state.world.to_value()).unwrap();
    let mut resumed = Simulation::from_payload(
        world,
        &split.simulation_payload(),
        &split.input_log_payload(),
    )
    .unwrap();
    resumed.set_known_item_ids(split.known_item_ids().clone());
    hx_core::modules::install_standard_modules(&mut resumed, &hx_content::ContentPack::minimal())
        .unwrap();
    resumed.advance_ticks(6).unwrap();

    assert!(count_outcomes(&straight) >= 1);
    assert_eq!(count_outcomes(&straight), count_outcomes(&resumed));
    assert_eq!(simulation_hash(&straight), simulation_hash(&resumed));
}

/// Inventory conservation: transfers never change the total stock of an
/// item across all containers.
#[test]
fn transfer_conserves_total_quantity() {
    let mut sim = TestScenario::hex_disk(11)
        .with_entity("runner", 0, 0)
        .with_entity("mule", 0, 1)
        .with_standard_modules()
        .build();

    let runner_inv = sim.entity("runner").unwrap().inventory_container_id.clone().unwrap();
    let mule_inv = sim.entity("mule").unwrap().inventory_container_id.clone().unwrap();
    sim.state
        .world
        .containers
        .get_mut(&runner_inv)
        .unwrap()
        .add("scrap_iron", 10);

    let total = |sim: &Simulation| -> u64 {
        sim.state
            .world
            .containers
            .values()
            .map(|container| container.quantity("scrap_iron"))
            .sum()
    };
    assert_eq!(total(&sim), 10);

    sim.append_command(SimCommand::new(
        Tick(0),
        Some("runner"),
        commands::INVENTORY_INTENT,
        params(json!({
            "src_container_id": runner_inv,
            "dst_container_id": mule_inv,
            "item_id": "scrap_iron",
            "quantity": 4,
            "reason": "transfer",
        })),
    ));
    sim.advance_ticks(1).unwrap();

    assert_eq!(sim.state.world.containers[&runner_inv].quantity("scrap_iron"), 6);
    assert_eq!(sim.state.world.containers[&mule_inv].quantity("scrap_iron"), 4);
    assert_eq!(total(&sim), 10);
}

/// Partitioned advancement: any split of N ticks produces the same hash as
/// one straight run of N.
#[test]
fn advancement_partitions_agree() {
    let build = |_: ()| {
        let mut sim = TestScenario::hex_disk(5)
            .with_entity("runner", 0, 0)
            .with_standard_modules()
            .build();
        sim.append_command(SimCommand::new(
            Tick(0),
            Some("runner"),
            commands::SET_MOVE_VECTOR,
            params(json!({"x": 0.5, "y": -1.0})),
        ));
        sim
    };

    let mut straight = build(());
    straight.advance_ticks(30).unwrap();

    let mut partitioned = build(());
    for chunk in [1u64, 7, 2, 11, 9] {
        partitioned.advance_ticks(chunk).unwrap();
    }

    assert_eq!(simulation_hash(&straight), simulation_hash(&partitioned));
}

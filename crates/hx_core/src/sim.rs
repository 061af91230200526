//! # Simulation
//!
//! The single authoritative owner of all mutable state. A tick advances by:
//!
//! 1. `on_tick_start` on every rule module in registration order
//! 2. drain commands scheduled for the current tick, in input-log order
//! 3. movement integration (continuous positions, travel-step detection)
//! 4. drain events due at or before the current tick, in (tick, id) order
//! 5. `on_tick_end` on every module, then increment the tick
//!
//! ## Determinism
//! - Commands within a tick: input-log order
//! - Events within a tick: monotonic event-id order; same-tick events
//!   scheduled during the drain execute in the same pass
//! - Module hooks: registration order
//! - Per-tick caps are fatal: the caller must discard the simulation

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use hx_api::commands::{self, SimCommand};
use hx_api::events::{self, format_event_id, SimEvent, TraceEntry};
use hx_api::{EngineError, SimResult};
use hx_types::{
    axial_to_world_xy, json, normalized_vector, square_cell_to_world_xy, world_xy_to_axial,
    world_xy_to_square_cell, CellCoord, JsonMap, LocationRef, MasterSeed, Tick, TimeState,
    OVERWORLD_HEX_TOPOLOGY, SQUARE_GRID_TOPOLOGY,
};

use crate::entity::EntityState;
use crate::rng::RngStreams;
use crate::rules::RuleModule;
use crate::world::{ContainerState, SpaceState, WorldState};
use crate::{
    MAX_COMBAT_LOG, MAX_COMMANDS_PER_TICK, MAX_EVENTS_PER_TICK, MAX_EVENT_TRACE,
    MAX_EXECUTED_ACTION_UIDS,
};

const TARGET_REACHED_THRESHOLD: f64 = 0.05;
const INVENTORY_LEDGER_MODULE: &str = "inventory";

/// Callback invoked when a periodic task fires.
pub type TaskCallback = Box<dyn FnMut(&mut Simulation, Tick)>;

/// Simulation-owned periodic scheduling substrate.
///
/// Tasks are carried by self-rescheduling `periodic_tick` events, so pending
/// schedules survive save/load; re-registration rehydrates against the
/// pending queue instead of double-scheduling.
#[derive(Default)]
struct PeriodicScheduler {
    intervals: BTreeMap<String, u64>,
    start_ticks: BTreeMap<String, Tick>,
    order: Vec<String>,
    callbacks: BTreeMap<String, TaskCallback>,
}

/// All serialized simulation state apart from the RNG streams and queues.
pub struct SimulationState {
    pub world: WorldState,
    pub tick: Tick,
    pub time: TimeState,
    pub entities: BTreeMap<String, EntityState>,
    pub rules_state: BTreeMap<String, JsonMap>,
    pub selected_entity_id: Option<String>,
    pub combat_log: Vec<JsonMap>,
}

/// The simulation root.
pub struct Simulation {
    pub state: SimulationState,
    rng: RngStreams,
    input_log: Vec<SimCommand>,
    pending_events: BTreeMap<(u64, u64), SimEvent>,
    event_trace: Vec<TraceEntry>,
    next_event_counter: u64,
    modules: Vec<Box<dyn RuleModule>>,
    module_names: BTreeSet<String>,
    scheduler: PeriodicScheduler,
    known_item_ids: BTreeSet<String>,
    save_metadata: Option<JsonMap>,
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("tick", &self.state.tick)
            .finish_non_exhaustive()
    }
}

impl Simulation {
    pub fn new(world: WorldState, master_seed: MasterSeed) -> Self {
        Simulation {
            state: SimulationState {
                world,
                tick: Tick::ZERO,
                time: TimeState::default(),
                entities: BTreeMap::new(),
                rules_state: BTreeMap::new(),
                selected_entity_id: None,
                combat_log: Vec::new(),
            },
            rng: RngStreams::new(master_seed),
            input_log: Vec::new(),
            pending_events: BTreeMap::new(),
            event_trace: Vec::new(),
            next_event_counter: 1,
            modules: Vec::new(),
            module_names: BTreeSet::new(),
            scheduler: PeriodicScheduler::default(),
            known_item_ids: BTreeSet::new(),
            save_metadata: None,
        }
    }

    pub fn master_seed(&self) -> MasterSeed {
        self.rng.master_seed()
    }

    /// Item ids the built-in inventory router accepts.
    pub fn set_known_item_ids(&mut self, item_ids: BTreeSet<String>) {
        self.known_item_ids = item_ids;
    }

    pub fn known_item_ids(&self) -> &BTreeSet<String> {
        &self.known_item_ids
    }

    /// Unknown save metadata, preserved verbatim across load/save.
    pub fn save_metadata(&self) -> Option<&JsonMap> {
        self.save_metadata.as_ref()
    }

    pub fn set_save_metadata(&mut self, metadata: Option<JsonMap>) {
        self.save_metadata = metadata;
    }

    // ========================================================================
    // Entities
    // ========================================================================

    /// Insert an entity, provisioning its inventory container on demand.
    pub fn add_entity(&mut self, mut entity: EntityState) {
        if entity.inventory_container_id.is_none() {
            let container_id = format!("inv:{}", entity.entity_id);
            self.state
                .world
                .containers
                .entry(container_id.clone())
                .or_insert_with(|| {
                    let mut container = ContainerState::new(container_id.clone());
                    container.owner_entity_id = Some(entity.entity_id.clone());
                    container
                });
            entity.inventory_container_id = Some(container_id);
        }
        self.state.entities.insert(entity.entity_id.clone(), entity);
    }

    pub fn entity(&self, entity_id: &str) -> Option<&EntityState> {
        self.state.entities.get(entity_id)
    }

    pub fn entity_mut(&mut self, entity_id: &str) -> Option<&mut EntityState> {
        self.state.entities.get_mut(entity_id)
    }

    // ========================================================================
    // RNG / rules-state / calendar
    // ========================================================================

    /// Named RNG stream, derived on first use.
    pub fn rng_stream(&mut self, name: &str) -> &mut crate::rng::Mt19937 {
        self.rng.stream(name)
    }

    /// A module's rules-state partition (empty object when unset).
    pub fn get_rules_state(&self, module_name: &str) -> JsonMap {
        self.state
            .rules_state
            .get(module_name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_rules_state(&mut self, module_name: &str, state: JsonMap) {
        self.state.rules_state.insert(module_name.to_string(), state);
    }

    pub fn get_day_index(&self) -> u64 {
        self.state.time.day_index(self.state.tick)
    }

    pub fn get_tick_in_day(&self) -> u64 {
        self.state.time.tick_in_day(self.state.tick)
    }

    pub fn get_ticks_per_day(&self) -> u64 {
        self.state.time.ticks_per_day
    }

    // ========================================================================
    // Input log / events
    // ========================================================================

    /// Append a command to the input log. Commands for the current tick
    /// appended during command processing are drained in the same tick.
    pub fn append_command(&mut self, command: SimCommand) {
        self.input_log.push(command);
    }

    pub fn input_log(&self) -> &[SimCommand] {
        &self.input_log
    }

    /// Schedule an event; returns its id.
    pub fn schedule_event_at(&mut self, tick: Tick, event_type: &str, params: JsonMap) -> String {
        let counter = self.next_event_counter;
        self.next_event_counter += 1;
        let event_id = format_event_id(counter);
        self.pending_events.insert(
            (tick.as_u64(), counter),
            SimEvent {
                tick,
                event_id: event_id.clone(),
                event_type: event_type.to_string(),
                params,
            },
        );
        event_id
    }

    /// Pending events in deterministic (tick, id) order.
    pub fn pending_events(&self) -> Vec<&SimEvent> {
        self.pending_events.values().collect()
    }

    pub fn get_event_trace(&self) -> &[TraceEntry] {
        &self.event_trace
    }

    /// Executed event ids, in execution order.
    pub fn event_execution_trace(&self) -> Vec<u64> {
        self.event_trace.iter().map(|entry| entry.event_id).collect()
    }

    /// Append a synthetic trace entry (outcome recorded outside the drain
    /// loop). The id is digest-derived so it is platform-independent.
    pub fn append_trace_entry(&mut self, entry: TraceEntry) {
        self.event_trace.push(entry);
        if self.event_trace.len() > MAX_EVENT_TRACE {
            let excess = self.event_trace.len() - MAX_EVENT_TRACE;
            self.event_trace.drain(..excess);
        }
    }

    /// Digest-derived trace id for synthetic entries.
    pub fn trace_event_id_for(key: &str) -> u64 {
        let digest = Sha256::digest(key.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(bytes)
    }

    // ========================================================================
    // Combat log
    // ========================================================================

    /// Append to the bounded combat log and mirror into the event trace.
    pub fn append_combat_outcome(&mut self, outcome: JsonMap) {
        let action_uid = outcome
            .get("action_uid")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        self.state.combat_log.push(outcome.clone());
        if self.state.combat_log.len() > MAX_COMBAT_LOG {
            let excess = self.state.combat_log.len() - MAX_COMBAT_LOG;
            self.state.combat_log.drain(..excess);
        }
        self.append_trace_entry(TraceEntry {
            tick: self.state.tick,
            event_id: Self::trace_event_id_for(&format!("combat:{action_uid}")),
            event_type: "combat_outcome".to_string(),
            params: outcome,
            module_hooks_called: true,
        });
    }

    pub fn combat_log(&self) -> &[JsonMap] {
        &self.state.combat_log
    }

    // ========================================================================
    // Rule modules
    // ========================================================================

    /// Register a module; its `on_simulation_start` fires immediately.
    pub fn register_rule_module(&mut self, mut module: Box<dyn RuleModule>) -> SimResult<()> {
        let name = module.name().to_string();
        if !self.module_names.insert(name.clone()) {
            return Err(EngineError::DuplicateModule(name));
        }
        debug!(module = %name, "registering rule module");
        module.on_simulation_start(self)?;
        self.modules.push(module);
        Ok(())
    }

    pub fn module_names(&self) -> Vec<String> {
        self.modules.iter().map(|m| m.name().to_string()).collect()
    }

    fn restore_modules(&mut self, mut modules: Vec<Box<dyn RuleModule>>) {
        // Modules registered during a detached dispatch landed in
        // self.modules; keep them after the original registration order.
        let mut appended = std::mem::take(&mut self.modules);
        modules.append(&mut appended);
        self.modules = modules;
    }

    // ========================================================================
    // Periodic scheduler
    // ========================================================================

    /// Register an interval task backed by a self-rescheduling event.
    /// Identical duplicate registrations are idempotent; conflicting ones are
    /// fatal. On load, a pending `periodic_tick` for the task suppresses
    /// re-scheduling.
    pub fn register_periodic_task(
        &mut self,
        task_name: &str,
        interval_ticks: u64,
        start_tick: Tick,
    ) -> SimResult<()> {
        if task_name.is_empty() {
            return Err(EngineError::PeriodicTask {
                task: String::new(),
                detail: "task_name must be a non-empty string".into(),
            });
        }
        if interval_ticks == 0 {
            return Err(EngineError::PeriodicTask {
                task: task_name.to_string(),
                detail: "interval_ticks must be a positive integer".into(),
            });
        }
        if let Some(existing_interval) = self.scheduler.intervals.get(task_name) {
            let existing_start = self.scheduler.start_ticks.get(task_name).copied();
            if *existing_interval == interval_ticks && existing_start == Some(start_tick) {
                return Ok(());
            }
            return Err(EngineError::PeriodicTask {
                task: task_name.to_string(),
                detail: format!(
                    "conflicting registration: existing interval {existing_interval}, got {interval_ticks}"
                ),
            });
        }

        self.scheduler
            .intervals
            .insert(task_name.to_string(), interval_ticks);
        self.scheduler
            .start_ticks
            .insert(task_name.to_string(), start_tick);
        self.scheduler.order.push(task_name.to_string());

        for event in self.pending_events.values() {
            if event.event_type != events::PERIODIC_TICK {
                continue;
            }
            if json::get_str(&event.params, "task") != Some(task_name) {
                continue;
            }
            let pending_interval = json::get_u64(&event.params, "interval").unwrap_or(0);
            if pending_interval != interval_ticks {
                return Err(EngineError::PeriodicTask {
                    task: task_name.to_string(),
                    detail: format!(
                        "conflicting intervals: pending {pending_interval} vs {interval_ticks}"
                    ),
                });
            }
            return Ok(());
        }

        let mut params = JsonMap::new();
        params.insert("task".into(), Value::String(task_name.to_string()));
        params.insert("interval".into(), Value::from(interval_ticks));
        self.schedule_event_at(start_tick, events::PERIODIC_TICK, params);
        Ok(())
    }

    pub fn set_task_callback(&mut self, task_name: &str, callback: TaskCallback) -> SimResult<()> {
        if !self.scheduler.intervals.contains_key(task_name) {
            return Err(EngineError::PeriodicTask {
                task: task_name.to_string(),
                detail: "cannot set callback for unknown periodic task".into(),
            });
        }
        self.scheduler.callbacks.insert(task_name.to_string(), callback);
        Ok(())
    }

    fn execute_periodic_event(&mut self, event: &SimEvent) -> SimResult<()> {
        let task = json::get_str(&event.params, "task")
            .ok_or_else(|| EngineError::InvalidPayload("periodic_tick missing task".into()))?
            .to_string();
        let interval = json::get_u64(&event.params, "interval")
            .filter(|interval| *interval > 0)
            .ok_or_else(|| {
                EngineError::InvalidPayload("periodic_tick interval must be positive".into())
            })?;

        if !self.scheduler.intervals.contains_key(&task) {
            self.scheduler.intervals.insert(task.clone(), interval);
            self.scheduler.start_ticks.insert(task.clone(), event.tick);
            self.scheduler.order.push(task.clone());
        }

        if let Some(mut callback) = self.scheduler.callbacks.remove(&task) {
            callback(self, event.tick);
            self.scheduler.callbacks.entry(task.clone()).or_insert(callback);
        }

        let mut params = JsonMap::new();
        params.insert("task".into(), Value::String(task));
        params.insert("interval".into(), Value::from(interval));
        self.schedule_event_at(event.tick + interval, events::PERIODIC_TICK, params);
        Ok(())
    }

    // ========================================================================
    // Tick loop
    // ========================================================================

    pub fn advance_ticks(&mut self, ticks: u64) -> SimResult<()> {
        for _ in 0..ticks {
            self.tick_once()?;
        }
        Ok(())
    }

    pub fn advance_days(&mut self, days: u64) -> SimResult<()> {
        self.advance_ticks(days * self.state.time.ticks_per_day)
    }

    fn tick_once(&mut self) -> SimResult<()> {
        let tick = self.state.tick;

        let mut modules = std::mem::take(&mut self.modules);
        let mut result = Ok(());
        for module in modules.iter_mut() {
            result = module.on_tick_start(self, tick);
            if result.is_err() {
                break;
            }
        }
        self.restore_modules(modules);
        result?;

        self.apply_commands_for_tick(tick)?;
        self.advance_entities(tick);
        self.drain_due_events(tick)?;

        let mut modules = std::mem::take(&mut self.modules);
        let mut result = Ok(());
        for module in modules.iter_mut() {
            result = module.on_tick_end(self, tick);
            if result.is_err() {
                break;
            }
        }
        self.restore_modules(modules);
        result?;

        self.state.tick = tick.next();
        Ok(())
    }

    /// Drain the input log for one tick. Public so that idempotence ledgers
    /// can be exercised by replaying a tick's commands.
    pub fn apply_commands_for_tick(&mut self, tick: Tick) -> SimResult<()> {
        let mut log_index = 0;
        let mut command_index = 0;
        while log_index < self.input_log.len() {
            let command = self.input_log[log_index].clone();
            log_index += 1;
            if command.tick != tick {
                continue;
            }
            if command_index >= MAX_COMMANDS_PER_TICK {
                return Err(EngineError::CommandCapExceeded {
                    tick: tick.as_u64(),
                    cap: MAX_COMMANDS_PER_TICK,
                });
            }
            self.dispatch_command(&command, command_index)?;
            command_index += 1;
        }
        Ok(())
    }

    fn dispatch_command(&mut self, command: &SimCommand, command_index: usize) -> SimResult<()> {
        let mut modules = std::mem::take(&mut self.modules);
        let mut handled = Ok(false);
        for module in modules.iter_mut() {
            handled = module.on_command(self, command, command_index);
            match handled {
                Ok(false) => continue,
                _ => break,
            }
        }
        self.restore_modules(modules);
        if handled? {
            return Ok(());
        }
        self.route_builtin_command(command, command_index)
    }

    fn drain_due_events(&mut self, tick: Tick) -> SimResult<()> {
        let hooks_present = !self.modules.is_empty();
        let mut executed = 0usize;
        loop {
            let Some((&key, _)) = self.pending_events.iter().next() else {
                break;
            };
            if key.0 > tick.as_u64() {
                break;
            }
            if executed >= MAX_EVENTS_PER_TICK {
                return Err(EngineError::EventCapExceeded {
                    tick: tick.as_u64(),
                    cap: MAX_EVENTS_PER_TICK,
                });
            }
            executed += 1;
            let event = self
                .pending_events
                .remove(&key)
                .expect("key was just observed in the queue");

            // Built-in executor first (noop for pure markers), then fan out.
            if event.event_type == events::PERIODIC_TICK {
                self.execute_periodic_event(&event)?;
            }

            let mut modules = std::mem::take(&mut self.modules);
            let mut result = Ok(());
            for module in modules.iter_mut() {
                result = module.on_event_executed(self, &event);
                if result.is_err() {
                    break;
                }
            }
            self.restore_modules(modules);
            result?;

            self.append_trace_entry(TraceEntry {
                tick: event.tick,
                event_id: event.event_id_number(),
                event_type: event.event_type.clone(),
                params: event.params.clone(),
                module_hooks_called: hooks_present,
            });
        }
        Ok(())
    }

    // ========================================================================
    // Movement integration
    // ========================================================================

    fn advance_entities(&mut self, tick: Tick) {
        let entity_ids: Vec<String> = self.state.entities.keys().cloned().collect();
        for entity_id in entity_ids {
            self.advance_entity(&entity_id, tick);
        }
    }

    fn advance_entity(&mut self, entity_id: &str, tick: Tick) {
        let Some(entity) = self.state.entities.get(entity_id) else {
            return;
        };
        let space_id = entity.space_id.clone();
        let before_cell = self.entity_cell(entity_id);

        let (mut move_x, mut move_y) = (entity.move_input_x, entity.move_input_y);
        let target = entity.target_position;
        let (pos_x, pos_y) = (entity.position_x, entity.position_y);
        let speed = entity.speed_per_tick;
        let explicit_input = move_x != 0.0 || move_y != 0.0;

        if !explicit_input {
            let Some((target_x, target_y)) = target else {
                return;
            };
            let delta_x = target_x - pos_x;
            let delta_y = target_y - pos_y;
            let distance_sq = delta_x * delta_x + delta_y * delta_y;
            if distance_sq <= TARGET_REACHED_THRESHOLD * TARGET_REACHED_THRESHOLD {
                if let Some(entity) = self.state.entities.get_mut(entity_id) {
                    entity.target_position = None;
                }
                return;
            }
            let distance = distance_sq.sqrt();
            move_x = delta_x / distance;
            move_y = delta_y / distance;
        }

        if move_x == 0.0 && move_y == 0.0 {
            return;
        }

        let mut step_size = speed;
        if !explicit_input {
            if let Some((target_x, target_y)) = target {
                let delta_x = target_x - pos_x;
                let delta_y = target_y - pos_y;
                let distance = (delta_x * delta_x + delta_y * delta_y).sqrt();
                if distance < step_size {
                    step_size = distance;
                }
            }
        }

        let next_x = pos_x + move_x * step_size;
        let next_y = pos_y + move_y * step_size;

        if self.position_is_within_space(&space_id, next_x, next_y) {
            if let Some(entity) = self.state.entities.get_mut(entity_id) {
                entity.position_x = next_x;
                entity.position_y = next_y;
            }
        } else if !explicit_input {
            if let Some(entity) = self.state.entities.get_mut(entity_id) {
                entity.target_position = None;
            }
            return;
        } else {
            return;
        }

        let after_cell = self.entity_cell(entity_id);
        if before_cell != after_cell {
            if let (Some(from), Some(to)) = (
                self.entity_location_for_cell(&space_id, before_cell),
                self.entity_location_for_cell(&space_id, after_cell),
            ) {
                let mut params = JsonMap::new();
                params.insert("tick".into(), Value::from(tick.as_u64()));
                params.insert("entity_id".into(), Value::String(entity_id.to_string()));
                params.insert("location_from".into(), from.to_value());
                params.insert("location_to".into(), to.to_value());
                self.schedule_event_at(tick, events::TRAVEL_STEP, params);
            }
        }
    }

    fn position_is_within_space(&self, space_id: &str, x: f64, y: f64) -> bool {
        let Some(space) = self.state.world.spaces.get(space_id) else {
            return false;
        };
        if space.topology_type == SQUARE_GRID_TOPOLOGY {
            let (cell_x, cell_y) = world_xy_to_square_cell(x, y);
            space.is_valid_cell(&CellCoord::square(cell_x, cell_y))
        } else {
            space.hexes.contains_key(&world_xy_to_axial(x, y))
        }
    }

    // ========================================================================
    // Location helpers
    // ========================================================================

    /// Discrete cell for an entity, derived through its space topology.
    pub fn entity_cell(&self, entity_id: &str) -> Option<CellCoord> {
        let entity = self.state.entities.get(entity_id)?;
        let space = self.state.world.spaces.get(&entity.space_id)?;
        if space.topology_type == SQUARE_GRID_TOPOLOGY {
            let (x, y) = world_xy_to_square_cell(entity.position_x, entity.position_y);
            Some(CellCoord::square(x, y))
        } else {
            Some(entity.hex_coord().into())
        }
    }

    /// Opaque location reference for an entity.
    pub fn entity_location_ref(&self, entity_id: &str) -> Option<LocationRef> {
        let entity = self.state.entities.get(entity_id)?;
        let cell = self.entity_cell(entity_id)?;
        self.entity_location_for_cell(&entity.space_id, Some(cell))
    }

    fn entity_location_for_cell(
        &self,
        space_id: &str,
        cell: Option<CellCoord>,
    ) -> Option<LocationRef> {
        let cell = cell?;
        let topology = match cell {
            CellCoord::Square { .. } => SQUARE_GRID_TOPOLOGY,
            CellCoord::Hex { .. } => OVERWORLD_HEX_TOPOLOGY,
        };
        Some(LocationRef::new(space_id, topology, cell))
    }

    /// Continuous world position for a cell of a space.
    pub fn coord_to_world_xy(space: &SpaceState, coord: &CellCoord) -> Option<(f64, f64)> {
        if space.topology_type == SQUARE_GRID_TOPOLOGY {
            let (x, y) = coord.as_square()?;
            Some(square_cell_to_world_xy(x, y))
        } else {
            Some(axial_to_world_xy(coord.as_hex()?))
        }
    }

    /// A location topology fits a space topology when both are square grids
    /// or both are hex planes.
    pub fn topology_compatible(space_topology: &str, location_topology: &str) -> bool {
        if space_topology == SQUARE_GRID_TOPOLOGY || location_topology == SQUARE_GRID_TOPOLOGY {
            return space_topology == SQUARE_GRID_TOPOLOGY
                && location_topology == SQUARE_GRID_TOPOLOGY;
        }
        true
    }

    // ========================================================================
    // Built-in command router
    // ========================================================================

    fn route_builtin_command(&mut self, command: &SimCommand, command_index: usize) -> SimResult<()> {
        match command.command_type.as_str() {
            commands::SET_MOVE_VECTOR => self.handle_set_move_vector(command),
            commands::SET_TARGET_POSITION => self.handle_set_target_position(command),
            commands::STOP => self.handle_stop(command),
            commands::TRANSITION_SPACE => self.handle_transition_space(command),
            commands::ENTER_SITE => self.handle_enter_site(command),
            commands::SET_SELECTED_ENTITY => {
                let selected = json::get_str(&command.params, "selected_entity_id")
                    .map(str::to_string);
                self.apply_selection(command.entity_id.as_deref(), selected);
                Ok(())
            }
            commands::CLEAR_SELECTED_ENTITY => {
                self.apply_selection(command.entity_id.as_deref(), None);
                Ok(())
            }
            commands::INVENTORY_INTENT => {
                self.execute_inventory_intent(command, command_index);
                Ok(())
            }
            commands::NOOP_INPUT | commands::DEBUG_MARKER => Ok(()),
            other => {
                debug!(command_type = other, "unrouted command ignored");
                Ok(())
            }
        }
    }

    fn handle_set_move_vector(&mut self, command: &SimCommand) -> SimResult<()> {
        let Some(entity_id) = command.entity_id.as_deref() else {
            return Ok(());
        };
        let x = json::get_f64(&command.params, "x").unwrap_or(0.0);
        let y = json::get_f64(&command.params, "y").unwrap_or(0.0);
        let (move_x, move_y) = normalized_vector(x, y);
        if let Some(entity) = self.state.entities.get_mut(entity_id) {
            entity.move_input_x = move_x;
            entity.move_input_y = move_y;
        }
        Ok(())
    }

    fn handle_set_target_position(&mut self, command: &SimCommand) -> SimResult<()> {
        let Some(entity_id) = command.entity_id.as_deref() else {
            return Ok(());
        };
        let (Some(x), Some(y)) = (
            json::get_f64(&command.params, "x"),
            json::get_f64(&command.params, "y"),
        ) else {
            return Ok(());
        };
        let Some(entity) = self.state.entities.get(entity_id) else {
            return Ok(());
        };
        let space_id = entity.space_id.clone();
        if self.position_is_within_space(&space_id, x, y) {
            if let Some(entity) = self.state.entities.get_mut(entity_id) {
                entity.target_position = Some((x, y));
            }
        }
        Ok(())
    }

    fn handle_stop(&mut self, command: &SimCommand) -> SimResult<()> {
        let Some(entity_id) = command.entity_id.as_deref() else {
            return Ok(());
        };
        if let Some(entity) = self.state.entities.get_mut(entity_id) {
            entity.move_input_x = 0.0;
            entity.move_input_y = 0.0;
            entity.target_position = None;
        }
        Ok(())
    }

    fn apply_selection(&mut self, owner: Option<&str>, selected: Option<String>) {
        if let Some(selected_id) = &selected {
            if !self.state.entities.contains_key(selected_id) {
                return;
            }
        }
        match owner {
            Some(owner_id) => {
                if let Some(entity) = self.state.entities.get_mut(owner_id) {
                    entity.selected_entity_id = selected;
                }
            }
            None => self.state.selected_entity_id = selected,
        }
    }

    /// Teleport an entity to a validated location in another (or the same)
    /// space. Emits a `space_transition` event either way.
    fn handle_transition_space(&mut self, command: &SimCommand) -> SimResult<()> {
        let tick = command.tick;
        let entity_id = command.entity_id.clone();
        let to_location = command
            .params
            .get("to_location")
            .and_then(LocationRef::from_value);
        let reason_tag = json::get_str(&command.params, "reason").map(str::to_string);

        let (applied, reason, from_space_id) = (|| {
            let Some(entity_id) = entity_id.as_deref() else {
                return (false, "unknown_entity", None);
            };
            let Some(entity) = self.state.entities.get(entity_id) else {
                return (false, "unknown_entity", None);
            };
            let from_space_id = Some(entity.space_id.clone());
            let Some(location) = to_location.as_ref() else {
                return (false, "invalid_params", from_space_id);
            };
            let Some(space) = self.state.world.spaces.get(&location.space_id) else {
                return (false, "unknown_space", from_space_id);
            };
            if !Self::topology_compatible(&space.topology_type, &location.topology_type)
                || !space.is_valid_cell(&location.coord)
            {
                return (false, "invalid_location_for_space", from_space_id);
            }
            let Some((x, y)) = Self::coord_to_world_xy(space, &location.coord) else {
                return (false, "invalid_location_for_space", from_space_id);
            };
            let space_id = space.space_id.clone();
            let entity = self
                .state
                .entities
                .get_mut(entity_id)
                .expect("entity presence checked above");
            entity.space_id = space_id;
            entity.position_x = x;
            entity.position_y = y;
            entity.move_input_x = 0.0;
            entity.move_input_y = 0.0;
            entity.target_position = None;
            (true, "resolved", from_space_id)
        })();

        let mut params = JsonMap::new();
        params.insert("tick".into(), Value::from(tick.as_u64()));
        params.insert(
            "entity_id".into(),
            entity_id.map(Value::String).unwrap_or(Value::Null),
        );
        params.insert(
            "from_space_id".into(),
            from_space_id.map(Value::String).unwrap_or(Value::Null),
        );
        params.insert(
            "to_location".into(),
            to_location.map(|l| l.to_value()).unwrap_or(Value::Null),
        );
        params.insert("applied".into(), Value::Bool(applied));
        params.insert("reason".into(), Value::String(reason.to_string()));
        if let Some(tag) = reason_tag {
            params.insert("trigger_reason".into(), Value::String(tag));
        }
        self.schedule_event_at(tick, events::SPACE_TRANSITION, params);
        Ok(())
    }

    fn handle_enter_site(&mut self, command: &SimCommand) -> SimResult<()> {
        let tick = command.tick;
        let entity_id = command.entity_id.clone();
        let site_id = json::get_str(&command.params, "site_id").map(str::to_string);

        let (applied, reason, to_space_id, spawn_coord) = (|| {
            let Some(entity_id) = entity_id.as_deref() else {
                return (false, "unknown_entity", None, None);
            };
            if !self.state.entities.contains_key(entity_id) {
                return (false, "unknown_entity", None, None);
            }
            let Some(site_id) = site_id.as_deref() else {
                return (false, "invalid_params", None, None);
            };
            let Some(site) = self.state.world.sites.get(site_id) else {
                return (false, "unknown_site", None, None);
            };
            let Some(entrance) = &site.entrance else {
                return (false, "no_entrance", None, None);
            };
            let Some(space) = self.state.world.spaces.get(&entrance.target_space_id) else {
                return (false, "unknown_space", None, None);
            };
            let spawn = entrance
                .spawn
                .filter(|coord| space.is_valid_cell(coord))
                .unwrap_or_else(|| space.default_spawn_coord());
            let Some((x, y)) = Self::coord_to_world_xy(space, &spawn) else {
                return (false, "invalid_location_for_space", None, None);
            };
            let space_id = space.space_id.clone();
            let entity = self
                .state
                .entities
                .get_mut(entity_id)
                .expect("entity presence checked above");
            entity.space_id = space_id.clone();
            entity.position_x = x;
            entity.position_y = y;
            entity.move_input_x = 0.0;
            entity.move_input_y = 0.0;
            entity.target_position = None;
            (true, "resolved", Some(space_id), Some(spawn))
        })();

        let mut params = JsonMap::new();
        params.insert("tick".into(), Value::from(tick.as_u64()));
        params.insert(
            "entity_id".into(),
            entity_id.map(Value::String).unwrap_or(Value::Null),
        );
        params.insert(
            "site_id".into(),
            site_id.map(Value::String).unwrap_or(Value::Null),
        );
        params.insert(
            "to_space_id".into(),
            to_space_id.map(Value::String).unwrap_or(Value::Null),
        );
        params.insert(
            "spawn_coord".into(),
            spawn_coord.map(|c| c.to_value()).unwrap_or(Value::Null),
        );
        params.insert("applied".into(), Value::Bool(applied));
        params.insert("reason".into(), Value::String(reason.to_string()));
        self.schedule_event_at(tick, events::SITE_ENTERED, params);
        Ok(())
    }

    // ========================================================================
    // Inventory (built-in)
    // ========================================================================

    /// Execute an inventory intent synchronously. The outcome lands in the
    /// event trace immediately so callers (supply consumption) can observe
    /// it within the same hook.
    pub fn execute_inventory_intent(&mut self, command: &SimCommand, command_index: usize) {
        let tick = command.tick;
        let params = &command.params;
        let action_uid = json::get_str(params, "action_uid")
            .map(str::to_string)
            .unwrap_or_else(|| command.action_uid(command_index));
        let item_id = json::get_str(params, "item_id").map(str::to_string);
        let quantity = json::get_u64(params, "quantity").unwrap_or(0);
        let reason = json::get_str(params, "reason").unwrap_or("").to_string();
        let src_container_id = json::get_str(params, "src_container_id").map(str::to_string);
        let mut dst_container_id = json::get_str(params, "dst_container_id").map(str::to_string);

        let mut ledger_state = self.get_rules_state(INVENTORY_LEDGER_MODULE);
        let mut applied_uids = json::uid_ledger(
            &ledger_state,
            "applied_action_uids",
            MAX_EXECUTED_ACTION_UIDS,
        );

        let outcome: &str = if applied_uids.iter().any(|uid| uid == &action_uid) {
            "already_applied"
        } else if item_id.is_none() || quantity == 0 {
            "invalid_params"
        } else if src_container_id.is_none() && dst_container_id.is_none() && reason != "drop" {
            "invalid_params"
        } else {
            let item_id = item_id.as_deref().expect("checked above");
            if !self.known_item_ids.contains(item_id) {
                "unknown_item"
            } else {
                // A drop with no destination materializes a world container
                // at the acting entity's cell.
                if reason == "drop" && dst_container_id.is_none() {
                    dst_container_id = self.world_drop_container_id(command.entity_id.as_deref());
                    match dst_container_id.clone() {
                        Some(dst_id) => {
                            self.ensure_world_drop_container(&dst_id, command.entity_id.as_deref());
                        }
                        None => {
                            self.store_inventory_ledger(&mut ledger_state, &applied_uids);
                            self.append_inventory_outcome(tick, command, &action_uid, "invalid_params");
                            return;
                        }
                    }
                }

                let src_exists = src_container_id
                    .as_deref()
                    .map(|id| self.state.world.containers.contains_key(id))
                    .unwrap_or(true);
                let dst_exists = dst_container_id
                    .as_deref()
                    .map(|id| self.state.world.containers.contains_key(id))
                    .unwrap_or(true);

                if !src_exists || !dst_exists {
                    "unknown_container"
                } else {
                    match (&src_container_id, &dst_container_id) {
                        (Some(src), Some(dst)) => {
                            let removed = self
                                .state
                                .world
                                .containers
                                .get_mut(src)
                                .expect("existence checked")
                                .remove(item_id, quantity);
                            if removed {
                                self.state
                                    .world
                                    .containers
                                    .get_mut(dst)
                                    .expect("existence checked")
                                    .add(item_id, quantity);
                                "applied"
                            } else {
                                "insufficient_quantity"
                            }
                        }
                        (Some(src), None) => {
                            let removed = self
                                .state
                                .world
                                .containers
                                .get_mut(src)
                                .expect("existence checked")
                                .remove(item_id, quantity);
                            if removed {
                                "applied"
                            } else {
                                "insufficient_quantity"
                            }
                        }
                        (None, Some(dst)) => {
                            self.state
                                .world
                                .containers
                                .get_mut(dst)
                                .expect("existence checked")
                                .add(item_id, quantity);
                            "applied"
                        }
                        (None, None) => "invalid_params",
                    }
                }
            }
        };

        if outcome == "applied" {
            json::push_uid_fifo(&mut applied_uids, &action_uid, MAX_EXECUTED_ACTION_UIDS);
        }
        self.store_inventory_ledger(&mut ledger_state, &applied_uids);

        // Echo the resolved destination (drops materialize one).
        let mut command = command.clone();
        if let Some(dst) = &dst_container_id {
            command
                .params
                .insert("dst_container_id".into(), Value::String(dst.clone()));
        }
        self.append_inventory_outcome(tick, &command, &action_uid, outcome);
    }

    fn store_inventory_ledger(&mut self, ledger_state: &mut JsonMap, applied_uids: &[String]) {
        json::set_uid_ledger(ledger_state, "applied_action_uids", applied_uids);
        self.set_rules_state(INVENTORY_LEDGER_MODULE, ledger_state.clone());
    }

    fn world_drop_container_id(&self, entity_id: Option<&str>) -> Option<String> {
        let entity_id = entity_id?;
        let entity = self.state.entities.get(entity_id)?;
        let cell = self.entity_cell(entity_id)?;
        let (a, b) = match cell {
            CellCoord::Hex { q, r } => (q, r),
            CellCoord::Square { x, y } => (x, y),
        };
        Some(format!("world_drop:{}:{}:{}", entity.space_id, a, b))
    }

    fn ensure_world_drop_container(&mut self, container_id: &str, entity_id: Option<&str>) {
        if self.state.world.containers.contains_key(container_id) {
            return;
        }
        let location = entity_id
            .and_then(|id| self.entity_location_ref(id))
            .map(|location| location.to_value());
        let mut container = ContainerState::new(container_id);
        container.location = location;
        self.state
            .world
            .containers
            .insert(container_id.to_string(), container);
    }

    fn append_inventory_outcome(
        &mut self,
        tick: Tick,
        command: &SimCommand,
        action_uid: &str,
        outcome: &str,
    ) {
        let mut params = JsonMap::new();
        params.insert("tick".into(), Value::from(tick.as_u64()));
        params.insert(
            "entity_id".into(),
            command
                .entity_id
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
        );
        for key in [
            "src_container_id",
            "dst_container_id",
            "item_id",
            "quantity",
            "reason",
        ] {
            params.insert(
                key.to_string(),
                command.params.get(key).cloned().unwrap_or(Value::Null),
            );
        }
        params.insert("action_uid".into(), Value::String(action_uid.to_string()));
        params.insert("outcome".into(), Value::String(outcome.to_string()));
        self.append_trace_entry(TraceEntry {
            tick,
            event_id: Self::trace_event_id_for(&format!("inventory:{action_uid}:{outcome}")),
            event_type: events::INVENTORY_OUTCOME.to_string(),
            params,
            module_hooks_called: true,
        });
    }

    // ========================================================================
    // Stats
    // ========================================================================

    /// Apply a `{op, key, value?}` patch to a stats bag. Values must be JSON
    /// primitives.
    pub fn apply_stat_patch(stats: &JsonMap, patch: &JsonMap) -> SimResult<JsonMap> {
        let op = json::get_str(patch, "op").unwrap_or("");
        let key = json::get_str(patch, "key")
            .ok_or_else(|| EngineError::InvalidOperation("stat key must be non-empty".into()))?;
        let mut next = stats.clone();
        match op {
            "set" => {
                let value = patch.get("value").cloned().ok_or_else(|| {
                    EngineError::InvalidOperation("stat set requires a value".into())
                })?;
                if value.is_array() || value.is_object() {
                    return Err(EngineError::InvalidOperation(
                        "stat values must be JSON primitives".into(),
                    ));
                }
                next.insert(key.to_string(), value);
            }
            "remove" => {
                next.remove(key);
            }
            other => {
                return Err(EngineError::InvalidOperation(format!(
                    "unsupported stat op: {other}"
                )))
            }
        }
        Ok(next)
    }

    // ========================================================================
    // Serialization
    // ========================================================================

    /// Canonical simulation payload (everything but the world and the input
    /// log, which the save file carries separately).
    pub fn simulation_payload(&self) -> Value {
        let mut payload = JsonMap::new();
        payload.insert("master_seed".into(), Value::from(self.master_seed().as_u64()));
        payload.insert("seed".into(), Value::from(self.master_seed().as_u64()));
        payload.insert("rng_state".into(), self.rng.to_payload());
        payload.insert("tick".into(), Value::from(self.state.tick.as_u64()));
        payload.insert(
            "time".into(),
            serde_json::to_value(self.state.time).expect("time serializes"),
        );
        payload.insert(
            "entities".into(),
            Value::Array(self.state.entities.values().map(EntityState::to_value).collect()),
        );
        let rules_state: JsonMap = self
            .state
            .rules_state
            .iter()
            .map(|(name, state)| (name.clone(), Value::Object(state.clone())))
            .collect();
        payload.insert("rules_state".into(), Value::Object(rules_state));
        payload.insert("next_event_counter".into(), Value::from(self.next_event_counter));
        payload.insert(
            "pending_events".into(),
            Value::Array(
                self.pending_events
                    .values()
                    .map(|event| serde_json::to_value(event).expect("event serializes"))
                    .collect(),
            ),
        );
        payload.insert(
            "event_trace".into(),
            Value::Array(
                self.event_trace
                    .iter()
                    .map(|entry| serde_json::to_value(entry).expect("trace entry serializes"))
                    .collect(),
            ),
        );
        payload.insert(
            "selected_entity_id".into(),
            self.state
                .selected_entity_id
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
        );
        payload.insert(
            "combat_log".into(),
            Value::Array(self.state.combat_log.iter().cloned().map(Value::Object).collect()),
        );
        Value::Object(payload)
    }

    /// Input log as a canonical JSON array.
    pub fn input_log_payload(&self) -> Value {
        Value::Array(
            self.input_log
                .iter()
                .map(|command| serde_json::to_value(command).expect("command serializes"))
                .collect(),
        )
    }

    /// Rebuild a simulation from its payload parts. Every RNG stream, pending
    /// event, and ledger restores bit-exactly.
    pub fn from_payload(
        world: WorldState,
        simulation_state: &Value,
        input_log: &Value,
    ) -> SimResult<Simulation> {
        let root = simulation_state.as_object().ok_or_else(|| {
            EngineError::InvalidPayload("simulation_state must be an object".into())
        })?;

        let master_seed = root
            .get("master_seed")
            .or_else(|| root.get("seed"))
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                EngineError::InvalidPayload("simulation_state.master_seed must be an integer".into())
            })?;

        let mut sim = Simulation::new(world, MasterSeed(master_seed));

        if let Some(rng_payload) = root.get("rng_state") {
            sim.rng = RngStreams::from_payload(rng_payload)?;
            if sim.rng.master_seed().as_u64() != master_seed {
                return Err(EngineError::InvalidPayload(
                    "rng_state.master_seed disagrees with simulation_state".into(),
                ));
            }
        }

        sim.state.tick = Tick(root.get("tick").and_then(Value::as_u64).unwrap_or(0));
        sim.state.time = match root.get("time") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|err| EngineError::InvalidPayload(format!("time: {err}")))?,
            None => TimeState::default(),
        };

        if let Some(rows) = root.get("entities").and_then(Value::as_array) {
            for row in rows {
                let entity = EntityState::from_value(row)?;
                if let Some(container_id) = &entity.inventory_container_id {
                    if !sim.state.world.containers.contains_key(container_id) {
                        return Err(EngineError::InvalidPayload(format!(
                            "entity '{}' references missing inventory container '{container_id}'",
                            entity.entity_id
                        )));
                    }
                }
                sim.state.entities.insert(entity.entity_id.clone(), entity);
            }
        }

        if let Some(rows) = root.get("rules_state").and_then(Value::as_object) {
            for (module_name, state) in rows {
                let state = state.as_object().ok_or_else(|| {
                    EngineError::InvalidRulesState {
                        module: module_name.clone(),
                        detail: "partition must be an object".into(),
                    }
                })?;
                sim.state
                    .rules_state
                    .insert(module_name.clone(), state.clone());
            }
        }

        sim.next_event_counter = root
            .get("next_event_counter")
            .and_then(Value::as_u64)
            .unwrap_or(1);

        if let Some(rows) = root.get("pending_events").and_then(Value::as_array) {
            for row in rows {
                let event: SimEvent = serde_json::from_value(row.clone())
                    .map_err(|err| EngineError::InvalidPayload(format!("pending event: {err}")))?;
                let key = (event.tick.as_u64(), event.event_id_number());
                sim.pending_events.insert(key, event);
            }
        }

        if let Some(rows) = root.get("event_trace").and_then(Value::as_array) {
            for row in rows {
                let entry: TraceEntry = serde_json::from_value(row.clone())
                    .map_err(|err| EngineError::InvalidPayload(format!("trace entry: {err}")))?;
                sim.event_trace.push(entry);
            }
        }

        sim.state.selected_entity_id = root
            .get("selected_entity_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        if let Some(rows) = root.get("combat_log").and_then(Value::as_array) {
            for row in rows {
                sim.state.combat_log.push(
                    row.as_object()
                        .ok_or_else(|| {
                            EngineError::InvalidPayload("combat_log entry must be an object".into())
                        })?
                        .clone(),
                );
            }
        }

        let input_rows = input_log
            .as_array()
            .ok_or_else(|| EngineError::InvalidPayload("input_log must be a list".into()))?;
        for row in input_rows {
            let command: SimCommand = serde_json::from_value(row.clone())
                .map_err(|err| EngineError::InvalidPayload(format!("input_log entry: {err}")))?;
            sim.input_log.push(command);
        }

        Ok(sim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityState;
    use hx_types::HexCoord;
    use serde_json::json;

    fn params(value: Value) -> JsonMap {
        value.as_object().unwrap().clone()
    }

    fn disk_sim(seed: u64) -> Simulation {
        let mut topology = JsonMap::new();
        topology.insert("radius".into(), Value::from(4));
        let world =
            WorldState::create_with_topology(MasterSeed(seed), "hex_disk", &topology).unwrap();
        let mut sim = Simulation::new(world, MasterSeed(seed));
        sim.set_known_item_ids(
            ["torch", "rations", "scrap_iron"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        );
        sim
    }

    #[test]
    fn event_queue_orders_by_tick_then_id() {
        let mut sim = disk_sim(55);
        let first = sim.schedule_event_at(Tick(3), events::DEBUG_MARKER, params(json!({"order": 1})));
        let second = sim.schedule_event_at(Tick(3), events::DEBUG_MARKER, params(json!({"order": 2})));
        let third = sim.schedule_event_at(Tick(3), events::DEBUG_MARKER, params(json!({"order": 3})));
        sim.advance_ticks(4).unwrap();

        let executed: Vec<String> = sim
            .event_execution_trace()
            .iter()
            .map(|id| format_event_id(*id))
            .collect();
        assert_eq!(executed, vec![first, second, third]);
    }

    #[test]
    fn same_tick_events_scheduled_during_drain_execute_same_tick() {
        struct SameTickScheduler;
        impl RuleModule for SameTickScheduler {
            fn name(&self) -> &'static str {
                "same_tick_scheduler"
            }
            fn on_event_executed(
                &mut self,
                sim: &mut Simulation,
                event: &SimEvent,
            ) -> SimResult<()> {
                if event.event_type == "first" {
                    sim.schedule_event_at(sim.state.tick, "second", JsonMap::new());
                }
                Ok(())
            }
        }

        let mut sim = disk_sim(101);
        sim.register_rule_module(Box::new(SameTickScheduler)).unwrap();
        sim.schedule_event_at(Tick(0), "first", JsonMap::new());
        sim.advance_ticks(1).unwrap();

        let types: Vec<&str> = sim
            .get_event_trace()
            .iter()
            .map(|entry| entry.event_type.as_str())
            .collect();
        assert_eq!(types, vec!["first", "second"]);
    }

    #[test]
    fn event_cap_guard_fails_deterministically() {
        struct InfiniteScheduler;
        impl RuleModule for InfiniteScheduler {
            fn name(&self) -> &'static str {
                "infinite_same_tick_scheduler"
            }
            fn on_event_executed(
                &mut self,
                sim: &mut Simulation,
                _event: &SimEvent,
            ) -> SimResult<()> {
                sim.schedule_event_at(sim.state.tick, "loop", JsonMap::new());
                Ok(())
            }
        }

        let mut sim = disk_sim(202);
        sim.register_rule_module(Box::new(InfiniteScheduler)).unwrap();
        sim.schedule_event_at(Tick(0), "loop", JsonMap::new());
        let err = sim.advance_ticks(1).unwrap_err();
        assert!(err.to_string().contains("MAX_EVENTS_PER_TICK"));
    }

    #[test]
    fn event_trace_is_fifo_bounded() {
        let mut sim = disk_sim(12);
        for tick in 0..(MAX_EVENT_TRACE as u64 + 44) {
            sim.schedule_event_at(Tick(tick), events::NOOP, params(json!({"index": tick})));
        }
        sim.advance_ticks(MAX_EVENT_TRACE as u64 + 44).unwrap();

        let trace = sim.get_event_trace();
        assert_eq!(trace.len(), MAX_EVENT_TRACE);
        // Event ids start at 1; the first 44 executed entries were evicted.
        assert_eq!(trace[0].event_id, 45);
        assert_eq!(trace.last().unwrap().event_id, MAX_EVENT_TRACE as u64 + 44);
    }

    #[test]
    fn duplicate_module_names_rejected() {
        struct Named;
        impl RuleModule for Named {
            fn name(&self) -> &'static str {
                "named"
            }
        }
        let mut sim = disk_sim(1);
        sim.register_rule_module(Box::new(Named)).unwrap();
        let err = sim.register_rule_module(Box::new(Named)).unwrap_err();
        assert_eq!(err, EngineError::DuplicateModule("named".into()));
    }

    #[test]
    fn periodic_task_fires_on_cadence() {
        let mut sim = disk_sim(9);
        sim.register_periodic_task("heartbeat", 4, Tick(2)).unwrap();
        sim.advance_ticks(11).unwrap();

        let fired: Vec<u64> = sim
            .get_event_trace()
            .iter()
            .filter(|entry| entry.event_type == events::PERIODIC_TICK)
            .map(|entry| entry.tick.as_u64())
            .collect();
        assert_eq!(fired, vec![2, 6, 10]);
    }

    #[test]
    fn periodic_duplicate_registration_is_idempotent_but_conflicts_reject() {
        let mut sim = disk_sim(9);
        sim.register_periodic_task("task", 4, Tick(0)).unwrap();
        sim.register_periodic_task("task", 4, Tick(0)).unwrap();
        assert!(sim.register_periodic_task("task", 5, Tick(0)).is_err());
    }

    #[test]
    fn periodic_callback_receives_fire_tick() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut sim = disk_sim(31);
        let seen: Rc<RefCell<Vec<u64>>> = Rc::default();
        let sink = Rc::clone(&seen);
        sim.register_periodic_task("probe", 3, Tick(1)).unwrap();
        sim.set_task_callback(
            "probe",
            Box::new(move |_sim, tick| sink.borrow_mut().push(tick.as_u64())),
        )
        .unwrap();
        sim.advance_ticks(8).unwrap();
        assert_eq!(*seen.borrow(), vec![1, 4, 7]);
    }

    #[test]
    fn movement_reaches_target_and_emits_travel_steps() {
        let mut sim = disk_sim(77);
        sim.add_entity(EntityState::from_hex("runner", HexCoord::new(0, 0)));
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
        let (tx, ty) = axial_to_world_xy(HexCoord::new(1, -1));
        sim.append_command(SimCommand::new(
            Tick(8),
            Some("runner"),
            commands::SET_TARGET_POSITION,
            params(json!({"x": tx, "y": ty})),
        ));
        sim.advance_ticks(40).unwrap();

        let runner = sim.entity("runner").unwrap();
        assert_eq!(runner.hex_coord(), HexCoord::new(1, -1));
        assert!(runner.target_position.is_none());

        let travel_steps = sim
            .get_event_trace()
            .iter()
            .filter(|entry| entry.event_type == events::TRAVEL_STEP)
            .count();
        assert!(travel_steps >= 1);
    }

    #[test]
    fn inventory_conservation_and_idempotence() {
        let mut sim = disk_sim(11);
        sim.add_entity(EntityState::from_hex("runner", HexCoord::new(0, 0)));
        let inv_id = sim.entity("runner").unwrap().inventory_container_id.clone().unwrap();
        sim.state
            .world
            .containers
            .get_mut(&inv_id)
            .unwrap()
            .add("torch", 5);

        sim.append_command(SimCommand::new(
            Tick(0),
            Some("runner"),
            commands::INVENTORY_INTENT,
            params(json!({
                "src_container_id": inv_id,
                "dst_container_id": null,
                "item_id": "torch",
                "quantity": 2,
                "reason": "consume",
                "action_uid": "consume-1",
            })),
        ));
        sim.append_command(SimCommand::new(
            Tick(0),
            Some("runner"),
            commands::INVENTORY_INTENT,
            params(json!({
                "src_container_id": inv_id,
                "dst_container_id": null,
                "item_id": "torch",
                "quantity": 2,
                "reason": "consume",
                "action_uid": "consume-1",
            })),
        ));
        sim.advance_ticks(1).unwrap();

        assert_eq!(
            sim.state.world.containers[&inv_id].quantity("torch"),
            3,
            "duplicate action_uid must not double-apply"
        );
        let outcomes: Vec<&str> = sim
            .get_event_trace()
            .iter()
            .filter(|entry| entry.event_type == events::INVENTORY_OUTCOME)
            .map(|entry| entry.params.get("outcome").unwrap().as_str().unwrap())
            .collect();
        assert_eq!(outcomes, vec!["applied", "already_applied"]);
    }

    #[test]
    fn inventory_drop_materializes_world_container() {
        let mut sim = disk_sim(13);
        sim.add_entity(EntityState::from_hex("runner", HexCoord::new(0, 0)));
        let inv_id = sim.entity("runner").unwrap().inventory_container_id.clone().unwrap();
        sim.state
            .world
            .containers
            .get_mut(&inv_id)
            .unwrap()
            .add("rations", 5);

        sim.append_command(SimCommand::new(
            Tick(0),
            Some("runner"),
            commands::INVENTORY_INTENT,
            params(json!({
                "src_container_id": inv_id,
                "dst_container_id": null,
                "item_id": "rations",
                "quantity": 2,
                "reason": "drop",
            })),
        ));
        sim.append_command(SimCommand::new(
            Tick(1),
            Some("runner"),
            commands::INVENTORY_INTENT,
            params(json!({
                "src_container_id": "world_drop:overworld:0:0",
                "dst_container_id": inv_id,
                "item_id": "rations",
                "quantity": 2,
                "reason": "pickup",
            })),
        ));
        sim.advance_ticks(2).unwrap();

        assert!(sim.state.world.containers.contains_key("world_drop:overworld:0:0"));
        assert!(sim.state.world.containers["world_drop:overworld:0:0"]
            .items
            .is_empty());
        assert_eq!(sim.state.world.containers[&inv_id].quantity("rations"), 5);
    }

    #[test]
    fn inventory_rejections_are_ordered_and_mutation_free() {
        let mut sim = disk_sim(17);
        sim.add_entity(EntityState::from_hex("runner", HexCoord::new(0, 0)));
        let inv_id = sim.entity("runner").unwrap().inventory_container_id.clone().unwrap();

        sim.append_command(SimCommand::new(
            Tick(0),
            Some("runner"),
            commands::INVENTORY_INTENT,
            params(json!({
                "src_container_id": null,
                "dst_container_id": inv_id,
                "item_id": "does_not_exist",
                "quantity": 1,
                "reason": "spawn",
            })),
        ));
        sim.append_command(SimCommand::new(
            Tick(1),
            Some("runner"),
            commands::INVENTORY_INTENT,
            params(json!({
                "src_container_id": "missing_container",
                "dst_container_id": inv_id,
                "item_id": "torch",
                "quantity": 1,
                "reason": "transfer",
            })),
        ));
        sim.advance_ticks(2).unwrap();

        let outcomes: Vec<&str> = sim
            .get_event_trace()
            .iter()
            .filter(|entry| entry.event_type == events::INVENTORY_OUTCOME)
            .map(|entry| entry.params.get("outcome").unwrap().as_str().unwrap())
            .collect();
        assert_eq!(outcomes, vec!["unknown_item", "unknown_container"]);
        assert!(sim.state.world.containers[&inv_id].items.is_empty());
    }

    #[test]
    fn simulation_payload_round_trip_preserves_queues() {
        let mut sim = disk_sim(991);
        sim.add_entity(EntityState::from_hex("runner", HexCoord::new(0, 0)));
        sim.schedule_event_at(Tick(2), events::NOOP, params(json!({"label": "first"})));
        sim.schedule_event_at(Tick(4), events::DEBUG_MARKER, params(json!({"label": "later"})));
        sim.append_command(SimCommand::new(Tick(1), None, commands::NOOP_INPUT, JsonMap::new()));
        sim.advance_ticks(3).unwrap();

        let world_payload = sim.state.world.to_value();
        let sim_payload = sim.simulation_payload();
        let log_payload = sim.input_log_payload();

        let world = WorldState::from_value(&world_payload).unwrap();
        let mut restored = Simulation::from_payload(world, &sim_payload, &log_payload).unwrap();

        assert_eq!(restored.simulation_payload(), sim_payload);

        restored.advance_ticks(3).unwrap();
        sim.advance_ticks(3).unwrap();
        assert_eq!(restored.simulation_payload(), sim.simulation_payload());
    }

    #[test]
    fn load_rejects_missing_inventory_container() {
        let mut sim = disk_sim(5);
        sim.add_entity(EntityState::from_hex("runner", HexCoord::new(0, 0)));
        let sim_payload = sim.simulation_payload();
        let log_payload = sim.input_log_payload();

        // A world without the runner's container.
        let mut topology = JsonMap::new();
        topology.insert("radius".into(), Value::from(4));
        let bare_world =
            WorldState::create_with_topology(MasterSeed(5), "hex_disk", &topology).unwrap();

        let err = Simulation::from_payload(bare_world, &sim_payload, &log_payload).unwrap_err();
        assert!(err.to_string().contains("references missing inventory container"));
    }

    #[test]
    fn transition_space_command_moves_entity() {
        let mut sim = disk_sim(8);
        let mut square_params = JsonMap::new();
        square_params.insert("width".into(), Value::from(6));
        square_params.insert("height".into(), Value::from(6));
        let space = SpaceState::new(
            "cellar",
            SQUARE_GRID_TOPOLOGY,
            crate::world::LOCAL_SPACE_ROLE,
            square_params,
        )
        .unwrap();
        sim.state.world.spaces.insert("cellar".into(), space);
        sim.add_entity(EntityState::from_hex("runner", HexCoord::new(0, 0)));

        sim.append_command(SimCommand::new(
            Tick(0),
            Some("runner"),
            commands::TRANSITION_SPACE,
            params(json!({
                "to_location": {"space_id": "cellar", "topology_type": "square_grid", "coord": {"x": 2, "y": 3}},
            })),
        ));
        sim.advance_ticks(1).unwrap();

        let runner = sim.entity("runner").unwrap();
        assert_eq!(runner.space_id, "cellar");
        assert_eq!(sim.entity_cell("runner"), Some(CellCoord::square(2, 3)));

        let transition = sim
            .get_event_trace()
            .iter()
            .find(|entry| entry.event_type == events::SPACE_TRANSITION)
            .unwrap();
        assert_eq!(transition.params.get("applied"), Some(&Value::Bool(true)));
    }

    #[test]
    fn selection_commands_set_and_clear() {
        let mut sim = disk_sim(2);
        sim.add_entity(EntityState::from_hex("runner", HexCoord::new(0, 0)));
        sim.add_entity(EntityState::from_hex("mule", HexCoord::new(0, 1)));

        sim.append_command(SimCommand::new(
            Tick(0),
            None,
            commands::SET_SELECTED_ENTITY,
            params(json!({"selected_entity_id": "mule"})),
        ));
        sim.append_command(SimCommand::new(
            Tick(0),
            Some("runner"),
            commands::SET_SELECTED_ENTITY,
            params(json!({"selected_entity_id": "mule"})),
        ));
        sim.advance_ticks(1).unwrap();
        assert_eq!(sim.state.selected_entity_id.as_deref(), Some("mule"));
        assert_eq!(
            sim.entity("runner").unwrap().selected_entity_id.as_deref(),
            Some("mule")
        );

        sim.append_command(SimCommand::new(
            Tick(1),
            None,
            commands::CLEAR_SELECTED_ENTITY,
            JsonMap::new(),
        ));
        sim.advance_ticks(1).unwrap();
        assert_eq!(sim.state.selected_entity_id, None);
    }
}

//! # Signal propagation
//!
//! Occlusion-aware emission and perception of transient phenomena. Path cost
//! between cells is uniform-cost search over the topology's neighbor graph
//! where every step costs `1 + structure_occlusion(edge)`; strength is the
//! base intensity minus the effective path cost plus a sensitivity bonus.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use hx_api::{SimCommand, SimEvent, SimResult};
use hx_types::{json, CellCoord, JsonMap, LocationRef, Tick, HEX_DIRECTIONS};

use crate::rules::RuleModule;
use crate::sim::Simulation;
use crate::world::WorldState;
use crate::MAX_EXECUTED_ACTION_UIDS;

pub const EMIT_EXECUTE_EVENT: &str = "signal_emit_execute";
pub const PERCEIVE_EXECUTE_EVENT: &str = "perceive_signal_execute";
pub const EMIT_OUTCOME_EVENT: &str = "signal_emit_outcome";
pub const PERCEIVE_OUTCOME_EVENT: &str = "signal_perception_outcome";

const MAX_SENSITIVITY: i64 = 100;
const SENSITIVITY_BONUS_DIVISOR: i64 = 10;
const EMISSION_LEDGER: &str = "signal_emission";
const PERCEPTION_LEDGER: &str = "signal_perception";

/// A propagating signal as stored in `world.signals`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub signal_id: String,
    pub tick_emitted: u64,
    pub space_id: String,
    pub origin: LocationRef,
    pub channel: String,
    pub base_intensity: i64,
    pub falloff_model: String,
    pub max_radius: i64,
    pub ttl_ticks: u64,
    #[serde(default)]
    pub metadata: JsonMap,
}

/// Path metrics from a signal origin to a listener cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathMetrics {
    pub occlusion_cost: i64,
    pub step_count: i64,
    pub effective_path_cost: i64,
}

fn neighbor_cells(coord: CellCoord) -> Vec<CellCoord> {
    match coord {
        CellCoord::Hex { q, r } => HEX_DIRECTIONS
            .iter()
            .map(|(dq, dr)| CellCoord::hex(q + dq, r + dr))
            .collect(),
        CellCoord::Square { x, y } => vec![
            CellCoord::square(x + 1, y),
            CellCoord::square(x - 1, y),
            CellCoord::square(x, y + 1),
            CellCoord::square(x, y - 1),
        ],
    }
}

/// Uniform-cost search bounded by `max_steps`; edge weight is
/// `1 + occlusion`. `None` when the listener is unreachable within bounds.
pub fn compute_signal_path_metrics(
    signal: &SignalRecord,
    listener: &LocationRef,
    world: &WorldState,
    max_steps: i64,
) -> Option<PathMetrics> {
    if max_steps < 0 {
        return None;
    }
    if signal.origin.space_id != listener.space_id
        || signal.origin.topology_type != listener.topology_type
    {
        return None;
    }
    let origin = signal.origin.coord;
    let target = listener.coord;
    if !origin.same_topology(&target) {
        return None;
    }

    let mut queue: BinaryHeap<Reverse<(i64, i64, CellCoord)>> = BinaryHeap::new();
    let mut best: BTreeMap<CellCoord, i64> = BTreeMap::new();
    queue.push(Reverse((0, 0, origin)));
    best.insert(origin, 0);

    while let Some(Reverse((total_cost, step_count, current))) = queue.pop() {
        if best.get(&current) != Some(&total_cost) {
            continue;
        }
        if current == target {
            return Some(PathMetrics {
                occlusion_cost: total_cost - step_count,
                step_count,
                effective_path_cost: total_cost,
            });
        }
        if step_count >= max_steps {
            continue;
        }
        for neighbor in neighbor_cells(current) {
            let next_steps = step_count + 1;
            if next_steps > max_steps {
                continue;
            }
            let occlusion =
                world.get_structure_occlusion_value(&signal.space_id, current, neighbor) as i64;
            let next_total = total_cost + 1 + occlusion;
            match best.get(&neighbor) {
                Some(best_total) if *best_total <= next_total => continue,
                _ => {}
            }
            best.insert(neighbor, next_total);
            queue.push(Reverse((next_total, next_steps, neighbor)));
        }
    }
    None
}

/// Linear-falloff strength at a listener; 0 when expired or unreachable.
pub fn compute_signal_strength(
    signal: &SignalRecord,
    listener: &LocationRef,
    current_tick: Tick,
    world: &WorldState,
) -> i64 {
    if current_tick.as_u64() > signal.tick_emitted + signal.ttl_ticks {
        return 0;
    }
    if signal.falloff_model != "linear" {
        return 0;
    }
    match compute_signal_path_metrics(signal, listener, world, signal.max_radius) {
        Some(metrics) => (signal.base_intensity - metrics.effective_path_cost).max(0),
        None => 0,
    }
}

/// Rule module handling emit/perceive intents and their execute events.
#[derive(Default)]
pub struct SignalPropagationModule;

impl SignalPropagationModule {
    pub const NAME: &'static str = "signal_propagation";
    const ALLOWED_CHANNELS: [&'static str; 1] = ["sound"];

    pub fn new() -> Self {
        SignalPropagationModule
    }

    fn channel_allowed(channel: Option<&str>) -> bool {
        matches!(channel, Some(c) if Self::ALLOWED_CHANNELS.contains(&c))
    }

    fn ledger(sim: &Simulation, key: &str) -> Vec<String> {
        let root = sim.get_rules_state(Self::NAME);
        match root.get(key).and_then(Value::as_object) {
            Some(bucket) => json::uid_ledger(bucket, "executed_action_uids", MAX_EXECUTED_ACTION_UIDS),
            None => Vec::new(),
        }
    }

    fn mark_executed(sim: &mut Simulation, key: &str, action_uid: &str) {
        if action_uid.is_empty() {
            return;
        }
        let mut root = sim.get_rules_state(Self::NAME);
        let mut bucket = root
            .get(key)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let mut ledger =
            json::uid_ledger(&bucket, "executed_action_uids", MAX_EXECUTED_ACTION_UIDS);
        json::push_uid_fifo(&mut ledger, action_uid, MAX_EXECUTED_ACTION_UIDS);
        json::set_uid_ledger(&mut bucket, "executed_action_uids", &ledger);
        root.insert(key.to_string(), Value::Object(bucket));
        sim.set_rules_state(Self::NAME, root);
    }

    fn resolve_sensitivity(sim: &Simulation, entity_id: &str, channel: &str) -> (i64, String, i64) {
        let stats = sim
            .entity(entity_id)
            .map(|entity| entity.stats.clone())
            .unwrap_or_default();

        let (source, raw) = if channel == "sound" && stats.contains_key("hearing") {
            ("hearing", stats.get("hearing"))
        } else if stats.contains_key("perception") {
            ("perception", stats.get("perception"))
        } else {
            ("default", None)
        };

        let sensitivity = raw
            .and_then(|value| match value {
                Value::Bool(_) => None,
                Value::Number(n) => n.as_f64(),
                _ => None,
            })
            .map(|numeric| (numeric as i64).clamp(0, MAX_SENSITIVITY))
            .unwrap_or(0);
        let bonus = sensitivity / SENSITIVITY_BONUS_DIVISOR;
        (sensitivity, source.to_string(), bonus)
    }

    fn handle_emit_command(&self, sim: &mut Simulation, command: &SimCommand, command_index: usize) {
        let action_uid = command.action_uid(command_index);
        let params = &command.params;
        let channel = json::get_str(params, "channel");
        let numeric_fields = [
            json::get_u64(params, "base_intensity"),
            json::get_u64(params, "max_radius"),
            json::get_u64(params, "ttl_ticks"),
            json::get_u64(params, "duration_ticks"),
        ];

        if !Self::channel_allowed(channel) || numeric_fields.iter().any(Option::is_none) {
            self.schedule_emit_outcome(sim, command.tick, &action_uid, command, "invalid_params");
            return;
        }
        let entity_id = match command.entity_id.as_deref() {
            Some(id) if sim.entity(id).is_some() => id.to_string(),
            _ => {
                self.schedule_emit_outcome(sim, command.tick, &action_uid, command, "unknown_entity");
                return;
            }
        };
        let Some(origin) = sim.entity_location_ref(&entity_id) else {
            self.schedule_emit_outcome(sim, command.tick, &action_uid, command, "unknown_entity");
            return;
        };

        let duration_ticks = numeric_fields[3].expect("checked above");
        let mut execute_params = JsonMap::new();
        execute_params.insert("action_uid".into(), Value::String(action_uid));
        execute_params.insert("entity_id".into(), Value::String(entity_id));
        execute_params.insert(
            "channel".into(),
            Value::String(channel.expect("checked above").to_string()),
        );
        execute_params.insert("base_intensity".into(), Value::from(numeric_fields[0].unwrap()));
        execute_params.insert("max_radius".into(), Value::from(numeric_fields[1].unwrap()));
        execute_params.insert("ttl_ticks".into(), Value::from(numeric_fields[2].unwrap()));
        execute_params.insert("origin".into(), origin.to_value());
        execute_params.insert(
            "metadata".into(),
            params.get("metadata").cloned().unwrap_or(Value::Object(JsonMap::new())),
        );
        execute_params.insert("falloff_model".into(), Value::String("linear".into()));
        sim.schedule_event_at(command.tick + duration_ticks, EMIT_EXECUTE_EVENT, execute_params);
    }

    fn handle_perceive_command(
        &self,
        sim: &mut Simulation,
        command: &SimCommand,
        command_index: usize,
    ) {
        let action_uid = command.action_uid(command_index);
        let params = &command.params;
        let channel = json::get_str(params, "channel");
        let radius = json::get_u64(params, "radius");
        let duration_ticks = json::get_u64(params, "duration_ticks");

        if !Self::channel_allowed(channel) || radius.is_none() || duration_ticks.is_none() {
            self.schedule_perceive_outcome(
                sim,
                command.tick,
                &action_uid,
                command,
                "invalid_params",
                Vec::new(),
                0,
                "default",
                0,
            );
            return;
        }
        let entity_id = match command.entity_id.as_deref() {
            Some(id) if sim.entity(id).is_some() => id.to_string(),
            _ => {
                self.schedule_perceive_outcome(
                    sim,
                    command.tick,
                    &action_uid,
                    command,
                    "unknown_entity",
                    Vec::new(),
                    0,
                    "default",
                    0,
                );
                return;
            }
        };

        let mut execute_params = JsonMap::new();
        execute_params.insert("action_uid".into(), Value::String(action_uid));
        execute_params.insert("entity_id".into(), Value::String(entity_id));
        execute_params.insert(
            "channel".into(),
            Value::String(channel.expect("checked above").to_string()),
        );
        execute_params.insert("radius".into(), Value::from(radius.unwrap()));
        sim.schedule_event_at(
            command.tick + duration_ticks.unwrap(),
            PERCEIVE_EXECUTE_EVENT,
            execute_params,
        );
    }

    fn handle_emit_execute(&self, sim: &mut Simulation, event: &SimEvent) {
        let action_uid = json::get_str(&event.params, "action_uid")
            .unwrap_or("")
            .to_string();
        if Self::ledger(sim, EMISSION_LEDGER).iter().any(|uid| uid == &action_uid) {
            self.schedule_emit_outcome_raw(sim, event.tick, &action_uid, &event.params, "already_applied");
            return;
        }

        let channel = json::get_str(&event.params, "channel");
        let base_intensity = json::get_u64(&event.params, "base_intensity");
        let max_radius = json::get_u64(&event.params, "max_radius");
        let ttl_ticks = json::get_u64(&event.params, "ttl_ticks");
        let origin = event.params.get("origin").and_then(LocationRef::from_value);

        if action_uid.is_empty()
            || !Self::channel_allowed(channel)
            || base_intensity.is_none()
            || max_radius.is_none()
            || ttl_ticks.is_none()
            || origin.is_none()
        {
            Self::mark_executed(sim, EMISSION_LEDGER, &action_uid);
            self.schedule_emit_outcome_raw(sim, event.tick, &action_uid, &event.params, "invalid_params");
            return;
        }
        let entity_id = json::get_str(&event.params, "entity_id").map(str::to_string);
        if entity_id.as_deref().and_then(|id| sim.entity(id)).is_none() {
            Self::mark_executed(sim, EMISSION_LEDGER, &action_uid);
            self.schedule_emit_outcome_raw(sim, event.tick, &action_uid, &event.params, "unknown_entity");
            return;
        }

        let origin = origin.expect("checked above");
        let record = SignalRecord {
            signal_id: action_uid.clone(),
            tick_emitted: event.tick.as_u64(),
            space_id: origin.space_id.clone(),
            origin,
            channel: channel.expect("checked above").to_string(),
            base_intensity: base_intensity.unwrap() as i64,
            falloff_model: "linear".into(),
            max_radius: max_radius.unwrap() as i64,
            ttl_ticks: ttl_ticks.unwrap(),
            metadata: event
                .params
                .get("metadata")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        };
        let record_value = serde_json::to_value(&record).expect("signal record serializes");
        sim.state.world.append_signal_record(
            record_value
                .as_object()
                .expect("signal record is an object")
                .clone(),
        );
        Self::mark_executed(sim, EMISSION_LEDGER, &action_uid);
        self.schedule_emit_outcome_raw(sim, event.tick, &action_uid, &event.params, "applied");
    }

    fn handle_perceive_execute(&self, sim: &mut Simulation, event: &SimEvent) {
        let action_uid = json::get_str(&event.params, "action_uid")
            .unwrap_or("")
            .to_string();
        if Self::ledger(sim, PERCEPTION_LEDGER).iter().any(|uid| uid == &action_uid) {
            self.schedule_perceive_outcome_raw(
                sim,
                event.tick,
                &action_uid,
                &event.params,
                "already_applied",
                Vec::new(),
                0,
                "default",
                0,
            );
            return;
        }

        let channel = json::get_str(&event.params, "channel").map(str::to_string);
        let radius = json::get_u64(&event.params, "radius");
        let entity_id = json::get_str(&event.params, "entity_id").map(str::to_string);

        if action_uid.is_empty() || !Self::channel_allowed(channel.as_deref()) || radius.is_none() {
            Self::mark_executed(sim, PERCEPTION_LEDGER, &action_uid);
            self.schedule_perceive_outcome_raw(
                sim,
                event.tick,
                &action_uid,
                &event.params,
                "invalid_params",
                Vec::new(),
                0,
                "default",
                0,
            );
            return;
        }
        let Some(entity_id) = entity_id.filter(|id| sim.entity(id).is_some()) else {
            Self::mark_executed(sim, PERCEPTION_LEDGER, &action_uid);
            self.schedule_perceive_outcome_raw(
                sim,
                event.tick,
                &action_uid,
                &event.params,
                "unknown_entity",
                Vec::new(),
                0,
                "default",
                0,
            );
            return;
        };

        let channel = channel.expect("checked above");
        let radius = radius.unwrap() as i64;
        let listener = sim
            .entity_location_ref(&entity_id)
            .expect("entity presence checked above");
        let (sensitivity, sensitivity_source, bonus) =
            Self::resolve_sensitivity(sim, &entity_id, &channel);

        let records: Vec<SignalRecord> = sim
            .state
            .world
            .signals
            .iter()
            .filter_map(|raw| serde_json::from_value(Value::Object(raw.clone())).ok())
            .collect();

        let mut hits: Vec<JsonMap> = Vec::new();
        for signal in &records {
            if signal.channel != channel || signal.space_id != listener.space_id {
                continue;
            }
            let max_steps = signal.max_radius.min(radius);
            let Some(metrics) =
                compute_signal_path_metrics(signal, &listener, &sim.state.world, max_steps)
            else {
                continue;
            };
            if metrics.effective_path_cost > radius {
                continue;
            }
            let strength =
                compute_signal_strength(signal, &listener, event.tick, &sim.state.world) + bonus;
            if strength <= 0 {
                continue;
            }
            let mut hit = JsonMap::new();
            hit.insert("signal_id".into(), Value::String(signal.signal_id.clone()));
            hit.insert("distance".into(), Value::from(metrics.step_count));
            hit.insert("step_count".into(), Value::from(metrics.step_count));
            hit.insert("occlusion_cost".into(), Value::from(metrics.occlusion_cost));
            hit.insert(
                "effective_path_cost".into(),
                Value::from(metrics.effective_path_cost),
            );
            hit.insert("computed_strength".into(), Value::from(strength));
            hit.insert(
                "age_ticks".into(),
                Value::from(event.tick.as_u64().saturating_sub(signal.tick_emitted)),
            );
            hits.push(hit);
        }

        hits.sort_by_key(|hit| {
            (
                hit.get("effective_path_cost").and_then(Value::as_i64).unwrap_or(0),
                hit.get("step_count").and_then(Value::as_i64).unwrap_or(0),
                hit.get("signal_id")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
            )
        });

        Self::mark_executed(sim, PERCEPTION_LEDGER, &action_uid);
        self.schedule_perceive_outcome_raw(
            sim,
            event.tick,
            &action_uid,
            &event.params,
            "completed",
            hits,
            sensitivity,
            &sensitivity_source,
            bonus,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn schedule_perceive_outcome(
        &self,
        sim: &mut Simulation,
        tick: Tick,
        action_uid: &str,
        command: &SimCommand,
        outcome: &str,
        hits: Vec<JsonMap>,
        sensitivity: i64,
        sensitivity_source: &str,
        bonus: i64,
    ) {
        let mut raw = JsonMap::new();
        raw.insert(
            "entity_id".into(),
            command.entity_id.clone().map(Value::String).unwrap_or(Value::Null),
        );
        raw.insert(
            "channel".into(),
            command.params.get("channel").cloned().unwrap_or(Value::Null),
        );
        raw.insert(
            "radius".into(),
            command.params.get("radius").cloned().unwrap_or(Value::Null),
        );
        self.schedule_perceive_outcome_raw(
            sim,
            tick,
            action_uid,
            &raw,
            outcome,
            hits,
            sensitivity,
            sensitivity_source,
            bonus,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn schedule_perceive_outcome_raw(
        &self,
        sim: &mut Simulation,
        tick: Tick,
        action_uid: &str,
        source: &JsonMap,
        outcome: &str,
        hits: Vec<JsonMap>,
        sensitivity: i64,
        sensitivity_source: &str,
        bonus: i64,
    ) {
        let mut params = JsonMap::new();
        params.insert("tick".into(), Value::from(tick.as_u64()));
        params.insert(
            "entity_id".into(),
            source.get("entity_id").cloned().unwrap_or(Value::Null),
        );
        params.insert("action_uid".into(), Value::String(action_uid.to_string()));
        params.insert(
            "channel".into(),
            Value::String(
                source
                    .get("channel")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
            ),
        );
        params.insert(
            "radius".into(),
            Value::from(source.get("radius").and_then(Value::as_u64).unwrap_or(0)),
        );
        params.insert("outcome".into(), Value::String(outcome.to_string()));
        params.insert(
            "hits".into(),
            Value::Array(hits.into_iter().map(Value::Object).collect()),
        );
        params.insert("sensitivity".into(), Value::from(sensitivity));
        params.insert(
            "sensitivity_source".into(),
            Value::String(sensitivity_source.to_string()),
        );
        params.insert("bonus".into(), Value::from(bonus));
        sim.schedule_event_at(tick, PERCEIVE_OUTCOME_EVENT, params);
    }

    fn schedule_emit_outcome(
        &self,
        sim: &mut Simulation,
        tick: Tick,
        action_uid: &str,
        command: &SimCommand,
        outcome: &str,
    ) {
        let mut raw = JsonMap::new();
        raw.insert(
            "entity_id".into(),
            command.entity_id.clone().map(Value::String).unwrap_or(Value::Null),
        );
        raw.insert(
            "channel".into(),
            command.params.get("channel").cloned().unwrap_or(Value::Null),
        );
        self.schedule_emit_outcome_raw(sim, tick, action_uid, &raw, outcome);
    }

    fn schedule_emit_outcome_raw(
        &self,
        sim: &mut Simulation,
        tick: Tick,
        action_uid: &str,
        source: &JsonMap,
        outcome: &str,
    ) {
        let mut params = JsonMap::new();
        params.insert("tick".into(), Value::from(tick.as_u64()));
        params.insert(
            "entity_id".into(),
            source.get("entity_id").cloned().unwrap_or(Value::Null),
        );
        params.insert("action_uid".into(), Value::String(action_uid.to_string()));
        params.insert(
            "channel".into(),
            Value::String(
                source
                    .get("channel")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
            ),
        );
        params.insert("outcome".into(), Value::String(outcome.to_string()));
        sim.schedule_event_at(tick, EMIT_OUTCOME_EVENT, params);
    }
}

impl RuleModule for SignalPropagationModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_command(
        &mut self,
        sim: &mut Simulation,
        command: &SimCommand,
        command_index: usize,
    ) -> SimResult<bool> {
        match command.command_type.as_str() {
            hx_api::commands::EMIT_SIGNAL_INTENT => {
                self.handle_emit_command(sim, command, command_index);
                Ok(true)
            }
            hx_api::commands::PERCEIVE_SIGNAL_INTENT => {
                self.handle_perceive_command(sim, command, command_index);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn on_event_executed(&mut self, sim: &mut Simulation, event: &SimEvent) -> SimResult<()> {
        match event.event_type.as_str() {
            EMIT_EXECUTE_EVENT => self.handle_emit_execute(sim, event),
            PERCEIVE_EXECUTE_EVENT => self.handle_perceive_execute(sim, event),
            _ => {}
        }
        Ok(())
    }
}

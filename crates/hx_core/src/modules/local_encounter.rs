//! # Local-encounter instancing
//!
//! Campaign↔local space transitions with a bounded active set. A resolve
//! request originating on a campaign plane routes into a
//! `local_encounter_request`; the instance module lazily creates a tactical
//! square-grid space, applies an arena template, migrates the player (or the
//! first campaign-space entity) in, and later returns it to its recorded
//! origin when an end intent resolves.

use serde_json::Value;

use hx_api::commands::END_LOCAL_ENCOUNTER_INTENT;
use hx_api::{SimCommand, SimEvent, SimResult};
use hx_content::local_arenas::LocalArenaTemplateRegistry;
use hx_types::{json, CellCoord, JsonMap, LocationRef, SQUARE_GRID_TOPOLOGY};

use crate::modules::encounter::ENCOUNTER_RESOLVE_REQUEST_EVENT;
use crate::rules::RuleModule;
use crate::sim::Simulation;
use crate::world::{
    AnchorRecord, AnchorTarget, DoorRecord, InteractableRecord, SpaceState, CAMPAIGN_SPACE_ROLE,
    LOCAL_SPACE_ROLE,
};

pub const LOCAL_ENCOUNTER_REQUEST_EVENT: &str = "local_encounter_request";
pub const LOCAL_ENCOUNTER_BEGIN_EVENT: &str = "local_encounter_begin";
pub const LOCAL_ENCOUNTER_END_EVENT: &str = "local_encounter_end";
pub const LOCAL_ENCOUNTER_RETURN_EVENT: &str = "local_encounter_return";
pub const END_LOCAL_ENCOUNTER_OUTCOME_EVENT: &str = "end_local_encounter_outcome";
pub const LOCAL_ARENA_TEMPLATE_APPLIED_EVENT: &str = "local_arena_template_applied";

pub const MAX_ACTIVE_LOCAL_ENCOUNTERS: usize = 8;
const INSTANCE_LEDGER_MAX: usize = 64;
const END_LEDGER_MAX: usize = 64;
const FALLBACK_TEMPLATE_ID: &str = "__fallback_minimal__";
const DEFAULT_PLAYER_ENTITY_ID: &str = "player";

const STATE_PROCESSED_REQUEST_IDS: &str = "processed_request_ids";
const STATE_ACTIVE_BY_LOCAL_SPACE: &str = "active_by_local_space";
const STATE_PROCESSED_END_ACTION_UIDS: &str = "processed_end_action_uids";
const STATE_APPLIED_TEMPLATE_BY_LOCAL_SPACE: &str = "applied_template_by_local_space";
const STATE_RETURN_IN_PROGRESS_BY_LOCAL_SPACE: &str = "return_in_progress_by_local_space";

// ============================================================================
// Request routing
// ============================================================================

/// Routes campaign-plane resolve requests into local-encounter requests.
#[derive(Default)]
pub struct LocalEncounterRequestModule;

impl LocalEncounterRequestModule {
    pub const NAME: &'static str = "local_encounter_request";

    pub fn new() -> Self {
        LocalEncounterRequestModule
    }
}

impl RuleModule for LocalEncounterRequestModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_event_executed(&mut self, sim: &mut Simulation, event: &SimEvent) -> SimResult<()> {
        if event.event_type != ENCOUNTER_RESOLVE_REQUEST_EVENT {
            return Ok(());
        }
        let Some(from_location) = event.params.get("location").and_then(LocationRef::from_value)
        else {
            return Ok(());
        };
        let is_campaign = sim
            .state
            .world
            .spaces
            .get(&from_location.space_id)
            .map(|space| space.role == CAMPAIGN_SPACE_ROLE)
            .unwrap_or(false);
        if !is_campaign {
            return Ok(());
        }

        let mut params = JsonMap::new();
        params.insert(
            "tick".into(),
            Value::from(json::get_u64(&event.params, "tick").unwrap_or(event.tick.as_u64())),
        );
        params.insert(
            "from_space_id".into(),
            Value::String(from_location.space_id.clone()),
        );
        params.insert("from_location".into(), from_location.to_value());
        for key in ["context", "trigger", "location", "roll", "category", "table_id", "entry_id"] {
            params.insert(
                key.to_string(),
                event.params.get(key).cloned().unwrap_or(Value::Null),
            );
        }
        let mut encounter = JsonMap::new();
        for key in ["table_id", "entry_id", "category", "roll"] {
            encounter.insert(
                key.to_string(),
                event.params.get(key).cloned().unwrap_or(Value::Null),
            );
        }
        params.insert("encounter".into(), Value::Object(encounter));
        params.insert(
            "suggested_local_template_id".into(),
            event
                .params
                .get("suggested_local_template_id")
                .cloned()
                .unwrap_or(Value::Null),
        );
        params.insert(
            "tags".into(),
            Value::Array(
                json::tags_or_empty(&event.params, "tags")
                    .into_iter()
                    .map(Value::String)
                    .collect(),
            ),
        );
        sim.schedule_event_at(event.tick + 1, LOCAL_ENCOUNTER_REQUEST_EVENT, params);
        Ok(())
    }
}

// ============================================================================
// Instance module
// ============================================================================

/// Deterministic local-encounter instancing and structural template
/// application, with FIFO-bounded ledgers that survive save/load.
pub struct LocalEncounterInstanceModule {
    arenas: LocalArenaTemplateRegistry,
}

impl LocalEncounterInstanceModule {
    pub const NAME: &'static str = "local_encounter_instance";

    pub fn new(arenas: LocalArenaTemplateRegistry) -> Self {
        LocalEncounterInstanceModule { arenas }
    }

    fn state(sim: &Simulation) -> JsonMap {
        let raw = sim.get_rules_state(Self::NAME);
        let mut state = JsonMap::new();
        json::set_uid_ledger(
            &mut state,
            STATE_PROCESSED_REQUEST_IDS,
            &json::uid_ledger(&raw, STATE_PROCESSED_REQUEST_IDS, INSTANCE_LEDGER_MAX),
        );
        json::set_uid_ledger(
            &mut state,
            STATE_PROCESSED_END_ACTION_UIDS,
            &json::uid_ledger(&raw, STATE_PROCESSED_END_ACTION_UIDS, END_LEDGER_MAX),
        );
        state.insert(
            STATE_ACTIVE_BY_LOCAL_SPACE.into(),
            raw.get(STATE_ACTIVE_BY_LOCAL_SPACE)
                .filter(|v| v.is_object())
                .cloned()
                .unwrap_or(Value::Object(JsonMap::new())),
        );
        state.insert(
            STATE_APPLIED_TEMPLATE_BY_LOCAL_SPACE.into(),
            raw.get(STATE_APPLIED_TEMPLATE_BY_LOCAL_SPACE)
                .filter(|v| v.is_object())
                .cloned()
                .unwrap_or(Value::Object(JsonMap::new())),
        );
        state.insert(
            STATE_RETURN_IN_PROGRESS_BY_LOCAL_SPACE.into(),
            raw.get(STATE_RETURN_IN_PROGRESS_BY_LOCAL_SPACE)
                .filter(|v| v.is_object())
                .cloned()
                .unwrap_or(Value::Object(JsonMap::new())),
        );
        state
    }

    fn active_map(state: &JsonMap) -> JsonMap {
        state
            .get(STATE_ACTIVE_BY_LOCAL_SPACE)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    fn return_in_progress(state: &JsonMap, local_space_id: &str) -> bool {
        state
            .get(STATE_RETURN_IN_PROGRESS_BY_LOCAL_SPACE)
            .and_then(Value::as_object)
            .and_then(|map| map.get(local_space_id))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    fn select_template(&self, params: &JsonMap) -> (String, &'static str) {
        let by_id = self.arenas.by_id();
        let suggested = json::get_str(params, "suggested_local_template_id");
        if let Some(suggested) = suggested {
            if by_id.contains_key(suggested) {
                return (suggested.to_string(), "suggested");
            }
        }
        if by_id.contains_key(self.arenas.default_template_id.as_str()) {
            if suggested.is_some() {
                return (self.arenas.default_template_id.clone(), "unknown_template");
            }
            return (self.arenas.default_template_id.clone(), "default");
        }
        (FALLBACK_TEMPLATE_ID.to_string(), "missing_default")
    }

    fn apply_template(&self, space: &mut SpaceState, template_id: &str) -> SimResult<()> {
        if template_id == FALLBACK_TEMPLATE_ID {
            Self::apply_minimal_fallback(space);
            return Ok(());
        }
        let Some(template) = self.arenas.by_id().get(template_id).copied() else {
            Self::apply_minimal_fallback(space);
            return Ok(());
        };

        space.topology_type = template.topology_type.clone();
        space.role = LOCAL_SPACE_ROLE.to_string();
        space.topology_params = template.topology_params.clone();
        space.hexes.clear();

        space.anchors.clear();
        for anchor in &template.anchors {
            let mut metadata = anchor.metadata.clone();
            metadata.insert(
                "tags".into(),
                Value::Array(anchor.tags.iter().cloned().map(Value::String).collect()),
            );
            space.anchors.insert(
                anchor.anchor_id.clone(),
                AnchorRecord {
                    anchor_id: anchor.anchor_id.clone(),
                    space_id: space.space_id.clone(),
                    coord: CellCoord::square(anchor.coord_x, anchor.coord_y),
                    kind: "transition".into(),
                    target: AnchorTarget {
                        target_type: "space".into(),
                        space_id: Some(space.space_id.clone()),
                        site_id: None,
                    },
                    metadata,
                },
            );
        }

        space.doors.clear();
        for row in &template.doors {
            let mut payload = row.clone();
            payload.insert("space_id".into(), Value::String(space.space_id.clone()));
            if let Ok(door) = serde_json::from_value::<DoorRecord>(Value::Object(payload)) {
                space.doors.insert(door.door_id.clone(), door);
            }
        }

        space.interactables.clear();
        for row in &template.interactables {
            let mut payload = row.clone();
            payload.insert("space_id".into(), Value::String(space.space_id.clone()));
            if let Ok(interactable) =
                serde_json::from_value::<InteractableRecord>(Value::Object(payload))
            {
                space
                    .interactables
                    .insert(interactable.interactable_id.clone(), interactable);
            }
        }
        Ok(())
    }

    fn apply_minimal_fallback(space: &mut SpaceState) {
        space.topology_type = SQUARE_GRID_TOPOLOGY.to_string();
        space.role = LOCAL_SPACE_ROLE.to_string();
        let mut params = JsonMap::new();
        params.insert("width".into(), Value::from(8));
        params.insert("height".into(), Value::from(8));
        params.insert("origin".into(), serde_json::json!({"x": 0, "y": 0}));
        space.topology_params = params;
        space.hexes.clear();
        space.doors.clear();
        space.interactables.clear();
        space.anchors.clear();
        let mut metadata = JsonMap::new();
        metadata.insert("tags".into(), serde_json::json!(["entry"]));
        metadata.insert("fallback".into(), Value::Bool(true));
        space.anchors.insert(
            "entry".into(),
            AnchorRecord {
                anchor_id: "entry".into(),
                space_id: space.space_id.clone(),
                coord: CellCoord::square(0, 0),
                kind: "transition".into(),
                target: AnchorTarget {
                    target_type: "space".into(),
                    space_id: Some(space.space_id.clone()),
                    site_id: None,
                },
                metadata,
            },
        );
    }

    fn spawn_coord(space: &SpaceState) -> CellCoord {
        if let Some(entry) = space.anchors.get("entry") {
            if space.is_valid_cell(&entry.coord) {
                return entry.coord;
            }
        }
        space.default_spawn_coord()
    }

    /// Player when present, else the first entity (by id) in the origin space.
    fn select_entity_id(sim: &Simulation, from_space_id: &str) -> Option<String> {
        if sim.entity(DEFAULT_PLAYER_ENTITY_ID).is_some() {
            return Some(DEFAULT_PLAYER_ENTITY_ID.to_string());
        }
        sim.state
            .entities
            .iter()
            .find(|(_, entity)| entity.space_id == from_space_id)
            .map(|(entity_id, _)| entity_id.clone())
    }

    fn on_request(&self, sim: &mut Simulation, event: &SimEvent) {
        let mut state = Self::state(sim);
        let request_id = event.event_id.clone();
        let mut processed =
            json::uid_ledger(&state, STATE_PROCESSED_REQUEST_IDS, INSTANCE_LEDGER_MAX);
        if processed.iter().any(|id| id == &request_id) {
            return;
        }

        let from_space_id = json::get_str(&event.params, "from_space_id")
            .unwrap_or("")
            .to_string();
        let mut active = Self::active_map(&state);

        if active.len() >= MAX_ACTIVE_LOCAL_ENCOUNTERS {
            let mut params = JsonMap::new();
            params.insert("request_event_id".into(), Value::String(request_id.clone()));
            params.insert("from_space_id".into(), Value::String(from_space_id));
            params.insert("to_space_id".into(), Value::Null);
            params.insert("entity_id".into(), Value::Null);
            params.insert(
                "from_location".into(),
                event.params.get("from_location").cloned().unwrap_or(Value::Null),
            );
            params.insert("to_spawn_coord".into(), Value::Null);
            params.insert("transition_applied".into(), Value::Bool(false));
            params.insert(
                "reason".into(),
                Value::String("active_local_encounter_cap_reached".into()),
            );
            sim.schedule_event_at(event.tick, LOCAL_ENCOUNTER_BEGIN_EVENT, params);
            json::push_uid_fifo(&mut processed, &request_id, INSTANCE_LEDGER_MAX);
            json::set_uid_ledger(&mut state, STATE_PROCESSED_REQUEST_IDS, &processed);
            sim.set_rules_state(Self::NAME, state);
            return;
        }

        let local_space_id = format!("local_encounter:{request_id}");
        if !sim.state.world.spaces.contains_key(&local_space_id) {
            let mut params = JsonMap::new();
            params.insert("width".into(), Value::from(10));
            params.insert("height".into(), Value::from(10));
            params.insert("origin".into(), serde_json::json!({"x": 0, "y": 0}));
            let space = SpaceState::new(
                &local_space_id,
                SQUARE_GRID_TOPOLOGY,
                LOCAL_SPACE_ROLE,
                params,
            )
            .expect("literal square params are valid");
            sim.state.world.spaces.insert(local_space_id.clone(), space);
        }

        let (template_id, selection_reason) = self.select_template(&event.params);
        let mut applied_templates = state
            .get(STATE_APPLIED_TEMPLATE_BY_LOCAL_SPACE)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let (template_applied, template_reason): (bool, &str) =
            if applied_templates.get(&local_space_id).and_then(Value::as_str)
                == Some(template_id.as_str())
            {
                (false, "already_applied")
            } else {
                let space = sim
                    .state
                    .world
                    .spaces
                    .get_mut(&local_space_id)
                    .expect("space inserted above");
                let reason = if template_id == FALLBACK_TEMPLATE_ID {
                    selection_reason
                } else if self.arenas.by_id().contains_key(template_id.as_str()) {
                    "applied"
                } else {
                    "unknown_template"
                };
                self.apply_template(space, &template_id)
                    .expect("template application is infallible");
                (true, reason)
            };
        if template_applied {
            applied_templates.insert(local_space_id.clone(), Value::String(template_id.clone()));
        }

        let entity_id = Self::select_entity_id(sim, &from_space_id);
        let mut transition_applied = false;
        let mut from_location_payload = event.params.get("from_location").cloned();
        let to_spawn_coord = {
            let space = sim
                .state
                .world
                .spaces
                .get(&local_space_id)
                .expect("space inserted above");
            Self::spawn_coord(space)
        };
        if let Some(entity_id) = entity_id.as_deref() {
            if let Some(current) = sim.entity_location_ref(entity_id) {
                from_location_payload = Some(current.to_value());
            }
            let (x, y) = {
                let space = sim
                    .state
                    .world
                    .spaces
                    .get(&local_space_id)
                    .expect("space inserted above");
                Simulation::coord_to_world_xy(space, &to_spawn_coord)
                    .expect("spawn coord fits the local topology")
            };
            if let Some(entity) = sim.entity_mut(entity_id) {
                entity.space_id = local_space_id.clone();
                entity.position_x = x;
                entity.position_y = y;
                entity.move_input_x = 0.0;
                entity.move_input_y = 0.0;
                entity.target_position = None;
                transition_applied = true;
            }
        }

        let mut template_params = JsonMap::new();
        template_params.insert("tick".into(), Value::from(event.tick.as_u64()));
        template_params.insert("request_event_id".into(), Value::String(request_id.clone()));
        template_params.insert("local_space_id".into(), Value::String(local_space_id.clone()));
        template_params.insert("template_id".into(), Value::String(template_id.clone()));
        template_params.insert("applied".into(), Value::Bool(template_applied));
        template_params.insert("reason".into(), Value::String(template_reason.to_string()));
        sim.schedule_event_at(event.tick, LOCAL_ARENA_TEMPLATE_APPLIED_EVENT, template_params);

        let mut begin_params = JsonMap::new();
        begin_params.insert("request_event_id".into(), Value::String(request_id.clone()));
        begin_params.insert(
            "from_space_id".into(),
            Value::String(from_space_id.clone()),
        );
        begin_params.insert("to_space_id".into(), Value::String(local_space_id.clone()));
        begin_params.insert(
            "entity_id".into(),
            entity_id.clone().map(Value::String).unwrap_or(Value::Null),
        );
        begin_params.insert(
            "from_location".into(),
            from_location_payload.clone().unwrap_or(Value::Null),
        );
        begin_params.insert("to_spawn_coord".into(), to_spawn_coord.to_value());
        begin_params.insert("transition_applied".into(), Value::Bool(transition_applied));
        begin_params.insert("template_id".into(), Value::String(template_id));
        begin_params.insert(
            "template_selection_reason".into(),
            Value::String(selection_reason.to_string()),
        );
        sim.schedule_event_at(event.tick, LOCAL_ENCOUNTER_BEGIN_EVENT, begin_params);

        if transition_applied {
            if let (Some(entity_id), Some(origin_location)) =
                (entity_id, from_location_payload.clone())
            {
                let mut context = JsonMap::new();
                context.insert("request_event_id".into(), Value::String(request_id.clone()));
                context.insert("entity_id".into(), Value::String(entity_id));
                context.insert(
                    "from_space_id".into(),
                    Value::String(from_space_id.clone()),
                );
                context.insert("origin_space_id".into(), Value::String(from_space_id));
                context.insert("from_location".into(), origin_location.clone());
                context.insert("origin_location".into(), origin_location.clone());
                context.insert(
                    "return_spawn_coord".into(),
                    origin_location
                        .as_object()
                        .and_then(|map| map.get("coord"))
                        .cloned()
                        .unwrap_or(Value::Null),
                );
                context.insert("started_tick".into(), Value::from(event.tick.as_u64()));
                active.insert(local_space_id.clone(), Value::Object(context));
            }
        }

        // Persist ledgers (all FIFO-bounded).
        while active.len() > MAX_ACTIVE_LOCAL_ENCOUNTERS {
            let first_key = active.keys().next().cloned().expect("non-empty map");
            active.remove(&first_key);
        }
        state.insert(STATE_ACTIVE_BY_LOCAL_SPACE.into(), Value::Object(active));
        state.insert(
            STATE_APPLIED_TEMPLATE_BY_LOCAL_SPACE.into(),
            Value::Object(applied_templates),
        );
        json::push_uid_fifo(&mut processed, &request_id, INSTANCE_LEDGER_MAX);
        json::set_uid_ledger(&mut state, STATE_PROCESSED_REQUEST_IDS, &processed);
        sim.set_rules_state(Self::NAME, state);
    }

    fn handle_end_intent(&self, sim: &mut Simulation, command: &SimCommand, command_index: usize) {
        let action_uid = command.action_uid(command_index);
        let mut state = Self::state(sim);
        let processed_ends =
            json::uid_ledger(&state, STATE_PROCESSED_END_ACTION_UIDS, END_LEDGER_MAX);
        let entity_id = json::get_str(&command.params, "entity_id")
            .map(str::to_string)
            .or_else(|| command.entity_id.clone());
        let tags = json::tags_or_empty(&command.params, "tags");

        let mut reason = "resolved";
        let mut applied = false;
        let mut local_space_id: Option<String> = None;

        if processed_ends.iter().any(|uid| uid == &action_uid) {
            reason = "already_processed";
        } else if entity_id
            .as_deref()
            .map(|id| sim.entity(id).is_none())
            .unwrap_or(true)
        {
            reason = "invalid_entity";
        } else {
            let entity_id = entity_id.as_deref().expect("checked above");
            let space_id = sim
                .entity(entity_id)
                .map(|entity| entity.space_id.clone())
                .expect("checked above");
            let is_local = sim
                .state
                .world
                .spaces
                .get(&space_id)
                .map(|space| space.role == LOCAL_SPACE_ROLE)
                .unwrap_or(false);
            if !is_local {
                reason = "not_in_local_space";
            } else {
                local_space_id = Some(space_id.clone());
                let active = Self::active_map(&state);
                let Some(context) = active.get(&space_id).and_then(Value::as_object).cloned()
                else {
                    self.schedule_end_outcome(
                        sim,
                        command,
                        &action_uid,
                        entity_id,
                        Some(&space_id),
                        false,
                        "no_active_local_encounter",
                        &tags,
                    );
                    return;
                };
                if Self::return_in_progress(&state, &space_id) {
                    reason = "already_returning";
                } else {
                    let mut in_progress = state
                        .get(STATE_RETURN_IN_PROGRESS_BY_LOCAL_SPACE)
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default();
                    in_progress.insert(space_id.clone(), Value::Bool(true));
                    state.insert(
                        STATE_RETURN_IN_PROGRESS_BY_LOCAL_SPACE.into(),
                        Value::Object(in_progress),
                    );
                    sim.set_rules_state(Self::NAME, state.clone());

                    let mut end_params = JsonMap::new();
                    end_params.insert("tick".into(), Value::from(command.tick.as_u64()));
                    end_params.insert("action_uid".into(), Value::String(action_uid.clone()));
                    end_params.insert("entity_id".into(), Value::String(entity_id.to_string()));
                    end_params.insert("local_space_id".into(), Value::String(space_id.clone()));
                    for key in [
                        "request_event_id",
                        "from_space_id",
                        "origin_space_id",
                        "origin_location",
                        "from_location",
                    ] {
                        end_params.insert(
                            key.to_string(),
                            context.get(key).cloned().unwrap_or(Value::Null),
                        );
                    }
                    end_params.insert(
                        "tags".into(),
                        Value::Array(tags.iter().cloned().map(Value::String).collect()),
                    );
                    sim.schedule_event_at(command.tick + 1, LOCAL_ENCOUNTER_END_EVENT, end_params);
                    applied = true;
                }
            }
        }

        self.schedule_end_outcome(
            sim,
            command,
            &action_uid,
            entity_id.as_deref().unwrap_or(""),
            local_space_id.as_deref(),
            applied,
            reason,
            &tags,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn schedule_end_outcome(
        &self,
        sim: &mut Simulation,
        command: &SimCommand,
        action_uid: &str,
        entity_id: &str,
        local_space_id: Option<&str>,
        applied: bool,
        reason: &str,
        tags: &[String],
    ) {
        let mut params = JsonMap::new();
        params.insert("tick".into(), Value::from(command.tick.as_u64()));
        params.insert(
            "intent".into(),
            Value::String(END_LOCAL_ENCOUNTER_INTENT.into()),
        );
        params.insert("action_uid".into(), Value::String(action_uid.to_string()));
        params.insert(
            "entity_id".into(),
            if entity_id.is_empty() {
                Value::Null
            } else {
                Value::String(entity_id.to_string())
            },
        );
        params.insert(
            "local_space_id".into(),
            local_space_id
                .map(|id| Value::String(id.to_string()))
                .unwrap_or(Value::Null),
        );
        params.insert("applied".into(), Value::Bool(applied));
        params.insert("reason".into(), Value::String(reason.to_string()));
        params.insert(
            "tags".into(),
            Value::Array(tags.iter().cloned().map(Value::String).collect()),
        );
        sim.schedule_event_at(command.tick, END_LOCAL_ENCOUNTER_OUTCOME_EVENT, params);
    }

    fn on_end(&self, sim: &mut Simulation, event: &SimEvent) {
        let mut state = Self::state(sim);
        let action_uid = json::get_str(&event.params, "action_uid")
            .unwrap_or("")
            .to_string();
        if action_uid.is_empty() {
            return;
        }
        let mut processed =
            json::uid_ledger(&state, STATE_PROCESSED_END_ACTION_UIDS, END_LEDGER_MAX);
        if processed.iter().any(|uid| uid == &action_uid) {
            return;
        }

        let local_space_id = json::get_str(&event.params, "local_space_id")
            .unwrap_or("")
            .to_string();
        let mut active = Self::active_map(&state);
        let context = active.get(&local_space_id).and_then(Value::as_object).cloned();
        let entity_id = json::get_str(&event.params, "entity_id").map(str::to_string);

        let mut applied = false;
        let mut reason = "resolved";
        let mut to_space_id: Option<String> = None;
        let mut to_coord: Option<CellCoord> = None;

        match (&context, entity_id.as_deref()) {
            (None, _) => reason = "no_active_local_encounter",
            (Some(_), None) => reason = "invalid_entity",
            (Some(_), Some(entity_id_value)) if sim.entity(entity_id_value).is_none() => {
                reason = "invalid_entity";
            }
            (Some(context), Some(entity_id_value)) => {
                let fallback_space = json::get_str(context, "origin_space_id")
                    .or_else(|| json::get_str(context, "from_space_id"))
                    .unwrap_or("")
                    .to_string();
                let origin_location = context
                    .get("origin_location")
                    .or_else(|| context.get("from_location"))
                    .and_then(LocationRef::from_value);
                let target_space_id = origin_location
                    .as_ref()
                    .map(|location| location.space_id.clone())
                    .unwrap_or(fallback_space);
                to_space_id = Some(target_space_id.clone());
                match sim.state.world.spaces.get(&target_space_id) {
                    None => reason = "invalid_from_space",
                    Some(space) => match origin_location {
                        None => reason = "invalid_origin_location_for_space",
                        Some(location)
                            if !Simulation::topology_compatible(
                                &space.topology_type,
                                &location.topology_type,
                            ) =>
                        {
                            reason = "invalid_origin_location_for_space"
                        }
                        Some(location) => {
                            match Simulation::coord_to_world_xy(space, &location.coord) {
                                None => reason = "invalid_origin_location_for_space",
                                Some((x, y)) => {
                                    to_coord = Some(location.coord);
                                    if let Some(entity) = sim.entity_mut(entity_id_value) {
                                        entity.space_id = target_space_id.clone();
                                        entity.position_x = x;
                                        entity.position_y = y;
                                        entity.move_input_x = 0.0;
                                        entity.move_input_y = 0.0;
                                        entity.target_position = None;
                                        applied = true;
                                    }
                                }
                            }
                        }
                    },
                }
            }
        }

        if context.is_some() {
            active.remove(&local_space_id);
        }
        let mut in_progress = state
            .get(STATE_RETURN_IN_PROGRESS_BY_LOCAL_SPACE)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        in_progress.remove(&local_space_id);

        json::push_uid_fifo(&mut processed, &action_uid, END_LEDGER_MAX);
        state.insert(STATE_ACTIVE_BY_LOCAL_SPACE.into(), Value::Object(active));
        state.insert(
            STATE_RETURN_IN_PROGRESS_BY_LOCAL_SPACE.into(),
            Value::Object(in_progress),
        );
        json::set_uid_ledger(&mut state, STATE_PROCESSED_END_ACTION_UIDS, &processed);
        sim.set_rules_state(Self::NAME, state);

        let mut params = JsonMap::new();
        params.insert("tick".into(), Value::from(event.tick.as_u64()));
        params.insert("action_uid".into(), Value::String(action_uid));
        params.insert(
            "entity_id".into(),
            entity_id.map(Value::String).unwrap_or(Value::Null),
        );
        params.insert(
            "request_event_id".into(),
            event
                .params
                .get("request_event_id")
                .cloned()
                .unwrap_or(Value::Null),
        );
        params.insert("from_space_id".into(), Value::String(local_space_id));
        params.insert(
            "to_space_id".into(),
            to_space_id.map(Value::String).unwrap_or(Value::Null),
        );
        params.insert(
            "from_location".into(),
            event
                .params
                .get("from_location")
                .cloned()
                .unwrap_or(Value::Null),
        );
        params.insert(
            "to_coord".into(),
            to_coord.map(|coord| coord.to_value()).unwrap_or(Value::Null),
        );
        params.insert("applied".into(), Value::Bool(applied));
        params.insert("reason".into(), Value::String(reason.to_string()));
        params.insert(
            "tags".into(),
            Value::Array(
                json::tags_or_empty(&event.params, "tags")
                    .into_iter()
                    .map(Value::String)
                    .collect(),
            ),
        );
        sim.schedule_event_at(event.tick, LOCAL_ENCOUNTER_RETURN_EVENT, params);
    }
}

impl RuleModule for LocalEncounterInstanceModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_simulation_start(&mut self, sim: &mut Simulation) -> SimResult<()> {
        let state = Self::state(sim);
        sim.set_rules_state(Self::NAME, state);
        Ok(())
    }

    fn on_command(
        &mut self,
        sim: &mut Simulation,
        command: &SimCommand,
        command_index: usize,
    ) -> SimResult<bool> {
        if command.command_type != END_LOCAL_ENCOUNTER_INTENT {
            return Ok(false);
        }
        self.handle_end_intent(sim, command, command_index);
        Ok(true)
    }

    fn on_event_executed(&mut self, sim: &mut Simulation, event: &SimEvent) -> SimResult<()> {
        match event.event_type.as_str() {
            LOCAL_ENCOUNTER_REQUEST_EVENT => self.on_request(sim, event),
            LOCAL_ENCOUNTER_END_EVENT => self.on_end(sim, event),
            _ => {}
        }
        Ok(())
    }
}

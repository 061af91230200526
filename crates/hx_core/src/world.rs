//! # World
//!
//! Process-wide content for one simulation: spaces with their topology and
//! structural records, containers, sites, and the append-oriented ledgers
//! (signals, occlusion edges, tracks, spawn descriptors, rumors).
//!
//! ## Determinism
//! Uses BTreeMap (not HashMap) for every keyed collection - iteration order
//! feeds the canonical payload and therefore the world hash. Never use
//! HashMap in simulation state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use hx_api::{EngineError, SimResult};
use hx_types::{
    CellCoord, HexCoord, JsonMap, MasterSeed, DEFAULT_OVERWORLD_SPACE_ID, SQUARE_GRID_TOPOLOGY,
};

use crate::rng::{derive_stream_seed, Mt19937, RNG_WORLDGEN_STREAM};

pub const CAMPAIGN_SPACE_ROLE: &str = "campaign";
pub const LOCAL_SPACE_ROLE: &str = "local";

/// Signals list cap (FIFO eviction).
pub const MAX_SIGNALS: usize = 256;
/// Structure-occlusion edge cap (FIFO eviction).
pub const MAX_OCCLUSION_EDGES: usize = 2048;

pub const SITE_TYPES: [&str; 3] = ["none", "town", "dungeon"];
pub const DEFAULT_TERRAIN_OPTIONS: [&str; 3] = ["plains", "forest", "hills"];

// ============================================================================
// Hex records
// ============================================================================

/// Per-hex terrain record on a campaign plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HexRecord {
    pub terrain_type: String,
    #[serde(default = "default_site_type")]
    pub site_type: String,
    #[serde(default)]
    pub metadata: JsonMap,
}

fn default_site_type() -> String {
    "none".to_string()
}

impl HexRecord {
    pub fn new(terrain_type: impl Into<String>) -> Self {
        HexRecord {
            terrain_type: terrain_type.into(),
            site_type: default_site_type(),
            metadata: JsonMap::new(),
        }
    }

    pub fn validate(&self) -> SimResult<()> {
        if !SITE_TYPES.contains(&self.site_type.as_str()) {
            return Err(EngineError::InvalidPayload(format!(
                "invalid site_type: {}",
                self.site_type
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Structural records
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DoorFlags {
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub blocked: bool,
}

/// A door between two adjacent cells of one space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoorRecord {
    pub door_id: String,
    pub space_id: String,
    pub a: CellCoord,
    pub b: CellCoord,
    pub state: String,
    #[serde(default)]
    pub flags: DoorFlags,
    #[serde(default)]
    pub metadata: JsonMap,
}

impl DoorRecord {
    pub fn is_open(&self) -> bool {
        self.state == "open"
    }

    pub fn validate(&self) -> SimResult<()> {
        if self.door_id.is_empty() || self.space_id.is_empty() {
            return Err(EngineError::InvalidPayload(
                "door ids must be non-empty strings".into(),
            ));
        }
        if self.state != "open" && self.state != "closed" {
            return Err(EngineError::InvalidPayload(format!(
                "door state must be 'open' or 'closed', found {}",
                self.state
            )));
        }
        if !self.a.same_topology(&self.b) {
            return Err(EngineError::InvalidPayload(
                "door endpoints must share the same topology keys".into(),
            ));
        }
        Ok(())
    }
}

/// Target of an anchor: another space or a site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorTarget {
    #[serde(rename = "type")]
    pub target_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
}

/// A cell-anchored transition marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorRecord {
    pub anchor_id: String,
    pub space_id: String,
    pub coord: CellCoord,
    pub kind: String,
    pub target: AnchorTarget,
    #[serde(default)]
    pub metadata: JsonMap,
}

impl AnchorRecord {
    pub fn validate(&self) -> SimResult<()> {
        if self.anchor_id.is_empty() || self.space_id.is_empty() {
            return Err(EngineError::InvalidPayload(
                "anchor ids must be non-empty strings".into(),
            ));
        }
        if !["exit", "return", "transition"].contains(&self.kind.as_str()) {
            return Err(EngineError::InvalidPayload(format!(
                "anchor kind must be one of exit|return|transition, found {}",
                self.kind
            )));
        }
        match self.target.target_type.as_str() {
            "space" => {
                if self.target.space_id.as_deref().unwrap_or("").is_empty() {
                    return Err(EngineError::InvalidPayload(
                        "anchor.target.space_id must be a non-empty string".into(),
                    ));
                }
            }
            "site" => {
                if self.target.site_id.as_deref().unwrap_or("").is_empty() {
                    return Err(EngineError::InvalidPayload(
                        "anchor.target.site_id must be a non-empty string".into(),
                    ));
                }
            }
            other => {
                return Err(EngineError::InvalidPayload(format!(
                    "anchor.target.type must be space or site, found {other}"
                )))
            }
        }
        Ok(())
    }
}

/// A cell-anchored interactable with a free-form state bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractableRecord {
    pub interactable_id: String,
    pub space_id: String,
    pub coord: CellCoord,
    pub kind: String,
    #[serde(default)]
    pub state: JsonMap,
    #[serde(default)]
    pub metadata: JsonMap,
}

impl InteractableRecord {
    pub fn validate(&self) -> SimResult<()> {
        if self.interactable_id.is_empty() || self.space_id.is_empty() || self.kind.is_empty() {
            return Err(EngineError::InvalidPayload(
                "interactable ids and kind must be non-empty strings".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Containers / sites / rumors / occlusion
// ============================================================================

/// An item store. Quantities are strictly positive; zero prunes the row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContainerState {
    pub container_id: String,
    pub location: Option<Value>,
    pub owner_entity_id: Option<String>,
    pub items: BTreeMap<String, u64>,
}

impl ContainerState {
    pub fn new(container_id: impl Into<String>) -> Self {
        ContainerState {
            container_id: container_id.into(),
            ..Default::default()
        }
    }

    pub fn quantity(&self, item_id: &str) -> u64 {
        self.items.get(item_id).copied().unwrap_or(0)
    }

    pub fn add(&mut self, item_id: &str, quantity: u64) {
        if quantity == 0 {
            return;
        }
        *self.items.entry(item_id.to_string()).or_insert(0) += quantity;
    }

    /// Remove up to `quantity`; `false` (and no mutation) when insufficient.
    pub fn remove(&mut self, item_id: &str, quantity: u64) -> bool {
        let current = self.quantity(item_id);
        if current < quantity {
            return false;
        }
        let remaining = current - quantity;
        if remaining == 0 {
            self.items.remove(item_id);
        } else {
            self.items.insert(item_id.to_string(), remaining);
        }
        true
    }

    pub fn to_value(&self) -> Value {
        let mut payload = JsonMap::new();
        payload.insert("container_id".into(), Value::String(self.container_id.clone()));
        let items: JsonMap = self
            .items
            .iter()
            .filter(|(_, quantity)| **quantity > 0)
            .map(|(item_id, quantity)| (item_id.clone(), Value::from(*quantity)))
            .collect();
        payload.insert("items".into(), Value::Object(items));
        if let Some(location) = &self.location {
            payload.insert("location".into(), location.clone());
        }
        if let Some(owner) = &self.owner_entity_id {
            payload.insert("owner_entity_id".into(), Value::String(owner.clone()));
        }
        Value::Object(payload)
    }

    pub fn from_value(value: &Value) -> SimResult<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| EngineError::InvalidPayload("container must be an object".into()))?;
        let container_id = map
            .get("container_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                EngineError::InvalidPayload("container_id must be a non-empty string".into())
            })?
            .to_string();

        let mut items = BTreeMap::new();
        if let Some(raw_items) = map.get("items") {
            let raw_items = raw_items.as_object().ok_or_else(|| {
                EngineError::InvalidPayload("container items must be an object".into())
            })?;
            for (item_id, quantity) in raw_items {
                let quantity = quantity.as_u64().ok_or_else(|| {
                    EngineError::InvalidPayload(
                        "container item quantities must be non-negative integers".into(),
                    )
                })?;
                if quantity > 0 {
                    items.insert(item_id.clone(), quantity);
                }
            }
        }

        Ok(ContainerState {
            container_id,
            location: map.get("location").filter(|v| !v.is_null()).cloned(),
            owner_entity_id: map
                .get("owner_entity_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            items,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteEntrance {
    pub target_space_id: String,
    #[serde(default)]
    pub spawn: Option<CellCoord>,
}

/// A named site (town, dungeon, ...) pinned to a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteRecord {
    pub site_id: String,
    pub site_type: String,
    pub location: SiteLocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrance: Option<SiteEntrance>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteLocation {
    pub space_id: String,
    pub coord: CellCoord,
}

impl SiteRecord {
    pub fn validate(&self) -> SimResult<()> {
        if self.site_id.is_empty() || self.site_type.is_empty() {
            return Err(EngineError::InvalidPayload(
                "site ids must be non-empty strings".into(),
            ));
        }
        if self.location.space_id.is_empty() {
            return Err(EngineError::InvalidPayload(
                "site location.space_id must be a non-empty string".into(),
            ));
        }
        if let Some(entrance) = &self.entrance {
            if entrance.target_space_id.is_empty() {
                return Err(EngineError::InvalidPayload(
                    "site entrance.target_space_id must be a non-empty string".into(),
                ));
            }
        }
        Ok(())
    }
}

/// A world rumor. Confidence is clamped-validated to [0, 1], hop is >= 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RumorRecord {
    pub rumor_id: String,
    pub created_tick: u64,
    pub location: Value,
    pub template_id: String,
    pub source_action_uid: String,
    pub confidence: f64,
    pub hop: u64,
    pub expires_tick: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<JsonMap>,
}

impl RumorRecord {
    pub fn validate(&self) -> SimResult<()> {
        if self.rumor_id.is_empty() || self.template_id.is_empty() || self.source_action_uid.is_empty() {
            return Err(EngineError::InvalidPayload(
                "rumor ids must be non-empty strings".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(EngineError::InvalidPayload(format!(
                "rumor confidence must be within [0.0, 1.0], found {}",
                self.confidence
            )));
        }
        Ok(())
    }
}

/// An undirected occlusion edge; endpoints are canonically ordered.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OcclusionEdge {
    pub space_id: String,
    pub cell_a: CellCoord,
    pub cell_b: CellCoord,
    pub occlusion_value: u64,
}

/// Canonicalize an undirected edge by sorting its endpoints.
pub fn canonical_edge_cells(cell_a: CellCoord, cell_b: CellCoord) -> (CellCoord, CellCoord) {
    if cell_b < cell_a {
        (cell_b, cell_a)
    } else {
        (cell_a, cell_b)
    }
}

// ============================================================================
// SpaceState
// ============================================================================

/// One addressable plane: a topology, its cells, and structural records.
#[derive(Debug, Clone, PartialEq)]
pub struct SpaceState {
    pub space_id: String,
    pub topology_type: String,
    pub role: String,
    pub topology_params: JsonMap,
    pub hexes: BTreeMap<HexCoord, HexRecord>,
    pub doors: BTreeMap<String, DoorRecord>,
    pub anchors: BTreeMap<String, AnchorRecord>,
    pub interactables: BTreeMap<String, InteractableRecord>,
}

impl SpaceState {
    pub fn new(
        space_id: impl Into<String>,
        topology_type: impl Into<String>,
        role: impl Into<String>,
        topology_params: JsonMap,
    ) -> SimResult<Self> {
        let topology_type = topology_type.into();
        let topology_params = if topology_type == SQUARE_GRID_TOPOLOGY {
            normalized_square_params(&topology_params)?
        } else {
            topology_params
        };
        Ok(SpaceState {
            space_id: space_id.into(),
            topology_type,
            role: role.into(),
            topology_params,
            hexes: BTreeMap::new(),
            doors: BTreeMap::new(),
            anchors: BTreeMap::new(),
            interactables: BTreeMap::new(),
        })
    }

    pub fn is_campaign(&self) -> bool {
        self.role == CAMPAIGN_SPACE_ROLE
    }

    /// Origin and extent for square-grid spaces.
    pub fn square_bounds(&self) -> Option<(i64, i64, i64, i64)> {
        if self.topology_type != SQUARE_GRID_TOPOLOGY {
            return None;
        }
        let width = self.topology_params.get("width")?.as_i64()?;
        let height = self.topology_params.get("height")?.as_i64()?;
        let origin = self.topology_params.get("origin")?.as_object()?;
        let origin_x = origin.get("x")?.as_i64()?;
        let origin_y = origin.get("y")?.as_i64()?;
        Some((origin_x, origin_y, width, height))
    }

    pub fn is_valid_cell(&self, coord: &CellCoord) -> bool {
        match coord {
            CellCoord::Square { x, y } => match self.square_bounds() {
                Some((origin_x, origin_y, width, height)) => {
                    *x >= origin_x && *x < origin_x + width && *y >= origin_y && *y < origin_y + height
                }
                None => false,
            },
            CellCoord::Hex { q, r } => {
                self.topology_type != SQUARE_GRID_TOPOLOGY
                    && self.hexes.contains_key(&HexCoord::new(*q, *r))
            }
        }
    }

    /// Spawn cell: explicit `spawn` topology param when valid, else the
    /// square origin, else hex (0, 0).
    pub fn default_spawn_coord(&self) -> CellCoord {
        if let Some(spawn) = self
            .topology_params
            .get("spawn")
            .and_then(CellCoord::from_value)
        {
            if self.is_valid_cell(&spawn) {
                return spawn;
            }
        }
        if let Some((origin_x, origin_y, _, _)) = self.square_bounds() {
            return CellCoord::square(origin_x, origin_y);
        }
        CellCoord::hex(0, 0)
    }

    pub fn to_value(&self) -> Value {
        let mut payload = JsonMap::new();
        payload.insert("space_id".into(), Value::String(self.space_id.clone()));
        payload.insert("topology_type".into(), Value::String(self.topology_type.clone()));
        payload.insert("role".into(), Value::String(self.role.clone()));
        payload.insert("topology_params".into(), Value::Object(self.topology_params.clone()));

        let hex_rows: Vec<Value> = self
            .hexes
            .iter()
            .map(|(coord, record)| {
                serde_json::json!({
                    "coord": {"q": coord.q, "r": coord.r},
                    "record": serde_json::to_value(record).expect("hex record serializes"),
                })
            })
            .collect();
        payload.insert("hexes".into(), Value::Array(hex_rows));

        if !self.doors.is_empty() {
            let doors: JsonMap = self
                .doors
                .iter()
                .map(|(id, record)| {
                    (id.clone(), serde_json::to_value(record).expect("door serializes"))
                })
                .collect();
            payload.insert("doors".into(), Value::Object(doors));
        }
        if !self.anchors.is_empty() {
            let anchors: JsonMap = self
                .anchors
                .iter()
                .map(|(id, record)| {
                    (id.clone(), serde_json::to_value(record).expect("anchor serializes"))
                })
                .collect();
            payload.insert("anchors".into(), Value::Object(anchors));
        }
        if !self.interactables.is_empty() {
            let interactables: JsonMap = self
                .interactables
                .iter()
                .map(|(id, record)| {
                    (id.clone(), serde_json::to_value(record).expect("interactable serializes"))
                })
                .collect();
            payload.insert("interactables".into(), Value::Object(interactables));
        }
        Value::Object(payload)
    }

    pub fn from_value(value: &Value) -> SimResult<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| EngineError::InvalidPayload("space entry must be an object".into()))?;
        let space_id = map
            .get("space_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                EngineError::InvalidPayload("space_id must be a non-empty string".into())
            })?;
        let topology_type = map
            .get("topology_type")
            .and_then(Value::as_str)
            .unwrap_or("custom");
        let role = map
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or(CAMPAIGN_SPACE_ROLE);
        if role != CAMPAIGN_SPACE_ROLE && role != LOCAL_SPACE_ROLE {
            return Err(EngineError::InvalidPayload(format!(
                "space role must be campaign or local, found {role}"
            )));
        }
        let topology_params = map
            .get("topology_params")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let mut space = SpaceState::new(space_id, topology_type, role, topology_params)?;

        if let Some(rows) = map.get("hexes").and_then(Value::as_array) {
            for row in rows {
                let row = row.as_object().ok_or_else(|| {
                    EngineError::InvalidPayload("hex row must be an object".into())
                })?;
                let coord = row
                    .get("coord")
                    .and_then(CellCoord::from_value)
                    .and_then(|c| c.as_hex())
                    .ok_or_else(|| EngineError::InvalidPayload("hex row invalid coord".into()))?;
                let record: HexRecord = serde_json::from_value(
                    row.get("record").cloned().unwrap_or(Value::Null),
                )
                .map_err(|err| EngineError::InvalidPayload(format!("hex record: {err}")))?;
                record.validate()?;
                space.hexes.insert(coord, record);
            }
        }

        if let Some(rows) = map.get("doors").and_then(Value::as_object) {
            for (door_id, row) in rows {
                let record: DoorRecord = serde_json::from_value(row.clone())
                    .map_err(|err| EngineError::InvalidPayload(format!("door record: {err}")))?;
                record.validate()?;
                if record.door_id != *door_id {
                    return Err(EngineError::InvalidPayload("door record id mismatch".into()));
                }
                if record.space_id != space.space_id {
                    return Err(EngineError::InvalidPayload(
                        "door record space_id mismatch".into(),
                    ));
                }
                if !space.is_valid_cell(&record.a) || !space.is_valid_cell(&record.b) {
                    return Err(EngineError::InvalidPayload(
                        "door endpoints must reference valid cells".into(),
                    ));
                }
                space.doors.insert(door_id.clone(), record);
            }
        }

        if let Some(rows) = map.get("anchors").and_then(Value::as_object) {
            for (anchor_id, row) in rows {
                let record: AnchorRecord = serde_json::from_value(row.clone())
                    .map_err(|err| EngineError::InvalidPayload(format!("anchor record: {err}")))?;
                record.validate()?;
                if record.anchor_id != *anchor_id || record.space_id != space.space_id {
                    return Err(EngineError::InvalidPayload("anchor record mismatch".into()));
                }
                if !space.is_valid_cell(&record.coord) {
                    return Err(EngineError::InvalidPayload(
                        "anchor coord must reference a valid cell".into(),
                    ));
                }
                space.anchors.insert(anchor_id.clone(), record);
            }
        }

        if let Some(rows) = map.get("interactables").and_then(Value::as_object) {
            for (interactable_id, row) in rows {
                let record: InteractableRecord = serde_json::from_value(row.clone())
                    .map_err(|err| {
                        EngineError::InvalidPayload(format!("interactable record: {err}"))
                    })?;
                record.validate()?;
                if record.interactable_id != *interactable_id || record.space_id != space.space_id {
                    return Err(EngineError::InvalidPayload(
                        "interactable record mismatch".into(),
                    ));
                }
                if !space.is_valid_cell(&record.coord) {
                    return Err(EngineError::InvalidPayload(
                        "interactable coord must reference a valid cell".into(),
                    ));
                }
                space.interactables.insert(interactable_id.clone(), record);
            }
        }

        Ok(space)
    }
}

fn normalized_square_params(params: &JsonMap) -> SimResult<JsonMap> {
    let width = params.get("width").and_then(Value::as_i64).unwrap_or(0);
    let height = params.get("height").and_then(Value::as_i64).unwrap_or(0);
    if width <= 0 || height <= 0 {
        return Err(EngineError::InvalidPayload(
            "square_grid topology requires width > 0 and height > 0".into(),
        ));
    }
    let (origin_x, origin_y) = match params.get("origin") {
        None => (0, 0),
        Some(Value::Object(origin)) => (
            origin.get("x").and_then(Value::as_i64).unwrap_or(0),
            origin.get("y").and_then(Value::as_i64).unwrap_or(0),
        ),
        Some(_) => {
            return Err(EngineError::InvalidPayload(
                "square_grid origin must be an object".into(),
            ))
        }
    };
    let mut normalized = JsonMap::new();
    normalized.insert("width".into(), Value::from(width));
    normalized.insert("height".into(), Value::from(height));
    normalized.insert(
        "origin".into(),
        serde_json::json!({"x": origin_x, "y": origin_y}),
    );
    if let Some(spawn) = params.get("spawn") {
        normalized.insert("spawn".into(), spawn.clone());
    }
    Ok(normalized)
}

// ============================================================================
// World generation
// ============================================================================

pub fn generate_hex_disk(radius: i64, rng_worldgen: &mut Mt19937) -> SimResult<BTreeMap<HexCoord, HexRecord>> {
    if radius < 0 {
        return Err(EngineError::InvalidPayload("radius must be >= 0".into()));
    }
    let mut hexes = BTreeMap::new();
    for q in -radius..=radius {
        let min_r = (-radius).max(-q - radius);
        let max_r = radius.min(-q + radius);
        for r in min_r..=max_r {
            hexes.insert(HexCoord::new(q, r), default_hex_record(rng_worldgen));
        }
    }
    Ok(hexes)
}

pub fn generate_hex_rectangle(
    width: i64,
    height: i64,
    rng_worldgen: &mut Mt19937,
) -> SimResult<BTreeMap<HexCoord, HexRecord>> {
    if width <= 0 || height <= 0 {
        return Err(EngineError::InvalidPayload(
            "width and height must be > 0".into(),
        ));
    }
    let mut hexes = BTreeMap::new();
    for q in 0..width {
        for r in 0..height {
            hexes.insert(HexCoord::new(q, r), default_hex_record(rng_worldgen));
        }
    }
    Ok(hexes)
}

fn default_hex_record(rng_worldgen: &mut Mt19937) -> HexRecord {
    let index = rng_worldgen.randrange(DEFAULT_TERRAIN_OPTIONS.len() as u64) as usize;
    HexRecord::new(DEFAULT_TERRAIN_OPTIONS[index])
}

// ============================================================================
// WorldState
// ============================================================================

/// The complete world content. Root of the world hash.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldState {
    pub spaces: BTreeMap<String, SpaceState>,
    pub signals: Vec<JsonMap>,
    pub structure_occlusion: Vec<OcclusionEdge>,
    pub tracks: Vec<JsonMap>,
    pub spawn_descriptors: Vec<JsonMap>,
    pub rumors: Vec<JsonMap>,
    pub containers: BTreeMap<String, ContainerState>,
    pub sites: BTreeMap<String, SiteRecord>,
}

impl WorldState {
    /// Wrap a single campaign space whose id must already be `overworld`.
    pub fn from_overworld(overworld: SpaceState) -> SimResult<Self> {
        if overworld.space_id != DEFAULT_OVERWORLD_SPACE_ID {
            return Err(EngineError::InvalidPayload(format!(
                "spaces must include default '{DEFAULT_OVERWORLD_SPACE_ID}' space"
            )));
        }
        let mut spaces = BTreeMap::new();
        spaces.insert(overworld.space_id.clone(), overworld);
        let mut world = WorldState {
            spaces,
            signals: Vec::new(),
            structure_occlusion: Vec::new(),
            tracks: Vec::new(),
            spawn_descriptors: Vec::new(),
            rumors: Vec::new(),
            containers: BTreeMap::new(),
            sites: BTreeMap::new(),
        };
        world.ensure_closed_door_occlusion_defaults();
        Ok(world)
    }

    /// Generate a fresh overworld from the worldgen stream. The stream is
    /// derived locally so a later simulation draw sequence is unaffected.
    pub fn create_with_topology(
        master_seed: MasterSeed,
        topology_type: &str,
        topology_params: &JsonMap,
    ) -> SimResult<Self> {
        let mut rng_worldgen =
            Mt19937::from_seed_u64(derive_stream_seed(master_seed, RNG_WORLDGEN_STREAM));
        let hexes = match topology_type {
            "hex_disk" => {
                let radius = topology_params
                    .get("radius")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| {
                        EngineError::InvalidPayload("hex_disk requires integer radius".into())
                    })?;
                generate_hex_disk(radius, &mut rng_worldgen)?
            }
            "hex_rectangle" => {
                let width = topology_params
                    .get("width")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                let height = topology_params
                    .get("height")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                generate_hex_rectangle(width, height, &mut rng_worldgen)?
            }
            other => {
                return Err(EngineError::InvalidPayload(format!(
                    "unsupported topology_type: {other}"
                )))
            }
        };

        let mut overworld = SpaceState::new(
            DEFAULT_OVERWORLD_SPACE_ID,
            topology_type,
            CAMPAIGN_SPACE_ROLE,
            topology_params.clone(),
        )?;
        overworld.hexes = hexes;
        WorldState::from_overworld(overworld)
    }

    pub fn overworld(&self) -> &SpaceState {
        self.spaces
            .get(DEFAULT_OVERWORLD_SPACE_ID)
            .expect("overworld space is validated at construction")
    }

    pub fn get_hex_record(&self, coord: HexCoord) -> Option<&HexRecord> {
        self.overworld().hexes.get(&coord)
    }

    pub fn set_hex_record(&mut self, coord: HexCoord, record: HexRecord) {
        self.spaces
            .get_mut(DEFAULT_OVERWORLD_SPACE_ID)
            .expect("overworld space is validated at construction")
            .hexes
            .insert(coord, record);
    }

    // ========================================================================
    // Occlusion
    // ========================================================================

    pub fn get_structure_occlusion_value(
        &self,
        space_id: &str,
        cell_a: CellCoord,
        cell_b: CellCoord,
    ) -> u64 {
        let (cell_a, cell_b) = canonical_edge_cells(cell_a, cell_b);
        self.structure_occlusion
            .iter()
            .find(|edge| edge.space_id == space_id && edge.cell_a == cell_a && edge.cell_b == cell_b)
            .map(|edge| edge.occlusion_value)
            .unwrap_or(0)
    }

    /// Upsert an occlusion edge; a value of 0 deletes it.
    pub fn set_structure_occlusion_edge(
        &mut self,
        space_id: &str,
        cell_a: CellCoord,
        cell_b: CellCoord,
        occlusion_value: u64,
    ) {
        let (cell_a, cell_b) = canonical_edge_cells(cell_a, cell_b);
        if let Some(index) = self.structure_occlusion.iter().position(|edge| {
            edge.space_id == space_id && edge.cell_a == cell_a && edge.cell_b == cell_b
        }) {
            if occlusion_value == 0 {
                self.structure_occlusion.remove(index);
            } else {
                self.structure_occlusion[index].occlusion_value = occlusion_value;
            }
            return;
        }
        if occlusion_value == 0 {
            return;
        }
        self.structure_occlusion.push(OcclusionEdge {
            space_id: space_id.to_string(),
            cell_a,
            cell_b,
            occlusion_value,
        });
        if self.structure_occlusion.len() > MAX_OCCLUSION_EDGES {
            let excess = self.structure_occlusion.len() - MAX_OCCLUSION_EDGES;
            self.structure_occlusion.drain(..excess);
        }
    }

    /// Every closed door carries a default occlusion edge of at least 1.
    pub fn ensure_closed_door_occlusion_defaults(&mut self) {
        let mut edges = Vec::new();
        for space in self.spaces.values() {
            for door in space.doors.values() {
                if !door.is_open() {
                    edges.push((space.space_id.clone(), door.a, door.b));
                }
            }
        }
        for (space_id, a, b) in edges {
            if self.get_structure_occlusion_value(&space_id, a, b) == 0 {
                self.set_structure_occlusion_edge(&space_id, a, b, 1);
            }
        }
    }

    // ========================================================================
    // Append-oriented ledgers
    // ========================================================================

    /// Insert a marker signal keyed by `signal_uid`; `false` when present.
    pub fn upsert_signal(&mut self, record: JsonMap) -> bool {
        let signal_uid = record
            .get("signal_uid")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let exists = self.signals.iter().any(|existing| {
            existing.get("signal_uid").and_then(Value::as_str) == Some(signal_uid.as_str())
        });
        if exists {
            return false;
        }
        self.signals.push(record);
        self.evict_signals();
        true
    }

    /// Append a propagating signal record (FIFO-capped).
    pub fn append_signal_record(&mut self, record: JsonMap) {
        self.signals.push(record);
        self.evict_signals();
    }

    fn evict_signals(&mut self) {
        if self.signals.len() > MAX_SIGNALS {
            let excess = self.signals.len() - MAX_SIGNALS;
            self.signals.drain(..excess);
        }
    }

    /// Insert a track keyed by `track_uid`; `false` when present.
    pub fn upsert_track(&mut self, record: JsonMap) -> bool {
        let track_uid = record
            .get("track_uid")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let exists = self.tracks.iter().any(|existing| {
            existing.get("track_uid").and_then(Value::as_str) == Some(track_uid.as_str())
        });
        if exists {
            return false;
        }
        self.tracks.push(record);
        true
    }

    pub fn append_spawn_descriptor(&mut self, record: JsonMap) {
        self.spawn_descriptors.push(record);
    }

    pub fn append_rumor(&mut self, record: &RumorRecord) -> SimResult<()> {
        record.validate()?;
        let value = serde_json::to_value(record)
            .map_err(|err| EngineError::InvalidPayload(format!("rumor record: {err}")))?;
        self.rumors.push(
            value
                .as_object()
                .expect("rumor record serializes to an object")
                .clone(),
        );
        Ok(())
    }

    pub fn get_sites_at_location(&self, space_id: &str, coord: CellCoord) -> Vec<&SiteRecord> {
        self.sites
            .values()
            .filter(|site| site.location.space_id == space_id && site.location.coord == coord)
            .collect()
    }

    // ========================================================================
    // Serialization
    // ========================================================================

    pub fn to_value(&self) -> Value {
        let overworld = self.overworld();
        let mut payload = JsonMap::new();
        payload.insert(
            "topology_type".into(),
            Value::String(overworld.topology_type.clone()),
        );
        payload.insert(
            "topology_params".into(),
            Value::Object(overworld.topology_params.clone()),
        );
        let hex_rows: Vec<Value> = overworld
            .hexes
            .iter()
            .map(|(coord, record)| {
                serde_json::json!({
                    "coord": {"q": coord.q, "r": coord.r},
                    "record": serde_json::to_value(record).expect("hex record serializes"),
                })
            })
            .collect();
        payload.insert("hexes".into(), Value::Array(hex_rows));

        let spaces: Vec<Value> = self.spaces.values().map(SpaceState::to_value).collect();
        payload.insert("spaces".into(), Value::Array(spaces));

        if !self.signals.is_empty() {
            let mut signals = self.signals.clone();
            signals.sort_by_key(|record| {
                record
                    .get("signal_id")
                    .or_else(|| record.get("signal_uid"))
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string()
            });
            payload.insert(
                "signals".into(),
                Value::Array(signals.into_iter().map(Value::Object).collect()),
            );
        }
        if !self.structure_occlusion.is_empty() {
            let mut edges = self.structure_occlusion.clone();
            edges.sort();
            payload.insert(
                "structure_occlusion".into(),
                Value::Array(
                    edges
                        .iter()
                        .map(|edge| serde_json::to_value(edge).expect("edge serializes"))
                        .collect(),
                ),
            );
        }
        if !self.tracks.is_empty() {
            let mut tracks = self.tracks.clone();
            tracks.sort_by_key(|record| {
                record
                    .get("track_uid")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string()
            });
            payload.insert(
                "tracks".into(),
                Value::Array(tracks.into_iter().map(Value::Object).collect()),
            );
        }
        if !self.spawn_descriptors.is_empty() {
            payload.insert(
                "spawn_descriptors".into(),
                Value::Array(
                    self.spawn_descriptors
                        .iter()
                        .cloned()
                        .map(Value::Object)
                        .collect(),
                ),
            );
        }
        if !self.rumors.is_empty() {
            payload.insert(
                "rumors".into(),
                Value::Array(self.rumors.iter().cloned().map(Value::Object).collect()),
            );
        }
        if !self.containers.is_empty() {
            let containers: JsonMap = self
                .containers
                .iter()
                .map(|(id, container)| (id.clone(), container.to_value()))
                .collect();
            payload.insert("containers".into(), Value::Object(containers));
        }
        if !self.sites.is_empty() {
            let sites: JsonMap = self
                .sites
                .iter()
                .map(|(id, site)| {
                    (id.clone(), serde_json::to_value(site).expect("site serializes"))
                })
                .collect();
            payload.insert("sites".into(), Value::Object(sites));
        }
        Value::Object(payload)
    }

    pub fn from_value(payload: &Value) -> SimResult<Self> {
        let root = payload
            .as_object()
            .ok_or_else(|| EngineError::InvalidPayload("world payload must be an object".into()))?;

        let mut world = match root.get("spaces") {
            None => {
                // Legacy payload: wrap top-level hexes into an implicit overworld.
                let topology_type = root
                    .get("topology_type")
                    .and_then(Value::as_str)
                    .unwrap_or("custom");
                let topology_params = root
                    .get("topology_params")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                let mut overworld = SpaceState::new(
                    DEFAULT_OVERWORLD_SPACE_ID,
                    topology_type,
                    CAMPAIGN_SPACE_ROLE,
                    topology_params,
                )?;
                if let Some(rows) = root.get("hexes").and_then(Value::as_array) {
                    for row in rows {
                        let row = row.as_object().ok_or_else(|| {
                            EngineError::InvalidPayload("hex row must be an object".into())
                        })?;
                        let coord = row
                            .get("coord")
                            .and_then(CellCoord::from_value)
                            .and_then(|c| c.as_hex())
                            .ok_or_else(|| {
                                EngineError::InvalidPayload("hex row invalid coord".into())
                            })?;
                        let record: HexRecord = serde_json::from_value(
                            row.get("record").cloned().unwrap_or(Value::Null),
                        )
                        .map_err(|err| EngineError::InvalidPayload(format!("hex record: {err}")))?;
                        record.validate()?;
                        overworld.hexes.insert(coord, record);
                    }
                }
                WorldState::from_overworld(overworld)?
            }
            Some(Value::Array(rows)) => {
                let mut spaces = BTreeMap::new();
                for row in rows {
                    let space = SpaceState::from_value(row)?;
                    spaces.insert(space.space_id.clone(), space);
                }
                if !spaces.contains_key(DEFAULT_OVERWORLD_SPACE_ID) {
                    return Err(EngineError::InvalidPayload(format!(
                        "spaces must include default '{DEFAULT_OVERWORLD_SPACE_ID}' space"
                    )));
                }
                let mut world = WorldState {
                    spaces,
                    signals: Vec::new(),
                    structure_occlusion: Vec::new(),
                    tracks: Vec::new(),
                    spawn_descriptors: Vec::new(),
                    rumors: Vec::new(),
                    containers: BTreeMap::new(),
                    sites: BTreeMap::new(),
                };
                world.ensure_closed_door_occlusion_defaults();
                world
            }
            Some(_) => {
                return Err(EngineError::InvalidPayload("spaces must be a list".into()))
            }
        };

        if let Some(rows) = root.get("signals") {
            let rows = rows
                .as_array()
                .ok_or_else(|| EngineError::InvalidPayload("signals must be a list".into()))?;
            for row in rows {
                let record = row
                    .as_object()
                    .ok_or_else(|| {
                        EngineError::InvalidPayload("signal record must be an object".into())
                    })?
                    .clone();
                world.signals.push(record);
            }
            world.evict_signals();
        }

        if let Some(rows) = root.get("structure_occlusion") {
            let rows = rows.as_array().ok_or_else(|| {
                EngineError::InvalidPayload("structure_occlusion must be a list".into())
            })?;
            for row in rows {
                let edge: OcclusionEdge = serde_json::from_value(row.clone()).map_err(|err| {
                    EngineError::InvalidPayload(format!("structure_occlusion entry: {err}"))
                })?;
                let (cell_a, cell_b) = canonical_edge_cells(edge.cell_a, edge.cell_b);
                if !cell_a.same_topology(&cell_b) {
                    return Err(EngineError::InvalidPayload(
                        "structure_occlusion edge coords must share the same topology keys".into(),
                    ));
                }
                world.structure_occlusion.push(OcclusionEdge {
                    cell_a,
                    cell_b,
                    ..edge
                });
            }
            if world.structure_occlusion.len() > MAX_OCCLUSION_EDGES {
                let excess = world.structure_occlusion.len() - MAX_OCCLUSION_EDGES;
                world.structure_occlusion.drain(..excess);
            }
            world.ensure_closed_door_occlusion_defaults();
        }

        if let Some(rows) = root.get("tracks") {
            let rows = rows
                .as_array()
                .ok_or_else(|| EngineError::InvalidPayload("tracks must be a list".into()))?;
            for row in rows {
                world.tracks.push(
                    row.as_object()
                        .ok_or_else(|| {
                            EngineError::InvalidPayload("track record must be an object".into())
                        })?
                        .clone(),
                );
            }
        }

        if let Some(rows) = root.get("spawn_descriptors") {
            let rows = rows.as_array().ok_or_else(|| {
                EngineError::InvalidPayload("spawn_descriptors must be a list".into())
            })?;
            for row in rows {
                world.spawn_descriptors.push(
                    row.as_object()
                        .ok_or_else(|| {
                            EngineError::InvalidPayload("spawn descriptor must be an object".into())
                        })?
                        .clone(),
                );
            }
        }

        if let Some(rows) = root.get("rumors") {
            let rows = rows
                .as_array()
                .ok_or_else(|| EngineError::InvalidPayload("rumors must be a list".into()))?;
            for row in rows {
                let record: RumorRecord = serde_json::from_value(row.clone())
                    .map_err(|err| EngineError::InvalidPayload(format!("rumor record: {err}")))?;
                world.append_rumor(&record)?;
            }
        }

        if let Some(rows) = root.get("containers") {
            let rows = rows
                .as_object()
                .ok_or_else(|| EngineError::InvalidPayload("containers must be an object".into()))?;
            for (container_id, row) in rows {
                let mut row = row
                    .as_object()
                    .ok_or_else(|| {
                        EngineError::InvalidPayload(format!(
                            "container '{container_id}' must be an object"
                        ))
                    })?
                    .clone();
                row.entry("container_id".to_string())
                    .or_insert_with(|| Value::String(container_id.clone()));
                let container = ContainerState::from_value(&Value::Object(row))?;
                if container.container_id != *container_id {
                    return Err(EngineError::InvalidPayload(format!(
                        "container key/id mismatch for '{container_id}'"
                    )));
                }
                world.containers.insert(container_id.clone(), container);
            }
        }

        if let Some(rows) = root.get("sites") {
            let rows = rows
                .as_object()
                .ok_or_else(|| EngineError::InvalidPayload("sites must be an object".into()))?;
            for (site_id, row) in rows {
                let mut row = row
                    .as_object()
                    .ok_or_else(|| {
                        EngineError::InvalidPayload(format!("site '{site_id}' must be an object"))
                    })?
                    .clone();
                row.entry("site_id".to_string())
                    .or_insert_with(|| Value::String(site_id.clone()));
                let site: SiteRecord = serde_json::from_value(Value::Object(row))
                    .map_err(|err| EngineError::InvalidPayload(format!("site record: {err}")))?;
                site.validate()?;
                if site.site_id != *site_id {
                    return Err(EngineError::InvalidPayload(format!(
                        "site key/id mismatch for '{site_id}'"
                    )));
                }
                if let Some(entrance) = &site.entrance {
                    if !world.spaces.contains_key(&entrance.target_space_id) {
                        return Err(EngineError::InvalidPayload(format!(
                            "site '{site_id}' entrance references missing space '{}'",
                            entrance.target_space_id
                        )));
                    }
                }
                world.sites.insert(site_id.clone(), site);
            }
        }

        Ok(world)
    }
}

//! # Store
//!
//! World-map and game-save persistence as canonical 2-space-indent JSON.
//!
//! ## Crash safety
//! Every write goes temp-file → fsync → rename → directory fsync, so a
//! crash mid-save leaves the previous file intact.

use std::fs::{self, File};
#[cfg(unix)]
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use hx_content::schema::{validate_save_payload, validate_world_payload};
use hx_core::canonical::pretty_string;
use hx_core::hash::{build_save_payload, save_hash, world_hash};
use hx_core::{Simulation, WorldState, SCHEMA_VERSION};

/// Persistence failures: I/O, malformed payloads, or hash mismatches.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0}")]
    Content(#[from] hx_content::ContentError),
    #[error("{0}")]
    Engine(#[from] hx_api::EngineError),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Write canonical pretty JSON atomically (tmp + fsync + rename + dir sync).
fn atomic_write_json(path: &Path, payload: &Value) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let serialized = pretty_string(payload);

    let temp_path = path.with_extension("json.tmp");
    {
        let mut file = File::create(&temp_path)?;
        file.write_all(serialized.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, path)?;

    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Ok(dir) = OpenOptions::new().read(true).open(parent) {
                let _ = dir.sync_all();
            }
        }
    }

    debug!(path = %path.display(), bytes = serialized.len(), "atomic write complete");
    Ok(())
}

// ============================================================================
// World maps
// ============================================================================

/// Load a world map, verifying its embedded `world_hash`.
pub fn load_world_json(path: impl AsRef<Path>) -> StoreResult<WorldState> {
    let raw = fs::read_to_string(path.as_ref())?;
    let payload: Value = serde_json::from_str(&raw)?;
    validate_world_payload(&payload)?;

    let world = WorldState::from_value(&payload)?;
    let stored = payload
        .get("world_hash")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let recomputed = world_hash(&world);
    if stored != recomputed {
        return Err(hx_api::EngineError::HashMismatch {
            kind: "world_hash",
            stored,
            recomputed,
        }
        .into());
    }
    info!(path = %path.as_ref().display(), "world map loaded");
    Ok(world)
}

/// Save a world map with a freshly computed `world_hash`.
pub fn save_world_json(path: impl AsRef<Path>, world: &WorldState) -> StoreResult<()> {
    let mut payload = world
        .to_value()
        .as_object()
        .expect("world payload is an object")
        .clone();
    payload.insert("schema_version".into(), Value::from(SCHEMA_VERSION));
    payload.insert("world_hash".into(), Value::String(world_hash(world)));
    let payload = Value::Object(payload);
    validate_world_payload(&payload)?;
    atomic_write_json(path.as_ref(), &payload)
}

// ============================================================================
// Game saves
// ============================================================================

/// Persist the full simulation save atomically.
pub fn save_game_json(path: impl AsRef<Path>, sim: &Simulation) -> StoreResult<()> {
    let payload = Value::Object(build_save_payload(sim));
    validate_save_payload(&payload)?;
    atomic_write_json(path.as_ref(), &payload)?;
    info!(path = %path.as_ref().display(), "save written");
    Ok(())
}

/// Load a save, verifying its embedded `save_hash`; unknown `metadata`
/// fields round-trip verbatim.
pub fn load_game_json(path: impl AsRef<Path>) -> StoreResult<Simulation> {
    let raw = fs::read_to_string(path.as_ref())?;
    let payload: Value = serde_json::from_str(&raw)?;
    validate_save_payload(&payload)?;
    let root = payload
        .as_object()
        .expect("validated as object");

    let stored = root
        .get("save_hash")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let recomputed = save_hash(root);
    if stored != recomputed {
        return Err(hx_api::EngineError::HashMismatch {
            kind: "save_hash",
            stored,
            recomputed,
        }
        .into());
    }

    let world = WorldState::from_value(
        root.get("world_state").expect("validated as present"),
    )?;
    let mut sim = Simulation::from_payload(
        world,
        root.get("simulation_state").expect("validated as present"),
        root.get("input_log").expect("validated as present"),
    )?;
    sim.set_save_metadata(root.get("metadata").and_then(Value::as_object).cloned());
    info!(path = %path.as_ref().display(), "save loaded");
    Ok(sim)
}

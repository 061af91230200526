//! # Events
//!
//! Facts scheduled on the simulation's tick timeline. Events are the only
//! mechanism for delayed effects: every "later" is an event at a future tick
//! plus an idempotence ledger entry, so a save/load cycle can never lose or
//! duplicate work.
//!
//! Event ids are `"evt-<counter>"` with a serialized monotonic counter;
//! within a tick events execute strictly in counter order.

use serde::{Deserialize, Serialize};

use hx_types::{JsonMap, Tick};

// Engine-level event types. Module-specific types live with their modules.
pub const NOOP: &str = "noop";
pub const DEBUG_MARKER: &str = "debug_marker";
pub const PERIODIC_TICK: &str = "periodic_tick";
pub const TRAVEL_STEP: &str = "travel_step";
pub const SPACE_TRANSITION: &str = "space_transition";
pub const SITE_ENTERED: &str = "site_entered";
pub const INVENTORY_OUTCOME: &str = "inventory_outcome";

pub const EVENT_ID_PREFIX: &str = "evt-";

/// A scheduled event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimEvent {
    /// Tick at which the event executes.
    pub tick: Tick,
    /// `"evt-<counter>"`, unique and monotonic across the simulation.
    pub event_id: String,
    pub event_type: String,
    #[serde(default)]
    pub params: JsonMap,
}

impl SimEvent {
    /// Numeric part of the event id; the within-tick ordering key.
    pub fn event_id_number(&self) -> u64 {
        self.event_id
            .strip_prefix(EVENT_ID_PREFIX)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0)
    }
}

/// Format an event id from the monotonic counter.
pub fn format_event_id(counter: u64) -> String {
    format!("{EVENT_ID_PREFIX}{counter}")
}

/// One executed-event record in the bounded trace.
///
/// `module_hooks_called` distinguishes entries appended synchronously by a
/// module (outside the drain loop) from entries the engine executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub tick: Tick,
    pub event_id: u64,
    pub event_type: String,
    pub params: JsonMap,
    pub module_hooks_called: bool,
}

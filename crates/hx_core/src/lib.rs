//! # hx_core
//!
//! Pure simulation logic - the sanctuary.
//! This crate contains deterministic game logic with no I/O.
//!
//! ## Rules
//! - No async runtime
//! - No filesystem or network access
//! - No randomness from std (named MT19937 streams only)
//! - No time from std (the tick IS time)
//!
//! ## Determinism
//! Uses BTreeMap (not HashMap) everywhere in simulation state: iteration
//! order feeds the hash surface. Same world + seed + input log = same
//! `simulation_hash`, on every platform, across any save/load split.

pub mod canonical;
pub mod entity;
pub mod hash;
pub mod modules;
pub mod rng;
pub mod rules;
pub mod sim;
pub mod world;

pub use entity::{EntityState, Wound};
pub use rng::{derive_stream_seed, Mt19937, RngStreams, RNG_SIM_STREAM, RNG_WORLDGEN_STREAM};
pub use rules::RuleModule;
pub use sim::{Simulation, SimulationState};
pub use world::{SpaceState, WorldState};

/// Commands drained in one tick before the engine declares livelock.
pub const MAX_COMMANDS_PER_TICK: usize = 256;
/// Events executed in one tick before the engine declares livelock.
pub const MAX_EVENTS_PER_TICK: usize = 256;
/// Executed events retained in the bounded trace (FIFO eviction).
pub const MAX_EVENT_TRACE: usize = 512;
/// Wounds retained per entity (FIFO eviction).
pub const MAX_WOUNDS: usize = 16;
/// Affected entries retained per combat action.
pub const MAX_AFFECTED_PER_ACTION: usize = 16;
/// Combat outcomes retained in the bounded log (FIFO eviction).
pub const MAX_COMBAT_LOG: usize = 256;
/// Applied/executed action uids retained per ledger (FIFO eviction).
pub const MAX_EXECUTED_ACTION_UIDS: usize = 2048;
/// Save payload schema version.
pub const SCHEMA_VERSION: u64 = 1;

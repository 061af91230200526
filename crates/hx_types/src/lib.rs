//! # hx_types
//!
//! Stable primitive types used across the entire platform.
//! This crate has minimal dependencies and defines the fundamental building blocks.
//!
//! ## Design principles
//! - All types are serializable (serde)
//! - All types are deterministic (no hidden state)
//! - Copy types where sensible for performance

use std::ops::Add;

use serde::{Deserialize, Serialize};

pub mod coords;
pub mod json;

pub use coords::{
    axial_to_world_xy, distance_between_locations, hex_distance, hex_neighbor_direction,
    hex_neighbors, normalize_facing_token, normalized_vector, square_cell_to_world_xy,
    world_xy_to_axial, world_xy_to_square_cell, CellCoord, HexCoord, LocationRef, HEX_DIRECTIONS,
    OVERWORLD_HEX_TOPOLOGY, SQUARE_GRID_TOPOLOGY,
};
pub use json::JsonMap;

/// The default campaign-plane space every world must contain.
pub const DEFAULT_OVERWORLD_SPACE_ID: &str = "overworld";

// ============================================================================
// Time & Tick
// ============================================================================

/// A simulation tick - the fundamental unit of time in the simulation.
/// The simulation advances tick by tick, deterministically.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Tick(pub u64);

impl Tick {
    pub const ZERO: Tick = Tick(0);

    #[inline]
    pub fn next(self) -> Tick {
        Tick(self.0.saturating_add(1))
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Add<u64> for Tick {
    type Output = Tick;

    #[inline]
    fn add(self, rhs: u64) -> Tick {
        Tick(self.0.saturating_add(rhs))
    }
}

impl std::fmt::Display for Tick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Calendar parameters for deriving day/tick-in-day from the raw tick.
///
/// ## Invariant
/// All time references are in **simulated ticks**, never real-world time.
/// The core never accesses the system clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeState {
    /// Number of ticks in one in-world day.
    pub ticks_per_day: u64,
    /// Tick at which day 0 begins.
    pub epoch_tick: u64,
}

impl TimeState {
    pub const DEFAULT_TICKS_PER_DAY: u64 = 240;

    /// Day index for a tick (ticks before the epoch count as day 0).
    pub fn day_index(&self, tick: Tick) -> u64 {
        tick.as_u64().saturating_sub(self.epoch_tick) / self.ticks_per_day
    }

    /// Position of a tick within its day.
    pub fn tick_in_day(&self, tick: Tick) -> u64 {
        tick.as_u64().saturating_sub(self.epoch_tick) % self.ticks_per_day
    }
}

impl Default for TimeState {
    fn default() -> Self {
        TimeState {
            ticks_per_day: Self::DEFAULT_TICKS_PER_DAY,
            epoch_tick: 0,
        }
    }
}

// ============================================================================
// Seeds
// ============================================================================

/// Master seed for deterministic RNG stream derivation. Must be explicitly provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MasterSeed(pub u64);

impl MasterSeed {
    #[inline]
    pub fn new(seed: u64) -> Self {
        MasterSeed(seed)
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for MasterSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "seed:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_ordering() {
        assert!(Tick(1) < Tick(2));
        assert_eq!(Tick(5).next(), Tick(6));
        assert_eq!(Tick(5) + 3, Tick(8));
    }

    #[test]
    fn day_derivation_default_epoch() {
        let time = TimeState::default();
        assert_eq!(time.day_index(Tick(0)), 0);
        assert_eq!(time.tick_in_day(Tick(239)), 239);
        assert_eq!(time.day_index(Tick(240)), 1);
        assert_eq!(time.tick_in_day(Tick(240)), 0);
    }

    #[test]
    fn day_derivation_with_epoch_offset() {
        let time = TimeState {
            ticks_per_day: 240,
            epoch_tick: 10,
        };
        assert_eq!(time.day_index(Tick(10)), 0);
        assert_eq!(time.tick_in_day(Tick(249)), 239);
        assert_eq!(time.day_index(Tick(250)), 1);
    }
}

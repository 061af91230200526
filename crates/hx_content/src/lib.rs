//! # hx_content
//!
//! Read-only content registries loaded from disk once and injected into the
//! simulation at construction. Registries never change during a run and are
//! deliberately outside the hash surface.
//!
//! Each registry validates its payload eagerly and rejects with a
//! [`ContentError`] before anything is mutated.

use thiserror::Error;

pub mod encounters;
pub mod items;
pub mod local_arenas;
pub mod schema;
pub mod supplies;

pub use encounters::{EncounterEntry, EncounterTable};
pub use items::{ItemDef, ItemRegistry};
pub use local_arenas::{LocalArenaTemplate, LocalArenaTemplateRegistry};
pub use supplies::{SupplyConsumeDef, SupplyProfileDef, SupplyProfileRegistry};

/// Schema version shared by every content payload family.
pub const CONTENT_SCHEMA_VERSION: u64 = 1;

/// Content payload rejection. Nothing is mutated when this surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ContentError(pub String);

impl ContentError {
    pub fn new(message: impl Into<String>) -> Self {
        ContentError(message.into())
    }
}

pub type ContentResult<T> = Result<T, ContentError>;

/// The full set of registries a simulation consumes.
#[derive(Debug, Clone)]
pub struct ContentPack {
    pub items: ItemRegistry,
    pub supply_profiles: SupplyProfileRegistry,
    pub encounter_table: EncounterTable,
    pub local_arenas: LocalArenaTemplateRegistry,
}

impl ContentPack {
    /// A small built-in pack for tests and bootstrap saves: a handful of
    /// stackable items, one traveler supply profile, the basic encounter
    /// table, and a single default arena.
    pub fn minimal() -> Self {
        ContentPack {
            items: items::builtin_basic_items(),
            supply_profiles: supplies::builtin_traveler_profiles(),
            encounter_table: encounters::builtin_basic_table(),
            local_arenas: local_arenas::builtin_default_arenas(),
        }
    }
}

//! # hx_infra
//!
//! Real I/O around the core: crash-safe save files and tracing setup.
//! Everything behind this boundary is allowed to touch the filesystem;
//! nothing inside `hx_core` is.

pub mod observability;
pub mod store;

pub use store::{
    load_game_json, load_world_json, save_game_json, save_world_json, StoreError, StoreResult,
};

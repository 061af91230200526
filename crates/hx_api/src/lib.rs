//! # hx_api
//!
//! Internal API definitions: commands, events, and errors.
//! This is the stable language used within the platform.

pub mod commands;
pub mod errors;
pub mod events;

pub use commands::SimCommand;
pub use errors::{EngineError, SimResult};
pub use events::{SimEvent, TraceEntry};

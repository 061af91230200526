//! # hx_tools
//!
//! Deterministic replay of saves with hash comparison.
//!
//! ## Purpose
//! - Verify determinism by re-running a save's recorded input log
//! - Compare state hashes at checkpoints
//! - Debug divergence issues

pub mod replay;

pub use replay::{replay_save, ReplayOptions, ReplayReport, ToolError, ToolResult};

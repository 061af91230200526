//! # Errors
//!
//! Typed errors for the two failure classes that are allowed to surface as
//! `Err`: load-time validation rejections and fatal engine violations.
//!
//! Intent rejections are NOT errors - they are outcome events with stable
//! reason strings, observable in the event trace.

use thiserror::Error;

/// Result type for engine operations.
pub type SimResult<T> = Result<T, EngineError>;

/// Fatal engine violations and load-time validation failures.
///
/// A fatal violation terminates the tick mid-flight; the caller must discard
/// the simulation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Per-tick command drain cap hit (livelock guard).
    #[error("MAX_COMMANDS_PER_TICK exceeded at tick {tick} (cap {cap})")]
    CommandCapExceeded { tick: u64, cap: usize },

    /// Per-tick event drain cap hit (livelock guard).
    #[error("MAX_EVENTS_PER_TICK exceeded at tick {tick} (cap {cap})")]
    EventCapExceeded { tick: u64, cap: usize },

    #[error("duplicate rule module registration: {0}")]
    DuplicateModule(String),

    #[error("periodic task {task}: {detail}")]
    PeriodicTask { task: String, detail: String },

    #[error("rules-state for module {module}: {detail}")]
    InvalidRulesState { module: String, detail: String },

    /// Malformed world/save/simulation payload at load time.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("{kind} mismatch while loading (stored={stored}, recomputed={recomputed})")]
    HashMismatch {
        kind: &'static str,
        stored: String,
        recomputed: String,
    },

    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_errors_name_their_guard() {
        let err = EngineError::EventCapExceeded { tick: 9, cap: 256 };
        assert!(err.to_string().contains("MAX_EVENTS_PER_TICK"));

        let err = EngineError::CommandCapExceeded { tick: 9, cap: 256 };
        assert!(err.to_string().contains("MAX_COMMANDS_PER_TICK"));
    }
}

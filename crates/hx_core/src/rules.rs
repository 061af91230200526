//! # Rule-module substrate
//!
//! Rule modules are registered on a [`Simulation`] and executed in stable
//! registration order for every lifecycle hook. A module's persistent state
//! lives exclusively in its `rules_state` partition and must round-trip
//! through save/load; the struct itself holds only immutable configuration
//! (content registries injected at construction).

use hx_api::{SimCommand, SimEvent, SimResult};
use hx_types::Tick;

use crate::sim::Simulation;

/// Lifecycle hooks for one named collaborator.
///
/// Registration order is part of the protocol contract. During a hook the
/// module is detached from the simulation, so hooks receive `&mut Simulation`
/// without aliasing.
pub trait RuleModule {
    /// Stable unique module name; keys the `rules_state` partition.
    fn name(&self) -> &'static str;

    /// Called once, immediately when the module is registered.
    fn on_simulation_start(&mut self, _sim: &mut Simulation) -> SimResult<()> {
        Ok(())
    }

    /// Called at the start of each authoritative simulation tick.
    fn on_tick_start(&mut self, _sim: &mut Simulation, _tick: Tick) -> SimResult<()> {
        Ok(())
    }

    /// Called at the end of each authoritative simulation tick.
    fn on_tick_end(&mut self, _sim: &mut Simulation, _tick: Tick) -> SimResult<()> {
        Ok(())
    }

    /// Called for each command at its scheduled tick; return `true` when the
    /// module owns the command (later modules and the built-in router are
    /// skipped).
    fn on_command(
        &mut self,
        _sim: &mut Simulation,
        _command: &SimCommand,
        _command_index: usize,
    ) -> SimResult<bool> {
        Ok(false)
    }

    /// Called after each event executes on its scheduled tick.
    fn on_event_executed(&mut self, _sim: &mut Simulation, _event: &SimEvent) -> SimResult<()> {
        Ok(())
    }
}

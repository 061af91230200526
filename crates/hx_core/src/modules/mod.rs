//! # Rule modules
//!
//! The extension modules that give the kernel its game semantics. Everything
//! here follows the same discipline: commands validate and schedule execute
//! events, execute events mutate through simulation APIs behind an
//! action-uid ledger, and outcomes land back on the event timeline.

use hx_api::SimResult;
use hx_content::ContentPack;

use crate::sim::Simulation;

pub mod combat;
pub mod encounter;
pub mod entity_stats;
pub mod execution;
pub mod exploration;
pub mod interaction;
pub mod local_encounter;
pub mod rumor;
pub mod signals;
pub mod spawn;
pub mod supply;

/// Register the standard module set in its contractual order.
pub fn install_standard_modules(sim: &mut Simulation, content: &ContentPack) -> SimResult<()> {
    sim.set_known_item_ids(content.items.item_ids());
    sim.register_rule_module(Box::new(signals::SignalPropagationModule::new()))?;
    sim.register_rule_module(Box::new(combat::CombatExecutionModule::new()))?;
    sim.register_rule_module(Box::new(interaction::InteractionExecutionModule::new()))?;
    sim.register_rule_module(Box::new(exploration::ExplorationExecutionModule::new()))?;
    sim.register_rule_module(Box::new(entity_stats::EntityStatsExecutionModule::new()))?;
    sim.register_rule_module(Box::new(supply::SupplyConsumptionModule::new(
        content.supply_profiles.clone(),
        content.items.item_ids(),
    )))?;
    sim.register_rule_module(Box::new(encounter::EncounterCheckModule::new()))?;
    sim.register_rule_module(Box::new(encounter::EncounterSelectionModule::new(
        content.encounter_table.clone(),
    )))?;
    sim.register_rule_module(Box::new(encounter::EncounterActionModule::new()))?;
    sim.register_rule_module(Box::new(execution::EncounterActionExecutionModule::new()))?;
    sim.register_rule_module(Box::new(local_encounter::LocalEncounterRequestModule::new()))?;
    sim.register_rule_module(Box::new(local_encounter::LocalEncounterInstanceModule::new(
        content.local_arenas.clone(),
    )))?;
    sim.register_rule_module(Box::new(rumor::RumorPipelineModule::new()))?;
    sim.register_rule_module(Box::new(spawn::SpawnMaterializationModule::new()))?;
    Ok(())
}

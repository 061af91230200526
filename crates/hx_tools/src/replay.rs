//! # Replay
//!
//! Load a save, reinstall the standard modules, and advance the recorded
//! timeline. The report carries everything the CLI prints: per-tick hash
//! checkpoints, an input-log summary, and world artifact counts.

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;
use tracing::info;

use hx_content::ContentPack;
use hx_core::hash::simulation_hash;
use hx_core::modules::install_standard_modules;
use hx_core::Simulation;
use hx_infra::{load_game_json, save_game_json, StoreError};
use hx_types::Tick;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    Engine(#[from] hx_api::EngineError),
}

pub type ToolResult<T> = Result<T, ToolError>;

/// Knobs for one replay run.
#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    /// Ticks to advance; defaults to one past the last recorded command.
    pub ticks: Option<u64>,
    /// Collect a `(tick, simulation_hash)` checkpoint after every tick.
    pub per_tick: bool,
    /// Re-save the final state here after the run.
    pub dump_final_save: Option<std::path::PathBuf>,
}

/// Everything a replay run observed.
#[derive(Debug, Clone)]
pub struct ReplayReport {
    pub ticks_advanced: u64,
    pub final_tick: Tick,
    pub simulation_hash: String,
    pub checkpoints: Vec<(Tick, String)>,
    pub input_summary: BTreeMap<String, usize>,
    pub artifacts: ArtifactCounts,
}

/// World artifact counts after the run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactCounts {
    pub entities: usize,
    pub signals: usize,
    pub tracks: usize,
    pub rumors: usize,
    pub spawn_descriptors: usize,
    pub containers: usize,
}

fn artifact_counts(sim: &Simulation) -> ArtifactCounts {
    ArtifactCounts {
        entities: sim.state.entities.len(),
        signals: sim.state.world.signals.len(),
        tracks: sim.state.world.tracks.len(),
        rumors: sim.state.world.rumors.len(),
        spawn_descriptors: sim.state.world.spawn_descriptors.len(),
        containers: sim.state.world.containers.len(),
    }
}

fn input_summary(sim: &Simulation) -> BTreeMap<String, usize> {
    let mut summary = BTreeMap::new();
    for command in sim.input_log() {
        *summary.entry(command.command_type.clone()).or_insert(0) += 1;
    }
    summary
}

/// Ticks needed to drain every recorded command from the current tick.
fn default_ticks(sim: &Simulation) -> u64 {
    let last_command_tick = sim
        .input_log()
        .iter()
        .map(|command| command.tick.as_u64())
        .max()
        .unwrap_or(0);
    (last_command_tick + 1).saturating_sub(sim.state.tick.as_u64())
}

/// Load, re-register modules, advance, and report.
pub fn replay_save(
    save_path: impl AsRef<Path>,
    content: &ContentPack,
    options: &ReplayOptions,
) -> ToolResult<ReplayReport> {
    let mut sim = load_game_json(save_path.as_ref())?;
    install_standard_modules(&mut sim, content)?;

    let ticks = options.ticks.unwrap_or_else(|| default_ticks(&sim));
    info!(ticks, from_tick = %sim.state.tick, "replaying save");

    let mut checkpoints = Vec::new();
    if options.per_tick {
        for _ in 0..ticks {
            sim.advance_ticks(1)?;
            checkpoints.push((sim.state.tick, simulation_hash(&sim)));
        }
    } else {
        sim.advance_ticks(ticks)?;
    }

    if let Some(dump_path) = &options.dump_final_save {
        save_game_json(dump_path, &sim)?;
    }

    Ok(ReplayReport {
        ticks_advanced: ticks,
        final_tick: sim.state.tick,
        simulation_hash: simulation_hash(&sim),
        checkpoints,
        input_summary: input_summary(&sim),
        artifacts: artifact_counts(&sim),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hx_api::commands;
    use hx_api::SimCommand;
    use hx_testkit::TestScenario;
    use hx_types::JsonMap;
    use serde_json::json;

    fn scripted_save(dir: &Path, seed: u64) -> std::path::PathBuf {
        let mut sim = TestScenario::hex_disk(seed)
            .with_entity("runner", 0, 0)
            .with_standard_modules()
            .build();
        sim.append_command(SimCommand::new(
            Tick(0),
            Some("runner"),
            commands::SET_MOVE_VECTOR,
            json!({"x": 1.0, "y": 0.0}).as_object().unwrap().clone(),
        ));
        sim.append_command(SimCommand::new(
            Tick(5),
            Some("runner"),
            commands::STOP,
            JsonMap::new(),
        ));
        let path = dir.join("scripted.json");
        save_game_json(&path, &sim).unwrap();
        path
    }

    #[test]
    fn replay_is_deterministic_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = scripted_save(dir.path(), 17);

        let options = ReplayOptions {
            ticks: Some(12),
            ..Default::default()
        };
        let content = ContentPack::minimal();
        let first = replay_save(&path, &content, &options).unwrap();
        let second = replay_save(&path, &content, &options).unwrap();

        assert_eq!(first.simulation_hash, second.simulation_hash);
        assert_eq!(first.final_tick, Tick(12));
        assert_eq!(first.input_summary["set_move_vector"], 1);
        assert_eq!(first.input_summary["stop"], 1);
    }

    #[test]
    fn per_tick_checkpoints_cover_every_tick() {
        let dir = tempfile::tempdir().unwrap();
        let path = scripted_save(dir.path(), 18);

        let options = ReplayOptions {
            ticks: Some(6),
            per_tick: true,
            ..Default::default()
        };
        let report = replay_save(&path, &ContentPack::minimal(), &options).unwrap();
        assert_eq!(report.checkpoints.len(), 6);
        assert_eq!(report.checkpoints.last().unwrap().0, Tick(6));
        assert_eq!(
            report.checkpoints.last().unwrap().1,
            report.simulation_hash
        );
    }

    #[test]
    fn default_ticks_drains_the_input_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = scripted_save(dir.path(), 19);

        let report =
            replay_save(&path, &ContentPack::minimal(), &ReplayOptions::default()).unwrap();
        // Last command sits at tick 5, so the default run covers 6 ticks.
        assert_eq!(report.ticks_advanced, 6);
    }

    #[test]
    fn dump_final_save_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = scripted_save(dir.path(), 20);
        let dump = dir.path().join("final.json");

        let options = ReplayOptions {
            ticks: Some(4),
            dump_final_save: Some(dump.clone()),
            ..Default::default()
        };
        let report = replay_save(&path, &ContentPack::minimal(), &options).unwrap();

        let reloaded = load_game_json(&dump).unwrap();
        assert_eq!(simulation_hash(&reloaded), report.simulation_hash);
    }

    #[test]
    fn split_replay_matches_straight_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = scripted_save(dir.path(), 21);
        let midpoint = dir.path().join("midpoint.json");

        let content = ContentPack::minimal();
        let straight = replay_save(
            &path,
            &content,
            &ReplayOptions {
                ticks: Some(10),
                ..Default::default()
            },
        )
        .unwrap();

        replay_save(
            &path,
            &content,
            &ReplayOptions {
                ticks: Some(4),
                dump_final_save: Some(midpoint.clone()),
                ..Default::default()
            },
        )
        .unwrap();
        let resumed = replay_save(
            &midpoint,
            &content,
            &ReplayOptions {
                ticks: Some(6),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(
            resumed.simulation_hash, straight.simulation_hash,
            "advance_ticks(10) must equal advance_ticks(4) + save/load + advance_ticks(6)"
        );
    }

    #[test]
    fn load_game_json_reexport_is_usable() {
        let dir = tempfile::tempdir().unwrap();
        let path = scripted_save(dir.path(), 22);
        let sim = load_game_json(&path).unwrap();
        assert_eq!(sim.state.tick, Tick(0));
    }
}

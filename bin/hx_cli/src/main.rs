//! # hx_cli
//!
//! Operator CLI for the simulation core.
//!
//! ## Commands
//! - `new-save-from-map`: bootstrap a save from a world map
//! - `replay`: re-run a save's recorded input log and report hashes

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use hx_content::ContentPack;
use hx_core::hash::{simulation_hash, world_hash};
use hx_core::modules::install_standard_modules;
use hx_core::Simulation;
use hx_infra::{load_world_json, observability, save_game_json};
use hx_tools::{replay_save, ReplayOptions};
use hx_types::MasterSeed;

/// Hexcrawl CLI - bootstrap and replay deterministic saves
#[derive(Parser)]
#[command(name = "hx_cli")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level for stderr diagnostics
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a fresh save from a world map JSON file
    NewSaveFromMap {
        /// World map JSON (validated against its embedded world_hash)
        map: PathBuf,

        /// Destination save path
        save: PathBuf,

        /// Master seed for RNG stream derivation
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Overwrite an existing save
        #[arg(long)]
        force: bool,

        /// Print world/save hashes and artifact counts
        #[arg(long)]
        print_summary: bool,
    },

    /// Replay a save's recorded input log
    Replay {
        /// Save JSON (validated against its embedded save_hash)
        save: PathBuf,

        /// Ticks to advance (default: one past the last recorded command)
        #[arg(long)]
        ticks: Option<u64>,

        /// Print a simulation hash after every tick
        #[arg(long)]
        per_tick: bool,

        /// Print a per-command-type input log summary
        #[arg(long)]
        print_input_summary: bool,

        /// Print world artifact counts after the run
        #[arg(long)]
        print_artifacts: bool,

        /// Write the post-run state to this path
        #[arg(long)]
        dump_final_save: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    observability::init_tracing(&cli.log_level);

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands) -> Result<(), String> {
    match command {
        Commands::NewSaveFromMap {
            map,
            save,
            seed,
            force,
            print_summary,
        } => new_save_from_map(&map, &save, seed, force, print_summary),
        Commands::Replay {
            save,
            ticks,
            per_tick,
            print_input_summary,
            print_artifacts,
            dump_final_save,
        } => replay(
            &save,
            ReplayOptions {
                ticks,
                per_tick,
                dump_final_save,
            },
            print_input_summary,
            print_artifacts,
        ),
    }
}

fn new_save_from_map(
    map: &PathBuf,
    save: &PathBuf,
    seed: u64,
    force: bool,
    print_summary: bool,
) -> Result<(), String> {
    if save.exists() && !force {
        return Err(format!(
            "save already exists: {} (use --force to overwrite)",
            save.display()
        ));
    }

    let world = load_world_json(map).map_err(|err| err.to_string())?;
    let mut sim = Simulation::new(world, MasterSeed(seed));
    let content = ContentPack::minimal();
    install_standard_modules(&mut sim, &content).map_err(|err| err.to_string())?;
    save_game_json(save, &sim).map_err(|err| err.to_string())?;

    if print_summary {
        println!("world_hash: {}", world_hash(&sim.state.world));
        println!("simulation_hash: {}", simulation_hash(&sim));
        println!("spaces: {}", sim.state.world.spaces.len());
        println!("entities: {}", sim.state.entities.len());
        println!("save: {}", save.display());
    }
    Ok(())
}

fn replay(
    save: &PathBuf,
    options: ReplayOptions,
    print_input_summary: bool,
    print_artifacts: bool,
) -> Result<(), String> {
    let content = ContentPack::minimal();
    let report = replay_save(save, &content, &options).map_err(|err| err.to_string())?;

    if options.per_tick {
        for (tick, hash) in &report.checkpoints {
            println!("{tick}: {hash}");
        }
    }
    println!("ticks_advanced: {}", report.ticks_advanced);
    println!("final_tick: {}", report.final_tick);
    println!("simulation_hash: {}", report.simulation_hash);

    if print_input_summary {
        for (command_type, count) in &report.input_summary {
            println!("input {command_type}: {count}");
        }
    }
    if print_artifacts {
        let artifacts = &report.artifacts;
        println!("entities: {}", artifacts.entities);
        println!("signals: {}", artifacts.signals);
        println!("tracks: {}", artifacts.tracks);
        println!("rumors: {}", artifacts.rumors);
        println!("spawn_descriptors: {}", artifacts.spawn_descriptors);
        println!("containers: {}", artifacts.containers);
    }
    Ok(())
}

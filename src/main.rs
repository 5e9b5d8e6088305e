// Copyright (C) 2025 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::error::Error;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use beatpad::audio;
use beatpad::catalog::{Catalog, Category};
use beatpad::config::EngineConfig;
use beatpad::sequencer::Pattern;
use beatpad::transport::STEPS_PER_BAR;
use beatpad::util::duration_minutes_seconds;
use beatpad::Engine;
use clap::{crate_version, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// How long `pad` lets a one-shot ring before tearing down.
const PAD_RING_TIME: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "A 16-pad drum machine and step sequencer."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lists the available audio output devices.
    Devices {},
    /// Lists the sounds in the catalog.
    Sounds {
        /// A catalog YAML file. The built-in catalog is listed when unset.
        #[arg(short, long)]
        catalog: Option<PathBuf>,
    },
    /// Plays the sequencer for a number of bars.
    Play {
        /// The path to the engine config.
        config_path: PathBuf,
        /// Number of bars to play.
        #[arg(short, long, default_value_t = 2)]
        bars: u32,
        /// The tempo. Uses the stored tempo when unset.
        #[arg(long)]
        bpm: Option<f64>,
        /// Pattern rows, one per pad starting at pad 0, e.g. x...x...x...x... Uses the stored
        /// pattern when unset.
        #[arg(short, long)]
        steps: Vec<String>,
        /// Record the master output and write it to the recordings directory.
        #[arg(short, long)]
        record: bool,
    },
    /// Plays a single pad.
    Pad {
        /// The path to the engine config.
        config_path: PathBuf,
        /// The pad index, 0 to 15.
        index: usize,
    },
}

/// Creates an engine and loads its sounds, reporting any that failed.
fn load_engine(config_path: &Path) -> Result<Engine, Box<dyn Error>> {
    let engine = Engine::new(EngineConfig::deserialize(config_path)?)?;
    let summary = engine.load_sounds()?;
    println!(
        "Loaded {} sounds ({} failed{}).",
        summary.loaded,
        summary.failed,
        if summary.timed_out { ", timed out" } else { "" }
    );
    for error in engine.load_errors() {
        println!("- {} ({}): {}", error.name, error.sound_id, error.error);
    }
    Ok(engine)
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices {} => {
            let devices = audio::list_devices()?;

            if devices.is_empty() {
                println!("No devices found.");
                return Ok(());
            }

            println!("Devices:");
            for device in devices {
                println!("- {}", device);
            }
        }
        Commands::Sounds { catalog } => {
            let catalog = match catalog {
                Some(path) => Catalog::from_file(&path)?,
                None => Catalog::builtin(),
            };

            println!("Sounds (count: {}):", catalog.len());
            for category in [Category::Drum, Category::Synth, Category::Fx] {
                let sounds = catalog.by_category(category);
                if sounds.is_empty() {
                    continue;
                }
                println!("\n{}:", category);
                for sound in sounds {
                    println!("- {}", sound);
                }
            }
        }
        Commands::Play {
            config_path,
            bars,
            bpm,
            steps,
            record,
        } => {
            let engine = load_engine(&config_path)?;
            if let Some(bpm) = bpm {
                engine.set_bpm(bpm);
            }
            if !steps.is_empty() {
                let rows: Vec<&str> = steps.iter().map(String::as_str).collect();
                engine.set_pattern(Pattern::parse(&rows)?);
            }
            print!("{}", engine.pattern());

            let step = Duration::from_secs_f64(60.0 / engine.bpm() / 4.0);
            let length = step * STEPS_PER_BAR as u32 * bars;
            println!(
                "Playing {} bars at {} bpm ({}).",
                bars,
                engine.bpm(),
                duration_minutes_seconds(length)
            );

            if record {
                engine.start_recording()?;
            }
            engine.start()?;
            thread::sleep(length);
            engine.stop();

            if record {
                engine.stop_recording()?;
                let path = engine.download_recording()?;
                println!("Recording written to {}.", path.display());
            }
            if let Some(fault) = engine.fault() {
                println!("Output fault: {}", fault);
            }
            engine.teardown();
        }
        Commands::Pad { config_path, index } => {
            let engine = load_engine(&config_path)?;
            match engine.play_pad(index)? {
                Some(_) => thread::sleep(PAD_RING_TIME),
                None => println!("Pad {} has no sound assigned.", index),
            }
            engine.teardown();
        }
    }

    Ok(())
}

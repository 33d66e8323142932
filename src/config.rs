//! Command-line configuration.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::engine::EngineConfig;
use crate::supervisor::SupervisorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Output {
    /// Emulate a Pro Controller to the console over Bluetooth.
    Bluetooth,
    /// No console; log what would be sent.
    Headless,
}

#[derive(Debug, Parser)]
#[command(name = "procon-mitm", about = "MITM bridge: USB Pro Controller -> console, with macros")]
pub struct Args {
    /// Macros directory path
    #[arg(long, default_value = "/root/macros")]
    pub macros_dir: PathBuf,

    /// Web UI port
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Where the console-facing output goes
    #[arg(long, value_enum, default_value_t = Output::Bluetooth)]
    pub output: Output,

    /// Number of macro slots
    #[arg(long, default_value_t = 8, value_parser = clap::value_parser!(u16).range(1..=64))]
    pub slots: u16,

    /// Initial playback speed multiplier
    #[arg(long, default_value_t = 1.0)]
    pub speed: f32,

    /// Skip the per-stick radial correction
    #[arg(long)]
    pub no_radial: bool,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            playback_speed: self.speed,
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            radial_profiles: !self.no_radial,
            ..SupervisorConfig::default()
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots as usize
    }
}

//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

pub fn json_mode() -> bool {
    JSON_MODE.get().copied().unwrap_or(false)
}

#[derive(Parser, Debug)]
#[command(name = "mmu", version, about = "Multi-material unit filament transport")]
pub struct Cli {
    /// Path to config TOML (typed)
    #[arg(long, value_name = "FILE", default_value = "etc/mmu_config.toml")]
    pub config: PathBuf,

    /// Optional per-gate calibration CSV (strict header); overrides [calibration] csv
    #[arg(long, value_name = "FILE")]
    pub calibration: Option<PathBuf>,

    /// Log and report as JSON lines instead of pretty
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Select this gate before running the command
    #[arg(long, value_name = "N", global = true, conflicts_with = "bypass")]
    pub gate: Option<usize>,

    /// Select the bypass path before running the command
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    pub bypass: bool,

    /// Treat the unit as mid-print (failures lock the unit)
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    pub printing: bool,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

/// Tip forming override for `unload`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum TipArg {
    None,
    /// The slicer already formed the tip
    Slicer,
    Standalone,
    Cut,
}

/// Purge override for `load`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum PurgeArg {
    None,
    Slicer,
    Standalone,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load filament from the selected gate to the nozzle
    Load {
        /// Bowden distance to move instead of the calibrated length
        #[arg(long, value_name = "MM")]
        length: Option<f64>,
        /// Stop at the end of the bowden
        #[arg(long, action = ArgAction::SetTrue)]
        skip_extruder: bool,
        /// Only load the extruder (filament already at the extruder entry)
        #[arg(long, action = ArgAction::SetTrue)]
        extruder_only: bool,
        /// Override the configured purge mode
        #[arg(long, value_enum, value_name = "MODE")]
        purge: Option<PurgeArg>,
    },
    /// Unload filament from the nozzle back to the gate
    Unload {
        /// Bowden distance to move instead of the calibrated length
        #[arg(long, value_name = "MM")]
        length: Option<f64>,
        /// Probe the filament before the bowden move
        #[arg(long, action = ArgAction::SetTrue)]
        check_state: bool,
        /// Only unload the extruder
        #[arg(long, action = ArgAction::SetTrue)]
        extruder_only: bool,
        /// Override the configured tip forming
        #[arg(long, value_enum, value_name = "MODE")]
        tip: Option<TipArg>,
    },
    /// Unload if needed, then push the filament out of the gate
    Eject,
    /// Re-derive the filament position from the sensors
    Recover {
        /// Only trust sensor evidence
        #[arg(long, action = ArgAction::SetTrue)]
        strict: bool,
        /// Do not heat the extruder for the buzz test
        #[arg(long, action = ArgAction::SetTrue)]
        no_heat: bool,
    },
    /// Print position, selection, sync and per-gate calibration
    Status,
    /// Report missing calibration for the given gates (default: all)
    CheckCalibration {
        /// Gates to check
        #[arg(long = "gates", value_name = "N", value_delimiter = ',')]
        gates: Vec<usize>,
    },
    /// Quick health check (configured sensors and encoder respond)
    SelfCheck,
}

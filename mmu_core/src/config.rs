//! Runtime configuration for the transport core.
//!
//! These are the structs the orchestrator reads at run time. They are
//! separate from the TOML schema in `mmu_config`; see `conversions`.

use std::fmt;
use std::str::FromStr;

use crate::error::{FaultKind, Stage, TransportFault};

/// Gate homing technique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GateEndstop {
    /// Filament is detected by encoder movement.
    #[default]
    Encoder,
    /// Shared gate sensor after the selector.
    GateSensor,
    /// Per-gate sensor right after the gear.
    GearSensor,
}

impl FromStr for GateEndstop {
    type Err = TransportFault;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "encoder" => Ok(Self::Encoder),
            "mmu_gate" => Ok(Self::GateSensor),
            "mmu_gear" => Ok(Self::GearSensor),
            other => Err(TransportFault::new(
                FaultKind::Config,
                Stage::Gate,
                format!("unknown gate homing endstop '{other}'"),
            )),
        }
    }
}

/// Extruder-entry homing technique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtruderEndstop {
    #[default]
    None,
    /// Stall detection from encoder movement under reduced gear current.
    Collision,
    /// Sensor just before the extruder gears.
    EntrySensor,
    /// Stepper stall ("touch") endstop on the gear.
    GearTouch,
}

impl FromStr for ExtruderEndstop {
    type Err = TransportFault;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "collision" => Ok(Self::Collision),
            "extruder" => Ok(Self::EntrySensor),
            "mmu_gear_touch" => Ok(Self::GearTouch),
            other => Err(TransportFault::new(
                FaultKind::Config,
                Stage::ExtruderHoming,
                format!("unknown extruder homing endstop '{other}'"),
            )),
        }
    }
}

impl fmt::Display for ExtruderEndstop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Collision => "collision",
            Self::EntrySensor => "extruder",
            Self::GearTouch => "mmu_gear_touch",
        })
    }
}

#[derive(Debug, Clone)]
pub struct UnitCfg {
    pub num_gates: usize,
    pub has_encoder: bool,
    pub has_filament_buffer: bool,
    pub variable_bowden_lengths: bool,
    pub variable_rotation_distances: bool,
}

impl Default for UnitCfg {
    fn default() -> Self {
        Self {
            num_gates: 4,
            has_encoder: true,
            has_filament_buffer: true,
            variable_bowden_lengths: false,
            variable_rotation_distances: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GateCfg {
    pub homing_endstop: GateEndstop,
    /// Maximum travel while looking for the gate endstop (mm).
    pub homing_max: f64,
    /// Distance to back off from the gate endstop when parking. Can be negative.
    pub parking_distance: f64,
    pub load_retries: u8,
    /// Extra retract after parking when ejecting (mm).
    pub final_eject_distance: f64,
    /// Mark gates as buffered after unload so the next load uses the fast speed.
    pub unload_to_buffer: bool,
}

impl Default for GateCfg {
    fn default() -> Self {
        Self {
            homing_endstop: GateEndstop::Encoder,
            homing_max: 100.0,
            parking_distance: 23.0,
            load_retries: 1,
            final_eject_distance: 0.0,
            unload_to_buffer: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BowdenCfg {
    /// Percentage of the calibrated length covered by the fast load move when
    /// extruder homing follows.
    pub fast_load_portion: f64,
    pub fast_unload_portion: f64,
    pub apply_correction: bool,
    /// Slippage (percent of move) tolerated silently.
    pub soft_tolerance_pct: f64,
    /// Slippage (percent of move) that aborts the load.
    pub hard_tolerance_pct: f64,
    pub pre_unload_test: bool,
    /// Percentage of the probe move that may go unmeasured.
    pub pre_unload_error_tolerance: f64,
}

impl Default for BowdenCfg {
    fn default() -> Self {
        Self {
            fast_load_portion: 95.0,
            fast_unload_portion: 95.0,
            apply_correction: false,
            soft_tolerance_pct: 10.0,
            hard_tolerance_pct: 80.0,
            pre_unload_test: false,
            pre_unload_error_tolerance: 100.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtruderCfg {
    pub homing_endstop: ExtruderEndstop,
    pub force_homing: bool,
    pub homing_max: f64,
    /// Collision step as a multiple of encoder resolution.
    pub collision_homing_step: u8,
    pub collision_homing_current: u8,
}

impl Default for ExtruderCfg {
    fn default() -> Self {
        Self {
            homing_endstop: ExtruderEndstop::None,
            force_homing: false,
            homing_max: 50.0,
            collision_homing_step: 3,
            collision_homing_current: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolheadCfg {
    pub homing_max: f64,
    pub sensor_to_nozzle: f64,
    pub extruder_to_nozzle: f64,
    /// Load the extruder with gear and extruder synced.
    pub sync_load: bool,
    pub sync_unload: bool,
    /// Synced move that hands filament from gear to extruder before an
    /// extruder-only load.
    pub transition_length: f64,
    pub unload_safety_margin: f64,
    /// Percentage of the final move the encoder may miss before the load is rejected.
    pub move_error_tolerance: f64,
    pub ignore_load_error: bool,
    /// Percentage of clog length to retract the gear by after loading.
    pub post_load_tighten: f64,
    pub post_load_tension_adjust: bool,
}

impl Default for ToolheadCfg {
    fn default() -> Self {
        Self {
            homing_max: 40.0,
            sensor_to_nozzle: 45.0,
            extruder_to_nozzle: 60.0,
            sync_load: true,
            sync_unload: false,
            transition_length: 10.0,
            unload_safety_margin: 10.0,
            move_error_tolerance: 60.0,
            ignore_load_error: false,
            post_load_tighten: 60.0,
            post_load_tension_adjust: true,
        }
    }
}

/// Speed (mm/s) and acceleration (mm/s²) table.
#[derive(Debug, Clone)]
pub struct SpeedCfg {
    pub gear_from_buffer_speed: f64,
    pub gear_from_buffer_accel: f64,
    pub gear_from_spool_speed: f64,
    pub gear_from_spool_accel: f64,
    pub gear_unload_speed: f64,
    pub gear_unload_accel: f64,
    pub gear_short_move_speed: f64,
    pub gear_short_move_accel: f64,
    pub gear_short_move_threshold: f64,
    pub gear_homing_speed: f64,
    pub gear_buzz_accel: f64,
    pub extruder_load_speed: f64,
    pub extruder_unload_speed: f64,
    pub extruder_sync_load_speed: f64,
    pub extruder_sync_unload_speed: f64,
    pub extruder_homing_speed: f64,
    pub extruder_accel: f64,
}

impl Default for SpeedCfg {
    fn default() -> Self {
        Self {
            gear_from_buffer_speed: 150.0,
            gear_from_buffer_accel: 400.0,
            gear_from_spool_speed: 60.0,
            gear_from_spool_accel: 100.0,
            gear_unload_speed: 60.0,
            gear_unload_accel: 100.0,
            gear_short_move_speed: 60.0,
            gear_short_move_accel: 400.0,
            gear_short_move_threshold: 100.0,
            gear_homing_speed: 150.0,
            gear_buzz_accel: 1000.0,
            extruder_load_speed: 15.0,
            extruder_unload_speed: 20.0,
            extruder_sync_load_speed: 20.0,
            extruder_sync_unload_speed: 25.0,
            extruder_homing_speed: 15.0,
            extruder_accel: 400.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncoderCfg {
    /// mm per encoder pulse.
    pub resolution: f64,
    /// Movement below this is treated as "no movement".
    pub min_movement: f64,
    pub move_step_size: f64,
    /// Movement that proves filament reached the encoder.
    pub load_threshold: f64,
    pub move_validation: bool,
}

impl Default for EncoderCfg {
    fn default() -> Self {
        Self {
            resolution: 0.7,
            min_movement: 0.5,
            move_step_size: 15.0,
            load_threshold: 6.0,
            move_validation: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncCfg {
    pub sync_to_extruder: bool,
    pub sync_form_tip: bool,
    pub sync_purge: bool,
    /// Keep synced outside a print while filament is in the extruder.
    pub standalone_sync: bool,
    /// Gear current percentage while following the extruder in a print.
    pub sync_gear_current: u8,
}

impl Default for SyncCfg {
    fn default() -> Self {
        Self {
            sync_to_extruder: false,
            sync_form_tip: false,
            sync_purge: false,
            standalone_sync: false,
            sync_gear_current: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CalibrationCfg {
    pub autotune_bowden_length: bool,
    pub autotune_rotation_distance: bool,
    pub default_rotation_distance: f64,
    pub telemetry_window: usize,
    /// Allowed deviation of the commanded/measured ratio from 1.0.
    pub ratio_band: f64,
    pub encoder_calibrated: bool,
    pub selector_calibrated: bool,
}

impl Default for CalibrationCfg {
    fn default() -> Self {
        Self {
            autotune_bowden_length: true,
            autotune_rotation_distance: false,
            default_rotation_distance: 22.7316868,
            telemetry_window: 10,
            ratio_band: 0.1,
            encoder_calibrated: true,
            selector_calibrated: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryCfg {
    /// Retries after a transient controller fault on a homing move.
    pub transient_retries: u8,
    /// Speed multiplier applied on each retry.
    pub speed_factor: f64,
}

impl Default for RetryCfg {
    fn default() -> Self {
        Self {
            transient_retries: 2,
            speed_factor: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TipCfg {
    pub ramming_length: f64,
    pub cooling_moves: u8,
    pub cooling_distance: f64,
    /// Final retract distance from the nozzle after forming (mm).
    pub park_distance: f64,
    /// Retract distance to the cutter blade.
    pub cut_position: f64,
}

impl Default for TipCfg {
    fn default() -> Self {
        Self {
            ramming_length: 5.0,
            cooling_moves: 4,
            cooling_distance: 15.0,
            park_distance: 20.0,
            cut_position: 30.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PurgeCfg {
    pub length: f64,
}

#[derive(Debug, Clone)]
pub struct SpoolAssistCfg {
    pub enabled: bool,
    pub min_distance: f64,
    pub max_stepper_speed: f64,
    pub max_power: u8,
    pub speed_exponent: f64,
}

impl Default for SpoolAssistCfg {
    fn default() -> Self {
        Self {
            enabled: false,
            min_distance: 50.0,
            max_stepper_speed: 300.0,
            max_power: 100,
            speed_exponent: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryCfg {
    /// Run a recovery pass after a failed sequence outside a print.
    pub auto_recover: bool,
    /// Half amplitude of the buzz oscillation (mm).
    pub buzz_distance: f64,
}

impl Default for RecoveryCfg {
    fn default() -> Self {
        Self {
            auto_recover: true,
            buzz_distance: 2.5,
        }
    }
}

/// Everything the orchestrator needs, grouped by stage.
#[derive(Debug, Clone, Default)]
pub struct TransportCfg {
    pub unit: UnitCfg,
    pub gate: GateCfg,
    pub bowden: BowdenCfg,
    pub extruder: ExtruderCfg,
    pub toolhead: ToolheadCfg,
    pub speeds: SpeedCfg,
    pub encoder: EncoderCfg,
    pub sync: SyncCfg,
    pub calibration: CalibrationCfg,
    pub retry: RetryCfg,
    pub tip: TipCfg,
    pub purge: PurgeCfg,
    pub spool_assist: SpoolAssistCfg,
    pub recovery: RecoveryCfg,
}

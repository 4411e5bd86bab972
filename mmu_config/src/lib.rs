#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schemas, calibration import and file persistence for the unit.
//!
//! - `Config` and its sections are deserialized from TOML and validated.
//! - `load_gate_calibration_csv` imports per-gate calibration with strict headers.
//! - `FileStore` is a `PersistenceStore` over a TOML file with atomic writes.
use serde::Deserialize;

pub mod calibration;
pub mod store;

pub use calibration::{GateCalibrationRow, load_gate_calibration_csv};
pub use store::FileStore;

/// Endstop names accepted by `[gate] homing_endstop`.
pub const GATE_ENDSTOPS: &[&str] = &["encoder", "mmu_gate", "mmu_gear"];
/// Endstop names accepted by `[extruder] homing_endstop`.
pub const EXTRUDER_ENDSTOPS: &[&str] = &["none", "collision", "extruder", "mmu_gear_touch"];

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Unit {
    pub num_gates: usize,
    pub has_encoder: bool,
    pub has_filament_buffer: bool,
    pub variable_bowden_lengths: bool,
    pub variable_rotation_distances: bool,
    /// Selector family: "linear" | "rotary" | "virtual" | "macro".
    pub selector: String,
    /// Persisted state file; when absent state lives in memory only.
    pub state_file: Option<String>,
}

impl Default for Unit {
    fn default() -> Self {
        Self {
            num_gates: 4,
            has_encoder: true,
            has_filament_buffer: true,
            variable_bowden_lengths: false,
            variable_rotation_distances: true,
            selector: "linear".to_string(),
            state_file: None,
        }
    }
}

/// Which optional sensors are fitted.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Sensors {
    pub gate: bool,
    pub gear: bool,
    pub extruder_entry: bool,
    pub toolhead: bool,
    pub gear_touch: bool,
    pub tension: bool,
    pub compression: bool,
}

impl Default for Sensors {
    fn default() -> Self {
        Self {
            gate: true,
            gear: false,
            extruder_entry: true,
            toolhead: true,
            gear_touch: true,
            tension: false,
            compression: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Gate {
    pub homing_endstop: String,
    pub homing_max: f64,
    pub parking_distance: f64,
    pub load_retries: u8,
    pub final_eject_distance: f64,
    pub unload_to_buffer: bool,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            homing_endstop: "encoder".to_string(),
            homing_max: 100.0,
            parking_distance: 23.0,
            load_retries: 1,
            final_eject_distance: 0.0,
            unload_to_buffer: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Bowden {
    pub fast_load_portion: f64,
    pub fast_unload_portion: f64,
    pub apply_correction: bool,
    pub soft_tolerance_pct: f64,
    pub hard_tolerance_pct: f64,
    pub pre_unload_test: bool,
    pub pre_unload_error_tolerance: f64,
}

impl Default for Bowden {
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

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Extruder {
    pub homing_endstop: String,
    pub force_homing: bool,
    pub homing_max: f64,
    pub collision_homing_step: u8,
    pub collision_homing_current: u8,
}

impl Default for Extruder {
    fn default() -> Self {
        Self {
            homing_endstop: "none".to_string(),
            force_homing: false,
            homing_max: 50.0,
            collision_homing_step: 3,
            collision_homing_current: 50,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Toolhead {
    pub homing_max: f64,
    pub sensor_to_nozzle: f64,
    pub extruder_to_nozzle: f64,
    pub sync_load: bool,
    pub sync_unload: bool,
    pub transition_length: f64,
    pub unload_safety_margin: f64,
    pub move_error_tolerance: f64,
    pub ignore_load_error: bool,
    pub post_load_tighten: f64,
    pub post_load_tension_adjust: bool,
}

impl Default for Toolhead {
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

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Speeds {
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

impl Default for Speeds {
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

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EncoderCfg {
    pub resolution: f64,
    pub min_movement: f64,
    pub move_step_size: f64,
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

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Sync {
    pub sync_to_extruder: bool,
    pub sync_form_tip: bool,
    pub sync_purge: bool,
    pub standalone_sync: bool,
    pub sync_gear_current: u8,
}

impl Default for Sync {
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

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Calibration {
    pub autotune_bowden_length: bool,
    pub autotune_rotation_distance: bool,
    pub default_rotation_distance: f64,
    pub telemetry_window: usize,
    pub ratio_band: f64,
    /// Encoder resolution and selector offsets are calibrated. Values saved
    /// in the state file take precedence once written.
    pub encoder_calibrated: bool,
    pub selector_calibrated: bool,
    /// Optional per-gate calibration CSV imported at startup.
    pub csv: Option<String>,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            autotune_bowden_length: true,
            autotune_rotation_distance: false,
            default_rotation_distance: 22.731_686_8,
            telemetry_window: 10,
            ratio_band: 0.1,
            encoder_calibrated: true,
            selector_calibrated: true,
            csv: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Retry {
    pub transient_retries: u8,
    pub speed_factor: f64,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            transient_retries: 2,
            speed_factor: 0.5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Tip {
    /// "none" | "slicer" | "standalone" | "cut"
    pub mode: String,
    pub ramming_length: f64,
    pub cooling_moves: u8,
    pub cooling_distance: f64,
    pub park_distance: f64,
    pub cut_position: f64,
}

impl Default for Tip {
    fn default() -> Self {
        Self {
            mode: "none".to_string(),
            ramming_length: 5.0,
            cooling_moves: 4,
            cooling_distance: 15.0,
            park_distance: 20.0,
            cut_position: 30.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Purge {
    /// "none" | "slicer" | "standalone"
    pub mode: Option<String>,
    pub length: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SpoolAssist {
    pub enabled: bool,
    pub min_distance: f64,
    pub max_stepper_speed: f64,
    pub max_power: u8,
    pub speed_exponent: f64,
}

impl Default for SpoolAssist {
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

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Recovery {
    pub auto_recover: bool,
    pub buzz_distance: f64,
    /// Allow the encoder buzz test (it moves the extruder).
    pub can_heat: bool,
}

impl Default for Recovery {
    fn default() -> Self {
        Self {
            auto_recover: true,
            buzz_distance: 2.5,
            can_heat: true,
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

/// Filament path used by the simulated unit (mm from the gate sensor).
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Simulation {
    pub gear_sensor_at: f64,
    pub encoder_at: f64,
    pub entry_sensor_at: f64,
    pub extruder_gears_at: f64,
    pub toolhead_sensor_at: f64,
    pub nozzle_at: f64,
    /// Where a fresh filament end sits before the first load.
    pub initial_tip: f64,
    /// Fraction of gear motion lost to slip (0.0..0.95).
    pub slip: f64,
}

impl Default for Simulation {
    fn default() -> Self {
        Self {
            gear_sensor_at: -8.0,
            encoder_at: 5.0,
            entry_sensor_at: 600.0,
            extruder_gears_at: 610.0,
            toolhead_sensor_at: 625.0,
            nozzle_at: 670.0,
            initial_tip: -12.0,
            slip: 0.0,
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Config {
    pub unit: Unit,
    pub sensors: Sensors,
    pub gate: Gate,
    pub bowden: Bowden,
    pub extruder: Extruder,
    pub toolhead: Toolhead,
    pub speeds: Speeds,
    pub encoder: EncoderCfg,
    pub sync: Sync,
    pub calibration: Calibration,
    pub retry: Retry,
    pub tip: Tip,
    pub purge: Purge,
    pub spool_assist: SpoolAssist,
    pub recovery: Recovery,
    pub logging: Logging,
    pub simulation: Simulation,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

fn pct(v: f64) -> bool {
    (0.0..=100.0).contains(&v)
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        // Unit
        if self.unit.num_gates == 0 {
            eyre::bail!("unit.num_gates must be >= 1");
        }
        if self.unit.num_gates > 64 {
            eyre::bail!("unit.num_gates is unreasonably large (>64)");
        }
        if !["linear", "rotary", "virtual", "macro"].contains(&self.unit.selector.as_str()) {
            eyre::bail!("unit.selector must be one of linear, rotary, virtual, macro");
        }

        // Gate
        if !GATE_ENDSTOPS.contains(&self.gate.homing_endstop.as_str()) {
            eyre::bail!("gate.homing_endstop must be one of {}", GATE_ENDSTOPS.join(", "));
        }
        if self.gate.homing_endstop == "encoder" && !self.unit.has_encoder {
            eyre::bail!("gate.homing_endstop = \"encoder\" requires unit.has_encoder");
        }
        if self.gate.homing_endstop == "mmu_gate" && !self.sensors.gate {
            eyre::bail!("gate.homing_endstop = \"mmu_gate\" requires sensors.gate");
        }
        if self.gate.homing_endstop == "mmu_gear" && !self.sensors.gear {
            eyre::bail!("gate.homing_endstop = \"mmu_gear\" requires sensors.gear");
        }
        if self.gate.homing_max <= 0.0 {
            eyre::bail!("gate.homing_max must be > 0");
        }
        if self.gate.final_eject_distance < 0.0 {
            eyre::bail!("gate.final_eject_distance must be >= 0");
        }

        // Bowden
        if !pct(self.bowden.fast_load_portion) || !pct(self.bowden.fast_unload_portion) {
            eyre::bail!(
                "bowden.fast_load_portion and bowden.fast_unload_portion must be in [0, 100]"
            );
        }
        if self.bowden.soft_tolerance_pct < 0.0 {
            eyre::bail!("bowden.soft_tolerance_pct must be >= 0");
        }
        if self.bowden.hard_tolerance_pct < self.bowden.soft_tolerance_pct {
            eyre::bail!("bowden.hard_tolerance_pct must be >= bowden.soft_tolerance_pct");
        }
        if !pct(self.bowden.pre_unload_error_tolerance) {
            eyre::bail!("bowden.pre_unload_error_tolerance must be in [0, 100]");
        }

        // Extruder
        let technique = self.extruder.homing_endstop.as_str();
        if !EXTRUDER_ENDSTOPS.contains(&technique) {
            eyre::bail!("extruder.homing_endstop must be one of {}", EXTRUDER_ENDSTOPS.join(", "));
        }
        if technique == "collision" && !self.unit.has_encoder {
            eyre::bail!("extruder.homing_endstop = \"collision\" requires unit.has_encoder");
        }
        if technique == "extruder" && !self.sensors.extruder_entry {
            eyre::bail!("extruder.homing_endstop = \"extruder\" requires sensors.extruder_entry");
        }
        if technique == "mmu_gear_touch" && !self.sensors.gear_touch {
            eyre::bail!("extruder.homing_endstop = \"mmu_gear_touch\" requires sensors.gear_touch");
        }
        if self.extruder.homing_max <= 0.0 {
            eyre::bail!("extruder.homing_max must be > 0");
        }
        if self.extruder.collision_homing_step == 0 {
            eyre::bail!("extruder.collision_homing_step must be >= 1");
        }
        if self.extruder.collision_homing_current > 100 {
            eyre::bail!("extruder.collision_homing_current must be <= 100");
        }

        // Toolhead
        if self.toolhead.homing_max <= 0.0 {
            eyre::bail!("toolhead.homing_max must be > 0");
        }
        if self.toolhead.sensor_to_nozzle < 0.0 || self.toolhead.extruder_to_nozzle < 0.0 {
            eyre::bail!("toolhead.sensor_to_nozzle and toolhead.extruder_to_nozzle must be >= 0");
        }
        if self.sensors.toolhead
            && self.toolhead.sensor_to_nozzle > self.toolhead.extruder_to_nozzle
        {
            eyre::bail!("toolhead.sensor_to_nozzle must be <= toolhead.extruder_to_nozzle");
        }
        if !pct(self.toolhead.move_error_tolerance) || !pct(self.toolhead.post_load_tighten) {
            eyre::bail!(
                "toolhead.move_error_tolerance and toolhead.post_load_tighten must be in [0, 100]"
            );
        }

        // Speeds
        let s = &self.speeds;
        for (name, v) in [
            ("gear_from_buffer_speed", s.gear_from_buffer_speed),
            ("gear_from_spool_speed", s.gear_from_spool_speed),
            ("gear_unload_speed", s.gear_unload_speed),
            ("gear_short_move_speed", s.gear_short_move_speed),
            ("gear_homing_speed", s.gear_homing_speed),
            ("extruder_load_speed", s.extruder_load_speed),
            ("extruder_unload_speed", s.extruder_unload_speed),
            ("extruder_sync_load_speed", s.extruder_sync_load_speed),
            ("extruder_sync_unload_speed", s.extruder_sync_unload_speed),
            ("extruder_homing_speed", s.extruder_homing_speed),
            ("extruder_accel", s.extruder_accel),
        ] {
            if !(v.is_finite() && v > 0.0) {
                eyre::bail!("speeds.{name} must be > 0");
            }
        }

        // Encoder
        if self.encoder.resolution <= 0.0 {
            eyre::bail!("encoder.resolution must be > 0");
        }
        if self.encoder.move_step_size <= 0.0 {
            eyre::bail!("encoder.move_step_size must be > 0");
        }
        if self.encoder.min_movement < 0.0 {
            eyre::bail!("encoder.min_movement must be >= 0");
        }

        // Sync
        if self.sync.sync_gear_current > 100 {
            eyre::bail!("sync.sync_gear_current must be <= 100");
        }

        // Calibration
        if self.calibration.default_rotation_distance <= 0.0 {
            eyre::bail!("calibration.default_rotation_distance must be > 0");
        }
        if self.calibration.telemetry_window == 0 {
            eyre::bail!("calibration.telemetry_window must be >= 1");
        }
        if !(self.calibration.ratio_band > 0.0 && self.calibration.ratio_band < 1.0) {
            eyre::bail!("calibration.ratio_band must be in (0.0, 1.0)");
        }

        // Retry
        if !(self.retry.speed_factor > 0.0 && self.retry.speed_factor <= 1.0) {
            eyre::bail!("retry.speed_factor must be in (0.0, 1.0]");
        }
        if self.retry.transient_retries > 10 {
            eyre::bail!("retry.transient_retries is unreasonably large (>10)");
        }

        // Tip / purge
        if !["none", "slicer", "standalone", "cut"].contains(&self.tip.mode.as_str()) {
            eyre::bail!("tip.mode must be one of none, slicer, standalone, cut");
        }
        if let Some(mode) = self.purge.mode.as_deref()
            && !["none", "slicer", "standalone"].contains(&mode)
        {
            eyre::bail!("purge.mode must be one of none, slicer, standalone");
        }
        if self.purge.length < 0.0 {
            eyre::bail!("purge.length must be >= 0");
        }

        // Spool assist
        if self.spool_assist.max_stepper_speed <= 0.0 {
            eyre::bail!("spool_assist.max_stepper_speed must be > 0");
        }
        if self.spool_assist.max_power > 100 {
            eyre::bail!("spool_assist.max_power must be <= 100");
        }

        // Recovery
        if self.recovery.buzz_distance <= 0.0 {
            eyre::bail!("recovery.buzz_distance must be > 0");
        }

        // Logging
        if let Some(r) = self.logging.rotation.as_deref()
            && !["never", "daily", "hourly"].contains(&r)
        {
            eyre::bail!("logging.rotation must be one of never, daily, hourly");
        }

        // Simulation
        let sim = &self.simulation;
        if !(sim.entry_sensor_at < sim.extruder_gears_at
            && sim.extruder_gears_at < sim.toolhead_sensor_at
            && sim.toolhead_sensor_at < sim.nozzle_at)
        {
            eyre::bail!("simulation positions must increase from entry sensor to nozzle");
        }
        if !(0.0..0.95).contains(&sim.slip) {
            eyre::bail!("simulation.slip must be in [0.0, 0.95)");
        }

        Ok(())
    }
}

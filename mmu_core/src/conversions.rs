//! `From` implementations bridging `mmu_config` types to `mmu_core` types.
//!
//! Sections carrying technique names go through `TryFrom` since the names
//! must parse.

use crate::config::{
    BowdenCfg, CalibrationCfg, EncoderCfg, ExtruderCfg, GateCfg, PurgeCfg, RecoveryCfg, RetryCfg,
    SpeedCfg, SpoolAssistCfg, SyncCfg, TipCfg, ToolheadCfg, TransportCfg, UnitCfg,
};
use crate::error::{Report, TransportFault};
use crate::load::PurgeMode;
use crate::unload::TipMode;

// ── UnitCfg ──────────────────────────────────────────────────────────────────

impl From<&mmu_config::Unit> for UnitCfg {
    fn from(c: &mmu_config::Unit) -> Self {
        Self {
            num_gates: c.num_gates,
            has_encoder: c.has_encoder,
            has_filament_buffer: c.has_filament_buffer,
            variable_bowden_lengths: c.variable_bowden_lengths,
            variable_rotation_distances: c.variable_rotation_distances,
        }
    }
}

// ── GateCfg ──────────────────────────────────────────────────────────────────

impl TryFrom<&mmu_config::Gate> for GateCfg {
    type Error = TransportFault;
    fn try_from(c: &mmu_config::Gate) -> Result<Self, Self::Error> {
        Ok(Self {
            homing_endstop: c.homing_endstop.parse()?,
            homing_max: c.homing_max,
            parking_distance: c.parking_distance,
            load_retries: c.load_retries,
            final_eject_distance: c.final_eject_distance,
            unload_to_buffer: c.unload_to_buffer,
        })
    }
}

// ── BowdenCfg ────────────────────────────────────────────────────────────────

impl From<&mmu_config::Bowden> for BowdenCfg {
    fn from(c: &mmu_config::Bowden) -> Self {
        Self {
            fast_load_portion: c.fast_load_portion,
            fast_unload_portion: c.fast_unload_portion,
            apply_correction: c.apply_correction,
            soft_tolerance_pct: c.soft_tolerance_pct,
            hard_tolerance_pct: c.hard_tolerance_pct,
            pre_unload_test: c.pre_unload_test,
            pre_unload_error_tolerance: c.pre_unload_error_tolerance,
        }
    }
}

// ── ExtruderCfg ──────────────────────────────────────────────────────────────

impl TryFrom<&mmu_config::Extruder> for ExtruderCfg {
    type Error = TransportFault;
    fn try_from(c: &mmu_config::Extruder) -> Result<Self, Self::Error> {
        Ok(Self {
            homing_endstop: c.homing_endstop.parse()?,
            force_homing: c.force_homing,
            homing_max: c.homing_max,
            collision_homing_step: c.collision_homing_step,
            collision_homing_current: c.collision_homing_current,
        })
    }
}

// ── ToolheadCfg ──────────────────────────────────────────────────────────────

impl From<&mmu_config::Toolhead> for ToolheadCfg {
    fn from(c: &mmu_config::Toolhead) -> Self {
        Self {
            homing_max: c.homing_max,
            sensor_to_nozzle: c.sensor_to_nozzle,
            extruder_to_nozzle: c.extruder_to_nozzle,
            sync_load: c.sync_load,
            sync_unload: c.sync_unload,
            transition_length: c.transition_length,
            unload_safety_margin: c.unload_safety_margin,
            move_error_tolerance: c.move_error_tolerance,
            ignore_load_error: c.ignore_load_error,
            post_load_tighten: c.post_load_tighten,
            post_load_tension_adjust: c.post_load_tension_adjust,
        }
    }
}

// ── SpeedCfg ─────────────────────────────────────────────────────────────────

impl From<&mmu_config::Speeds> for SpeedCfg {
    fn from(c: &mmu_config::Speeds) -> Self {
        Self {
            gear_from_buffer_speed: c.gear_from_buffer_speed,
            gear_from_buffer_accel: c.gear_from_buffer_accel,
            gear_from_spool_speed: c.gear_from_spool_speed,
            gear_from_spool_accel: c.gear_from_spool_accel,
            gear_unload_speed: c.gear_unload_speed,
            gear_unload_accel: c.gear_unload_accel,
            gear_short_move_speed: c.gear_short_move_speed,
            gear_short_move_accel: c.gear_short_move_accel,
            gear_short_move_threshold: c.gear_short_move_threshold,
            gear_homing_speed: c.gear_homing_speed,
            gear_buzz_accel: c.gear_buzz_accel,
            extruder_load_speed: c.extruder_load_speed,
            extruder_unload_speed: c.extruder_unload_speed,
            extruder_sync_load_speed: c.extruder_sync_load_speed,
            extruder_sync_unload_speed: c.extruder_sync_unload_speed,
            extruder_homing_speed: c.extruder_homing_speed,
            extruder_accel: c.extruder_accel,
        }
    }
}

// ── EncoderCfg ───────────────────────────────────────────────────────────────

impl From<&mmu_config::EncoderCfg> for EncoderCfg {
    fn from(c: &mmu_config::EncoderCfg) -> Self {
        Self {
            resolution: c.resolution,
            min_movement: c.min_movement,
            move_step_size: c.move_step_size,
            load_threshold: c.load_threshold,
            move_validation: c.move_validation,
        }
    }
}

// ── SyncCfg ──────────────────────────────────────────────────────────────────

impl From<&mmu_config::Sync> for SyncCfg {
    fn from(c: &mmu_config::Sync) -> Self {
        Self {
            sync_to_extruder: c.sync_to_extruder,
            sync_form_tip: c.sync_form_tip,
            sync_purge: c.sync_purge,
            standalone_sync: c.standalone_sync,
            sync_gear_current: c.sync_gear_current,
        }
    }
}

// ── CalibrationCfg ───────────────────────────────────────────────────────────

impl From<&mmu_config::Calibration> for CalibrationCfg {
    fn from(c: &mmu_config::Calibration) -> Self {
        Self {
            autotune_bowden_length: c.autotune_bowden_length,
            autotune_rotation_distance: c.autotune_rotation_distance,
            default_rotation_distance: c.default_rotation_distance,
            telemetry_window: c.telemetry_window,
            ratio_band: c.ratio_band,
            encoder_calibrated: c.encoder_calibrated,
            selector_calibrated: c.selector_calibrated,
        }
    }
}

// ── RetryCfg / TipCfg / PurgeCfg ─────────────────────────────────────────────

impl From<&mmu_config::Retry> for RetryCfg {
    fn from(c: &mmu_config::Retry) -> Self {
        Self {
            transient_retries: c.transient_retries,
            speed_factor: c.speed_factor,
        }
    }
}

impl From<&mmu_config::Tip> for TipCfg {
    fn from(c: &mmu_config::Tip) -> Self {
        Self {
            ramming_length: c.ramming_length,
            cooling_moves: c.cooling_moves,
            cooling_distance: c.cooling_distance,
            park_distance: c.park_distance,
            cut_position: c.cut_position,
        }
    }
}

impl From<&mmu_config::Purge> for PurgeCfg {
    fn from(c: &mmu_config::Purge) -> Self {
        Self { length: c.length }
    }
}

// ── SpoolAssistCfg / RecoveryCfg ─────────────────────────────────────────────

impl From<&mmu_config::SpoolAssist> for SpoolAssistCfg {
    fn from(c: &mmu_config::SpoolAssist) -> Self {
        Self {
            enabled: c.enabled,
            min_distance: c.min_distance,
            max_stepper_speed: c.max_stepper_speed,
            max_power: c.max_power,
            speed_exponent: c.speed_exponent,
        }
    }
}

impl From<&mmu_config::Recovery> for RecoveryCfg {
    fn from(c: &mmu_config::Recovery) -> Self {
        Self {
            auto_recover: c.auto_recover,
            buzz_distance: c.buzz_distance,
        }
    }
}

// ── TransportCfg ─────────────────────────────────────────────────────────────

impl TryFrom<&mmu_config::Config> for TransportCfg {
    type Error = TransportFault;
    fn try_from(c: &mmu_config::Config) -> Result<Self, Self::Error> {
        Ok(Self {
            unit: (&c.unit).into(),
            gate: (&c.gate).try_into()?,
            bowden: (&c.bowden).into(),
            extruder: (&c.extruder).try_into()?,
            toolhead: (&c.toolhead).into(),
            speeds: (&c.speeds).into(),
            encoder: (&c.encoder).into(),
            sync: (&c.sync).into(),
            calibration: (&c.calibration).into(),
            retry: (&c.retry).into(),
            tip: (&c.tip).into(),
            purge: (&c.purge).into(),
            spool_assist: (&c.spool_assist).into(),
            recovery: (&c.recovery).into(),
        })
    }
}

/// Tip mode named by `[tip] mode`.
pub fn tip_mode(c: &mmu_config::Config) -> Result<TipMode, Report> {
    c.tip.mode.parse().map_err(|e: String| eyre::eyre!(e))
}

/// Purge mode named by `[purge] mode`; absent means none.
pub fn purge_mode(c: &mmu_config::Config) -> Result<PurgeMode, Report> {
    c.purge
        .mode
        .as_deref()
        .map_or(Ok(PurgeMode::None), str::parse)
        .map_err(|e: String| eyre::eyre!(e))
}

// ── Per-gate calibration import ──────────────────────────────────────────────

impl crate::calibration::CalibrationStore {
    /// Apply rows from `mmu_config::load_gate_calibration_csv`.
    pub fn import_rows(&mut self, rows: &[mmu_config::GateCalibrationRow]) {
        for row in rows {
            if let Some(rd) = row.rotation_distance {
                self.update_rotation_distance(row.gate, rd);
            }
            if let Some(bl) = row.bowden_length {
                self.update_bowden_length(row.gate, bl);
            }
            if let Some(clog) = row.clog_length {
                self.set_clog_length(row.gate, clog);
            }
        }
        tracing::info!(rows = rows.len(), "imported gate calibration");
    }
}

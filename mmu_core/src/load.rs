//! Load sequence: gate, bowden, extruder-entry homing, toolhead.

use std::fmt;
use std::str::FromStr;

use eyre::WrapErr;
use mmu_traits::{HomingEdge, MotionController, Selector, SensorProvider};

use crate::calibration::{CalibrationMask, clog_length_for};
use crate::config::{ExtruderEndstop, GateEndstop, ToolheadCfg};
use crate::error::{FaultResult, Report, Result, Stage, StateError, TransportFault};
use crate::gate::{GateSelection, GateStatus};
use crate::hw_error::fault_from_hw;
use crate::motion::{Endstop, Motor, MoveRequest};
use crate::position::{Direction, FilamentPosition};
use crate::status::{SequenceKind, SequenceReport};
use crate::transport::Transport;

pub const TENSION_SENSOR: &str = "filament_tension";
pub const COMPRESSION_SENSOR: &str = "filament_compression";

const TENSION_STEP_MM: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PurgeMode {
    #[default]
    None,
    /// The slicer purges; no motion here.
    Slicer,
    /// Extrude the configured purge length.
    Standalone,
}

impl FromStr for PurgeMode {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "slicer" => Ok(Self::Slicer),
            "standalone" => Ok(Self::Standalone),
            other => Err(format!(
                "unknown purge mode '{other}' (expected none, slicer or standalone)"
            )),
        }
    }
}

impl fmt::Display for PurgeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Slicer => "slicer",
            Self::Standalone => "standalone",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadOptions {
    /// Bowden distance to cover instead of the calibrated length. Longer
    /// values are clamped; shorter ones make a partial load.
    pub bowden_move: Option<f64>,
    /// Stop at the end of the bowden.
    pub skip_extruder: bool,
    pub purge: PurgeMode,
    /// Load from the extruder entrance only (bypass or hand-fed filament).
    pub extruder_only: bool,
}

/// Post-load gear adjustment; at most one runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostLoadAdjust {
    None,
    Tighten,
    TensionAdjust,
}

/// Tension adjust wins over tighten whenever both could apply.
pub fn post_load_adjust(
    feedback_sensor_fitted: bool,
    toolhead: &ToolheadCfg,
    sync_to_extruder: bool,
) -> PostLoadAdjust {
    if feedback_sensor_fitted && toolhead.post_load_tension_adjust {
        PostLoadAdjust::TensionAdjust
    } else if toolhead.post_load_tighten > 0.0 && sync_to_extruder {
        PostLoadAdjust::Tighten
    } else {
        PostLoadAdjust::None
    }
}

pub(crate) fn slippage_warning(what: &str, commanded: f64, delta: f64) -> String {
    format!("excess slippage in {what}: gear moved {commanded:.1}mm, encoder delta {delta:.1}mm")
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub(crate) struct BowdenOutcome {
    /// Commanded/measured ratio; 0.0 when it cannot be trusted.
    pub ratio: f64,
    pub deficit: f64,
}

/// Bowden distance for a sequence and whether it covers the full length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct BowdenPlan {
    pub length: f64,
    pub full: bool,
}

impl<M: MotionController, S: SensorProvider, G: Selector> Transport<M, S, G> {
    /// Load filament from the selected gate to the nozzle.
    pub fn load_sequence(&mut self, opts: &LoadOptions) -> Result<SequenceReport> {
        self.ensure_unlocked()?;
        let selected = self.state.gates.selected;
        let gate = match selected {
            GateSelection::Gate(g) => Some(g),
            GateSelection::Bypass => None,
            GateSelection::Unknown => return Err(Report::new(StateError::NoGateSelected)),
        };
        let extruder_only = opts.extruder_only || gate.is_none();
        let mut mask = CalibrationMask::ENCODER;
        if !extruder_only {
            mask = mask | CalibrationMask::SELECTOR;
            if opts.bowden_move.is_none() {
                mask = mask | CalibrationMask::BOWDEN_LENGTH;
            }
        }
        self.require_calibrated(mask, gate.as_slice())?;

        if self.filament_position() == FilamentPosition::Unknown {
            self.recover(false, false).wrap_err("filament position unknown before load")?;
        }
        let start = self.filament_position();
        let mut report = SequenceReport::new(SequenceKind::Load, selected, start);
        if start == FilamentPosition::Loaded {
            tracing::info!("filament already loaded");
            return Ok(report);
        }
        if start >= FilamentPosition::ExtruderEntry {
            return Err(Report::new(StateError::InvalidPosition(start.to_string())))
                .wrap_err("filament already in the extruder, unload first");
        }
        // Distance into the bowden is not tracked across restarts.
        if start == FilamentPosition::InBowden && !extruder_only {
            return Err(Report::new(StateError::InvalidPosition(start.to_string())))
                .wrap_err("unload before loading again");
        }

        let plan = match gate {
            Some(g) if !extruder_only => Some(self.plan_bowden(g, opts.bowden_move, &mut report)?),
            _ => None,
        };

        let started = self.clock.now();
        let odometer = self.odometer;
        self.state.tracker.set_direction(Direction::Load);
        tracing::info!(gate = ?gate, extruder_only, start = %start, "loading");

        let run = self.with_protected_sync(|t| t.run_load(gate, plan, opts, &mut report));
        if let Err(fault) = run {
            return Err(self.sequence_failed(SequenceKind::Load, fault));
        }
        if let Err(fault) = self.reset_sync(self.cfg.sync.sync_to_extruder) {
            return Err(self.sequence_failed(SequenceKind::Load, fault));
        }

        let elapsed = self.elapsed_ms_since(started);
        let full = self.filament_position() == FilamentPosition::Loaded;
        if full {
            self.state.gates.swaps.loads += 1;
            self.state.gates.swaps.load_ms += elapsed;
            if let Some(g) = gate {
                self.state.gates.promote(g, GateStatus::Available);
                self.state.gates.last_tool = Some(g);
            }
        }
        report.end = self.filament_position();
        report.moved = self.odometer - odometer;
        report.duration_ms = elapsed;
        self.persist()?;
        tracing::info!(
            end = %report.end,
            moved = report.moved,
            ms = elapsed,
            corrections = report.corrections,
            "load complete"
        );
        Ok(report)
    }

    pub(crate) fn plan_bowden(
        &self,
        gate: usize,
        requested: Option<f64>,
        report: &mut SequenceReport,
    ) -> Result<BowdenPlan> {
        let calibrated = self.state.calibration.bowden_length(gate).value();
        match (calibrated, requested) {
            (Some(c), Some(r)) if r > c => {
                report.warn(format!(
                    "requested bowden move {r:.1}mm exceeds calibrated length {c:.1}mm; clamped"
                ));
                Ok(BowdenPlan { length: c, full: true })
            }
            (Some(c), Some(r)) => Ok(BowdenPlan {
                length: r.max(0.0),
                full: (r - c).abs() < f64::EPSILON,
            }),
            (Some(c), None) => Ok(BowdenPlan { length: c, full: true }),
            (None, Some(r)) => Ok(BowdenPlan {
                length: r.max(0.0),
                full: false,
            }),
            (None, None) => {
                self.require_calibrated(CalibrationMask::BOWDEN_LENGTH, &[gate])?;
                Err(Report::new(StateError::Uncalibrated(format!("bowden length for gate {gate}"))))
            }
        }
    }

    fn run_load(
        &mut self,
        gate: Option<usize>,
        plan: Option<BowdenPlan>,
        opts: &LoadOptions,
        report: &mut SequenceReport,
    ) -> FaultResult<()> {
        let (Some(g), Some(plan)) = (gate, plan) else {
            return self.load_extruder(true, report);
        };
        let pos = self.filament_position();
        if pos < FilamentPosition::HomedGate {
            self.load_gate(g)?;
        }

        let home_entry = plan.full && !opts.skip_extruder && self.extruder_homing_needed();
        let bowden = if pos < FilamentPosition::EndBowden {
            Some(self.load_bowden(plan, home_entry, report)?)
        } else {
            None
        };
        let homing = if home_entry && self.filament_position() < FilamentPosition::HomedEntry {
            Some(self.home_to_extruder(report)?)
        } else {
            None
        };
        if plan.full
            && let Some(b) = bowden
        {
            report.autotune =
                self.state.calibration.note_load_telemetry(g, b.ratio, homing, b.deficit);
        }
        if !plan.full || opts.skip_extruder {
            return Ok(());
        }

        self.load_extruder(false, report)?;
        self.post_load(g)?;
        self.purge(opts.purge)
    }

    // ── Gate ─────────────────────────────────────────────────────────────────

    /// Bring filament from the gate to the bowden start.
    pub fn load_gate(&mut self, gate: usize) -> FaultResult<()> {
        let retries = self.cfg.gate.load_retries;
        for attempt in 0..=retries {
            if attempt > 0 {
                if let Some(g) = self.state.gates.get_mut(gate) {
                    g.stats.grip_retries += 1;
                }
                tracing::info!(gate, attempt, "retrying gate load");
                self.selector
                    .release_grip()
                    .and_then(|()| self.selector.drive_grip())
                    .map_err(|e| fault_from_hw(e.as_ref(), Stage::Gate, "re-grip"))?;
            }
            let reached = match self.cfg.gate.homing_endstop {
                GateEndstop::Encoder => self.gate_home_encoder()?,
                GateEndstop::GateSensor => self.gate_home_sensor(Endstop::Gate)?,
                GateEndstop::GearSensor => self.gate_home_sensor(Endstop::Gear)?,
            };
            if let Some(position) = reached {
                self.transition(position);
                self.state.gates.promote(gate, GateStatus::Available);
                return Ok(());
            }
        }
        self.state.gates.set_status(gate, GateStatus::Empty);
        Err(TransportFault::motion(
            Stage::Gate,
            format!("filament did not reach the gate after {} attempts", u32::from(retries) + 1),
        )
        .with_distances(self.cfg.gate.homing_max, None)
        .for_gate(Some(gate)))
    }

    fn gate_home_encoder(&mut self) -> FaultResult<Option<FilamentPosition>> {
        if !self.has_encoder() {
            return Err(TransportFault::config(
                Stage::Gate,
                "encoder gate homing selected but no encoder fitted",
            ));
        }
        let max = self.cfg.gate.homing_max;
        let step = self.cfg.encoder.move_step_size.max(1.0);
        let threshold = self.cfg.encoder.load_threshold;
        let mut moved = 0.0;
        let mut measured = 0.0;
        while moved < max {
            let d = step.min(max - moved);
            let r = self
                .execute_move(&MoveRequest::drive(Motor::Gear, d))
                .map_err(|f| f.in_stage(Stage::Gate))?;
            moved += d;
            measured += r.measured.unwrap_or(0.0);
            if measured >= threshold {
                tracing::debug!(moved, measured, "filament detected by encoder");
                return Ok(Some(FilamentPosition::StartBowden));
            }
        }
        Ok(None)
    }

    fn gate_home_sensor(&mut self, endstop: Endstop) -> FaultResult<Option<FilamentPosition>> {
        if !self.has_sensor(endstop.name()) {
            return Err(TransportFault::config(
                Stage::Gate,
                format!("gate homing endstop '{endstop}' is not fitted"),
            ));
        }
        let r = self
            .execute_move(&MoveRequest::home(
                Motor::Gear,
                self.cfg.gate.homing_max,
                endstop,
                HomingEdge::Trigger,
            ))
            .map_err(|f| f.in_stage(Stage::Gate))?;
        tracing::debug!(
            endstop = endstop.name(),
            traveled = r.actual,
            homed = r.homed,
            "gate homing"
        );
        Ok(r.homed.then_some(FilamentPosition::HomedGate))
    }

    // ── Bowden ───────────────────────────────────────────────────────────────

    pub(crate) fn load_bowden(
        &mut self,
        plan: BowdenPlan,
        entry_homing_follows: bool,
        report: &mut SequenceReport,
    ) -> FaultResult<BowdenOutcome> {
        let deficit = if plan.full && entry_homing_follows {
            plan.length * (100.0 - self.cfg.bowden.fast_load_portion) / 100.0
        } else {
            0.0
        };
        let target = plan.length - deficit;
        if target <= 0.0 {
            return Ok(BowdenOutcome { ratio: 0.0, deficit });
        }
        tracing::info!(length = plan.length, target, deficit, "loading bowden");
        self.transition(FilamentPosition::InBowden);
        let r = self
            .execute_move(&MoveRequest::drive(Motor::Gear, target).tracked())
            .map_err(|f| f.in_stage(Stage::Bowden))?;

        let mut ratio = 0.0;
        if let Some(measured) = r.measured {
            let hard = target * self.cfg.bowden.hard_tolerance_pct / 100.0;
            if r.delta > hard {
                return Err(TransportFault::motion(
                    Stage::Bowden,
                    format!("excessive slippage loading bowden ({:.1}mm not measured)", r.delta),
                )
                .with_distances(target, Some(measured)));
            }
            ratio = measured / target;
            let soft = target * self.cfg.bowden.soft_tolerance_pct / 100.0;
            if r.delta >= soft && !self.state.calibration.is_calibrating() {
                if self.cfg.bowden.apply_correction {
                    let mut delta = r.delta;
                    for _ in 0..2 {
                        if delta < soft {
                            break;
                        }
                        let c = self
                            .execute_move(&MoveRequest::drive(Motor::Gear, delta).tracked())
                            .map_err(|f| f.in_stage(Stage::Bowden))?;
                        report.corrections += 1;
                        tracing::debug!(
                            correction = report.corrections,
                            delta = c.delta,
                            "bowden correction move"
                        );
                        delta = c.delta;
                    }
                    // A corrected move says nothing reliable about the ratio.
                    ratio = 0.0;
                    if delta >= soft {
                        report.warn(slippage_warning(
                            "bowden load after correction moves",
                            target,
                            delta,
                        ));
                    }
                } else {
                    report.warn(slippage_warning("bowden load", target, r.delta));
                }
            }
        }
        if plan.full {
            self.transition(FilamentPosition::EndBowden);
        }
        Ok(BowdenOutcome { ratio, deficit })
    }

    // ── Extruder entry ───────────────────────────────────────────────────────

    fn extruder_homing_needed(&self) -> bool {
        self.cfg.extruder.homing_endstop != ExtruderEndstop::None
            && (!self.has_sensor(Endstop::Toolhead.name()) || self.cfg.extruder.force_homing)
    }

    /// Home to the extruder entrance. Returns the filament distance moved.
    pub fn home_to_extruder(&mut self, report: &mut SequenceReport) -> FaultResult<f64> {
        let max = self.cfg.extruder.homing_max;
        let technique = self.cfg.extruder.homing_endstop;
        tracing::info!(endstop = %technique, max, "homing to extruder");
        let (homed, moved, position) = match technique {
            ExtruderEndstop::None => return Ok(0.0),
            ExtruderEndstop::EntrySensor | ExtruderEndstop::GearTouch => {
                let (endstop, position) = if technique == ExtruderEndstop::EntrySensor {
                    (Endstop::ExtruderEntry, FilamentPosition::HomedEntry)
                } else {
                    (Endstop::GearTouch, FilamentPosition::HomedExtruderGear)
                };
                if !self.has_sensor(endstop.name()) {
                    return Err(TransportFault::config(
                        Stage::ExtruderHoming,
                        format!("extruder homing endstop '{endstop}' is not fitted"),
                    ));
                }
                let r = self
                    .execute_move(&MoveRequest::home(
                        Motor::Gear,
                        max,
                        endstop,
                        HomingEdge::Trigger,
                    ))
                    .map_err(|f| f.in_stage(Stage::ExtruderHoming))?;
                (r.homed, r.actual, position)
            }
            ExtruderEndstop::Collision => {
                let (homed, measured) = self.collision_homing(max)?;
                (homed, measured, FilamentPosition::HomedExtruderGear)
            }
        };
        if !homed {
            self.transition(FilamentPosition::EndBowden);
            return Err(TransportFault::motion(
                Stage::ExtruderHoming,
                format!("failed to reach the extruder after moving {max:.1}mm"),
            )
            .with_distances(max, None));
        }
        if moved > max * 0.8 {
            report.warn(format!(
                "{moved:.1}mm of {max:.1}mm extruder homing used; raise bowden length or homing max"
            ));
        }
        self.transition(position);
        Ok(moved)
    }

    /// Step the gear at reduced current until the encoder stops following.
    fn collision_homing(&mut self, max: f64) -> FaultResult<(bool, f64)> {
        if !self.has_encoder() {
            return Err(TransportFault::config(
                Stage::ExtruderHoming,
                "collision homing requires an encoder",
            ));
        }
        let ext = &self.cfg.extruder;
        let step = self.cfg.encoder.resolution * f64::from(ext.collision_homing_step.max(1));
        let current = ext.collision_homing_current;
        self.motion
            .set_current_percent(mmu_traits::AxisRole::Gear, current)
            .map_err(|e| fault_from_hw(e.as_ref(), Stage::ExtruderHoming, "reduce gear current"))?;

        let out = self
            .collision_steps(step, max)
            .map_err(|f| f.in_stage(Stage::ExtruderHoming));
        let pct = self.state.sync.state().gear_current_percent;
        let restored = self
            .motion
            .set_current_percent(mmu_traits::AxisRole::Gear, pct)
            .map_err(|e| fault_from_hw(e.as_ref(), Stage::ExtruderHoming, "restore gear current"));
        let out = out?;
        restored?;
        Ok(out)
    }

    /// Returns whether a stall was seen and the total encoder movement.
    fn collision_steps(&mut self, step: f64, max: f64) -> FaultResult<(bool, f64)> {
        let mut moved = 0.0;
        let mut measured = 0.0;
        while moved < max {
            let r = self.execute_move(&MoveRequest::drive(Motor::Gear, step))?;
            moved += step;
            let m = r.measured.unwrap_or(0.0);
            measured += m;
            if m < step / 2.0 {
                tracing::debug!(moved, measured, "collision detected");
                return Ok((true, measured));
            }
        }
        Ok((false, measured))
    }

    // ── Toolhead ─────────────────────────────────────────────────────────────

    /// Drive filament from the extruder entrance to the nozzle.
    pub fn load_extruder(
        &mut self,
        extruder_only: bool,
        report: &mut SequenceReport,
    ) -> FaultResult<()> {
        let th = self.cfg.toolhead.clone();
        let toolhead = self.sensor(Endstop::Toolhead.name());
        if toolhead == Some(true) {
            return Err(TransportFault::motion(
                Stage::Toolhead,
                "toolhead sensor triggered before loading; possible blockage or sensor fault",
            ));
        }
        let sync = th.sync_load && !extruder_only;
        let mut transition_done = 0.0;
        if !sync && !extruder_only {
            // Hand filament from gear to extruder before the extruder-only part.
            self.execute_move(&MoveRequest::drive(Motor::GearAndExtruder, th.transition_length))
                .map_err(|f| f.in_stage(Stage::Toolhead))?;
            transition_done = th.transition_length;
        }
        self.transition(FilamentPosition::ExtruderEntry);
        let motor = if sync { Motor::GearAndExtruder } else { Motor::ExtruderOnly };

        let final_move = match toolhead {
            Some(false) => {
                let r = self
                    .execute_move(&MoveRequest::home(
                        motor,
                        th.homing_max,
                        Endstop::Toolhead,
                        HomingEdge::Trigger,
                    ))
                    .map_err(|f| f.in_stage(Stage::Toolhead))?;
                if !r.homed {
                    return Err(TransportFault::motion(
                        Stage::Toolhead,
                        format!("toolhead sensor not reached after {:.1}mm", th.homing_max),
                    )
                    .with_distances(th.homing_max, r.measured));
                }
                self.transition(FilamentPosition::HomedToolheadSensor);
                th.sensor_to_nozzle
            }
            _ => (th.extruder_to_nozzle - transition_done).max(0.0),
        };

        self.transition(FilamentPosition::InExtruder);
        let r = self
            .execute_move(&MoveRequest::drive(motor, final_move))
            .map_err(|f| f.in_stage(Stage::Toolhead))?;
        if let Some(measured) = r.measured
            && self.cfg.encoder.move_validation
        {
            let expected = final_move * (1.0 - th.move_error_tolerance / 100.0);
            if measured < expected {
                let msg = format!(
                    "filament moved {measured:.1}mm of {final_move:.1}mm loading to the nozzle"
                );
                if th.ignore_load_error {
                    report.warn(msg);
                } else {
                    return Err(TransportFault::motion(Stage::Toolhead, msg)
                        .with_distances(final_move, Some(measured)));
                }
            }
        }
        self.transition(FilamentPosition::Loaded);
        Ok(())
    }

    fn post_load(&mut self, gate: usize) -> FaultResult<()> {
        let feedback = self.has_sensor(TENSION_SENSOR) || self.has_sensor(COMPRESSION_SENSOR);
        let clog = self
            .state
            .calibration
            .clog_length(gate)
            .value()
            .unwrap_or_else(|| clog_length_for(0.0));
        match post_load_adjust(feedback, &self.cfg.toolhead, self.cfg.sync.sync_to_extruder) {
            PostLoadAdjust::None => Ok(()),
            PostLoadAdjust::Tighten => {
                let d = clog * self.cfg.toolhead.post_load_tighten / 100.0;
                tracing::debug!(distance = d, "tightening filament");
                self.execute_move(&MoveRequest::drive(Motor::Gear, -d))
                    .map(|_| ())
                    .map_err(|f| f.in_stage(Stage::Toolhead))
            }
            PostLoadAdjust::TensionAdjust => {
                let steps = (clog / TENSION_STEP_MM).ceil().max(1.0) as u32;
                for _ in 0..steps {
                    let step = if self.sensor(COMPRESSION_SENSOR) == Some(true) {
                        -TENSION_STEP_MM
                    } else if self.sensor(TENSION_SENSOR) == Some(true) {
                        TENSION_STEP_MM
                    } else {
                        break;
                    };
                    self.execute_move(&MoveRequest::drive(Motor::Gear, step))
                        .map_err(|f| f.in_stage(Stage::Toolhead))?;
                }
                Ok(())
            }
        }
    }

    fn purge(&mut self, mode: PurgeMode) -> FaultResult<()> {
        let length = self.cfg.purge.length;
        if mode != PurgeMode::Standalone || length <= 0.0 {
            return Ok(());
        }
        let motor = if self.cfg.sync.sync_purge {
            Motor::GearAndExtruder
        } else {
            Motor::ExtruderOnly
        };
        tracing::info!(length, "purging");
        self.execute_move(&MoveRequest::drive(motor, length))
            .map(|_| ())
            .map_err(|f| f.in_stage(Stage::Toolhead))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tension_adjust_wins_over_tighten() {
        let th = ToolheadCfg::default();
        assert_eq!(post_load_adjust(true, &th, true), PostLoadAdjust::TensionAdjust);
        assert_eq!(post_load_adjust(false, &th, true), PostLoadAdjust::Tighten);
        assert_eq!(post_load_adjust(false, &th, false), PostLoadAdjust::None);
        let th = ToolheadCfg {
            post_load_tension_adjust: false,
            ..ToolheadCfg::default()
        };
        assert_eq!(post_load_adjust(true, &th, true), PostLoadAdjust::Tighten);
    }

    #[test]
    fn purge_modes_parse() {
        assert_eq!("standalone".parse::<PurgeMode>(), Ok(PurgeMode::Standalone));
        assert!("flush".parse::<PurgeMode>().is_err());
    }
}

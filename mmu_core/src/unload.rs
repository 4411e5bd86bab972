//! Unload sequence: tip, extruder exit, bowden retract, gate park and eject.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use eyre::WrapErr;
use mmu_traits::{HomingEdge, MotionController, Selector, SensorProvider};

use crate::calibration::CalibrationMask;
use crate::config::GateEndstop;
use crate::error::{FaultResult, Report, Result, Stage, StateError, TransportFault};
use crate::gate::{GateSelection, GateStatus};
use crate::load::slippage_warning;
use crate::motion::{Endstop, Motor, MoveRequest};
use crate::position::{Direction, FilamentPosition};
use crate::status::{SequenceKind, SequenceReport};
use crate::transport::Transport;

/// Slippage (percent of the bowden move) that means filament is stuck.
const STUCK_UNLOAD_PCT: f64 = 80.0;
const STUCK_IN_EXTRUDER: &str = "filament seems to be stuck in the extruder";
/// Dwell after a standalone tip before the extruder moves again.
const TIP_DWELL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TipMode {
    #[default]
    None,
    /// The slicer already formed the tip and parked it.
    Slicer,
    Standalone,
    Cut,
}

impl FromStr for TipMode {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "slicer" => Ok(Self::Slicer),
            "standalone" => Ok(Self::Standalone),
            "cut" => Ok(Self::Cut),
            other => Err(format!(
                "unknown tip mode '{other}' (expected none, slicer, standalone or cut)"
            )),
        }
    }
}

impl fmt::Display for TipMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Slicer => "slicer",
            Self::Standalone => "standalone",
            Self::Cut => "cut",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnloadOptions {
    pub bowden_move: Option<f64>,
    /// Run a recovery pass before moving anything.
    pub check_state: bool,
    pub form_tip: TipMode,
    pub extruder_only: bool,
    /// Retract past the park point and mark the gate empty.
    pub eject: bool,
}

impl<M: MotionController, S: SensorProvider, G: Selector> Transport<M, S, G> {
    /// Unload filament back to the gate. A no-op when already unloaded.
    pub fn unload_sequence(&mut self, opts: &UnloadOptions) -> Result<SequenceReport> {
        self.ensure_unlocked()?;
        let selected = self.state.gates.selected;
        let kind = if opts.eject { SequenceKind::Eject } else { SequenceKind::Unload };
        let mask = if opts.extruder_only || selected == GateSelection::Bypass {
            CalibrationMask::ENCODER
        } else {
            CalibrationMask::ENCODER | CalibrationMask::SELECTOR
        };
        self.require_calibrated(mask, selected.gate().as_slice())?;

        if opts.check_state || self.filament_position() == FilamentPosition::Unknown {
            self.recover(false, false).wrap_err("filament position unknown before unload")?;
        }
        let start = self.filament_position();
        let mut report = SequenceReport::new(kind, selected, start);
        if start == FilamentPosition::Unloaded {
            tracing::debug!("filament already unloaded");
            return Ok(report);
        }
        if !opts.extruder_only && selected == GateSelection::Unknown {
            return Err(Report::new(StateError::NoGateSelected));
        }
        let gate = selected.gate();
        let extruder_only = opts.extruder_only || gate.is_none();
        if extruder_only && start < FilamentPosition::ExtruderEntry {
            return Err(Report::new(StateError::InvalidPosition(start.to_string())))
                .wrap_err("cannot unload the extruder, filament is not in it");
        }
        let length = match gate {
            Some(g) if !extruder_only => Some(self.unload_length(g, opts.bowden_move, &mut report)),
            _ => None,
        };

        let started = self.clock.now();
        let odometer = self.odometer;
        self.state.tracker.set_direction(Direction::Unload);
        tracing::info!(
            gate = ?gate,
            extruder_only,
            start = %start,
            tip = %opts.form_tip,
            "unloading"
        );

        let run = self.with_protected_sync(|t| t.run_unload(gate, length, opts, &mut report));
        if let Err(fault) = run {
            return Err(self.sequence_failed(kind, fault));
        }
        if let Err(fault) = self.reset_sync(self.cfg.sync.sync_to_extruder) {
            return Err(self.sequence_failed(kind, fault));
        }

        let elapsed = self.elapsed_ms_since(started);
        if self.filament_position() == FilamentPosition::Unloaded && !extruder_only {
            self.state.gates.swaps.unloads += 1;
            self.state.gates.swaps.unload_ms += elapsed;
        }
        report.end = self.filament_position();
        report.moved = self.odometer - odometer;
        report.duration_ms = elapsed;
        self.persist()?;
        tracing::info!(end = %report.end, moved = report.moved, ms = elapsed, "{kind} complete");
        Ok(report)
    }

    /// Unload with eject. When already unloaded only the final retract runs.
    pub fn eject(&mut self) -> Result<SequenceReport> {
        self.ensure_unlocked()?;
        if self.filament_position() != FilamentPosition::Unloaded {
            return self.unload_sequence(&UnloadOptions {
                eject: true,
                ..UnloadOptions::default()
            });
        }
        let selected = self.state.gates.selected;
        let Some(gate) = selected.gate() else {
            return Err(Report::new(StateError::NoGateSelected));
        };
        self.require_calibrated(CalibrationMask::ENCODER | CalibrationMask::SELECTOR, &[gate])?;
        let mut report =
            SequenceReport::new(SequenceKind::Eject, selected, FilamentPosition::Unloaded);
        let odometer = self.odometer;
        let distance = self.cfg.gate.final_eject_distance;
        if distance > 0.0
            && let Err(fault) = self.execute_move(&MoveRequest::drive(Motor::Gear, -distance))
        {
            return Err(self.sequence_failed(SequenceKind::Eject, fault.in_stage(Stage::Park)));
        }
        self.state.gates.set_status(gate, GateStatus::Empty);
        report.moved = self.odometer - odometer;
        self.persist()?;
        Ok(report)
    }

    fn unload_length(
        &self,
        gate: usize,
        requested: Option<f64>,
        report: &mut SequenceReport,
    ) -> f64 {
        let calibrated = self.state.calibration.bowden_length(gate).value();
        match (calibrated, requested) {
            (Some(c), Some(r)) if r > c => {
                report.warn(format!(
                    "requested bowden move {r:.1}mm exceeds calibrated length {c:.1}mm; clamped"
                ));
                c
            }
            (_, Some(r)) => r.max(0.0),
            (Some(c), None) => c,
            // Nothing to go on: the park homing covers the whole path slowly.
            (None, None) => 0.0,
        }
    }

    fn run_unload(
        &mut self,
        gate: Option<usize>,
        length: Option<f64>,
        opts: &UnloadOptions,
        report: &mut SequenceReport,
    ) -> FaultResult<()> {
        let park_pos = self.form_tip(opts.form_tip)?;
        let start = self.filament_position();

        let (Some(g), Some(length)) = (gate, length) else {
            if start >= FilamentPosition::ExtruderEntry {
                self.unload_extruder(true, park_pos)?;
            }
            // Only the bypass has nothing further upstream to retract.
            if gate.is_none() {
                self.transition(FilamentPosition::Unloaded);
            }
            return Ok(());
        };
        let to_buffer = self.cfg.gate.unload_to_buffer && start >= FilamentPosition::EndBowden;

        if start >= FilamentPosition::ExtruderEntry {
            self.unload_extruder(false, park_pos)?;
        }
        if self.filament_position() < FilamentPosition::EndBowden {
            // Somewhere in the bowden: no fast move, home all the way slowly.
            self.park_at_gate(g, length, opts.eject)?;
            return self.finish_park(g, opts.eject, to_buffer);
        }
        let probed = if self.cfg.bowden.pre_unload_test {
            self.pre_unload_probe()?
        } else {
            0.0
        };
        let length = (length - probed).max(0.0);
        let (ratio, fast) = self.unload_bowden(length, report)?;
        let deficit = length - fast;
        let homing = self.park_at_gate(g, deficit, opts.eject)?;
        if length > 0.0 {
            report.autotune =
                self.state.calibration.note_unload_telemetry(g, ratio, homing, deficit);
        }
        self.finish_park(g, opts.eject, to_buffer)
    }

    // ── Tip ──────────────────────────────────────────────────────────────────

    /// Form or cut the tip when filament is in the extruder. Returns how far
    /// the tip already sits back from the nozzle.
    ///
    /// Presence is read before anything moves. Without filament in the
    /// extruder the tip is skipped and the position is left alone so the
    /// extruder exit still runs.
    pub fn form_tip(&mut self, mode: TipMode) -> FaultResult<f64> {
        let start = self.filament_position();
        if start < FilamentPosition::ExtruderEntry {
            return Ok(0.0);
        }
        let tip = self.cfg.tip.clone();
        match mode {
            TipMode::None => return Ok(0.0),
            TipMode::Slicer => return Ok(tip.park_distance),
            TipMode::Standalone | TipMode::Cut => {}
        }
        let present = match self.sensor(Endstop::Toolhead.name()) {
            Some(triggered) => triggered,
            None => start >= FilamentPosition::InExtruder,
        };
        if !present {
            tracing::debug!(position = %start, "no filament at the toolhead, tip skipped");
            return Ok(0.0);
        }

        let motor = if self.cfg.sync.sync_form_tip {
            Motor::GearAndExtruder
        } else {
            Motor::ExtruderOnly
        };
        let drive = |t: &mut Self, d: f64| {
            t.execute_move(&MoveRequest::drive(motor, d))
                .map(|_| ())
                .map_err(|f| f.in_stage(Stage::Tip))
        };
        let park_pos = if mode == TipMode::Cut {
            tracing::info!(position = tip.cut_position, "cutting filament");
            drive(self, -tip.cut_position)?;
            drive(self, -tip.park_distance)?;
            tip.cut_position + tip.park_distance
        } else {
            tracing::info!(
                ramming = tip.ramming_length,
                cooling = tip.cooling_moves,
                "forming tip"
            );
            if tip.ramming_length > 0.0 {
                drive(self, tip.ramming_length)?;
            }
            for _ in 0..tip.cooling_moves {
                drive(self, -tip.cooling_distance)?;
                drive(self, tip.cooling_distance)?;
            }
            drive(self, -tip.park_distance)?;
            self.clock.sleep(TIP_DWELL);
            tip.park_distance
        };
        self.transition(FilamentPosition::InExtruder);
        Ok(park_pos)
    }

    // ── Extruder ─────────────────────────────────────────────────────────────

    /// Pull filament out of the extruder gears, leaving it at the end of the
    /// bowden. `stepper_only` keeps the gear out of the moves.
    pub fn unload_extruder(&mut self, stepper_only: bool, park_pos: f64) -> FaultResult<()> {
        let th = self.cfg.toolhead.clone();
        let sync = th.sync_unload && !stepper_only;
        let motor = if sync { Motor::GearAndExtruder } else { Motor::ExtruderOnly };
        let margin = th.unload_safety_margin;
        let has_sensor = self.has_sensor(Endstop::Toolhead.name());
        let home_to_nozzle = if has_sensor { th.sensor_to_nozzle } else { th.extruder_to_nozzle };
        let length = (home_to_nozzle - park_pos).max(0.0) + margin;
        let stage = |f: TransportFault| f.in_stage(Stage::Toolhead);

        if has_sensor {
            let r = self
                .execute_move(&MoveRequest::home(
                    motor,
                    -length,
                    Endstop::Toolhead,
                    HomingEdge::Release,
                ))
                .map_err(stage)?;
            if !r.homed {
                return Err(TransportFault::motion(Stage::Toolhead, STUCK_IN_EXTRUDER)
                    .with_distances(length, r.measured));
            }
            self.transition(FilamentPosition::HomedToolheadSensor);
            let exit = (th.extruder_to_nozzle - th.sensor_to_nozzle).max(0.0) + margin;
            self.execute_move(&MoveRequest::drive(motor, -exit)).map_err(stage)?;
        } else if self.has_encoder() {
            self.transition(FilamentPosition::ExtruderEntry);
            let step = self.cfg.encoder.move_step_size.max(1.0);
            let min = self.cfg.encoder.min_movement;
            let max = if sync { length } else { length + step };
            let mut moved = 0.0;
            let mut stalled = false;
            while moved < max {
                let r = self.execute_move(&MoveRequest::drive(motor, -step)).map_err(stage)?;
                moved += step;
                if r.measured.unwrap_or(0.0) < min {
                    stalled = true;
                    break;
                }
            }
            // Extruder alone stops moving filament once it is out; gear and
            // extruder together only stall when something is stuck.
            let out = if sync { !stalled } else { stalled };
            if !out {
                return Err(TransportFault::motion(Stage::Toolhead, STUCK_IN_EXTRUDER)
                    .with_distances(moved, None));
            }
            tracing::debug!(moved, "extruder entrance reached");
        } else {
            self.execute_move(&MoveRequest::drive(motor, -length)).map_err(stage)?;
        }
        self.transition(FilamentPosition::EndBowden);
        Ok(())
    }

    /// Short gear retract to prove the extruder has let go. Returns the retract.
    fn pre_unload_probe(&mut self) -> FaultResult<f64> {
        let step = self.cfg.encoder.move_step_size;
        let r = self
            .execute_move(&MoveRequest::drive(Motor::Gear, -step))
            .map_err(|f| f.in_stage(Stage::PreUnloadProbe))?;
        let stuck = match r.measured {
            Some(m) => m < step * (100.0 - self.cfg.bowden.pre_unload_error_tolerance) / 100.0,
            None => self.sensor(Endstop::ExtruderEntry.name()) == Some(true),
        };
        if stuck {
            return Err(TransportFault::motion(
                Stage::PreUnloadProbe,
                "filament stuck in extruder; bowden unload aborted",
            )
            .with_distances(step, r.measured));
        }
        self.transition(FilamentPosition::InBowden);
        Ok(step)
    }

    // ── Bowden ───────────────────────────────────────────────────────────────

    /// Fast bowden retract. Returns the measured ratio and the distance moved.
    fn unload_bowden(
        &mut self,
        length: f64,
        report: &mut SequenceReport,
    ) -> FaultResult<(f64, f64)> {
        let fast = length * self.cfg.bowden.fast_unload_portion / 100.0;
        if fast <= 0.0 {
            return Ok((0.0, 0.0));
        }
        self.transition(FilamentPosition::InBowden);
        let r = self
            .execute_move(&MoveRequest::drive(Motor::Gear, -fast).tracked())
            .map_err(|f| f.in_stage(Stage::Bowden))?;
        let mut ratio = 0.0;
        if let Some(measured) = r.measured {
            if r.delta >= fast * STUCK_UNLOAD_PCT / 100.0 {
                return Err(TransportFault::motion(
                    Stage::Bowden,
                    format!("filament appears stuck; only {measured:.1}mm of {fast:.1}mm measured"),
                )
                .with_distances(fast, Some(measured)));
            }
            if r.delta >= fast * self.cfg.bowden.soft_tolerance_pct / 100.0 {
                report.warn(slippage_warning("bowden unload", fast, r.delta));
            }
            ratio = measured / fast;
        }
        self.transition(FilamentPosition::StartBowden);
        Ok((ratio, fast))
    }

    // ── Gate ─────────────────────────────────────────────────────────────────

    /// Retract to the gate endstop. Returns the homing travel, if homed.
    fn park_at_gate(
        &mut self,
        gate: usize,
        remaining: f64,
        eject: bool,
    ) -> FaultResult<Option<f64>> {
        let max = remaining.max(0.0) + self.cfg.gate.homing_max;
        let stage = |f: TransportFault| f.in_stage(Stage::Park).for_gate(Some(gate));
        let endstop = match self.cfg.gate.homing_endstop {
            GateEndstop::Encoder => None,
            GateEndstop::GateSensor => Some(Endstop::Gate),
            GateEndstop::GearSensor => Some(Endstop::Gear),
        };
        let travel = if let Some(endstop) = endstop {
            let r = self
                .execute_move(&MoveRequest::home(Motor::Gear, -max, endstop, HomingEdge::Release))
                .map_err(stage)?;
            if !r.homed {
                return Err(TransportFault::motion(
                    Stage::Park,
                    format!("gate endstop '{endstop}' did not clear after {max:.1}mm"),
                )
                .with_distances(max, r.measured)
                .for_gate(Some(gate)));
            }
            r.actual.abs()
        } else {
            if !self.has_encoder() {
                return Err(TransportFault::config(
                    Stage::Park,
                    "encoder gate parking selected but no encoder fitted",
                ));
            }
            let step = self.cfg.encoder.move_step_size.max(1.0);
            let min = self.cfg.encoder.min_movement;
            let mut moved = 0.0;
            let mut clear = false;
            while moved < max {
                let r = self.execute_move(&MoveRequest::drive(Motor::Gear, -step)).map_err(stage)?;
                moved += step;
                if r.measured.unwrap_or(0.0) < min {
                    clear = true;
                    break;
                }
            }
            if !clear {
                return Err(TransportFault::motion(
                    Stage::Park,
                    "filament still seen by the encoder after parking",
                )
                .with_distances(max, None)
                .for_gate(Some(gate)));
            }
            moved
        };
        self.transition(FilamentPosition::HomedGate);

        let mut park = self.cfg.gate.parking_distance;
        if eject {
            park += self.cfg.gate.final_eject_distance;
        }
        if park != 0.0 {
            self.execute_move(&MoveRequest::drive(Motor::Gear, -park)).map_err(stage)?;
        }
        tracing::debug!(gate, travel, park, "parked at gate");
        Ok(endstop.map(|_| travel))
    }

    fn finish_park(&mut self, gate: usize, eject: bool, to_buffer: bool) -> FaultResult<()> {
        if eject {
            self.state.gates.set_status(gate, GateStatus::Empty);
        } else if to_buffer {
            self.state.gates.set_status(gate, GateStatus::AvailableFromBuffer);
        } else {
            self.state.gates.promote(gate, GateStatus::Available);
        }
        self.transition(FilamentPosition::Unloaded);
        Ok(())
    }
}

//! Move executor: one motor command in, one `MoveResult` out.

use std::fmt;
use std::str::FromStr;

use mmu_traits::{
    AssistDirection, AxisRole, HomingEdge, HomingOutcome, MotionController, Selector,
    SensorProvider,
};

use crate::error::{FaultKind, FaultResult, Stage, TransportFault};
use crate::gate::GateStatus;
use crate::hw_error::{classify_hw_error, fault_from_hw};
use crate::sync::SyncMode;
use crate::transport::Transport;

/// Steppers a move drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Motor {
    Gear,
    GearAndExtruder,
    ExtruderOnly,
    /// Extruder drives, gear follows.
    ExtruderDriven,
}

impl Motor {
    pub fn axis(self) -> AxisRole {
        match self {
            Self::Gear => AxisRole::Gear,
            Self::GearAndExtruder => AxisRole::GearAndExtruder,
            Self::ExtruderOnly => AxisRole::Extruder,
            Self::ExtruderDriven => AxisRole::ExtruderAndGear,
        }
    }

    #[inline]
    pub fn is_synced(self) -> bool {
        matches!(self, Self::GearAndExtruder | Self::ExtruderDriven)
    }
}

impl FromStr for Motor {
    type Err = TransportFault;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gear" => Ok(Self::Gear),
            "gear+extruder" => Ok(Self::GearAndExtruder),
            "extruder" => Ok(Self::ExtruderOnly),
            "extruder+gear" => Ok(Self::ExtruderDriven),
            other => Err(TransportFault::config(Stage::Move, format!("unknown motor '{other}'"))),
        }
    }
}

impl fmt::Display for Motor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Gear => "gear",
            Self::GearAndExtruder => "gear+extruder",
            Self::ExtruderOnly => "extruder",
            Self::ExtruderDriven => "extruder+gear",
        })
    }
}

/// Named endstops along the filament path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endstop {
    Gate,
    Gear,
    ExtruderEntry,
    Toolhead,
    GearTouch,
}

impl Endstop {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Gate => "mmu_gate",
            Self::Gear => "mmu_gear",
            Self::ExtruderEntry => "extruder",
            Self::Toolhead => "toolhead",
            Self::GearTouch => "mmu_gear_touch",
        }
    }
}

impl FromStr for Endstop {
    type Err = TransportFault;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mmu_gate" => Ok(Self::Gate),
            "mmu_gear" => Ok(Self::Gear),
            "extruder" => Ok(Self::ExtruderEntry),
            "toolhead" => Ok(Self::Toolhead),
            "mmu_gear_touch" => Ok(Self::GearTouch),
            other => Err(TransportFault::config(Stage::Move, format!("unknown endstop '{other}'"))),
        }
    }
}

impl fmt::Display for Endstop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single move. Speed and acceleration default from the speed table.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveRequest {
    pub motor: Motor,
    pub distance: f64,
    pub speed: Option<f64>,
    pub accel: Option<f64>,
    pub homing: Option<(Endstop, HomingEdge)>,
    /// Count this move in the gate's distance/slippage statistics.
    pub track: bool,
}

impl MoveRequest {
    pub fn drive(motor: Motor, distance: f64) -> Self {
        Self {
            motor,
            distance,
            speed: None,
            accel: None,
            homing: None,
            track: false,
        }
    }

    pub fn home(motor: Motor, distance: f64, endstop: Endstop, edge: HomingEdge) -> Self {
        Self {
            homing: Some((endstop, edge)),
            ..Self::drive(motor, distance)
        }
    }

    #[must_use]
    pub fn speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    #[must_use]
    pub fn accel(mut self, accel: f64) -> Self {
        self.accel = Some(accel);
        self
    }

    #[must_use]
    pub fn tracked(mut self) -> Self {
        self.track = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveResult {
    /// Distance the stepper actually travelled (signed).
    pub actual: f64,
    pub homed: bool,
    /// Encoder distance, when an encoder is fitted.
    pub measured: Option<f64>,
    /// `|actual| - measured`, zero without an encoder.
    pub delta: f64,
}

impl MoveResult {
    pub fn new(actual: f64, homed: bool, measured: Option<f64>) -> Self {
        let delta = measured.map_or(0.0, |m| actual.abs() - m);
        Self {
            actual,
            homed,
            measured,
            delta,
        }
    }
}

/// How a homing retry loop ended.
#[derive(Debug)]
pub(crate) enum RetryExit {
    Success(HomingOutcome),
    ExhaustedRetries(TransportFault),
    FatalConfig(TransportFault),
}

/// Spool assist power for a gear move at `speed`.
pub fn assist_power(speed: f64, max_stepper_speed: f64, exponent: f64, max_power: u8) -> u8 {
    if max_stepper_speed <= 0.0 {
        return 0;
    }
    let ratio = (speed.abs().min(max_stepper_speed) / max_stepper_speed).powf(exponent);
    (ratio * f64::from(max_power)).round().clamp(0.0, 100.0) as u8
}

impl<M: MotionController, S: SensorProvider, G: Selector> Transport<M, S, G> {
    /// Default (speed, accel) for a move from the speed table.
    pub fn default_speed(&self, motor: Motor, distance: f64, homing: bool) -> (f64, f64) {
        let sp = &self.cfg.speeds;
        match motor {
            Motor::Gear => {
                if homing {
                    (sp.gear_homing_speed, sp.gear_short_move_accel)
                } else if distance.abs() < sp.gear_short_move_threshold {
                    (sp.gear_short_move_speed, sp.gear_short_move_accel)
                } else if distance > 0.0 {
                    let gates = &self.state.gates;
                    let buffered = gates
                        .selected
                        .gate()
                        .is_some_and(|g| gates.status(g) == GateStatus::AvailableFromBuffer);
                    if buffered {
                        (sp.gear_from_buffer_speed, sp.gear_from_buffer_accel)
                    } else {
                        (sp.gear_from_spool_speed, sp.gear_from_spool_accel)
                    }
                } else {
                    (sp.gear_unload_speed, sp.gear_unload_accel)
                }
            }
            Motor::ExtruderOnly => {
                let speed = if homing {
                    sp.extruder_homing_speed
                } else if distance >= 0.0 {
                    sp.extruder_load_speed
                } else {
                    sp.extruder_unload_speed
                };
                (speed, sp.extruder_accel)
            }
            Motor::GearAndExtruder | Motor::ExtruderDriven => {
                let speed = if homing {
                    sp.extruder_homing_speed
                } else if distance >= 0.0 {
                    sp.extruder_sync_load_speed
                } else {
                    sp.extruder_sync_unload_speed
                };
                (speed, sp.extruder_accel)
            }
        }
    }

    /// Issue one move and report its outcome.
    pub fn execute_move(&mut self, req: &MoveRequest) -> FaultResult<MoveResult> {
        let (default_speed, default_accel) =
            self.default_speed(req.motor, req.distance, req.homing.is_some());
        let speed = req.speed.unwrap_or(default_speed);
        let accel = req.accel.unwrap_or(default_accel);
        let axis = req.motor.axis();

        if let Some((endstop, _)) = req.homing
            && self.sensor(endstop.name()).is_none()
        {
            return Err(TransportFault::config(
                Stage::Move,
                format!("homing endstop '{endstop}' is not fitted"),
            ));
        }

        if req.motor == Motor::Gear && self.state.sync.state().mode.is_synced() {
            tracing::debug!("breaking sync for gear-only move");
            self.apply_sync(SyncMode::Unsynced)?;
        }
        if axis.moves_gear() {
            self.selector
                .hold_for_move()
                .map_err(|e| fault_from_hw(e.as_ref(), Stage::Move, "grip filament"))?;
        }

        let assisted = self.start_spool_assist(req.motor, req.distance, speed);
        let start = self.encoder_distance();

        let outcome = match req.homing {
            Some((endstop, edge)) => {
                match self.homing_with_retries(axis, req.distance, speed, accel, endstop, edge) {
                    RetryExit::Success(o) => Ok((o.traveled, o.triggered)),
                    RetryExit::ExhaustedRetries(f) | RetryExit::FatalConfig(f) => Err(f),
                }
            }
            None => self
                .motion
                .drive_move(axis, req.distance, speed, accel)
                .map(|()| (req.distance, false))
                .map_err(|e| fault_from_hw(e.as_ref(), Stage::Move, "move")),
        };

        if assisted {
            self.stop_spool_assist();
        }
        let measured = match (start, self.encoder_distance()) {
            (Some(a), Some(b)) => Some((b - a).max(0.0)),
            _ => None,
        };
        let (actual, homed) = match outcome {
            Ok(v) => v,
            Err(f) => {
                // Attribute partial motion before propagating.
                let fault = f
                    .with_distances(req.distance, measured)
                    .for_gate(self.state.gates.selected.gate());
                return Err(fault);
            }
        };

        let result = MoveResult::new(actual, homed, measured);
        self.state.tracker.add_distance(actual);
        self.odometer += actual.abs();
        if req.track {
            self.record_move_stats(&result);
        }
        tracing::trace!(
            motor = %req.motor,
            commanded = req.distance,
            actual,
            homed,
            measured = ?measured,
            delta = result.delta,
            "move complete"
        );
        Ok(result)
    }

    /// Homing move with bounded retries at reduced speed on transient faults.
    fn homing_with_retries(
        &mut self,
        axis: AxisRole,
        distance: f64,
        mut speed: f64,
        accel: f64,
        endstop: Endstop,
        edge: HomingEdge,
    ) -> RetryExit {
        let retries = self.cfg.retry.transient_retries;
        let mut attempt = 0u8;
        loop {
            match self.motion.homing_move(axis, distance, speed, accel, endstop.name(), edge) {
                Ok(outcome) => return RetryExit::Success(outcome),
                Err(e) => match classify_hw_error(e.as_ref()) {
                    FaultKind::Config => {
                        return RetryExit::FatalConfig(TransportFault::config(
                            Stage::Move,
                            format!("homing to '{endstop}': {e}"),
                        ));
                    }
                    FaultKind::Motion => {
                        return RetryExit::ExhaustedRetries(TransportFault::motion(
                            Stage::Move,
                            format!("homing to '{endstop}': {e}"),
                        ));
                    }
                    FaultKind::Transient if attempt < retries => {
                        attempt += 1;
                        speed *= self.cfg.retry.speed_factor;
                        tracing::warn!(
                            attempt,
                            speed,
                            endstop = endstop.name(),
                            error = %e,
                            "retrying homing move"
                        );
                    }
                    FaultKind::Transient => {
                        return RetryExit::ExhaustedRetries(TransportFault::motion(
                            Stage::Move,
                            format!("homing to '{endstop}' failed after {attempt} retries: {e}"),
                        ));
                    }
                },
            }
        }
    }

    fn record_move_stats(&mut self, result: &MoveResult) {
        let Some(gate) = self.state.gates.selected.gate() else {
            return;
        };
        if let Some(g) = self.state.gates.get_mut(gate) {
            if result.actual >= 0.0 {
                g.stats.load_distance += result.actual.abs();
                g.stats.load_delta += result.delta.max(0.0);
            } else {
                g.stats.unload_distance += result.actual.abs();
                g.stats.unload_delta += result.delta.max(0.0);
            }
        }
    }

    fn start_spool_assist(&mut self, motor: Motor, distance: f64, speed: f64) -> bool {
        let cfg = &self.cfg.spool_assist;
        if !cfg.enabled || !motor.axis().moves_gear() || distance.abs() < cfg.min_distance {
            return false;
        }
        let power = assist_power(speed, cfg.max_stepper_speed, cfg.speed_exponent, cfg.max_power);
        let direction = if distance > 0.0 {
            AssistDirection::Assist
        } else {
            AssistDirection::Rewind
        };
        let Some(assist) = self.assist.as_mut() else {
            return false;
        };
        match assist.engage(direction, power) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "spool assist failed to engage");
                false
            }
        }
    }

    fn stop_spool_assist(&mut self) {
        if let Some(assist) = self.assist.as_mut()
            && let Err(e) = assist.stop()
        {
            tracing::warn!(error = %e, "spool assist failed to stop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("gear", Motor::Gear)]
    #[case("gear+extruder", Motor::GearAndExtruder)]
    #[case("extruder", Motor::ExtruderOnly)]
    #[case("extruder+gear", Motor::ExtruderDriven)]
    fn motor_names_parse(#[case] name: &str, #[case] motor: Motor) {
        assert_eq!(name.parse::<Motor>().ok(), Some(motor));
        assert_eq!(motor.to_string(), name);
    }

    #[test]
    fn unknown_names_are_config_faults() {
        let e = "stepper".parse::<Motor>().err();
        assert!(e.is_some_and(|f| f.is_fatal()));
        let e = "collision".parse::<Endstop>().err();
        assert!(e.is_some_and(|f| f.is_fatal()));
    }

    #[test]
    fn delta_without_encoder_is_zero() {
        let r = MoveResult::new(-40.0, false, None);
        assert_eq!(r.delta, 0.0);
        let r = MoveResult::new(-40.0, false, Some(38.5));
        assert!((r.delta - 1.5).abs() < 1e-12);
    }

    #[rstest]
    #[case(300.0, 100)]
    #[case(600.0, 100)]
    #[case(75.0, 50)]
    #[case(0.0, 0)]
    fn assist_power_scales_with_speed(#[case] speed: f64, #[case] expected: u8) {
        assert_eq!(assist_power(speed, 300.0, 0.5, 100), expected);
    }
}

//! Simulated filament path.
//!
//! The filament tip is tracked along a single axis in millimetres, with the
//! gate sensor at 0. Moves are integrated in small steps so that sensors,
//! the encoder and mechanical blocking (extruder gears, gear grip) resolve
//! in order.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use mmu_traits::{
    AssistDirection, AxisRole, Coupling, Encoder, HomingEdge, HomingOutcome, HwResult,
    MotionController, SensorProvider, SpoolAssist,
};

use crate::error::HwError;

const STEP_MM: f64 = 0.1;
/// Distance before the extruder gears at which they catch the filament.
const GRAB_MM: f64 = 0.5;

pub const GATE_SENSOR: &str = "mmu_gate";
pub const GEAR_SENSOR: &str = "mmu_gear";
pub const ENTRY_SENSOR: &str = "extruder";
pub const TOOLHEAD_SENSOR: &str = "toolhead";
pub const GEAR_TOUCH: &str = "mmu_gear_touch";
pub const TENSION_SENSOR: &str = "filament_tension";
pub const COMPRESSION_SENSOR: &str = "filament_compression";

/// Positions along the path, relative to the gate sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct PathGeometry {
    pub gear_sensor_at: f64,
    pub encoder_at: f64,
    pub entry_sensor_at: f64,
    pub extruder_gears_at: f64,
    pub toolhead_sensor_at: f64,
    pub nozzle_at: f64,
    /// Retracting past this point drops the filament out of the gear.
    pub gear_reach: f64,
}

impl Default for PathGeometry {
    fn default() -> Self {
        Self {
            gear_sensor_at: -8.0,
            encoder_at: 5.0,
            entry_sensor_at: 600.0,
            extruder_gears_at: 610.0,
            toolhead_sensor_at: 625.0,
            nozzle_at: 670.0,
            gear_reach: -60.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MoveRecord {
    pub axis: AxisRole,
    pub commanded: f64,
    pub speed: f64,
    pub homing: Option<String>,
}

#[derive(Debug)]
pub struct SimWorld {
    pub geometry: PathGeometry,
    pub tip: f64,
    pub filament_present: bool,
    pub gripped: bool,
    pub coupling: Coupling,
    /// Fraction of gear motion lost to slippage (0.0..1.0).
    pub slip: f64,
    pub encoder_distance: f64,
    pub gear_position: f64,
    pub extruder_position: f64,
    pub gear_current: u8,
    pub extruder_current: u8,
    pub pending_faults: u32,
    pub fitted: HashSet<String>,
    pub moves: Vec<MoveRecord>,
    pub assist: Vec<(AssistDirection, u8)>,
    pub grip_toggles: u32,
    last_blocked: bool,
}

impl SimWorld {
    fn new(geometry: PathGeometry) -> Self {
        let fitted = [GATE_SENSOR, ENTRY_SENSOR, TOOLHEAD_SENSOR, GEAR_TOUCH]
            .into_iter()
            .map(str::to_string)
            .collect();
        Self {
            geometry,
            tip: 0.0,
            filament_present: false,
            gripped: false,
            coupling: Coupling::None,
            slip: 0.0,
            encoder_distance: 0.0,
            gear_position: 0.0,
            extruder_position: 0.0,
            gear_current: 100,
            extruder_current: 100,
            pending_faults: 0,
            fitted,
            moves: Vec::new(),
            assist: Vec::new(),
            grip_toggles: 0,
            last_blocked: false,
        }
    }

    fn in_extruder(&self) -> bool {
        self.filament_present && self.tip >= self.geometry.extruder_gears_at - GRAB_MM
    }

    fn gear_engaged(&self) -> bool {
        self.filament_present && self.gripped && self.tip >= self.geometry.gear_reach
    }

    fn sensor_state(&self, name: &str) -> Option<bool> {
        if !self.fitted.contains(name) {
            return None;
        }
        let g = &self.geometry;
        let at = |p: f64| self.filament_present && self.tip >= p;
        Some(match name {
            GATE_SENSOR => at(0.0),
            GEAR_SENSOR => at(g.gear_sensor_at),
            ENTRY_SENSOR => at(g.entry_sensor_at),
            TOOLHEAD_SENSOR => at(g.toolhead_sensor_at),
            GEAR_TOUCH => self.last_blocked,
            // Sync-feedback sensors read neutral in the simulation.
            TENSION_SENSOR | COMPRESSION_SENSOR => false,
            _ => return None,
        })
    }

    /// Filament motion caused by `step` mm of stepper motion on `axis`.
    fn filament_delta(&mut self, axis: AxisRole, step: f64) -> f64 {
        let axis = match (axis, self.coupling) {
            (AxisRole::Extruder, Coupling::GearToExtruder) => AxisRole::ExtruderAndGear,
            (a, _) => a,
        };
        let grab = self.geometry.extruder_gears_at - GRAB_MM;
        self.last_blocked = false;
        match axis {
            AxisRole::Gear => {
                if !self.gear_engaged() {
                    return 0.0;
                }
                if self.in_extruder() {
                    // Extruder gears hold the filament in both directions.
                    self.last_blocked = true;
                    return 0.0;
                }
                let d = step * (1.0 - self.slip);
                if d > 0.0 && self.tip + d > grab {
                    self.last_blocked = true;
                    return grab - self.tip;
                }
                d
            }
            AxisRole::Extruder => {
                if self.in_extruder() {
                    step
                } else {
                    0.0
                }
            }
            AxisRole::GearAndExtruder | AxisRole::ExtruderAndGear => {
                if self.in_extruder() {
                    step
                } else if self.gear_engaged() {
                    step * (1.0 - self.slip)
                } else {
                    0.0
                }
            }
        }
    }

    fn apply(&mut self, axis: AxisRole, step: f64) {
        if axis.moves_gear() {
            self.gear_position += step;
        }
        if axis.moves_extruder() {
            self.extruder_position += step;
        }
        let delta = self.filament_delta(axis, step);
        if delta == 0.0 {
            return;
        }
        let before = self.tip;
        self.tip += delta;
        let lo = before.min(self.tip).max(self.geometry.encoder_at);
        let hi = before.max(self.tip);
        if hi > lo {
            self.encoder_distance += hi - lo;
        }
        if self.tip < self.geometry.gear_reach {
            // Retracted out of the gear: filament now rests in the gate.
            self.tip = self.geometry.gear_reach - 1.0;
        }
    }

    /// Integrate a move; stops early when `stop_when` returns true.
    fn integrate(
        &mut self,
        axis: AxisRole,
        distance: f64,
        mut stop_when: impl FnMut(&Self) -> bool,
    ) -> f64 {
        let dir = distance.signum();
        let mut remaining = distance.abs();
        let mut traveled = 0.0;
        while remaining > 1e-9 {
            if stop_when(self) {
                break;
            }
            let step = remaining.min(STEP_MM);
            self.apply(axis, dir * step);
            traveled += step;
            remaining -= step;
        }
        dir * traveled
    }
}

/// Shared simulated unit. Every collaborator handle points at the same world.
#[derive(Clone)]
pub struct SimulatedUnit {
    world: Rc<RefCell<SimWorld>>,
    stop: Arc<AtomicBool>,
}

impl Default for SimulatedUnit {
    fn default() -> Self {
        Self::new(PathGeometry::default())
    }
}

impl SimulatedUnit {
    pub fn new(geometry: PathGeometry) -> Self {
        Self {
            world: Rc::new(RefCell::new(SimWorld::new(geometry))),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Put a filament end into the gate at `tip` mm from the gate sensor.
    pub fn insert_filament(&self, tip: f64) {
        let mut w = self.world.borrow_mut();
        w.filament_present = true;
        w.tip = tip;
    }

    pub fn remove_filament(&self) {
        self.world.borrow_mut().filament_present = false;
    }

    pub fn set_slip(&self, fraction: f64) {
        self.world.borrow_mut().slip = fraction.clamp(0.0, 0.95);
    }

    /// The next `n` homing moves fail with a communication timeout.
    pub fn inject_homing_faults(&self, n: u32) {
        self.world.borrow_mut().pending_faults = n;
    }

    pub fn fit_sensor(&self, name: &str) {
        self.world.borrow_mut().fitted.insert(name.to_string());
    }

    pub fn unfit_sensor(&self, name: &str) {
        self.world.borrow_mut().fitted.remove(name);
    }

    /// Drive the grip directly, as a user-defined macro would.
    pub fn set_gripped(&self, gripped: bool) {
        let mut w = self.world.borrow_mut();
        if w.gripped != gripped {
            w.gripped = gripped;
            w.grip_toggles += 1;
        }
    }

    /// Flag checked before every move; set it to cancel motion.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn tip(&self) -> f64 {
        self.world.borrow().tip
    }

    pub fn with_world<R>(&self, f: impl FnOnce(&SimWorld) -> R) -> R {
        f(&self.world.borrow())
    }

    pub fn motion(&self) -> SimMotion {
        SimMotion {
            world: Rc::clone(&self.world),
            stop: Arc::clone(&self.stop),
        }
    }

    pub fn sensors(&self) -> SimSensors {
        SimSensors {
            world: Rc::clone(&self.world),
        }
    }

    pub fn encoder(&self) -> SimEncoder {
        SimEncoder {
            world: Rc::clone(&self.world),
        }
    }

    pub fn spool_assist(&self) -> SimSpoolAssist {
        SimSpoolAssist {
            world: Rc::clone(&self.world),
        }
    }

    pub(crate) fn world_handle(&self) -> Rc<RefCell<SimWorld>> {
        Rc::clone(&self.world)
    }
}

pub struct SimMotion {
    world: Rc<RefCell<SimWorld>>,
    stop: Arc<AtomicBool>,
}

impl SimMotion {
    fn check_stop(&self) -> crate::error::Result<()> {
        if self.stop.load(Ordering::Relaxed) {
            return Err(HwError::Stopped);
        }
        Ok(())
    }
}

impl MotionController for SimMotion {
    fn drive_move(
        &mut self,
        axis: AxisRole,
        distance: f64,
        speed: f64,
        _accel: f64,
    ) -> HwResult<()> {
        self.check_stop()?;
        let mut w = self.world.borrow_mut();
        w.moves.push(MoveRecord {
            axis,
            commanded: distance,
            speed,
            homing: None,
        });
        w.integrate(axis, distance, |_| false);
        tracing::trace!(?axis, distance, tip = w.tip, "sim move");
        Ok(())
    }

    fn homing_move(
        &mut self,
        axis: AxisRole,
        distance: f64,
        speed: f64,
        _accel: f64,
        endstop: &str,
        edge: HomingEdge,
    ) -> HwResult<HomingOutcome> {
        self.check_stop()?;
        let mut w = self.world.borrow_mut();
        if w.pending_faults > 0 {
            w.pending_faults -= 1;
            return Err(Box::new(HwError::CommTimeout));
        }
        if w.sensor_state(endstop).is_none() {
            return Err(Box::new(HwError::UnknownEndstop(endstop.to_string())));
        }
        w.moves.push(MoveRecord {
            axis,
            commanded: distance,
            speed,
            homing: Some(endstop.to_string()),
        });
        let reached = |w: &SimWorld| {
            let state = w.sensor_state(endstop).unwrap_or(false);
            match edge {
                HomingEdge::Trigger => state,
                HomingEdge::Release => !state,
            }
        };
        let traveled = w.integrate(axis, distance, reached);
        let triggered = reached(&w);
        tracing::trace!(?axis, endstop, traveled, triggered, tip = w.tip, "sim homing move");
        Ok(HomingOutcome { traveled, triggered })
    }

    fn commanded_position(&self, axis: AxisRole) -> f64 {
        let w = self.world.borrow();
        match axis {
            AxisRole::Extruder | AxisRole::ExtruderAndGear => w.extruder_position,
            AxisRole::Gear | AxisRole::GearAndExtruder => w.gear_position,
        }
    }

    fn set_current_percent(&mut self, axis: AxisRole, pct: u8) -> HwResult<()> {
        let mut w = self.world.borrow_mut();
        if axis.moves_gear() {
            w.gear_current = pct;
        }
        if axis.moves_extruder() {
            w.extruder_current = pct;
        }
        Ok(())
    }

    fn set_coupling(&mut self, coupling: Coupling) -> HwResult<()> {
        self.world.borrow_mut().coupling = coupling;
        Ok(())
    }
}

pub struct SimSensors {
    world: Rc<RefCell<SimWorld>>,
}

impl SensorProvider for SimSensors {
    fn read_binary(&self, name: &str) -> Option<bool> {
        self.world.borrow().sensor_state(name)
    }
}

pub struct SimEncoder {
    world: Rc<RefCell<SimWorld>>,
}

impl Encoder for SimEncoder {
    fn distance(&self) -> f64 {
        self.world.borrow().encoder_distance
    }

    fn reset(&mut self) {
        self.world.borrow_mut().encoder_distance = 0.0;
    }
}

pub struct SimSpoolAssist {
    world: Rc<RefCell<SimWorld>>,
}

impl SpoolAssist for SimSpoolAssist {
    fn engage(&mut self, direction: AssistDirection, power_pct: u8) -> HwResult<()> {
        self.world.borrow_mut().assist.push((direction, power_pct));
        Ok(())
    }

    fn stop(&mut self) -> HwResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gripped_unit(tip: f64) -> SimulatedUnit {
        let unit = SimulatedUnit::default();
        unit.insert_filament(tip);
        unit.world.borrow_mut().gripped = true;
        unit
    }

    #[test]
    fn gear_move_is_blocked_at_extruder_gears() {
        let unit = gripped_unit(590.0);
        let mut m = unit.motion();
        m.drive_move(AxisRole::Gear, 50.0, 50.0, 100.0).unwrap();
        assert!((unit.tip() - 609.5).abs() < 1e-6);
    }

    #[test]
    fn encoder_only_counts_motion_past_its_position() {
        let unit = gripped_unit(0.0);
        let mut m = unit.motion();
        m.drive_move(AxisRole::Gear, 20.0, 50.0, 100.0).unwrap();
        let measured = unit.encoder().distance();
        assert!((measured - 15.0).abs() < 1e-6, "measured {measured}");
    }

    #[test]
    fn homing_stops_on_trigger() {
        let unit = gripped_unit(-12.0);
        let mut m = unit.motion();
        let out = m
            .homing_move(AxisRole::Gear, 100.0, 50.0, 100.0, GATE_SENSOR, HomingEdge::Trigger)
            .unwrap();
        assert!(out.triggered);
        assert!((out.traveled - 12.0).abs() <= STEP_MM + 1e-6);
    }

    #[test]
    fn ungripped_gear_does_not_move_filament() {
        let unit = SimulatedUnit::default();
        unit.insert_filament(-10.0);
        let mut m = unit.motion();
        m.drive_move(AxisRole::Gear, 30.0, 50.0, 100.0).unwrap();
        assert_eq!(unit.tip(), -10.0);
    }
}

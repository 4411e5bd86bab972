//! Scriptable collaborators for tests and dry runs.
//!
//! A [`MockRig`] hands out motion, sensor, encoder and grip handles over
//! one shared state. Sensors are set by name, homing moves trigger or not as
//! told, and each move credits the encoder with a scripted fraction of its
//! travel.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use mmu_traits::{
    AxisRole, Coupling, Encoder, HomingEdge, HomingOutcome, HwResult, MotionController, Selector,
    SensorProvider,
};

/// One recorded move.
#[derive(Debug, Clone, PartialEq)]
pub struct RigMove {
    pub axis: AxisRole,
    pub distance: f64,
    pub endstop: Option<String>,
}

#[derive(Debug)]
struct RigState {
    sensors: HashMap<String, bool>,
    encoder: f64,
    /// Fraction of each move the encoder sees, consumed front first.
    script: VecDeque<f64>,
    default_fraction: f64,
    homing_triggers: bool,
    /// Fraction of a homing move travelled before the endstop fires.
    homing_fraction: f64,
    moves: Vec<RigMove>,
    coupling: Coupling,
    gear_current: u8,
    gripped: bool,
    grip_changes: u32,
    fail_moves: u32,
}

impl Default for RigState {
    fn default() -> Self {
        Self {
            sensors: HashMap::new(),
            encoder: 0.0,
            script: VecDeque::new(),
            default_fraction: 1.0,
            homing_triggers: true,
            homing_fraction: 0.5,
            moves: Vec::new(),
            coupling: Coupling::None,
            gear_current: 100,
            gripped: false,
            grip_changes: 0,
            fail_moves: 0,
        }
    }
}

impl RigState {
    fn credit(&mut self, distance: f64) {
        let fraction = self.script.pop_front().unwrap_or(self.default_fraction);
        self.encoder += distance.abs() * fraction;
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockRig {
    state: Rc<RefCell<RigState>>,
}

impl MockRig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fit a sensor with the given reading.
    pub fn set_sensor(&self, name: &str, triggered: bool) {
        self.state.borrow_mut().sensors.insert(name.to_string(), triggered);
    }

    pub fn unfit_sensor(&self, name: &str) {
        self.state.borrow_mut().sensors.remove(name);
    }

    /// Encoder fractions for the next moves, in order.
    pub fn script_encoder(&self, fractions: &[f64]) {
        self.state.borrow_mut().script.extend(fractions.iter().copied());
    }

    /// Encoder fraction once the script runs out.
    pub fn set_default_fraction(&self, fraction: f64) {
        self.state.borrow_mut().default_fraction = fraction;
    }

    pub fn set_homing_triggers(&self, triggers: bool) {
        self.state.borrow_mut().homing_triggers = triggers;
    }

    /// The next `n` moves fail with a timeout.
    pub fn fail_next_moves(&self, n: u32) {
        self.state.borrow_mut().fail_moves = n;
    }

    pub fn moves(&self) -> Vec<RigMove> {
        self.state.borrow().moves.clone()
    }

    pub fn coupling(&self) -> Coupling {
        self.state.borrow().coupling
    }

    pub fn gear_current(&self) -> u8 {
        self.state.borrow().gear_current
    }

    pub fn is_gripped(&self) -> bool {
        self.state.borrow().gripped
    }

    pub fn grip_changes(&self) -> u32 {
        self.state.borrow().grip_changes
    }

    pub fn motion(&self) -> RigMotion {
        RigMotion {
            state: Rc::clone(&self.state),
        }
    }

    pub fn sensors(&self) -> RigSensors {
        RigSensors {
            state: Rc::clone(&self.state),
        }
    }

    pub fn encoder(&self) -> RigEncoder {
        RigEncoder {
            state: Rc::clone(&self.state),
        }
    }

    pub fn grip(&self) -> RigGrip {
        RigGrip {
            state: Rc::clone(&self.state),
        }
    }
}

fn timeout() -> Box<dyn std::error::Error + Send + Sync> {
    Box::new(std::io::Error::new(std::io::ErrorKind::TimedOut, "mock controller timeout"))
}

pub struct RigMotion {
    state: Rc<RefCell<RigState>>,
}

impl MotionController for RigMotion {
    fn drive_move(
        &mut self,
        axis: AxisRole,
        distance: f64,
        _speed: f64,
        _accel: f64,
    ) -> HwResult<()> {
        let mut s = self.state.borrow_mut();
        if s.fail_moves > 0 {
            s.fail_moves -= 1;
            return Err(timeout());
        }
        s.moves.push(RigMove {
            axis,
            distance,
            endstop: None,
        });
        s.credit(distance);
        Ok(())
    }

    fn homing_move(
        &mut self,
        axis: AxisRole,
        distance: f64,
        _speed: f64,
        _accel: f64,
        endstop: &str,
        _edge: HomingEdge,
    ) -> HwResult<HomingOutcome> {
        let mut s = self.state.borrow_mut();
        if s.fail_moves > 0 {
            s.fail_moves -= 1;
            return Err(timeout());
        }
        s.moves.push(RigMove {
            axis,
            distance,
            endstop: Some(endstop.to_string()),
        });
        let triggered = s.homing_triggers;
        let traveled = if triggered { distance * s.homing_fraction } else { distance };
        s.credit(traveled);
        Ok(HomingOutcome { traveled, triggered })
    }

    fn commanded_position(&self, axis: AxisRole) -> f64 {
        self.state
            .borrow()
            .moves
            .iter()
            .filter(|m| m.axis == axis)
            .map(|m| m.distance)
            .sum()
    }

    fn set_current_percent(&mut self, axis: AxisRole, pct: u8) -> HwResult<()> {
        if axis.moves_gear() {
            self.state.borrow_mut().gear_current = pct;
        }
        Ok(())
    }

    fn set_coupling(&mut self, coupling: Coupling) -> HwResult<()> {
        self.state.borrow_mut().coupling = coupling;
        Ok(())
    }
}

pub struct RigSensors {
    state: Rc<RefCell<RigState>>,
}

impl SensorProvider for RigSensors {
    fn read_binary(&self, name: &str) -> Option<bool> {
        self.state.borrow().sensors.get(name).copied()
    }
}

pub struct RigEncoder {
    state: Rc<RefCell<RigState>>,
}

impl Encoder for RigEncoder {
    fn distance(&self) -> f64 {
        self.state.borrow().encoder
    }

    fn reset(&mut self) {
        self.state.borrow_mut().encoder = 0.0;
    }
}

pub struct RigGrip {
    state: Rc<RefCell<RigState>>,
}

impl RigGrip {
    fn set(&self, gripped: bool) {
        let mut s = self.state.borrow_mut();
        if s.gripped != gripped {
            s.gripped = gripped;
            s.grip_changes += 1;
        }
    }
}

impl Selector for RigGrip {
    fn drive_grip(&mut self) -> HwResult<()> {
        self.set(true);
        Ok(())
    }

    fn release_grip(&mut self) -> HwResult<()> {
        self.set(false);
        Ok(())
    }

    fn hold_for_move(&mut self) -> HwResult<()> {
        self.set(true);
        Ok(())
    }

    fn is_gripped(&self) -> bool {
        self.state.borrow().gripped
    }

    fn family(&self) -> &'static str {
        "mock"
    }
}

//! Grip implementations, one per selector family.
//!
//! Homing and positioning of the selector itself are handled elsewhere; the
//! transport core only needs to grip, release and hold filament.

use std::cell::RefCell;
use std::rc::Rc;

use mmu_traits::{HwResult, Selector};

use crate::error::HwError;
use crate::sim::{SimWorld, SimulatedUnit};

/// Servo-gripped linear selector (one gear, servo pinches filament against it).
pub struct LinearSelector {
    world: Rc<RefCell<SimWorld>>,
    servo_moves: u32,
}

impl LinearSelector {
    pub fn new(unit: &SimulatedUnit) -> Self {
        Self {
            world: unit.world_handle(),
            servo_moves: 0,
        }
    }

    /// Number of servo position changes, for chatter checks.
    pub fn servo_moves(&self) -> u32 {
        self.servo_moves
    }

    fn set(&mut self, gripped: bool) {
        let mut w = self.world.borrow_mut();
        if w.gripped != gripped {
            w.gripped = gripped;
            w.grip_toggles += 1;
            self.servo_moves += 1;
        }
    }
}

impl Selector for LinearSelector {
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
        self.world.borrow().gripped
    }

    fn family(&self) -> &'static str {
        "linear"
    }
}

/// Rotary selector: the gear engages filament by rotating onto the gate.
pub struct RotarySelector {
    world: Rc<RefCell<SimWorld>>,
    engaged_angle: f64,
    release_angle: f64,
    angle: f64,
}

impl RotarySelector {
    pub fn new(unit: &SimulatedUnit, engaged_angle: f64, release_angle: f64) -> Self {
        Self {
            world: unit.world_handle(),
            engaged_angle,
            release_angle,
            angle: release_angle,
        }
    }

    pub fn angle(&self) -> f64 {
        self.angle
    }

    fn rotate_to(&mut self, angle: f64) {
        if (self.angle - angle).abs() > f64::EPSILON {
            self.angle = angle;
            let mut w = self.world.borrow_mut();
            w.gripped = (angle - self.engaged_angle).abs() <= f64::EPSILON;
            w.grip_toggles += 1;
        }
    }
}

impl Selector for RotarySelector {
    fn drive_grip(&mut self) -> HwResult<()> {
        self.rotate_to(self.engaged_angle);
        Ok(())
    }

    fn release_grip(&mut self) -> HwResult<()> {
        self.rotate_to(self.release_angle);
        Ok(())
    }

    fn hold_for_move(&mut self) -> HwResult<()> {
        self.rotate_to(self.engaged_angle);
        Ok(())
    }

    fn is_gripped(&self) -> bool {
        self.world.borrow().gripped
    }

    fn family(&self) -> &'static str {
        "rotary"
    }
}

/// Per-gate gear design: filament is always gripped, grip commands are no-ops.
pub struct VirtualSelector {
    world: Rc<RefCell<SimWorld>>,
}

impl VirtualSelector {
    pub fn new(unit: &SimulatedUnit) -> Self {
        unit.world_handle().borrow_mut().gripped = true;
        Self {
            world: unit.world_handle(),
        }
    }
}

impl Selector for VirtualSelector {
    fn drive_grip(&mut self) -> HwResult<()> {
        Ok(())
    }

    fn release_grip(&mut self) -> HwResult<()> {
        Ok(())
    }

    fn hold_for_move(&mut self) -> HwResult<()> {
        Ok(())
    }

    fn is_gripped(&self) -> bool {
        self.world.borrow().gripped
    }

    fn filament_always_gripped(&self) -> bool {
        true
    }

    fn family(&self) -> &'static str {
        "virtual"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GripAction {
    Drive,
    Release,
    Hold,
}

type GripHook = Box<dyn FnMut(GripAction) -> Result<(), String>>;

/// Selector whose grip is delegated to user-defined actions.
pub struct MacroSelector {
    hook: GripHook,
    gripped: bool,
}

impl MacroSelector {
    pub fn new(hook: impl FnMut(GripAction) -> Result<(), String> + 'static) -> Self {
        Self {
            hook: Box::new(hook),
            gripped: false,
        }
    }

    fn run(&mut self, action: GripAction) -> HwResult<()> {
        (self.hook)(action).map_err(HwError::Actuator)?;
        self.gripped = !matches!(action, GripAction::Release);
        Ok(())
    }
}

impl Selector for MacroSelector {
    fn drive_grip(&mut self) -> HwResult<()> {
        self.run(GripAction::Drive)
    }

    fn release_grip(&mut self) -> HwResult<()> {
        self.run(GripAction::Release)
    }

    fn hold_for_move(&mut self) -> HwResult<()> {
        self.run(GripAction::Hold)
    }

    fn is_gripped(&self) -> bool {
        self.gripped
    }

    fn family(&self) -> &'static str {
        "macro"
    }
}

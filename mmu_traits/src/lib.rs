//! Collaborator contracts for the filament transport core.
//!
//! Everything the core needs from the outside world (motion controller,
//! sensors, encoder, selector grip, spool assist, persistence) is expressed
//! here as a small trait. Errors cross these boundaries boxed so that any
//! backend can report its own error type; `mmu_core` classifies them.

pub mod clock;

pub use clock::{Clock, ManualClock, MonotonicClock};

/// Result type used at every collaborator boundary.
pub type HwResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Steppers taking part in a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AxisRole {
    /// MMU gear stepper only.
    Gear,
    /// Gear leading, extruder following.
    GearAndExtruder,
    /// Extruder stepper only.
    Extruder,
    /// Extruder leading, gear following.
    ExtruderAndGear,
}

impl AxisRole {
    #[inline]
    pub fn moves_gear(self) -> bool {
        !matches!(self, AxisRole::Extruder)
    }

    #[inline]
    pub fn moves_extruder(self) -> bool {
        !matches!(self, AxisRole::Gear)
    }
}

/// Mechanical/logical coupling between gear and extruder steppers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Coupling {
    #[default]
    None,
    /// Gear follows extruder motion (printing).
    GearToExtruder,
    /// Extruder follows gear motion.
    ExtruderToGear,
    /// Extruder follows gear motion but only the extruder is energized.
    ExtruderOnlyOnGear,
}

/// Which endstop edge terminates a homing move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomingEdge {
    /// Stop when the endstop becomes triggered.
    Trigger,
    /// Stop when the endstop stops being triggered.
    Release,
}

/// Outcome of a homing move as reported by the motion controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HomingOutcome {
    /// Distance actually travelled by the stepper (signed like the request).
    pub traveled: f64,
    pub triggered: bool,
}

pub trait MotionController {
    /// Blocking move of `distance` mm; returns once motion has completed.
    fn drive_move(&mut self, axis: AxisRole, distance: f64, speed: f64, accel: f64) -> HwResult<()>;

    /// Bounded move that ends early when `endstop` reaches `edge`.
    fn homing_move(
        &mut self,
        axis: AxisRole,
        distance: f64,
        speed: f64,
        accel: f64,
        endstop: &str,
        edge: HomingEdge,
    ) -> HwResult<HomingOutcome>;

    /// Commanded stepper position for `axis` in mm.
    fn commanded_position(&self, axis: AxisRole) -> f64;

    fn set_current_percent(&mut self, axis: AxisRole, pct: u8) -> HwResult<()>;

    fn set_coupling(&mut self, coupling: Coupling) -> HwResult<()>;
}

pub trait SensorProvider {
    /// `Some(triggered)` or `None` when the sensor is not fitted or disabled.
    fn read_binary(&self, name: &str) -> Option<bool>;
}

/// Filament motion encoder. Distance only ever increases.
pub trait Encoder {
    fn distance(&self) -> f64;
    fn reset(&mut self);
}

/// Filament grip of a selector family.
pub trait Selector {
    fn drive_grip(&mut self) -> HwResult<()>;
    fn release_grip(&mut self) -> HwResult<()>;
    /// Grip the filament for an imminent gear move.
    fn hold_for_move(&mut self) -> HwResult<()>;
    fn is_gripped(&self) -> bool;

    /// Designs where each gate has its own gear keep filament gripped permanently.
    fn filament_always_gripped(&self) -> bool {
        false
    }

    fn family(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssistDirection {
    /// Feed from the spool while loading.
    Assist,
    /// Wind back onto the spool while unloading.
    Rewind,
}

pub trait SpoolAssist {
    fn engage(&mut self, direction: AssistDirection, power_pct: u8) -> HwResult<()>;
    fn stop(&mut self) -> HwResult<()>;
}

/// Value kinds a persistence backend stores.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    Int(i64),
    Float(f64),
    List(Vec<f64>),
}

impl StoredValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            StoredValue::Int(v) => Some(*v),
            StoredValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StoredValue::Int(v) => Some(*v as f64),
            StoredValue::Float(v) => Some(*v),
            StoredValue::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[f64]> {
        match self {
            StoredValue::List(v) => Some(v),
            _ => None,
        }
    }
}

/// Key/value store read at startup and written at checkpoints.
pub trait PersistenceStore {
    fn get(&self, key: &str, default: StoredValue) -> StoredValue;
    /// Stage a value; it becomes durable on the next `flush`.
    fn set(&mut self, key: &str, value: StoredValue);
    fn flush(&mut self) -> HwResult<()>;
}

// ── Boxed forwarding ─────────────────────────────────────────────────────────

impl<T: MotionController + ?Sized> MotionController for Box<T> {
    fn drive_move(
        &mut self,
        axis: AxisRole,
        distance: f64,
        speed: f64,
        accel: f64,
    ) -> HwResult<()> {
        (**self).drive_move(axis, distance, speed, accel)
    }
    fn homing_move(
        &mut self,
        axis: AxisRole,
        distance: f64,
        speed: f64,
        accel: f64,
        endstop: &str,
        edge: HomingEdge,
    ) -> HwResult<HomingOutcome> {
        (**self).homing_move(axis, distance, speed, accel, endstop, edge)
    }
    fn commanded_position(&self, axis: AxisRole) -> f64 {
        (**self).commanded_position(axis)
    }
    fn set_current_percent(&mut self, axis: AxisRole, pct: u8) -> HwResult<()> {
        (**self).set_current_percent(axis, pct)
    }
    fn set_coupling(&mut self, coupling: Coupling) -> HwResult<()> {
        (**self).set_coupling(coupling)
    }
}

impl<T: SensorProvider + ?Sized> SensorProvider for Box<T> {
    fn read_binary(&self, name: &str) -> Option<bool> {
        (**self).read_binary(name)
    }
}

impl<T: Selector + ?Sized> Selector for Box<T> {
    fn drive_grip(&mut self) -> HwResult<()> {
        (**self).drive_grip()
    }
    fn release_grip(&mut self) -> HwResult<()> {
        (**self).release_grip()
    }
    fn hold_for_move(&mut self) -> HwResult<()> {
        (**self).hold_for_move()
    }
    fn is_gripped(&self) -> bool {
        (**self).is_gripped()
    }
    fn filament_always_gripped(&self) -> bool {
        (**self).filament_always_gripped()
    }
    fn family(&self) -> &'static str {
        (**self).family()
    }
}

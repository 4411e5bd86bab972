use std::fmt;

use thiserror::Error;

/// Fault classes. Only `Config` faults are fatal in the sense that retrying
/// can never help; the caller decides what to do with the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Invalid motor/endstop name, missing sensor for the selected technique.
    Config,
    /// Homing never triggered, encoder validation failed, sensor contradicts state.
    Motion,
    /// Controller communication timeout or stop request.
    Transient,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FaultKind::Config => "configuration",
            FaultKind::Motion => "motion",
            FaultKind::Transient => "transient",
        })
    }
}

/// Where in the pipeline a fault was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Move,
    Gate,
    Bowden,
    ExtruderHoming,
    Toolhead,
    Tip,
    PreUnloadProbe,
    Park,
    Sync,
    Recovery,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Move => "move",
            Stage::Gate => "gate",
            Stage::Bowden => "bowden",
            Stage::ExtruderHoming => "extruder homing",
            Stage::Toolhead => "toolhead",
            Stage::Tip => "tip",
            Stage::PreUnloadProbe => "pre-unload probe",
            Stage::Park => "gate park",
            Stage::Sync => "sync",
            Stage::Recovery => "recovery",
        })
    }
}

/// Classified transport failure with the motion context it happened in.
#[derive(Debug, Error, Clone, PartialEq)]
pub struct TransportFault {
    pub kind: FaultKind,
    pub stage: Stage,
    pub message: String,
    pub gate: Option<usize>,
    /// Distance the stepper was asked to move (mm).
    pub commanded: Option<f64>,
    /// Distance the encoder saw (mm).
    pub measured: Option<f64>,
}

impl TransportFault {
    pub fn new(kind: FaultKind, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            message: message.into(),
            gate: None,
            commanded: None,
            measured: None,
        }
    }

    pub fn config(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(FaultKind::Config, stage, message)
    }

    pub fn motion(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(FaultKind::Motion, stage, message)
    }

    #[must_use]
    pub fn with_distances(mut self, commanded: f64, measured: Option<f64>) -> Self {
        self.commanded = Some(commanded);
        self.measured = measured;
        self
    }

    #[must_use]
    pub fn for_gate(mut self, gate: Option<usize>) -> Self {
        if self.gate.is_none() {
            self.gate = gate;
        }
        self
    }

    /// Re-attribute a lower-level fault to the stage that was running.
    #[must_use]
    pub fn in_stage(mut self, stage: Stage) -> Self {
        if self.stage == Stage::Move {
            self.stage = stage;
        }
        self
    }

    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.kind == FaultKind::Config
    }
}

impl fmt::Display for TransportFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} fault during {}: {}", self.kind, self.stage, self.message)?;
        if let Some(g) = self.gate {
            write!(f, " (gate {g})")?;
        }
        match (self.commanded, self.measured) {
            (Some(c), Some(m)) => write!(f, " [commanded {c:.1}mm, measured {m:.1}mm]"),
            (Some(c), None) => write!(f, " [commanded {c:.1}mm]"),
            _ => Ok(()),
        }
    }
}

/// Requests refused before any motion happens.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StateError {
    #[error("unit is locked after a failure during a print; recover and unlock first")]
    Locked,
    #[error("no gate selected")]
    NoGateSelected,
    #[error("gate {0} is out of range")]
    GateOutOfRange(usize),
    #[error("missing calibration: {0}")]
    Uncalibrated(String),
    #[error("filament position {0} does not allow this operation")]
    InvalidPosition(String),
}

#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("missing motion controller")]
    MissingMotion,
    #[error("missing sensor provider")]
    MissingSensors,
    #[error("missing selector")]
    MissingSelector,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

/// Result type of stage-level functions.
pub type FaultResult<T> = std::result::Result<T, TransportFault>;

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;

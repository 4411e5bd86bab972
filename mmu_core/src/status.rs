//! Reports returned by the sequence operations.

use std::fmt;

use crate::calibration::AutotuneOutcome;
use crate::gate::GateSelection;
use crate::position::FilamentPosition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceKind {
    Load,
    Unload,
    Eject,
}

impl fmt::Display for SequenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Load => "load",
            Self::Unload => "unload",
            Self::Eject => "eject",
        })
    }
}

/// Outcome of a completed load, unload or eject.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceReport {
    pub kind: SequenceKind,
    pub gate: GateSelection,
    pub start: FilamentPosition,
    pub end: FilamentPosition,
    /// Absolute filament distance commanded over the whole sequence (mm).
    pub moved: f64,
    pub corrections: u8,
    pub warnings: Vec<String>,
    pub autotune: AutotuneOutcome,
    pub duration_ms: u64,
}

impl SequenceReport {
    pub fn new(kind: SequenceKind, gate: GateSelection, start: FilamentPosition) -> Self {
        Self {
            kind,
            gate,
            start,
            end: start,
            moved: 0.0,
            corrections: 0,
            warnings: Vec::new(),
            autotune: AutotuneOutcome::default(),
            duration_ms: 0,
        }
    }

    /// Nothing moved.
    pub fn is_noop(&self) -> bool {
        self.moved == 0.0 && self.start == self.end
    }

    pub(crate) fn warn(&mut self, msg: String) {
        tracing::warn!(kind = %self.kind, "{msg}");
        self.warnings.push(msg);
    }
}

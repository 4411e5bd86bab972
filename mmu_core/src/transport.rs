//! The transport (`Transport`): collaborators plus the owned controller state.
//!
//! Stage logic lives in `motion`, `sync`, `load`, `unload` and `recovery`,
//! each adding methods to this type.

use std::sync::Arc;

use eyre::WrapErr;
use mmu_traits::clock::Clock;
use mmu_traits::{
    Encoder, MotionController, PersistenceStore, Selector, SensorProvider, SpoolAssist,
};

use crate::calibration::{CalibrationMask, CalibrationStore, MissingCalibration};
use crate::config::TransportCfg;
use crate::error::{Report, Result, StateError, TransportFault};
use crate::gate::GateSelection;
use crate::position::FilamentPosition;
use crate::state::{ControllerState, PrintState};
use crate::status::SequenceKind;
use crate::sync::SyncState;

pub struct Transport<M: MotionController, S: SensorProvider, G: Selector> {
    pub(crate) motion: M,
    pub(crate) sensors: S,
    pub(crate) selector: G,
    pub(crate) encoder: Option<Box<dyn Encoder>>,
    pub(crate) assist: Option<Box<dyn SpoolAssist>>,
    pub(crate) store: Box<dyn PersistenceStore>,
    pub(crate) clock: Arc<dyn Clock + Send + Sync>,
    pub(crate) cfg: TransportCfg,
    pub(crate) state: ControllerState,
    /// Absolute filament distance commanded since construction (mm).
    pub(crate) odometer: f64,
}

impl<M: MotionController, S: SensorProvider, G: Selector> std::fmt::Debug for Transport<M, S, G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("position", &self.state.tracker.position())
            .field("selected", &self.state.gates.selected)
            .field("sync", &self.state.sync.state())
            .field("print_state", &self.state.print_state)
            .field("selector", &self.selector.family())
            .finish()
    }
}

impl<M: MotionController, S: SensorProvider, G: Selector> Transport<M, S, G> {
    #[inline]
    pub fn filament_position(&self) -> FilamentPosition {
        self.state.tracker.position()
    }

    #[inline]
    pub fn sync_state(&self) -> SyncState {
        self.state.sync.state()
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn cfg(&self) -> &TransportCfg {
        &self.cfg
    }

    /// Mutable access for calibration commands and imports. Filament
    /// position only moves through the sequences.
    pub fn calibration_mut(&mut self) -> &mut CalibrationStore {
        &mut self.state.calibration
    }

    pub fn motion(&self) -> &M {
        &self.motion
    }

    pub fn selector(&self) -> &G {
        &self.selector
    }

    pub fn store(&self) -> &dyn PersistenceStore {
        self.store.as_ref()
    }

    // ── Gate selection and print state ───────────────────────────────────────

    pub fn gate_selected(&self) -> GateSelection {
        self.state.gates.selected
    }

    /// Select a gate. Selector positioning is the caller's business.
    pub fn select_gate(&mut self, gate: usize) -> Result<()> {
        if gate >= self.state.gates.len() {
            return Err(Report::new(StateError::GateOutOfRange(gate)));
        }
        self.state.gates.selected = GateSelection::Gate(gate);
        tracing::info!(gate, "gate selected");
        Ok(())
    }

    pub fn select_bypass(&mut self) {
        self.state.gates.selected = GateSelection::Bypass;
        tracing::info!("bypass selected");
    }

    #[inline]
    pub(crate) fn bypass_selected(&self) -> bool {
        self.state.gates.selected == GateSelection::Bypass
    }

    #[inline]
    pub fn is_printing(&self) -> bool {
        self.state.print_state == PrintState::Printing
    }

    pub fn set_printing(&mut self, printing: bool) {
        if self.state.print_state == PrintState::PausedLocked {
            return;
        }
        self.state.print_state = if printing { PrintState::Printing } else { PrintState::Idle };
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.state.print_state == PrintState::PausedLocked
    }

    /// Clear the lock left by an in-print failure. The print resumes as active.
    pub fn unlock(&mut self) {
        if self.is_locked() {
            tracing::info!("unit unlocked");
            self.state.print_state = PrintState::Printing;
        }
    }

    pub(crate) fn ensure_unlocked(&self) -> Result<()> {
        if self.is_locked() {
            return Err(Report::new(StateError::Locked));
        }
        Ok(())
    }

    // ── Sensors and encoder ──────────────────────────────────────────────────

    /// `None` when the sensor is not fitted.
    #[inline]
    pub(crate) fn sensor(&self, name: &str) -> Option<bool> {
        self.sensors.read_binary(name)
    }

    #[inline]
    pub(crate) fn has_sensor(&self, name: &str) -> bool {
        self.sensor(name).is_some()
    }

    #[inline]
    pub fn has_encoder(&self) -> bool {
        self.encoder.is_some()
    }

    pub(crate) fn encoder_distance(&self) -> Option<f64> {
        self.encoder.as_ref().map(|e| e.distance())
    }

    // ── Position and persistence ─────────────────────────────────────────────

    /// The only path through which the filament position changes.
    pub(crate) fn transition(&mut self, target: FilamentPosition) {
        self.state.tracker.transition(target, self.store.as_mut());
    }

    pub fn check_calibrated(
        &self,
        mask: CalibrationMask,
        gates: &[usize],
    ) -> Vec<MissingCalibration> {
        self.state.calibration.check_calibrated(mask, gates)
    }

    /// Refuse an operation while anything in `mask` is uncalibrated.
    pub(crate) fn require_calibrated(&self, mask: CalibrationMask, gates: &[usize]) -> Result<()> {
        let missing = self.check_calibrated(mask, gates);
        if missing.is_empty() {
            return Ok(());
        }
        let text = missing.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ");
        Err(Report::new(StateError::Uncalibrated(text)))
    }

    /// Stage gate and calibration state and flush the store.
    pub fn persist(&mut self) -> Result<()> {
        self.state.checkpoint(self.store.as_mut());
        self.store
            .flush()
            .map_err(|e| eyre::eyre!(e.to_string()))
            .wrap_err("failed to persist controller state")
    }

    /// Bookkeeping common to every failed sequence, then the wrapped report.
    pub(crate) fn sequence_failed(&mut self, kind: SequenceKind, fault: TransportFault) -> Report {
        let selected = self.state.gates.selected;
        let fault = fault.for_gate(selected.gate());
        if let Some(g) = selected.gate().and_then(|g| self.state.gates.get_mut(g)) {
            match kind {
                SequenceKind::Load => g.stats.load_failures += 1,
                SequenceKind::Unload | SequenceKind::Eject => g.stats.unload_failures += 1,
            }
        }
        tracing::error!(
            kind = %kind,
            fault_kind = %fault.kind,
            stage = %fault.stage,
            commanded = ?fault.commanded,
            measured = ?fault.measured,
            "{}",
            fault.message
        );

        if self.is_printing() {
            self.state.print_state = PrintState::PausedLocked;
            tracing::warn!("unit locked until recovered and unlocked");
        } else if self.cfg.recovery.auto_recover && !fault.is_fatal() {
            match self.recover(false, false) {
                Ok(pos) => tracing::info!(position = %pos, "automatic recovery"),
                Err(e) => tracing::warn!(error = %e, "automatic recovery failed"),
            }
        }
        if let Err(e) = self.persist() {
            tracing::warn!(error = %e, "state not persisted after failure");
        }

        let target = match selected {
            GateSelection::Gate(g) => format!("gate {g}"),
            GateSelection::Bypass => "bypass".to_string(),
            GateSelection::Unknown => "unknown gate".to_string(),
        };
        Report::new(fault).wrap_err(format!("{kind} sequence failed for {target}"))
    }

    pub(crate) fn elapsed_ms_since(&self, start: std::time::Instant) -> u64 {
        self.clock.ms_since(start)
    }
}

//! The single owned controller state.

use std::collections::HashMap;

use mmu_traits::{HwResult, PersistenceStore, StoredValue};

use crate::calibration::CalibrationStore;
use crate::config::TransportCfg;
use crate::gate::GateMap;
use crate::position::PositionTracker;
use crate::sync::SyncController;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrintState {
    #[default]
    Idle,
    Printing,
    /// A sequence failed during a print; new sequences are refused until unlocked.
    PausedLocked,
}

/// Position, gates, calibration and sync, mutated only by the orchestrator
/// and the recovery engine.
#[derive(Debug, Clone)]
pub struct ControllerState {
    pub tracker: PositionTracker,
    pub gates: GateMap,
    pub calibration: CalibrationStore,
    pub sync: SyncController,
    pub print_state: PrintState,
}

impl ControllerState {
    pub fn new(cfg: &TransportCfg) -> Self {
        Self {
            tracker: PositionTracker::default(),
            gates: GateMap::new(cfg.unit.num_gates),
            calibration: CalibrationStore::new(cfg),
            sync: SyncController::default(),
            print_state: PrintState::Idle,
        }
    }

    /// Rebuild from persisted values.
    pub fn restore(cfg: &TransportCfg, store: &dyn PersistenceStore) -> Self {
        let mut s = Self::new(cfg);
        s.tracker = PositionTracker::restore(store);
        s.gates.restore(store);
        s.calibration.load(store);
        tracing::debug!(
            position = %s.tracker.position(),
            selected = ?s.gates.selected,
            "controller state restored"
        );
        s
    }

    /// Stage gates and calibration. Position persists itself on transition.
    pub fn checkpoint(&mut self, store: &mut dyn PersistenceStore) {
        self.gates.save(store);
        self.calibration.save(store);
    }
}

/// In-memory store used when none is supplied. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct VolatileStore {
    values: HashMap<String, StoredValue>,
}

impl PersistenceStore for VolatileStore {
    fn get(&self, key: &str, default: StoredValue) -> StoredValue {
        self.values.get(key).cloned().unwrap_or(default)
    }

    fn set(&mut self, key: &str, value: StoredValue) {
        self.values.insert(key.to_string(), value);
    }

    fn flush(&mut self) -> HwResult<()> {
        Ok(())
    }
}

//! Gear/extruder synchronization.
//!
//! `decide_sync` is the pure decision; [`SyncController`] holds the applied
//! state and the protection depth; `Transport::apply_sync` drives hardware
//! in grip, current, coupling order.

use std::fmt;

use mmu_traits::{AxisRole, Coupling, MotionController, Selector, SensorProvider};

use crate::error::{FaultResult, Stage};
use crate::hw_error::fault_from_hw;
use crate::position::FilamentPosition;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    #[default]
    Unsynced,
    GearSyncedToExtruder,
    ExtruderSyncedToGear,
    ExtruderOnlyOnGear,
}

impl SyncMode {
    pub fn coupling(self) -> Coupling {
        match self {
            Self::Unsynced => Coupling::None,
            Self::GearSyncedToExtruder => Coupling::GearToExtruder,
            Self::ExtruderSyncedToGear => Coupling::ExtruderToGear,
            Self::ExtruderOnlyOnGear => Coupling::ExtruderOnlyOnGear,
        }
    }

    #[inline]
    pub fn is_synced(self) -> bool {
        self != Self::Unsynced
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unsynced => "unsynced",
            Self::GearSyncedToExtruder => "gear synced to extruder",
            Self::ExtruderSyncedToGear => "extruder synced to gear",
            Self::ExtruderOnlyOnGear => "extruder only on gear",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncState {
    pub mode: SyncMode,
    pub gear_current_percent: u8,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            mode: SyncMode::Unsynced,
            gear_current_percent: 100,
        }
    }
}

/// Inputs the sync decision depends on.
#[derive(Debug, Clone, Copy)]
pub struct SyncContext {
    pub bypass_selected: bool,
    pub printing: bool,
    pub position: FilamentPosition,
    /// Selector design keeps filament gripped permanently.
    pub always_gripped: bool,
    pub standalone_sync: bool,
}

/// Which sync mode should be in force.
pub fn decide_sync(ctx: &SyncContext, intended_during_print: bool) -> SyncMode {
    if ctx.bypass_selected {
        return SyncMode::Unsynced;
    }
    let synced = if ctx.printing {
        intended_during_print
    } else {
        ctx.position >= FilamentPosition::ExtruderEntry
            && (ctx.always_gripped || ctx.standalone_sync)
    };
    if synced {
        SyncMode::GearSyncedToExtruder
    } else {
        SyncMode::Unsynced
    }
}

/// Applied sync state plus the protection scope counter.
#[derive(Debug, Clone, Default)]
pub struct SyncController {
    state: SyncState,
    depth: u32,
    saved: Option<SyncMode>,
}

impl SyncController {
    #[inline]
    pub fn state(&self) -> SyncState {
        self.state
    }

    #[inline]
    pub fn is_protected(&self) -> bool {
        self.depth > 0
    }

    pub(crate) fn record(&mut self, state: SyncState) {
        self.state = state;
    }

    /// Enter a protected scope. Only the outermost scope remembers the mode.
    pub fn enter(&mut self) {
        if self.depth == 0 {
            self.saved = Some(self.state.mode);
        }
        self.depth += 1;
    }

    /// Leave a protected scope. Returns the mode to restore when the
    /// outermost scope closes, exactly once.
    pub fn exit(&mut self) -> Option<SyncMode> {
        self.depth = self.depth.saturating_sub(1);
        if self.depth == 0 { self.saved.take() } else { None }
    }
}

impl<M: MotionController, S: SensorProvider, G: Selector> Transport<M, S, G> {
    /// Recompute and apply the sync mode for the current state.
    pub fn reset_sync(&mut self, intended_during_print: bool) -> FaultResult<SyncMode> {
        let ctx = SyncContext {
            bypass_selected: self.bypass_selected(),
            printing: self.is_printing(),
            position: self.state.tracker.position(),
            always_gripped: self.selector.filament_always_gripped(),
            standalone_sync: self.cfg.sync.standalone_sync,
        };
        let mode = decide_sync(&ctx, intended_during_print);
        self.apply_sync(mode)?;
        Ok(mode)
    }

    /// Drive grip, gear current and coupling to match `mode`.
    pub fn apply_sync(&mut self, mode: SyncMode) -> FaultResult<()> {
        let current = self.state.sync.state();
        let pct = if mode == SyncMode::GearSyncedToExtruder && self.is_printing() {
            self.cfg.sync.sync_gear_current
        } else {
            100
        };
        if current.mode == mode && current.gear_current_percent == pct {
            return Ok(());
        }
        let keep_grip = self.selector.filament_always_gripped();
        let hw = |e: Box<dyn std::error::Error + Send + Sync>, what: &str| {
            fault_from_hw(e.as_ref(), Stage::Sync, what)
        };

        if mode.is_synced() {
            if !keep_grip && !self.selector.is_gripped() {
                self.selector.drive_grip().map_err(|e| hw(e, "grip"))?;
            }
            self.motion
                .set_current_percent(AxisRole::Gear, pct)
                .map_err(|e| hw(e, "gear current"))?;
            self.motion
                .set_coupling(mode.coupling())
                .map_err(|e| hw(e, "coupling"))?;
        } else {
            self.motion
                .set_coupling(Coupling::None)
                .map_err(|e| hw(e, "coupling"))?;
            self.motion
                .set_current_percent(AxisRole::Gear, pct)
                .map_err(|e| hw(e, "gear current"))?;
            // Inside a protected scope the grip stays put until the scope closes.
            if !keep_grip && !self.state.sync.is_protected() && self.selector.is_gripped() {
                self.selector.release_grip().map_err(|e| hw(e, "release grip"))?;
            }
        }
        self.state.sync.record(SyncState {
            mode,
            gear_current_percent: pct,
        });
        tracing::debug!(mode = %mode, gear_current = pct, "sync applied");
        Ok(())
    }

    /// Run `f` with the current sync mode restored afterwards, once, by the
    /// outermost caller, including when `f` fails.
    pub fn with_protected_sync<R>(
        &mut self,
        f: impl FnOnce(&mut Self) -> FaultResult<R>,
    ) -> FaultResult<R> {
        self.state.sync.enter();
        let out = f(self);
        match self.state.sync.exit() {
            Some(mode) => {
                let restored = self.apply_sync(mode);
                match (out, restored) {
                    (Ok(v), Ok(())) => Ok(v),
                    (Ok(_), Err(e)) => Err(e),
                    (Err(e), Ok(())) => Err(e),
                    (Err(e), Err(restore)) => {
                        tracing::warn!(
                            error = %restore,
                            "failed to restore sync state after fault"
                        );
                        Err(e)
                    }
                }
            }
            None => out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ctx(position: FilamentPosition, printing: bool) -> SyncContext {
        SyncContext {
            bypass_selected: false,
            printing,
            position,
            always_gripped: false,
            standalone_sync: false,
        }
    }

    #[rstest]
    #[case(true, true)]
    #[case(true, false)]
    #[case(false, true)]
    #[case(false, false)]
    fn bypass_is_always_unsynced(#[case] printing: bool, #[case] intended: bool) {
        let mut c = ctx(FilamentPosition::Loaded, printing);
        c.bypass_selected = true;
        c.always_gripped = true;
        assert_eq!(decide_sync(&c, intended), SyncMode::Unsynced);
    }

    #[test]
    fn printing_follows_intention() {
        let c = ctx(FilamentPosition::Loaded, true);
        assert_eq!(decide_sync(&c, true), SyncMode::GearSyncedToExtruder);
        assert_eq!(decide_sync(&c, false), SyncMode::Unsynced);
    }

    #[rstest]
    #[case(FilamentPosition::InBowden, true, SyncMode::Unsynced)]
    #[case(FilamentPosition::ExtruderEntry, true, SyncMode::GearSyncedToExtruder)]
    #[case(FilamentPosition::Loaded, false, SyncMode::Unsynced)]
    fn idle_sync_needs_filament_in_extruder(
        #[case] position: FilamentPosition,
        #[case] standalone: bool,
        #[case] expected: SyncMode,
    ) {
        let mut c = ctx(position, false);
        c.standalone_sync = standalone;
        assert_eq!(decide_sync(&c, true), expected);
    }

    #[test]
    fn only_outermost_scope_restores() {
        let mut s = SyncController::default();
        s.enter();
        s.record(SyncState {
            mode: SyncMode::GearSyncedToExtruder,
            gear_current_percent: 100,
        });
        s.enter();
        assert_eq!(s.exit(), None);
        assert_eq!(s.exit(), Some(SyncMode::Unsynced));
        assert_eq!(s.exit(), None);
    }
}

//! Rebuilds the filament position from sensors after an interruption.

use eyre::WrapErr;
use mmu_traits::{MotionController, Selector, SensorProvider};

use crate::error::{FaultResult, Result, Stage};
use crate::gate::GateStatus;
use crate::motion::{Endstop, Motor, MoveRequest};
use crate::position::FilamentPosition;
use crate::transport::Transport;

/// Snapshot of every sensor the recovery engine consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SensorSnapshot {
    pub gate: Option<bool>,
    pub gear: Option<bool>,
    pub entry: Option<bool>,
    pub toolhead: Option<bool>,
}

impl SensorSnapshot {
    /// True when any fitted sensor between the gate and the extruder sees filament.
    pub fn any_in_path(&self) -> bool {
        [self.gate, self.gear, self.entry].contains(&Some(true))
    }

    /// No fitted sensor contradicts a loaded extruder.
    pub fn consistent_with_loaded(&self) -> bool {
        ![self.gate, self.gear, self.entry, self.toolhead].contains(&Some(false))
    }
}

/// Pure priority ladder. `in_extruder` is the result of the presence test,
/// `None` when it could not run.
pub fn infer_position(
    sensors: &SensorSnapshot,
    previous: FilamentPosition,
    strict: bool,
    in_extruder: Option<bool>,
    parking_distance: f64,
) -> FilamentPosition {
    if sensors.toolhead == Some(true) {
        return FilamentPosition::Loaded;
    }
    if !strict && previous == FilamentPosition::Loaded && sensors.consistent_with_loaded() {
        return FilamentPosition::Loaded;
    }
    if in_extruder == Some(true) {
        return FilamentPosition::InExtruder;
    }
    if sensors.entry == Some(true) {
        return FilamentPosition::HomedEntry;
    }
    if sensors.gate == Some(true) && parking_distance <= 0.0 {
        return FilamentPosition::Unloaded;
    }
    if sensors.any_in_path() {
        return FilamentPosition::InBowden;
    }
    FilamentPosition::Unloaded
}

impl<M: MotionController, S: SensorProvider, G: Selector> Transport<M, S, G> {
    fn sensor_snapshot(&self) -> SensorSnapshot {
        SensorSnapshot {
            gate: self.sensor(Endstop::Gate.name()),
            gear: self.sensor(Endstop::Gear.name()),
            entry: self.sensor(Endstop::ExtruderEntry.name()),
            toolhead: self.sensor(Endstop::Toolhead.name()),
        }
    }

    /// Work out where the filament is and make that the tracked position.
    ///
    /// `strict` ignores the previous Loaded state. `can_heat` allows the
    /// encoder buzz test, which moves the extruder.
    pub fn recover(&mut self, strict: bool, can_heat: bool) -> Result<FilamentPosition> {
        let previous = self.filament_position();
        let sensors = self.sensor_snapshot();
        let in_extruder = if sensors.toolhead == Some(true) {
            None
        } else {
            self.extruder_presence(can_heat)
                .wrap_err("extruder presence test failed")?
        };
        let pos = infer_position(
            &sensors,
            previous,
            strict,
            in_extruder,
            self.cfg.gate.parking_distance,
        );
        tracing::info!(
            previous = %previous,
            recovered = %pos,
            strict,
            sensors = ?sensors,
            "filament position recovered"
        );

        self.transition(pos);
        if pos >= FilamentPosition::StartBowden
            && let Some(g) = self.state.gates.selected.gate()
        {
            self.state.gates.promote(g, GateStatus::Available);
        }
        self.reset_sync(self.cfg.sync.sync_to_extruder)
            .wrap_err("failed to apply sync after recovery")?;
        self.persist()?;
        Ok(pos)
    }

    /// Oscillate the extruder and watch the encoder. `None` when inconclusive.
    fn extruder_presence(&mut self, can_heat: bool) -> FaultResult<Option<bool>> {
        if !self.has_encoder() || !can_heat {
            return Ok(None);
        }
        let d = self.cfg.recovery.buzz_distance;
        let back = self
            .execute_move(&MoveRequest::drive(Motor::ExtruderOnly, -d))
            .map_err(|f| f.in_stage(Stage::Recovery))?;
        let fwd = self
            .execute_move(&MoveRequest::drive(Motor::ExtruderOnly, d))
            .map_err(|f| f.in_stage(Stage::Recovery))?;
        let seen = back.measured.unwrap_or(0.0) + fwd.measured.unwrap_or(0.0);
        tracing::debug!(seen, "extruder buzz test");
        Ok(Some(seen > self.cfg.encoder.min_movement))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::FilamentPosition::{HomedEntry, InBowden, Loaded, Unknown, Unloaded};
    use rstest::rstest;

    fn snap(gate: Option<bool>, entry: Option<bool>, toolhead: Option<bool>) -> SensorSnapshot {
        SensorSnapshot {
            gate,
            gear: None,
            entry,
            toolhead,
        }
    }

    #[rstest]
    #[case(snap(Some(true), Some(true), Some(true)), Unknown, Loaded)]
    #[case(snap(Some(true), None, None), Loaded, Loaded)]
    #[case(snap(Some(true), Some(false), None), Loaded, InBowden)]
    #[case(snap(Some(true), Some(true), Some(false)), Unknown, HomedEntry)]
    #[case(snap(Some(true), Some(false), Some(false)), Unknown, InBowden)]
    #[case(snap(Some(false), Some(false), Some(false)), Unknown, Unloaded)]
    fn sensor_priority(
        #[case] sensors: SensorSnapshot,
        #[case] previous: FilamentPosition,
        #[case] expected: FilamentPosition,
    ) {
        assert_eq!(infer_position(&sensors, previous, false, None, 23.0), expected);
    }

    #[test]
    fn strict_mode_ignores_previous_loaded() {
        let s = snap(Some(true), None, None);
        assert_eq!(infer_position(&s, Loaded, true, None, 23.0), InBowden);
    }

    #[test]
    fn presence_test_outranks_entry_sensor() {
        let s = snap(Some(true), Some(true), Some(false));
        assert_eq!(
            infer_position(&s, FilamentPosition::Unknown, false, Some(true), 23.0),
            FilamentPosition::InExtruder
        );
    }

    #[test]
    fn gate_sensor_with_non_retracting_park_is_unloaded() {
        let s = snap(Some(true), Some(false), Some(false));
        assert_eq!(infer_position(&s, Unknown, false, None, 0.0), Unloaded);
    }
}

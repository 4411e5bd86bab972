//! Filament position state and its single transition function.

use std::collections::VecDeque;
use std::fmt;

use mmu_traits::{PersistenceStore, StoredValue};

pub const POSITION_KEY: &str = "mmu_state_filament_pos";

const HISTORY_LEN: usize = 32;

/// Where the filament tip is along the path. Ordering means "further along".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i8)]
pub enum FilamentPosition {
    Unknown = -1,
    Unloaded = 0,
    HomedGate = 1,
    StartBowden = 2,
    InBowden = 3,
    EndBowden = 4,
    HomedEntry = 5,
    HomedExtruderGear = 6,
    ExtruderEntry = 7,
    HomedToolheadSensor = 8,
    InExtruder = 9,
    Loaded = 10,
}

impl FilamentPosition {
    #[inline]
    pub const fn code(self) -> i8 {
        self as i8
    }

    pub fn from_code(code: i64) -> Self {
        use FilamentPosition::*;
        match code {
            0 => Unloaded,
            1 => HomedGate,
            2 => StartBowden,
            3 => InBowden,
            4 => EndBowden,
            5 => HomedEntry,
            6 => HomedExtruderGear,
            7 => ExtruderEntry,
            8 => HomedToolheadSensor,
            9 => InExtruder,
            10 => Loaded,
            _ => Unknown,
        }
    }

    /// Only the two terminal states are checkpointed.
    #[inline]
    pub fn is_stable(self) -> bool {
        matches!(self, FilamentPosition::Unloaded | FilamentPosition::Loaded)
    }

    pub fn label(self) -> &'static str {
        use FilamentPosition::*;
        match self {
            Unknown => "unknown",
            Unloaded => "unloaded",
            HomedGate => "homed at gate",
            StartBowden => "start of bowden",
            InBowden => "in bowden",
            EndBowden => "end of bowden",
            HomedEntry => "homed at extruder entry",
            HomedExtruderGear => "homed at extruder gear",
            ExtruderEntry => "extruder entry",
            HomedToolheadSensor => "homed at toolhead sensor",
            InExtruder => "in extruder",
            Loaded => "loaded",
        }
    }
}

impl fmt::Display for FilamentPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Unknown,
    Load,
    Unload,
}

/// Owns the filament position. Nothing else may change it.
#[derive(Debug, Clone)]
pub struct PositionTracker {
    position: FilamentPosition,
    direction: Direction,
    /// Filament distance moved since the last reset.
    distance: f64,
    /// Distance at which the current sequence started, for progress reporting.
    anchor: Option<f64>,
    history: VecDeque<FilamentPosition>,
}

impl Default for PositionTracker {
    fn default() -> Self {
        Self::new(FilamentPosition::Unknown)
    }
}

impl PositionTracker {
    pub fn new(position: FilamentPosition) -> Self {
        Self {
            position,
            direction: Direction::Unknown,
            distance: 0.0,
            anchor: None,
            history: VecDeque::with_capacity(HISTORY_LEN),
        }
    }

    /// Rebuild from the last checkpoint. A dirty marker restores as Unknown.
    pub fn restore(store: &dyn PersistenceStore) -> Self {
        let code = store
            .get(POSITION_KEY, StoredValue::Int(-1))
            .as_i64()
            .unwrap_or(-1);
        Self::new(FilamentPosition::from_code(code))
    }

    #[inline]
    pub fn position(&self) -> FilamentPosition {
        self.position
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    #[inline]
    pub fn distance(&self) -> f64 {
        self.distance
    }

    pub fn add_distance(&mut self, d: f64) {
        self.distance += d;
    }

    /// Change direction; a reversal restarts distance tracking.
    pub fn set_direction(&mut self, direction: Direction) {
        if direction != self.direction {
            self.distance = 0.0;
            self.direction = direction;
        }
    }

    /// Apply `target` if it differs from the current position.
    ///
    /// Stable targets are checkpointed and clear the progress anchor; any
    /// other target arms the anchor when leaving a stable state and stages
    /// the dirty marker unless it is already stored. Returns whether a
    /// transition happened.
    pub(crate) fn transition(
        &mut self,
        target: FilamentPosition,
        store: &mut dyn PersistenceStore,
    ) -> bool {
        if target == self.position {
            return false;
        }
        let from = self.position;
        self.position = target;
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(target);

        if target.is_stable() {
            self.direction = if target == FilamentPosition::Loaded {
                Direction::Load
            } else {
                Direction::Unload
            };
            self.distance = 0.0;
            self.anchor = None;
            store.set(POSITION_KEY, StoredValue::Int(i64::from(target.code())));
        } else {
            if from.is_stable() || self.anchor.is_none() {
                self.anchor = Some(self.distance);
            }
            let stored = store.get(POSITION_KEY, StoredValue::Int(-1)).as_i64();
            if stored != Some(i64::from(FilamentPosition::Unknown.code())) {
                store.set(
                    POSITION_KEY,
                    StoredValue::Int(i64::from(FilamentPosition::Unknown.code())),
                );
            }
        }
        tracing::debug!(from = %from, to = %target, "filament position");
        true
    }

    /// Percentage of `total` covered since the sequence started, if one is running.
    pub fn progress_percent(&self, total: f64) -> Option<f64> {
        let anchor = self.anchor?;
        if total <= 0.0 {
            return None;
        }
        Some(((self.distance - anchor).abs() / total * 100.0).clamp(0.0, 100.0))
    }

    /// Most recent transitions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = FilamentPosition> + '_ {
        self.history.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Recorder {
        values: HashMap<String, StoredValue>,
        sets: usize,
    }

    impl PersistenceStore for Recorder {
        fn get(&self, key: &str, default: StoredValue) -> StoredValue {
            self.values.get(key).cloned().unwrap_or(default)
        }
        fn set(&mut self, key: &str, value: StoredValue) {
            self.sets += 1;
            self.values.insert(key.to_string(), value);
        }
        fn flush(&mut self) -> mmu_traits::HwResult<()> {
            Ok(())
        }
    }

    #[test]
    fn ordering_supports_progress_comparisons() {
        assert!(FilamentPosition::Loaded > FilamentPosition::InExtruder);
        assert!(FilamentPosition::HomedEntry > FilamentPosition::EndBowden);
        assert!(FilamentPosition::Unknown < FilamentPosition::Unloaded);
    }

    #[test]
    fn codes_round_trip() {
        for code in -1..=10 {
            assert_eq!(i64::from(FilamentPosition::from_code(code).code()), code);
        }
        assert_eq!(FilamentPosition::from_code(42), FilamentPosition::Unknown);
    }

    #[test]
    fn same_target_is_not_a_transition() {
        let mut store = Recorder::default();
        let mut t = PositionTracker::new(FilamentPosition::Unloaded);
        assert!(!t.transition(FilamentPosition::Unloaded, &mut store));
        assert_eq!(store.sets, 0);
    }

    #[test]
    fn dirty_marker_is_written_once() {
        let mut store = Recorder::default();
        let mut t = PositionTracker::new(FilamentPosition::Unloaded);
        t.transition(FilamentPosition::Loaded, &mut store);
        assert_eq!(store.values[POSITION_KEY], StoredValue::Int(10));
        t.transition(FilamentPosition::InExtruder, &mut store);
        t.transition(FilamentPosition::EndBowden, &mut store);
        t.transition(FilamentPosition::StartBowden, &mut store);
        assert_eq!(store.values[POSITION_KEY], StoredValue::Int(-1));
        // one for Loaded, one for the dirty marker
        assert_eq!(store.sets, 2);
        t.transition(FilamentPosition::Unloaded, &mut store);
        assert_eq!(store.values[POSITION_KEY], StoredValue::Int(0));
    }

    #[test]
    fn progress_anchor_armed_between_stable_states() {
        let mut store = Recorder::default();
        let mut t = PositionTracker::new(FilamentPosition::Unloaded);
        assert_eq!(t.progress_percent(100.0), None);
        t.set_direction(Direction::Load);
        t.transition(FilamentPosition::HomedGate, &mut store);
        t.add_distance(25.0);
        assert_eq!(t.progress_percent(100.0), Some(25.0));
        t.transition(FilamentPosition::Loaded, &mut store);
        assert_eq!(t.progress_percent(100.0), None);
        assert_eq!(t.distance(), 0.0);
    }

    #[test]
    fn direction_reversal_resets_distance() {
        let mut t = PositionTracker::new(FilamentPosition::InBowden);
        t.set_direction(Direction::Load);
        t.add_distance(40.0);
        t.set_direction(Direction::Load);
        assert_eq!(t.distance(), 40.0);
        t.set_direction(Direction::Unload);
        assert_eq!(t.distance(), 0.0);
    }
}

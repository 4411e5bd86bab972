//! Per-gate calibrated distances and telemetry-driven auto-tune.
//!
//! Raw persisted values use `-1` for "uncalibrated". In memory that sentinel
//! becomes [`Calibrated::Uncalibrated`] so it can never leak into arithmetic.

use std::collections::VecDeque;
use std::fmt;
use std::ops::BitOr;

use mmu_traits::{PersistenceStore, StoredValue};

use crate::config::{CalibrationCfg, TransportCfg, UnitCfg};

pub const BOWDEN_LENGTHS_KEY: &str = "mmu_calibration_bowden_lengths";
pub const ROTATION_DISTANCES_KEY: &str = "mmu_gear_rotation_distances";
pub const CLOG_LENGTHS_KEY: &str = "mmu_calibration_clog_lengths";
pub const ENCODER_CALIBRATED_KEY: &str = "mmu_calibration_encoder";
pub const SELECTOR_CALIBRATED_KEY: &str = "mmu_calibration_selector";

const MIN_CLOG_LENGTH: f64 = 8.0;
/// Autotuned rotation distance must stay within this fraction of gate 0.
const RD_AUTOTUNE_BAND: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Calibrated {
    #[default]
    Uncalibrated,
    Measured(f64),
}

impl Calibrated {
    pub fn from_raw(v: f64) -> Self {
        if v.is_finite() && v > 0.0 {
            Self::Measured(v)
        } else {
            Self::Uncalibrated
        }
    }

    pub fn raw(self) -> f64 {
        match self {
            Self::Uncalibrated => -1.0,
            Self::Measured(v) => v,
        }
    }

    #[inline]
    pub fn value(self) -> Option<f64> {
        match self {
            Self::Uncalibrated => None,
            Self::Measured(v) => Some(v),
        }
    }

    #[inline]
    pub fn is_calibrated(self) -> bool {
        matches!(self, Self::Measured(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GateCalibration {
    pub bowden_length: Calibrated,
    pub rotation_distance: Calibrated,
    pub clog_length: Calibrated,
}

/// Set of calibration items an operation requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CalibrationMask(u8);

impl CalibrationMask {
    pub const NONE: Self = Self(0);
    pub const ENCODER: Self = Self(1);
    pub const SELECTOR: Self = Self(2);
    pub const BOWDEN_LENGTH: Self = Self(4);
    pub const GEAR_ROTATION_DISTANCE: Self = Self(8);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl BitOr for CalibrationMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One missing calibration item plus what to do about it.
#[derive(Debug, Clone, PartialEq)]
pub struct MissingCalibration {
    pub item: &'static str,
    pub gate: Option<usize>,
    pub hint: &'static str,
}

impl fmt::Display for MissingCalibration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.gate {
            Some(g) => write!(f, "{} for gate {g} ({})", self.item, self.hint),
            None => write!(f, "{} ({})", self.item, self.hint),
        }
    }
}

/// Rolling window of commanded/measured ratios.
#[derive(Debug, Clone)]
pub struct CalibrationTelemetry {
    window: usize,
    samples: VecDeque<f64>,
}

impl CalibrationTelemetry {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
        }
    }

    /// Record a ratio. Zero marks a move that cannot be trusted and is dropped.
    pub fn push(&mut self, ratio: f64) -> bool {
        if !ratio.is_finite() || ratio <= 0.0 {
            return false;
        }
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(ratio);
        true
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.window
    }

    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    pub fn last(&self) -> Option<f64> {
        self.samples.back().copied()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// What an auto-tune pass changed.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AutotuneOutcome {
    pub bowden_length: Option<f64>,
    pub rotation_distance: Option<f64>,
    /// Encoder ratio on gate 0 is outside 0.95..1.05.
    pub encoder_drift: bool,
}

#[derive(Debug, Clone)]
pub struct CalibrationStore {
    gates: Vec<GateCalibration>,
    unit: UnitCfg,
    cfg: CalibrationCfg,
    telemetry: Vec<CalibrationTelemetry>,
    encoder_calibrated: bool,
    selector_calibrated: bool,
    calibrating: bool,
    dirty: bool,
}

fn round_to(v: f64, places: i32) -> f64 {
    let m = 10f64.powi(places);
    (v * m).round() / m
}

fn list_or_empty(store: &dyn PersistenceStore, key: &str) -> Vec<f64> {
    store
        .get(key, StoredValue::List(Vec::new()))
        .as_list()
        .map(<[f64]>::to_vec)
        .unwrap_or_default()
}

impl CalibrationStore {
    pub fn new(cfg: &TransportCfg) -> Self {
        let n = cfg.unit.num_gates;
        Self {
            gates: vec![GateCalibration::default(); n],
            unit: cfg.unit.clone(),
            cfg: cfg.calibration.clone(),
            telemetry: (0..n)
                .map(|_| CalibrationTelemetry::new(cfg.calibration.telemetry_window))
                .collect(),
            encoder_calibrated: cfg.calibration.encoder_calibrated,
            selector_calibrated: cfg.calibration.selector_calibrated,
            calibrating: false,
            dirty: false,
        }
    }

    pub fn num_gates(&self) -> usize {
        self.gates.len()
    }

    pub fn gate(&self, gate: usize) -> Option<&GateCalibration> {
        self.gates.get(gate)
    }

    pub fn load(&mut self, store: &dyn PersistenceStore) {
        let bowden = list_or_empty(store, BOWDEN_LENGTHS_KEY);
        let rds = list_or_empty(store, ROTATION_DISTANCES_KEY);
        let clogs = list_or_empty(store, CLOG_LENGTHS_KEY);
        for (i, g) in self.gates.iter_mut().enumerate() {
            g.bowden_length = Calibrated::from_raw(bowden.get(i).copied().unwrap_or(-1.0));
            g.rotation_distance = Calibrated::from_raw(rds.get(i).copied().unwrap_or(-1.0));
            g.clog_length = Calibrated::from_raw(clogs.get(i).copied().unwrap_or(-1.0));
        }
        // Absent flags keep the configured value.
        let flag = |key: &str| store.get(key, StoredValue::Int(-1)).as_i64().filter(|v| *v >= 0);
        if let Some(v) = flag(ENCODER_CALIBRATED_KEY) {
            self.encoder_calibrated = v != 0;
        }
        if let Some(v) = flag(SELECTOR_CALIBRATED_KEY) {
            self.selector_calibrated = v != 0;
        }
        self.dirty = false;
    }

    /// Stage all calibration values; the caller flushes.
    pub fn save(&mut self, store: &mut dyn PersistenceStore) {
        let column = |f: fn(&GateCalibration) -> Calibrated| {
            StoredValue::List(self.gates.iter().map(|g| f(g).raw()).collect())
        };
        store.set(BOWDEN_LENGTHS_KEY, column(|g| g.bowden_length));
        store.set(ROTATION_DISTANCES_KEY, column(|g| g.rotation_distance));
        store.set(CLOG_LENGTHS_KEY, column(|g| g.clog_length));
        store.set(ENCODER_CALIBRATED_KEY, StoredValue::Int(i64::from(self.encoder_calibrated)));
        store.set(SELECTOR_CALIBRATED_KEY, StoredValue::Int(i64::from(self.selector_calibrated)));
        self.dirty = false;
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_calibrating(&mut self, on: bool) {
        self.calibrating = on;
    }

    #[inline]
    pub fn is_calibrating(&self) -> bool {
        self.calibrating
    }

    pub fn set_encoder_calibrated(&mut self, on: bool) {
        self.encoder_calibrated = on;
        self.dirty = true;
    }

    pub fn set_selector_calibrated(&mut self, on: bool) {
        self.selector_calibrated = on;
        self.dirty = true;
    }

    // ── Bowden length ─────────────────────────────────────────────────────────

    pub fn bowden_length(&self, gate: usize) -> Calibrated {
        self.gates.get(gate).map_or(Calibrated::Uncalibrated, |g| g.bowden_length)
    }

    /// Set or reset (negative `length`) the bowden length. Without variable
    /// bowden lengths every gate shares one value.
    pub fn update_bowden_length(&mut self, gate: usize, length: f64) {
        if gate >= self.gates.len() {
            tracing::debug!(gate, "cannot save bowden length for gate out of range");
            return;
        }
        let value = if length < 0.0 {
            Calibrated::Uncalibrated
        } else {
            Calibrated::from_raw(round_to(length, 1))
        };
        let clog = value
            .value()
            .map_or(Calibrated::Uncalibrated, |l| Calibrated::Measured(clog_length_for(l)));
        let all = !self.unit.variable_bowden_lengths;
        for (i, g) in self.gates.iter_mut().enumerate() {
            if all || i == gate {
                g.bowden_length = value;
                g.clog_length = clog;
            }
        }
        self.dirty = true;
        tracing::info!(
            gate,
            length = value.raw(),
            all_gates = all,
            "bowden length {}",
            if value.is_calibrated() { "saved" } else { "reset" }
        );
    }

    pub fn clog_length(&self, gate: usize) -> Calibrated {
        self.gates.get(gate).map_or(Calibrated::Uncalibrated, |g| g.clog_length)
    }

    /// Override the clog length derived from the bowden length.
    pub fn set_clog_length(&mut self, gate: usize, length: f64) {
        if let Some(g) = self.gates.get_mut(gate) {
            g.clog_length = Calibrated::from_raw(round_to(length, 1));
            self.dirty = true;
        }
    }

    // ── Rotation distance ─────────────────────────────────────────────────────

    /// Calibrated gear rotation distance, falling back to gate 0 then the default.
    pub fn rotation_distance(&self, gate: usize) -> f64 {
        let idx = if self.unit.variable_rotation_distances { gate } else { 0 };
        self.gates
            .get(idx)
            .and_then(|g| g.rotation_distance.value())
            .unwrap_or_else(|| {
                tracing::debug!(gate, "gate not calibrated, using default rotation distance");
                self.cfg.default_rotation_distance
            })
    }

    /// Save a rotation distance, keeping calibrated bowden lengths at the same
    /// effective distance.
    pub fn update_rotation_distance(&mut self, gate: usize, rd: f64) {
        if gate >= self.gates.len() {
            return;
        }
        let all = !self.unit.variable_rotation_distances
            || (gate == 0 && !self.gates[0].rotation_distance.is_calibrated());
        if rd < 0.0 {
            for (i, g) in self.gates.iter_mut().enumerate() {
                if all || i == gate {
                    g.rotation_distance = Calibrated::Uncalibrated;
                }
            }
            self.dirty = true;
            tracing::info!(gate, all_gates = all, "rotation distance reset");
            return;
        }

        let prev = self.rotation_distance(gate);
        let rd = round_to(rd, 4);
        let updated: Vec<usize> = if all {
            (0..self.gates.len()).collect()
        } else {
            vec![gate]
        };
        for &g in &updated {
            self.gates[g].rotation_distance = Calibrated::from_raw(rd);
        }
        let rescale: Vec<usize> = if self.unit.variable_bowden_lengths {
            updated
        } else {
            vec![gate]
        };
        for g in rescale {
            if let Some(bl) = self.gates[g].bowden_length.value() {
                self.update_bowden_length(g, bl * (prev / rd));
            }
        }
        self.dirty = true;
        tracing::info!(gate, rd, all_gates = all, "rotation distance saved");
    }

    // ── Checks ────────────────────────────────────────────────────────────────

    /// Calibration items in `mask` still missing for `gates`.
    pub fn check_calibrated(
        &self,
        mask: CalibrationMask,
        gates: &[usize],
    ) -> Vec<MissingCalibration> {
        let mut missing = Vec::new();
        if mask.contains(CalibrationMask::ENCODER)
            && self.unit.has_encoder
            && !self.encoder_calibrated
        {
            missing.push(MissingCalibration {
                item: "encoder",
                gate: None,
                hint: "calibrate the encoder resolution",
            });
        }
        if mask.contains(CalibrationMask::SELECTOR) && !self.selector_calibrated {
            missing.push(MissingCalibration {
                item: "selector",
                gate: None,
                hint: "calibrate selector offsets",
            });
        }
        for &g in gates {
            if mask.contains(CalibrationMask::GEAR_ROTATION_DISTANCE) {
                let idx = if self.unit.variable_rotation_distances { g } else { 0 };
                if !self.gates.get(idx).is_some_and(|c| c.rotation_distance.is_calibrated()) {
                    missing.push(MissingCalibration {
                        item: "gear rotation distance",
                        gate: Some(g),
                        hint: if g == 0 {
                            "calibrate the gear on gate 0"
                        } else {
                            "calibrate the gate or enable rotation distance autotune"
                        },
                    });
                }
            }
            if mask.contains(CalibrationMask::BOWDEN_LENGTH)
                && !self.bowden_length(g).is_calibrated()
            {
                missing.push(MissingCalibration {
                    item: "bowden length",
                    gate: Some(g),
                    hint: "calibrate the bowden length, or import it from a calibration file",
                });
            }
        }
        missing
    }

    // ── Telemetry ─────────────────────────────────────────────────────────────

    pub fn telemetry(&self, gate: usize) -> Option<&CalibrationTelemetry> {
        self.telemetry.get(gate)
    }

    /// Feed load telemetry. `homing_movement` is the extra homing travel past
    /// the bowden move; the deficit deliberately left short is netted out.
    pub fn note_load_telemetry(
        &mut self,
        gate: usize,
        ratio: f64,
        homing_movement: Option<f64>,
        deficit: f64,
    ) -> AutotuneOutcome {
        self.autotune(gate, ratio, homing_movement.map(|h| h - deficit))
    }

    pub fn note_unload_telemetry(
        &mut self,
        gate: usize,
        ratio: f64,
        homing_movement: Option<f64>,
        deficit: f64,
    ) -> AutotuneOutcome {
        self.autotune(gate, ratio, homing_movement.map(|h| h - deficit))
    }

    fn autotune(
        &mut self,
        gate: usize,
        ratio: f64,
        homing_movement: Option<f64>,
    ) -> AutotuneOutcome {
        let mut out = AutotuneOutcome::default();
        if self.calibrating {
            return out;
        }
        let band = self.cfg.ratio_band;
        if (ratio - 1.0).abs() < band
            && let Some(t) = self.telemetry.get_mut(gate)
        {
            t.push(ratio);
        }
        let Some(homing) = homing_movement else {
            tracing::debug!(gate, ratio, "autotune not possible without homing movement");
            return out;
        };

        if self.cfg.autotune_rotation_distance
            && self.unit.has_encoder
            && self.unit.variable_rotation_distances
            && gate > 0
            && ratio > 0.0
            && homing > 0.0
        {
            out.rotation_distance = self.autotune_rotation_distance(gate);
        }

        let bowden_ok = (ratio > 1.0 - band && ratio < 1.0 + band) || !self.unit.has_encoder;
        if self.cfg.autotune_bowden_length
            && (gate == 0 || self.unit.variable_bowden_lengths)
            && bowden_ok
            && let Some(length) = self.bowden_length(gate).value()
        {
            let err_tol = length * 0.01;
            let target = if homing.abs() > err_tol {
                length + err_tol.copysign(homing)
            } else {
                length
            };
            let smoothed = round_to((length * 5.0 + target) / 6.0, 1);
            if (smoothed - length).abs() > f64::EPSILON {
                self.update_bowden_length(gate, smoothed);
                tracing::info!(
                    gate,
                    homing,
                    from = length,
                    to = smoothed,
                    "autotuned bowden length"
                );
                out.bowden_length = Some(smoothed);
            }
        }

        if gate == 0 && homing > 0.0 && ratio > 0.0 && !(0.95..=1.05).contains(&ratio) {
            tracing::warn!(
                ratio,
                "encoder measurement on gate 0 outside desired range; check or recalibrate"
            );
            out.encoder_drift = true;
        }
        out
    }

    fn autotune_rotation_distance(&mut self, gate: usize) -> Option<f64> {
        let t = self.telemetry.get(gate)?;
        if !t.is_full() {
            return None;
        }
        let mean = t.mean()?;
        let current = self.rotation_distance(gate);
        let reference = self.rotation_distance(0);
        let proposed = round_to(mean * current, 4);
        if (proposed - reference).abs() > reference * RD_AUTOTUNE_BAND {
            tracing::warn!(
                gate,
                proposed,
                reference,
                "autotuned rotation distance failed sanity check"
            );
            return None;
        }
        let new_rd = match self.gates.get(gate).and_then(|g| g.rotation_distance.value()) {
            Some(old) => round_to((old * 5.0 + proposed) / 6.0, 4),
            None => proposed,
        };
        if let Some(t) = self.telemetry.get_mut(gate) {
            t.clear();
        }
        if (new_rd - current).abs() < 1e-9 {
            return None;
        }
        self.update_rotation_distance(gate, new_rd);
        Some(new_rd)
    }
}

/// Clog detection length for a bowden length: 2%, never under 8 mm.
pub fn clog_length_for(bowden_length: f64) -> f64 {
    round_to(bowden_length * 2.0 / 100.0, 1).max(MIN_CLOG_LENGTH)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(variable_bowden: bool) -> CalibrationStore {
        let mut cfg = TransportCfg::default();
        cfg.unit.variable_bowden_lengths = variable_bowden;
        CalibrationStore::new(&cfg)
    }

    #[test]
    fn sentinel_never_becomes_a_length() {
        assert_eq!(Calibrated::from_raw(-1.0), Calibrated::Uncalibrated);
        assert_eq!(Calibrated::from_raw(0.0), Calibrated::Uncalibrated);
        assert_eq!(Calibrated::from_raw(f64::NAN), Calibrated::Uncalibrated);
        assert_eq!(Calibrated::Uncalibrated.raw(), -1.0);
    }

    #[test]
    fn shared_bowden_length_updates_all_gates() {
        let mut c = store(false);
        c.update_bowden_length(2, 612.34);
        for g in 0..4 {
            assert_eq!(c.bowden_length(g), Calibrated::Measured(612.3));
        }
        assert_eq!(c.clog_length(1), Calibrated::Measured(12.2));
    }

    #[test]
    fn clog_length_floor() {
        assert_eq!(clog_length_for(100.0), 8.0);
        assert_eq!(clog_length_for(900.0), 18.0);
    }

    #[test]
    fn rotation_distance_change_keeps_effective_bowden_length() {
        let mut cfg = TransportCfg::default();
        cfg.unit.variable_bowden_lengths = true;
        let mut c = CalibrationStore::new(&cfg);
        c.update_rotation_distance(0, 20.0);
        c.update_bowden_length(1, 500.0);
        c.update_rotation_distance(1, 25.0);
        assert_eq!(c.rotation_distance(1), 25.0);
        assert_eq!(c.bowden_length(1), Calibrated::Measured(400.0));
        // gate 0 untouched
        assert_eq!(c.rotation_distance(0), 20.0);
    }

    #[test]
    fn mask_membership() {
        let m = CalibrationMask::BOWDEN_LENGTH | CalibrationMask::ENCODER;
        assert!(m.contains(CalibrationMask::ENCODER));
        assert!(!m.contains(CalibrationMask::SELECTOR));
        assert!(!m.contains(CalibrationMask::NONE));
    }

    #[test]
    fn telemetry_drops_untrusted_samples() {
        let mut t = CalibrationTelemetry::new(3);
        assert!(!t.push(0.0));
        for r in [1.0, 1.02, 0.98, 1.01] {
            t.push(r);
        }
        assert_eq!(t.len(), 3);
        let mean = t.mean().unwrap_or_default();
        assert!((mean - (1.02 + 0.98 + 1.01) / 3.0).abs() < 1e-12);
    }
}

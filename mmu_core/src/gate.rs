//! Per-gate runtime status and statistics.

use std::fmt;

use mmu_traits::{PersistenceStore, StoredValue};

pub const GATE_STATUS_KEY: &str = "mmu_state_gate_status";
pub const GATE_SELECTED_KEY: &str = "mmu_state_gate_selected";
pub const LAST_TOOL_KEY: &str = "mmu_state_last_tool";
pub const SWAP_STATS_KEY: &str = "mmu_statistics_swaps";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum GateStatus {
    #[default]
    Unknown = -1,
    Empty = 0,
    Available = 1,
    /// Filament parked in the unit's buffer, so it can be loaded fast.
    AvailableFromBuffer = 2,
}

impl GateStatus {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Empty,
            1 => Self::Available,
            2 => Self::AvailableFromBuffer,
            _ => Self::Unknown,
        }
    }

    #[inline]
    pub fn code(self) -> i64 {
        self as i64
    }

    #[inline]
    pub fn has_filament(self) -> bool {
        matches!(self, Self::Available | Self::AvailableFromBuffer)
    }
}

impl fmt::Display for GateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::Empty => "empty",
            Self::Available => "available",
            Self::AvailableFromBuffer => "buffered",
        })
    }
}

/// Which gate feeds the extruder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GateSelection {
    #[default]
    Unknown,
    /// Filament fed from outside the unit; the gear never touches it.
    Bypass,
    Gate(usize),
}

impl GateSelection {
    fn code(self) -> i64 {
        match self {
            Self::Unknown => -1,
            Self::Bypass => -2,
            Self::Gate(g) => g as i64,
        }
    }

    fn from_code(code: i64) -> Self {
        match code {
            -2 => Self::Bypass,
            c if c >= 0 => Self::Gate(c as usize),
            _ => Self::Unknown,
        }
    }

    #[inline]
    pub fn gate(self) -> Option<usize> {
        match self {
            Self::Gate(g) => Some(g),
            _ => None,
        }
    }
}

impl fmt::Display for GateSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("none"),
            Self::Bypass => f.write_str("bypass"),
            Self::Gate(g) => write!(f, "gate {g}"),
        }
    }
}

/// Counters kept for each gate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GateStats {
    pub load_distance: f64,
    pub load_delta: f64,
    pub unload_distance: f64,
    pub unload_delta: f64,
    pub load_failures: u32,
    pub unload_failures: u32,
    pub grip_retries: u32,
}

impl GateStats {
    fn key(gate: usize) -> String {
        format!("mmu_statistics_gate_{gate}")
    }

    /// Slippage across all tracked load moves, percent.
    pub fn load_slip_pct(&self) -> f64 {
        if self.load_distance <= 0.0 {
            0.0
        } else {
            self.load_delta / self.load_distance * 100.0
        }
    }

    fn to_stored(&self) -> StoredValue {
        StoredValue::List(vec![
            self.load_distance,
            self.load_delta,
            self.unload_distance,
            self.unload_delta,
            f64::from(self.load_failures),
            f64::from(self.unload_failures),
            f64::from(self.grip_retries),
        ])
    }

    fn from_stored(v: &StoredValue) -> Self {
        let l = v.as_list().unwrap_or(&[]);
        let at = |i: usize| l.get(i).copied().unwrap_or(0.0);
        let count = |i: usize| at(i).max(0.0) as u32;
        Self {
            load_distance: at(0),
            load_delta: at(1),
            unload_distance: at(2),
            unload_delta: at(3),
            load_failures: count(4),
            unload_failures: count(5),
            grip_retries: count(6),
        }
    }
}

/// Unit-wide swap counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SwapStats {
    pub loads: u32,
    pub unloads: u32,
    pub load_ms: u64,
    pub unload_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Gate {
    pub status: GateStatus,
    pub stats: GateStats,
}

/// Gates plus selection, persisted together.
#[derive(Debug, Clone)]
pub struct GateMap {
    gates: Vec<Gate>,
    pub selected: GateSelection,
    pub last_tool: Option<usize>,
    pub swaps: SwapStats,
}

impl GateMap {
    pub fn new(num_gates: usize) -> Self {
        Self {
            gates: vec![Gate::default(); num_gates],
            selected: GateSelection::Unknown,
            last_tool: None,
            swaps: SwapStats::default(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.gates.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    pub fn get(&self, gate: usize) -> Option<&Gate> {
        self.gates.get(gate)
    }

    pub fn get_mut(&mut self, gate: usize) -> Option<&mut Gate> {
        self.gates.get_mut(gate)
    }

    pub fn status(&self, gate: usize) -> GateStatus {
        self.gates.get(gate).map_or(GateStatus::Unknown, |g| g.status)
    }

    pub fn set_status(&mut self, gate: usize, status: GateStatus) {
        if let Some(g) = self.gates.get_mut(gate)
            && g.status != status
        {
            tracing::debug!(gate, from = %g.status, to = %status, "gate status");
            g.status = status;
        }
    }

    /// Raise status to at least `status`, never downgrading buffered gates.
    pub fn promote(&mut self, gate: usize, status: GateStatus) {
        let current = self.status(gate);
        if status > current {
            self.set_status(gate, status);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Gate> {
        self.gates.iter()
    }

    pub fn restore(&mut self, store: &dyn PersistenceStore) {
        if let Some(codes) = store.get(GATE_STATUS_KEY, StoredValue::List(vec![])).as_list() {
            for (g, code) in self.gates.iter_mut().zip(codes) {
                g.status = GateStatus::from_code(*code as i64);
            }
        }
        for (i, g) in self.gates.iter_mut().enumerate() {
            let stored = store.get(&GateStats::key(i), StoredValue::List(vec![]));
            g.stats = GateStats::from_stored(&stored);
        }
        let selected = store.get(GATE_SELECTED_KEY, StoredValue::Int(-1)).as_i64().unwrap_or(-1);
        self.selected = GateSelection::from_code(selected);
        self.last_tool = store
            .get(LAST_TOOL_KEY, StoredValue::Int(-1))
            .as_i64()
            .and_then(|t| usize::try_from(t).ok());
        if let Some(s) = store.get(SWAP_STATS_KEY, StoredValue::List(vec![])).as_list() {
            let at = |i: usize| s.get(i).copied().unwrap_or(0.0).max(0.0);
            self.swaps = SwapStats {
                loads: at(0) as u32,
                unloads: at(1) as u32,
                load_ms: at(2) as u64,
                unload_ms: at(3) as u64,
            };
        }
    }

    pub fn save(&self, store: &mut dyn PersistenceStore) {
        let codes = self.gates.iter().map(|g| g.status.code() as f64).collect();
        store.set(GATE_STATUS_KEY, StoredValue::List(codes));
        for (i, g) in self.gates.iter().enumerate() {
            store.set(&GateStats::key(i), g.stats.to_stored());
        }
        store.set(GATE_SELECTED_KEY, StoredValue::Int(self.selected.code()));
        store.set(
            LAST_TOOL_KEY,
            StoredValue::Int(self.last_tool.map_or(-1, |t| t as i64)),
        );
        store.set(
            SWAP_STATS_KEY,
            StoredValue::List(vec![
                f64::from(self.swaps.loads),
                f64::from(self.swaps.unloads),
                self.swaps.load_ms as f64,
                self.swaps.unload_ms as f64,
            ]),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_display() {
        assert_eq!(GateSelection::Gate(3).to_string(), "gate 3");
        assert_eq!(GateSelection::Bypass.to_string(), "bypass");
        assert_eq!(GateSelection::Unknown.to_string(), "none");
    }

    #[test]
    fn promote_never_downgrades() {
        let mut m = GateMap::new(2);
        m.set_status(0, GateStatus::AvailableFromBuffer);
        m.promote(0, GateStatus::Available);
        assert_eq!(m.status(0), GateStatus::AvailableFromBuffer);
        m.promote(1, GateStatus::Available);
        assert_eq!(m.status(1), GateStatus::Available);
    }

    #[test]
    fn selection_codes() {
        for sel in [GateSelection::Unknown, GateSelection::Bypass, GateSelection::Gate(3)] {
            assert_eq!(GateSelection::from_code(sel.code()), sel);
        }
    }

    #[test]
    fn slip_percentage_handles_no_moves() {
        let stats = GateStats::default();
        assert_eq!(stats.load_slip_pct(), 0.0);
        let stats = GateStats {
            load_distance: 200.0,
            load_delta: 5.0,
            ..GateStats::default()
        };
        assert!((stats.load_slip_pct() - 2.5).abs() < 1e-9);
    }
}

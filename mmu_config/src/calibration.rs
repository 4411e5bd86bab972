//! Per-gate calibration CSV import.
//!
//! Expected headers:
//! gate,bowden_length,rotation_distance,clog_length
//!
//! Blank cells mean "uncalibrated". Example:
//! gate,bowden_length,rotation_distance,clog_length
//! 0,612.3,22.7317,12.2
//! 1,,22.9,
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct GateCalibrationRow {
    pub gate: usize,
    pub bowden_length: Option<f64>,
    pub rotation_distance: Option<f64>,
    pub clog_length: Option<f64>,
}

const HEADERS: [&str; 4] = ["gate", "bowden_length", "rotation_distance", "clog_length"];

fn check_row(row: &GateCalibrationRow, line: usize, num_gates: usize) -> eyre::Result<()> {
    if row.gate >= num_gates {
        eyre::bail!("row {line}: gate {} is out of range (unit has {num_gates} gates)", row.gate);
    }
    for (name, v) in [
        ("bowden_length", row.bowden_length),
        ("rotation_distance", row.rotation_distance),
        ("clog_length", row.clog_length),
    ] {
        if let Some(v) = v
            && !(v.is_finite() && v > 0.0)
        {
            eyre::bail!("row {line}: {name} must be > 0 when present, got {v}");
        }
    }
    Ok(())
}

/// Load per-gate calibration rows; each gate may appear at most once.
pub fn load_gate_calibration_csv(
    path: &std::path::Path,
    num_gates: usize,
) -> eyre::Result<Vec<GateCalibrationRow>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| eyre::eyre!("open calibration CSV {:?}: {}", path, e))?;

    // Enforce exact headers
    let headers = rdr
        .headers()
        .map_err(|e| eyre::eyre!("read CSV headers {:?}: {}", path, e))?
        .clone();
    let actual: Vec<String> = headers.iter().map(ToString::to_string).collect();
    if actual != HEADERS {
        eyre::bail!(
            "calibration CSV must have headers '{}', got: {}",
            HEADERS.join(","),
            actual.join(",")
        );
    }

    let mut rows: Vec<GateCalibrationRow> = Vec::new();
    for (idx, rec) in rdr.deserialize::<GateCalibrationRow>().enumerate() {
        let line = idx + 2;
        let row = rec.map_err(|e| eyre::eyre!("invalid CSV row {line}: {e}"))?;
        check_row(&row, line, num_gates)?;
        if rows.iter().any(|r| r.gate == row.gate) {
            eyre::bail!("row {line}: gate {} appears more than once", row.gate);
        }
        rows.push(row);
    }
    if rows.is_empty() {
        eyre::bail!("calibration CSV {:?} has no rows", path);
    }
    Ok(rows)
}

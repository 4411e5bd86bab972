use std::fs::File;
use std::io::Write;

use mmu_config::{GateCalibrationRow, load_gate_calibration_csv};
use rstest::rstest;
use tempfile::tempdir;

fn write_csv(body: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("gates.csv");
    let mut f = File::create(&path).unwrap();
    f.write_all(body.as_bytes()).unwrap();
    (dir, path)
}

#[rstest]
fn loads_rows_with_blank_cells_as_uncalibrated() {
    let (_dir, path) = write_csv(
        "gate,bowden_length,rotation_distance,clog_length\n0,612.3,22.7317,12.2\n1,,22.9,\n",
    );
    let rows = load_gate_calibration_csv(&path, 4).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(
        rows[1],
        GateCalibrationRow {
            gate: 1,
            bowden_length: None,
            rotation_distance: Some(22.9),
            clog_length: None,
        }
    );
    assert_eq!(rows[0].bowden_length, Some(612.3));
}

#[rstest]
fn rejects_wrong_headers() {
    let (_dir, path) = write_csv("gate,length\n0,600\n");
    let err = load_gate_calibration_csv(&path, 4).unwrap_err();
    assert!(err.to_string().contains("must have headers"));
}

#[rstest]
#[case("gate,bowden_length,rotation_distance,clog_length\n7,600,,\n", "out of range")]
#[case("gate,bowden_length,rotation_distance,clog_length\n0,-5,,\n", "bowden_length must be > 0")]
#[case("gate,bowden_length,rotation_distance,clog_length\n0,600,,\n0,601,,\n", "more than once")]
#[case("gate,bowden_length,rotation_distance,clog_length\nx,600,,\n", "invalid CSV row 2")]
#[case("gate,bowden_length,rotation_distance,clog_length\n", "no rows")]
fn rejects_bad_rows(#[case] body: &str, #[case] message: &str) {
    let (_dir, path) = write_csv(body);
    let err = load_gate_calibration_csv(&path, 4).unwrap_err();
    assert!(err.to_string().contains(message), "got '{err}'");
}

#[rstest]
fn missing_file_is_an_error() {
    let dir = tempdir().unwrap();
    let err = load_gate_calibration_csv(&dir.path().join("nope.csv"), 4).unwrap_err();
    assert!(err.to_string().contains("open calibration CSV"));
}

use mmu_core::config::{ExtruderEndstop, GateEndstop};
use mmu_core::error::FaultResult;
use mmu_core::mocks::MockRig;
use mmu_core::{
    DynTransport, FilamentPosition, LoadOptions, Stage, StateError, SyncMode, TransportCfg,
    TransportFault, UnloadOptions,
};
use mmu_traits::{AxisRole, Coupling, ManualClock};
use rstest::rstest;

fn rig_cfg() -> TransportCfg {
    let mut cfg = TransportCfg::default();
    cfg.gate.homing_endstop = GateEndstop::GateSensor;
    cfg
}

fn rig_transport(rig: &MockRig, cfg: TransportCfg) -> DynTransport {
    rig.set_sensor("mmu_gate", false);
    DynTransport::builder()
        .with_motion(rig.motion())
        .with_sensors(rig.sensors())
        .with_selector(rig.grip())
        .with_encoder(rig.encoder())
        .with_config(cfg)
        .build()
        .expect("transport build")
}

fn calibrated(rig: &MockRig, cfg: TransportCfg, bowden: f64) -> DynTransport {
    let mut t = rig_transport(rig, cfg);
    t.calibration_mut().update_bowden_length(0, bowden);
    t.select_gate(0).expect("select gate 0");
    t
}

fn bowden_only() -> LoadOptions {
    LoadOptions {
        skip_extruder: true,
        ..LoadOptions::default()
    }
}

#[rstest]
fn small_bowden_slip_is_accepted_and_recorded() {
    let rig = MockRig::new();
    let mut t = calibrated(&rig, rig_cfg(), 600.0);
    // gate homing, then 580 of 600 mm seen on the bowden move
    rig.script_encoder(&[1.0, 580.0 / 600.0]);

    let report = t.load_sequence(&bowden_only()).expect("load");
    assert_eq!(report.end, FilamentPosition::EndBowden);
    assert_eq!(report.corrections, 0);
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    let last = t.state().calibration.telemetry(0).and_then(|tm| tm.last());
    assert!(last.is_some_and(|r| (r - 580.0 / 600.0).abs() < 1e-9), "ratio {last:?}");
}

#[rstest]
fn persistent_slip_gets_two_corrections_then_a_warning() {
    let rig = MockRig::new();
    let mut cfg = rig_cfg();
    cfg.bowden.apply_correction = true;
    let mut t = calibrated(&rig, cfg, 600.0);
    // 25% lost on the bowden move, both corrections also slip
    rig.script_encoder(&[1.0, 0.75, 0.4, 0.1]);

    let report = t.load_sequence(&bowden_only()).expect("slip is not fatal");
    assert_eq!(report.corrections, 2);
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("after correction moves"));
    let drives = rig.moves().iter().filter(|m| m.endstop.is_none()).count();
    assert_eq!(drives, 3);
    // A corrected move does not feed the telemetry window.
    assert!(t.state().calibration.telemetry(0).is_some_and(|tm| tm.is_empty()));
}

#[rstest]
fn one_correction_is_enough_when_it_lands() {
    let rig = MockRig::new();
    let mut cfg = rig_cfg();
    cfg.bowden.apply_correction = true;
    let mut t = calibrated(&rig, cfg, 600.0);
    rig.script_encoder(&[1.0, 0.75, 1.0]);

    let report = t.load_sequence(&bowden_only()).expect("load");
    assert_eq!(report.corrections, 1);
    assert!(report.warnings.is_empty());
}

#[rstest]
fn slip_beyond_hard_tolerance_fails_the_bowden_stage() {
    let rig = MockRig::new();
    let mut t = calibrated(&rig, rig_cfg(), 600.0);
    rig.script_encoder(&[1.0, 0.1]);

    let err = t.load_sequence(&bowden_only()).expect_err("excessive slip");
    match err.downcast_ref::<TransportFault>() {
        Some(f) => {
            assert_eq!(f.stage, Stage::Bowden);
            assert_eq!(f.commanded, Some(600.0));
        }
        None => panic!("expected TransportFault, got: {err:?}"),
    }
}

#[rstest]
#[case(Some(false), Some(true), FilamentPosition::HomedEntry)]
#[case(Some(true), Some(true), FilamentPosition::Loaded)]
#[case(Some(false), Some(false), FilamentPosition::InBowden)]
fn recovery_reads_the_sensors(
    #[case] toolhead: Option<bool>,
    #[case] entry: Option<bool>,
    #[case] expected: FilamentPosition,
) {
    let rig = MockRig::new();
    let mut t = rig_transport(&rig, rig_cfg());
    rig.set_sensor("mmu_gate", true);
    if let Some(v) = toolhead {
        rig.set_sensor("toolhead", v);
    }
    if let Some(v) = entry {
        rig.set_sensor("extruder", v);
    }
    let pos = t.recover(false, false).expect("recover");
    assert_eq!(pos, expected);
    assert!(rig.moves().is_empty());
}

#[rstest]
fn buzz_test_finds_filament_in_the_extruder() {
    let rig = MockRig::new();
    let mut t = rig_transport(&rig, rig_cfg());
    rig.set_sensor("toolhead", false);
    rig.set_sensor("extruder", true);

    let pos = t.recover(true, true).expect("recover");
    assert_eq!(pos, FilamentPosition::InExtruder);
    let moves = rig.moves();
    assert_eq!(moves.len(), 2);
    assert!(moves.iter().all(|m| m.axis == AxisRole::Extruder));
}

#[rstest]
fn protected_sync_restores_once_after_a_fault() {
    let rig = MockRig::new();
    let mut t = rig_transport(&rig, rig_cfg());
    t.apply_sync(SyncMode::GearSyncedToExtruder).expect("sync");
    assert!(rig.is_gripped());

    let out: FaultResult<()> = t.with_protected_sync(|t| {
        t.apply_sync(SyncMode::Unsynced)?;
        t.with_protected_sync(|t| {
            t.apply_sync(SyncMode::ExtruderSyncedToGear)?;
            Err(TransportFault::motion(Stage::Sync, "injected"))
        })
    });
    assert!(out.is_err());
    assert_eq!(t.sync_state().mode, SyncMode::GearSyncedToExtruder);
    assert_eq!(rig.coupling(), Coupling::GearToExtruder);
    // The grip never let go inside the scope.
    assert_eq!(rig.grip_changes(), 1);
}

#[rstest]
fn bypass_is_never_synced() {
    let rig = MockRig::new();
    let mut t = rig_transport(&rig, rig_cfg());
    t.select_bypass();
    t.set_printing(true);
    assert_eq!(t.reset_sync(true).expect("reset"), SyncMode::Unsynced);
    assert_eq!(rig.coupling(), Coupling::None);
}

#[rstest]
fn failure_during_print_locks_the_unit() {
    let rig = MockRig::new();
    let mut t = calibrated(&rig, rig_cfg(), 600.0);
    rig.set_homing_triggers(false);
    t.set_printing(true);

    assert!(t.load_sequence(&LoadOptions::default()).is_err());
    assert!(t.is_locked());
    let moves = rig.moves().len();

    let err = t.load_sequence(&LoadOptions::default()).expect_err("locked");
    assert!(matches!(err.downcast_ref::<StateError>(), Some(StateError::Locked)));
    assert_eq!(rig.moves().len(), moves);

    t.unlock();
    assert!(!t.is_locked());
    assert!(t.is_printing());
}

#[rstest]
fn uncalibrated_bowden_is_refused_before_motion() {
    let rig = MockRig::new();
    let mut t = rig_transport(&rig, rig_cfg());
    t.select_gate(0).expect("select");

    let err = t.load_sequence(&LoadOptions::default()).expect_err("uncalibrated");
    match err.downcast_ref::<StateError>() {
        Some(StateError::Uncalibrated(text)) => {
            assert!(text.contains("bowden length for gate 0"), "{text}")
        }
        other => panic!("expected Uncalibrated, got: {other:?}"),
    }
    assert!(rig.moves().is_empty());
}

#[rstest]
fn load_without_selection_is_refused() {
    let rig = MockRig::new();
    let mut t = rig_transport(&rig, rig_cfg());
    let err = t.load_sequence(&LoadOptions::default()).expect_err("no gate");
    assert!(matches!(err.downcast_ref::<StateError>(), Some(StateError::NoGateSelected)));
}

#[rstest]
fn bypass_load_uses_the_extruder_only() {
    let rig = MockRig::new();
    let mut t = rig_transport(&rig, rig_cfg());
    rig.set_sensor("toolhead", false);
    t.select_bypass();

    let report = t.load_sequence(&LoadOptions::default()).expect("bypass load");
    assert_eq!(report.end, FilamentPosition::Loaded);
    let moves = rig.moves();
    assert!(!moves.is_empty());
    assert!(moves.iter().all(|m| m.axis == AxisRole::Extruder), "{moves:?}");
    assert!(!rig.is_gripped());
}

#[rstest]
fn collision_homing_feeds_bowden_autotune() {
    let rig = MockRig::new();
    let mut cfg = rig_cfg();
    cfg.extruder.homing_endstop = ExtruderEndstop::Collision;
    let mut t = calibrated(&rig, cfg, 610.0);
    // gate, fast bowden move, then the third collision step stalls
    rig.script_encoder(&[1.0, 1.0, 1.0, 1.0, 0.2]);

    let report = t.load_sequence(&LoadOptions::default()).expect("load");
    assert_eq!(report.end, FilamentPosition::Loaded);
    assert_eq!(rig.gear_current(), 100);
    // Homing came up well short of the deficit, so the length shrinks.
    assert_eq!(report.autotune.bowden_length, Some(609.0));
    assert_eq!(t.state().calibration.bowden_length(0).value(), Some(609.0));
}

#[rstest]
fn tension_sensor_drives_post_load_adjust() {
    let rig = MockRig::new();
    let mut t = calibrated(&rig, rig_cfg(), 610.0);
    rig.set_sensor("filament_tension", true);

    t.load_sequence(&LoadOptions::default()).expect("load");
    let nudges = rig
        .moves()
        .iter()
        .filter(|m| m.axis == AxisRole::Gear && (m.distance - 1.0).abs() < 1e-12)
        .count();
    // clog length for 610 mm is 12.2 mm: 13 one-millimetre steps
    assert_eq!(nudges, 13);
}

#[rstest]
fn sequence_duration_comes_from_the_injected_clock() {
    let rig = MockRig::new();
    rig.set_sensor("mmu_gate", false);
    let clock = ManualClock::new();
    let mut t = DynTransport::builder()
        .with_motion(rig.motion())
        .with_sensors(rig.sensors())
        .with_selector(rig.grip())
        .with_encoder(rig.encoder())
        .with_clock(Box::new(clock.clone()))
        .with_config(rig_cfg())
        .build()
        .expect("transport build");
    t.calibration_mut().update_bowden_length(0, 600.0);
    t.select_gate(0).expect("select gate 0");

    let report = t.load_sequence(&bowden_only()).expect("load");
    assert_eq!(report.duration_ms, 0);
    assert_eq!(t.state().gates.swaps.load_ms, 0);
}

#[rstest]
fn calibrating_skips_correction_moves() {
    let rig = MockRig::new();
    let mut cfg = rig_cfg();
    cfg.bowden.apply_correction = true;
    let mut t = calibrated(&rig, cfg, 600.0);
    t.calibration_mut().set_calibrating(true);
    rig.script_encoder(&[1.0, 0.75]);

    let report = t.load_sequence(&bowden_only()).expect("load while calibrating");
    assert_eq!(report.corrections, 0);
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
}

#[rstest]
#[case::normal(false, 1)]
#[case::calibrating(true, 0)]
fn telemetry_is_held_back_while_calibrating(#[case] calibrating: bool, #[case] samples: usize) {
    let rig = MockRig::new();
    let mut t = calibrated(&rig, rig_cfg(), 600.0);
    t.calibration_mut().set_calibrating(calibrating);
    rig.script_encoder(&[1.0, 0.97]);

    t.load_sequence(&bowden_only()).expect("load");
    assert_eq!(t.state().calibration.telemetry(0).map(|tm| tm.len()), Some(samples));
}

#[rstest]
fn uncalibrated_encoder_blocks_every_sequence() {
    let rig = MockRig::new();
    let mut t = calibrated(&rig, rig_cfg(), 600.0);
    t.calibration_mut().set_encoder_calibrated(false);

    let errors = [
        t.load_sequence(&LoadOptions::default()).expect_err("load"),
        t.unload_sequence(&UnloadOptions::default()).expect_err("unload"),
        t.eject().expect_err("eject"),
    ];
    for err in errors {
        match err.downcast_ref::<StateError>() {
            Some(StateError::Uncalibrated(text)) => assert!(text.contains("encoder"), "{text}"),
            other => panic!("expected Uncalibrated, got: {other:?}"),
        }
    }
    assert!(rig.moves().is_empty());

    t.calibration_mut().set_encoder_calibrated(true);
    t.load_sequence(&bowden_only()).expect("load once calibrated");
}

use mmu_core::calibration::SELECTOR_CALIBRATED_KEY;
use mmu_core::config::GateEndstop;
use mmu_core::position::POSITION_KEY;
use mmu_core::{
    DynTransport, FaultKind, FilamentPosition, GateStatus, LoadOptions, Stage, StateError, TipMode,
    TransportCfg, TransportFault, UnloadOptions,
};
use mmu_hardware::{LinearSelector, MemoryStore, SimulatedUnit};
use mmu_traits::{ManualClock, StoredValue};
use rstest::{fixture, rstest};

const NOZZLE: f64 = 670.0;

fn sensor_homing_cfg() -> TransportCfg {
    let mut cfg = TransportCfg::default();
    cfg.gate.homing_endstop = GateEndstop::GateSensor;
    cfg
}

fn transport(unit: &SimulatedUnit, cfg: TransportCfg, store: MemoryStore) -> DynTransport {
    let mut t = DynTransport::builder()
        .with_motion(unit.motion())
        .with_sensors(unit.sensors())
        .with_selector(LinearSelector::new(unit))
        .with_encoder(unit.encoder())
        .with_store(store)
        .with_config(cfg)
        .build()
        .expect("transport build");
    t.calibration_mut().update_bowden_length(0, 610.0);
    t.select_gate(0).expect("select gate 0");
    t
}

#[fixture]
fn unit() -> SimulatedUnit {
    let unit = SimulatedUnit::default();
    unit.insert_filament(-12.0);
    unit
}

fn move_count(unit: &SimulatedUnit) -> usize {
    unit.with_world(|w| w.moves.len())
}

#[rstest]
fn load_then_unload_round_trip(unit: SimulatedUnit) {
    let store = MemoryStore::new();
    let mut t = transport(&unit, sensor_homing_cfg(), store.clone());

    let load = t.load_sequence(&LoadOptions::default()).expect("load");
    assert_eq!(load.end, FilamentPosition::Loaded);
    assert!(load.warnings.is_empty(), "warnings: {:?}", load.warnings);
    assert_eq!(load.corrections, 0);
    assert!((unit.tip() - NOZZLE).abs() < 0.5, "tip at {}", unit.tip());
    assert!(load.moved > 600.0);
    assert_eq!(t.state().gates.status(0), GateStatus::Available);
    assert_eq!(t.state().gates.last_tool, Some(0));
    assert_eq!(store.durable(POSITION_KEY), Some(StoredValue::Int(10)));

    let unload = t.unload_sequence(&UnloadOptions::default()).expect("unload");
    assert_eq!(unload.end, FilamentPosition::Unloaded);
    assert!((unit.tip() + 23.0).abs() < 0.5, "tip at {}", unit.tip());
    assert_eq!(t.state().gates.status(0), GateStatus::AvailableFromBuffer);
    assert_eq!(t.state().gates.swaps.loads, 1);
    assert_eq!(t.state().gates.swaps.unloads, 1);
    assert_eq!(store.durable(POSITION_KEY), Some(StoredValue::Int(0)));

    // Both bowden moves fed the telemetry window with in-band ratios.
    let band = t.cfg().calibration.ratio_band;
    let telemetry = t.state().calibration.telemetry(0).expect("gate 0 telemetry");
    assert!(!telemetry.is_empty());
    for ratio in [telemetry.last(), telemetry.mean()] {
        assert!(ratio.is_some_and(|r| (r - 1.0).abs() < band), "ratio {ratio:?} outside {band}");
    }
}

fn tip_unload(mode: TipMode) -> UnloadOptions {
    UnloadOptions {
        form_tip: mode,
        ..UnloadOptions::default()
    }
}

#[rstest]
#[case::standalone(TipMode::Standalone)]
#[case::cut(TipMode::Cut)]
fn unload_with_formed_tip_leaves_the_extruder(unit: SimulatedUnit, #[case] mode: TipMode) {
    let mut t = transport(&unit, sensor_homing_cfg(), MemoryStore::new());
    t.load_sequence(&LoadOptions::default()).expect("load");

    let report = t.unload_sequence(&tip_unload(mode)).expect("unload");
    assert_eq!(report.end, FilamentPosition::Unloaded);
    assert!((unit.tip() + 23.0).abs() < 0.5, "tip at {}", unit.tip());
    let history: Vec<_> = t.state().tracker.history().collect();
    assert!(
        history.contains(&FilamentPosition::InExtruder)
            && history.contains(&FilamentPosition::EndBowden),
        "{history:?}"
    );

    let tip = t.cfg().tip.clone();
    let first_retract = if mode == TipMode::Cut { tip.cut_position } else { tip.cooling_distance };
    let retracted = unit.with_world(|w| {
        w.moves.iter().any(|m| (m.commanded + first_retract).abs() < 1e-9)
    });
    assert!(retracted, "no {first_retract}mm tip retract recorded");
}

#[rstest]
fn standalone_tip_dwells_on_the_injected_clock(unit: SimulatedUnit) {
    let clock = ManualClock::new();
    let mut t = DynTransport::builder()
        .with_motion(unit.motion())
        .with_sensors(unit.sensors())
        .with_selector(LinearSelector::new(&unit))
        .with_encoder(unit.encoder())
        .with_clock(Box::new(clock.clone()))
        .with_config(sensor_homing_cfg())
        .build()
        .expect("transport build");
    t.calibration_mut().update_bowden_length(0, 610.0);
    t.select_gate(0).expect("select gate 0");
    t.load_sequence(&LoadOptions::default()).expect("load");

    let report = t.unload_sequence(&tip_unload(TipMode::Standalone)).expect("unload");
    assert_eq!(report.duration_ms, 200);
}

#[rstest]
fn extruder_only_unload_keeps_filament_in_the_bowden(unit: SimulatedUnit) {
    let mut t = transport(&unit, sensor_homing_cfg(), MemoryStore::new());
    t.load_sequence(&LoadOptions::default()).expect("load");

    let report = t
        .unload_sequence(&UnloadOptions {
            extruder_only: true,
            ..UnloadOptions::default()
        })
        .expect("extruder unload");
    assert_eq!(report.end, FilamentPosition::EndBowden);
    assert!(unit.tip() > 550.0 && unit.tip() < 610.0, "tip at {}", unit.tip());
    assert_eq!(t.state().gates.swaps.unloads, 0);
    assert_eq!(t.state().gates.status(0), GateStatus::Available);

    // Reload picks up from the end of the bowden.
    let reload = t.load_sequence(&LoadOptions::default()).expect("reload");
    assert_eq!(reload.start, FilamentPosition::EndBowden);
    assert_eq!(reload.end, FilamentPosition::Loaded);
    assert!((unit.tip() - NOZZLE).abs() < 0.5, "tip at {}", unit.tip());
}

#[rstest]
fn load_refused_while_filament_is_in_the_extruder(unit: SimulatedUnit) {
    let mut cfg = sensor_homing_cfg();
    cfg.recovery.auto_recover = false;
    // Toolhead homing falls short of the sensor.
    cfg.toolhead.homing_max = 5.0;
    let mut t = transport(&unit, cfg, MemoryStore::new());
    let err = t.load_sequence(&LoadOptions::default()).expect_err("toolhead not reached");
    assert!(err.downcast_ref::<TransportFault>().is_some_and(|f| f.stage == Stage::Toolhead));
    assert_eq!(t.filament_position(), FilamentPosition::ExtruderEntry);

    let moves = move_count(&unit);
    for extruder_only in [false, true] {
        let err = t
            .load_sequence(&LoadOptions {
                extruder_only,
                ..LoadOptions::default()
            })
            .expect_err("already in the extruder");
        assert!(
            matches!(err.downcast_ref::<StateError>(), Some(StateError::InvalidPosition(_))),
            "{err:?}"
        );
    }
    assert_eq!(move_count(&unit), moves);

    let report = t.unload_sequence(&UnloadOptions::default()).expect("unload");
    assert_eq!(report.end, FilamentPosition::Unloaded);
}

#[rstest]
fn selector_calibration_flag_survives_a_restart(unit: SimulatedUnit) {
    let store = MemoryStore::new();
    {
        let mut t = transport(&unit, sensor_homing_cfg(), store.clone());
        t.calibration_mut().set_selector_calibrated(false);
        t.persist().expect("persist");
    }
    assert_eq!(store.durable(SELECTOR_CALIBRATED_KEY), Some(StoredValue::Int(0)));

    let mut t = transport(&unit, sensor_homing_cfg(), store);
    let err = t.load_sequence(&LoadOptions::default()).expect_err("selector uncalibrated");
    match err.downcast_ref::<StateError>() {
        Some(StateError::Uncalibrated(text)) => assert!(text.contains("selector"), "{text}"),
        other => panic!("expected Uncalibrated, got: {other:?}"),
    }
    assert!(t.eject().is_err());
    assert_eq!(move_count(&unit), 0);

    t.calibration_mut().set_selector_calibrated(true);
    t.load_sequence(&LoadOptions::default()).expect("load once calibrated");
}

#[rstest]
fn unload_when_unloaded_does_nothing(unit: SimulatedUnit) {
    let mut t = transport(&unit, sensor_homing_cfg(), MemoryStore::new());
    t.load_sequence(&LoadOptions::default()).expect("load");
    t.unload_sequence(&UnloadOptions::default()).expect("first unload");

    let before = move_count(&unit);
    let again = t.unload_sequence(&UnloadOptions::default()).expect("second unload");
    assert!(again.is_noop());
    assert_eq!(move_count(&unit), before);
}

#[rstest]
fn gate_endstop_found_within_homing_distance(unit: SimulatedUnit) {
    let mut t = transport(&unit, sensor_homing_cfg(), MemoryStore::new());
    t.recover(false, false).expect("recover");
    assert_eq!(t.filament_position(), FilamentPosition::Unloaded);

    t.load_gate(0).expect("gate stage");
    assert_eq!(t.filament_position(), FilamentPosition::HomedGate);
    assert!(unit.tip().abs() <= 0.2, "tip at {}", unit.tip());
    let homing = unit.with_world(|w| w.moves.iter().filter(|m| m.homing.is_some()).count());
    assert_eq!(homing, 1);
}

#[rstest]
fn encoder_gate_homing_then_full_cycle(unit: SimulatedUnit) {
    // Default gate technique is the encoder.
    let mut t = transport(&unit, TransportCfg::default(), MemoryStore::new());
    let load = t.load_sequence(&LoadOptions::default()).expect("load");
    assert_eq!(load.end, FilamentPosition::Loaded);
    assert!((unit.tip() - NOZZLE).abs() < 0.5);

    let unload = t.unload_sequence(&UnloadOptions::default()).expect("unload");
    assert_eq!(unload.end, FilamentPosition::Unloaded);
    assert!(unit.tip() < 0.0, "tip at {}", unit.tip());
}

#[rstest]
fn oversized_bowden_move_is_clamped_with_warning(unit: SimulatedUnit) {
    let mut t = transport(&unit, sensor_homing_cfg(), MemoryStore::new());
    let report = t
        .load_sequence(&LoadOptions {
            bowden_move: Some(900.0),
            ..LoadOptions::default()
        })
        .expect("load");
    assert_eq!(report.end, FilamentPosition::Loaded);
    assert!(report.warnings.iter().any(|w| w.contains("clamped")), "{:?}", report.warnings);
}

#[rstest]
fn partial_bowden_load_stops_in_bowden(unit: SimulatedUnit) {
    let mut t = transport(&unit, sensor_homing_cfg(), MemoryStore::new());
    let report = t
        .load_sequence(&LoadOptions {
            bowden_move: Some(200.0),
            ..LoadOptions::default()
        })
        .expect("partial load");
    assert_eq!(report.end, FilamentPosition::InBowden);
    assert!((unit.tip() - 200.0).abs() < 0.5, "tip at {}", unit.tip());
}

#[rstest]
fn transient_homing_faults_are_retried_slower(unit: SimulatedUnit) {
    let mut t = transport(&unit, sensor_homing_cfg(), MemoryStore::new());
    unit.inject_homing_faults(2);
    t.load_sequence(&LoadOptions::default()).expect("load after retries");

    let speed = unit.with_world(|w| {
        w.moves
            .iter()
            .find(|m| m.homing.as_deref() == Some("mmu_gate"))
            .map(|m| m.speed)
    });
    let expected = t.cfg().speeds.gear_homing_speed * 0.25;
    assert!(speed.is_some_and(|s| (s - expected).abs() < 1e-9), "speed {speed:?}");
}

#[rstest]
fn exhausted_retries_fail_the_gate_stage(unit: SimulatedUnit) {
    let mut t = transport(&unit, sensor_homing_cfg(), MemoryStore::new());
    unit.inject_homing_faults(3);
    let err = t.load_sequence(&LoadOptions::default()).expect_err("load must fail");

    match err.downcast_ref::<TransportFault>() {
        Some(f) => {
            assert_eq!(f.kind, FaultKind::Motion);
            assert_eq!(f.stage, Stage::Gate);
            assert_eq!(f.gate, Some(0));
        }
        None => panic!("expected TransportFault, got: {err:?}"),
    }
    assert_eq!(t.state().gates.get(0).map(|g| g.stats.load_failures), Some(1));
    // Automatic recovery ran: nothing is in the path.
    assert_eq!(t.filament_position(), FilamentPosition::Unloaded);
}

#[rstest]
fn empty_gate_is_marked_after_grip_retries() {
    let unit = SimulatedUnit::default();
    let mut t = transport(&unit, sensor_homing_cfg(), MemoryStore::new());
    let err = t.load_sequence(&LoadOptions::default()).expect_err("no filament");
    assert!(err.downcast_ref::<TransportFault>().is_some_and(|f| f.stage == Stage::Gate));
    assert_eq!(t.state().gates.status(0), GateStatus::Empty);
    assert_eq!(t.state().gates.get(0).map(|g| g.stats.grip_retries), Some(1));
}

#[rstest]
fn eject_after_unload_retracts_further_and_empties_gate(unit: SimulatedUnit) {
    let mut cfg = sensor_homing_cfg();
    cfg.gate.final_eject_distance = 20.0;
    let mut t = transport(&unit, cfg, MemoryStore::new());
    t.load_sequence(&LoadOptions::default()).expect("load");
    t.unload_sequence(&UnloadOptions::default()).expect("unload");

    let tip = unit.tip();
    let report = t.eject().expect("eject");
    assert!((report.moved - 20.0).abs() < 1e-9);
    assert!((unit.tip() - (tip - 20.0)).abs() < 0.2);
    assert_eq!(t.state().gates.status(0), GateStatus::Empty);
}

#[rstest]
fn pre_unload_check_detects_filament_held_by_extruder(unit: SimulatedUnit) {
    let mut cfg = sensor_homing_cfg();
    cfg.bowden.pre_unload_test = true;
    cfg.bowden.pre_unload_error_tolerance = 50.0;
    // Exit move too short to leave the extruder gears.
    cfg.toolhead.extruder_to_nozzle = cfg.toolhead.sensor_to_nozzle;
    cfg.toolhead.unload_safety_margin = 1.0;
    let mut t = transport(&unit, cfg, MemoryStore::new());
    t.load_sequence(&LoadOptions::default()).expect("load");

    let err = t.unload_sequence(&UnloadOptions::default()).expect_err("stuck");
    match err.downcast_ref::<TransportFault>() {
        Some(f) => assert_eq!(f.stage, Stage::PreUnloadProbe),
        None => panic!("expected TransportFault, got: {err:?}"),
    }
    assert_eq!(t.state().gates.get(0).map(|g| g.stats.unload_failures), Some(1));
}

#[rstest]
fn in_bowden_load_is_refused(unit: SimulatedUnit) {
    let mut t = transport(&unit, sensor_homing_cfg(), MemoryStore::new());
    t.load_sequence(&LoadOptions {
        bowden_move: Some(100.0),
        ..LoadOptions::default()
    })
    .expect("partial load");
    assert_eq!(t.filament_position(), FilamentPosition::InBowden);
    assert!(t.load_sequence(&LoadOptions::default()).is_err());

    // Unloading from the bowden homes back to the gate.
    let report = t.unload_sequence(&UnloadOptions::default()).expect("unload from bowden");
    assert_eq!(report.end, FilamentPosition::Unloaded);
}

#[rstest]
fn persisted_state_survives_a_restart(unit: SimulatedUnit) {
    let store = MemoryStore::new();
    {
        let mut t = transport(&unit, sensor_homing_cfg(), store.clone());
        t.load_sequence(&LoadOptions::default()).expect("load");
    }
    let t = DynTransport::builder()
        .with_motion(unit.motion())
        .with_sensors(unit.sensors())
        .with_selector(LinearSelector::new(&unit))
        .with_store(store)
        .with_config(sensor_homing_cfg())
        .build()
        .expect("rebuild");
    assert_eq!(t.filament_position(), FilamentPosition::Loaded);
    assert_eq!(t.gate_selected().gate(), Some(0));
    assert!(t.state().calibration.bowden_length(0).is_calibrated());
}

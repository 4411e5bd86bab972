use mmu_core::calibration::{CalibrationTelemetry, clog_length_for};
use mmu_core::config::GateEndstop;
use mmu_core::mocks::MockRig;
use mmu_core::{
    DynTransport, FilamentPosition, LoadOptions, MoveResult, SensorSnapshot, TransportCfg,
    UnloadOptions, infer_position,
};
use proptest::prelude::*;

fn sensor() -> impl Strategy<Value = Option<bool>> {
    prop_oneof![Just(None), Just(Some(false)), Just(Some(true))]
}

prop_compose! {
    fn snapshot()(
        gate in sensor(),
        gear in sensor(),
        entry in sensor(),
        toolhead in sensor(),
    ) -> SensorSnapshot {
        SensorSnapshot { gate, gear, entry, toolhead }
    }
}

fn position() -> impl Strategy<Value = FilamentPosition> {
    prop_oneof![
        Just(FilamentPosition::Unknown),
        Just(FilamentPosition::Unloaded),
        Just(FilamentPosition::InBowden),
        Just(FilamentPosition::EndBowden),
        Just(FilamentPosition::InExtruder),
        Just(FilamentPosition::Loaded),
    ]
}

proptest! {
    #[test]
    fn delta_is_actual_minus_measured(actual in -800.0f64..800.0, fraction in 0.0f64..1.0) {
        let measured = actual.abs() * fraction;
        let r = MoveResult::new(actual, false, Some(measured));
        prop_assert!((r.delta - (actual.abs() - measured)).abs() < 1e-9);
        prop_assert!(r.delta >= -1e-9);
        prop_assert_eq!(MoveResult::new(actual, false, None).delta, 0.0);
    }

    #[test]
    fn triggered_toolhead_always_means_loaded(
        mut s in snapshot(),
        previous in position(),
        strict in any::<bool>(),
        presence in proptest::option::of(any::<bool>()),
        park in -30.0f64..30.0,
    ) {
        s.toolhead = Some(true);
        let inferred = infer_position(&s, previous, strict, presence, park);
        prop_assert_eq!(inferred, FilamentPosition::Loaded);
    }

    #[test]
    fn recovery_never_yields_unknown(
        s in snapshot(),
        previous in position(),
        strict in any::<bool>(),
        presence in proptest::option::of(any::<bool>()),
        park in -30.0f64..30.0,
    ) {
        let inferred = infer_position(&s, previous, strict, presence, park);
        prop_assert_ne!(inferred, FilamentPosition::Unknown);
    }

    #[test]
    fn clog_length_has_a_floor(bowden in 0.0f64..5000.0) {
        let clog = clog_length_for(bowden);
        prop_assert!(clog >= 8.0);
        prop_assert!(clog >= bowden * 0.02 - 0.05);
    }

    #[test]
    fn telemetry_never_outgrows_its_window(
        window in 1usize..20,
        ratios in proptest::collection::vec(0.0f64..2.0, 0..60),
    ) {
        let mut t = CalibrationTelemetry::new(window);
        for r in ratios {
            t.push(r);
            prop_assert!(t.len() <= window);
        }
    }

    #[test]
    fn any_bowden_request_ends_in_a_known_position(request in 1.0f64..1200.0) {
        let rig = MockRig::new();
        let mut t = rig_transport(&rig);

        let load = t
            .load_sequence(&LoadOptions { bowden_move: Some(request), ..LoadOptions::default() })
            .expect("load");
        if request >= 600.0 {
            prop_assert_eq!(load.end, FilamentPosition::Loaded);
        } else {
            prop_assert_eq!(load.end, FilamentPosition::InBowden);
        }
        let unload = t.unload_sequence(&UnloadOptions::default()).expect("unload");
        prop_assert_eq!(unload.end, FilamentPosition::Unloaded);
    }

    #[test]
    fn position_only_advances_on_load_and_retreats_on_unload(request in 1.0f64..1200.0) {
        let rig = MockRig::new();
        let mut t = rig_transport(&rig);

        t.load_sequence(&LoadOptions { bowden_move: Some(request), ..LoadOptions::default() })
            .expect("load");
        let loading: Vec<FilamentPosition> = t.state().tracker.history().collect();
        prop_assert!(
            loading.windows(2).all(|w| w[0] <= w[1]),
            "load went backwards: {:?}",
            loading
        );

        t.unload_sequence(&UnloadOptions::default()).expect("unload");
        let unloading: Vec<FilamentPosition> =
            t.state().tracker.history().skip(loading.len()).collect();
        prop_assert!(!unloading.is_empty());
        prop_assert!(
            unloading.windows(2).all(|w| w[0] >= w[1]),
            "unload went forwards: {:?}",
            unloading
        );
        prop_assert_eq!(unloading.last(), Some(&FilamentPosition::Unloaded));
    }
}

fn rig_transport(rig: &MockRig) -> DynTransport {
    rig.set_sensor("mmu_gate", false);
    rig.set_sensor("toolhead", false);
    let mut cfg = TransportCfg::default();
    cfg.gate.homing_endstop = GateEndstop::GateSensor;
    let mut t = DynTransport::builder()
        .with_motion(rig.motion())
        .with_sensors(rig.sensors())
        .with_selector(rig.grip())
        .with_encoder(rig.encoder())
        .with_config(cfg)
        .build()
        .expect("build");
    t.calibration_mut().update_bowden_length(0, 600.0);
    t.select_gate(0).expect("select");
    t
}

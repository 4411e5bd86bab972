use mmu_core::error::BuildError;
use mmu_core::mocks::MockRig;
use mmu_core::{DynTransport, FilamentPosition, TransportCfg, TransportParts, build_transport};
use mmu_traits::Selector;
use rstest::rstest;

#[rstest]
fn builder_missing_motion_yields_typed_build_error() {
    let rig = MockRig::new();
    let err = DynTransport::builder()
        // missing with_motion()
        .with_sensors(rig.sensors())
        .with_selector(rig.grip())
        .try_build()
        .expect_err("should fail with MissingMotion");

    match err.downcast_ref::<BuildError>() {
        Some(BuildError::MissingMotion) => {}
        other => panic!("expected MissingMotion, got: {other:?}"),
    }
}

#[rstest]
fn builder_missing_selector_yields_typed_build_error() {
    let rig = MockRig::new();
    let err = DynTransport::builder()
        .with_motion(rig.motion())
        .with_sensors(rig.sensors())
        .try_build()
        .expect_err("should fail with MissingSelector");

    match err.downcast_ref::<BuildError>() {
        Some(BuildError::MissingSelector) => {}
        other => panic!("expected MissingSelector, got: {other:?}"),
    }
}

fn with_cfg(mutate: impl FnOnce(&mut TransportCfg)) -> mmu_core::Result<DynTransport> {
    let rig = MockRig::new();
    let mut cfg = TransportCfg::default();
    mutate(&mut cfg);
    DynTransport::builder()
        .with_motion(rig.motion())
        .with_sensors(rig.sensors())
        .with_selector(rig.grip())
        .with_config(cfg)
        .build()
}

#[rstest]
#[case::no_gates(|c: &mut TransportCfg| c.unit.num_gates = 0, "num_gates")]
#[case::zero_homing(|c: &mut TransportCfg| c.gate.homing_max = 0.0, "homing_max")]
#[case::portion(|c: &mut TransportCfg| c.bowden.fast_load_portion = 120.0, "fast bowden portions")]
#[case::tolerances(|c: &mut TransportCfg| c.bowden.hard_tolerance_pct = 5.0, "soft <= hard")]
#[case::speed(|c: &mut TransportCfg| c.speeds.gear_homing_speed = 0.0, "speeds")]
#[case::retry(|c: &mut TransportCfg| c.retry.speed_factor = 1.5, "speed_factor")]
#[case::window(|c: &mut TransportCfg| c.calibration.telemetry_window = 0, "telemetry_window")]
#[case::current(|c: &mut TransportCfg| c.sync.sync_gear_current = 150, "current percentages")]
fn invalid_config_is_rejected(#[case] mutate: fn(&mut TransportCfg), #[case] needle: &str) {
    let err = with_cfg(mutate).expect_err("invalid config must not build");
    match err.downcast_ref::<BuildError>() {
        Some(BuildError::InvalidConfig(msg)) => assert!(msg.contains(needle), "got '{msg}'"),
        other => panic!("expected InvalidConfig, got: {other:?}"),
    }
}

#[rstest]
fn missing_encoder_disables_encoder_features() {
    let t = with_cfg(|_| {}).expect("default config builds");
    assert!(!t.has_encoder());
    assert!(!t.cfg().unit.has_encoder);
    assert_eq!(t.filament_position(), FilamentPosition::Unknown);
}

#[rstest]
fn static_construction_shares_validation() {
    let rig = MockRig::new();
    let mut parts = TransportParts::default();
    parts.cfg.unit.num_gates = 0;
    let err = build_transport(rig.motion(), rig.sensors(), rig.grip(), parts).expect_err("invalid");
    assert!(matches!(err.downcast_ref::<BuildError>(), Some(BuildError::InvalidConfig(_))));

    let parts = TransportParts {
        encoder: Some(Box::new(rig.encoder())),
        ..TransportParts::default()
    };
    let t = build_transport(rig.motion(), rig.sensors(), rig.grip(), parts).expect("valid");
    assert!(t.has_encoder());
    assert_eq!(t.selector().family(), "mock");
}

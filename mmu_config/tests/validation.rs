use mmu_config::load_toml;
use rstest::rstest;

#[test]
fn empty_document_uses_defaults_and_validates() {
    let cfg = load_toml("").expect("parse TOML");
    cfg.validate().expect("defaults must be valid");
    assert_eq!(cfg.unit.num_gates, 4);
    assert_eq!(cfg.gate.homing_endstop, "encoder");
    assert!((cfg.toolhead.homing_max - 40.0).abs() < f64::EPSILON);
}

#[test]
fn partial_sections_keep_remaining_defaults() {
    let toml = r#"
[unit]
num_gates = 8

[bowden]
apply_correction = true
"#;
    let cfg = load_toml(toml).expect("parse TOML");
    cfg.validate().expect("valid");
    assert_eq!(cfg.unit.num_gates, 8);
    assert!(cfg.bowden.apply_correction);
    assert!((cfg.bowden.fast_load_portion - 95.0).abs() < f64::EPSILON);
}

#[test]
fn unknown_field_types_fail_to_parse() {
    let toml = r#"
[unit]
num_gates = "four"
"#;
    assert!(load_toml(toml).is_err());
}

#[rstest]
#[case("[unit]\nnum_gates = 0", "unit.num_gates must be >= 1")]
#[case("[gate]\nhoming_endstop = \"laser\"", "gate.homing_endstop must be one of")]
#[case("[extruder]\nhoming_endstop = \"magic\"", "extruder.homing_endstop must be one of")]
#[case(
    "[bowden]\nsoft_tolerance_pct = 50.0\nhard_tolerance_pct = 20.0",
    "bowden.hard_tolerance_pct must be >="
)]
#[case("[bowden]\nfast_load_portion = 120.0", "must be in [0, 100]")]
#[case("[retry]\nspeed_factor = 0.0", "retry.speed_factor must be in (0.0, 1.0]")]
#[case("[retry]\nspeed_factor = 1.5", "retry.speed_factor must be in (0.0, 1.0]")]
#[case("[speeds]\ngear_homing_speed = 0.0", "speeds.gear_homing_speed must be > 0")]
#[case("[sync]\nsync_gear_current = 150", "sync.sync_gear_current must be <= 100")]
#[case("[tip]\nmode = \"melt\"", "tip.mode must be one of")]
#[case("[logging]\nrotation = \"weekly\"", "logging.rotation must be one of")]
#[case("[calibration]\nratio_band = 0.0", "calibration.ratio_band must be in")]
#[case("[simulation]\nslip = 0.99", "simulation.slip must be in")]
fn rejects_out_of_range_values(#[case] toml: &str, #[case] message: &str) {
    let cfg = load_toml(toml).expect("parse TOML");
    let err = cfg.validate().expect_err("should be rejected");
    assert!(
        err.to_string().contains(message),
        "expected '{message}' in '{err}'"
    );
}

#[rstest]
#[case(
    "[unit]\nhas_encoder = false",
    "gate.homing_endstop = \"encoder\" requires unit.has_encoder"
)]
#[case(
    "[gate]\nhoming_endstop = \"mmu_gear\"",
    "gate.homing_endstop = \"mmu_gear\" requires sensors.gear"
)]
#[case(
    concat!(
        "[unit]\nhas_encoder = false\n[gate]\nhoming_endstop = \"mmu_gate\"\n",
        "[extruder]\nhoming_endstop = \"collision\""
    ),
    "requires unit.has_encoder"
)]
#[case(
    "[sensors]\nextruder_entry = false\n[extruder]\nhoming_endstop = \"extruder\"",
    "requires sensors.extruder_entry"
)]
fn techniques_require_their_hardware(#[case] toml: &str, #[case] message: &str) {
    let cfg = load_toml(toml).expect("parse TOML");
    let err = cfg.validate().expect_err("should be rejected");
    assert!(err.to_string().contains(message), "got '{err}'");
}

#[test]
fn sensor_homing_without_encoder_is_valid() {
    let toml = r#"
[unit]
has_encoder = false

[gate]
homing_endstop = "mmu_gate"

[extruder]
homing_endstop = "extruder"
"#;
    let cfg = load_toml(toml).expect("parse TOML");
    cfg.validate().expect("valid");
}

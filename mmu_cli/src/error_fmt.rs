//! Human-readable error descriptions and structured JSON error formatting.

use mmu_core::error::{BuildError, FaultKind, Stage, StateError, TransportFault};

fn stage_hint(stage: Stage) -> &'static str {
    match stage {
        Stage::Gate => {
            "Likely causes: Empty gate, filament not reaching the gate endstop, or a slipping gear.\nHow to fix: Check the spool and gate, then retry; raise gate.homing_max if the endstop sits far from the gear."
        }
        Stage::Bowden => {
            "Likely causes: Filament slipping or snagged in the bowden tube, or a stale bowden length.\nHow to fix: Inspect the bowden path and recalibrate the bowden length; tolerances live under [bowden]."
        }
        Stage::ExtruderHoming => {
            "Likely causes: Filament did not reach the extruder entry within extruder.homing_max.\nHow to fix: Check the extruder entry sensor and the bowden length calibration."
        }
        Stage::Toolhead => {
            "Likely causes: Extruder gears not gripping, a clog, or the toolhead sensor not triggering.\nHow to fix: Check the hotend temperature and the toolhead sensor; adjust toolhead.homing_max or move_error_tolerance."
        }
        Stage::Tip => {
            "Likely causes: Tip forming or cutting did not complete.\nHow to fix: Review the [tip] settings and check the cutter."
        }
        Stage::PreUnloadProbe => {
            "Likely causes: Filament is stuck in the extruder or broke inside the bowden.\nHow to fix: Clear the extruder manually, then run `mmu recover`."
        }
        Stage::Park => {
            "Likely causes: Filament did not clear the gate endstop while parking.\nHow to fix: Check the gate for a tangle, then run `mmu recover`."
        }
        Stage::Sync => {
            "Likely causes: The selector failed to grip or release.\nHow to fix: Check the selector mechanics and the [sync] settings."
        }
        Stage::Move | Stage::Recovery => {
            "Likely causes: Motion controller error or an interrupted move.\nHow to fix: Run `mmu recover` and re-run with --log-level=debug for details."
        }
    }
}

fn describe_fault(fault: &TransportFault) -> String {
    if fault.kind == FaultKind::Transient {
        return format!(
            "What happened: {fault}.\nLikely causes: Controller communication timeout or the run was interrupted (ctrl-c).\nHow to fix: Run `mmu recover` to re-establish the filament position, then retry."
        );
    }
    if fault.kind == FaultKind::Config {
        return format!(
            "What happened: {fault}.\nLikely causes: The configured endstop or sensor is not fitted for this technique.\nHow to fix: Fix the [sensors] and endstop settings in the config; retrying will not help."
        );
    }
    format!("What happened: {fault}.\n{}", stage_hint(fault.stage))
}

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    // Typed matches first
    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::MissingMotion
            | BuildError::MissingSensors
            | BuildError::MissingSelector => format!(
                "What happened: The transport could not be assembled ({be}).\nLikely causes: A hardware collaborator failed to initialize.\nHow to fix: Re-run with --log-level=debug and check the [unit] settings."
            ),
            BuildError::InvalidConfig(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: Missing or out-of-range values in the TOML.\nHow to fix: Edit the config file, then rerun. See etc/mmu_config.toml for a sample."
            ),
        };
    }

    if let Some(se) = err.downcast_ref::<StateError>() {
        return match se {
            StateError::Locked => "What happened: The unit is locked after a failure during a print.\nLikely causes: A previous load or unload failed while printing.\nHow to fix: Fix the jam, run `mmu recover`, then unlock from the printer.".to_string(),
            StateError::NoGateSelected => "What happened: No gate is selected.\nLikely causes: Fresh state file or the last selection was cleared.\nHow to fix: Pass --gate N (or --bypass).".to_string(),
            StateError::GateOutOfRange(g) => format!(
                "What happened: Gate {g} does not exist.\nLikely causes: Wrong --gate value or unit.num_gates too small.\nHow to fix: Pick a gate below unit.num_gates."
            ),
            StateError::Uncalibrated(what) => format!(
                "What happened: Calibration is missing: {what}.\nLikely causes: The unit was never calibrated or the calibration CSV was not loaded.\nHow to fix: Pass --calibration FILE or set [calibration] csv in the config."
            ),
            StateError::InvalidPosition(pos) => format!(
                "What happened: The filament position ({pos}) does not allow this operation.\nLikely causes: The tracked position is stale.\nHow to fix: Run `mmu recover`, then retry."
            ),
        };
    }

    if let Some(fault) = err.downcast_ref::<TransportFault>() {
        return describe_fault(fault);
    }

    if let Some(te) = err.downcast_ref::<toml::de::Error>() {
        return format!(
            "What happened: The config file is not valid TOML ({}).\nLikely causes: A typo or a value of the wrong type.\nHow to fix: Fix the line reported above and rerun.",
            te.message()
        );
    }

    // String-based heuristics for errors coming from init or config
    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();

    // Calibration CSV header special-case
    if lower.contains("calibration csv must have headers") {
        return "Invalid headers in calibration CSV. Expected 'gate,bowden_length,rotation_distance,clog_length'."
            .to_string();
    }

    if lower.contains("invalid configuration") {
        let cause = err.root_cause();
        return format!(
            "What happened: Configuration is invalid ({cause}).\nLikely causes: An out-of-range value or an unknown option name.\nHow to fix: Edit the TOML config and try again."
        );
    }

    if lower.contains("read config") {
        return format!(
            "What happened: {msg}.\nLikely causes: The file does not exist or is not readable.\nHow to fix: Pass --config FILE or create etc/mmu_config.toml."
        );
    }

    // Generic fallback
    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!("Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}")
}

/// Stable exit codes: 2 is left to clap usage errors, 1 to anything unclassified.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    if let Some(fault) = err.downcast_ref::<TransportFault>() {
        return match fault.kind {
            FaultKind::Motion => 3,
            FaultKind::Transient => 4,
            FaultKind::Config => 5,
        };
    }
    if err.downcast_ref::<BuildError>().is_some() {
        return 5;
    }
    match err.downcast_ref::<StateError>() {
        Some(StateError::Locked) => 6,
        Some(_) => 7,
        None => 1,
    }
}

fn fault_reason_name(kind: FaultKind) -> &'static str {
    match kind {
        FaultKind::Config => "ConfigFault",
        FaultKind::Motion => "MotionFault",
        FaultKind::Transient => "TransientFault",
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    use serde_json::json;

    let msg = humanize(err);
    if let Some(fault) = err.downcast_ref::<TransportFault>() {
        return json!({
            "reason": fault_reason_name(fault.kind),
            "details": {
                "stage": fault.stage.to_string(),
                "gate": fault.gate,
                "commanded_mm": fault.commanded,
                "measured_mm": fault.measured,
            },
            "context": err.to_string(),
            "message": msg,
        })
        .to_string();
    }
    if let Some(se) = err.downcast_ref::<StateError>() {
        let reason = match se {
            StateError::Locked => "Locked",
            StateError::NoGateSelected => "NoGateSelected",
            StateError::GateOutOfRange(_) => "GateOutOfRange",
            StateError::Uncalibrated(_) => "Uncalibrated",
            StateError::InvalidPosition(_) => "InvalidPosition",
        };
        return json!({ "reason": reason, "message": msg }).to_string();
    }

    // Generic error JSON
    json!({ "reason": "Error", "message": msg }).to_string()
}

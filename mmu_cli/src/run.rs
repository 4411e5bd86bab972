//! Unit assembly and command execution against the simulated unit.

use std::cell::RefCell;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::Ordering;

use eyre::{Result, WrapErr};
use mmu_config::Config;
use mmu_core::calibration::{CalibrationMask, MissingCalibration};
use mmu_core::conversions::{purge_mode, tip_mode};
use mmu_core::{
    DynTransport, FilamentPosition, LoadOptions, PurgeMode, SequenceReport, StateError, TipMode,
    TransportCfg, UnloadOptions,
};
use mmu_hardware::sim::{
    COMPRESSION_SENSOR, ENTRY_SENSOR, GATE_SENSOR, GEAR_SENSOR, GEAR_TOUCH, TENSION_SENSOR,
    TOOLHEAD_SENSOR,
};
use mmu_hardware::{
    GripAction, LinearSelector, MacroSelector, MemoryStore, PathGeometry, RotarySelector,
    SimulatedUnit, VirtualSelector,
};
use mmu_traits::{HwResult, PersistenceStore, Selector, SensorProvider, StoredValue};
use serde_json::{Value, json};

use crate::cli::{Cli, Commands, PurgeArg, TipArg, json_mode};

/// Where the simulated filament end was left by the previous run.
pub const SIM_TIP_KEY: &str = "sim_filament_tip";
pub const SIM_PRESENT_KEY: &str = "sim_filament_present";

const ROTARY_ENGAGED_DEG: f64 = 0.0;
const ROTARY_RELEASED_DEG: f64 = 90.0;

// ── Store ────────────────────────────────────────────────────────────────────

/// One store shared by the transport and the simulator checkpoint.
#[derive(Clone)]
struct SharedStore(Rc<RefCell<Box<dyn PersistenceStore>>>);

impl SharedStore {
    fn new(store: impl PersistenceStore + 'static) -> Self {
        Self(Rc::new(RefCell::new(Box::new(store))))
    }

    fn open(cfg: &Config) -> Result<Self> {
        match cfg.unit.state_file.as_deref() {
            Some(path) => {
                let store = mmu_config::FileStore::open(path)
                    .wrap_err_with(|| format!("open state file {path}"))?;
                Ok(Self::new(store))
            }
            None => {
                tracing::debug!("no unit.state_file configured; state is not kept between runs");
                Ok(Self::new(MemoryStore::new()))
            }
        }
    }
}

impl PersistenceStore for SharedStore {
    fn get(&self, key: &str, default: StoredValue) -> StoredValue {
        self.0.borrow().get(key, default)
    }

    fn set(&mut self, key: &str, value: StoredValue) {
        self.0.borrow_mut().set(key, value);
    }

    fn flush(&mut self) -> HwResult<()> {
        self.0.borrow_mut().flush()
    }
}

// ── Assembly ─────────────────────────────────────────────────────────────────

fn geometry(sim: &mmu_config::Simulation) -> PathGeometry {
    PathGeometry {
        gear_sensor_at: sim.gear_sensor_at,
        encoder_at: sim.encoder_at,
        entry_sensor_at: sim.entry_sensor_at,
        extruder_gears_at: sim.extruder_gears_at,
        toolhead_sensor_at: sim.toolhead_sensor_at,
        nozzle_at: sim.nozzle_at,
        ..PathGeometry::default()
    }
}

fn sensor_table(s: &mmu_config::Sensors) -> [(&'static str, bool); 7] {
    [
        (GATE_SENSOR, s.gate),
        (GEAR_SENSOR, s.gear),
        (ENTRY_SENSOR, s.extruder_entry),
        (TOOLHEAD_SENSOR, s.toolhead),
        (GEAR_TOUCH, s.gear_touch),
        (TENSION_SENSOR, s.tension),
        (COMPRESSION_SENSOR, s.compression),
    ]
}

fn selector_for(family: &str, unit: &SimulatedUnit) -> Result<Box<dyn Selector>> {
    Ok(match family {
        "linear" => Box::new(LinearSelector::new(unit)),
        "rotary" => Box::new(RotarySelector::new(unit, ROTARY_ENGAGED_DEG, ROTARY_RELEASED_DEG)),
        "virtual" => Box::new(VirtualSelector::new(unit)),
        "macro" => {
            let unit = unit.clone();
            Box::new(MacroSelector::new(move |action| {
                tracing::debug!(?action, "grip macro");
                unit.set_gripped(action != GripAction::Release);
                Ok(())
            }))
        }
        other => eyre::bail!("unknown selector family '{other}'"),
    })
}

/// Simulated unit and the transport driving it.
pub struct Session {
    pub unit: SimulatedUnit,
    pub transport: DynTransport,
    store: SharedStore,
}

impl Session {
    pub fn open(cfg: &Config, calibration: Option<&Path>) -> Result<Self> {
        let tcfg = TransportCfg::try_from(cfg)?;
        let store = SharedStore::open(cfg)?;

        let unit = SimulatedUnit::new(geometry(&cfg.simulation));
        for (name, fitted) in sensor_table(&cfg.sensors) {
            if fitted {
                unit.fit_sensor(name);
            } else {
                unit.unfit_sensor(name);
            }
        }
        unit.set_slip(cfg.simulation.slip);
        let present = store.get(SIM_PRESENT_KEY, StoredValue::Int(1)).as_i64() != Some(0);
        if present {
            let initial = cfg.simulation.initial_tip;
            let tip = store
                .get(SIM_TIP_KEY, StoredValue::Float(initial))
                .as_f64()
                .unwrap_or(initial);
            unit.insert_filament(tip);
        }

        let mut builder = DynTransport::builder()
            .with_motion(unit.motion())
            .with_sensors(unit.sensors())
            .with_selector(selector_for(&cfg.unit.selector, &unit)?)
            .with_store(store.clone())
            .with_config(tcfg);
        if cfg.unit.has_encoder {
            builder = builder.with_encoder(unit.encoder());
        }
        if cfg.spool_assist.enabled {
            builder = builder.with_spool_assist(unit.spool_assist());
        }
        let mut transport = builder.build()?;

        let csv = calibration
            .map(Path::to_path_buf)
            .or_else(|| cfg.calibration.csv.as_deref().map(PathBuf::from));
        if let Some(path) = csv {
            let rows = mmu_config::load_gate_calibration_csv(&path, cfg.unit.num_gates)?;
            transport.calibration_mut().import_rows(&rows);
        }

        Ok(Self { unit, transport, store })
    }

    /// Persist the transport state and where the simulated filament ended up.
    pub fn checkpoint(&mut self) -> Result<()> {
        self.transport.persist()?;
        let (tip, present) = self.unit.with_world(|w| (w.tip, w.filament_present));
        self.store.set(SIM_TIP_KEY, StoredValue::Float(tip));
        self.store.set(SIM_PRESENT_KEY, StoredValue::Int(i64::from(present)));
        self.store.flush().map_err(|e| eyre::eyre!("flush state: {e}"))
    }

    fn install_stop_handler(&self) {
        let stop = self.unit.stop_flag();
        if let Err(e) = ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst)) {
            tracing::warn!(
                error = %e,
                "failed to install ctrl-c handler; moves cannot be interrupted"
            );
        }
    }
}

// ── Output ───────────────────────────────────────────────────────────────────

/// What a command prints on success.
pub struct Output {
    pub text: String,
    pub json: Value,
}

fn report_output(r: &SequenceReport) -> Output {
    let mut text = if r.is_noop() {
        format!("{}: nothing to do, filament is {}", r.kind, r.end)
    } else {
        format!(
            "{} complete: {} -> {} ({:.1}mm moved, {} ms)",
            r.kind, r.start, r.end, r.moved, r.duration_ms
        )
    };
    if r.corrections > 0 {
        let _ = write!(text, ", {} correction moves", r.corrections);
    }
    if let Some(b) = r.autotune.bowden_length {
        let _ = write!(text, "\nbowden length auto-tuned to {b:.1}mm");
    }
    if let Some(rd) = r.autotune.rotation_distance {
        let _ = write!(text, "\nrotation distance auto-tuned to {rd:.4}");
    }
    if r.autotune.encoder_drift {
        text.push_str("\nwarning: encoder ratio drifted, consider recalibrating the encoder");
    }
    for w in &r.warnings {
        let _ = write!(text, "\nwarning: {w}");
    }
    let json = json!({
        "operation": r.kind.to_string(),
        "gate": r.gate.gate(),
        "bypass": r.gate == mmu_core::GateSelection::Bypass,
        "start": r.start.label(),
        "end": r.end.label(),
        "moved_mm": r.moved,
        "corrections": r.corrections,
        "warnings": r.warnings,
        "autotune": {
            "bowden_length": r.autotune.bowden_length,
            "rotation_distance": r.autotune.rotation_distance,
            "encoder_drift": r.autotune.encoder_drift,
        },
        "duration_ms": r.duration_ms,
    });
    Output { text, json }
}

fn status_output(t: &DynTransport) -> Output {
    let state = t.state();
    let sync = t.sync_state();
    let mut text = format!(
        "filament: {}\nselected: {}\nsync: {} (gear current {}%)",
        t.filament_position(),
        t.gate_selected(),
        sync.mode,
        sync.gear_current_percent
    );
    if t.is_locked() {
        text.push_str("\nunit is LOCKED");
    }
    let mut gates = Vec::with_capacity(state.gates.len());
    for g in 0..state.gates.len() {
        let bowden = state.calibration.bowden_length(g).value();
        let clog = state.calibration.clog_length(g).value();
        let rd = state.calibration.rotation_distance(g);
        let status = state.gates.status(g);
        let _ = write!(
            text,
            "\ngate {g}: {status}, bowden {} rd {rd:.4} clog {}",
            bowden.map_or_else(|| "-".to_string(), |b| format!("{b:.1}mm")),
            clog.map_or_else(|| "-".to_string(), |c| format!("{c:.1}mm")),
        );
        gates.push(json!({
            "gate": g,
            "status": status.to_string(),
            "bowden_length": bowden,
            "rotation_distance": rd,
            "clog_length": clog,
        }));
    }
    let json = json!({
        "filament_position": t.filament_position().label(),
        "selected": t.gate_selected().to_string(),
        "sync": sync.mode.to_string(),
        "locked": t.is_locked(),
        "printing": t.is_printing(),
        "gates": gates,
    });
    Output { text, json }
}

// ── Commands ─────────────────────────────────────────────────────────────────

fn check_calibration(t: &DynTransport, gates: &[usize]) -> Result<Output> {
    let all: Vec<usize>;
    let gates = if gates.is_empty() {
        all = (0..t.state().gates.len()).collect();
        &all
    } else {
        gates
    };
    if let Some(g) = gates.iter().find(|g| **g >= t.state().gates.len()) {
        return Err(eyre::Report::new(StateError::GateOutOfRange(*g)));
    }
    let mask = CalibrationMask::ENCODER
        | CalibrationMask::SELECTOR
        | CalibrationMask::BOWDEN_LENGTH
        | CalibrationMask::GEAR_ROTATION_DISTANCE;
    let missing: Vec<MissingCalibration> = t.check_calibrated(mask, gates);
    if !missing.is_empty() {
        let text = missing.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ");
        return Err(eyre::Report::new(StateError::Uncalibrated(text)));
    }
    Ok(Output {
        text: format!("calibration ok for gates {gates:?}"),
        json: json!({ "calibrated": true, "gates": gates }),
    })
}

fn self_check(session: &Session, cfg: &Config) -> Result<Output> {
    let sensors = session.unit.sensors();
    let mut readings = serde_json::Map::new();
    let mut text = String::from("self-check ok");
    for (name, fitted) in sensor_table(&cfg.sensors) {
        if !fitted {
            continue;
        }
        let Some(triggered) = sensors.read_binary(name) else {
            eyre::bail!("sensor '{name}' is configured but not responding");
        };
        readings.insert(name.to_string(), Value::Bool(triggered));
        let _ = write!(text, "\n{name}: {}", if triggered { "triggered" } else { "open" });
    }
    if cfg.unit.has_encoder && !session.transport.has_encoder() {
        eyre::bail!("encoder is configured but not available");
    }
    let _ = write!(
        text,
        "\nencoder: {}\nselector: {}",
        if session.transport.has_encoder() { "present" } else { "absent" },
        session.transport.selector().family()
    );
    Ok(Output {
        text,
        json: json!({
            "ok": true,
            "sensors": readings,
            "encoder": session.transport.has_encoder(),
            "selector": session.transport.selector().family(),
        }),
    })
}

fn run_command(cmd: &Commands, cfg: &Config, session: &mut Session) -> Result<Output> {
    let t = &mut session.transport;
    match cmd {
        Commands::Load {
            length,
            skip_extruder,
            extruder_only,
            purge,
        } => {
            let purge = match purge {
                Some(PurgeArg::None) => PurgeMode::None,
                Some(PurgeArg::Slicer) => PurgeMode::Slicer,
                Some(PurgeArg::Standalone) => PurgeMode::Standalone,
                None => purge_mode(cfg)?,
            };
            let report = t.load_sequence(&LoadOptions {
                bowden_move: *length,
                skip_extruder: *skip_extruder,
                purge,
                extruder_only: *extruder_only,
            })?;
            Ok(report_output(&report))
        }
        Commands::Unload {
            length,
            check_state,
            extruder_only,
            tip,
        } => {
            let form_tip = match tip {
                Some(TipArg::None) => TipMode::None,
                Some(TipArg::Slicer) => TipMode::Slicer,
                Some(TipArg::Standalone) => TipMode::Standalone,
                Some(TipArg::Cut) => TipMode::Cut,
                None => tip_mode(cfg)?,
            };
            let report = t.unload_sequence(&UnloadOptions {
                bowden_move: *length,
                check_state: *check_state,
                form_tip,
                extruder_only: *extruder_only,
                eject: false,
            })?;
            Ok(report_output(&report))
        }
        Commands::Eject => Ok(report_output(&t.eject()?)),
        Commands::Recover { strict, no_heat } => {
            let previous = t.filament_position();
            let position: FilamentPosition = t.recover(*strict, cfg.recovery.can_heat && !no_heat)?;
            Ok(Output {
                text: format!("filament position: {position} (was {previous})"),
                json: json!({ "previous": previous.label(), "position": position.label() }),
            })
        }
        Commands::Status => Ok(status_output(t)),
        Commands::CheckCalibration { gates } => check_calibration(t, gates),
        Commands::SelfCheck => self_check(session, cfg),
    }
}

/// Open the unit, run one command and print its result.
pub fn execute(cli: &Cli, cfg: &Config) -> Result<()> {
    let mut session = Session::open(cfg, cli.calibration.as_deref())?;
    session.install_stop_handler();

    if cli.bypass {
        session.transport.select_bypass();
    } else if let Some(g) = cli.gate {
        session.transport.select_gate(g)?;
    }
    if cli.printing {
        session.transport.set_printing(true);
    }

    let outcome = run_command(&cli.cmd, cfg, &mut session);
    // Checkpoint even after a failure so the next run starts where this one stopped.
    let saved = session.checkpoint();
    let output = outcome?;
    saved?;

    if json_mode() {
        println!("{}", output.json);
    } else {
        println!("{}", output.text);
    }
    Ok(())
}

//! Type-state builder for `Transport` and the generic `build_transport` constructor.
//!
//! Motion, sensors and selector must be provided before `build()` is
//! available. `try_build()` is always available for dynamic checks.

use std::marker::PhantomData;
use std::sync::Arc;

use mmu_traits::clock::{Clock, MonotonicClock};
use mmu_traits::{
    Encoder, MotionController, PersistenceStore, Selector, SensorProvider, SpoolAssist,
};

use crate::config::TransportCfg;
use crate::error::{BuildError, Result};
use crate::state::{ControllerState, VolatileStore};
use crate::transport::Transport;

/// Dynamically dispatched transport, as produced by `TransportBuilder`.
pub type DynTransport =
    Transport<Box<dyn MotionController>, Box<dyn SensorProvider>, Box<dyn Selector>>;

// ── Type-state markers ───────────────────────────────────────────────────────

pub struct Missing;
pub struct Set;

/// Optional collaborators shared by both construction paths.
#[derive(Default)]
pub struct TransportParts {
    pub encoder: Option<Box<dyn Encoder>>,
    pub assist: Option<Box<dyn SpoolAssist>>,
    /// Defaults to a volatile in-memory store.
    pub store: Option<Box<dyn PersistenceStore>>,
    pub clock: Option<Box<dyn Clock + Send + Sync>>,
    pub cfg: TransportCfg,
}

pub struct TransportBuilder<M, S, G> {
    motion: Option<Box<dyn MotionController>>,
    sensors: Option<Box<dyn SensorProvider>>,
    selector: Option<Box<dyn Selector>>,
    parts: TransportParts,
    _m: PhantomData<M>,
    _s: PhantomData<S>,
    _g: PhantomData<G>,
}

impl Default for TransportBuilder<Missing, Missing, Missing> {
    fn default() -> Self {
        Self {
            motion: None,
            sensors: None,
            selector: None,
            parts: TransportParts::default(),
            _m: PhantomData,
            _s: PhantomData,
            _g: PhantomData,
        }
    }
}

impl DynTransport {
    /// Start building a transport.
    pub fn builder() -> TransportBuilder<Missing, Missing, Missing> {
        TransportBuilder::default()
    }
}

/// Validate configuration and construct a `Transport` with state restored
/// from the store.
fn validate_and_build<M: MotionController, S: SensorProvider, G: Selector>(
    motion: M,
    sensors: S,
    selector: G,
    parts: TransportParts,
) -> Result<Transport<M, S, G>> {
    let TransportParts {
        encoder,
        assist,
        store,
        clock,
        mut cfg,
    } = parts;

    // ── Validation ───────────────────────────────────────────────────────────
    let invalid = |msg: &'static str| Err(eyre::Report::new(BuildError::InvalidConfig(msg)));
    if cfg.unit.num_gates == 0 {
        return invalid("num_gates must be >= 1");
    }
    if cfg.gate.homing_max <= 0.0
        || cfg.extruder.homing_max <= 0.0
        || cfg.toolhead.homing_max <= 0.0
    {
        return invalid("homing_max distances must be > 0");
    }
    if !(0.0..=100.0).contains(&cfg.bowden.fast_load_portion)
        || !(0.0..=100.0).contains(&cfg.bowden.fast_unload_portion)
    {
        return invalid("fast bowden portions must be within 0..=100");
    }
    if cfg.bowden.soft_tolerance_pct < 0.0
        || cfg.bowden.hard_tolerance_pct < cfg.bowden.soft_tolerance_pct
    {
        return invalid("bowden tolerances must satisfy 0 <= soft <= hard");
    }
    if !(0.0..=100.0).contains(&cfg.bowden.pre_unload_error_tolerance)
        || !(0.0..=100.0).contains(&cfg.toolhead.move_error_tolerance)
    {
        return invalid("error tolerances must be within 0..=100");
    }
    let sp = &cfg.speeds;
    let speeds = [
        sp.gear_from_buffer_speed,
        sp.gear_from_spool_speed,
        sp.gear_unload_speed,
        sp.gear_short_move_speed,
        sp.gear_homing_speed,
        sp.extruder_load_speed,
        sp.extruder_unload_speed,
        sp.extruder_sync_load_speed,
        sp.extruder_sync_unload_speed,
        sp.extruder_homing_speed,
    ];
    if speeds.iter().any(|s| !s.is_finite() || *s <= 0.0) {
        return invalid("speeds must be > 0");
    }
    if !(cfg.retry.speed_factor > 0.0 && cfg.retry.speed_factor <= 1.0) {
        return invalid("retry speed_factor must be within (0, 1]");
    }
    if cfg.encoder.resolution <= 0.0 || cfg.encoder.move_step_size <= 0.0 {
        return invalid("encoder resolution and step size must be > 0");
    }
    if cfg.calibration.telemetry_window == 0 {
        return invalid("telemetry_window must be >= 1");
    }
    if cfg.sync.sync_gear_current > 100 || cfg.extruder.collision_homing_current > 100 {
        return invalid("current percentages must be <= 100");
    }

    // ── Assemble ─────────────────────────────────────────────────────────────
    if encoder.is_none() && cfg.unit.has_encoder {
        tracing::debug!("no encoder provided; disabling encoder features");
        cfg.unit.has_encoder = false;
    }
    let store = store.unwrap_or_else(|| Box::new(VolatileStore::default()));
    let clock: Arc<dyn Clock + Send + Sync> = match clock {
        Some(b) => Arc::from(b),
        None => Arc::new(MonotonicClock::new()),
    };
    let state = ControllerState::restore(&cfg, store.as_ref());
    tracing::info!(
        gates = cfg.unit.num_gates,
        encoder = cfg.unit.has_encoder,
        selector = selector.family(),
        position = %state.tracker.position(),
        "transport ready"
    );

    Ok(Transport {
        motion,
        sensors,
        selector,
        encoder,
        assist,
        store,
        clock,
        cfg,
        state,
        odometer: 0.0,
    })
}

impl<M, S, G> TransportBuilder<M, S, G> {
    /// Fallible build available in any type-state.
    pub fn try_build(self) -> Result<DynTransport> {
        let motion = self
            .motion
            .ok_or_else(|| eyre::Report::new(BuildError::MissingMotion))?;
        let sensors = self
            .sensors
            .ok_or_else(|| eyre::Report::new(BuildError::MissingSensors))?;
        let selector = self
            .selector
            .ok_or_else(|| eyre::Report::new(BuildError::MissingSelector))?;
        validate_and_build(motion, sensors, selector, self.parts)
    }
}

/// Chainable setters that do not affect type-state.
impl<M, S, G> TransportBuilder<M, S, G> {
    pub fn with_config(mut self, cfg: TransportCfg) -> Self {
        self.parts.cfg = cfg;
        self
    }
    pub fn with_encoder(mut self, encoder: impl Encoder + 'static) -> Self {
        self.parts.encoder = Some(Box::new(encoder));
        self
    }
    pub fn with_spool_assist(mut self, assist: impl SpoolAssist + 'static) -> Self {
        self.parts.assist = Some(Box::new(assist));
        self
    }
    pub fn with_store(mut self, store: impl PersistenceStore + 'static) -> Self {
        self.parts.store = Some(Box::new(store));
        self
    }
    /// Defaults to `MonotonicClock` when not provided.
    pub fn with_clock(mut self, clock: Box<dyn Clock + Send + Sync>) -> Self {
        self.parts.clock = Some(clock);
        self
    }
}

// Setters that advance type-state
impl<S, G> TransportBuilder<Missing, S, G> {
    pub fn with_motion(
        self,
        motion: impl MotionController + 'static,
    ) -> TransportBuilder<Set, S, G> {
        TransportBuilder {
            motion: Some(Box::new(motion)),
            sensors: self.sensors,
            selector: self.selector,
            parts: self.parts,
            _m: PhantomData,
            _s: PhantomData,
            _g: PhantomData,
        }
    }
}

impl<M, G> TransportBuilder<M, Missing, G> {
    pub fn with_sensors(
        self,
        sensors: impl SensorProvider + 'static,
    ) -> TransportBuilder<M, Set, G> {
        TransportBuilder {
            motion: self.motion,
            sensors: Some(Box::new(sensors)),
            selector: self.selector,
            parts: self.parts,
            _m: PhantomData,
            _s: PhantomData,
            _g: PhantomData,
        }
    }
}

impl<M, S> TransportBuilder<M, S, Missing> {
    pub fn with_selector(self, selector: impl Selector + 'static) -> TransportBuilder<M, S, Set> {
        TransportBuilder {
            motion: self.motion,
            sensors: self.sensors,
            selector: Some(Box::new(selector)),
            parts: self.parts,
            _m: PhantomData,
            _s: PhantomData,
            _g: PhantomData,
        }
    }
}

impl TransportBuilder<Set, Set, Set> {
    /// Validate and build. Only available once motion, sensors and selector are set.
    pub fn build(self) -> Result<DynTransport> {
        self.try_build()
    }
}

/// Build a statically dispatched transport from concrete collaborators.
///
/// Shares validation with the builder.
pub fn build_transport<M, S, G>(
    motion: M,
    sensors: S,
    selector: G,
    parts: TransportParts,
) -> Result<Transport<M, S, G>>
where
    M: MotionController,
    S: SensorProvider,
    G: Selector,
{
    validate_and_build(motion, sensors, selector, parts)
}

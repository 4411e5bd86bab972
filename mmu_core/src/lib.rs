#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Filament transport core for a multi-material unit (hardware-agnostic).
//!
//! Moves filament between a spool gate and the printer nozzle through a
//! bowden tube. All hardware goes through the traits in `mmu_traits`.
//!
//! ## Architecture
//!
//! - **Position**: one tracked [`FilamentPosition`], changed only by `transition` (`position`)
//! - **Gates**: status, selection and statistics (`gate`)
//! - **Calibration**: per-gate lengths plus telemetry auto-tune (`calibration`)
//! - **Motion**: move executor with homing retries and encoder deltas (`motion`)
//! - **Sync**: gear/extruder coupling with protected scopes (`sync`)
//! - **Sequences**: load, unload and eject (`load`, `unload`)
//! - **Recovery**: position inference from sensors (`recovery`)
//!
//! Sequences report with [`SequenceReport`]; failures carry a
//! [`TransportFault`] wrapped in an `eyre::Report`.

pub mod builder;
pub mod calibration;
pub mod config;
pub mod conversions;
pub mod error;
pub mod gate;
pub mod hw_error;
pub mod load;
pub mod mocks;
pub mod motion;
pub mod position;
pub mod recovery;
pub mod state;
pub mod status;
pub mod sync;
pub mod transport;
pub mod unload;

pub use crate::builder::{
    DynTransport, Missing, Set, TransportBuilder, TransportParts, build_transport,
};
pub use crate::calibration::{Calibrated, CalibrationMask, CalibrationStore, MissingCalibration};
pub use crate::config::TransportCfg;
pub use crate::error::{BuildError, FaultKind, Report, Result, Stage, StateError, TransportFault};
pub use crate::gate::{GateSelection, GateStatus};
pub use crate::load::{LoadOptions, PurgeMode};
pub use crate::motion::{Endstop, Motor, MoveRequest, MoveResult};
pub use crate::position::{Direction, FilamentPosition};
pub use crate::recovery::{SensorSnapshot, infer_position};
pub use crate::state::{ControllerState, PrintState, VolatileStore};
pub use crate::status::{SequenceKind, SequenceReport};
pub use crate::sync::{SyncMode, SyncState};
pub use crate::transport::Transport;
pub use crate::unload::{TipMode, UnloadOptions};

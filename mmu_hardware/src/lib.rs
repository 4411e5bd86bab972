//! Hardware backends for the transport core.
//!
//! Only the simulated unit ships today: a filament path model that
//! implements every collaborator trait, plus grip implementations for each
//! selector family and an in-memory persistence store.

pub mod error;
pub mod selector;
pub mod sim;
pub mod store;

pub use selector::{GripAction, LinearSelector, MacroSelector, RotarySelector, VirtualSelector};
pub use sim::{PathGeometry, SimEncoder, SimMotion, SimSensors, SimSpoolAssist, SimulatedUnit};
pub use store::MemoryStore;

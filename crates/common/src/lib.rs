//! Shared foundation for the experiment execution engine.
//!
//! This crate holds the vocabulary every other layer speaks:
//!
//! - [`time::EventTime`]: exact, drift-free timestamps;
//! - [`handler`]: device identity and the write-once handler registry;
//! - [`table::ActionTable`]: the time-ordered event table that plans
//!   generate and executors replay;
//! - [`error::EngineError`]: the engine-wide error taxonomy;
//! - [`signals::ExperimentSignals`]: per-run lifecycle and abort channels.

pub mod error;
pub mod handler;
pub mod signals;
pub mod table;
pub mod time;

pub use error::{EngineError, EngineResult};
pub use handler::{DeviceId, DeviceType, HandlerInfo, HandlerRegistry};
pub use signals::{ExperimentSignals, LifecycleEvent};
pub use table::{ActionTable, Event, Payload};
pub use time::EventTime;

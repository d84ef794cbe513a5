//! Error types for the experiment engine.
//!
//! `EngineError` is the single typed error shared by the table, executor and
//! orchestration layers. The variants follow a fixed taxonomy:
//!
//! - **Generation/setup errors** (`InexactTiming`, `NotEligible`,
//!   `HandlerNotFound`, `EmptyTable`) prevent a run from starting and are
//!   surfaced synchronously to the caller.
//! - **Table errors** (`ConflictingActions`, `MalformedPayload`,
//!   `UnknownHandler`, `UnownedEvent`) indicate a bug in table generation or
//!   executor registration; they abort the run and are never retried.
//! - **Dispatch errors** (`ExecutionTimeout`, `Backend`) stop the run but
//!   still let cleanup hooks fire.
//! - `Aborted` is the cooperative user-abort path; it is reported so callers
//!   can distinguish it from failure, but it is not treated as an error by
//!   the cleanup machinery.
//!
//! Hardware drivers speak `anyhow::Error` at the capability boundary; the
//! `Backend` variant carries those across.

use crate::handler::DeviceId;
use crate::time::EventTime;
use thiserror::Error;

/// Convenience alias for results in the engine.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Primary error type for experiment generation and dispatch.
#[derive(Error, Debug)]
pub enum EngineError {
    /// No registered executor claims the event at this table index.
    #[error("no executor owns the event at table index {index}")]
    UnownedEvent { index: usize },

    /// Two different payloads were scheduled for the same handler at the
    /// same instant; the instruction is ambiguous.
    #[error("conflicting simultaneous actions for {handler} at {time}")]
    ConflictingActions { handler: DeviceId, time: EventTime },

    /// An event payload cannot be interpreted by the executor that owns the
    /// handler (e.g. an analog level on a digital line).
    #[error("payload for {handler} not understood by its executor")]
    MalformedPayload { handler: DeviceId },

    /// An executor was handed an event for a handler it never registered.
    #[error("executor was handed an event for unregistered handler {handler}")]
    UnknownHandler { handler: DeviceId },

    /// A collaborator reported a timing value that is not exactly
    /// representable; accepting it would accumulate drift over the run.
    #[error("timing value {value_ms}ms is not exactly representable")]
    InexactTiming { value_ms: f64 },

    /// An executor failed to signal completion within the configured window.
    #[error("executor '{executor}' did not complete within the timeout")]
    ExecutionTimeout { executor: String },

    /// The user aborted the run; cleanup still executes.
    #[error("experiment aborted by user")]
    Aborted,

    /// A handler that cannot participate in experiments was included.
    #[error("handler '{handler}' is not usable in experiments")]
    NotEligible { handler: String },

    /// Lookup of a named handler failed.
    #[error("no handler named '{name}'")]
    HandlerNotFound { name: String },

    /// A digital operation was requested on an executor without digital lines.
    #[error("executor '{executor}' has no digital lines")]
    NoDigitalSupport { executor: String },

    /// An analog operation was requested on an executor without analog channels.
    #[error("executor '{executor}' has no analog channels")]
    NoAnalogSupport { executor: String },

    /// A plan produced a table with no events.
    #[error("generated action table is empty")]
    EmptyTable,

    /// Error from a concrete hardware backend.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

//! Lifecycle signalling for experiment runs.
//!
//! Instead of a process-wide publish/subscribe registry, every run engine
//! owns an [`ExperimentSignals`] context and hands clones of its receivers to
//! whoever needs them. Test runs stay isolated from each other.
//!
//! Two channels live here:
//!
//! - a broadcast channel for lifecycle events (prepare, per-segment
//!   completion, cleanup, final completion);
//! - a watch channel carrying the abort flag. Waiters select against the
//!   watch so a user abort releases them immediately instead of timing out.

use tokio::sync::{broadcast, watch};

/// Lifecycle notifications published by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Broadcast before table generation so devices can enter experiment mode.
    PrepareForExperiment,
    /// One dispatched table span finished executing.
    SegmentComplete { executor: String, lines: usize },
    /// All dispatch has stopped; handlers should leave experiment mode.
    CleanupAfterExperiment { is_final: bool },
    /// Terminal signal for the run, success or not.
    ExperimentComplete { aborted: bool },
}

/// Shared signalling context for one engine instance.
#[derive(Debug)]
pub struct ExperimentSignals {
    lifecycle: broadcast::Sender<LifecycleEvent>,
    abort: watch::Sender<bool>,
}

impl Default for ExperimentSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl ExperimentSignals {
    pub fn new() -> Self {
        let (lifecycle, _) = broadcast::channel(64);
        let (abort, _) = watch::channel(false);
        ExperimentSignals { lifecycle, abort }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    /// Publish a lifecycle event. Having no subscribers is not an error.
    pub fn publish(&self, event: LifecycleEvent) {
        let _ = self.lifecycle.send(event);
    }

    /// Request a cooperative abort of the current run.
    pub fn request_abort(&self) {
        let _ = self.abort.send(true);
    }

    /// Re-arm the abort flag at the start of a run.
    pub fn clear_abort(&self) {
        let _ = self.abort.send(false);
    }

    pub fn abort_requested(&self) -> bool {
        *self.abort.borrow()
    }

    /// A watch receiver for selecting against the abort flag.
    pub fn abort_watch(&self) -> watch::Receiver<bool> {
        self.abort.subscribe()
    }
}

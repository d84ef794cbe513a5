//! Capability traits for devices that take part in experiments.
//!
//! Capabilities are narrow, composable traits rather than one wide device
//! interface: a piece of hardware implements exactly the traits for what it
//! can do, and the orchestration layer asks for capabilities by trait, never
//! by concrete type. Drivers report errors as `anyhow::Error`; the engine
//! wraps them at the boundary.
//!
//! All timing values cross this boundary as [`EventTime`], so a driver that
//! can only report an inexact float duration fails during setup instead of
//! smearing drift across a long acquisition.

use anyhow::Result;
use async_trait::async_trait;
use common::EventTime;
use serde::{Deserialize, Serialize};

/// How a camera's trigger line maps onto its exposure window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Frame-transfer: a pulse ends the current exposure and starts the next.
    After,
    /// A pulse starts an exposure of the camera's programmed duration.
    Before,
    /// The camera exposes for as long as the trigger line is held high.
    Duration,
    /// Bulb exposure opened early so several cameras share one light window.
    DurationPseudoglobal,
}

/// A camera participating in triggered acquisition.
#[async_trait]
pub trait CameraControl: Send + Sync {
    fn exposure_mode(&self) -> TriggerMode;

    /// Readout time: the gap required between the end of one exposure and
    /// the earliest start of the next.
    async fn time_between_exposures(&self) -> Result<EventTime>;

    /// The currently programmed exposure duration.
    async fn exposure_time(&self) -> Result<EventTime>;

    /// Shortest exposure the sensor supports.
    async fn min_exposure_time(&self) -> Result<EventTime>;

    async fn set_exposure_time(&self, time: EventTime) -> Result<()>;
}

/// A light source gated by a digital line.
#[async_trait]
pub trait LightControl: Send + Sync {
    /// The user-requested exposure duration for this light.
    async fn exposure_time(&self) -> Result<EventTime>;
}

/// A motion axis with known move timing.
#[async_trait]
pub trait PositionerControl: Send + Sync {
    async fn move_abs(&self, position: f64) -> Result<()>;

    async fn position(&self) -> Result<f64>;

    /// `(motion, stabilization)` time for a move from `start` to `end`.
    /// Pure arithmetic on calibration constants, so it stays synchronous.
    fn movement_time(&self, start: f64, end: f64) -> (EventTime, EventTime);
}

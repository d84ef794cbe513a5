//! Hardware abstraction layer for the experiment engine.
//!
//! This crate sits between the scheduling layer and concrete devices:
//!
//! - **Capability traits** ([`CameraControl`], [`LightControl`],
//!   [`PositionerControl`]) describe what a device can do; drivers implement
//!   exactly the traits that apply.
//! - **[`SignalExecutor`]** multiplexes client handlers onto a backend's
//!   digital word and analog channels and replays action-table slices.
//! - **[`DelegateTrigger`]** lets self-timed devices participate via a
//!   start pulse on an upstream executor line.
//! - **[`DeviceDirectory`]** composes the handler registry with capability
//!   lookups and the ordered executor list.
//! - **[`config::RigConfig`]** describes a rig declaratively in TOML.
//!
//! ```rust,ignore
//! let config = RigConfig::load(Path::new("rig.toml"))?;
//! let directory = build_directory(&config)?;
//! for executor in directory.executors() {
//!     executor.prepare().await?;
//! }
//! ```

pub mod backend;
pub mod capabilities;
pub mod config;
pub mod delegate;
pub mod directory;
pub mod executor;
pub mod mock;

pub use backend::{SequencePoint, SignalBackend};
pub use capabilities::{CameraControl, LightControl, PositionerControl, TriggerMode};
pub use config::{build_directory, RigConfig};
pub use delegate::{DelegateTrigger, SegmentRunner};
pub use directory::DeviceDirectory;
pub use executor::{AnalogLineHandle, ExperimentExecutor, MovementTimeFn, SignalExecutor};

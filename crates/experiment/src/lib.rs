//! Experiment orchestration.
//!
//! This crate turns a declarative acquisition plan into hardware activity:
//!
//! - **[`ExposurePlanner`]** schedules camera triggers and centered light
//!   pulses with exact timing;
//! - **Plans** ([`ZStack`], [`OpenShutterSweep`]) generate action tables
//!   for a geometry without touching hardware;
//! - **[`RunEngine`]** examines the table, greedily dispatches contiguous
//!   spans to the executors that can run them, and guarantees cleanup.
//!
//! ```rust,ignore
//! let mut engine = RunEngine::new(directory, params);
//! let summary = engine.run(&ZStack).await?;
//! for (camera, count) in &summary.image_counts {
//!     println!("{camera}: {count} images");
//! }
//! ```

pub mod exposure;
pub mod plans;
pub mod run_engine;

pub use exposure::{CameraTiming, ExposurePlanner};
pub use plans::{AcquisitionPlan, ExposureGroup, OpenShutterSweep, PlanEnv, ResolvedGroup, ZStack};
pub use run_engine::{EngineState, RunEngine, RunParams, RunSummary};

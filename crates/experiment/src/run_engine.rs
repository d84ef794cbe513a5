//! The run engine: owns one experiment from table generation to cleanup.
//!
//! Lifecycle: `Building` while the plan generates its table, `Examined`
//! once every executor has rewritten it, `Dispatching` during the greedy
//! dispatch loop, then `Complete` or `Aborted`.
//!
//! Dispatch is greedy: at each table index, every executor bids the number
//! of consecutive events it could run from there; the longest bid wins, and
//! a tie goes to the executor registered first. An executor that can run
//! the whole table from index zero is handed all repetitions in one call so
//! hardware sequencers can free-run without per-rep round trips.

use std::collections::HashMap;
use std::sync::Arc;

use common::{
    ActionTable, DeviceId, EngineError, EngineResult, EventTime, ExperimentSignals,
    LifecycleEvent,
};
use hardware::{DeviceDirectory, ExperimentExecutor};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::exposure::ExposurePlanner;
use crate::plans::{AcquisitionPlan, ExposureGroup, PlanEnv, ResolvedGroup};

/// Where the engine is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Building,
    Examined,
    Dispatching,
    Complete,
    Aborted,
}

/// Per-run parameters common to all plans.
#[derive(Debug, Clone)]
pub struct RunParams {
    pub num_reps: u32,
    /// Minimum wall-clock length of one repetition; shorter reps are padded.
    pub rep_duration: Option<EventTime>,
    /// How long to wait for an executor to report segment completion.
    pub segment_timeout: Option<EventTime>,
    pub z_positioner: DeviceId,
    pub z_height: f64,
    pub slice_height: f64,
    pub exposure_groups: Vec<ExposureGroup>,
}

/// What a finished run produced, per camera.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub image_counts: HashMap<DeviceId, u32>,
    /// 1-based indices of discard images to drop from each camera's stream.
    pub ignored_indices: HashMap<DeviceId, Vec<u32>>,
}

pub struct RunEngine {
    directory: Arc<DeviceDirectory>,
    signals: Arc<ExperimentSignals>,
    params: RunParams,
    state: EngineState,
    table: Option<ActionTable>,
    exposure: Option<ExposurePlanner>,
}

impl RunEngine {
    pub fn new(directory: Arc<DeviceDirectory>, params: RunParams) -> Self {
        RunEngine {
            directory,
            signals: Arc::new(ExperimentSignals::new()),
            params,
            state: EngineState::Building,
            table: None,
            exposure: None,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Signalling context: subscribe for lifecycle events, request aborts.
    pub fn signals(&self) -> Arc<ExperimentSignals> {
        Arc::clone(&self.signals)
    }

    /// The examined table, once `prepare` has run.
    pub fn table(&self) -> Option<&ActionTable> {
        self.table.as_ref()
    }

    fn participating_cameras(&self) -> Vec<DeviceId> {
        let mut cameras = Vec::new();
        for group in &self.params.exposure_groups {
            for &camera in &group.cameras {
                if !cameras.contains(&camera) {
                    cameras.push(camera);
                }
            }
        }
        cameras
    }

    fn check_eligibility(&self) -> EngineResult<()> {
        let registry = self.directory.registry();
        let mut participants = vec![self.params.z_positioner];
        for group in &self.params.exposure_groups {
            participants.extend(group.cameras.iter().copied());
            participants.extend(group.lights.iter().map(|&(light, _)| light));
        }
        for id in participants {
            let info = registry
                .info(id)
                .ok_or_else(|| EngineError::HandlerNotFound {
                    name: id.to_string(),
                })?;
            if !info.eligible_for_experiments {
                return Err(EngineError::NotEligible {
                    handler: info.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Program each camera's exposure to the longest light time it will see,
    /// so trigger-before cameras integrate the full illumination.
    async fn program_camera_exposures(&self, groups: &[ResolvedGroup]) -> EngineResult<()> {
        for camera_id in self.participating_cameras() {
            let mut longest = EventTime::ZERO;
            for group in groups {
                if !group.cameras.contains(&camera_id) {
                    continue;
                }
                for &(_, duration) in &group.lights {
                    longest = longest.max(duration);
                }
            }
            if longest > EventTime::ZERO {
                let camera =
                    self.directory
                        .camera(camera_id)
                        .ok_or_else(|| EngineError::HandlerNotFound {
                            name: self.directory.name(camera_id).to_owned(),
                        })?;
                camera.set_exposure_time(longest).await?;
            }
        }
        Ok(())
    }

    /// Generate and examine the action table.
    #[instrument(skip_all, fields(plan = plan.name()))]
    pub async fn prepare(&mut self, plan: &dyn AcquisitionPlan) -> EngineResult<()> {
        self.state = EngineState::Building;
        self.signals.clear_abort();
        self.signals.publish(LifecycleEvent::PrepareForExperiment);

        self.check_eligibility()?;
        let mut groups = Vec::with_capacity(self.params.exposure_groups.len());
        for group in &self.params.exposure_groups {
            groups.push(group.resolve(&self.directory).await?);
        }
        self.program_camera_exposures(&groups).await?;

        let cameras = self.participating_cameras();
        let mut exposure = ExposurePlanner::for_cameras(&self.directory, &cameras).await?;

        let env = PlanEnv {
            directory: &self.directory,
            z_positioner: self.params.z_positioner,
            z_height: self.params.z_height,
            slice_height: self.params.slice_height,
            num_reps: self.params.num_reps,
            exposure_groups: &groups,
        };
        let mut table = plan.generate(&env, &mut exposure)?;
        if table.is_empty() {
            return Err(EngineError::EmptyTable);
        }

        table.sort();
        for executor in self.directory.executors() {
            executor.examine_actions(&mut table)?;
        }
        table.clear_bad_entries();
        table.sort();
        table.enforce_positive_timepoints();

        let (first, last) = table.first_and_last_times().ok_or(EngineError::EmptyTable)?;
        info!(
            plan = plan.name(),
            events = table.len(),
            span_ms = (last - first).as_millis_f64(),
            "action table ready"
        );
        self.table = Some(table);
        self.exposure = Some(exposure);
        self.state = EngineState::Examined;
        Ok(())
    }

    /// Dispatch the examined table across the registered executors.
    #[instrument(skip_all)]
    pub async fn execute(&mut self) -> EngineResult<()> {
        let table = self.table.clone().ok_or(EngineError::EmptyTable)?;
        self.state = EngineState::Dispatching;

        for executor in self.directory.executors() {
            executor.prepare().await?;
        }

        let mut abort = self.signals.abort_watch();
        let num_reps = self.params.num_reps.max(1);

        'reps: for rep in 0..num_reps {
            let rep_started = tokio::time::Instant::now();
            let mut index = 0;
            while index < table.len() {
                if *abort.borrow() {
                    return Err(EngineError::Aborted);
                }
                let mut best_count = 0usize;
                let mut winner: Option<&Arc<dyn ExperimentExecutor>> = None;
                for executor in self.directory.executors() {
                    let count = executor.num_runnable_lines(&table, index);
                    // Strict comparison: ties go to the earlier registration.
                    if count > best_count {
                        best_count = count;
                        winner = Some(executor);
                    }
                }
                let Some(executor) = winner else {
                    return Err(EngineError::UnownedEvent { index });
                };

                if index == 0 && best_count == table.len() {
                    // One executor can run everything: hand it all reps and
                    // let its sequencer free-run.
                    debug!(executor = executor.name(), "delegating entire table");
                    self.run_segment(
                        executor,
                        &table,
                        0,
                        table.len(),
                        num_reps,
                        self.params.rep_duration,
                        &mut abort,
                    )
                    .await?;
                    self.signals.publish(LifecycleEvent::SegmentComplete {
                        executor: executor.name().to_owned(),
                        lines: table.len(),
                    });
                    break 'reps;
                }

                self.run_segment(executor, &table, index, index + best_count, 1, None, &mut abort)
                    .await?;
                self.signals.publish(LifecycleEvent::SegmentComplete {
                    executor: executor.name().to_owned(),
                    lines: best_count,
                });
                index += best_count;
            }

            if rep + 1 < num_reps {
                if let Some(budget) = self.params.rep_duration {
                    let elapsed = rep_started.elapsed();
                    let budget = budget.as_duration();
                    if budget > elapsed {
                        tokio::select! {
                            () = tokio::time::sleep(budget - elapsed) => {}
                            () = wait_for_abort(&mut abort) => return Err(EngineError::Aborted),
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Run one span on one executor, racing completion against the abort
    /// flag and the optional completion timeout. Dropping the execution
    /// future on abort cancels a software-timed replay at its next await.
    #[allow(clippy::too_many_arguments)]
    async fn run_segment(
        &self,
        executor: &Arc<dyn ExperimentExecutor>,
        table: &ActionTable,
        start: usize,
        stop: usize,
        num_reps: u32,
        rep_duration: Option<EventTime>,
        abort: &mut watch::Receiver<bool>,
    ) -> EngineResult<()> {
        let work = async {
            let fut = executor.execute_table(table, start, stop, num_reps, rep_duration);
            match self.params.segment_timeout {
                Some(timeout) => tokio::time::timeout(timeout.as_duration(), fut)
                    .await
                    .map_err(|_| EngineError::ExecutionTimeout {
                        executor: executor.name().to_owned(),
                    })?,
                None => fut.await,
            }
        };
        tokio::select! {
            result = work => result,
            () = wait_for_abort(abort) => Err(EngineError::Aborted),
        }
    }

    async fn cleanup(&self, aborted: bool) -> EngineResult<()> {
        self.signals
            .publish(LifecycleEvent::CleanupAfterExperiment { is_final: true });
        let mut first_error = None;
        for executor in self.directory.executors() {
            if let Err(error) = executor.cleanup(true).await {
                warn!(executor = executor.name(), %error, "cleanup failed");
                first_error.get_or_insert(error);
            }
        }
        self.signals
            .publish(LifecycleEvent::ExperimentComplete { aborted });
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Prepare, execute and clean up. Cleanup hooks run on success, failure
    /// and abort alike; an abort surfaces as [`EngineError::Aborted`].
    pub async fn run(&mut self, plan: &dyn AcquisitionPlan) -> EngineResult<RunSummary> {
        self.prepare(plan).await?;
        let result = self.execute().await;
        let aborted = matches!(result, Err(EngineError::Aborted));
        let cleanup_result = self.cleanup(aborted).await;

        self.state = if result.is_ok() {
            EngineState::Complete
        } else {
            EngineState::Aborted
        };
        result?;
        cleanup_result?;

        let summary = self.exposure.as_ref().map_or_else(RunSummary::default, |exposure| {
            let mut summary = RunSummary::default();
            for camera in self.participating_cameras() {
                summary.image_counts.insert(camera, exposure.image_count(camera));
                summary
                    .ignored_indices
                    .insert(camera, exposure.ignored_indices(camera).to_vec());
            }
            summary
        });
        Ok(summary)
    }
}

/// Resolve when the abort flag goes high. Never resolves if the flag stays
/// low; if the sender disappears we park instead of spinning.
async fn wait_for_abort(abort: &mut watch::Receiver<bool>) {
    loop {
        if *abort.borrow_and_update() {
            return;
        }
        if abort.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

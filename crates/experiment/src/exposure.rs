//! Exposure planning: turning "image these cameras with these lights" into
//! correctly timed trigger edges.
//!
//! The planner is built once per run from exact camera timings and then
//! drives all camera/light scheduling while a plan generates its table. It
//! tracks which cameras hold accumulated charge ("unclean" sensors on
//! frame-transfer cameras) and splices in discard exposures before the first
//! real use, records per-camera image counts, and remembers which image
//! indices are discards so downstream consumers can drop them.

use std::collections::HashMap;

use common::{ActionTable, DeviceId, EngineError, EngineResult, EventTime, Payload};
use hardware::{DeviceDirectory, TriggerMode};
use tracing::debug;

/// Settling margin added after readout before a camera counts as ready.
pub const READY_MARGIN: EventTime = EventTime::from_micros(100);

/// How much earlier than the nominal start a pseudoglobal bulb exposure
/// opens, beyond the camera's readout time.
pub const PSEUDOGLOBAL_GUARD: EventTime = EventTime::from_micros(5);

/// Floor on the length of a discard exposure.
pub const RESET_MIN_EXPOSURE: EventTime = EventTime::from_micros(100);

/// Smallest representable separation, used to keep logically ordered events
/// at strictly increasing times.
pub const ORDERING_EPSILON: EventTime = EventTime::from_nanos(1);

/// Exact timing characteristics of one camera, captured at prepare time.
#[derive(Debug, Clone, Copy)]
pub struct CameraTiming {
    pub mode: TriggerMode,
    /// Gap required between exposures (sensor readout).
    pub readout: EventTime,
    /// Currently programmed exposure duration.
    pub exposure: EventTime,
    pub min_exposure: EventTime,
}

/// Camera-trigger scheduling policy for one run.
#[derive(Debug)]
pub struct ExposurePlanner {
    timings: HashMap<DeviceId, CameraTiming>,
    /// Whether the sensor is free of accumulated charge. Frame-transfer
    /// cameras start dirty; a discard trigger cycle cleans them.
    clean: HashMap<DeviceId, bool>,
    image_counts: HashMap<DeviceId, u32>,
    /// 1-based indices of images that are discards, per camera.
    ignored_indices: HashMap<DeviceId, Vec<u32>>,
}

impl ExposurePlanner {
    /// Capture timings for `cameras` from the directory. Fails if any id is
    /// not a camera or a driver reports an error.
    pub async fn for_cameras(
        directory: &DeviceDirectory,
        cameras: &[DeviceId],
    ) -> EngineResult<Self> {
        let mut timings = HashMap::new();
        let mut clean = HashMap::new();
        let mut image_counts = HashMap::new();
        let mut ignored_indices = HashMap::new();
        for &id in cameras {
            let camera = directory
                .camera(id)
                .ok_or_else(|| EngineError::HandlerNotFound {
                    name: directory.name(id).to_owned(),
                })?;
            let timing = CameraTiming {
                mode: camera.exposure_mode(),
                readout: camera.time_between_exposures().await?,
                exposure: camera.exposure_time().await?,
                min_exposure: camera.min_exposure_time().await?,
            };
            // Frame-transfer sensors expose continuously; whatever charge
            // is on the chip now must be discarded before the first image.
            clean.insert(id, timing.mode != TriggerMode::After);
            timings.insert(id, timing);
            image_counts.insert(id, 0);
            ignored_indices.insert(id, Vec::new());
        }
        Ok(ExposurePlanner {
            timings,
            clean,
            image_counts,
            ignored_indices,
        })
    }

    fn timing(&self, camera: DeviceId) -> EngineResult<CameraTiming> {
        self.timings
            .get(&camera)
            .copied()
            .ok_or(EngineError::UnknownHandler { handler: camera })
    }

    /// Earliest time `camera` can start a new exposure given its history in
    /// `table`: last trigger, plus the programmed exposure for trigger-before
    /// cameras, plus readout and the ready margin. Zero if never used.
    pub fn time_when_camera_can_expose(
        &self,
        table: &ActionTable,
        camera: DeviceId,
    ) -> EngineResult<EventTime> {
        let timing = self.timing(camera)?;
        let Some((last_use, _)) = table.last_action_for(camera) else {
            return Ok(EventTime::ZERO);
        };
        let mut next = last_use;
        if timing.mode == TriggerMode::Before {
            next += timing.exposure;
        }
        Ok(next + timing.readout + READY_MARGIN)
    }

    pub fn is_clean(&self, camera: DeviceId) -> bool {
        self.clean.get(&camera).copied().unwrap_or(false)
    }

    /// Total images scheduled for `camera`, discards included.
    pub fn image_count(&self, camera: DeviceId) -> u32 {
        self.image_counts.get(&camera).copied().unwrap_or(0)
    }

    /// 1-based indices of scheduled images that must be thrown away.
    pub fn ignored_indices(&self, camera: DeviceId) -> &[u32] {
        self.ignored_indices
            .get(&camera)
            .map_or(&[], Vec::as_slice)
    }

    /// Record an image scheduled outside [`ExposurePlanner::expose`] (e.g.
    /// a sweep that drives the trigger lines itself).
    pub fn note_image(&mut self, camera: DeviceId) {
        *self.image_counts.entry(camera).or_insert(0) += 1;
    }

    /// Schedule one exposure of `cameras` under `lights` starting no earlier
    /// than `cur_time`. Returns the end of the exposure window.
    ///
    /// Lights are centered in the window: when one camera forces a longer
    /// exposure than a light's duration, the light pulse sits in the middle
    /// so every camera sees the same illumination.
    pub fn expose(
        &mut self,
        cur_time: EventTime,
        cameras: &[DeviceId],
        lights: &[(DeviceId, EventTime)],
        table: &mut ActionTable,
    ) -> EngineResult<EventTime> {
        let unclean: Vec<DeviceId> = cameras
            .iter()
            .copied()
            .filter(|&camera| !self.is_clean(camera))
            .collect();
        let cur_time = if unclean.is_empty() {
            cur_time
        } else {
            self.reset_cameras(cur_time, &unclean, table)?
        };

        let mut start = cur_time;
        for &camera in cameras {
            start = start.max(self.time_when_camera_can_expose(table, camera)?);
        }

        let mut max_exposure = lights
            .iter()
            .map(|&(_, duration)| duration)
            .max()
            .unwrap_or(EventTime::ZERO);
        for &camera in cameras {
            let timing = self.timing(camera)?;
            max_exposure = max_exposure.max(timing.min_exposure);
            if timing.mode == TriggerMode::After {
                // The pulse at the end both closes this exposure and starts
                // the next; stretch so the sensor is readable by then.
                let next_ready = self.time_when_camera_can_expose(table, camera)?;
                if next_ready > start {
                    max_exposure = max_exposure.max(next_ready - start);
                }
            }
        }
        let end = start + max_exposure;

        for &(light, duration) in lights {
            let offset = (max_exposure - duration) / 2;
            table.add_action(end - duration - offset, light, Payload::Digital(true));
            table.add_action(end - offset, light, Payload::Digital(false));
        }

        for &camera in cameras {
            let timing = self.timing(camera)?;
            match timing.mode {
                TriggerMode::After => {
                    table.add_toggle(end, camera);
                }
                TriggerMode::Duration => {
                    table.add_action(start, camera, Payload::Digital(true));
                    table.add_action(end, camera, Payload::Digital(false));
                }
                TriggerMode::DurationPseudoglobal => {
                    let open = start - timing.readout - PSEUDOGLOBAL_GUARD;
                    table.add_action(open, camera, Payload::Digital(true));
                    table.add_action(end, camera, Payload::Digital(false));
                }
                TriggerMode::Before => {
                    table.add_toggle(start, camera);
                }
            }
            *self.image_counts.entry(camera).or_insert(0) += 1;
        }

        // Frame-transfer cameras that sat out this exposure kept
        // accumulating charge while the lights were on.
        for (&camera, timing) in &self.timings {
            if timing.mode == TriggerMode::After && !cameras.contains(&camera) {
                self.clean.insert(camera, false);
            }
        }
        Ok(end)
    }

    /// Splice in a discard trigger cycle for `cameras`, recording the thrown
    /// away image indices. Returns a time strictly after the last discard.
    fn reset_cameras(
        &mut self,
        cur_time: EventTime,
        cameras: &[DeviceId],
        table: &mut ActionTable,
    ) -> EngineResult<EventTime> {
        let mut reset_end = cur_time;
        for &camera in cameras {
            let timing = self.timing(camera)?;
            let start = cur_time.max(self.time_when_camera_can_expose(table, camera)?);
            let min_exposure = RESET_MIN_EXPOSURE
                .max(timing.min_exposure)
                .max(timing.exposure);
            match timing.mode {
                TriggerMode::After => {
                    table.add_toggle(start + min_exposure, camera);
                }
                TriggerMode::Duration | TriggerMode::DurationPseudoglobal => {
                    table.add_action(start, camera, Payload::Digital(true));
                    table.add_action(start + min_exposure, camera, Payload::Digital(false));
                }
                TriggerMode::Before => {
                    table.add_toggle(start, camera);
                }
            }
            reset_end = reset_end.max(start + min_exposure);
            let count = self.image_counts.entry(camera).or_insert(0);
            *count += 1;
            self.ignored_indices.entry(camera).or_default().push(*count);
            self.clean.insert(camera, true);
            debug!(camera = camera.index(), discard_index = *count, "scheduled discard exposure");
        }
        // Keep whatever follows strictly after the reset cycle.
        Ok(reset_end + ORDERING_EPSILON)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hardware::mock::MockCamera;
    use std::sync::Arc;

    async fn planner_for(
        mode: TriggerMode,
        readout: EventTime,
        min_exposure: EventTime,
    ) -> (DeviceDirectory, DeviceId, ExposurePlanner) {
        let mut directory = DeviceDirectory::new();
        let camera = directory.add_camera(
            "west",
            "cameras",
            Arc::new(MockCamera::new(mode, readout, min_exposure)),
        );
        let planner = ExposurePlanner::for_cameras(&directory, &[camera])
            .await
            .unwrap();
        (directory, camera, planner)
    }

    fn light(directory: &mut DeviceDirectory, exposure: EventTime) -> DeviceId {
        directory.add_light(
            "488nm",
            "lights",
            Arc::new(hardware::mock::MockLight::new(exposure)),
        )
    }

    #[tokio::test]
    async fn light_pulses_are_centered_in_the_exposure_window() {
        let (mut directory, camera, mut planner) = planner_for(
            TriggerMode::Before,
            EventTime::from_millis(5),
            EventTime::from_millis(10),
        )
        .await;
        let led = light(&mut directory, EventTime::from_millis(7));

        let mut table = ActionTable::new();
        let end = planner
            .expose(
                EventTime::ZERO,
                &[camera],
                &[(led, EventTime::from_millis(7))],
                &mut table,
            )
            .unwrap();

        // Camera minimum 10 ms beats the 7 ms light; slop of 3 ms is split.
        assert_eq!(end, EventTime::from_millis(10));
        assert_eq!(
            table.last_action_for(led),
            Some((EventTime::from_micros(8500), Payload::Digital(false)))
        );
        let light_on = table
            .events()
            .iter()
            .find(|e| e.handler == led && e.payload == Some(Payload::Digital(true)))
            .unwrap();
        assert_eq!(light_on.time, EventTime::from_micros(1500));
        // Trigger-before camera pulses at the window start.
        let cam_on = table
            .events()
            .iter()
            .find(|e| e.handler == camera && e.payload == Some(Payload::Digital(true)))
            .unwrap();
        assert_eq!(cam_on.time, EventTime::ZERO);
        assert_eq!(planner.image_count(camera), 1);
    }

    #[tokio::test]
    async fn ready_time_accounts_for_exposure_and_readout() {
        let (_directory, camera, mut planner) = planner_for(
            TriggerMode::Before,
            EventTime::from_millis(5),
            EventTime::from_millis(10),
        )
        .await;

        let mut table = ActionTable::new();
        assert_eq!(
            planner.time_when_camera_can_expose(&table, camera).unwrap(),
            EventTime::ZERO
        );
        let end = planner
            .expose(EventTime::ZERO, &[camera], &[], &mut table)
            .unwrap();
        table.sort();

        // Last camera action is the falling edge of the toggle at start.
        let ready = planner.time_when_camera_can_expose(&table, camera).unwrap();
        let (last_use, _) = table.last_action_for(camera).unwrap();
        assert_eq!(
            ready,
            last_use + EventTime::from_millis(10) + EventTime::from_millis(5) + READY_MARGIN
        );
        assert!(ready > end);
    }

    #[tokio::test]
    async fn frame_transfer_cameras_get_a_discard_cycle_first() {
        let (_directory, camera, mut planner) = planner_for(
            TriggerMode::After,
            EventTime::from_millis(5),
            EventTime::from_millis(2),
        )
        .await;
        assert!(!planner.is_clean(camera));

        let mut table = ActionTable::new();
        planner
            .expose(EventTime::ZERO, &[camera], &[], &mut table)
            .unwrap();

        assert!(planner.is_clean(camera));
        assert_eq!(planner.image_count(camera), 2);
        assert_eq!(planner.ignored_indices(camera), &[1]);
        // Discard toggle, then the real toggle: four edges in total.
        assert_eq!(table.len(), 4);
    }

    #[tokio::test]
    async fn pseudoglobal_exposures_open_early() {
        let readout = EventTime::from_millis(5);
        let (_directory, camera, mut planner) = planner_for(
            TriggerMode::DurationPseudoglobal,
            readout,
            EventTime::from_millis(10),
        )
        .await;

        let mut table = ActionTable::new();
        let start_at = EventTime::from_millis(20);
        planner
            .expose(start_at, &[camera], &[], &mut table)
            .unwrap();
        table.sort();

        let first = table.get(0).unwrap();
        assert_eq!(first.handler, camera);
        assert_eq!(first.payload, Some(Payload::Digital(true)));
        assert_eq!(first.time, start_at - readout - PSEUDOGLOBAL_GUARD);
    }

    #[tokio::test]
    async fn unused_frame_transfer_cameras_become_unclean_again() {
        let mut directory = DeviceDirectory::new();
        let used = directory.add_camera(
            "west",
            "cameras",
            Arc::new(MockCamera::new(
                TriggerMode::Before,
                EventTime::from_millis(5),
                EventTime::from_millis(10),
            )),
        );
        let bystander = directory.add_camera(
            "east",
            "cameras",
            Arc::new(MockCamera::new(
                TriggerMode::After,
                EventTime::from_millis(5),
                EventTime::from_millis(2),
            )),
        );
        let mut planner = ExposurePlanner::for_cameras(&directory, &[used, bystander])
            .await
            .unwrap();

        let mut table = ActionTable::new();
        // Clean the frame-transfer camera once.
        planner
            .expose(EventTime::ZERO, &[bystander], &[], &mut table)
            .unwrap();
        assert!(planner.is_clean(bystander));

        // An exposure it does not take part in dirties it again.
        planner
            .expose(EventTime::from_millis(50), &[used], &[], &mut table)
            .unwrap();
        assert!(!planner.is_clean(bystander));
    }
}

//! Acquisition plans: generators of action tables.
//!
//! A plan describes one experiment geometry. It does not touch hardware; it
//! only emits a table of timed events through the [`ExposurePlanner`], and
//! the run engine takes care of examination and dispatch. Times inside a
//! freshly generated table are relative to its own zero.

use common::{ActionTable, DeviceId, EngineError, EngineResult, EventTime, Payload};
use hardware::{DeviceDirectory, TriggerMode};

use crate::exposure::{ExposurePlanner, ORDERING_EPSILON};

/// One simultaneous exposure: these cameras image while these lights are
/// on. A `None` duration falls back to the light's own requested exposure
/// time at prepare.
#[derive(Debug, Clone)]
pub struct ExposureGroup {
    pub cameras: Vec<DeviceId>,
    pub lights: Vec<(DeviceId, Option<EventTime>)>,
}

impl ExposureGroup {
    /// Pin down every light duration, asking the drivers for the ones the
    /// caller left unset.
    pub async fn resolve(&self, directory: &DeviceDirectory) -> EngineResult<ResolvedGroup> {
        let mut lights = Vec::with_capacity(self.lights.len());
        for &(id, duration) in &self.lights {
            let duration = match duration {
                Some(duration) => duration,
                None => directory
                    .light(id)
                    .ok_or_else(|| EngineError::HandlerNotFound {
                        name: directory.name(id).to_owned(),
                    })?
                    .exposure_time()
                    .await?,
            };
            lights.push((id, duration));
        }
        Ok(ResolvedGroup {
            cameras: self.cameras.clone(),
            lights,
        })
    }
}

/// An exposure group with every light duration known.
#[derive(Debug, Clone)]
pub struct ResolvedGroup {
    pub cameras: Vec<DeviceId>,
    pub lights: Vec<(DeviceId, EventTime)>,
}

/// Everything a plan needs to generate its table.
pub struct PlanEnv<'a> {
    pub directory: &'a DeviceDirectory,
    pub z_positioner: DeviceId,
    /// Total axial travel, in positioner units.
    pub z_height: f64,
    /// Spacing between slices, in positioner units.
    pub slice_height: f64,
    pub num_reps: u32,
    pub exposure_groups: &'a [ResolvedGroup],
}

impl PlanEnv<'_> {
    fn movement_time(&self, start: f64, end: f64) -> EngineResult<(EventTime, EventTime)> {
        let positioner = self
            .directory
            .positioner(self.z_positioner)
            .ok_or_else(|| EngineError::HandlerNotFound {
                name: self.directory.name(self.z_positioner).to_owned(),
            })?;
        Ok(positioner.movement_time(start, end))
    }

    fn num_slices(&self) -> usize {
        // Heights below a nanometer are a single plane.
        if self.z_height <= 1e-6 || self.slice_height <= 0.0 {
            return 1;
        }
        (self.z_height / self.slice_height).ceil() as usize + 1
    }
}

pub trait AcquisitionPlan: Send + Sync {
    fn name(&self) -> &str;

    fn generate(
        &self,
        env: &PlanEnv<'_>,
        exposure: &mut ExposurePlanner,
    ) -> EngineResult<ActionTable>;
}

/// Step-and-settle Z stack: move to each slice, hold the stage flat while
/// every exposure group images it, then return to the bottom.
#[derive(Debug, Default)]
pub struct ZStack;

impl AcquisitionPlan for ZStack {
    fn name(&self) -> &str {
        "Z-stack"
    }

    fn generate(
        &self,
        env: &PlanEnv<'_>,
        exposure: &mut ExposurePlanner,
    ) -> EngineResult<ActionTable> {
        let mut table = ActionTable::new();
        let z = env.z_positioner;
        let mut cur = EventTime::ZERO;
        let mut prev_altitude: Option<f64> = None;

        for slice in 0..env.num_slices() {
            let target = env.slice_height * slice as f64;
            let (motion, stabilization) = match prev_altitude {
                Some(prev) => env.movement_time(prev, target)?,
                None => (EventTime::ZERO, EventTime::ZERO),
            };
            cur += motion;
            table.add_action(cur, z, Payload::Analog(target));
            cur += stabilization;
            prev_altitude = Some(target);

            for group in env.exposure_groups {
                cur = exposure.expose(cur, &group.cameras, &group.lights, &mut table)?;
                cur += ORDERING_EPSILON;
            }
            // Hold the stage flat across the exposures.
            table.add_action(cur, z, Payload::Analog(target));
        }

        // Return to the bottom so the next rep starts immediately.
        let (motion, stabilization) = env.movement_time(env.z_height, 0.0)?;
        cur += motion;
        table.add_action(cur, z, Payload::Analog(0.0));

        let mut camera_ready = EventTime::ZERO;
        if env.num_reps > 1 {
            for group in env.exposure_groups {
                for &camera in &group.cameras {
                    camera_ready =
                        camera_ready.max(exposure.time_when_camera_can_expose(&table, camera)?);
                }
            }
        }
        table.add_action((cur + stabilization).max(camera_ready), z, Payload::Analog(0.0));
        Ok(table)
    }
}

/// Continuous open-shutter sweep: the lights stay on while the stage moves
/// bottom to top, integrating the whole column into one image per camera.
#[derive(Debug, Default)]
pub struct OpenShutterSweep;

impl AcquisitionPlan for OpenShutterSweep {
    fn name(&self) -> &str {
        "Open-shutter sweep"
    }

    fn generate(
        &self,
        env: &PlanEnv<'_>,
        exposure: &mut ExposurePlanner,
    ) -> EngineResult<ActionTable> {
        let mut table = ActionTable::new();
        let z = env.z_positioner;
        let mut cur = EventTime::ZERO;

        for group in env.exposure_groups {
            table.add_action(cur, z, Payload::Analog(0.0));
            let (motion, _) = env.movement_time(0.0, env.z_height)?;
            let sweep_end = cur + motion;

            // Everything opens for the whole sweep.
            for &(light, _) in &group.lights {
                table.add_action(cur, light, Payload::Digital(true));
                table.add_action(sweep_end, light, Payload::Digital(false));
            }
            for &camera in &group.cameras {
                let mode = env
                    .directory
                    .camera(camera)
                    .ok_or_else(|| EngineError::HandlerNotFound {
                        name: env.directory.name(camera).to_owned(),
                    })?
                    .exposure_mode();
                match mode {
                    TriggerMode::Before => {
                        table.add_toggle(cur, camera);
                    }
                    TriggerMode::After => {
                        table.add_toggle(sweep_end, camera);
                    }
                    TriggerMode::Duration | TriggerMode::DurationPseudoglobal => {
                        table.add_action(cur, camera, Payload::Digital(true));
                        table.add_action(sweep_end, camera, Payload::Digital(false));
                    }
                }
                exposure.note_image(camera);
            }
            table.add_action(sweep_end, z, Payload::Analog(env.z_height));

            // Move back down for the next group or rep.
            let (return_motion, stabilization) = env.movement_time(env.z_height, 0.0)?;
            cur = sweep_end + return_motion;
            table.add_action(cur, z, Payload::Analog(0.0));

            let mut camera_ready = EventTime::ZERO;
            if env.num_reps > 1 {
                for inner in env.exposure_groups {
                    for &camera in &inner.cameras {
                        camera_ready = camera_ready
                            .max(exposure.time_when_camera_can_expose(&table, camera)?);
                    }
                }
            }
            cur = (cur + stabilization).max(camera_ready);
            table.add_action(cur, z, Payload::Analog(0.0));
            cur += ORDERING_EPSILON;
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hardware::mock::{MockCamera, MockLight, MockPositioner};
    use std::sync::Arc;

    struct Bench {
        directory: DeviceDirectory,
        camera: DeviceId,
        led: DeviceId,
        z: DeviceId,
    }

    fn bench() -> Bench {
        let mut directory = DeviceDirectory::new();
        let camera = directory.add_camera(
            "west",
            "cameras",
            Arc::new(MockCamera::new(
                TriggerMode::Before,
                EventTime::from_millis(5),
                EventTime::from_millis(10),
            )),
        );
        let led = directory.add_light(
            "488nm",
            "lights",
            Arc::new(MockLight::new(EventTime::from_millis(7))),
        );
        // 1 ms of motion per unit, 2 ms settle.
        let z = directory.add_stage_axis(
            "zpiezo",
            "stage",
            Arc::new(MockPositioner::new(1000, EventTime::from_millis(2))),
        );
        Bench {
            directory,
            camera,
            led,
            z,
        }
    }

    async fn planner(bench: &Bench) -> ExposurePlanner {
        ExposurePlanner::for_cameras(&bench.directory, &[bench.camera])
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn unset_light_durations_come_from_the_driver() {
        let bench = bench();
        let group = ExposureGroup {
            cameras: vec![bench.camera],
            lights: vec![(bench.led, None)],
        };
        let resolved = group.resolve(&bench.directory).await.unwrap();
        assert_eq!(resolved.lights, vec![(bench.led, EventTime::from_millis(7))]);

        // An explicit duration overrides the light's request.
        let pinned = ExposureGroup {
            cameras: vec![bench.camera],
            lights: vec![(bench.led, Some(EventTime::from_millis(3)))],
        };
        let resolved = pinned.resolve(&bench.directory).await.unwrap();
        assert_eq!(resolved.lights, vec![(bench.led, EventTime::from_millis(3))]);

        // The stage axis carries no light capability.
        let wrong = ExposureGroup {
            cameras: vec![bench.camera],
            lights: vec![(bench.z, None)],
        };
        assert!(matches!(
            wrong.resolve(&bench.directory).await,
            Err(EngineError::HandlerNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn z_stack_visits_every_slice_in_order() {
        let bench = bench();
        let mut exposure = planner(&bench).await;
        let groups = [ResolvedGroup {
            cameras: vec![bench.camera],
            lights: vec![(bench.led, EventTime::from_millis(7))],
        }];
        let env = PlanEnv {
            directory: &bench.directory,
            z_positioner: bench.z,
            z_height: 2.0,
            slice_height: 1.0,
            num_reps: 1,
            exposure_groups: &groups,
        };

        let mut table = ZStack.generate(&env, &mut exposure).unwrap();
        table.sort();

        let altitudes: Vec<f64> = table
            .events()
            .iter()
            .filter(|e| e.handler == bench.z)
            .filter_map(|e| match e.payload {
                Some(Payload::Analog(level)) => Some(level),
                _ => None,
            })
            .collect();
        // Three slices, each held flat, then the return to the bottom.
        assert_eq!(altitudes, vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 0.0, 0.0]);
        assert_eq!(exposure.image_count(bench.camera), 3);

        // One exposure per slice: three rising camera edges.
        let camera_triggers = table
            .events()
            .iter()
            .filter(|e| e.handler == bench.camera && e.payload == Some(Payload::Digital(true)))
            .count();
        assert_eq!(camera_triggers, 3);
    }

    #[tokio::test]
    async fn z_stack_with_reps_holds_until_cameras_recover() {
        let bench = bench();
        let mut exposure = planner(&bench).await;
        let groups = [ResolvedGroup {
            cameras: vec![bench.camera],
            lights: vec![],
        }];
        let env = PlanEnv {
            directory: &bench.directory,
            z_positioner: bench.z,
            z_height: 0.0,
            slice_height: 0.0,
            num_reps: 3,
            exposure_groups: &groups,
        };

        let mut table = ZStack.generate(&env, &mut exposure).unwrap();
        table.sort();

        let (_, last) = table.first_and_last_times().unwrap();
        let ready = exposure
            .time_when_camera_can_expose(&table, bench.camera)
            .unwrap();
        // The final hold must not release before the camera is reusable.
        assert_eq!(last, ready);
    }

    #[tokio::test]
    async fn sweep_keeps_lights_open_for_the_whole_motion() {
        let bench = bench();
        let mut exposure = planner(&bench).await;
        let groups = [ResolvedGroup {
            cameras: vec![bench.camera],
            lights: vec![(bench.led, EventTime::from_millis(7))],
        }];
        let env = PlanEnv {
            directory: &bench.directory,
            z_positioner: bench.z,
            z_height: 10.0,
            slice_height: 0.0,
            num_reps: 1,
            exposure_groups: &groups,
        };

        let mut table = OpenShutterSweep.generate(&env, &mut exposure).unwrap();
        table.sort();

        // 10 units at 1 ms each: lights on from 0 to 10 ms.
        let on = table
            .events()
            .iter()
            .find(|e| e.handler == bench.led && e.payload == Some(Payload::Digital(true)))
            .unwrap()
            .time;
        let off = table
            .events()
            .iter()
            .find(|e| e.handler == bench.led && e.payload == Some(Payload::Digital(false)))
            .unwrap()
            .time;
        assert_eq!(on, EventTime::ZERO);
        assert_eq!(off, EventTime::from_millis(10));
        assert_eq!(exposure.image_count(bench.camera), 1);
    }
}

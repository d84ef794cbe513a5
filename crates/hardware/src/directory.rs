//! The device directory: handlers plus the capabilities behind them.
//!
//! The directory composes the write-once [`HandlerRegistry`] with capability
//! tables keyed by [`DeviceId`] and the ordered list of executors. Executor
//! order matters: when two executors claim equally long runs of the table,
//! dispatch picks the one registered first.

use std::collections::HashMap;
use std::sync::Arc;

use common::{DeviceId, DeviceType, HandlerRegistry};

use crate::capabilities::{CameraControl, LightControl, PositionerControl};
use crate::executor::ExperimentExecutor;

#[derive(Default)]
pub struct DeviceDirectory {
    registry: HandlerRegistry,
    cameras: HashMap<DeviceId, Arc<dyn CameraControl>>,
    lights: HashMap<DeviceId, Arc<dyn LightControl>>,
    positioners: HashMap<DeviceId, Arc<dyn PositionerControl>>,
    executors: Vec<Arc<dyn ExperimentExecutor>>,
}

impl DeviceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.registry
    }

    pub fn add_camera(
        &mut self,
        name: impl Into<String>,
        group: impl Into<String>,
        camera: Arc<dyn CameraControl>,
    ) -> DeviceId {
        let id = self.registry.register(name, group, DeviceType::Camera, true);
        self.cameras.insert(id, camera);
        id
    }

    pub fn add_light(
        &mut self,
        name: impl Into<String>,
        group: impl Into<String>,
        light: Arc<dyn LightControl>,
    ) -> DeviceId {
        let id = self
            .registry
            .register(name, group, DeviceType::LightToggle, true);
        self.lights.insert(id, light);
        id
    }

    pub fn add_stage_axis(
        &mut self,
        name: impl Into<String>,
        group: impl Into<String>,
        positioner: Arc<dyn PositionerControl>,
    ) -> DeviceId {
        let id = self
            .registry
            .register(name, group, DeviceType::StageAxis, true);
        self.positioners.insert(id, positioner);
        id
    }

    /// Attach a positioner capability to an already-registered handler
    /// (analog line handles register themselves through their executor).
    pub fn bind_positioner(&mut self, id: DeviceId, positioner: Arc<dyn PositionerControl>) {
        self.positioners.insert(id, positioner);
    }

    /// Append an executor. Position in this list is the dispatch tie-break
    /// order.
    pub fn add_executor(&mut self, executor: Arc<dyn ExperimentExecutor>) {
        self.executors.push(executor);
    }

    pub fn camera(&self, id: DeviceId) -> Option<Arc<dyn CameraControl>> {
        self.cameras.get(&id).cloned()
    }

    pub fn light(&self, id: DeviceId) -> Option<Arc<dyn LightControl>> {
        self.lights.get(&id).cloned()
    }

    pub fn positioner(&self, id: DeviceId) -> Option<Arc<dyn PositionerControl>> {
        self.positioners.get(&id).cloned()
    }

    pub fn executors(&self) -> &[Arc<dyn ExperimentExecutor>] {
        &self.executors
    }

    pub fn handler_with_name(&self, name: &str) -> Option<DeviceId> {
        self.registry.handler_with_name(name)
    }

    pub fn handlers_of_type(&self, device_type: DeviceType) -> Vec<DeviceId> {
        self.registry.handlers_of_type(device_type)
    }

    /// Handler name for log messages; never fails.
    pub fn name(&self, id: DeviceId) -> &str {
        self.registry.name(id)
    }
}

impl std::fmt::Debug for DeviceDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceDirectory")
            .field("handlers", &self.registry.len())
            .field("cameras", &self.cameras.len())
            .field("lights", &self.lights.len())
            .field("positioners", &self.positioners.len())
            .field("executors", &self.executors.len())
            .finish()
    }
}

//! Device handlers and the handler registry.
//!
//! A handler is a named logical capability (a camera, a light, one stage
//! axis, a trigger line), not the physical connection behind it. Handlers are
//! created once at startup and addressed by identity for the rest of the
//! process lifetime: two handlers with identical names are still distinct
//! devices. Identity is an arena-issued [`DeviceId`] rather than a pointer,
//! so ids can key plain maps and travel across threads freely.
//!
//! The registry is write-once: all registration happens during device
//! initialization, after which it is only read. No locking is required.

use serde::{Deserialize, Serialize};

/// Stable identity of a device handler, issued by [`HandlerRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u32);

impl DeviceId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handler#{}", self.0)
    }
}

/// Coarse device classification, used for discovery and bookkeeping only;
/// scheduling never depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Camera,
    LightToggle,
    StageAxis,
    GenericTrigger,
    GenericPositioner,
    Executor,
}

/// Metadata for one registered handler.
#[derive(Debug, Clone)]
pub struct HandlerInfo {
    pub id: DeviceId,
    pub name: String,
    /// Group the handler belongs to, for ownership/bookkeeping.
    pub group: String,
    pub device_type: DeviceType,
    /// Whether the handler may appear in an action table. Executors run
    /// experiments but are never themselves part of one.
    pub eligible_for_experiments: bool,
}

/// Arena of all handlers known to the system.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: Vec<HandlerInfo>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        group: impl Into<String>,
        device_type: DeviceType,
        eligible_for_experiments: bool,
    ) -> DeviceId {
        let id = DeviceId(self.handlers.len() as u32);
        self.handlers.push(HandlerInfo {
            id,
            name: name.into(),
            group: group.into(),
            device_type,
            eligible_for_experiments,
        });
        id
    }

    pub fn info(&self, id: DeviceId) -> Option<&HandlerInfo> {
        self.handlers.get(id.index())
    }

    /// Handler name for log messages; never fails.
    pub fn name(&self, id: DeviceId) -> &str {
        self.info(id).map_or("<unknown>", |h| h.name.as_str())
    }

    pub fn handlers_of_type(&self, device_type: DeviceType) -> Vec<DeviceId> {
        self.handlers
            .iter()
            .filter(|h| h.device_type == device_type)
            .map(|h| h.id)
            .collect()
    }

    pub fn handler_with_name(&self, name: &str) -> Option<DeviceId> {
        self.handlers.iter().find(|h| h.name == name).map(|h| h.id)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HandlerInfo> {
        self.handlers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_not_name_equality() {
        let mut registry = HandlerRegistry::new();
        let a = registry.register("ambient", "lights", DeviceType::LightToggle, true);
        let b = registry.register("ambient", "lights", DeviceType::LightToggle, true);
        assert_ne!(a, b);
        // Name lookup returns the first registration.
        assert_eq!(registry.handler_with_name("ambient"), Some(a));
    }

    #[test]
    fn type_queries() {
        let mut registry = HandlerRegistry::new();
        let cam = registry.register("west", "cameras", DeviceType::Camera, true);
        registry.register("488nm", "lights", DeviceType::LightToggle, true);
        let exec = registry.register("dsp", "dsp", DeviceType::Executor, false);

        assert_eq!(registry.handlers_of_type(DeviceType::Camera), vec![cam]);
        assert_eq!(registry.handlers_of_type(DeviceType::Executor), vec![exec]);
        assert!(!registry.info(exec).unwrap().eligible_for_experiments);
    }
}

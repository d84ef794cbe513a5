//! Rig configuration: declarative TOML description of the devices on a
//! microscope and how they are wired onto executors.
//!
//! All durations in the schema are integer microseconds. Timing values must
//! be exact; a float field would invite drift the engine is built to reject.
//!
//! ```toml
//! [[cameras]]
//! name = "west"
//! trigger_mode = "before"
//! readout_us = 5000
//! min_exposure_us = 10000
//!
//! [[lights]]
//! name = "488nm"
//! exposure_us = 7000
//!
//! [[executors]]
//! name = "dsp"
//! digital_lines = 16
//! analog_channels = 2
//! sequencing = true
//!
//! [executors.digital]
//! "west" = 0
//! "488nm" = 1
//!
//! [[executors.analog]]
//! client = "zpiezo"
//! channel = 0
//! offset = 0.0
//! gain = 1.0
//! micros_per_unit = 5
//! settle_us = 1000
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use common::{EngineError, EngineResult, EventTime};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::capabilities::TriggerMode;
use crate::directory::DeviceDirectory;
use crate::executor::{MovementTimeFn, SignalExecutor};
use crate::mock::{MockCamera, MockLight, MockSignalBackend};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraConfig {
    pub name: String,
    #[serde(default = "default_camera_group")]
    pub group: String,
    pub trigger_mode: TriggerMode,
    pub readout_us: i64,
    pub min_exposure_us: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LightConfig {
    pub name: String,
    #[serde(default = "default_light_group")]
    pub group: String,
    pub exposure_us: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalogLineConfig {
    /// Name of the positioner handler created for this line.
    pub client: String,
    pub channel: u8,
    #[serde(default)]
    pub offset: f64,
    #[serde(default = "default_gain")]
    pub gain: f64,
    /// Move-time calibration: microseconds per unit of travel.
    pub micros_per_unit: i64,
    pub settle_us: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    pub name: String,
    #[serde(default = "default_executor_group")]
    pub group: String,
    #[serde(default)]
    pub digital_lines: u8,
    #[serde(default)]
    pub analog_channels: u8,
    /// Whether the backend has a hardware sequencer.
    #[serde(default)]
    pub sequencing: bool,
    /// Digital wiring: client handler name to line bit.
    #[serde(default)]
    pub digital: HashMap<String, u8>,
    #[serde(default)]
    pub analog: Vec<AnalogLineConfig>,
}

/// Top-level rig description.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RigConfig {
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
    #[serde(default)]
    pub lights: Vec<LightConfig>,
    #[serde(default)]
    pub executors: Vec<ExecutorConfig>,
}

fn default_camera_group() -> String {
    "cameras".to_owned()
}

fn default_light_group() -> String {
    "lights".to_owned()
}

fn default_executor_group() -> String {
    "executors".to_owned()
}

fn default_gain() -> f64 {
    1.0
}

impl RigConfig {
    /// Load from a TOML file, with `RIG_`-prefixed environment variables
    /// layered on top.
    pub fn load(path: &Path) -> Result<Self> {
        let config: RigConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("RIG_").split("__"))
            .extract()
            .with_context(|| format!("loading rig config from {}", path.display()))?;
        config.validate()?;
        info!(
            cameras = config.cameras.len(),
            lights = config.lights.len(),
            executors = config.executors.len(),
            "loaded rig config"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names: Vec<&str> = Vec::new();
        let check = |name: &'_ str, names: &mut Vec<&str>| -> Result<()> {
            if names.contains(&name) {
                bail!("duplicate device name '{name}'");
            }
            Ok(())
        };
        for camera in &self.cameras {
            check(&camera.name, &mut names)?;
            names.push(&camera.name);
        }
        for light in &self.lights {
            check(&light.name, &mut names)?;
            names.push(&light.name);
        }
        for executor in &self.executors {
            check(&executor.name, &mut names)?;
            names.push(&executor.name);
            for (client, bit) in &executor.digital {
                if *bit >= executor.digital_lines {
                    bail!(
                        "executor '{}': bit {bit} for '{client}' exceeds {} digital lines",
                        executor.name,
                        executor.digital_lines
                    );
                }
            }
            for line in &executor.analog {
                check(&line.client, &mut names)?;
                names.push(&line.client);
                if line.channel >= executor.analog_channels {
                    bail!(
                        "executor '{}': channel {} for '{}' exceeds {} analog channels",
                        executor.name,
                        line.channel,
                        line.client,
                        executor.analog_channels
                    );
                }
                if line.gain == 0.0 {
                    bail!("analog line '{}' has zero gain", line.client);
                }
            }
        }
        Ok(())
    }
}

/// Build a mock-backed [`DeviceDirectory`] from a rig description. Digital
/// wiring entries must name cameras or lights declared in the same config.
pub fn build_directory(config: &RigConfig) -> EngineResult<DeviceDirectory> {
    config.validate()?;
    let mut directory = DeviceDirectory::new();

    for camera in &config.cameras {
        directory.add_camera(
            &camera.name,
            &camera.group,
            Arc::new(MockCamera::new(
                camera.trigger_mode,
                EventTime::from_micros(camera.readout_us),
                EventTime::from_micros(camera.min_exposure_us),
            )),
        );
    }
    for light in &config.lights {
        directory.add_light(
            &light.name,
            &light.group,
            Arc::new(MockLight::new(EventTime::from_micros(light.exposure_us))),
        );
    }

    for executor_config in &config.executors {
        let backend = Arc::new(MockSignalBackend::new(
            executor_config.digital_lines,
            executor_config.analog_channels,
            executor_config.sequencing,
        ));
        let executor = SignalExecutor::new(
            directory.registry_mut(),
            &executor_config.name,
            &executor_config.group,
            backend,
        );

        // Deterministic wiring order for stable handler ids.
        let mut digital: Vec<(&String, &u8)> = executor_config.digital.iter().collect();
        digital.sort_by_key(|&(_, bit)| *bit);
        for (client_name, bit) in digital {
            let client = directory
                .handler_with_name(client_name)
                .ok_or_else(|| EngineError::HandlerNotFound {
                    name: client_name.clone(),
                })?;
            executor.register_digital(directory.registry_mut(), client, *bit)?;
        }

        for line in &executor_config.analog {
            let client = directory.registry_mut().register(
                &line.client,
                &executor_config.group,
                common::DeviceType::StageAxis,
                true,
            );
            let micros_per_unit = line.micros_per_unit;
            let settle = EventTime::from_micros(line.settle_us);
            let movement_time: MovementTimeFn = Arc::new(move |start, end| {
                let micros = ((end - start).abs() * micros_per_unit as f64).ceil() as i64;
                (EventTime::from_micros(micros), settle)
            });
            let handle = executor.register_analog(
                directory.registry_mut(),
                client,
                line.channel,
                line.offset,
                line.gain,
                movement_time,
            )?;
            directory.bind_positioner(client, handle);
        }

        directory.add_executor(Arc::new(executor));
    }
    Ok(directory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    const RIG: &str = r#"
        [[cameras]]
        name = "west"
        trigger_mode = "before"
        readout_us = 5000
        min_exposure_us = 10000

        [[lights]]
        name = "488nm"
        exposure_us = 7000

        [[executors]]
        name = "dsp"
        digital_lines = 16
        analog_channels = 1
        sequencing = true

        [executors.digital]
        "west" = 0
        "488nm" = 1

        [[executors.analog]]
        client = "zpiezo"
        channel = 0
        micros_per_unit = 5
        settle_us = 1000
    "#;

    #[test]
    fn loads_and_wires_a_rig() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(RIG.as_bytes()).unwrap();

        let config = RigConfig::load(file.path()).unwrap();
        assert_eq!(config.cameras.len(), 1);
        assert_eq!(config.executors[0].digital["west"], 0);

        let directory = build_directory(&config).unwrap();
        assert_eq!(directory.executors().len(), 1);
        let cam = directory.handler_with_name("west").unwrap();
        assert!(directory.camera(cam).is_some());
        let z = directory.handler_with_name("zpiezo").unwrap();
        let positioner = directory.positioner(z).unwrap();
        let (motion, settle) = positioner.movement_time(0.0, 10.0);
        assert_eq!(motion, EventTime::from_micros(50));
        assert_eq!(settle, EventTime::from_millis(1));
    }

    #[test]
    fn rejects_out_of_range_bits() {
        let config: RigConfig = toml::from_str(
            r#"
            [[lights]]
            name = "led"
            exposure_us = 1000

            [[executors]]
            name = "dsp"
            digital_lines = 2

            [executors.digital]
            "led" = 5
        "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_names() {
        let config: RigConfig = toml::from_str(
            r#"
            [[lights]]
            name = "led"
            exposure_us = 1000

            [[lights]]
            name = "led"
            exposure_us = 2000
        "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_digital_client_is_an_error() {
        let config: RigConfig = toml::from_str(
            r#"
            [[executors]]
            name = "dsp"
            digital_lines = 4

            [executors.digital]
            "ghost" = 0
        "#,
        )
        .unwrap();
        assert!(matches!(
            build_directory(&config),
            Err(EngineError::HandlerNotFound { .. })
        ));
    }
}

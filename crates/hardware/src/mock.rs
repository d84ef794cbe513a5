//! Mock devices for tests and the simulated rig.
//!
//! The mock backend records every write it receives so tests can assert on
//! the exact sequence of hardware operations, not just final state.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use common::{Event, EventTime};

use crate::backend::{SequencePoint, SignalBackend};
use crate::capabilities::{CameraControl, LightControl, PositionerControl, TriggerMode};
use crate::delegate::SegmentRunner;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Camera with fixed timing characteristics and a programmable exposure.
#[derive(Debug)]
pub struct MockCamera {
    mode: TriggerMode,
    readout: EventTime,
    min_exposure: EventTime,
    exposure: Mutex<EventTime>,
}

impl MockCamera {
    pub fn new(mode: TriggerMode, readout: EventTime, min_exposure: EventTime) -> Self {
        MockCamera {
            mode,
            readout,
            min_exposure,
            exposure: Mutex::new(min_exposure),
        }
    }
}

#[async_trait]
impl CameraControl for MockCamera {
    fn exposure_mode(&self) -> TriggerMode {
        self.mode
    }

    async fn time_between_exposures(&self) -> Result<EventTime> {
        Ok(self.readout)
    }

    async fn exposure_time(&self) -> Result<EventTime> {
        Ok(*lock(&self.exposure))
    }

    async fn min_exposure_time(&self) -> Result<EventTime> {
        Ok(self.min_exposure)
    }

    async fn set_exposure_time(&self, time: EventTime) -> Result<()> {
        *lock(&self.exposure) = time;
        Ok(())
    }
}

/// Light source with a fixed requested exposure.
#[derive(Debug)]
pub struct MockLight {
    exposure: EventTime,
}

impl MockLight {
    pub fn new(exposure: EventTime) -> Self {
        MockLight { exposure }
    }
}

#[async_trait]
impl LightControl for MockLight {
    async fn exposure_time(&self) -> Result<EventTime> {
        Ok(self.exposure)
    }
}

/// Positioner whose move time scales linearly with distance.
#[derive(Debug)]
pub struct MockPositioner {
    position: Mutex<f64>,
    micros_per_unit: i64,
    settle: EventTime,
}

impl MockPositioner {
    pub fn new(micros_per_unit: i64, settle: EventTime) -> Self {
        MockPositioner {
            position: Mutex::new(0.0),
            micros_per_unit,
            settle,
        }
    }
}

#[async_trait]
impl PositionerControl for MockPositioner {
    async fn move_abs(&self, position: f64) -> Result<()> {
        *lock(&self.position) = position;
        Ok(())
    }

    async fn position(&self) -> Result<f64> {
        Ok(*lock(&self.position))
    }

    fn movement_time(&self, start: f64, end: f64) -> (EventTime, EventTime) {
        let micros = ((end - start).abs() * self.micros_per_unit as f64).ceil() as i64;
        (EventTime::from_micros(micros), self.settle)
    }
}

/// One operation observed by the mock backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendOp {
    WriteDigital(u32),
    SetAnalog(u8, f64),
}

/// A recorded call to the hardware sequencer.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSequence {
    pub points: Vec<SequencePoint>,
    pub num_reps: u32,
    pub rep_duration: Option<EventTime>,
}

/// In-memory signal backend. With `sequencing` disabled the executor falls
/// back to software replay and every write lands in the op log; with it
/// enabled, whole sequences are recorded instead.
#[derive(Debug)]
pub struct MockSignalBackend {
    dlines: u8,
    alines: u8,
    sequencing: bool,
    digital: Mutex<u32>,
    analog: Mutex<Vec<f64>>,
    ops: Mutex<Vec<BackendOp>>,
    sequences: Mutex<Vec<RecordedSequence>>,
}

impl MockSignalBackend {
    pub fn new(dlines: u8, alines: u8, sequencing: bool) -> Self {
        MockSignalBackend {
            dlines,
            alines,
            sequencing,
            digital: Mutex::new(0),
            analog: Mutex::new(vec![0.0; alines as usize]),
            ops: Mutex::new(Vec::new()),
            sequences: Mutex::new(Vec::new()),
        }
    }

    pub fn set_digital_state(&self, word: u32) {
        *lock(&self.digital) = word;
    }

    pub fn set_analog_state(&self, channel: u8, level: f64) {
        lock(&self.analog)[channel as usize] = level;
    }

    pub fn ops(&self) -> Vec<BackendOp> {
        lock(&self.ops).clone()
    }

    pub fn sequences(&self) -> Vec<RecordedSequence> {
        lock(&self.sequences).clone()
    }

    pub fn digital_state(&self) -> u32 {
        *lock(&self.digital)
    }

    pub fn analog_state(&self, channel: u8) -> f64 {
        lock(&self.analog)[channel as usize]
    }
}

#[async_trait]
impl SignalBackend for MockSignalBackend {
    fn digital_line_count(&self) -> u8 {
        self.dlines
    }

    fn analog_channel_count(&self) -> u8 {
        self.alines
    }

    async fn read_digital(&self) -> Result<u32> {
        Ok(*lock(&self.digital))
    }

    async fn write_digital(&self, word: u32) -> Result<()> {
        *lock(&self.digital) = word;
        lock(&self.ops).push(BackendOp::WriteDigital(word));
        Ok(())
    }

    async fn get_analog(&self, channel: u8) -> Result<f64> {
        lock(&self.analog)
            .get(channel as usize)
            .copied()
            .ok_or_else(|| anyhow!("no analog channel {channel}"))
    }

    async fn set_analog(&self, channel: u8, level: f64) -> Result<()> {
        let mut analog = lock(&self.analog);
        let slot = analog
            .get_mut(channel as usize)
            .ok_or_else(|| anyhow!("no analog channel {channel}"))?;
        *slot = level;
        drop(analog);
        lock(&self.ops).push(BackendOp::SetAnalog(channel, level));
        Ok(())
    }

    fn supports_sequencing(&self) -> bool {
        self.sequencing
    }

    async fn run_sequence(
        &self,
        points: &[SequencePoint],
        num_reps: u32,
        rep_duration: Option<EventTime>,
    ) -> Result<()> {
        if !self.sequencing {
            return Err(anyhow!("sequencing disabled on this mock"));
        }
        // Final state matches what the hardware would leave behind.
        if let Some(last) = points.last() {
            *lock(&self.digital) = last.digital;
            let mut analog = lock(&self.analog);
            for (channel, level) in last.analog.iter().enumerate() {
                if let Some(slot) = analog.get_mut(channel) {
                    *slot = *level;
                }
            }
        }
        lock(&self.sequences).push(RecordedSequence {
            points: points.to_vec(),
            num_reps,
            rep_duration,
        });
        Ok(())
    }
}

/// Segment runner that records what it was asked to run.
#[derive(Debug, Default)]
pub struct MockSegmentRunner {
    runs: Mutex<Vec<(Vec<Event>, u32, Option<EventTime>)>>,
}

impl MockSegmentRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn runs(&self) -> Vec<(Vec<Event>, u32, Option<EventTime>)> {
        lock(&self.runs).clone()
    }
}

#[async_trait]
impl SegmentRunner for MockSegmentRunner {
    async fn run_segment(
        &self,
        events: &[Event],
        num_reps: u32,
        rep_duration: Option<EventTime>,
    ) -> Result<()> {
        lock(&self.runs).push((events.to_vec(), num_reps, rep_duration));
        Ok(())
    }
}

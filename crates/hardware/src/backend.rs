//! Low-level signal backend: the wire an executor drives.
//!
//! A backend is one timing card, DSP, or mock. It exposes a digital output
//! word and a bank of analog channels, plus (optionally) a hardware
//! sequencer that can replay a pre-reduced list of [`SequencePoint`]s with
//! deterministic timing. Executors never talk to devices directly; they
//! reduce action-table slices to points and hand them here.

use anyhow::{bail, Result};
use async_trait::async_trait;
use common::EventTime;

/// One fully-resolved output row: at `time`, drive the digital word to
/// `digital` and each analog channel to the matching `analog` level.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencePoint {
    pub time: EventTime,
    pub digital: u32,
    pub analog: Vec<f64>,
}

#[async_trait]
pub trait SignalBackend: Send + Sync {
    /// Width of the digital word, in lines. Zero means no digital support.
    fn digital_line_count(&self) -> u8 {
        0
    }

    /// Number of analog output channels. Zero means no analog support.
    fn analog_channel_count(&self) -> u8 {
        0
    }

    /// Current state of the digital output word.
    async fn read_digital(&self) -> Result<u32>;

    async fn write_digital(&self, word: u32) -> Result<()>;

    async fn get_analog(&self, channel: u8) -> Result<f64>;

    async fn set_analog(&self, channel: u8, level: f64) -> Result<()>;

    /// Whether [`SignalBackend::run_sequence`] is backed by a hardware
    /// timer. Backends answering `false` get the executor's software-timed
    /// fallback instead.
    fn supports_sequencing(&self) -> bool {
        false
    }

    /// Replay `points` with hardware timing, `num_reps` times. When
    /// `rep_duration` is given, each repetition is padded to that length.
    async fn run_sequence(
        &self,
        points: &[SequencePoint],
        num_reps: u32,
        rep_duration: Option<EventTime>,
    ) -> Result<()> {
        let _ = (points, num_reps, rep_duration);
        bail!("backend has no hardware sequencer")
    }
}

//! Exact timestamps for experiment scheduling.
//!
//! Action tables accumulate thousands of additive offsets over the course of
//! one experiment. Binary floating point would let camera and light triggers
//! drift apart by the end of a long run, so event times are integer
//! nanoseconds wrapped in a newtype. Ordering is total, arithmetic is exact,
//! and the i64 range (roughly +/- 292 years) is far beyond any experiment.
//!
//! Hardware collaborators that only speak floating-point milliseconds must go
//! through [`EventTime::try_from_millis_f64`], which rejects values that do
//! not land on a whole nanosecond. Catching an inexact timing value at setup
//! prevents it from poisoning the whole table later.

use crate::error::EngineError;

/// An exact, experiment-relative timestamp (or span) in integer nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EventTime(i64);

impl EventTime {
    pub const ZERO: EventTime = EventTime(0);

    pub const fn from_nanos(nanos: i64) -> Self {
        EventTime(nanos)
    }

    pub const fn from_micros(micros: i64) -> Self {
        EventTime(micros * 1_000)
    }

    pub const fn from_millis(millis: i64) -> Self {
        EventTime(millis * 1_000_000)
    }

    pub const fn from_secs(secs: i64) -> Self {
        EventTime(secs * 1_000_000_000)
    }

    /// Convert a floating-point millisecond value, failing unless it is
    /// exactly representable as whole nanoseconds.
    pub fn try_from_millis_f64(millis: f64) -> Result<Self, EngineError> {
        let nanos = millis * 1e6;
        if !nanos.is_finite() || nanos.fract() != 0.0 {
            return Err(EngineError::InexactTiming { value_ms: millis });
        }
        if nanos < i64::MIN as f64 || nanos > i64::MAX as f64 {
            return Err(EngineError::InexactTiming { value_ms: millis });
        }
        Ok(EventTime(nanos as i64))
    }

    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    pub fn as_millis_f64(self) -> f64 {
        self.0 as f64 / 1e6
    }

    pub fn as_duration(self) -> std::time::Duration {
        std::time::Duration::from_nanos(self.0.max(0) as u64)
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }
}

impl std::ops::Add for EventTime {
    type Output = EventTime;
    fn add(self, rhs: EventTime) -> EventTime {
        EventTime(self.0 + rhs.0)
    }
}

impl std::ops::Sub for EventTime {
    type Output = EventTime;
    fn sub(self, rhs: EventTime) -> EventTime {
        EventTime(self.0 - rhs.0)
    }
}

impl std::ops::AddAssign for EventTime {
    fn add_assign(&mut self, rhs: EventTime) {
        self.0 += rhs.0;
    }
}

impl std::ops::SubAssign for EventTime {
    fn sub_assign(&mut self, rhs: EventTime) {
        self.0 -= rhs.0;
    }
}

impl std::ops::Neg for EventTime {
    type Output = EventTime;
    fn neg(self) -> EventTime {
        EventTime(-self.0)
    }
}

impl std::ops::Div<i64> for EventTime {
    type Output = EventTime;
    fn div(self, rhs: i64) -> EventTime {
        EventTime(self.0 / rhs)
    }
}

impl std::fmt::Display for EventTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3}ms", self.as_millis_f64())
    }
}

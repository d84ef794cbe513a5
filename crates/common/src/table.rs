//! The action table: a time-ordered list of hardware events.
//!
//! The table is the lingua franca between experiment plans (which generate
//! it) and executors (which examine, rewrite, and finally replay it). Each
//! entry is `(time, handler, payload)`; payload interpretation is entirely up
//! to the executor that owns the handler.
//!
//! Invariants the rest of the engine relies on:
//!
//! - the table is re-sorted before any consumer reads it, with a stable sort
//!   so simultaneous events keep their insertion order;
//! - entries marked deleted during examination are compacted out before the
//!   next sort;
//! - after generation the whole table is shifted so the earliest event sits
//!   at a non-negative time;
//! - any contiguous index range can be sliced without touching the rest.

use crate::handler::DeviceId;
use crate::time::EventTime;

/// Instruction payload for a single event. `Digital` edges and `Analog`
/// levels cover most devices; `Indexed` selects an entry from a line's
/// pre-loaded position list (pattern devices, phase steppers).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Payload {
    Digital(bool),
    Analog(f64),
    Indexed(usize),
}

impl std::fmt::Display for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Digital(true) => write!(f, "high"),
            Payload::Digital(false) => write!(f, "low"),
            Payload::Analog(level) => write!(f, "{level}"),
            Payload::Indexed(i) => write!(f, "index {i}"),
        }
    }
}

/// One timestamped action. A `None` payload marks the event as deleted;
/// it stays in place (so indices held by an examining executor remain
/// valid) until [`ActionTable::clear_bad_entries`] compacts it away.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    pub time: EventTime,
    pub handler: DeviceId,
    pub payload: Option<Payload>,
}

impl Event {
    pub fn is_deleted(&self) -> bool {
        self.payload.is_none()
    }
}

/// Ordered, mutable sequence of timestamped events for one experiment run.
#[derive(Debug, Clone, Default)]
pub struct ActionTable {
    events: Vec<Event>,
    pulse_width: EventTime,
}

impl ActionTable {
    /// Minimum safe trigger pulse width: 0.1 ms.
    pub const DEFAULT_PULSE_WIDTH: EventTime = EventTime::from_micros(100);

    pub fn new() -> Self {
        ActionTable {
            events: Vec::new(),
            pulse_width: Self::DEFAULT_PULSE_WIDTH,
        }
    }

    /// A table targeting hardware with a non-default minimum pulse width.
    pub fn with_pulse_width(pulse_width: EventTime) -> Self {
        ActionTable {
            events: Vec::new(),
            pulse_width,
        }
    }

    pub fn pulse_width(&self) -> EventTime {
        self.pulse_width
    }

    /// Insert an event. Does not sort; returns `time` so callers can chain.
    pub fn add_action(&mut self, time: EventTime, handler: DeviceId, payload: Payload) -> EventTime {
        self.events.push(Event {
            time,
            handler,
            payload: Some(payload),
        });
        time
    }

    /// Insert a rising edge at `time` and a falling edge one pulse width
    /// later. Returns the time after the pulse completes.
    pub fn add_toggle(&mut self, time: EventTime, handler: DeviceId) -> EventTime {
        self.add_action(time, handler, Payload::Digital(true));
        let end = time + self.pulse_width;
        self.add_action(end, handler, Payload::Digital(false));
        end
    }

    /// Mark the event at `index` deleted without disturbing other indices.
    pub fn mark_deleted(&mut self, index: usize) {
        if let Some(event) = self.events.get_mut(index) {
            event.payload = None;
        }
    }

    /// Compact out deleted entries; returns how many were removed.
    pub fn clear_bad_entries(&mut self) -> usize {
        let before = self.events.len();
        self.events.retain(|e| !e.is_deleted());
        before - self.events.len()
    }

    /// Sort by time. The sort is stable, so simultaneous events keep their
    /// insertion order and the merge order during execution is deterministic.
    pub fn sort(&mut self) {
        self.events.sort_by_key(|e| e.time);
    }

    /// Move every event at or after `mark` forward by `delta`, making room
    /// for newly spliced-in events.
    pub fn shift_actions_back(&mut self, mark: EventTime, delta: EventTime) {
        for event in &mut self.events {
            if event.time >= mark {
                event.time += delta;
            }
        }
    }

    /// Translate the whole table so the earliest event is at time >= 0.
    pub fn enforce_positive_timepoints(&mut self) {
        let Some((first, _)) = self.first_and_last_times() else {
            return;
        };
        if !first.is_negative() {
            return;
        }
        let delta = -first;
        for event in &mut self.events {
            event.time += delta;
        }
    }

    /// Earliest and latest event times, or `None` for an empty table.
    pub fn first_and_last_times(&self) -> Option<(EventTime, EventTime)> {
        let mut bounds: Option<(EventTime, EventTime)> = None;
        for event in &self.events {
            bounds = Some(match bounds {
                None => (event.time, event.time),
                Some((first, last)) => (first.min(event.time), last.max(event.time)),
            });
        }
        bounds
    }

    /// The most recent `(time, payload)` for `handler`. Assumes the table
    /// has been sorted; deleted entries are skipped.
    pub fn last_action_for(&self, handler: DeviceId) -> Option<(EventTime, Payload)> {
        self.events
            .iter()
            .rev()
            .find(|e| e.handler == handler && !e.is_deleted())
            .map(|e| (e.time, e.payload.unwrap_or(Payload::Digital(false))))
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Event> {
        self.events.get(index)
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Borrow a contiguous span of the table for dispatch.
    pub fn slice(&self, range: std::ops::Range<usize>) -> &[Event] {
        &self.events[range]
    }
}

impl std::fmt::Display for ActionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for event in &self.events {
            match event.payload {
                None => writeln!(f, "<deleted event>")?,
                Some(payload) => writeln!(
                    f,
                    "{:>12}  {:>12}  {}",
                    event.time.to_string(),
                    event.handler.to_string(),
                    payload
                )?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{DeviceType, HandlerRegistry};

    fn handlers(n: usize) -> Vec<DeviceId> {
        let mut registry = HandlerRegistry::new();
        (0..n)
            .map(|i| registry.register(format!("dev{i}"), "test", DeviceType::GenericTrigger, true))
            .collect()
    }

    #[test]
    fn sort_is_idempotent_and_preserves_count() {
        let ids = handlers(2);
        let mut table = ActionTable::new();
        table.add_action(EventTime::from_millis(5), ids[0], Payload::Digital(true));
        table.add_action(EventTime::from_millis(1), ids[1], Payload::Digital(true));
        table.add_action(EventTime::from_millis(5), ids[1], Payload::Digital(false));

        table.sort();
        let once: Vec<_> = table.events().to_vec();
        table.sort();
        assert_eq!(table.events(), &once[..]);
        assert_eq!(table.len(), 3);
        // Stable: the tied events at 5ms keep insertion order.
        assert_eq!(table.get(1).unwrap().handler, ids[0]);
        assert_eq!(table.get(2).unwrap().handler, ids[1]);
    }

    #[test]
    fn toggle_emits_rising_then_falling() {
        let ids = handlers(1);
        let mut table = ActionTable::new();
        let end = table.add_toggle(EventTime::from_millis(2), ids[0]);

        assert_eq!(table.len(), 2);
        assert_eq!(end, EventTime::from_millis(2) + ActionTable::DEFAULT_PULSE_WIDTH);
        let rising = table.get(0).unwrap();
        let falling = table.get(1).unwrap();
        assert_eq!(rising.payload, Some(Payload::Digital(true)));
        assert_eq!(falling.payload, Some(Payload::Digital(false)));
        assert!(falling.time - rising.time >= ActionTable::DEFAULT_PULSE_WIDTH);
    }

    #[test]
    fn compaction_removes_exactly_the_deleted() {
        let ids = handlers(1);
        let mut table = ActionTable::new();
        for i in 0..5 {
            table.add_action(EventTime::from_millis(i), ids[0], Payload::Digital(i % 2 == 0));
        }
        table.mark_deleted(1);
        table.mark_deleted(3);

        let removed = table.clear_bad_entries();
        assert_eq!(removed, 2);
        assert_eq!(table.len(), 3);
        assert!(table.events().iter().all(|e| !e.is_deleted()));
    }

    #[test]
    fn enforce_positive_shifts_whole_table() {
        let ids = handlers(1);
        let mut table = ActionTable::new();
        table.add_action(EventTime::from_millis(-3), ids[0], Payload::Digital(true));
        table.add_action(EventTime::from_millis(7), ids[0], Payload::Digital(false));
        table.sort();
        table.enforce_positive_timepoints();

        let (first, last) = table.first_and_last_times().unwrap();
        assert_eq!(first, EventTime::ZERO);
        assert_eq!(last, EventTime::from_millis(10));
    }

    #[test]
    fn enforce_positive_is_noop_for_positive_tables() {
        let ids = handlers(1);
        let mut table = ActionTable::new();
        table.add_action(EventTime::from_millis(2), ids[0], Payload::Digital(true));
        table.enforce_positive_timepoints();
        assert_eq!(
            table.first_and_last_times(),
            Some((EventTime::from_millis(2), EventTime::from_millis(2)))
        );
    }

    #[test]
    fn shift_actions_back_moves_tail_only() {
        let ids = handlers(1);
        let mut table = ActionTable::new();
        table.add_action(EventTime::from_millis(1), ids[0], Payload::Digital(true));
        table.add_action(EventTime::from_millis(5), ids[0], Payload::Digital(false));
        table.add_action(EventTime::from_millis(9), ids[0], Payload::Digital(true));

        table.shift_actions_back(EventTime::from_millis(5), EventTime::from_millis(2));
        let times: Vec<_> = table.events().iter().map(|e| e.time).collect();
        assert_eq!(
            times,
            vec![
                EventTime::from_millis(1),
                EventTime::from_millis(7),
                EventTime::from_millis(11)
            ]
        );
    }

    #[test]
    fn last_action_for_skips_deleted() {
        let ids = handlers(2);
        let mut table = ActionTable::new();
        table.add_action(EventTime::from_millis(1), ids[0], Payload::Digital(true));
        table.add_action(EventTime::from_millis(2), ids[1], Payload::Analog(3.5));
        table.add_action(EventTime::from_millis(4), ids[0], Payload::Digital(false));
        table.sort();
        table.mark_deleted(2);

        assert_eq!(
            table.last_action_for(ids[0]),
            Some((EventTime::from_millis(1), Payload::Digital(true)))
        );
        assert_eq!(
            table.last_action_for(ids[1]),
            Some((EventTime::from_millis(2), Payload::Analog(3.5)))
        );
    }
}

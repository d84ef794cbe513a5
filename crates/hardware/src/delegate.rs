//! Delegated triggering for executors without their own lines.
//!
//! Some devices run their own timed programs (an SLM cycling patterns, a
//! filter-wheel controller) and only need a start pulse from an upstream
//! signal executor. A [`DelegateTrigger`] registers itself on one of the
//! upstream's digital lines and schedules its trigger pulses through the
//! proxy handler it gets back, while events addressed to the delegate
//! itself execute through an injected [`SegmentRunner`].

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use common::{
    ActionTable, DeviceId, DeviceType, EngineError, EngineResult, Event, EventTime,
    HandlerRegistry, Payload,
};
use tracing::instrument;

use crate::executor::{ExperimentExecutor, SignalExecutor};

/// Device-specific execution of a table span. The runner resolves when the
/// device has finished the events; dropping the future cancels it.
#[async_trait]
pub trait SegmentRunner: Send + Sync {
    async fn run_segment(
        &self,
        events: &[Event],
        num_reps: u32,
        rep_duration: Option<EventTime>,
    ) -> Result<()>;
}

struct TriggerBinding {
    upstream: Arc<SignalExecutor>,
    proxy: DeviceId,
    /// Minimum pulse length the device needs to detect a trigger.
    trigger_time: EventTime,
    /// Delay between the pulse and the device actually acting on it.
    response_time: EventTime,
}

/// An executor that owns no lines of its own and triggers via an upstream
/// [`SignalExecutor`].
pub struct DelegateTrigger {
    id: DeviceId,
    name: String,
    runner: Arc<dyn SegmentRunner>,
    binding: std::sync::OnceLock<TriggerBinding>,
}

impl DelegateTrigger {
    pub fn new(
        registry: &mut HandlerRegistry,
        name: impl Into<String>,
        group: impl Into<String>,
        runner: Arc<dyn SegmentRunner>,
    ) -> Self {
        let name = name.into();
        let id = registry.register(name.clone(), group, DeviceType::Executor, true);
        DelegateTrigger {
            id,
            name,
            runner,
            binding: std::sync::OnceLock::new(),
        }
    }

    /// Bind this delegate to digital line `bit` of `upstream`. Wiring
    /// happens once during device initialization.
    pub fn delegate_to(
        &self,
        registry: &mut HandlerRegistry,
        upstream: &Arc<SignalExecutor>,
        bit: u8,
        trigger_time: EventTime,
        response_time: EventTime,
    ) -> EngineResult<DeviceId> {
        let group = registry
            .info(self.id)
            .map_or_else(String::new, |h| h.group.clone());
        let proxy = upstream.register_trigger_proxy(registry, &self.name, &group, bit)?;
        let binding = TriggerBinding {
            upstream: Arc::clone(upstream),
            proxy,
            trigger_time,
            response_time,
        };
        if self.binding.set(binding).is_err() {
            return Err(EngineError::Backend(anyhow::anyhow!(
                "delegate '{}' is already bound to a trigger line",
                self.name
            )));
        }
        Ok(proxy)
    }

    fn binding(&self) -> EngineResult<&TriggerBinding> {
        self.binding.get().ok_or_else(|| EngineError::NoDigitalSupport {
            executor: self.name.clone(),
        })
    }

    /// The proxy handler this delegate's pulses are scheduled on.
    pub fn proxy(&self) -> Option<DeviceId> {
        self.binding.get().map(|b| b.proxy)
    }

    /// Schedule a trigger pulse at `time`. The pulse is stretched to the
    /// device's minimum trigger length when that exceeds the table's pulse
    /// width. Returns `(pulse_end, response_time)` so callers can account
    /// for the device's reaction latency.
    pub fn add_toggle(
        &self,
        time: EventTime,
        table: &mut ActionTable,
    ) -> EngineResult<(EventTime, EventTime)> {
        let binding = self.binding()?;
        let dt = binding.trigger_time.max(table.pulse_width());
        table.add_action(time, binding.proxy, Payload::Digital(true));
        let end = time + dt;
        table.add_action(end, binding.proxy, Payload::Digital(false));
        Ok((end, binding.response_time))
    }

    /// Fire the trigger line immediately, outside table playback.
    pub async fn trigger_now(&self) -> EngineResult<()> {
        let binding = self.binding()?;
        binding
            .upstream
            .trigger_digital(binding.proxy, binding.trigger_time)
            .await
    }
}

impl std::fmt::Debug for DelegateTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegateTrigger")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("bound", &self.binding.get().is_some())
            .finish()
    }
}

#[async_trait]
impl ExperimentExecutor for DelegateTrigger {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn num_runnable_lines(&self, table: &ActionTable, index: usize) -> usize {
        table.events()[index..]
            .iter()
            .take_while(|event| event.handler == self.id)
            .count()
    }

    #[instrument(skip(self, table), fields(executor = %self.name))]
    async fn execute_table(
        &self,
        table: &ActionTable,
        start: usize,
        stop: usize,
        num_reps: u32,
        rep_duration: Option<EventTime>,
    ) -> EngineResult<()> {
        self.runner
            .run_segment(table.slice(start..stop), num_reps, rep_duration)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SignalBackend;
    use crate::mock::{BackendOp, MockSegmentRunner, MockSignalBackend};

    fn wired() -> (
        HandlerRegistry,
        Arc<MockSignalBackend>,
        Arc<SignalExecutor>,
        Arc<MockSegmentRunner>,
        DelegateTrigger,
    ) {
        let mut registry = HandlerRegistry::new();
        let backend = Arc::new(MockSignalBackend::new(4, 0, false));
        let upstream = Arc::new(SignalExecutor::new(
            &mut registry,
            "dsp",
            "executors",
            Arc::clone(&backend) as Arc<dyn SignalBackend>,
        ));
        let runner = MockSegmentRunner::new();
        let delegate = DelegateTrigger::new(
            &mut registry,
            "slm",
            "slm",
            Arc::clone(&runner) as Arc<dyn SegmentRunner>,
        );
        delegate
            .delegate_to(
                &mut registry,
                &upstream,
                2,
                EventTime::from_micros(250),
                EventTime::from_millis(1),
            )
            .unwrap();
        (registry, backend, upstream, runner, delegate)
    }

    #[test]
    fn toggle_stretches_to_the_device_trigger_time() {
        let (_registry, _backend, _upstream, _runner, delegate) = wired();
        let mut table = ActionTable::new();
        let (end, response) = delegate
            .add_toggle(EventTime::from_millis(1), &mut table)
            .unwrap();

        // 250 us device minimum beats the 100 us default pulse width.
        assert_eq!(end, EventTime::from_millis(1) + EventTime::from_micros(250));
        assert_eq!(response, EventTime::from_millis(1));
        assert_eq!(table.len(), 2);
        let proxy = delegate.proxy().unwrap();
        assert_eq!(table.get(0).unwrap().handler, proxy);
    }

    #[test]
    fn runnable_lines_ignore_the_proxy() {
        let (_registry, _backend, _upstream, _runner, delegate) = wired();
        let mut table = ActionTable::new();
        table.add_action(EventTime::ZERO, delegate.id(), Payload::Indexed(0));
        table.add_action(EventTime::from_millis(1), delegate.id(), Payload::Indexed(1));
        delegate.add_toggle(EventTime::from_millis(2), &mut table).unwrap();
        table.sort();

        // The proxy's pulse belongs to the upstream executor.
        assert_eq!(delegate.num_runnable_lines(&table, 0), 2);
        assert_eq!(delegate.num_runnable_lines(&table, 2), 0);
    }

    #[tokio::test]
    async fn segments_route_through_the_runner() {
        let (_registry, _backend, _upstream, runner, delegate) = wired();
        let mut table = ActionTable::new();
        table.add_action(EventTime::ZERO, delegate.id(), Payload::Indexed(0));
        table.add_action(EventTime::from_millis(1), delegate.id(), Payload::Indexed(1));
        table.sort();

        delegate
            .execute_table(&table, 0, 2, 3, Some(EventTime::from_millis(10)))
            .await
            .unwrap();

        let runs = runner.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].0.len(), 2);
        assert_eq!(runs[0].1, 3);
        assert_eq!(runs[0].2, Some(EventTime::from_millis(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_now_pulses_the_upstream_line() {
        let (_registry, backend, _upstream, _runner, delegate) = wired();
        delegate.trigger_now().await.unwrap();
        assert_eq!(
            backend.ops(),
            vec![BackendOp::WriteDigital(0b100), BackendOp::WriteDigital(0)]
        );
    }

    #[test]
    fn unbound_delegate_cannot_schedule_pulses() {
        let mut registry = HandlerRegistry::new();
        let runner = MockSegmentRunner::new();
        let delegate = DelegateTrigger::new(
            &mut registry,
            "slm",
            "slm",
            runner as Arc<dyn SegmentRunner>,
        );
        let mut table = ActionTable::new();
        assert!(matches!(
            delegate.add_toggle(EventTime::ZERO, &mut table),
            Err(EngineError::NoDigitalSupport { .. })
        ));
    }
}

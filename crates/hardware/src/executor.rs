//! Executors: devices that run action-table slices against hardware.
//!
//! An executor owns a set of lines (digital bits, analog channels) and a
//! registry of client handlers mapped onto them. During dispatch it is handed
//! a contiguous slice of the sorted action table, reduces it to
//! [`SequencePoint`]s, and replays the points either through the backend's
//! hardware sequencer or, when the backend has none, through a
//! software-timed fallback with `tokio::time::sleep` between rows.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use common::{
    ActionTable, DeviceId, DeviceType, EngineError, EngineResult, EventTime, HandlerRegistry,
    Payload,
};
use tracing::{debug, instrument, warn};

use crate::backend::{SequencePoint, SignalBackend};
use crate::capabilities::PositionerControl;

/// Calibration function mapping a `(start, end)` move to
/// `(motion, stabilization)` time.
pub type MovementTimeFn = Arc<dyn Fn(f64, f64) -> (EventTime, EventTime) + Send + Sync>;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

/// A device that can take ownership of action-table events and execute them.
#[async_trait]
pub trait ExperimentExecutor: Send + Sync {
    /// This executor's own handler id.
    fn id(&self) -> DeviceId;

    fn name(&self) -> &str;

    /// Rewrite the table before execution: drop redundant entries, flag
    /// instructions this executor cannot carry out. Runs once per executor,
    /// in registration order, on the sorted table.
    fn examine_actions(&self, table: &mut ActionTable) -> EngineResult<()> {
        let _ = table;
        Ok(())
    }

    /// How many consecutive events starting at `index` this executor can
    /// run. Zero means the event at `index` is not ours.
    fn num_runnable_lines(&self, table: &ActionTable, index: usize) -> usize;

    /// Execute events in `start..stop`. Resolves when the hardware has
    /// finished the slice (all `num_reps` repetitions when the whole table
    /// was delegated).
    async fn execute_table(
        &self,
        table: &ActionTable,
        start: usize,
        stop: usize,
        num_reps: u32,
        rep_duration: Option<EventTime>,
    ) -> EngineResult<()>;

    /// Called once before the run starts dispatching.
    async fn prepare(&self) -> EngineResult<()> {
        Ok(())
    }

    /// Called after dispatch stops, on success, failure and abort alike.
    /// `is_final` distinguishes the last cleanup of a multi-pass run.
    async fn cleanup(&self, is_final: bool) -> EngineResult<()> {
        let _ = is_final;
        Ok(())
    }
}

/// One registered analog line: a client position scaled onto a backend
/// channel as `native = gain * (offset + position)`.
pub struct AnalogLineHandle {
    id: DeviceId,
    client: DeviceId,
    channel: u8,
    offset: f64,
    gain: f64,
    movement_time: MovementTimeFn,
    backend: Arc<dyn SignalBackend>,
    /// Pre-loaded position list for `Payload::Indexed` events.
    positions: RwLock<Vec<f64>>,
}

impl AnalogLineHandle {
    /// Handler id of the line itself.
    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn client(&self) -> DeviceId {
        self.client
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn pos_to_native(&self, position: f64) -> f64 {
        self.gain * (self.offset + position)
    }

    pub fn native_to_pos(&self, native: f64) -> f64 {
        native / self.gain - self.offset
    }

    /// Replace the indexed-position list for this line.
    pub fn set_indexed_positions(&self, positions: Vec<f64>) {
        *write(&self.positions) = positions;
    }

    pub fn indexed_position(&self, index: usize) -> EngineResult<f64> {
        read(&self.positions)
            .get(index)
            .copied()
            .ok_or(EngineError::MalformedPayload { handler: self.id })
    }
}

#[async_trait]
impl PositionerControl for AnalogLineHandle {
    async fn move_abs(&self, position: f64) -> Result<()> {
        self.backend
            .set_analog(self.channel, self.pos_to_native(position))
            .await
    }

    async fn position(&self) -> Result<f64> {
        Ok(self.native_to_pos(self.backend.get_analog(self.channel).await?))
    }

    fn movement_time(&self, start: f64, end: f64) -> (EventTime, EventTime) {
        (self.movement_time)(start, end)
    }
}

impl std::fmt::Debug for AnalogLineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalogLineHandle")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("offset", &self.offset)
            .field("gain", &self.gain)
            .finish()
    }
}

/// Executor multiplexing client handlers onto one backend's digital word
/// and analog channels. Registration happens during device initialization;
/// dispatch only reads the client maps.
pub struct SignalExecutor {
    id: DeviceId,
    name: String,
    dlines: u8,
    alines: u8,
    backend: Arc<dyn SignalBackend>,
    digital_clients: RwLock<HashMap<DeviceId, u8>>,
    analog_clients: RwLock<HashMap<DeviceId, usize>>,
    analog_lines: RwLock<Vec<Arc<AnalogLineHandle>>>,
    /// Analog levels saved at prepare, restored at final cleanup.
    saved_analog: tokio::sync::Mutex<Option<Vec<(u8, f64)>>>,
}

impl SignalExecutor {
    pub fn new(
        registry: &mut HandlerRegistry,
        name: impl Into<String>,
        group: impl Into<String>,
        backend: Arc<dyn SignalBackend>,
    ) -> Self {
        let name = name.into();
        let id = registry.register(name.clone(), group, DeviceType::Executor, false);
        SignalExecutor {
            id,
            name,
            dlines: backend.digital_line_count(),
            alines: backend.analog_channel_count(),
            backend,
            digital_clients: RwLock::new(HashMap::new()),
            analog_clients: RwLock::new(HashMap::new()),
            analog_lines: RwLock::new(Vec::new()),
            saved_analog: tokio::sync::Mutex::new(None),
        }
    }

    pub fn backend(&self) -> &Arc<dyn SignalBackend> {
        &self.backend
    }

    fn check_digital(&self, bit: u8) -> EngineResult<()> {
        if self.dlines == 0 {
            return Err(EngineError::NoDigitalSupport {
                executor: self.name.clone(),
            });
        }
        if bit >= self.dlines {
            return Err(EngineError::Backend(anyhow!(
                "bit {bit} out of range for {} digital lines",
                self.dlines
            )));
        }
        Ok(())
    }

    /// Attach `client` to digital line `bit`. Returns the trigger-proxy
    /// handler created for the line; both the client and the proxy resolve
    /// to the bit during execution.
    pub fn register_digital(
        &self,
        registry: &mut HandlerRegistry,
        client: DeviceId,
        bit: u8,
    ) -> EngineResult<DeviceId> {
        self.check_digital(bit)?;
        let client_name = registry.name(client).to_string();
        let group = registry
            .info(client)
            .map_or_else(String::new, |h| h.group.clone());
        let proxy = registry.register(
            format!("{client_name} trigger"),
            group,
            DeviceType::GenericTrigger,
            true,
        );
        let mut clients = write(&self.digital_clients);
        clients.insert(client, bit);
        clients.insert(proxy, bit);
        Ok(proxy)
    }

    /// Attach a delegate executor to digital line `bit`. Only the returned
    /// proxy resolves to the bit; the delegate keeps ownership of events
    /// addressed to itself.
    pub fn register_trigger_proxy(
        &self,
        registry: &mut HandlerRegistry,
        client_name: &str,
        group: &str,
        bit: u8,
    ) -> EngineResult<DeviceId> {
        self.check_digital(bit)?;
        let proxy = registry.register(
            format!("{client_name} trigger"),
            group,
            DeviceType::GenericTrigger,
            true,
        );
        write(&self.digital_clients).insert(proxy, bit);
        Ok(proxy)
    }

    /// Attach `client` to analog channel `channel` with the given scaling
    /// and movement-time calibration.
    pub fn register_analog(
        &self,
        registry: &mut HandlerRegistry,
        client: DeviceId,
        channel: u8,
        offset: f64,
        gain: f64,
        movement_time: MovementTimeFn,
    ) -> EngineResult<Arc<AnalogLineHandle>> {
        if self.alines == 0 {
            return Err(EngineError::NoAnalogSupport {
                executor: self.name.clone(),
            });
        }
        if channel >= self.alines {
            return Err(EngineError::Backend(anyhow!(
                "channel {channel} out of range for {} analog channels",
                self.alines
            )));
        }
        let client_name = registry.name(client).to_string();
        let group = registry
            .info(client)
            .map_or_else(String::new, |h| h.group.clone());
        let line_id = registry.register(
            format!("{client_name} line"),
            group,
            DeviceType::GenericPositioner,
            true,
        );
        let handle = Arc::new(AnalogLineHandle {
            id: line_id,
            client,
            channel,
            offset,
            gain,
            movement_time,
            backend: Arc::clone(&self.backend),
            positions: RwLock::new(Vec::new()),
        });
        let mut lines = write(&self.analog_lines);
        let index = lines.len();
        lines.push(Arc::clone(&handle));
        let mut clients = write(&self.analog_clients);
        clients.insert(client, index);
        clients.insert(line_id, index);
        Ok(handle)
    }

    pub fn analog_line(&self, client: DeviceId) -> Option<Arc<AnalogLineHandle>> {
        let index = *read(&self.analog_clients).get(&client)?;
        read(&self.analog_lines).get(index).cloned()
    }

    fn owns(&self, handler: DeviceId) -> bool {
        handler == self.id
            || read(&self.digital_clients).contains_key(&handler)
            || read(&self.analog_clients).contains_key(&handler)
    }

    /// Pulse the digital line of `client` outside table playback. The line
    /// is raised, held for `width`, and dropped; other bits are untouched.
    pub async fn trigger_digital(&self, client: DeviceId, width: EventTime) -> EngineResult<()> {
        let bit = *read(&self.digital_clients)
            .get(&client)
            .ok_or(EngineError::UnknownHandler { handler: client })?;
        let mask = 1u32 << bit;
        let word = self.backend.read_digital().await?;
        self.backend.write_digital(word | mask).await?;
        tokio::time::sleep(width.as_duration()).await;
        self.backend.write_digital(word & !mask).await?;
        Ok(())
    }

    /// One-shot bulb exposure without an action table: raise the camera
    /// lines together with every light line, drop each light when its
    /// exposure expires, and drop the cameras 1 ms after the last light.
    #[instrument(skip_all, fields(executor = %self.name))]
    pub async fn take_image(
        &self,
        cameras: &[DeviceId],
        light_time_pairs: &[(DeviceId, EventTime)],
    ) -> EngineResult<()> {
        let clients = read(&self.digital_clients);
        let mut cam_mask = 0u32;
        for cam in cameras {
            let bit = clients
                .get(cam)
                .ok_or(EngineError::UnknownHandler { handler: *cam })?;
            cam_mask |= 1 << bit;
        }
        if cam_mask == 0 {
            return Ok(());
        }
        let mut lights: Vec<(u32, EventTime)> = Vec::with_capacity(light_time_pairs.len());
        for (light, time) in light_time_pairs {
            let bit = clients
                .get(light)
                .ok_or(EngineError::UnknownHandler { handler: *light })?;
            lights.push((1 << bit, *time));
        }
        drop(clients);
        lights.sort_by_key(|&(_, time)| time);

        let mut state = cam_mask | lights.iter().fold(0, |m, &(bit, _)| m | bit);
        let touched = state;
        let mut staircase: Vec<(EventTime, u32)> = vec![(EventTime::ZERO, state)];
        for &(bit, time) in &lights {
            state &= !bit;
            staircase.push((time, state));
        }
        let last = staircase.last().map_or(EventTime::ZERO, |&(t, _)| t);
        staircase.push((last + EventTime::from_millis(1), 0));

        // Leave bits outside the exposure untouched.
        let entry = self.backend.read_digital().await?;
        let points: Vec<SequencePoint> = staircase
            .into_iter()
            .map(|(time, word)| SequencePoint {
                time,
                digital: (entry & !touched) | word,
                analog: Vec::new(),
            })
            .collect();
        if self.backend.supports_sequencing() {
            self.backend.run_sequence(&points, 1, None).await?;
        } else {
            self.soft_sequence(&points, 1, None).await?;
        }
        Ok(())
    }

    /// Reduce `start..stop` of the table into sequence points against the
    /// current hardware state. Simultaneous events on different clients
    /// merge into one composite row; same-client duplicates collapse;
    /// same-client conflicts are fatal.
    async fn reduce(
        &self,
        table: &ActionTable,
        start: usize,
        stop: usize,
    ) -> EngineResult<Vec<SequencePoint>> {
        let mut dstate = if self.dlines > 0 {
            self.backend.read_digital().await?
        } else {
            0
        };
        let mut astate = Vec::with_capacity(self.alines as usize);
        for channel in 0..self.alines {
            astate.push(self.backend.get_analog(channel).await?);
        }

        let digital_clients = read(&self.digital_clients);
        let analog_clients = read(&self.analog_clients);
        let analog_lines = read(&self.analog_lines);

        let mut points: Vec<SequencePoint> = Vec::new();
        let mut seen_at_time: Vec<(DeviceId, Payload)> = Vec::new();
        let mut current_time: Option<EventTime> = None;

        for event in table.slice(start..stop) {
            let Some(payload) = event.payload else {
                // Deleted entries are compacted before dispatch.
                continue;
            };
            if current_time == Some(event.time) {
                if let Some((_, seen)) = seen_at_time.iter().find(|(h, _)| *h == event.handler) {
                    if *seen == payload {
                        continue;
                    }
                    return Err(EngineError::ConflictingActions {
                        handler: event.handler,
                        time: event.time,
                    });
                }
            }

            if let Some(&index) = analog_clients.get(&event.handler) {
                let line = analog_lines
                    .get(index)
                    .ok_or(EngineError::UnknownHandler { handler: event.handler })?;
                let position = match payload {
                    Payload::Analog(position) => position,
                    Payload::Indexed(i) => line.indexed_position(i)?,
                    Payload::Digital(_) => {
                        return Err(EngineError::MalformedPayload { handler: event.handler })
                    }
                };
                astate[line.channel() as usize] = line.pos_to_native(position);
            } else if let Some(&bit) = digital_clients.get(&event.handler) {
                let mask = 1u32 << bit;
                match payload {
                    Payload::Digital(true) => dstate |= mask,
                    Payload::Digital(false) => dstate &= !mask,
                    _ => return Err(EngineError::MalformedPayload { handler: event.handler }),
                }
            } else {
                return Err(EngineError::UnknownHandler { handler: event.handler });
            }

            if current_time == Some(event.time) {
                // Composite row: fold this client into the point in place.
                if let Some(point) = points.last_mut() {
                    point.digital = dstate;
                    point.analog.clone_from(&astate);
                }
                seen_at_time.push((event.handler, payload));
            } else {
                points.push(SequencePoint {
                    time: event.time,
                    digital: dstate,
                    analog: astate.clone(),
                });
                current_time = Some(event.time);
                seen_at_time.clear();
                seen_at_time.push((event.handler, payload));
            }
        }
        Ok(points)
    }

    /// Software-timed replay for backends without a hardware sequencer.
    /// Timing precision is bounded by the tokio timer; the entry digital
    /// state is restored after the last repetition.
    async fn soft_sequence(
        &self,
        points: &[SequencePoint],
        num_reps: u32,
        rep_duration: Option<EventTime>,
    ) -> EngineResult<()> {
        let Some(first) = points.first() else {
            return Ok(());
        };
        warn!(
            executor = %self.name,
            points = points.len(),
            "replaying sequence in software; timing precision is reduced"
        );
        let entry_digital = if self.dlines > 0 {
            Some(self.backend.read_digital().await?)
        } else {
            None
        };
        // Only touch channels whose level actually changes.
        let mut last_analog = Vec::with_capacity(self.alines as usize);
        for channel in 0..self.alines {
            last_analog.push(self.backend.get_analog(channel).await?);
        }

        for rep in 0..num_reps {
            let rep_start = first.time;
            let mut clock = first.time;
            for point in points {
                if point.time > clock {
                    tokio::time::sleep((point.time - clock).as_duration()).await;
                    clock = point.time;
                }
                if self.dlines > 0 {
                    self.backend.write_digital(point.digital).await?;
                }
                for (channel, level) in point.analog.iter().enumerate() {
                    if last_analog.get(channel) != Some(level) {
                        self.backend.set_analog(channel as u8, *level).await?;
                        last_analog[channel] = *level;
                    }
                }
            }
            if rep + 1 < num_reps {
                if let Some(duration) = rep_duration {
                    let elapsed = clock - rep_start;
                    if duration > elapsed {
                        tokio::time::sleep((duration - elapsed).as_duration()).await;
                    }
                }
            }
        }

        if let Some(word) = entry_digital {
            self.backend.write_digital(word).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SignalExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalExecutor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("dlines", &self.dlines)
            .field("alines", &self.alines)
            .finish()
    }
}

#[async_trait]
impl ExperimentExecutor for SignalExecutor {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    /// Drop duplicate simultaneous events for the same client; error on
    /// simultaneous conflicting ones. Runs on the sorted table.
    fn examine_actions(&self, table: &mut ActionTable) -> EngineResult<()> {
        let mut seen: HashMap<(EventTime, DeviceId), Payload> = HashMap::new();
        let mut marked = 0usize;
        for index in 0..table.len() {
            let Some(event) = table.get(index).copied() else {
                break;
            };
            let Some(payload) = event.payload else {
                continue;
            };
            if !self.owns(event.handler) {
                continue;
            }
            match seen.insert((event.time, event.handler), payload) {
                None => {}
                Some(previous) if previous == payload => {
                    table.mark_deleted(index);
                    marked += 1;
                }
                Some(_) => {
                    return Err(EngineError::ConflictingActions {
                        handler: event.handler,
                        time: event.time,
                    });
                }
            }
        }
        if marked > 0 {
            debug!(executor = %self.name, dropped = marked, "dropped redundant simultaneous events");
            table.clear_bad_entries();
        }
        Ok(())
    }

    fn num_runnable_lines(&self, table: &ActionTable, index: usize) -> usize {
        table.events()[index..]
            .iter()
            .take_while(|event| self.owns(event.handler))
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
        let points = self.reduce(table, start, stop).await?;
        if points.is_empty() {
            return Ok(());
        }
        if self.backend.supports_sequencing() {
            self.backend
                .run_sequence(&points, num_reps, rep_duration)
                .await?;
        } else {
            self.soft_sequence(&points, num_reps, rep_duration).await?;
        }
        Ok(())
    }

    async fn prepare(&self) -> EngineResult<()> {
        let lines = read(&self.analog_lines).clone();
        let mut saved = Vec::with_capacity(lines.len());
        for line in &lines {
            saved.push((line.channel(), self.backend.get_analog(line.channel()).await?));
        }
        *self.saved_analog.lock().await = Some(saved);
        Ok(())
    }

    async fn cleanup(&self, is_final: bool) -> EngineResult<()> {
        if !is_final {
            return Ok(());
        }
        let saved = self.saved_analog.lock().await.take();
        if let Some(levels) = saved {
            for (channel, level) in levels {
                self.backend.set_analog(channel, level).await?;
            }
        }
        Ok(())
    }
}

//! Recording pipeline.
//!
//! Each [`Recorder::tick`] builds one [`Frame`]:
//!
//! 1. Objects that disappeared since the last tick produce `Destroy`
//!    packets; destroyed persistent objects join the deleted set.
//! 2. An in-progress checkpoint captures more objects in
//!    [`CaptureMode::Full`] under its per-tick budget. The same full-state
//!    bytes go into the frame, so checkpoint and delta stream agree.
//! 3. Due objects are captured, most important and stalest first, until
//!    the capture budget runs out.
//! 4. Queued aux blocks and streaming-level changes are attached and the
//!    frame is appended. A checkpoint whose last object was captured this
//!    tick is then committed.
//!
//! Any back-end failure is fatal: the recorder stops and reports
//! [`SessionError::StreamFatal`].

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rewind_core::{
    CaptureMode, Clock, LevelIndex, ObjectDescriptor, ObjectHandle, PersistentId, Simulation,
    StreamBackend,
};
use rewind_replay::codec::encode_packet;
use rewind_replay::{
    seconds_to_ms, AuxBlock, Checkpoint, Frame, IdentityCache, LevelEntry, ObjectPacket,
    StreamHeader, StreamWriter, StreamingLevel, MAX_PACKET_BYTES,
};

use crate::config::{CheckpointConfig, RecordConfig, SessionConfig};
use crate::error::SessionError;
use crate::event::SessionEvent;
use crate::metrics::RecordMetrics;

/// Slack when comparing accumulated float times against deadlines.
const TIME_TOLERANCE: f64 = 1e-6;

/// Upper bound on what a spawn or bind packet adds around the state bytes,
/// not counting the pathname. Captures within this margin of the packet
/// limit are sized exactly.
const PACKET_OVERHEAD: usize = 64;

/// Lifecycle of a [`Recorder`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecorderState {
    /// Appending frames.
    Recording,
    /// Stopped by the host; the stream is finished.
    Stopped,
    /// Stopped by a fatal error.
    Failed,
}

impl RecorderState {
    fn name(self) -> &'static str {
        match self {
            Self::Recording => "recording",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

// ── Per-object bookkeeping ─────────────────────────────────────────

#[derive(Debug)]
struct TrackedObject {
    /// Set once the object has been announced with a spawn or bind packet.
    id: Option<PersistentId>,
    next_update_time: f64,
    last_capture_time: Option<f64>,
    last_change_time: f64,
    last_relevant_time: f64,
    adaptive_interval: Option<f64>,
    dormant: bool,
    /// The last capture was dropped; the next one must carry full state.
    resync: bool,
}

impl TrackedObject {
    fn new(now: f64) -> Self {
        Self {
            id: None,
            next_update_time: now,
            last_capture_time: None,
            last_change_time: now,
            last_relevant_time: now,
            adaptive_interval: None,
            dormant: false,
            resync: false,
        }
    }
}

/// One object's capture result.
struct Captured {
    id: PersistentId,
    owner: Option<PersistentId>,
    descriptor: ObjectDescriptor,
    bytes: Vec<u8>,
    announced: bool,
}

impl Captured {
    /// The spawn or bind packet that announces this object with its full
    /// state.
    fn announcement(&self) -> ObjectPacket {
        match &self.descriptor.pathname {
            Some(pathname) => ObjectPacket::Bind {
                id: self.id,
                owner: self.owner,
                class: self.descriptor.class,
                pathname: pathname.clone(),
                state: self.bytes.clone(),
            },
            None => ObjectPacket::Spawn {
                id: self.id,
                owner: self.owner,
                class: self.descriptor.class,
                transform: self.descriptor.transform,
                state: self.bytes.clone(),
            },
        }
    }

    /// The packet written into the ordinary frame.
    fn frame_packet(&self) -> ObjectPacket {
        if self.announced {
            self.announcement()
        } else {
            ObjectPacket::Update {
                id: self.id,
                delta: self.bytes.clone(),
            }
        }
    }
}

#[derive(Debug)]
struct CheckpointWork {
    stream_offset: u64,
    pending: VecDeque<ObjectHandle>,
    packets: Vec<Vec<u8>>,
    objects: u32,
    ticks: u32,
}

// ── Recorder ───────────────────────────────────────────────────────

/// Captures a live simulation into a stream.
pub struct Recorder {
    record: RecordConfig,
    checkpoints: CheckpointConfig,
    clock: Arc<dyn Clock>,
    backend: Box<dyn StreamBackend>,
    writer: StreamWriter,
    header: StreamHeader,
    identity: IdentityCache,
    tracked: HashMap<ObjectHandle, TrackedObject>,
    deleted: BTreeSet<PersistentId>,
    level: LevelIndex,
    elapsed: f64,
    last_checkpoint: Option<f64>,
    checkpoint_requested: bool,
    checkpoint: Option<CheckpointWork>,
    aux: Vec<(ObjectHandle, Vec<u8>)>,
    streaming: Vec<StreamingLevel>,
    state: RecorderState,
    paused: bool,
    transitioning: bool,
    metrics: RecordMetrics,
    events: Vec<SessionEvent>,
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("state", &self.state)
            .field("level", &self.level)
            .field("elapsed", &self.elapsed)
            .field("tracked", &self.tracked.len())
            .field("checkpoint_in_progress", &self.checkpoint.is_some())
            .finish_non_exhaustive()
    }
}

impl Recorder {
    /// Start recording `sim` into `backend`, writing the stream header.
    pub fn new(
        mut backend: Box<dyn StreamBackend>,
        sim: &dyn Simulation,
        config: &SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SessionError> {
        let header = StreamHeader {
            schema_version: sim.schemas().version(),
            levels: vec![LevelEntry {
                name: sim.current_level().to_string(),
                start_ms: 0,
            }],
            blob: Vec::new(),
        };
        let mut writer = StreamWriter::new();
        writer.write_header(backend.as_mut(), &header)?;
        tracing::info!(
            level = sim.current_level(),
            schema_version = header.schema_version,
            "recording started"
        );
        Ok(Self {
            record: config.record.clone(),
            checkpoints: config.checkpoint.clone(),
            clock,
            backend,
            writer,
            header,
            identity: IdentityCache::new(),
            tracked: HashMap::new(),
            deleted: BTreeSet::new(),
            level: LevelIndex(0),
            elapsed: 0.0,
            last_checkpoint: None,
            checkpoint_requested: false,
            checkpoint: None,
            aux: Vec::new(),
            streaming: Vec::new(),
            state: RecorderState::Recording,
            paused: false,
            transitioning: false,
            metrics: RecordMetrics::default(),
            events: Vec::new(),
        })
    }

    // ── Accessors ──────────────────────────────────────────────────

    /// Current lifecycle state.
    pub fn state(&self) -> RecorderState {
        self.state
    }

    /// Stream time of the next frame, in seconds.
    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }

    /// Level segment being recorded.
    pub fn level(&self) -> LevelIndex {
        self.level
    }

    /// Stream header as last written.
    pub fn header(&self) -> &StreamHeader {
        &self.header
    }

    /// Identity records of announced objects.
    pub fn identity(&self) -> &IdentityCache {
        &self.identity
    }

    /// Counters.
    pub fn metrics(&self) -> &RecordMetrics {
        &self.metrics
    }

    /// Whether recording is paused.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Whether a level transition is in progress.
    pub fn in_level_transition(&self) -> bool {
        self.transitioning
    }

    /// Whether a checkpoint is being captured.
    pub fn checkpoint_in_progress(&self) -> bool {
        self.checkpoint.is_some()
    }

    /// Take the events produced since the last call.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    // ── Host controls ──────────────────────────────────────────────

    /// Stop appending frames until [`resume`](Self::resume). Stream time
    /// does not advance while paused.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Continue after [`pause`](Self::pause).
    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Start a checkpoint on the next tick.
    pub fn request_checkpoint(&mut self) {
        self.checkpoint_requested = true;
    }

    /// Attach application data for `handle` to the next frame.
    pub fn queue_aux_data(&mut self, handle: ObjectHandle, data: Vec<u8>) {
        self.aux.push((handle, data));
    }

    /// Record a streaming sub-level change in the next frame.
    pub fn queue_streaming_level(&mut self, package: &str, package_to_load: &str) {
        self.streaming.push(StreamingLevel {
            package: package.to_string(),
            package_to_load: package_to_load.to_string(),
        });
    }

    /// Resume capturing a capture-once object.
    pub fn reactivate(&mut self, handle: ObjectHandle) {
        if let Some(t) = self.tracked.get_mut(&handle) {
            t.dormant = false;
            t.next_update_time = 0.0;
        }
    }

    /// Replace the header's application blob.
    pub fn set_header_blob(&mut self, blob: Vec<u8>) -> Result<(), SessionError> {
        self.ensure_recording("set the header blob")?;
        self.header.blob = blob;
        let result = self
            .writer
            .write_header(self.backend.as_mut(), &self.header)
            .map_err(SessionError::from);
        self.check(result)
    }

    /// Announce that the simulation is about to load `name`.
    ///
    /// Recording pauses until [`finish_level_transition`](Self::finish_level_transition).
    /// Any in-progress checkpoint is abandoned.
    pub fn begin_level_transition(&mut self, name: &str) -> Result<(), SessionError> {
        self.ensure_recording("begin a level transition")?;
        if self.transitioning {
            return Err(SessionError::InvalidState {
                operation: "begin a level transition",
                state: "transitioning",
            });
        }
        self.abandon_checkpoint();
        self.transitioning = true;
        self.header.levels.push(LevelEntry {
            name: name.to_string(),
            start_ms: seconds_to_ms(self.elapsed),
        });
        tracing::info!(level = name, at = self.elapsed, "level transition started");
        let result = self
            .writer
            .write_header(self.backend.as_mut(), &self.header)
            .map_err(SessionError::from);
        self.check(result)
    }

    /// Resume recording in the newly loaded level and force a checkpoint.
    ///
    /// Objects that survived the load keep their ids but are announced
    /// again, since a player loading the level may have destroyed its copy.
    /// Everything else is forgotten.
    pub fn finish_level_transition(&mut self, sim: &dyn Simulation) -> Result<(), SessionError> {
        if !self.transitioning {
            return Err(SessionError::InvalidState {
                operation: "finish a level transition",
                state: "not transitioning",
            });
        }
        self.level = LevelIndex(self.header.levels.len().saturating_sub(1) as u32);
        self.tracked.retain(|h, _| sim.object(*h).is_some());
        let now = self.elapsed;
        for t in self.tracked.values_mut() {
            t.id = None;
            t.dormant = false;
            t.next_update_time = now;
        }
        let gone: Vec<ObjectHandle> = self
            .identity
            .iter()
            .filter_map(|r| r.handle)
            .filter(|h| sim.object(*h).is_none())
            .collect();
        for handle in gone {
            self.identity.remove_handle(handle);
        }
        self.deleted.clear();
        self.checkpoint_requested = true;
        self.transitioning = false;
        tracing::info!(level = self.level.0, "level transition finished");
        Ok(())
    }

    /// Finish the stream. Idempotent.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        if self.state != RecorderState::Recording {
            return Ok(());
        }
        self.abandon_checkpoint();
        self.state = RecorderState::Stopped;
        self.backend.stop()?;
        tracing::info!(
            frames = self.metrics.frames_written,
            checkpoints = self.metrics.checkpoints_written,
            duration_ms = self.backend.total_duration_ms(),
            "recording stopped"
        );
        Ok(())
    }

    // ── Tick ───────────────────────────────────────────────────────

    /// Record one frame at the current stream time, then advance it by
    /// `dt` seconds.
    pub fn tick(&mut self, sim: &mut dyn Simulation, dt: f64) -> Result<(), SessionError> {
        self.ensure_recording("record a tick")?;
        if self.paused || self.transitioning {
            return Ok(());
        }
        let result = self.record_frame(sim);
        self.check(result)?;
        self.elapsed += dt;
        Ok(())
    }

    fn record_frame(&mut self, sim: &mut dyn Simulation) -> Result<(), SessionError> {
        let now = self.elapsed;
        let tick_start = self.clock.now();
        let mut frame = Frame::idle(self.level, now);
        frame.streaming_levels = std::mem::take(&mut self.streaming);

        let live = sim.enumerate_capturable();
        self.detect_destroyed(&live, &mut frame)?;
        for &handle in &live {
            self.tracked
                .entry(handle)
                .or_insert_with(|| TrackedObject::new(now));
        }

        if self.checkpoint.is_none() && self.checkpoint_due(now) {
            self.begin_checkpoint(&live);
        }
        let mut captured = HashSet::new();
        let finalize = self.advance_checkpoint(sim, now, &mut frame, &mut captured)?;
        self.capture_due(sim, now, tick_start, &live, &captured, &mut frame)?;
        self.attach_aux(&mut frame);

        let bytes = self.writer.write_frame(self.backend.as_mut(), &frame)?;
        self.metrics.frames_written += 1;
        self.metrics.bytes_written += bytes;
        self.metrics.packets_written += frame.packets.len() as u64;
        self.metrics.last_tick_capture_us = micros(self.clock.now().saturating_sub(tick_start));

        if finalize {
            self.finalize_checkpoint(sim, now)?;
        }
        self.backend.update_total_duration_ms(seconds_to_ms(now))?;
        Ok(())
    }

    fn detect_destroyed(
        &mut self,
        live: &[ObjectHandle],
        frame: &mut Frame,
    ) -> Result<(), SessionError> {
        let live: HashSet<ObjectHandle> = live.iter().copied().collect();
        let mut gone: Vec<ObjectHandle> = self
            .tracked
            .keys()
            .filter(|h| !live.contains(h))
            .copied()
            .collect();
        gone.sort();
        for handle in gone {
            let Some(tracked) = self.tracked.remove(&handle) else {
                continue;
            };
            self.identity.remove_handle(handle);
            if let Some(work) = self.checkpoint.as_mut() {
                work.pending.retain(|h| *h != handle);
            }
            if let Some(id) = tracked.id {
                frame.packets.push(encode_packet(&ObjectPacket::Destroy { id })?);
                if id.is_stable() {
                    self.deleted.insert(id);
                }
            }
        }
        Ok(())
    }

    // ── Capture ────────────────────────────────────────────────────

    /// Capture one object. `Ok(None)` when it vanished, has an unknown
    /// class, or reported no change.
    fn capture(
        &mut self,
        sim: &mut dyn Simulation,
        handle: ObjectHandle,
        mode: CaptureMode,
    ) -> Result<Option<Captured>, SessionError> {
        let Some(descriptor) = sim.object(handle).map(|o| o.descriptor()) else {
            return Ok(None);
        };
        let Some(checksum) = sim.schemas().checksum_of(descriptor.class) else {
            tracing::warn!(
                handle = handle.0,
                class = descriptor.class.0,
                "skipping object with unregistered class"
            );
            return Ok(None);
        };
        let (announced, resync) = self
            .tracked
            .get(&handle)
            .map_or((false, false), |t| (t.id.is_some(), t.resync));
        let mode = if announced && !resync {
            mode
        } else {
            CaptureMode::Full
        };
        let Some(obj) = sim.object_mut(handle) else {
            return Ok(None);
        };
        let bytes = match obj.capture_delta(mode) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(e) => {
                tracing::warn!(handle = handle.0, error = %e, "capture failed");
                return Ok(None);
            }
        };

        let owner = descriptor.owner.and_then(|h| self.identity.lookup(h));
        let (id, new) = self.identity.intern(handle, &descriptor, owner, checksum);
        let captured = Captured {
            id,
            owner,
            descriptor,
            bytes,
            announced: !announced,
        };
        if let Some(size) = oversized(&captured)? {
            tracing::warn!(
                handle = handle.0,
                %id,
                bytes = size,
                max = MAX_PACKET_BYTES,
                "object state does not fit in one packet; capture dropped"
            );
            self.metrics.oversized_captures += 1;
            if new {
                self.identity.remove(id);
            }
            if let Some(t) = self.tracked.get_mut(&handle) {
                t.resync = announced;
            }
            return Ok(None);
        }
        if let Some(t) = self.tracked.get_mut(&handle) {
            t.resync = false;
            if !announced {
                t.id = Some(id);
            }
        }
        if !announced {
            self.deleted.remove(&id);
        }
        Ok(Some(captured))
    }

    fn capture_due(
        &mut self,
        sim: &mut dyn Simulation,
        now: f64,
        tick_start: Duration,
        live: &[ObjectHandle],
        skip: &HashSet<ObjectHandle>,
        frame: &mut Frame,
    ) -> Result<(), SessionError> {
        let viewers = if self.record.use_relevancy {
            sim.viewers()
        } else {
            Vec::new()
        };
        let cull_sq = self.record.cull_distance * self.record.cull_distance;

        let mut candidates: Vec<(f64, ObjectHandle)> = Vec::new();
        for &handle in live {
            if skip.contains(&handle) {
                continue;
            }
            let Some(obj) = sim.object(handle) else {
                continue;
            };
            let Some(tracked) = self.tracked.get_mut(&handle) else {
                continue;
            };
            if tracked.dormant {
                continue;
            }
            let descriptor = obj.descriptor();
            let relevant = !self.record.use_relevancy
                || viewers.is_empty()
                || obj.is_always_relevant()
                || viewers
                    .iter()
                    .any(|v| descriptor.transform.distance_squared(*v) <= cull_sq);
            if relevant {
                tracked.last_relevant_time = now;
            }
            let due = now + TIME_TOLERANCE >= tracked.next_update_time;
            if !due {
                continue;
            }
            if now - tracked.last_relevant_time > self.record.relevant_timeout {
                // Not relevant: try again later at the reduced rate.
                let hz = self.record.record_hz_when_not_relevant;
                tracked.next_update_time = if hz > 0.0 { now + 1.0 / hz } else { f64::INFINITY };
                continue;
            }
            let staleness = tracked
                .last_capture_time
                .map_or(now + 1.0, |t| now - t)
                .max(TIME_TOLERANCE);
            candidates.push((f64::from(descriptor.priority) * staleness, handle));
        }
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));

        let budget_ms = self.record.max_desired_record_time_ms;
        let mut captures = 0u32;
        let mut deferred = 0u32;
        for (i, &(_, handle)) in candidates.iter().enumerate() {
            if budget_ms > 0.0 && ms_since(self.clock.as_ref(), tick_start) >= budget_ms {
                deferred = (candidates.len() - i) as u32;
                break;
            }
            let captured = self.capture(sim, handle, CaptureMode::Delta)?;
            let had_data = captured.is_some();
            if let Some(c) = captured {
                frame.packets.push(encode_packet(&c.frame_packet())?);
                self.schedule(handle, now, true, &c.descriptor);
                captures += 1;
            } else if let Some(descriptor) = sim.object(handle).map(|o| o.descriptor()) {
                self.schedule(handle, now, had_data, &descriptor);
            }
        }
        if deferred > 0 {
            tracing::debug!(deferred, budget_ms, "capture budget exhausted");
        }
        self.metrics.last_tick_captures = captures;
        self.metrics.last_tick_deferred = deferred;
        Ok(())
    }

    /// Pick the next capture time after a capture attempt.
    fn schedule(
        &mut self,
        handle: ObjectHandle,
        now: f64,
        had_data: bool,
        descriptor: &ObjectDescriptor,
    ) {
        let base = self.record.interval_for(f64::from(descriptor.update_hz));
        let cfg = &self.record;
        let Some(t) = self.tracked.get_mut(&handle) else {
            return;
        };
        t.last_capture_time = Some(now);
        if had_data {
            if cfg.adaptive_frequency {
                let observed = now - t.last_change_time;
                let (shortest, longest) = cfg.interval_bounds();
                t.adaptive_interval = Some(if observed > 0.0 {
                    (observed * cfg.adaptive_shrink_factor).clamp(shortest, longest)
                } else {
                    base
                });
            }
            t.last_change_time = now;
            if descriptor.capture_once {
                t.dormant = true;
            }
        } else if cfg.adaptive_frequency {
            let idle = now - t.last_change_time;
            if idle > cfg.adaptive_idle_secs {
                let slowest = 1.0 / cfg.adaptive_min_update_hz;
                let ramp = ((idle - cfg.adaptive_idle_secs) / cfg.adaptive_ramp_secs).min(1.0);
                let from = t.adaptive_interval.unwrap_or(base);
                t.adaptive_interval = Some(if slowest > from {
                    from + (slowest - from) * ramp
                } else {
                    from
                });
            }
        }
        let interval = if cfg.adaptive_frequency {
            t.adaptive_interval.unwrap_or(base)
        } else {
            base
        };
        t.next_update_time = now + interval;
    }

    fn attach_aux(&mut self, frame: &mut Frame) {
        for (handle, data) in std::mem::take(&mut self.aux) {
            if data.is_empty() {
                continue;
            }
            match self.identity.lookup(handle) {
                Some(id) => frame.aux.push(AuxBlock { id, data }),
                None => tracing::debug!(handle = handle.0, "dropping aux data for unrecorded object"),
            }
        }
    }

    // ── Checkpoints ────────────────────────────────────────────────

    fn checkpoint_due(&self, now: f64) -> bool {
        if !self.checkpoints.enabled {
            return false;
        }
        if self.checkpoint_requested {
            return true;
        }
        match self.last_checkpoint {
            Some(last) => now - last + TIME_TOLERANCE >= self.checkpoints.interval_secs,
            None if self.checkpoints.checkpoint_at_start => true,
            None => now + TIME_TOLERANCE >= self.checkpoints.interval_secs,
        }
    }

    fn begin_checkpoint(&mut self, live: &[ObjectHandle]) {
        let stream_offset = self.backend.available_bytes();
        tracing::debug!(
            stream_offset,
            objects = live.len(),
            at = self.elapsed,
            "checkpoint started"
        );
        self.checkpoint_requested = false;
        self.checkpoint = Some(CheckpointWork {
            stream_offset,
            pending: live.iter().copied().collect(),
            packets: Vec::new(),
            objects: 0,
            ticks: 0,
        });
    }

    /// Capture checkpoint objects within this tick's budget. Returns
    /// `true` once every object has been captured.
    fn advance_checkpoint(
        &mut self,
        sim: &mut dyn Simulation,
        now: f64,
        frame: &mut Frame,
        captured: &mut HashSet<ObjectHandle>,
    ) -> Result<bool, SessionError> {
        let Some(mut work) = self.checkpoint.take() else {
            return Ok(false);
        };
        work.ticks += 1;
        let budget_ms = self.checkpoints.max_ms_per_tick;
        let phase_start = self.clock.now();
        let mut this_tick = 0u32;
        while let Some(&handle) = work.pending.front() {
            if budget_ms > 0.0
                && this_tick > 0
                && ms_since(self.clock.as_ref(), phase_start) >= budget_ms
            {
                break;
            }
            work.pending.pop_front();
            let Some(c) = self.capture(sim, handle, CaptureMode::Full)? else {
                continue;
            };
            frame.packets.push(encode_packet(&c.frame_packet())?);
            work.packets.push(encode_packet(&c.announcement())?);
            self.schedule(handle, now, true, &c.descriptor);
            captured.insert(handle);
            work.objects += 1;
            this_tick += 1;
        }
        let spent = micros(self.clock.now().saturating_sub(phase_start));
        self.metrics.max_checkpoint_tick_us = self.metrics.max_checkpoint_tick_us.max(spent);
        let done = work.pending.is_empty();
        self.checkpoint = Some(work);
        Ok(done)
    }

    fn finalize_checkpoint(&mut self, sim: &dyn Simulation, now: f64) -> Result<(), SessionError> {
        let Some(work) = self.checkpoint.take() else {
            return Ok(());
        };
        let mut frame = Frame::idle(self.level, now);
        frame.packets = work.packets;
        let checkpoint = Checkpoint {
            level: self.level,
            deleted: self.deleted.clone(),
            identity: self.identity.snapshot(|h| sim.object(h).is_some()),
            schemas: sim.schemas().iter().cloned().collect(),
            frame,
        };
        let bytes =
            self.writer
                .write_checkpoint(self.backend.as_mut(), &checkpoint, work.stream_offset)?;
        self.last_checkpoint = Some(now);

        let time_ms = seconds_to_ms(now);
        self.metrics.checkpoints_written += 1;
        self.metrics.last_checkpoint_bytes = bytes;
        self.metrics.last_checkpoint_objects = work.objects;
        self.metrics.last_checkpoint_ticks = work.ticks;
        self.events
            .push(SessionEvent::CheckpointWritten { time_ms, bytes });
        tracing::info!(
            time_ms,
            bytes,
            objects = work.objects,
            ticks = work.ticks,
            deleted = checkpoint.deleted.len(),
            "checkpoint written"
        );
        Ok(())
    }

    fn abandon_checkpoint(&mut self) {
        if self.checkpoint.take().is_some() {
            tracing::debug!("in-progress checkpoint abandoned");
        }
        if self.backend.checkpoint_buffer_len() > 0 {
            self.backend.discard_checkpoint();
        }
    }

    // ── Failure handling ───────────────────────────────────────────

    fn ensure_recording(&self, operation: &'static str) -> Result<(), SessionError> {
        if self.state == RecorderState::Recording {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                operation,
                state: self.state.name(),
            })
        }
    }

    /// Stop recording on a fatal error and pass the result through.
    fn check<T>(&mut self, result: Result<T, SessionError>) -> Result<T, SessionError> {
        if let Err(e) = &result {
            if e.is_fatal() {
                tracing::error!(error = %e, at = self.elapsed, "recording failed");
                self.abandon_checkpoint();
                self.state = RecorderState::Failed;
                if let Err(stop) = self.backend.stop() {
                    tracing::warn!(error = %stop, "stream did not stop cleanly");
                }
                self.events.push(SessionEvent::Fatal {
                    reason: e.to_string(),
                });
            }
        }
        result
    }
}

fn ms_since(clock: &dyn Clock, start: Duration) -> f64 {
    clock.now().saturating_sub(start).as_secs_f64() * 1000.0
}

/// Encoded size of `captured`'s announcement if it exceeds
/// [`MAX_PACKET_BYTES`]. The announcement is the largest packet the
/// capture can produce.
fn oversized(captured: &Captured) -> Result<Option<usize>, SessionError> {
    let pathname = captured.descriptor.pathname.as_ref().map_or(0, String::len);
    if captured.bytes.len() + pathname + PACKET_OVERHEAD <= MAX_PACKET_BYTES {
        return Ok(None);
    }
    let size = encode_packet(&captured.announcement())?.len();
    Ok((size > MAX_PACKET_BYTES).then_some(size))
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_core::{FieldValue, OpenMode, StreamStore, SystemClock};
    use rewind_replay::codec::{decode_checkpoint, decode_packet};
    use rewind_replay::{FramePoll, MemoryStore, StreamReader};
    use rewind_test_utils::fixtures::{arena_world, COUNTER, PAWN};
    use rewind_test_utils::{ManualClock, MockWorld};

    fn recorder(store: &MemoryStore, world: &MockWorld, config: SessionConfig) -> Recorder {
        recorder_with_clock(store, world, config, Arc::new(SystemClock::new()))
    }

    fn recorder_with_clock(
        store: &MemoryStore,
        world: &MockWorld,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Recorder {
        let backend = store.open_or_create("rec", OpenMode::Record).unwrap();
        Recorder::new(backend, world, &config, clock).unwrap()
    }

    fn fast_config() -> SessionConfig {
        let mut config = SessionConfig::default();
        config.record.max_record_hz = 10.0;
        config
    }

    fn frames(store: &MemoryStore) -> Vec<Frame> {
        let play = store.open_or_create("rec", OpenMode::Playback).unwrap();
        let mut reader = StreamReader::new();
        let mut out = Vec::new();
        while let FramePoll::Frame(f) = reader.next_frame(play.as_ref()).unwrap() {
            out.push(f);
        }
        out
    }

    fn packets(frame: &Frame) -> Vec<ObjectPacket> {
        frame
            .packets
            .iter()
            .map(|p| decode_packet(p).unwrap())
            .collect()
    }

    #[test]
    fn first_tick_binds_everything_and_checkpoints() {
        let store = MemoryStore::new();
        let mut world = arena_world();
        let mut rec = recorder(&store, &world, fast_config());
        rec.tick(&mut world, 0.1).unwrap();

        assert_eq!(store.checkpoint_times("rec"), vec![0]);
        let first = &frames(&store)[0];
        let binds = packets(first)
            .into_iter()
            .filter(|p| matches!(p, ObjectPacket::Bind { .. }))
            .count();
        assert_eq!(binds, 3);
        assert_eq!(rec.metrics().last_checkpoint_objects, 3);
        assert!(matches!(
            rec.drain_events().as_slice(),
            [SessionEvent::CheckpointWritten { time_ms: 0, .. }]
        ));
    }

    #[test]
    fn unchanged_objects_produce_idle_frames() {
        let store = MemoryStore::new();
        let mut world = arena_world();
        let mut rec = recorder(&store, &world, fast_config());
        for _ in 0..3 {
            rec.tick(&mut world, 0.1).unwrap();
        }
        let all = frames(&store);
        assert_eq!(all.len(), 3);
        assert!(all[1].is_idle());
        assert!(all[2].is_idle());
    }

    #[test]
    fn changed_field_is_sent_as_update() {
        let store = MemoryStore::new();
        let mut world = arena_world();
        let counter = world.find_persistent("Arena.Counter").unwrap();
        let mut rec = recorder(&store, &world, fast_config());
        rec.tick(&mut world, 0.1).unwrap();
        world.set(counter, "value", FieldValue::Int(7));
        rec.tick(&mut world, 0.1).unwrap();

        let second = packets(&frames(&store)[1]);
        assert_eq!(second.len(), 1);
        assert!(matches!(
            &second[0],
            ObjectPacket::Update { id, .. } if *id == PersistentId::stable("Arena.Counter")
        ));
    }

    #[test]
    fn cadence_is_clamped_to_max_record_hz() {
        let store = MemoryStore::new();
        let mut world = arena_world();
        let counter = world.find_persistent("Arena.Counter").unwrap();
        let mut config = SessionConfig::default();
        config.record.max_record_hz = 2.0;
        let mut rec = recorder(&store, &world, config);
        for i in 0..10 {
            world.set(counter, "value", FieldValue::Int(i));
            rec.tick(&mut world, 0.1).unwrap();
        }
        let updates = frames(&store)
            .iter()
            .filter(|f| !f.packets.is_empty())
            .count();
        // t=0 (bind), then one capture every 0.5s.
        assert_eq!(updates, 2);
    }

    #[test]
    fn destroyed_persistent_object_joins_deleted_set() {
        let store = MemoryStore::new();
        let mut world = arena_world();
        let mut config = fast_config();
        config.checkpoint.interval_secs = 0.2;
        let mut rec = recorder(&store, &world, config);
        rec.tick(&mut world, 0.1).unwrap();
        let door = world.find_persistent("Arena.Door_2").unwrap();
        world.destroy(door);
        rec.tick(&mut world, 0.1).unwrap();
        rec.tick(&mut world, 0.1).unwrap();

        let all = frames(&store);
        assert!(packets(&all[1])
            .iter()
            .any(|p| matches!(p, ObjectPacket::Destroy { .. })));

        let mut play = store.open_or_create("rec", OpenMode::Playback).unwrap();
        play.request_checkpoint_at(200).unwrap();
        let rewind_core::CheckpointPoll::Ready(data) = play.poll_checkpoint() else {
            panic!("checkpoint not ready");
        };
        let cp = decode_checkpoint(&data.bytes).unwrap();
        assert!(cp.deleted.contains(&PersistentId::stable("Arena.Door_2")));
        assert_eq!(cp.identity.len(), 2);
    }

    #[test]
    fn capture_once_objects_go_dormant_until_reactivated() {
        let store = MemoryStore::new();
        let mut world = arena_world();
        let pawn = world.spawn_tagged(PAWN, "scout");
        world.obj_mut(pawn).descriptor.capture_once = true;
        let mut rec = recorder(&store, &world, fast_config());
        rec.tick(&mut world, 0.1).unwrap();
        world.set(pawn, "health", FieldValue::Int(5));
        rec.tick(&mut world, 0.1).unwrap();
        assert!(frames(&store)[1].is_idle());

        rec.reactivate(pawn);
        rec.tick(&mut world, 0.1).unwrap();
        assert_eq!(frames(&store)[2].packets.len(), 1);
    }

    #[test]
    fn distant_objects_fall_back_to_slow_rate() {
        let store = MemoryStore::new();
        let mut world = arena_world();
        world.set_viewers(vec![[0.0, 0.0, 0.0]]);
        let mut config = fast_config();
        config.record.use_relevancy = true;
        config.record.cull_distance = 5.0;
        config.record.relevant_timeout = 0.0;
        config.record.record_hz_when_not_relevant = 1.0;
        let mut rec = recorder(&store, &world, config);
        // Door_2 sits at x=10, outside the cull distance.
        let door = world.find_persistent("Arena.Door_2").unwrap();
        for i in 0..10 {
            world.set(door, "angle", FieldValue::Float(f64::from(i)));
            rec.tick(&mut world, 0.1).unwrap();
        }
        let door_id = PersistentId::stable("Arena.Door_2");
        let door_frames = frames(&store)
            .iter()
            .filter(|f| packets(f).iter().any(|p| p.id() == door_id))
            .count();
        // Captured by the start checkpoint only; the retry lands after 1s.
        assert_eq!(door_frames, 1);
    }

    #[test]
    fn capture_budget_defers_lower_priority_objects() {
        let store = MemoryStore::new();
        let clock = ManualClock::new();
        let mut world = arena_world();
        world.set_capture_cost(&clock, Duration::from_millis(2));
        let mut config = fast_config();
        config.record.max_desired_record_time_ms = 3.0;
        config.checkpoint.enabled = false;
        let mut rec = recorder_with_clock(&store, &world, config, Arc::new(clock.clone()));
        rec.tick(&mut world, 0.1).unwrap();
        assert_eq!(rec.metrics().last_tick_captures, 2);
        assert_eq!(rec.metrics().last_tick_deferred, 1);
    }

    #[test]
    fn aux_data_and_streaming_levels_ride_the_next_frame() {
        let store = MemoryStore::new();
        let mut world = arena_world();
        let counter = world.find_persistent("Arena.Counter").unwrap();
        let mut rec = recorder(&store, &world, fast_config());
        rec.tick(&mut world, 0.1).unwrap();
        rec.queue_aux_data(counter, b"score:3".to_vec());
        rec.queue_streaming_level("Arena_Audio", "Arena_Audio_Night");
        rec.tick(&mut world, 0.1).unwrap();

        let second = &frames(&store)[1];
        assert_eq!(second.aux.len(), 1);
        assert_eq!(second.aux[0].data, b"score:3");
        assert_eq!(second.streaming_levels[0].package_to_load, "Arena_Audio_Night");
    }

    #[test]
    fn paused_recorder_writes_nothing_and_holds_time() {
        let store = MemoryStore::new();
        let mut world = arena_world();
        let mut rec = recorder(&store, &world, fast_config());
        rec.tick(&mut world, 0.1).unwrap();
        rec.pause();
        rec.tick(&mut world, 0.1).unwrap();
        assert_eq!(frames(&store).len(), 1);
        rec.resume();
        rec.tick(&mut world, 0.1).unwrap();
        let all = frames(&store);
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].elapsed, 0.1);
    }

    #[test]
    fn append_failure_is_fatal_and_stops_recording() {
        let store = MemoryStore::new();
        let mut world = arena_world();
        let mut rec = recorder(&store, &world, fast_config());
        rec.tick(&mut world, 0.1).unwrap();
        store.fail_appends("rec", "disk full");
        let err = rec.tick(&mut world, 0.1).unwrap_err();
        assert!(matches!(err, SessionError::StreamFatal { .. }));
        assert_eq!(rec.state(), RecorderState::Failed);
        assert!(matches!(
            rec.drain_events().last(),
            Some(SessionEvent::Fatal { .. })
        ));
        assert!(matches!(
            rec.tick(&mut world, 0.1),
            Err(SessionError::InvalidState { .. })
        ));
    }

    #[test]
    fn dynamic_objects_spawn_once_then_update() {
        let store = MemoryStore::new();
        let mut world = arena_world();
        let mut rec = recorder(&store, &world, fast_config());
        rec.tick(&mut world, 0.1).unwrap();
        let c = world.spawn_dynamic(COUNTER);
        rec.tick(&mut world, 0.1).unwrap();
        world.set(c, "value", FieldValue::Int(2));
        rec.tick(&mut world, 0.1).unwrap();

        let all = frames(&store);
        assert!(matches!(packets(&all[1])[0], ObjectPacket::Spawn { .. }));
        assert!(matches!(packets(&all[2])[0], ObjectPacket::Update { .. }));
    }
}

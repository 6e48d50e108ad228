//! Playback pipeline.
//!
//! A [`Player`] reads frames ahead of the playback clock into a
//! [`PlaybackPacketQueue`] and applies them once they are due. Seeks,
//! skips and live-edge jumps run as [`ReplayTask`]s, one step per tick,
//! while steady playback is suspended.
//!
//! A seek is checkpoint load plus fast-forward:
//!
//! 1. Request the nearest checkpoint at or before the target and poll it
//!    across ticks.
//! 2. Reconcile the world against it: keep preserved objects, diff
//!    persistent objects in place, destroy dynamic ones, roll back
//!    deletions, restore the identity table.
//! 3. Apply the checkpoint's frame, then every stream frame up to the
//!    target, with reactions deferred and flushed once per object.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexSet;
use rewind_core::{
    CheckpointData, CheckpointPoll, ClassId, Clock, LevelIndex, ObjectHandle, PersistentId,
    ReactionMode, Simulation, SimulationError, SpawnRequest, StreamBackend, Transform,
};
use rewind_replay::codec::{decode_checkpoint, decode_packet};
use rewind_replay::{
    ms_to_seconds, seconds_to_ms, Checkpoint, Frame, FramePoll, IdentityCache, IdentityFlags,
    IdentityRecord, ObjectPacket, StreamHeader, StreamReader,
};

use crate::config::{ConfigError, PlaybackConfig, SessionConfig};
use crate::error::SessionError;
use crate::event::SessionEvent;
use crate::metrics::PlaybackMetrics;
use crate::packets::PlaybackPacketQueue;
use crate::task::{ActiveTask, ReplayTask, TaskQueue, TaskStep};

/// What the player is doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackState {
    /// Applying frames as the playback clock reaches them.
    Streaming,
    /// Holding the current time.
    Paused,
    /// Waiting for a checkpoint.
    Seeking,
    /// Matching the world to a loaded checkpoint.
    Reconciling,
    /// Applying frames up to a seek or skip target.
    FastForwarding,
    /// Played a finished stream to its end.
    Finished,
    /// Stopped by a fatal error.
    Failed,
    /// Stopped by the host.
    Stopped,
}

impl PlaybackState {
    fn name(self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Paused => "paused",
            Self::Seeking => "seeking",
            Self::Reconciling => "reconciling",
            Self::FastForwarding => "fast-forwarding",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

/// Enough to respawn a persistent object the stream destroyed, should a
/// seek land before its destruction.
#[derive(Clone, Debug)]
struct RollbackEntry {
    class: ClassId,
    pathname: String,
    transform: Transform,
}

/// Deferred reactions collected while fast-forwarding, flushed once per
/// object.
type Deferred = IndexSet<ObjectHandle>;

/// Slack when comparing accumulated frame times against a target.
const TIME_TOLERANCE: f64 = 1e-6;

// ── Player ─────────────────────────────────────────────────────────

/// Replays a stream into a simulation.
pub struct Player {
    config: PlaybackConfig,
    clock: Arc<dyn Clock>,
    backend: Box<dyn StreamBackend>,
    reader: StreamReader,
    header: StreamHeader,
    identity: IdentityCache,
    ignored: HashSet<PersistentId>,
    packets: PlaybackPacketQueue,
    tasks: TaskQueue<ReplayTask>,
    state: PlaybackState,
    time: f64,
    level: Option<LevelIndex>,
    speed: f64,
    paused: bool,
    at_end: bool,
    end_reported: bool,
    rollback: BTreeMap<PersistentId, RollbackEntry>,
    metrics: PlaybackMetrics,
    events: Vec<SessionEvent>,
}

impl fmt::Debug for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Player")
            .field("state", &self.state)
            .field("time", &self.time)
            .field("level", &self.level)
            .field("speed", &self.speed)
            .field("buffered", &self.packets.len())
            .finish_non_exhaustive()
    }
}

impl Player {
    /// Open a stream for playback into `sim`.
    pub fn open(
        backend: Box<dyn StreamBackend>,
        sim: &dyn Simulation,
        config: &SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SessionError> {
        let header = StreamReader::read_header(backend.as_ref())?;
        let local = sim.schemas().version();
        if header.schema_version != local {
            tracing::warn!(
                recorded = header.schema_version,
                local,
                "schema version differs from the recording"
            );
        }
        tracing::info!(
            levels = header.levels.len(),
            duration_ms = backend.total_duration_ms(),
            live = backend.is_live(),
            "playback started"
        );
        Ok(Self {
            config: config.playback.clone(),
            clock,
            backend,
            reader: StreamReader::new(),
            header,
            identity: IdentityCache::new(),
            ignored: HashSet::new(),
            packets: PlaybackPacketQueue::new(),
            tasks: TaskQueue::new(),
            state: PlaybackState::Streaming,
            time: 0.0,
            level: None,
            speed: 1.0,
            paused: false,
            at_end: false,
            end_reported: false,
            rollback: BTreeMap::new(),
            metrics: PlaybackMetrics::default(),
            events: Vec::new(),
        })
    }

    // ── Accessors ──────────────────────────────────────────────────

    /// Current state.
    pub fn state(&self) -> PlaybackState {
        self.state
    }

    /// Playback time in seconds.
    pub fn current_time(&self) -> f64 {
        self.time
    }

    /// Recorded duration in seconds. Grows while the stream is live.
    pub fn total_duration(&self) -> f64 {
        ms_to_seconds(self.backend.total_duration_ms())
    }

    /// Whether the stream is still being recorded.
    pub fn is_live(&self) -> bool {
        self.backend.is_live()
    }

    /// Level segment of the last applied frame.
    pub fn level(&self) -> Option<LevelIndex> {
        self.level
    }

    /// Stream header as last read.
    pub fn header(&self) -> &StreamHeader {
        &self.header
    }

    /// Playback speed multiplier.
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Whether the playback clock is held.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Whether a seek, skip or live-edge jump is queued or running.
    pub fn is_busy(&self) -> bool {
        self.tasks.is_busy()
    }

    /// Identity records of objects seen so far.
    pub fn identity(&self) -> &IdentityCache {
        &self.identity
    }

    /// Counters.
    pub fn metrics(&self) -> &PlaybackMetrics {
        &self.metrics
    }

    /// Take the events produced since the last call.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    // ── Host controls ──────────────────────────────────────────────

    /// Seek to `seconds`, clamped to the recorded range.
    ///
    /// Ignored with a failed [`SessionEvent::GotoFinished`] while another
    /// seek is queued or running.
    pub fn goto(&mut self, seconds: f64) -> Result<(), SessionError> {
        self.ensure_running("seek")?;
        let seconds = if seconds.is_nan() { 0.0 } else { seconds };
        if !self.tasks.push(ReplayTask::goto(seconds)) {
            self.metrics.requests_coalesced += 1;
            tracing::debug!(target = seconds, "seek already pending; request dropped");
            self.events.push(SessionEvent::GotoFinished {
                success: false,
                time: self.time,
            });
        }
        Ok(())
    }

    /// Move playback by `seconds`. Backward skips become seeks.
    pub fn skip(&mut self, seconds: f64) -> Result<(), SessionError> {
        self.ensure_running("skip")?;
        if seconds.is_nan() {
            return Ok(());
        }
        if seconds < 0.0 {
            return self.goto(self.time + seconds);
        }
        if !self.tasks.push(ReplayTask::skip(seconds)) {
            self.metrics.requests_coalesced += 1;
            tracing::debug!(delta = seconds, "skip already pending; request dropped");
        }
        Ok(())
    }

    /// Seek near the live edge once the recording is seen to advance.
    pub fn jump_to_live(&mut self) -> Result<(), SessionError> {
        self.ensure_running("jump to live")?;
        if !self.tasks.push(ReplayTask::jump_to_live()) {
            self.metrics.requests_coalesced += 1;
        }
        Ok(())
    }

    /// Hold the playback clock.
    pub fn pause(&mut self) {
        self.paused = true;
        if self.state == PlaybackState::Streaming {
            self.state = PlaybackState::Paused;
        }
    }

    /// Release the playback clock.
    pub fn resume(&mut self) {
        self.paused = false;
        if self.state == PlaybackState::Paused {
            self.state = PlaybackState::Streaming;
        }
    }

    /// Set the playback speed multiplier.
    pub fn set_speed(&mut self, speed: f64) -> Result<(), SessionError> {
        if !speed.is_finite() || speed <= 0.0 {
            return Err(ConfigError::NonPositive {
                name: "speed",
                value: speed,
            }
            .into());
        }
        self.speed = speed;
        Ok(())
    }

    /// Drop every queued task. A seek that had not finished is undone.
    pub fn clear_tasks(&mut self) {
        if let Some(ReplayTask::GotoTime {
            previous: Some(previous),
            ..
        }) = self.tasks.clear()
        {
            self.time = previous;
            self.events.push(SessionEvent::GotoFinished {
                success: false,
                time: previous,
            });
        }
        self.backend.cancel_checkpoint_request();
        if matches!(
            self.state,
            PlaybackState::Seeking | PlaybackState::Reconciling | PlaybackState::FastForwarding
        ) {
            self.state = self.steady_state();
        }
    }

    /// Stop playback. Idempotent.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        if matches!(self.state, PlaybackState::Stopped | PlaybackState::Failed) {
            return Ok(());
        }
        self.clear_tasks();
        self.packets.clear();
        self.state = PlaybackState::Stopped;
        self.backend.stop()?;
        tracing::info!(
            at = self.time,
            frames = self.metrics.frames_applied,
            "playback stopped"
        );
        Ok(())
    }

    // ── Tick ───────────────────────────────────────────────────────

    /// Advance playback by `dt` seconds of host time.
    ///
    /// While a task is queued it runs one step instead and the playback
    /// clock holds.
    pub fn tick(&mut self, sim: &mut dyn Simulation, dt: f64) -> Result<(), SessionError> {
        self.ensure_running("tick")?;
        let result = if self.tasks.is_busy() {
            self.run_task(sim)
        } else if self.state == PlaybackState::Finished {
            Ok(())
        } else {
            self.stream(sim, dt)
        };
        if let Err(e) = &result {
            if e.is_fatal() {
                self.fail(e);
            }
        }
        result
    }

    fn stream(&mut self, sim: &mut dyn Simulation, dt: f64) -> Result<(), SessionError> {
        if self.paused {
            self.state = PlaybackState::Paused;
            return Ok(());
        }
        self.state = PlaybackState::Streaming;
        let step = dt * self.speed;
        self.time += step;
        self.fill_buffer()?;

        let mut scratch = Deferred::new();
        while let Some(frame) = self.packets.pop_due(self.time + TIME_TOLERANCE) {
            if !self.enter_level(sim, frame.level)? {
                self.packets.push_front(frame);
                break;
            }
            self.apply_frame(sim, &frame, ReactionMode::Immediate, &mut scratch)?;
        }
        self.metrics.buffered_frames = self.packets.len();

        if self.at_end && self.packets.is_empty() && !self.backend.is_live() {
            self.time = self.time.min(self.total_duration());
            if !self.end_reported {
                self.end_reported = true;
                self.state = PlaybackState::Finished;
                tracing::info!(at = self.time, "end of stream");
                self.events.push(SessionEvent::EndOfStream);
            }
        }
        sim.tick(step);
        Ok(())
    }

    /// Decode frames until `max_buffer_seconds` lie beyond the clock.
    fn fill_buffer(&mut self) -> Result<(), SessionError> {
        while self.packets.horizon(self.time) <= self.config.max_buffer_seconds {
            match self.reader.next_frame(self.backend.as_ref())? {
                FramePoll::Frame(frame) => self.packets.push(frame)?,
                FramePoll::Waiting => break,
                FramePoll::EndOfStream => {
                    self.at_end = true;
                    break;
                }
            }
        }
        Ok(())
    }

    // ── Tasks ──────────────────────────────────────────────────────

    fn run_task(&mut self, sim: &mut dyn Simulation) -> Result<(), SessionError> {
        let Some(mut active) = self.tasks.begin() else {
            return Ok(());
        };
        let step = self.step_task(sim, &mut active);
        match step {
            Ok(step) => {
                self.tasks.finish(active, step);
                Ok(())
            }
            Err(e) => {
                self.tasks.finish(active, TaskStep::Done { next: None });
                Err(e)
            }
        }
    }

    fn step_task(
        &mut self,
        sim: &mut dyn Simulation,
        active: &mut ActiveTask<ReplayTask>,
    ) -> Result<TaskStep<ReplayTask>, SessionError> {
        let starting = active.is_starting();
        match &mut active.task {
            ReplayTask::GotoTime { target, previous } => {
                self.step_goto(sim, target, previous, starting)
            }
            ReplayTask::SkipTime { delta, target } => self.step_skip(sim, *delta, target),
            ReplayTask::JumpToLive {
                initial_total_ms,
                started_at,
            } => Ok(self.step_jump(initial_total_ms, started_at, starting)),
        }
    }

    fn step_goto(
        &mut self,
        sim: &mut dyn Simulation,
        target: &mut f64,
        previous: &mut Option<f64>,
        starting: bool,
    ) -> Result<TaskStep<ReplayTask>, SessionError> {
        if starting {
            *previous = Some(self.time);
            *target = self.clamp_time(*target);
            self.state = PlaybackState::Seeking;
            tracing::debug!(target = *target, from = self.time, "seek started");
            if let Err(e) = self.backend.request_checkpoint_at(seconds_to_ms(*target)) {
                self.goto_failed(*previous, &e.to_string());
                return Ok(TaskStep::Done { next: None });
            }
        }
        match self.backend.poll_checkpoint() {
            CheckpointPoll::Pending => Ok(TaskStep::Pending),
            CheckpointPoll::Idle => {
                if let Err(e) = self.backend.request_checkpoint_at(seconds_to_ms(*target)) {
                    self.goto_failed(*previous, &e.to_string());
                    return Ok(TaskStep::Done { next: None });
                }
                Ok(TaskStep::Pending)
            }
            CheckpointPoll::Failed { reason } => {
                self.goto_failed(*previous, &reason);
                Ok(TaskStep::Done { next: None })
            }
            CheckpointPoll::Ready(data) => {
                self.load_checkpoint(sim, data, *target)?;
                Ok(TaskStep::Done { next: None })
            }
        }
    }

    fn goto_failed(&mut self, previous: Option<f64>, reason: &str) {
        if let Some(previous) = previous {
            self.time = previous;
        }
        self.state = self.steady_state();
        self.metrics.gotos_failed += 1;
        tracing::warn!(reason, restored = self.time, "seek failed");
        self.events.push(SessionEvent::GotoFinished {
            success: false,
            time: self.time,
        });
    }

    fn step_skip(
        &mut self,
        sim: &mut dyn Simulation,
        delta: f64,
        target: &mut Option<f64>,
    ) -> Result<TaskStep<ReplayTask>, SessionError> {
        let goal = match *target {
            Some(goal) => goal,
            None => {
                let goal = self.clamp_time(self.time + delta).max(self.time);
                *target = Some(goal);
                self.backend
                    .set_priority_range(seconds_to_ms(self.time), seconds_to_ms(goal));
                tracing::debug!(from = self.time, to = goal, "skip started");
                goal
            }
        };
        self.state = PlaybackState::FastForwarding;
        let started = self.clock.now();
        let mut deferred = Deferred::new();
        let mut frames = 0u32;
        let mut blocked = false;
        while let Some(frame) = self.packets.pop_due(goal + TIME_TOLERANCE) {
            if !self.enter_level(sim, frame.level)? {
                self.packets.push_front(frame);
                blocked = true;
                break;
            }
            self.apply_frame(sim, &frame, ReactionMode::Deferred, &mut deferred)?;
            frames += 1;
        }
        let mut waiting = blocked;
        if !blocked && self.packets.is_empty() {
            let (applied, dry) = self.fast_forward(sim, goal, &mut deferred)?;
            frames += applied;
            waiting = dry;
        }
        self.flush_reactions(sim, &deferred);
        if waiting && self.backend.is_live() {
            // The goal lies past what the live recorder has published.
            self.metrics.last_fast_forward_frames = frames;
            return Ok(TaskStep::Pending);
        }
        self.time = goal;
        self.state = self.steady_state();
        self.metrics.last_fast_forward_frames = frames;
        self.metrics.last_fast_forward_us = micros_since(self.clock.as_ref(), started);
        Ok(TaskStep::Done { next: None })
    }

    fn step_jump(
        &mut self,
        initial_total_ms: &mut Option<u64>,
        started_at: &mut Option<Duration>,
        starting: bool,
    ) -> TaskStep<ReplayTask> {
        if starting {
            if !self.backend.is_live() {
                tracing::debug!("stream is not live; nothing to jump to");
                return TaskStep::Done { next: None };
            }
            *initial_total_ms = Some(self.backend.total_duration_ms());
            *started_at = Some(self.clock.now());
            return TaskStep::Pending;
        }
        let total = self.backend.total_duration_ms();
        let moved = Some(total) != *initial_total_ms;
        let timed_out = started_at
            .is_some_and(|s| self.clock.now().saturating_sub(s) >= self.config.live_edge_timeout);
        if !moved && !timed_out {
            return TaskStep::Pending;
        }
        if !moved {
            tracing::warn!(total_ms = total, "live edge did not advance; jumping to last known end");
        }
        let target = total.saturating_sub(self.config.live_edge_buffer_ms);
        TaskStep::Done {
            next: Some(ReplayTask::goto(ms_to_seconds(target))),
        }
    }

    // ── Seeking ────────────────────────────────────────────────────

    fn clamp_time(&self, seconds: f64) -> f64 {
        let end = (self.total_duration() - self.config.end_epsilon).max(0.0);
        if seconds.is_nan() {
            0.0
        } else {
            seconds.clamp(0.0, end)
        }
    }

    fn load_checkpoint(
        &mut self,
        sim: &mut dyn Simulation,
        data: CheckpointData,
        target: f64,
    ) -> Result<(), SessionError> {
        let started = self.clock.now();
        self.state = PlaybackState::Reconciling;
        let mut deferred = Deferred::new();
        if data.bytes.is_empty() {
            self.restart(sim)?;
        } else {
            let checkpoint = decode_checkpoint(&data.bytes)?;
            if !self.enter_level(sim, checkpoint.level)? {
                return Err(SessionError::fatal(format!(
                    "checkpoint level {} is not in the header",
                    checkpoint.level
                )));
            }
            self.reconcile(sim, &checkpoint)?;
            self.apply_frame(sim, &checkpoint.frame, ReactionMode::Deferred, &mut deferred)?;
        }
        self.reader.seek(data.stream_offset);
        self.packets.clear();
        self.at_end = false;
        self.end_reported = false;

        self.state = PlaybackState::FastForwarding;
        let (frames, _) = self.fast_forward(sim, target, &mut deferred)?;
        self.flush_reactions(sim, &deferred);
        self.time = target;
        self.state = self.steady_state();

        self.metrics.gotos_completed += 1;
        self.metrics.last_fast_forward_frames = frames;
        self.metrics.last_fast_forward_us = micros_since(self.clock.as_ref(), started);
        tracing::info!(
            target,
            checkpoint_ms = data.time_ms,
            fast_forward_ms = data.extra_skip_ms,
            frames,
            "seek finished"
        );
        self.events.push(SessionEvent::GotoFinished {
            success: true,
            time: target,
        });
        Ok(())
    }

    /// Reload the first level for a seek that precedes every checkpoint.
    fn restart(&mut self, sim: &mut dyn Simulation) -> Result<(), SessionError> {
        let Some(first) = self.header.levels.first().map(|l| l.name.clone()) else {
            return Err(SessionError::fatal("stream header lists no levels"));
        };
        sim.load_level(&first).map_err(level_failure(&first))?;
        self.prune_identity(sim);
        self.rollback.clear();
        self.ignored.clear();
        if self.level != Some(LevelIndex(0)) {
            self.level = Some(LevelIndex(0));
            self.events.push(SessionEvent::LevelChanged {
                index: LevelIndex(0),
                name: first,
            });
        }
        Ok(())
    }

    /// Bring the live world in line with `checkpoint`.
    fn reconcile(
        &mut self,
        sim: &mut dyn Simulation,
        checkpoint: &Checkpoint,
    ) -> Result<(), SessionError> {
        let handles = sim.enumerate_capturable();

        // Preserved objects and everything they own survive untouched.
        let mut preserved: HashSet<ObjectHandle> = handles
            .iter()
            .copied()
            .filter(|h| sim.object(*h).is_some_and(|o| o.is_always_preserved_across_seek()))
            .collect();
        loop {
            let owned: Vec<ObjectHandle> = handles
                .iter()
                .copied()
                .filter(|h| !preserved.contains(h))
                .filter(|h| {
                    sim.object(*h)
                        .and_then(|o| o.descriptor().owner)
                        .is_some_and(|owner| preserved.contains(&owner))
                })
                .collect();
            if owned.is_empty() {
                break;
            }
            preserved.extend(owned);
        }
        let kept: Vec<IdentityRecord> = self
            .identity
            .iter()
            .filter(|r| r.handle.is_some_and(|h| preserved.contains(&h)))
            .map(|r| IdentityRecord {
                flags: IdentityFlags {
                    no_load: true,
                    ..r.flags
                },
                ..r.clone()
            })
            .collect();

        let classes: HashSet<ClassId> = checkpoint.schemas.iter().map(|s| s.class).collect();
        let recorded: HashSet<PersistentId> = checkpoint
            .identity
            .iter()
            .filter(|r| classes.contains(&r.class))
            .map(|r| r.id)
            .collect();

        let (mut destroyed, mut respawned) = (0u32, 0u32);
        for handle in handles {
            if preserved.contains(&handle) {
                continue;
            }
            let Some(descriptor) = sim.object(handle).map(|o| o.descriptor()) else {
                continue;
            };
            let Some(pathname) = descriptor.pathname else {
                sim.destroy(handle);
                destroyed += 1;
                continue;
            };
            let id = PersistentId::stable(&pathname);
            if checkpoint.deleted.contains(&id) {
                sim.destroy(handle);
                self.rollback.insert(
                    id,
                    RollbackEntry {
                        class: descriptor.class,
                        pathname,
                        transform: descriptor.transform,
                    },
                );
                destroyed += 1;
            } else if !recorded.contains(&id) {
                // Unknown to the checkpoint: start it over from defaults.
                sim.destroy(handle);
                sim.spawn(SpawnRequest {
                    class: descriptor.class,
                    pathname: Some(pathname),
                    transform: descriptor.transform,
                    owner: None,
                })
                .map_err(spawn_failure)?;
                respawned += 1;
            }
        }

        let revived: Vec<PersistentId> = self
            .rollback
            .keys()
            .filter(|id| !checkpoint.deleted.contains(id))
            .copied()
            .collect();
        for id in revived {
            let Some(entry) = self.rollback.remove(&id) else {
                continue;
            };
            if sim.find_persistent(&entry.pathname).is_none() {
                sim.spawn(SpawnRequest {
                    class: entry.class,
                    pathname: Some(entry.pathname),
                    transform: entry.transform,
                    owner: None,
                })
                .map_err(spawn_failure)?;
                respawned += 1;
            }
        }

        let report = self.identity.restore(&checkpoint.identity, sim.schemas())?;
        if !report.skipped.is_empty() {
            tracing::warn!(
                skipped = report.skipped.len(),
                "ignoring recorded objects whose class layout changed"
            );
        }
        self.ignored = report.skipped.into_iter().collect();
        let bindable: Vec<(PersistentId, String)> = self
            .identity
            .iter()
            .filter(|r| !r.flags.no_load)
            .filter_map(|r| r.pathname.clone().map(|p| (r.id, p)))
            .collect();
        for (id, pathname) in bindable {
            if let Some(handle) = sim.find_persistent(&pathname) {
                self.identity.bind(id, handle);
            }
        }
        for record in kept {
            self.identity.insert(record);
        }
        tracing::debug!(
            destroyed,
            respawned,
            restored = report.restored,
            "world reconciled with checkpoint"
        );
        Ok(())
    }

    /// Apply stream frames up to and including `target`. The first later
    /// frame is buffered for steady playback.
    /// Apply stream frames up to `target`. Returns the frames applied and
    /// whether the reader ran out of published data before reaching it.
    fn fast_forward(
        &mut self,
        sim: &mut dyn Simulation,
        target: f64,
        deferred: &mut Deferred,
    ) -> Result<(u32, bool), SessionError> {
        let mut frames = 0;
        loop {
            let frame = match self.reader.next_frame(self.backend.as_ref())? {
                FramePoll::Frame(frame) => frame,
                FramePoll::Waiting => return Ok((frames, true)),
                FramePoll::EndOfStream => {
                    self.at_end = true;
                    break;
                }
            };
            if frame.elapsed > target + TIME_TOLERANCE {
                self.packets.push(frame)?;
                break;
            }
            if !self.enter_level(sim, frame.level)? {
                self.packets.push_front(frame);
                return Ok((frames, true));
            }
            self.apply_frame(sim, &frame, ReactionMode::Deferred, deferred)?;
            frames += 1;
        }
        Ok((frames, false))
    }

    fn flush_reactions(&self, sim: &mut dyn Simulation, deferred: &Deferred) {
        for &handle in deferred {
            if let Some(obj) = sim.object_mut(handle) {
                obj.flush_reactions();
            }
        }
    }

    // ── Frame application ──────────────────────────────────────────

    /// Make `index` the active level, loading it if needed. `Ok(false)`
    /// when a live stream has not published the level yet.
    fn enter_level(
        &mut self,
        sim: &mut dyn Simulation,
        index: LevelIndex,
    ) -> Result<bool, SessionError> {
        if self.header.level(index).is_none() {
            self.header = StreamReader::read_header(self.backend.as_ref())?;
        }
        let Some(name) = self.header.level(index).map(|l| l.name.clone()) else {
            if self.backend.is_live() {
                return Ok(false);
            }
            return Err(SessionError::fatal(format!(
                "frame refers to level {index} missing from the header"
            )));
        };
        if sim.current_level() != name {
            sim.load_level(&name).map_err(level_failure(&name))?;
            self.prune_identity(sim);
        }
        if self.level != Some(index) {
            self.level = Some(index);
            tracing::info!(level = %name, index = index.0, "entered level");
            self.events.push(SessionEvent::LevelChanged { index, name });
        }
        Ok(true)
    }

    /// Forget records whose objects a level load destroyed.
    fn prune_identity(&mut self, sim: &dyn Simulation) {
        let gone: Vec<PersistentId> = self
            .identity
            .iter()
            .filter(|r| r.handle.is_none_or(|h| sim.object(h).is_none()))
            .map(|r| r.id)
            .collect();
        for id in gone {
            self.identity.remove(id);
        }
    }

    fn live_handle(&self, sim: &dyn Simulation, id: PersistentId) -> Option<ObjectHandle> {
        self.identity
            .resolve(id)
            .filter(|h| sim.object(*h).is_some())
    }

    fn apply_frame(
        &mut self,
        sim: &mut dyn Simulation,
        frame: &Frame,
        reactions: ReactionMode,
        deferred: &mut Deferred,
    ) -> Result<(), SessionError> {
        for level in &frame.streaming_levels {
            sim.stream_level(&level.package, &level.package_to_load);
        }
        for bytes in &frame.packets {
            let packet = decode_packet(bytes)?;
            if self.ignored.contains(&packet.id()) {
                continue;
            }
            self.apply_packet(sim, packet, reactions, deferred)?;
            self.metrics.packets_applied += 1;
        }
        for block in &frame.aux {
            if let Some(handle) = self.live_handle(sim, block.id) {
                sim.receive_aux_data(handle, &block.data);
            }
        }
        self.metrics.frames_applied += 1;
        Ok(())
    }

    fn apply_packet(
        &mut self,
        sim: &mut dyn Simulation,
        packet: ObjectPacket,
        reactions: ReactionMode,
        deferred: &mut Deferred,
    ) -> Result<(), SessionError> {
        match packet {
            ObjectPacket::Spawn {
                id,
                owner,
                class,
                transform,
                state,
            } => {
                let handle = match self.live_handle(sim, id) {
                    Some(handle) => handle,
                    None => {
                        let owner_handle = owner.and_then(|o| self.live_handle(sim, o));
                        let handle = sim
                            .spawn(SpawnRequest {
                                class,
                                pathname: None,
                                transform,
                                owner: owner_handle,
                            })
                            .map_err(spawn_failure)?;
                        self.identity.insert(IdentityRecord {
                            id,
                            owner,
                            class,
                            pathname: None,
                            schema_checksum: sim.schemas().checksum_of(class).unwrap_or(0),
                            flags: IdentityFlags::default(),
                            handle: Some(handle),
                        });
                        handle
                    }
                };
                apply_state(sim, handle, &state, reactions, deferred)
            }
            ObjectPacket::Bind {
                id,
                owner,
                class,
                pathname,
                state,
            } => {
                let handle = match self.live_handle(sim, id) {
                    Some(handle) => handle,
                    None => {
                        let handle = match sim.find_persistent(&pathname) {
                            Some(handle) => handle,
                            None => sim
                                .spawn(SpawnRequest {
                                    class,
                                    pathname: Some(pathname.clone()),
                                    transform: Transform::default(),
                                    owner: None,
                                })
                                .map_err(spawn_failure)?,
                        };
                        self.rollback.remove(&id);
                        self.identity.insert(IdentityRecord {
                            id,
                            owner,
                            class,
                            pathname: Some(pathname),
                            schema_checksum: sim.schemas().checksum_of(class).unwrap_or(0),
                            flags: IdentityFlags::default(),
                            handle: Some(handle),
                        });
                        handle
                    }
                };
                apply_state(sim, handle, &state, reactions, deferred)
            }
            ObjectPacket::Update { id, delta } => match self.live_handle(sim, id) {
                Some(handle) => apply_state(sim, handle, &delta, reactions, deferred),
                None => {
                    tracing::trace!(%id, "update for unbound object skipped");
                    Ok(())
                }
            },
            ObjectPacket::Destroy { id } => {
                if let Some(handle) = self.live_handle(sim, id) {
                    if let Some(descriptor) = sim.object(handle).map(|o| o.descriptor()) {
                        if let Some(pathname) = descriptor.pathname {
                            self.rollback.insert(
                                id,
                                RollbackEntry {
                                    class: descriptor.class,
                                    pathname,
                                    transform: descriptor.transform,
                                },
                            );
                        }
                    }
                    sim.destroy(handle);
                }
                self.identity.remove(id);
                Ok(())
            }
        }
    }

    // ── Failure handling ───────────────────────────────────────────

    fn steady_state(&self) -> PlaybackState {
        if self.paused {
            PlaybackState::Paused
        } else {
            PlaybackState::Streaming
        }
    }

    fn ensure_running(&self, operation: &'static str) -> Result<(), SessionError> {
        match self.state {
            PlaybackState::Failed | PlaybackState::Stopped => Err(SessionError::InvalidState {
                operation,
                state: self.state.name(),
            }),
            _ => Ok(()),
        }
    }

    fn fail(&mut self, error: &SessionError) {
        tracing::error!(error = %error, at = self.time, "playback failed");
        self.tasks.clear();
        self.backend.cancel_checkpoint_request();
        self.packets.clear();
        self.state = PlaybackState::Failed;
        self.events.push(SessionEvent::Fatal {
            reason: error.to_string(),
        });
    }
}

fn apply_state(
    sim: &mut dyn Simulation,
    handle: ObjectHandle,
    bytes: &[u8],
    reactions: ReactionMode,
    deferred: &mut Deferred,
) -> Result<(), SessionError> {
    let Some(obj) = sim.object_mut(handle) else {
        return Ok(());
    };
    obj.apply_delta(bytes, reactions)?;
    if reactions == ReactionMode::Deferred {
        deferred.insert(handle);
    }
    Ok(())
}

fn spawn_failure(e: SimulationError) -> SessionError {
    SessionError::fatal(format!("spawn failed: {e}"))
}

fn level_failure(name: &str) -> impl FnOnce(SimulationError) -> SessionError + '_ {
    move |e| SessionError::fatal(format!("loading level '{name}' failed: {e}"))
}

fn micros_since(clock: &dyn Clock, start: Duration) -> u64 {
    u64::try_from(clock.now().saturating_sub(start).as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_core::{FieldValue, OpenMode, StreamStore, SystemClock};
    use rewind_replay::MemoryStore;
    use rewind_test_utils::fixtures::arena_world;
    use rewind_test_utils::MockWorld;

    use crate::record::Recorder;

    fn record_counter(store: &MemoryStore, ticks: u32) {
        let mut world = arena_world();
        let counter = world.find_persistent("Arena.Counter").unwrap();
        let mut config = SessionConfig::default();
        config.record.max_record_hz = 10.0;
        config.checkpoint.interval_secs = 1.0;
        let backend = store.open_or_create("p", OpenMode::Record).unwrap();
        let mut rec =
            Recorder::new(backend, &world, &config, Arc::new(SystemClock::new())).unwrap();
        for i in 0..ticks {
            world.set(counter, "value", FieldValue::Int(i64::from(i)));
            rec.tick(&mut world, 0.1).unwrap();
        }
        rec.stop().unwrap();
    }

    fn player(store: &MemoryStore, world: &MockWorld) -> Player {
        let backend = store.open_or_create("p", OpenMode::Playback).unwrap();
        Player::open(
            backend,
            world,
            &SessionConfig::default(),
            Arc::new(SystemClock::new()),
        )
        .unwrap()
    }

    fn counter(world: &MockWorld) -> Option<FieldValue> {
        world.get_path("Arena.Counter", "value")
    }

    #[test]
    fn streaming_applies_frames_as_time_passes() {
        let store = MemoryStore::new();
        record_counter(&store, 20);
        let mut world = arena_world();
        let mut p = player(&store, &world);
        p.tick(&mut world, 0.0).unwrap();
        assert_eq!(counter(&world), Some(FieldValue::Int(0)));
        for _ in 0..5 {
            p.tick(&mut world, 0.1).unwrap();
        }
        assert_eq!(counter(&world), Some(FieldValue::Int(5)));
        assert!(matches!(
            p.drain_events().first(),
            Some(SessionEvent::LevelChanged { .. })
        ));
    }

    #[test]
    fn finished_stream_reports_end_once() {
        let store = MemoryStore::new();
        record_counter(&store, 5);
        let mut world = arena_world();
        let mut p = player(&store, &world);
        for _ in 0..20 {
            p.tick(&mut world, 0.1).unwrap();
        }
        assert_eq!(p.state(), PlaybackState::Finished);
        let ends = p
            .drain_events()
            .iter()
            .filter(|e| **e == SessionEvent::EndOfStream)
            .count();
        assert_eq!(ends, 1);
        assert_eq!(counter(&world), Some(FieldValue::Int(4)));
    }

    #[test]
    fn paused_player_holds_time() {
        let store = MemoryStore::new();
        record_counter(&store, 10);
        let mut world = arena_world();
        let mut p = player(&store, &world);
        p.tick(&mut world, 0.1).unwrap();
        p.pause();
        p.tick(&mut world, 0.1).unwrap();
        assert_eq!(p.current_time(), 0.1);
        assert_eq!(p.state(), PlaybackState::Paused);
        p.resume();
        p.tick(&mut world, 0.1).unwrap();
        assert!((p.current_time() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn speed_must_be_positive() {
        let store = MemoryStore::new();
        record_counter(&store, 3);
        let world = arena_world();
        let mut p = player(&store, &world);
        assert!(matches!(
            p.set_speed(0.0),
            Err(SessionError::Config(ConfigError::NonPositive { .. }))
        ));
        p.set_speed(2.0).unwrap();
        assert_eq!(p.speed(), 2.0);
    }

    #[test]
    fn goto_lands_on_target_state() {
        let store = MemoryStore::new();
        record_counter(&store, 30);
        let mut world = arena_world();
        let mut p = player(&store, &world);
        p.goto(1.5).unwrap();
        p.tick(&mut world, 0.1).unwrap();
        assert!(!p.is_busy());
        assert_eq!(p.current_time(), 1.5);
        assert_eq!(counter(&world), Some(FieldValue::Int(15)));
        assert!(p.drain_events().contains(&SessionEvent::GotoFinished {
            success: true,
            time: 1.5
        }));
    }

    #[test]
    fn second_goto_while_pending_is_coalesced() {
        let store = MemoryStore::new();
        record_counter(&store, 30);
        store.set_checkpoint_latency(2);
        let mut world = arena_world();
        let mut p = player(&store, &world);
        p.goto(2.0).unwrap();
        p.goto(0.5).unwrap();
        assert_eq!(p.metrics().requests_coalesced, 1);
        for _ in 0..3 {
            p.tick(&mut world, 0.1).unwrap();
        }
        assert_eq!(p.current_time(), 2.0);
        let events = p.drain_events();
        assert_eq!(
            events.first(),
            Some(&SessionEvent::GotoFinished {
                success: false,
                time: 0.0
            })
        );
    }

    #[test]
    fn clearing_a_pending_goto_restores_time() {
        let store = MemoryStore::new();
        record_counter(&store, 30);
        store.set_checkpoint_latency(5);
        let mut world = arena_world();
        let mut p = player(&store, &world);
        for _ in 0..3 {
            p.tick(&mut world, 0.1).unwrap();
        }
        let before = p.current_time();
        p.goto(2.5).unwrap();
        p.tick(&mut world, 0.1).unwrap();
        assert_eq!(p.state(), PlaybackState::Seeking);
        p.clear_tasks();
        assert_eq!(p.current_time(), before);
        assert_eq!(p.state(), PlaybackState::Streaming);
        assert!(!p.is_busy());
    }
}

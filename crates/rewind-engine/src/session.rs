//! Host-facing session: one recorder or one player at a time.

use std::fmt;
use std::sync::Arc;

use rewind_core::{Clock, OpenMode, Simulation, StreamStore, SystemClock};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::event::SessionEvent;
use crate::playback::Player;
use crate::record::Recorder;

enum Mode {
    Idle,
    Recording(Recorder),
    Playing(Player),
}

impl Mode {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Recording(_) => "recording",
            Self::Playing(_) => "playing",
        }
    }
}

/// Records a simulation into, or plays it back from, a [`StreamStore`].
///
/// ```
/// use rewind_engine::{Session, SessionConfig};
/// use rewind_replay::MemoryStore;
/// use rewind_test_utils::fixtures::arena_world;
///
/// let store = MemoryStore::new();
/// let mut world = arena_world();
/// let mut session = Session::new(store.clone(), SessionConfig::default()).unwrap();
///
/// session.record("match", &world).unwrap();
/// for _ in 0..10 {
///     session.tick(&mut world, 0.1).unwrap();
/// }
/// session.stop().unwrap();
///
/// session.play("match", &world).unwrap();
/// session.goto(0.5).unwrap();
/// session.tick(&mut world, 0.1).unwrap();
/// assert_eq!(session.current_time(), 0.5);
/// ```
pub struct Session<S: StreamStore> {
    store: S,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    mode: Mode,
    events: Vec<SessionEvent>,
}

impl<S: StreamStore> fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Session");
        d.field("mode", &self.mode.name());
        match &self.mode {
            Mode::Recording(r) => d.field("recorder", r),
            Mode::Playing(p) => d.field("player", p),
            Mode::Idle => &mut d,
        };
        d.finish_non_exhaustive()
    }
}

impl<S: StreamStore> Session<S> {
    /// A session timed by the system clock.
    pub fn new(store: S, config: SessionConfig) -> Result<Self, SessionError> {
        Self::with_clock(store, config, Arc::new(SystemClock::new()))
    }

    /// A session timed by `clock`.
    pub fn with_clock(
        store: S,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            clock,
            mode: Mode::Idle,
            events: Vec::new(),
        })
    }

    /// Start recording `sim` into the stream `name`.
    pub fn record(&mut self, name: &str, sim: &dyn Simulation) -> Result<(), SessionError> {
        self.ensure_idle("start recording")?;
        let backend = self
            .store
            .open_or_create(name, OpenMode::Record)
            .map_err(SessionError::Unavailable)?;
        let recorder = Recorder::new(backend, sim, &self.config, Arc::clone(&self.clock))?;
        self.mode = Mode::Recording(recorder);
        Ok(())
    }

    /// Start playing the stream `name` into `sim`.
    pub fn play(&mut self, name: &str, sim: &dyn Simulation) -> Result<(), SessionError> {
        self.ensure_idle("start playback")?;
        let backend = self
            .store
            .open_or_create(name, OpenMode::Playback)
            .map_err(SessionError::Unavailable)?;
        let player = Player::open(backend, sim, &self.config, Arc::clone(&self.clock))?;
        self.mode = Mode::Playing(player);
        Ok(())
    }

    /// Stop recording or playback and return to idle.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        let result = match &mut self.mode {
            Mode::Idle => return Ok(()),
            Mode::Recording(r) => {
                let result = r.stop();
                self.events.extend(r.drain_events());
                result
            }
            Mode::Playing(p) => {
                let result = p.stop();
                self.events.extend(p.drain_events());
                result
            }
        };
        self.mode = Mode::Idle;
        result
    }

    /// Advance the active recorder or player by `dt` seconds.
    pub fn tick(&mut self, sim: &mut dyn Simulation, dt: f64) -> Result<(), SessionError> {
        match &mut self.mode {
            Mode::Idle => Ok(()),
            Mode::Recording(r) => r.tick(sim, dt),
            Mode::Playing(p) => p.tick(sim, dt),
        }
    }

    /// Seek playback to `seconds`.
    pub fn goto(&mut self, seconds: f64) -> Result<(), SessionError> {
        self.player_for("seek")?.goto(seconds)
    }

    /// Move playback by `seconds`.
    pub fn skip(&mut self, seconds: f64) -> Result<(), SessionError> {
        self.player_for("skip")?.skip(seconds)
    }

    /// Seek near the live edge of a stream still being recorded.
    pub fn jump_to_live(&mut self) -> Result<(), SessionError> {
        self.player_for("jump to live")?.jump_to_live()
    }

    /// Set the playback speed multiplier.
    pub fn set_speed(&mut self, speed: f64) -> Result<(), SessionError> {
        self.player_for("set the speed")?.set_speed(speed)
    }

    /// Pause recording or playback.
    pub fn pause(&mut self) {
        match &mut self.mode {
            Mode::Idle => {}
            Mode::Recording(r) => r.pause(),
            Mode::Playing(p) => p.pause(),
        }
    }

    /// Resume after [`pause`](Self::pause).
    pub fn resume(&mut self) {
        match &mut self.mode {
            Mode::Idle => {}
            Mode::Recording(r) => r.resume(),
            Mode::Playing(p) => p.resume(),
        }
    }

    /// Stream time: the next frame's time while recording, the playback
    /// clock while playing, zero when idle.
    pub fn current_time(&self) -> f64 {
        match &self.mode {
            Mode::Idle => 0.0,
            Mode::Recording(r) => r.elapsed(),
            Mode::Playing(p) => p.current_time(),
        }
    }

    /// Take every event produced since the last call.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut events = std::mem::take(&mut self.events);
        match &mut self.mode {
            Mode::Idle => {}
            Mode::Recording(r) => events.extend(r.drain_events()),
            Mode::Playing(p) => events.extend(p.drain_events()),
        }
        events
    }

    /// Whether a recorder is active.
    pub fn is_recording(&self) -> bool {
        matches!(self.mode, Mode::Recording(_))
    }

    /// Whether a player is active.
    pub fn is_playing(&self) -> bool {
        matches!(self.mode, Mode::Playing(_))
    }

    /// The active recorder.
    pub fn recorder(&self) -> Option<&Recorder> {
        match &self.mode {
            Mode::Recording(r) => Some(r),
            _ => None,
        }
    }

    /// The active recorder, mutably.
    pub fn recorder_mut(&mut self) -> Option<&mut Recorder> {
        match &mut self.mode {
            Mode::Recording(r) => Some(r),
            _ => None,
        }
    }

    /// The active player.
    pub fn player(&self) -> Option<&Player> {
        match &self.mode {
            Mode::Playing(p) => Some(p),
            _ => None,
        }
    }

    /// The active player, mutably.
    pub fn player_mut(&mut self) -> Option<&mut Player> {
        match &mut self.mode {
            Mode::Playing(p) => Some(p),
            _ => None,
        }
    }

    /// Settings in effect.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn ensure_idle(&self, operation: &'static str) -> Result<(), SessionError> {
        match self.mode {
            Mode::Idle => Ok(()),
            ref mode => Err(SessionError::InvalidState {
                operation,
                state: mode.name(),
            }),
        }
    }

    fn player_for(&mut self, operation: &'static str) -> Result<&mut Player, SessionError> {
        match &mut self.mode {
            Mode::Playing(p) => Ok(p),
            mode => Err(SessionError::InvalidState {
                operation,
                state: mode.name(),
            }),
        }
    }
}

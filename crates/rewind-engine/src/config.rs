//! Session configuration, validation, and error types.
//!
//! [`SessionConfig`] bundles the recording, checkpoint and playback
//! settings. [`validate()`](SessionConfig::validate) checks them once when
//! a session is created; nothing re-validates per tick.

use std::time::Duration;

// ── RecordConfig ───────────────────────────────────────────────────

/// Capture cadence and relevance settings for the recorder.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordConfig {
    /// Upper clamp on an object's capture frequency. `0` disables the
    /// clamp. Default: 8.
    pub max_record_hz: f64,
    /// Lower clamp on an object's capture frequency. Default: 0.
    pub min_record_hz: f64,
    /// Retry frequency for objects that are neither relevant nor recently
    /// relevant. `0` stops capturing them. Default: 2.
    pub record_hz_when_not_relevant: f64,
    /// Filter objects by distance to the simulation's viewers.
    /// Default: false.
    pub use_relevancy: bool,
    /// Viewer distance beyond which an object is not relevant.
    /// Default: 15000.
    pub cull_distance: f64,
    /// Seconds an object stays relevant after it was last in range.
    /// Default: 5.
    pub relevant_timeout: f64,
    /// Stretch the interval of objects that keep producing no changes.
    /// Default: false.
    pub adaptive_frequency: bool,
    /// Slowest frequency adaptive stretching reaches. Default: 2.
    pub adaptive_min_update_hz: f64,
    /// Seconds without changes before stretching begins. Default: 2.
    pub adaptive_idle_secs: f64,
    /// Seconds over which the interval is stretched to its slowest.
    /// Default: 5.
    pub adaptive_ramp_secs: f64,
    /// Fraction of the observed change interval adopted after a capture
    /// with changes. Default: 0.7.
    pub adaptive_shrink_factor: f64,
    /// Per-tick capture budget in milliseconds. `0` is unbounded.
    /// Default: 0.
    pub max_desired_record_time_ms: f64,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            max_record_hz: 8.0,
            min_record_hz: 0.0,
            record_hz_when_not_relevant: 2.0,
            use_relevancy: false,
            cull_distance: 15_000.0,
            relevant_timeout: 5.0,
            adaptive_frequency: false,
            adaptive_min_update_hz: 2.0,
            adaptive_idle_secs: 2.0,
            adaptive_ramp_secs: 5.0,
            adaptive_shrink_factor: 0.7,
            max_desired_record_time_ms: 0.0,
        }
    }
}

impl RecordConfig {
    /// Capture interval in seconds for a desired frequency, after
    /// clamping. Infinite when the clamped frequency is not positive.
    pub fn interval_for(&self, update_hz: f64) -> f64 {
        let mut hz = update_hz.max(self.min_record_hz);
        if self.max_record_hz > 0.0 {
            hz = hz.min(self.max_record_hz);
        }
        if hz > 0.0 {
            1.0 / hz
        } else {
            f64::INFINITY
        }
    }

    /// Bounds on the capture interval implied by the frequency clamps.
    pub(crate) fn interval_bounds(&self) -> (f64, f64) {
        let shortest = if self.max_record_hz > 0.0 {
            1.0 / self.max_record_hz
        } else {
            0.0
        };
        let longest = if self.min_record_hz > 0.0 {
            1.0 / self.min_record_hz
        } else {
            f64::INFINITY
        };
        (shortest, longest)
    }
}

// ── CheckpointConfig ───────────────────────────────────────────────

/// When and how checkpoints are produced.
#[derive(Clone, Debug, PartialEq)]
pub struct CheckpointConfig {
    /// Produce checkpoints at all. Default: true.
    pub enabled: bool,
    /// Seconds of stream time between checkpoints. Default: 30.
    pub interval_secs: f64,
    /// Per-tick capture budget for an in-progress checkpoint, in
    /// milliseconds. `0` captures the whole checkpoint in one tick.
    /// Default: 0.
    pub max_ms_per_tick: f64,
    /// Write a checkpoint on the first recorded tick. Default: true.
    pub checkpoint_at_start: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30.0,
            max_ms_per_tick: 0.0,
            checkpoint_at_start: true,
        }
    }
}

// ── PlaybackConfig ─────────────────────────────────────────────────

/// Buffering and live-edge settings for the player.
#[derive(Clone, Debug, PartialEq)]
pub struct PlaybackConfig {
    /// Seconds of frames decoded ahead of the playback clock. Default: 5.
    pub max_buffer_seconds: f64,
    /// How far behind the recorded duration a jump to the live edge
    /// lands, in milliseconds. Default: 5000.
    pub live_edge_buffer_ms: u64,
    /// How long a jump to the live edge waits for the duration to grow
    /// before using the last known value. Default: 15 s.
    pub live_edge_timeout: Duration,
    /// Seeks are clamped to `total - end_epsilon` seconds. Default: 0.01.
    pub end_epsilon: f64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            max_buffer_seconds: 5.0,
            live_edge_buffer_ms: 5_000,
            live_edge_timeout: Duration::from_secs(15),
            end_epsilon: 0.01,
        }
    }
}

// ── ConfigError ────────────────────────────────────────────────────

/// Errors detected during [`SessionConfig::validate()`].
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// A setting must be finite and non-negative.
    #[error("{name} must be finite and non-negative, got {value}")]
    Negative {
        /// Setting name.
        name: &'static str,
        /// The invalid value.
        value: f64,
    },
    /// A setting must be finite and strictly positive.
    #[error("{name} must be finite and positive, got {value}")]
    NonPositive {
        /// Setting name.
        name: &'static str,
        /// The invalid value.
        value: f64,
    },
    /// `min_record_hz` exceeds a non-zero `max_record_hz`.
    #[error("min_record_hz ({min}) exceeds max_record_hz ({max})")]
    InvertedFrequencyClamp {
        /// Configured minimum.
        min: f64,
        /// Configured maximum.
        max: f64,
    },
    /// `adaptive_shrink_factor` outside `(0, 1]`.
    #[error("adaptive_shrink_factor must be in (0, 1], got {value}")]
    InvalidShrinkFactor {
        /// The invalid value.
        value: f64,
    },
}

// ── SessionConfig ──────────────────────────────────────────────────

/// Complete configuration for a [`Session`](crate::Session).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionConfig {
    /// Recorder settings.
    pub record: RecordConfig,
    /// Checkpoint settings.
    pub checkpoint: CheckpointConfig,
    /// Player settings.
    pub playback: PlaybackConfig,
}

fn non_negative(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Negative { name, value })
    }
}

fn positive(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NonPositive { name, value })
    }
}

impl SessionConfig {
    /// Validate every setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.record;
        non_negative("max_record_hz", r.max_record_hz)?;
        non_negative("min_record_hz", r.min_record_hz)?;
        non_negative("record_hz_when_not_relevant", r.record_hz_when_not_relevant)?;
        non_negative("cull_distance", r.cull_distance)?;
        non_negative("relevant_timeout", r.relevant_timeout)?;
        non_negative("adaptive_idle_secs", r.adaptive_idle_secs)?;
        non_negative("max_desired_record_time_ms", r.max_desired_record_time_ms)?;
        if r.max_record_hz > 0.0 && r.min_record_hz > r.max_record_hz {
            return Err(ConfigError::InvertedFrequencyClamp {
                min: r.min_record_hz,
                max: r.max_record_hz,
            });
        }
        if r.adaptive_frequency {
            positive("adaptive_min_update_hz", r.adaptive_min_update_hz)?;
            positive("adaptive_ramp_secs", r.adaptive_ramp_secs)?;
            let f = r.adaptive_shrink_factor;
            if !(f.is_finite() && f > 0.0 && f <= 1.0) {
                return Err(ConfigError::InvalidShrinkFactor { value: f });
            }
        }

        let c = &self.checkpoint;
        if c.enabled {
            positive("checkpoint interval_secs", c.interval_secs)?;
        }
        non_negative("checkpoint max_ms_per_tick", c.max_ms_per_tick)?;

        let p = &self.playback;
        non_negative("max_buffer_seconds", p.max_buffer_seconds)?;
        non_negative("end_epsilon", p.end_epsilon)?;
        Ok(())
    }
}

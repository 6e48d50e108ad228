//! Recording and playback counters.
//!
//! Durations are in microseconds of [`Clock`](rewind_core::Clock) time.
//! "Last" fields describe the most recent tick or operation; the rest are
//! cumulative for the session.

/// Counters maintained by the [`Recorder`](crate::Recorder).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecordMetrics {
    /// Frames appended to the stream.
    pub frames_written: u64,
    /// Frame bytes appended, including length prefixes.
    pub bytes_written: u64,
    /// Object packets written across all frames.
    pub packets_written: u64,
    /// Objects captured during the last tick.
    pub last_tick_captures: u32,
    /// Due objects left for a later tick because the capture budget ran out.
    pub last_tick_deferred: u32,
    /// Captures dropped because their packet would exceed the size limit.
    pub oversized_captures: u64,
    /// Capture time of the last tick.
    pub last_tick_capture_us: u64,
    /// Checkpoints committed.
    pub checkpoints_written: u64,
    /// Encoded size of the last checkpoint.
    pub last_checkpoint_bytes: usize,
    /// Objects in the last checkpoint.
    pub last_checkpoint_objects: u32,
    /// Ticks spanned by the last checkpoint.
    pub last_checkpoint_ticks: u32,
    /// Longest checkpoint capture phase of any single tick.
    pub max_checkpoint_tick_us: u64,
}

/// Counters maintained by the [`Player`](crate::Player).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlaybackMetrics {
    /// Frames applied, including fast-forwarded ones.
    pub frames_applied: u64,
    /// Object packets applied.
    pub packets_applied: u64,
    /// Seeks that reached their target.
    pub gotos_completed: u64,
    /// Seeks that failed and restored the previous time.
    pub gotos_failed: u64,
    /// Requests dropped because one of the same kind was queued.
    pub requests_coalesced: u64,
    /// Frames applied by the last fast-forward.
    pub last_fast_forward_frames: u32,
    /// Duration of the last fast-forward.
    pub last_fast_forward_us: u64,
    /// Frames decoded but not yet applied.
    pub buffered_frames: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_metrics_are_zero() {
        let r = RecordMetrics::default();
        assert_eq!(r.frames_written, 0);
        assert_eq!(r.checkpoints_written, 0);
        assert_eq!(r.max_checkpoint_tick_us, 0);
        let p = PlaybackMetrics::default();
        assert_eq!(p.frames_applied, 0);
        assert_eq!(p.requests_coalesced, 0);
        assert_eq!(p.buffered_frames, 0);
    }
}

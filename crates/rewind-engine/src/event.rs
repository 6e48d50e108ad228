//! Events reported to the host, drained with
//! [`Session::drain_events`](crate::Session::drain_events).

use rewind_core::LevelIndex;

/// Something the host may want to react to.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// A seek finished. On failure `time` is the restored previous time.
    GotoFinished {
        /// Whether the seek reached its target.
        success: bool,
        /// Playback time after the seek, in seconds.
        time: f64,
    },
    /// Playback entered a different level segment.
    LevelChanged {
        /// Index in the stream header.
        index: LevelIndex,
        /// Level name.
        name: String,
    },
    /// A finished stream was played to its end.
    EndOfStream,
    /// The recorder committed a checkpoint.
    CheckpointWritten {
        /// Checkpoint time.
        time_ms: u64,
        /// Encoded size.
        bytes: usize,
    },
    /// The session hit an unrecoverable error.
    Fatal {
        /// Human-readable reason.
        reason: String,
    },
}

//! Errors surfaced by recording and playback sessions.

use rewind_core::{DeltaError, SimulationError, StreamError};
use rewind_replay::ReplayError;

use crate::config::ConfigError;

/// Errors returned by [`Session`](crate::Session), [`Recorder`](crate::Recorder)
/// and [`Player`](crate::Player).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    /// The stream back-end failed. The session is aborted.
    #[error("stream fatal: {reason}")]
    StreamFatal {
        /// Human-readable reason for the host.
        reason: String,
    },

    /// A frame or checkpoint could not be decoded. Playback is aborted.
    #[error("frame corrupt: {detail}")]
    FrameCorrupt {
        /// What was wrong.
        detail: String,
    },

    /// Opening a stream failed; the session is unchanged.
    #[error("stream unavailable: {0}")]
    Unavailable(StreamError),

    /// Invalid configuration or argument.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The operation does not apply in the current state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        /// Operation attempted.
        operation: &'static str,
        /// State the session was in.
        state: &'static str,
    },

    /// The simulation refused a request.
    #[error("simulation: {0}")]
    Simulation(#[from] SimulationError),
}

impl SessionError {
    /// Whether the error ends the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StreamFatal { .. } | Self::FrameCorrupt { .. })
    }

    pub(crate) fn fatal(reason: impl Into<String>) -> Self {
        Self::StreamFatal {
            reason: reason.into(),
        }
    }
}

impl From<ReplayError> for SessionError {
    fn from(e: ReplayError) -> Self {
        match e {
            ReplayError::FrameCorrupt { .. }
            | ReplayError::InvalidMagic
            | ReplayError::UnsupportedVersion { .. }
            | ReplayError::OutOfOrder { .. } => Self::FrameCorrupt {
                detail: e.to_string(),
            },
            // Size limits are only enforced while encoding.
            ReplayError::PacketTooLarge { .. }
            | ReplayError::Io(_)
            | ReplayError::SchemaMismatch { .. }
            | ReplayError::Stream(_) => Self::StreamFatal {
                reason: e.to_string(),
            },
        }
    }
}

impl From<StreamError> for SessionError {
    fn from(e: StreamError) -> Self {
        Self::StreamFatal {
            reason: e.to_string(),
        }
    }
}

impl From<DeltaError> for SessionError {
    fn from(e: DeltaError) -> Self {
        Self::FrameCorrupt {
            detail: e.to_string(),
        }
    }
}

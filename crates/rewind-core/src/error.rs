//! Error types raised by collaborators and by the delta codec.

use crate::id::{ClassId, FieldId};

/// Errors reported by a [`StreamBackend`](crate::StreamBackend).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StreamError {
    /// The requested byte range has not been written yet.
    ///
    /// Only live streams report this; the caller retries on a later tick.
    #[error("requested range is not yet available")]
    NotYetAvailable,

    /// The stream is already open for writing by another session.
    #[error("stream '{name}' is busy")]
    Busy {
        /// Stream name.
        name: String,
    },

    /// No stream with this name exists.
    #[error("stream '{name}' not found")]
    NotFound {
        /// Stream name.
        name: String,
    },

    /// The handle was used after [`stop`](crate::StreamBackend::stop).
    #[error("stream handle is stopped")]
    Stopped,

    /// Unrecoverable back-end failure.
    #[error("stream failure: {reason}")]
    Fatal {
        /// Human-readable reason from the back-end.
        reason: String,
    },
}

/// Errors raised while encoding or decoding a schema-driven delta.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeltaError {
    /// The delta ended before all announced fields were read.
    #[error("delta truncated: {detail}")]
    Truncated {
        /// What was being read.
        detail: String,
    },

    /// A field id that is not part of the class schema.
    #[error("field {field} is not declared by class {class}")]
    UnknownField {
        /// Class whose schema was consulted.
        class: ClassId,
        /// Offending field id.
        field: FieldId,
    },

    /// A value whose variant does not match the field's codec.
    #[error("field {field} of class {class} holds a value its codec cannot encode")]
    CodecMismatch {
        /// Class whose schema was consulted.
        class: ClassId,
        /// Offending field id.
        field: FieldId,
    },

    /// Bytes left over after the last announced field.
    #[error("{remaining} trailing bytes after delta")]
    TrailingBytes {
        /// Number of unread bytes.
        remaining: usize,
    },

    /// Text field bytes were not valid UTF-8.
    #[error("field {field} is not valid UTF-8")]
    InvalidText {
        /// Offending field id.
        field: FieldId,
    },
}

/// Errors reported by a [`Simulation`](crate::Simulation).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SimulationError {
    /// The simulation has no class with this id.
    #[error("unknown class {0}")]
    UnknownClass(ClassId),

    /// The simulation has no level with this name.
    #[error("unknown level '{0}'")]
    UnknownLevel(String),

    /// Any other refusal, with a reason.
    #[error("{0}")]
    Rejected(String),
}

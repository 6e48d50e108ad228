//! Error types for stream encoding, decoding, and identity restore.

use rewind_core::{ClassId, PersistentId, StreamError};

/// Errors that can occur while reading or writing a recording.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// An I/O error from the underlying reader or writer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame, packet, or checkpoint failed a length, checksum, or
    /// structural check.
    #[error("corrupt data: {detail}")]
    FrameCorrupt {
        /// What failed to decode.
        detail: String,
    },

    /// The header does not start with the expected magic bytes.
    #[error("invalid magic bytes (expected RWND)")]
    InvalidMagic,

    /// The header's format version is not supported by this build.
    #[error("unsupported format version {found} (expected {expected})")]
    UnsupportedVersion {
        /// The version found in the header.
        found: u8,
        /// The version this build writes.
        expected: u8,
    },

    /// A packet exceeds [`MAX_PACKET_BYTES`](crate::MAX_PACKET_BYTES).
    #[error("packet of {len} bytes exceeds the {max} byte limit")]
    PacketTooLarge {
        /// Packet length.
        len: usize,
        /// Limit.
        max: usize,
    },

    /// A frame's timestamp went backwards within one level segment.
    #[error("frame at {next}s precedes the previous frame at {previous}s")]
    OutOfOrder {
        /// Timestamp of the previous frame.
        previous: f64,
        /// Timestamp of the offending frame.
        next: f64,
    },

    /// A checkpoint identity record disagrees with this build's schema.
    #[error("identity record {id} does not match the schema of class {class}")]
    SchemaMismatch {
        /// Offending record.
        id: PersistentId,
        /// Its class.
        class: ClassId,
    },

    /// The stream back-end failed.
    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl ReplayError {
    /// Rewrite truncation (`UnexpectedEof`) as [`FrameCorrupt`](Self::FrameCorrupt).
    pub(crate) fn truncated(self, what: &str) -> Self {
        match self {
            Self::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Self::FrameCorrupt {
                detail: format!("truncated {what}"),
            },
            other => other,
        }
    }
}

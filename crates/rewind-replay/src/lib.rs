//! Stream format and identity tracking for Rewind recordings.
//!
//! A recording is an append-only stream of length-prefixed [`Frame`]s, a
//! small [`StreamHeader`] stored beside it, and a set of [`Checkpoint`]s
//! indexed by time. This crate owns the binary layout of all three, the
//! [`IdentityCache`] that maps live handles to stream-stable ids, and a
//! reference [`MemoryStore`] back-end.
//!
//! # Architecture
//!
//! - [`codec`] encodes and decodes headers, frames, packets and checkpoints
//! - [`StreamWriter`] appends frames and commits checkpoints to a back-end
//! - [`StreamReader`] walks frames, distinguishing "not yet written" from
//!   "corrupt"
//! - [`IdentityCache`] interns, snapshots and restores identity records
//! - [`MemoryStore`] is an in-process [`StreamStore`](rewind_core::StreamStore)
//!
//! # Stream container
//!
//! ```text
//! header (separate):  [MAGIC "RWND"] [VERSION u8] [schema_version u32] [levels] [blob]
//! stream:             { [u32 frame_len] [frame bytes] } *
//! checkpoint (each):  [level] [deleted ids] [identity records] [schemas] [embedded frame]
//! ```
//!
//! All I/O uses a custom little-endian binary codec.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod codec;
pub mod error;
pub mod identity;
pub mod memory;
pub mod reader;
pub mod types;
pub mod writer;

pub use error::ReplayError;
pub use identity::{IdentityCache, RestoreReport};
pub use memory::{MemoryStore, MemoryStream};
pub use reader::{FramePoll, StreamReader};
pub use types::{
    AuxBlock, Checkpoint, Frame, IdentityFlags, IdentityRecord, LevelEntry, ObjectPacket,
    StreamHeader, StreamingLevel,
};
pub use writer::StreamWriter;

/// Magic bytes at the start of every stream header.
pub const MAGIC: [u8; 4] = *b"RWND";

/// Current binary format version.
pub const FORMAT_VERSION: u8 = 1;

/// Largest object packet accepted by the frame codec.
pub const MAX_PACKET_BYTES: usize = 64 * 1024;

/// Convert seconds of stream time to whole milliseconds.
///
/// Negative and NaN inputs map to zero.
pub fn seconds_to_ms(seconds: f64) -> u64 {
    if seconds.is_nan() || seconds <= 0.0 {
        0
    } else {
        (seconds * 1000.0).round() as u64
    }
}

/// Convert milliseconds of stream time to seconds.
pub fn ms_to_seconds(ms: u64) -> f64 {
    ms as f64 / 1000.0
}

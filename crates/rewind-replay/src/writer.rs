//! Frame and checkpoint writer.
//!
//! [`StreamWriter`] appends length-prefixed frames to a
//! [`StreamBackend`] and commits checkpoints through its pending
//! checkpoint buffer. It enforces non-decreasing frame time within each
//! level segment.

use rewind_core::{LevelIndex, StreamBackend};

use crate::codec::{encode_checkpoint, encode_frame, encode_header};
use crate::error::ReplayError;
use crate::seconds_to_ms;
use crate::types::{Checkpoint, Frame, StreamHeader};

/// Checkpoint bytes are handed to the back-end in chunks of this size.
const CHECKPOINT_CHUNK: usize = 16 * 1024;

/// Appends frames and checkpoints to a stream.
///
/// # Examples
///
/// ```
/// use rewind_core::{LevelIndex, OpenMode, StreamStore};
/// use rewind_replay::{Frame, FramePoll, MemoryStore, StreamReader, StreamWriter};
///
/// let store = MemoryStore::new();
/// let mut backend = store.open_or_create("demo", OpenMode::Record).unwrap();
/// let mut writer = StreamWriter::new();
/// for i in 0..3 {
///     let frame = Frame::idle(LevelIndex(0), i as f64 * 0.5);
///     writer.write_frame(backend.as_mut(), &frame).unwrap();
/// }
/// assert_eq!(writer.frames_written(), 3);
/// backend.stop().unwrap();
///
/// let playback = store.open_or_create("demo", OpenMode::Playback).unwrap();
/// let mut reader = StreamReader::new();
/// let mut times = Vec::new();
/// while let FramePoll::Frame(f) = reader.next_frame(playback.as_ref()).unwrap() {
///     times.push(f.elapsed);
/// }
/// assert_eq!(times, vec![0.0, 0.5, 1.0]);
/// ```
#[derive(Debug, Default)]
pub struct StreamWriter {
    frames_written: u64,
    bytes_written: u64,
    checkpoints_written: u64,
    last: Option<(LevelIndex, f64)>,
}

impl StreamWriter {
    /// A writer with no frames written.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode and store the header.
    pub fn write_header(
        &mut self,
        backend: &mut dyn StreamBackend,
        header: &StreamHeader,
    ) -> Result<(), ReplayError> {
        backend.set_header_bytes(&encode_header(header)?)?;
        Ok(())
    }

    /// Append one frame, returning the bytes written including its length
    /// prefix.
    pub fn write_frame(
        &mut self,
        backend: &mut dyn StreamBackend,
        frame: &Frame,
    ) -> Result<u64, ReplayError> {
        if let Some((level, previous)) = self.last {
            if level == frame.level && frame.elapsed < previous {
                return Err(ReplayError::OutOfOrder {
                    previous,
                    next: frame.elapsed,
                });
            }
        }
        let body = encode_frame(frame)?;
        let mut bytes = Vec::with_capacity(body.len() + 4);
        bytes.extend_from_slice(&(body.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&body);
        backend.append_bytes(&bytes)?;

        self.last = Some((frame.level, frame.elapsed));
        self.frames_written += 1;
        self.bytes_written += bytes.len() as u64;
        Ok(bytes.len() as u64)
    }

    /// Encode `checkpoint` and commit it at its frame time, replaying from
    /// `stream_offset`.
    ///
    /// If the back-end fails part way, whatever reached its pending buffer
    /// is discarded so no partial checkpoint is ever committed.
    pub fn write_checkpoint(
        &mut self,
        backend: &mut dyn StreamBackend,
        checkpoint: &Checkpoint,
        stream_offset: u64,
    ) -> Result<usize, ReplayError> {
        let bytes = encode_checkpoint(checkpoint)?;
        let time_ms = seconds_to_ms(checkpoint.frame.elapsed);
        let committed = bytes
            .chunks(CHECKPOINT_CHUNK)
            .try_for_each(|chunk| backend.append_checkpoint_bytes(chunk))
            .and_then(|()| backend.flush_checkpoint(time_ms, stream_offset));
        if let Err(e) = committed {
            if backend.checkpoint_buffer_len() > 0 {
                backend.discard_checkpoint();
            }
            return Err(e.into());
        }
        self.checkpoints_written += 1;
        Ok(bytes.len())
    }

    /// Number of frames written.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Bytes of frame data written, including length prefixes.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Number of checkpoints committed.
    pub fn checkpoints_written(&self) -> u64 {
        self.checkpoints_written
    }
}

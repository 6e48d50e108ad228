//! Frame reader over a possibly still-growing stream.

use rewind_core::{StreamBackend, StreamError};

use crate::codec::{decode_frame, decode_header};
use crate::error::ReplayError;
use crate::types::{Frame, StreamHeader};

/// Result of [`StreamReader::next_frame`].
#[derive(Clone, Debug, PartialEq)]
pub enum FramePoll {
    /// A decoded frame.
    Frame(Frame),
    /// The next frame has not been written yet; try again later.
    Waiting,
    /// The stream is finished and fully consumed.
    EndOfStream,
}

/// Cursor over the frames of a stream.
///
/// A partially written frame on a live stream is [`FramePoll::Waiting`];
/// the same bytes on a finished stream are corrupt.
#[derive(Debug, Default)]
pub struct StreamReader {
    offset: u64,
    frames_read: u64,
}

impl StreamReader {
    /// A reader positioned at the start of the stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the stream header.
    pub fn read_header(backend: &dyn StreamBackend) -> Result<StreamHeader, ReplayError> {
        decode_header(&backend.header_bytes()?)
    }

    /// Byte offset of the next frame.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reposition at a frame boundary, e.g. a checkpoint's stream offset.
    pub fn seek(&mut self, offset: u64) {
        self.offset = offset;
    }

    /// Frames decoded so far.
    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Read the next frame.
    ///
    /// The cursor only advances past a frame once it decodes cleanly.
    pub fn next_frame(&mut self, backend: &dyn StreamBackend) -> Result<FramePoll, ReplayError> {
        let available = backend.available_bytes();
        let live = backend.is_live();

        if self.offset + 4 > available {
            return self.short_read(available, live);
        }
        let prefix = self.read(backend, self.offset, 4)?;
        let Some(prefix) = prefix else {
            return Ok(FramePoll::Waiting);
        };
        let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as u64;
        if self.offset + 4 + len > available {
            return self.short_read(available, live);
        }
        let Some(body) = self.read(backend, self.offset + 4, len as usize)? else {
            return Ok(FramePoll::Waiting);
        };
        let frame = decode_frame(&body)?;
        self.offset += 4 + len;
        self.frames_read += 1;
        Ok(FramePoll::Frame(frame))
    }

    fn short_read(&self, available: u64, live: bool) -> Result<FramePoll, ReplayError> {
        if live {
            Ok(FramePoll::Waiting)
        } else if self.offset == available {
            Ok(FramePoll::EndOfStream)
        } else {
            Err(ReplayError::FrameCorrupt {
                detail: format!(
                    "stream ends mid-frame at offset {} of {available}",
                    self.offset
                ),
            })
        }
    }

    fn read(
        &self,
        backend: &dyn StreamBackend,
        offset: u64,
        len: usize,
    ) -> Result<Option<Vec<u8>>, ReplayError> {
        match backend.read_range(offset, len) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(StreamError::NotYetAvailable) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

//! Look-ahead buffer of decoded frames awaiting application.

use std::collections::VecDeque;

use rewind_replay::Frame;

use crate::error::SessionError;

/// Ordered, time-bounded buffer of decoded [`Frame`]s.
///
/// Frames are appended in stream order. Within one level segment their
/// times must not decrease; a regression means the stream is corrupt.
#[derive(Debug, Default)]
pub struct PlaybackPacketQueue {
    frames: VecDeque<Frame>,
}

impl PlaybackPacketQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame read from the stream.
    pub fn push(&mut self, frame: Frame) -> Result<(), SessionError> {
        if let Some(last) = self.frames.back() {
            if last.level == frame.level && frame.elapsed < last.elapsed {
                return Err(SessionError::FrameCorrupt {
                    detail: format!(
                        "frame time went backwards from {} to {}",
                        last.elapsed, frame.elapsed
                    ),
                });
            }
        }
        self.frames.push_back(frame);
        Ok(())
    }

    /// Put a frame back at the head, e.g. when it cannot be applied yet.
    pub fn push_front(&mut self, frame: Frame) {
        self.frames.push_front(frame);
    }

    /// Remove the head frame if its time is at or before `time`.
    pub fn pop_due(&mut self, time: f64) -> Option<Frame> {
        if self.frames.front()?.elapsed <= time {
            self.frames.pop_front()
        } else {
            None
        }
    }

    /// Time of the newest buffered frame.
    pub fn last_time(&self) -> Option<f64> {
        self.frames.back().map(|f| f.elapsed)
    }

    /// Seconds of stream time buffered beyond `time`.
    pub fn horizon(&self, time: f64) -> f64 {
        self.last_time().map_or(0.0, |t| (t - time).max(0.0))
    }

    /// Drop every buffered frame.
    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// Number of buffered frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

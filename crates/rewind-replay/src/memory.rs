//! In-process stream back-end.
//!
//! [`MemoryStore`] keeps every stream in shared memory so a player can
//! tail a stream while a recorder in the same process is still appending
//! to it. Checkpoint loads complete on a later poll, after a configurable
//! number of pending polls, which mimics a back-end doing real I/O.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rewind_core::{CheckpointData, CheckpointPoll, OpenMode, StreamBackend, StreamError, StreamStore};

#[derive(Clone, Debug)]
struct StoredCheckpoint {
    time_ms: u64,
    stream_offset: u64,
    bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct StreamData {
    header: Vec<u8>,
    data: Vec<u8>,
    total_ms: u64,
    live: bool,
    checkpoints: Vec<StoredCheckpoint>,
    fail_appends: Option<String>,
    priority_range: Option<(u64, u64)>,
}

#[derive(Debug, Default)]
struct StoreInner {
    streams: HashMap<String, Arc<Mutex<StreamData>>>,
    checkpoint_latency: u32,
}

/// Shared, cloneable in-memory [`StreamStore`].
///
/// ```
/// use rewind_core::{OpenMode, StreamStore};
/// use rewind_replay::MemoryStore;
///
/// let store = MemoryStore::new();
/// let mut rec = store.open_or_create("match", OpenMode::Record).unwrap();
/// rec.append_bytes(b"abc").unwrap();
///
/// let play = store.open_or_create("match", OpenMode::Playback).unwrap();
/// assert!(play.is_live());
/// assert_eq!(play.read_range(1, 2).unwrap(), b"bc");
/// ```
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending polls before a checkpoint request completes, for
    /// handles opened after this call.
    pub fn set_checkpoint_latency(&self, polls: u32) {
        self.inner.lock().checkpoint_latency = polls;
    }

    /// Make every later append to `name` fail with `reason`.
    pub fn fail_appends(&self, name: &str, reason: impl Into<String>) {
        if let Some(stream) = self.stream(name) {
            stream.lock().fail_appends = Some(reason.into());
        }
    }

    /// Committed checkpoint times for `name`, in commit order.
    pub fn checkpoint_times(&self, name: &str) -> Vec<u64> {
        self.stream(name)
            .map(|s| s.lock().checkpoints.iter().map(|c| c.time_ms).collect())
            .unwrap_or_default()
    }

    /// Recorded duration of `name`.
    pub fn total_duration_ms(&self, name: &str) -> Option<u64> {
        self.stream(name).map(|s| s.lock().total_ms)
    }

    /// Advertise `ms` as the duration of `name` ahead of the frames
    /// actually written, as a remote store whose index outruns its data.
    pub fn extend_total_duration_ms(&self, name: &str, ms: u64) {
        if let Some(stream) = self.stream(name) {
            let mut data = stream.lock();
            data.total_ms = data.total_ms.max(ms);
        }
    }

    /// Last priority range hinted by a reader of `name`.
    pub fn priority_range(&self, name: &str) -> Option<(u64, u64)> {
        self.stream(name).and_then(|s| s.lock().priority_range)
    }

    /// Copy of the frame data of `name`.
    pub fn stream_bytes(&self, name: &str) -> Option<Vec<u8>> {
        self.stream(name).map(|s| s.lock().data.clone())
    }

    /// Overwrite one byte of frame data, for corruption tests.
    pub fn corrupt_byte(&self, name: &str, offset: usize) {
        if let Some(stream) = self.stream(name) {
            let mut data = stream.lock();
            if let Some(b) = data.data.get_mut(offset) {
                *b ^= 0xff;
            }
        }
    }

    fn stream(&self, name: &str) -> Option<Arc<Mutex<StreamData>>> {
        self.inner.lock().streams.get(name).cloned()
    }
}

impl StreamStore for MemoryStore {
    fn open_or_create(
        &self,
        name: &str,
        mode: OpenMode,
    ) -> Result<Box<dyn StreamBackend>, StreamError> {
        let mut inner = self.inner.lock();
        let data = match mode {
            OpenMode::Record => {
                if let Some(existing) = inner.streams.get(name) {
                    if existing.lock().live {
                        return Err(StreamError::Busy { name: name.into() });
                    }
                }
                let fresh = Arc::new(Mutex::new(StreamData {
                    live: true,
                    ..StreamData::default()
                }));
                inner.streams.insert(name.to_string(), Arc::clone(&fresh));
                fresh
            }
            OpenMode::Playback => inner
                .streams
                .get(name)
                .cloned()
                .ok_or_else(|| StreamError::NotFound { name: name.into() })?,
        };
        tracing::debug!(stream = name, ?mode, "opened memory stream");
        Ok(Box::new(MemoryStream {
            name: name.to_string(),
            mode,
            data,
            pending_checkpoint: Vec::new(),
            request: None,
            latency: inner.checkpoint_latency,
            stopped: false,
        }))
    }
}

#[derive(Debug)]
struct CheckpointRequest {
    time_ms: u64,
    polls_left: u32,
}

/// A handle on one stream of a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryStream {
    name: String,
    mode: OpenMode,
    data: Arc<Mutex<StreamData>>,
    pending_checkpoint: Vec<u8>,
    request: Option<CheckpointRequest>,
    latency: u32,
    stopped: bool,
}

impl MemoryStream {
    fn writable(&self) -> Result<(), StreamError> {
        if self.stopped {
            return Err(StreamError::Stopped);
        }
        if self.mode != OpenMode::Record {
            return Err(StreamError::Fatal {
                reason: format!("stream '{}' is open for playback", self.name),
            });
        }
        if let Some(reason) = &self.data.lock().fail_appends {
            return Err(StreamError::Fatal {
                reason: reason.clone(),
            });
        }
        Ok(())
    }
}

impl StreamBackend for MemoryStream {
    fn append_bytes(&mut self, bytes: &[u8]) -> Result<(), StreamError> {
        self.writable()?;
        self.data.lock().data.extend_from_slice(bytes);
        Ok(())
    }

    fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>, StreamError> {
        if self.stopped {
            return Err(StreamError::Stopped);
        }
        let data = self.data.lock();
        let start = usize::try_from(offset).map_err(|_| StreamError::NotYetAvailable)?;
        let end = start.checked_add(len).ok_or(StreamError::NotYetAvailable)?;
        data.data
            .get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or(StreamError::NotYetAvailable)
    }

    fn available_bytes(&self) -> u64 {
        self.data.lock().data.len() as u64
    }

    fn total_duration_ms(&self) -> u64 {
        self.data.lock().total_ms
    }

    fn update_total_duration_ms(&mut self, ms: u64) -> Result<(), StreamError> {
        self.writable()?;
        let mut data = self.data.lock();
        data.total_ms = data.total_ms.max(ms);
        Ok(())
    }

    fn is_live(&self) -> bool {
        self.data.lock().live
    }

    fn header_bytes(&self) -> Result<Vec<u8>, StreamError> {
        if self.stopped {
            return Err(StreamError::Stopped);
        }
        Ok(self.data.lock().header.clone())
    }

    fn set_header_bytes(&mut self, bytes: &[u8]) -> Result<(), StreamError> {
        self.writable()?;
        self.data.lock().header = bytes.to_vec();
        Ok(())
    }

    fn append_checkpoint_bytes(&mut self, bytes: &[u8]) -> Result<(), StreamError> {
        self.writable()?;
        self.pending_checkpoint.extend_from_slice(bytes);
        Ok(())
    }

    fn checkpoint_buffer_len(&self) -> usize {
        self.pending_checkpoint.len()
    }

    fn discard_checkpoint(&mut self) {
        self.pending_checkpoint.clear();
    }

    fn flush_checkpoint(&mut self, time_ms: u64, stream_offset: u64) -> Result<(), StreamError> {
        self.writable()?;
        let bytes = std::mem::take(&mut self.pending_checkpoint);
        let mut data = self.data.lock();
        if let Some(last) = data.checkpoints.last() {
            if last.time_ms > time_ms {
                return Err(StreamError::Fatal {
                    reason: format!(
                        "checkpoint at {time_ms}ms precedes committed checkpoint at {}ms",
                        last.time_ms
                    ),
                });
            }
        }
        data.checkpoints.push(StoredCheckpoint {
            time_ms,
            stream_offset,
            bytes,
        });
        Ok(())
    }

    fn request_checkpoint_at(&mut self, time_ms: u64) -> Result<(), StreamError> {
        if self.stopped {
            return Err(StreamError::Stopped);
        }
        self.request = Some(CheckpointRequest {
            time_ms,
            polls_left: self.latency,
        });
        Ok(())
    }

    fn poll_checkpoint(&mut self) -> CheckpointPoll {
        let Some(request) = self.request.as_mut() else {
            return CheckpointPoll::Idle;
        };
        if request.polls_left > 0 {
            request.polls_left -= 1;
            return CheckpointPoll::Pending;
        }
        let time_ms = request.time_ms;
        self.request = None;
        let data = self.data.lock();
        let found = data.checkpoints.iter().rev().find(|c| c.time_ms <= time_ms);
        CheckpointPoll::Ready(match found {
            Some(cp) => CheckpointData {
                time_ms: cp.time_ms,
                stream_offset: cp.stream_offset,
                extra_skip_ms: time_ms - cp.time_ms,
                bytes: cp.bytes.clone(),
            },
            None => CheckpointData {
                time_ms: 0,
                stream_offset: 0,
                extra_skip_ms: time_ms,
                bytes: Vec::new(),
            },
        })
    }

    fn cancel_checkpoint_request(&mut self) {
        self.request = None;
    }

    fn set_priority_range(&mut self, low_ms: u64, high_ms: u64) {
        self.data.lock().priority_range = Some((low_ms, high_ms));
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.request = None;
        self.pending_checkpoint.clear();
        if self.mode == OpenMode::Record {
            self.data.lock().live = false;
        }
        tracing::debug!(stream = %self.name, "stopped memory stream");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_recorder_is_busy_until_first_stops() {
        let store = MemoryStore::new();
        let mut first = store.open_or_create("s", OpenMode::Record).unwrap();
        assert!(matches!(
            store.open_or_create("s", OpenMode::Record),
            Err(StreamError::Busy { .. })
        ));
        first.stop().unwrap();
        assert!(store.open_or_create("s", OpenMode::Record).is_ok());
    }

    #[test]
    fn playback_of_missing_stream_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.open_or_create("nope", OpenMode::Playback),
            Err(StreamError::NotFound { .. })
        ));
    }

    #[test]
    fn reads_past_end_are_not_yet_available() {
        let store = MemoryStore::new();
        let mut rec = store.open_or_create("s", OpenMode::Record).unwrap();
        rec.append_bytes(&[1, 2, 3]).unwrap();
        let play = store.open_or_create("s", OpenMode::Playback).unwrap();
        assert_eq!(play.read_range(2, 2), Err(StreamError::NotYetAvailable));
        rec.append_bytes(&[4]).unwrap();
        assert_eq!(play.read_range(2, 2).unwrap(), vec![3, 4]);
    }

    #[test]
    fn advertised_duration_can_lead_the_data() {
        let store = MemoryStore::new();
        let mut rec = store.open_or_create("s", OpenMode::Record).unwrap();
        rec.update_total_duration_ms(500).unwrap();
        store.extend_total_duration_ms("s", 2000);
        rec.update_total_duration_ms(900).unwrap();
        let play = store.open_or_create("s", OpenMode::Playback).unwrap();
        assert_eq!(play.total_duration_ms(), 2000);
        assert_eq!(play.available_bytes(), 0);
    }

    #[test]
    fn playback_handle_cannot_write() {
        let store = MemoryStore::new();
        store.open_or_create("s", OpenMode::Record).unwrap();
        let mut play = store.open_or_create("s", OpenMode::Playback).unwrap();
        assert!(matches!(
            play.append_bytes(&[0]),
            Err(StreamError::Fatal { .. })
        ));
    }

    #[test]
    fn nearest_checkpoint_at_or_before_request() {
        let store = MemoryStore::new();
        store.set_checkpoint_latency(2);
        let mut rec = store.open_or_create("s", OpenMode::Record).unwrap();
        for (t, offset) in [(0u64, 0u64), (2000, 40), (4000, 90)] {
            rec.append_checkpoint_bytes(&[t as u8 + 1]).unwrap();
            rec.flush_checkpoint(t, offset).unwrap();
        }
        assert_eq!(store.checkpoint_times("s"), vec![0, 2000, 4000]);

        let mut play = store.open_or_create("s", OpenMode::Playback).unwrap();
        assert_eq!(play.poll_checkpoint(), CheckpointPoll::Idle);
        play.request_checkpoint_at(3500).unwrap();
        assert_eq!(play.poll_checkpoint(), CheckpointPoll::Pending);
        assert_eq!(play.poll_checkpoint(), CheckpointPoll::Pending);
        match play.poll_checkpoint() {
            CheckpointPoll::Ready(cp) => {
                assert_eq!(cp.time_ms, 2000);
                assert_eq!(cp.stream_offset, 40);
                assert_eq!(cp.extra_skip_ms, 1500);
            }
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[test]
    fn no_checkpoint_means_start_of_stream() {
        let store = MemoryStore::new();
        store.open_or_create("s", OpenMode::Record).unwrap();
        let mut play = store.open_or_create("s", OpenMode::Playback).unwrap();
        play.request_checkpoint_at(750).unwrap();
        assert_eq!(
            play.poll_checkpoint(),
            CheckpointPoll::Ready(CheckpointData {
                time_ms: 0,
                stream_offset: 0,
                extra_skip_ms: 750,
                bytes: Vec::new(),
            })
        );
    }

    #[test]
    fn discarded_checkpoint_is_never_committed() {
        let store = MemoryStore::new();
        let mut rec = store.open_or_create("s", OpenMode::Record).unwrap();
        rec.append_checkpoint_bytes(&[1, 2, 3]).unwrap();
        assert_eq!(rec.checkpoint_buffer_len(), 3);
        rec.discard_checkpoint();
        rec.stop().unwrap();
        assert!(store.checkpoint_times("s").is_empty());
    }

    #[test]
    fn duration_never_decreases() {
        let store = MemoryStore::new();
        let mut rec = store.open_or_create("s", OpenMode::Record).unwrap();
        rec.update_total_duration_ms(500).unwrap();
        rec.update_total_duration_ms(300).unwrap();
        assert_eq!(rec.total_duration_ms(), 500);
    }

    #[test]
    fn injected_failure_is_fatal() {
        let store = MemoryStore::new();
        let mut rec = store.open_or_create("s", OpenMode::Record).unwrap();
        store.fail_appends("s", "disk full");
        assert_eq!(
            rec.append_bytes(&[0]),
            Err(StreamError::Fatal {
                reason: "disk full".into()
            })
        );
    }
}

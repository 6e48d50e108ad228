//! Collaborator traits: the simulation being recorded, its capturable
//! objects, and the byte-addressable stream back-end.

use crate::error::{DeltaError, SimulationError, StreamError};
use crate::id::{ClassId, ObjectHandle, Transform};
use crate::schema::SchemaRegistry;

// ── Capturable objects ─────────────────────────────────────────────

/// How much state [`Capturable::capture_delta`] should produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureMode {
    /// Fields changed since the last `Delta` or `Full` capture. Advances
    /// the baseline.
    Delta,
    /// Every field. Advances the baseline.
    Full,
}

/// Whether reaction callbacks run as state is applied or later.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReactionMode {
    /// Run reactions as part of `apply_delta`.
    Immediate,
    /// Queue reactions until [`Capturable::flush_reactions`].
    Deferred,
}

/// Static facts the recorder needs about an object.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectDescriptor {
    /// Class, selecting the schema.
    pub class: ClassId,
    /// Build-time pathname. `Some` marks a persistent object that exists
    /// in every session loading the same level.
    pub pathname: Option<String>,
    /// Owning object, if any.
    pub owner: Option<ObjectHandle>,
    /// Current world transform.
    pub transform: Transform,
    /// Relative capture priority. Higher is captured first.
    pub priority: f32,
    /// Desired capture frequency in Hz, before clamping.
    pub update_hz: f32,
    /// Stop capturing after the first capture until reactivated.
    pub capture_once: bool,
    /// Skip this object's identity record on schema mismatch instead of
    /// failing the load.
    pub ignore_if_missing: bool,
}

impl ObjectDescriptor {
    /// A dynamic object descriptor with neutral defaults.
    pub fn dynamic(class: ClassId, transform: Transform) -> Self {
        Self {
            class,
            pathname: None,
            owner: None,
            transform,
            priority: 1.0,
            update_hz: 100.0,
            capture_once: false,
            ignore_if_missing: false,
        }
    }

    /// Whether the object has a stable pathname.
    pub fn is_persistent(&self) -> bool {
        self.pathname.is_some()
    }
}

/// Capability interface every capturable object implements.
///
/// The engine is polymorphic over this trait and never inspects concrete
/// object types.
pub trait Capturable {
    /// Session-local handle.
    fn handle(&self) -> ObjectHandle;

    /// Static facts used for identity, relevance, and cadence.
    fn descriptor(&self) -> ObjectDescriptor;

    /// Serialize state according to `mode`.
    ///
    /// Returns `Ok(None)` when `mode` is [`CaptureMode::Delta`] and
    /// nothing changed. `Full` always returns `Some`.
    fn capture_delta(&mut self, mode: CaptureMode) -> Result<Option<Vec<u8>>, DeltaError>;

    /// Apply bytes produced by `capture_delta` on the recording side.
    fn apply_delta(&mut self, bytes: &[u8], reactions: ReactionMode) -> Result<(), DeltaError>;

    /// Run every reaction queued by deferred applies, once.
    fn flush_reactions(&mut self);

    /// Captured regardless of viewer relevance.
    fn is_always_relevant(&self) -> bool {
        false
    }

    /// Kept alive, and kept bound, across seeks.
    fn is_always_preserved_across_seek(&self) -> bool {
        false
    }
}

// ── Simulation ─────────────────────────────────────────────────────

/// Parameters for [`Simulation::spawn`].
#[derive(Clone, Debug, PartialEq)]
pub struct SpawnRequest {
    /// Class to instantiate.
    pub class: ClassId,
    /// Pathname when re-creating a persistent object.
    pub pathname: Option<String>,
    /// Initial transform.
    pub transform: Transform,
    /// Owning object.
    pub owner: Option<ObjectHandle>,
}

/// The live simulation the engine records from or plays back into.
pub trait Simulation {
    /// Schemas for every capturable class in this build.
    fn schemas(&self) -> &SchemaRegistry;

    /// Name of the level currently loaded.
    fn current_level(&self) -> &str;

    /// Replace the loaded level. Objects that report
    /// [`is_always_preserved_across_seek`](Capturable::is_always_preserved_across_seek)
    /// survive; everything else is destroyed and the level's persistent
    /// objects are created fresh.
    fn load_level(&mut self, name: &str) -> Result<(), SimulationError>;

    /// Create an object.
    fn spawn(&mut self, request: SpawnRequest) -> Result<ObjectHandle, SimulationError>;

    /// Destroy an object. Returns `false` if it did not exist.
    fn destroy(&mut self, handle: ObjectHandle) -> bool;

    /// Advance by `dt` seconds of simulation time.
    fn tick(&mut self, dt: f64);

    /// Every live capturable object, in a stable order.
    fn enumerate_capturable(&self) -> Vec<ObjectHandle>;

    /// Borrow an object.
    fn object(&self, handle: ObjectHandle) -> Option<&dyn Capturable>;

    /// Mutably borrow an object.
    fn object_mut(&mut self, handle: ObjectHandle) -> Option<&mut dyn Capturable>;

    /// Find a live persistent object by pathname.
    fn find_persistent(&self, pathname: &str) -> Option<ObjectHandle>;

    /// Viewer locations used for relevance filtering.
    fn viewers(&self) -> Vec<[f64; 3]> {
        Vec::new()
    }

    /// Deliver an application-defined data block recorded for `handle`.
    fn receive_aux_data(&mut self, _handle: ObjectHandle, _data: &[u8]) {}

    /// Announce a streaming sub-level change recorded in a frame.
    fn stream_level(&mut self, _package: &str, _package_to_load: &str) {}
}

// ── Stream back-end ────────────────────────────────────────────────

/// Access mode for [`StreamStore::open_or_create`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Create (or truncate) the stream and append to it.
    Record,
    /// Read an existing stream, possibly while it is still being written.
    Playback,
}

/// A checkpoint returned by the back-end.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CheckpointData {
    /// Time the checkpoint was finalized. `0` with empty `bytes` means
    /// "no checkpoint; start from the beginning".
    pub time_ms: u64,
    /// Offset of the first frame to replay after loading.
    pub stream_offset: u64,
    /// Requested time minus `time_ms`.
    pub extra_skip_ms: u64,
    /// Encoded checkpoint. Empty when no checkpoint precedes the request.
    pub bytes: Vec<u8>,
}

/// Progress of a [`request_checkpoint_at`](StreamBackend::request_checkpoint_at).
#[derive(Clone, Debug, PartialEq)]
pub enum CheckpointPoll {
    /// Still loading; poll again next tick.
    Pending,
    /// Loaded.
    Ready(CheckpointData),
    /// The back-end could not produce the checkpoint.
    Failed {
        /// Human-readable reason.
        reason: String,
    },
    /// No request is outstanding.
    Idle,
}

/// An open stream handle.
///
/// Read-side methods take `&self`; the data may be shared with a live
/// writer. Completion of checkpoint loads is reported through
/// [`poll_checkpoint`](Self::poll_checkpoint) rather than callbacks.
pub trait StreamBackend {
    /// Append frame bytes to the stream.
    fn append_bytes(&mut self, bytes: &[u8]) -> Result<(), StreamError>;

    /// Read `len` bytes at `offset`. Fails with
    /// [`StreamError::NotYetAvailable`] if the range is not yet written.
    fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>, StreamError>;

    /// Bytes of frame data written so far.
    fn available_bytes(&self) -> u64;

    /// Recorded duration in milliseconds.
    fn total_duration_ms(&self) -> u64;

    /// Publish a new recorded duration.
    fn update_total_duration_ms(&mut self, ms: u64) -> Result<(), StreamError>;

    /// Whether a recorder is still appending to this stream.
    fn is_live(&self) -> bool;

    /// Current header bytes.
    fn header_bytes(&self) -> Result<Vec<u8>, StreamError>;

    /// Replace the header bytes.
    fn set_header_bytes(&mut self, bytes: &[u8]) -> Result<(), StreamError>;

    /// Append to the pending (unfinalized) checkpoint buffer.
    fn append_checkpoint_bytes(&mut self, bytes: &[u8]) -> Result<(), StreamError>;

    /// Size of the pending checkpoint buffer.
    fn checkpoint_buffer_len(&self) -> usize;

    /// Drop the pending checkpoint buffer without committing it.
    fn discard_checkpoint(&mut self);

    /// Commit the pending checkpoint buffer, indexed by `time_ms`, with
    /// replay starting at `stream_offset`.
    fn flush_checkpoint(&mut self, time_ms: u64, stream_offset: u64) -> Result<(), StreamError>;

    /// Begin loading the nearest checkpoint at or before `time_ms`.
    /// Replaces any outstanding request.
    fn request_checkpoint_at(&mut self, time_ms: u64) -> Result<(), StreamError>;

    /// Poll the outstanding checkpoint request.
    fn poll_checkpoint(&mut self) -> CheckpointPoll;

    /// Abandon the outstanding checkpoint request, if any.
    fn cancel_checkpoint_request(&mut self);

    /// Hint that `[low_ms, high_ms]` will be read soon.
    fn set_priority_range(&mut self, low_ms: u64, high_ms: u64);

    /// Close the handle. A recording handle stops being live.
    fn stop(&mut self) -> Result<(), StreamError>;
}

/// Opens named streams.
pub trait StreamStore {
    /// Open `name` in `mode`.
    ///
    /// Recording fails with [`StreamError::Busy`] if another recorder holds
    /// the stream; playback fails with [`StreamError::NotFound`] if it does
    /// not exist.
    fn open_or_create(
        &self,
        name: &str,
        mode: OpenMode,
    ) -> Result<Box<dyn StreamBackend>, StreamError>;
}

//! Data types carried by a recording.

use std::collections::BTreeSet;

use rewind_core::{ClassId, ClassSchema, LevelIndex, ObjectHandle, PersistentId, Transform};

/// A streaming sub-level change recorded in a frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamingLevel {
    /// Package currently streamed.
    pub package: String,
    /// Package to load in its place.
    pub package_to_load: String,
}

/// Application-defined bytes attached to one object for one frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuxBlock {
    /// Object the data belongs to.
    pub id: PersistentId,
    /// Opaque payload.
    pub data: Vec<u8>,
}

/// One time-slice of captured state.
///
/// `elapsed` is absolute stream time in seconds, not a delta, so a reader
/// positioned after a checkpoint needs no earlier history.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// Level segment this frame belongs to.
    pub level: LevelIndex,
    /// Absolute stream time in seconds.
    pub elapsed: f64,
    /// Streaming sub-level changes.
    pub streaming_levels: Vec<StreamingLevel>,
    /// Per-object application data.
    pub aux: Vec<AuxBlock>,
    /// Encoded [`ObjectPacket`]s.
    pub packets: Vec<Vec<u8>>,
}

impl Frame {
    /// An idle frame: no aux blocks, no packets.
    pub fn idle(level: LevelIndex, elapsed: f64) -> Self {
        Self {
            level,
            elapsed,
            streaming_levels: Vec::new(),
            aux: Vec::new(),
            packets: Vec::new(),
        }
    }

    /// Whether the frame carries no state.
    pub fn is_idle(&self) -> bool {
        self.streaming_levels.is_empty() && self.aux.is_empty() && self.packets.is_empty()
    }
}

/// A single object's change within a frame.
#[derive(Clone, Debug, PartialEq)]
pub enum ObjectPacket {
    /// A dynamic object appeared. Carries its full state.
    Spawn {
        /// New object's id.
        id: PersistentId,
        /// Owning object.
        owner: Option<PersistentId>,
        /// Class to spawn.
        class: ClassId,
        /// Spawn transform.
        transform: Transform,
        /// Full-state delta.
        state: Vec<u8>,
    },
    /// A persistent object was captured for the first time. Binds by
    /// pathname and carries its full state.
    Bind {
        /// Stable id.
        id: PersistentId,
        /// Owning object.
        owner: Option<PersistentId>,
        /// Class, for schema lookup.
        class: ClassId,
        /// Stable pathname.
        pathname: String,
        /// Full-state delta.
        state: Vec<u8>,
    },
    /// Changed fields of a known object.
    Update {
        /// Target object.
        id: PersistentId,
        /// Schema delta.
        delta: Vec<u8>,
    },
    /// An object was destroyed.
    Destroy {
        /// Destroyed object.
        id: PersistentId,
    },
}

impl ObjectPacket {
    /// The object this packet targets.
    pub fn id(&self) -> PersistentId {
        match self {
            Self::Spawn { id, .. }
            | Self::Bind { id, .. }
            | Self::Update { id, .. }
            | Self::Destroy { id } => *id,
        }
    }
}

/// One entry of the header's level list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LevelEntry {
    /// Level name passed to [`Simulation::load_level`](rewind_core::Simulation::load_level).
    pub name: String,
    /// Stream time at which the level became active.
    pub start_ms: u64,
}

/// Stream header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamHeader {
    /// [`SchemaRegistry::version`](rewind_core::SchemaRegistry::version)
    /// of the recording build.
    pub schema_version: u32,
    /// Levels in the order they were entered. Index = [`LevelIndex`].
    pub levels: Vec<LevelEntry>,
    /// Opaque application data.
    pub blob: Vec<u8>,
}

impl StreamHeader {
    /// Look up a level by index.
    pub fn level(&self, index: LevelIndex) -> Option<&LevelEntry> {
        self.levels.get(index.0 as usize)
    }
}

/// Flags carried by an identity record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IdentityFlags {
    /// Do not resolve this record by pathname on load.
    pub no_load: bool,
    /// Skip the record on schema mismatch instead of failing.
    pub ignore_if_missing: bool,
}

impl IdentityFlags {
    /// Pack into the wire byte.
    pub fn to_bits(self) -> u8 {
        u8::from(self.no_load) | (u8::from(self.ignore_if_missing) << 1)
    }

    /// Unpack from the wire byte. Unknown bits are ignored.
    pub fn from_bits(bits: u8) -> Self {
        Self {
            no_load: bits & 1 != 0,
            ignore_if_missing: bits & 2 != 0,
        }
    }
}

/// Maps a stream-stable id to what is needed to find or re-create the
/// object in a later session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityRecord {
    /// Stream-stable id.
    pub id: PersistentId,
    /// Owner's id.
    pub owner: Option<PersistentId>,
    /// Object class.
    pub class: ClassId,
    /// Stable pathname, if the object has one.
    pub pathname: Option<String>,
    /// Schema checksum of `class` in the recording build.
    pub schema_checksum: u32,
    /// Record flags.
    pub flags: IdentityFlags,
    /// Live handle. Session-local; never serialized.
    pub handle: Option<ObjectHandle>,
}

/// A full-state snapshot from which playback can start.
#[derive(Clone, Debug, PartialEq)]
pub struct Checkpoint {
    /// Level segment the checkpoint belongs to.
    pub level: LevelIndex,
    /// Persistent objects destroyed before the checkpoint.
    pub deleted: BTreeSet<PersistentId>,
    /// Identity records of live persistent objects.
    pub identity: Vec<IdentityRecord>,
    /// Field descriptor table of the recording build.
    pub schemas: Vec<ClassSchema>,
    /// Full-state packets. `frame.elapsed` is the checkpoint time.
    pub frame: Frame,
}

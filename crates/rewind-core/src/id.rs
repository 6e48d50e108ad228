//! Strongly-typed identifiers and the [`Transform`] value type.

use std::fmt;

use crate::hash::fnv1a;

/// Session-local handle to a live simulation object.
///
/// Handles are issued by the simulation and are only meaningful while the
/// object is alive. They are never written to a stream; the engine maps
/// them to [`PersistentId`]s through the identity cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle(pub u64);

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for ObjectHandle {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Stream-stable identifier for a captured object.
///
/// The low bit tags the id's origin:
/// - **stable** ids (low bit set) are derived from an object's build-time
///   pathname and are identical in every session that loads the same level;
/// - **dynamic** ids (low bit clear) are allocated sequentially by the
///   recorder for objects spawned at runtime.
///
/// The value `0` is reserved to encode "no object" on the wire.
///
/// ```
/// use rewind_core::PersistentId;
///
/// let door = PersistentId::stable("Arena.Door_1");
/// assert!(door.is_stable());
/// assert_eq!(door, PersistentId::stable("Arena.Door_1"));
///
/// let pawn = PersistentId::dynamic(7);
/// assert!(!pawn.is_stable());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PersistentId(pub u64);

impl PersistentId {
    /// Id derived from a stable pathname.
    pub fn stable(pathname: &str) -> Self {
        Self(fnv1a(pathname.as_bytes()) | 1)
    }

    /// Id for the `seq`-th dynamic object. `seq` starts at 1.
    pub fn dynamic(seq: u64) -> Self {
        Self(seq << 1)
    }

    /// Whether this id was derived from a stable pathname.
    pub fn is_stable(self) -> bool {
        self.0 & 1 == 1
    }

    /// Decode the wire form, where `0` means "none".
    pub fn from_wire(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    /// Encode an optional id in wire form.
    pub fn to_wire(id: Option<Self>) -> u64 {
        id.map_or(0, |id| id.0)
    }
}

impl fmt::Display for PersistentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Identifies an object class (and therefore its schema).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ClassId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// Identifies a field within a [`ClassSchema`](crate::ClassSchema).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub u16);

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for FieldId {
    fn from(v: u16) -> Self {
        Self(v)
    }
}

/// Index into the stream header's ordered level list.
///
/// Incremented each time the recorder crosses a level transition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LevelIndex(pub u32);

impl fmt::Display for LevelIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for LevelIndex {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// Location and rotation of an object in world space.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Transform {
    /// World-space location.
    pub location: [f64; 3],
    /// Euler rotation in degrees (pitch, yaw, roll).
    pub rotation: [f64; 3],
}

impl Transform {
    /// A transform at `location` with no rotation.
    pub fn at(location: [f64; 3]) -> Self {
        Self {
            location,
            rotation: [0.0; 3],
        }
    }

    /// Squared distance between the two locations.
    pub fn distance_squared(&self, point: [f64; 3]) -> f64 {
        self.location
            .iter()
            .zip(point.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum()
    }
}

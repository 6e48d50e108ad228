//! Core types and traits for the Rewind replay framework.
//!
//! This crate is the leaf dependency shared by every other Rewind crate.
//! It defines the strongly-typed identifiers, the build-time schema
//! descriptors that drive delta encoding, the error types raised by
//! collaborators, and the traits through which the engine talks to the
//! simulation and to the stream back-end.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod clock;
pub mod error;
pub mod hash;
pub mod id;
pub mod schema;
pub mod traits;

pub use clock::{Clock, SystemClock};
pub use error::{DeltaError, SimulationError, StreamError};
pub use hash::{fnv1a, fnv1a_u32};
pub use id::{ClassId, FieldId, LevelIndex, ObjectHandle, PersistentId, Transform};
pub use schema::{
    apply_delta, encode_delta, ClassSchema, FieldCodec, FieldDescriptor, FieldValue, ObjectState,
    SchemaRegistry,
};
pub use traits::{
    Capturable, CaptureMode, CheckpointData, CheckpointPoll, ObjectDescriptor, OpenMode,
    ReactionMode, Simulation, SpawnRequest, StreamBackend, StreamStore,
};

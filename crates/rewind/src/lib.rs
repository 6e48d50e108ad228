//! Rewind: record a running simulation and scrub back through it.
//!
//! This is the top-level facade crate that re-exports the public API of the
//! Rewind sub-crates. Adding `rewind` as a single dependency is enough for
//! most hosts.
//!
//! # Quick start
//!
//! ```rust
//! use rewind::prelude::*;
//! use rewind::replay::MemoryStore;
//! use rewind_test_utils::fixtures::arena_world;
//!
//! let store = MemoryStore::new();
//! let mut world = arena_world();
//! let mut session = Session::new(store.clone(), SessionConfig::default()).unwrap();
//!
//! // Record two seconds of the world.
//! session.record("demo", &world).unwrap();
//! for _ in 0..20 {
//!     session.tick(&mut world, 0.1).unwrap();
//! }
//! session.stop().unwrap();
//!
//! // Play it back and jump into the middle.
//! session.play("demo", &world).unwrap();
//! session.goto(1.0).unwrap();
//! session.tick(&mut world, 0.0).unwrap();
//! assert_eq!(session.current_time(), 1.0);
//! ```
//!
//! # Modules
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`types`] | `rewind-core` | Ids, schemas, the simulation and back-end traits |
//! | [`replay`] | `rewind-replay` | Stream format, identity cache, in-memory store |
//! | [`engine`] | `rewind-engine` | Recorder, player and session |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Core types and traits (`rewind-core`).
///
/// Hosts implement [`types::Simulation`] and [`types::Capturable`] for
/// their world, and [`types::StreamStore`] for durable storage.
pub use rewind_core as types;

/// Stream format and bookkeeping (`rewind-replay`).
///
/// [`replay::StreamWriter`] and [`replay::StreamReader`] frame the byte
/// stream; [`replay::MemoryStore`] is a complete in-memory back-end.
pub use rewind_replay as replay;

/// Recording and playback (`rewind-engine`).
///
/// [`engine::Session`] is the usual entry point; [`engine::Recorder`] and
/// [`engine::Player`] can be driven directly.
pub use rewind_engine as engine;

/// Common imports for typical Rewind usage.
///
/// ```rust
/// use rewind::prelude::*;
/// ```
pub mod prelude {
    // Core types and traits
    pub use rewind_core::{
        Capturable, CaptureMode, ClassId, ClassSchema, Clock, FieldValue, ObjectDescriptor,
        ObjectHandle, PersistentId, ReactionMode, SchemaRegistry, Simulation, SpawnRequest,
        StreamBackend, StreamStore, Transform,
    };

    // Errors
    pub use rewind_core::{DeltaError, SimulationError, StreamError};

    // Engine
    pub use rewind_engine::{
        PlaybackState, Player, Recorder, RecorderState, Session, SessionConfig, SessionError,
        SessionEvent,
    };
}

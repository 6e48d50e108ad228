//! Recording, scrubbing and playback for Rewind.
//!
//! The [`Recorder`] turns a live [`Simulation`](rewind_core::Simulation)
//! into a stream of delta frames plus periodic checkpoints. The [`Player`]
//! replays that stream, seeking by loading the nearest checkpoint and
//! fast-forwarding. [`Session`] wraps both behind one host-facing surface.
//!
//! # Architecture
//!
//! - [`config`] holds every tunable and validates it up front
//! - [`record`] schedules captures by priority, relevance and budget
//! - [`playback`] buffers, applies and reconciles frames
//! - [`task`] runs seeks, skips and live-edge jumps one step per tick
//! - [`packets`] is the look-ahead buffer of decoded frames
//!
//! Everything is single-threaded and driven by the host's tick.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod event;
pub mod metrics;
pub mod packets;
pub mod playback;
pub mod record;
pub mod session;
pub mod task;

pub use config::{CheckpointConfig, ConfigError, PlaybackConfig, RecordConfig, SessionConfig};
pub use error::SessionError;
pub use event::SessionEvent;
pub use metrics::{PlaybackMetrics, RecordMetrics};
pub use packets::PlaybackPacketQueue;
pub use playback::{PlaybackState, Player};
pub use record::{Recorder, RecorderState};
pub use session::Session;
pub use task::{ActiveTask, QueuedTask, ReplayTask, TaskKind, TaskQueue, TaskStep};

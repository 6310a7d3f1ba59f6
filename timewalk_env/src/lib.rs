//! TimeWalk Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seam that lets the TimeWalk engine run
//! against both a **live** tracking session (tokio) and the **simulated**
//! sessions of the deterministic harness.
//!
//! # Core Concept: The Reactor Pattern
//!
//! Everything the engine does not compute itself is intercepted here:
//! - Time (`now()`, `system_time()`)
//! - Tracking input (camera frames, marker sightings)
//!
//! The engine never reads a wall clock or polls a camera directly, so a
//! simulated session replays bit-for-bit from its seed.
//!
//! # Example
//!
//! ```ignore
//! use timewalk_env::{SessionContext, TrackingSource, TrackingEvent};
//!
//! async fn session_loop<Ctx: SessionContext, Src: TrackingSource>(ctx: &Ctx, source: &Src) {
//!     while let Some(event) = source.next_event().await {
//!         match event {
//!             TrackingEvent::Frame(frame) => on_frame(frame, ctx.now()),
//!             TrackingEvent::Marker(sighting) => on_marker(sighting),
//!         }
//!     }
//! }
//! ```

mod context;
mod tracking;
mod types;
mod error;
mod tokio_impl;

pub use context::SessionContext;
pub use tracking::{TrackingSource, TrackingSink};
pub use types::{CameraFrame, DeviceId, InterfaceOrientation, MarkerSighting, TrackingEvent};
pub use error::EnvError;
pub use tokio_impl::{tracking_channel, ChannelTrackingSink, ChannelTrackingSource, TokioContext};

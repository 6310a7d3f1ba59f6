//! TimeWalk Deterministic Simulation Testing (DST) Harness
//!
//! A controlled environment where several AR devices walk the same set of
//! markers, each in its own tracking frame, and every run is reproducible
//! from a single 64-bit seed.
//!
//! # Core Principle
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: a virtual clock advanced one tracking frame at a time
//! - **Sensors**: marker sightings carry seeded Gaussian noise
//! - **Layout**: device session origins and marker walks come from the seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ScenarioRunner                         │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ SimContext (Virtual Clock)                           │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       │                        │                            │
//! │  ┌────▼─────┐             ┌────▼─────┐                      │
//! │  │ Session  │             │ Session  │     ...              │
//! │  │ device A │             │ device B │                      │
//! │  └────┬─────┘             └────▲─────┘                      │
//! │       │ links, photos          │ links, photos              │
//! │  ┌────▼────────────────────────┴────┐                       │
//! │  │          MemoryLinkStore          │                       │
//! │  └───────────────────────────────────┘                       │
//! │       ▲ tracking events (noisy)                             │
//! │  ┌────┴──────────────────────────────┐                       │
//! │  │            Oracle                 │                       │
//! │  │   (Ground Truth World Poses)      │                       │
//! │  └───────────────────────────────────┘                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use timewalk_sim::{ScenarioId, ScenarioRunner};
//!
//! let result = ScenarioRunner::new(42)
//!     .with_duration(5.0)
//!     .run(ScenarioId::CrossSession);
//! assert!(result.passed);
//! ```

pub mod context;
pub mod exporter;
pub mod oracle;
pub mod runner;
pub mod scenarios;

pub use context::SimContext;
pub use exporter::{AnchorFrame, SimEvent, SimExport, SimFrame, WorldPosition};
pub use oracle::{DeviceSession, FrameOptics, GroundTruthMarker, GroundTruthPhoto, Oracle};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner, SimConfig, SimError};
pub use scenarios::ScenarioId;

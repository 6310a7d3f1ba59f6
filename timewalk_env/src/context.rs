//! Core environment context trait for TimeWalk sessions.

use std::time::{Duration, SystemTime};

/// The central interface for Environment Interaction.
///
/// This trait abstracts the "real world" clock so that the presentation
/// session can run in both a live AR session (tokio) and the simulator.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `std::time::Instant` and the system clock
/// - **Simulation**: `SimContext` - a virtual clock advanced by the scenario
///
/// # Determinism
///
/// The visibility engine's hysteresis lock is a deadline compared against
/// `now()`, so a simulated clock makes every transition reproducible.
pub trait SessionContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Used for visibility lock deadlines.
    /// In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time stamped on newly registered photos.
    fn system_time(&self) -> SystemTime;
}

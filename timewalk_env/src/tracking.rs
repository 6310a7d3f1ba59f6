//! Tracking input abstraction for TimeWalk sessions.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{DeviceId, TrackingEvent};

/// Abstraction over the host tracking system.
///
/// # Implementations
///
/// - **Production**: the AR framework's frame/anchor callbacks forwarded
///   through a [`crate::ChannelTrackingSink`]
/// - **Simulation**: events synthesized from the oracle's ground truth
///
/// # Event Flow
///
/// ```text
/// Tracking host              Channel                 PresentationSession
///   |                           |                          |
///   |-- frame callback (60Hz) ->|                          |
///   |-- image anchor update --->|                          |
///   |                           |-- next_event() --------->|
/// ```
#[async_trait]
pub trait TrackingSource: Send + Sync + 'static {
    /// Receives the next tracking event.
    ///
    /// # Returns
    /// * `Some(event)` - A frame or a marker sighting
    /// * `None` - The tracking session ended
    async fn next_event(&self) -> Option<TrackingEvent>;

    /// Returns the device this source belongs to.
    fn device_id(&self) -> DeviceId;
}

/// Producer half used by the host to feed events into a session.
#[async_trait]
pub trait TrackingSink: Send + Sync {
    /// Queues an event for the session.
    ///
    /// # Returns
    /// * `Ok(())` - Event queued
    /// * `Err(EnvError::SourceClosed)` - The session stopped listening
    async fn push(&self, event: TrackingEvent) -> Result<(), EnvError>;
}

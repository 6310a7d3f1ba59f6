//! Production implementations backed by Tokio.

use crate::error::EnvError;
use crate::tracking::{TrackingSink, TrackingSource};
use crate::types::{DeviceId, TrackingEvent};
use crate::SessionContext;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, Mutex};

/// Production context backed by Tokio and the system clock.
pub struct TokioContext {
    /// Start time for monotonic duration calculations
    start: Instant,
}

impl TokioContext {
    /// Creates a new TokioContext.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Creates an Arc-wrapped context for sharing across tasks.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext for TokioContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Creates a bounded tracking channel for one device.
///
/// The host keeps the sink and forwards its frame/anchor callbacks into it;
/// the session drains the source.
pub fn tracking_channel(device: DeviceId, capacity: usize) -> (ChannelTrackingSink, ChannelTrackingSource) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        ChannelTrackingSink { tx },
        ChannelTrackingSource {
            device,
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

/// Host-side sender of tracking events.
#[derive(Clone)]
pub struct ChannelTrackingSink {
    tx: mpsc::Sender<TrackingEvent>,
}

#[async_trait]
impl TrackingSink for ChannelTrackingSink {
    async fn push(&self, event: TrackingEvent) -> Result<(), EnvError> {
        self.tx.send(event).await.map_err(|_| EnvError::SourceClosed)
    }
}

impl ChannelTrackingSink {
    /// Non-blocking push for use from a synchronous frame callback.
    ///
    /// A full buffer drops the event; frames are superseded 16ms later anyway.
    pub fn try_push(&self, event: TrackingEvent) -> Result<(), EnvError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnvError::send("tracking buffer full"),
            mpsc::error::TrySendError::Closed(_) => EnvError::SourceClosed,
        })
    }
}

/// Session-side receiver of tracking events.
pub struct ChannelTrackingSource {
    device: DeviceId,

    /// Receiver behind a tokio mutex so `next_event` can take `&self`
    rx: Arc<Mutex<mpsc::Receiver<TrackingEvent>>>,
}

#[async_trait]
impl TrackingSource for ChannelTrackingSource {
    async fn next_event(&self) -> Option<TrackingEvent> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    fn device_id(&self) -> DeviceId {
        self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CameraFrame, InterfaceOrientation};

    fn frame(timestamp_ms: u64) -> TrackingEvent {
        TrackingEvent::Frame(CameraFrame {
            position: [0.0, 1.5, 0.0],
            euler: [0.0, 0.0, 0.0],
            interface_orientation: InterfaceOrientation::Portrait,
            viewport: [390.0, 844.0],
            projection_scale: [3.2, 1.5],
            timestamp_ms,
        })
    }

    #[test]
    fn test_tokio_context_time() {
        let ctx = TokioContext::new();
        let t1 = ctx.now();
        std::thread::sleep(Duration::from_millis(10));
        let t2 = ctx.now();

        assert!(t2 > t1);
        assert!(t2 - t1 >= Duration::from_millis(10));
    }

    #[test]
    fn test_tokio_context_system_time_is_wall_clock() {
        let ctx = TokioContext::new();
        let since_epoch = ctx.system_time().duration_since(SystemTime::UNIX_EPOCH).unwrap();
        // Any real clock is past 2024-01-01
        assert!(since_epoch > Duration::from_secs(1_704_067_200));
    }

    #[tokio::test]
    async fn test_channel_preserves_order() {
        let device = DeviceId::from_seed(1);
        let (sink, source) = tracking_channel(device, 8);

        sink.push(frame(1)).await.unwrap();
        sink.push(frame(2)).await.unwrap();
        drop(sink);

        assert_eq!(source.device_id(), device);
        assert_eq!(source.next_event().await.unwrap().timestamp_ms(), 1);
        assert_eq!(source.next_event().await.unwrap().timestamp_ms(), 2);
        assert!(source.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_try_push_reports_full_buffer() {
        let (sink, _source) = tracking_channel(DeviceId::from_seed(2), 1);

        assert!(sink.try_push(frame(1)).is_ok());
        assert!(matches!(sink.try_push(frame(2)), Err(EnvError::SendFailed(_))));
    }

    #[tokio::test]
    async fn test_push_after_source_dropped() {
        let (sink, source) = tracking_channel(DeviceId::from_seed(3), 4);
        drop(source);

        assert!(matches!(sink.push(frame(1)).await, Err(EnvError::SourceClosed)));
    }
}

//! Plain-data tracking types shared by the host, the engine and the simulator.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a device running a tracking session.
///
/// Uses UUID v4 for global uniqueness without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub Uuid);

impl DeviceId {
    /// Creates a new random DeviceId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a DeviceId from a UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Creates a deterministic DeviceId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// How the user interface is rotated relative to the camera sensor.
///
/// The sensor's x-axis runs along the long side of the device, so each
/// orientation picks a different pair of camera axes as screen
/// horizontal/vertical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterfaceOrientation {
    Portrait,
    PortraitUpsideDown,
    LandscapeLeft,
    LandscapeRight,
}

impl Default for InterfaceOrientation {
    fn default() -> Self {
        InterfaceOrientation::Portrait
    }
}

/// One tracking frame as reported by the host (nominally 60 Hz).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraFrame {
    /// Camera position [x, y, z] in the session frame (meters)
    pub position: [f64; 3],

    /// Camera euler angles [pitch, yaw, roll] in radians
    pub euler: [f64; 3],

    /// Current user interface orientation
    pub interface_orientation: InterfaceOrientation,

    /// Viewport size [width, height] in points
    pub viewport: [f64; 2],

    /// Projection matrix scale factors [m00, m11] for this viewport
    pub projection_scale: [f64; 2],

    /// Host timestamp (milliseconds)
    pub timestamp_ms: u64,
}

/// A marker detection reported by the recognition collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerSighting {
    /// Reference identifier of the recognized marker
    pub marker_id: i64,

    /// Marker position [x, y, z] in the session frame (meters)
    pub position: [f64; 3],

    /// Marker rotation matrix, row-major
    pub rotation: [[f64; 3]; 3],

    /// Host timestamp (milliseconds)
    pub timestamp_ms: u64,
}

/// Anything the tracking host can tell a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TrackingEvent {
    Frame(CameraFrame),
    Marker(MarkerSighting),
}

impl TrackingEvent {
    /// Returns the host timestamp of the event.
    pub fn timestamp_ms(&self) -> u64 {
        match self {
            TrackingEvent::Frame(frame) => frame.timestamp_ms,
            TrackingEvent::Marker(sighting) => sighting.timestamp_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_from_seed_is_deterministic() {
        assert_eq!(DeviceId::from_seed(7), DeviceId::from_seed(7));
        assert_ne!(DeviceId::from_seed(7), DeviceId::from_seed(8));
    }

    #[test]
    fn test_device_id_display_is_short() {
        let id = DeviceId::from_seed(1);
        assert_eq!(id.to_string().len(), 8);
    }

    #[test]
    fn test_event_timestamp() {
        let event = TrackingEvent::Marker(MarkerSighting {
            marker_id: 3,
            position: [0.0; 3],
            rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            timestamp_ms: 1234,
        });
        assert_eq!(event.timestamp_ms(), 1234);
    }
}

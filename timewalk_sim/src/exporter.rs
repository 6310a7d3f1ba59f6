//! JSON exporter for offline visualization.
//!
//! Exports simulation frames as JSON: the camera path in world
//! coordinates plus each placed anchor's state and guide projection.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use timewalk_core::{AnchorId, VisibilityState};

/// A single frame of simulation data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFrame {
    /// Simulation time in seconds
    pub time_sec: f64,

    /// Camera position (world frame)
    pub camera: WorldPosition,

    /// Placed anchors as the session sees them
    pub anchors: Vec<AnchorFrame>,

    /// Events (relocalizations, transitions, etc.)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SimEvent>,
}

/// A world-frame position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorldPosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl From<Vector3<f64>> for WorldPosition {
    fn from(pos: Vector3<f64>) -> Self {
        Self {
            x: pos.x,
            y: pos.y,
            z: pos.z,
        }
    }
}

/// Anchor frame data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorFrame {
    pub anchor_id: AnchorId,

    /// "avatar" or "photo"
    pub state: String,

    /// Avatar position mapped back to the world frame
    pub avatar: WorldPosition,

    /// Guide projection in screen pixels
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen: Option<[f64; 2]>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_frame: Option<bool>,
}

impl AnchorFrame {
    pub fn state_name(state: VisibilityState) -> String {
        match state {
            VisibilityState::AvatarVisible => "avatar".to_string(),
            VisibilityState::PhotoVisible => "photo".to_string(),
        }
    }
}

/// Simulation event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimEvent {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl SimEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: None,
        }
    }
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Duration in seconds
    pub duration_sec: f64,

    /// All frames
    pub frames: Vec<SimFrame>,

    /// Final results
    pub passed: bool,

    /// Worst placement error against ground truth, if measured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_position_error: Option<f64>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            passed: false,
            max_position_error: None,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: SimFrame) {
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, max_position_error: Option<f64>) {
        self.passed = passed;
        self.max_position_error = max_position_error;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_tracks_duration() {
        let mut export = SimExport::new("hysteresis", 42);
        for i in 0..3 {
            export.add_frame(SimFrame {
                time_sec: i as f64 * 0.5,
                camera: Vector3::new(0.0, 1.6, i as f64).into(),
                anchors: Vec::new(),
                events: Vec::new(),
            });
        }
        export.finalize(true, Some(0.02));

        assert_eq!(export.frames.len(), 3);
        assert_eq!(export.duration_sec, 1.0);
        assert!(export.passed);
    }

    #[test]
    fn test_export_json_skips_empty_fields() {
        let frame = SimFrame {
            time_sec: 0.0,
            camera: Vector3::<f64>::zeros().into(),
            anchors: vec![AnchorFrame {
                anchor_id: 7,
                state: AnchorFrame::state_name(VisibilityState::AvatarVisible),
                avatar: Vector3::new(1.0, 0.0, -2.0).into(),
                screen: None,
                on_frame: None,
            }],
            events: Vec::new(),
        };

        let json = serde_json::to_value(&frame).unwrap();
        assert!(json.get("events").is_none());
        assert!(json["anchors"][0].get("screen").is_none());
        assert_eq!(json["anchors"][0]["state"], "avatar");
    }
}

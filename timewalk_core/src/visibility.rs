//! Proximity visibility - photo or avatar, decided per anchor per tick
//!
//! Every placed photo is rendered either as the photo itself or as an
//! avatar standing where the photographer stood. The photo is revealed when
//! the viewer walks inside the geofence around the avatar and looks the way
//! the photographer looked; it collapses back to the avatar when the viewer
//! leaves the geofence.
//!
//! A transition locks the anchor for the length of its animation. The lock
//! is a stored deadline polled on each tick, there is no timer.

use crate::pose::{Pose, PoseError};
use crate::reference_graph::ReferenceId;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Identifier of a placed photo.
pub type AnchorId = i64;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the visibility engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisibilityConfig {
    /// Planar radius around the avatar that reveals the photo (default: 10.0 m)
    pub geofence_radius: f64,

    /// Observer point sits this far behind the camera (default: 0.3 m)
    pub observer_offset: f64,

    /// Half-width of the facing cone (default: 30°)
    pub facing_half_angle_deg: f64,

    /// Animation length and lock window (default: 500 ms)
    pub transition_duration: Duration,
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            geofence_radius: 10.0,
            observer_offset: 0.3,
            facing_half_angle_deg: 30.0,
            transition_duration: Duration::from_millis(500),
        }
    }
}

impl VisibilityConfig {
    pub fn validate(&self) -> Result<(), VisibilityError> {
        if !(self.geofence_radius.is_finite() && self.geofence_radius > 0.0) {
            return Err(VisibilityError::config(format!(
                "geofence_radius must be positive, got {}",
                self.geofence_radius
            )));
        }
        if !(self.observer_offset.is_finite() && self.observer_offset >= 0.0) {
            return Err(VisibilityError::config(format!(
                "observer_offset must be non-negative, got {}",
                self.observer_offset
            )));
        }
        if !(self.facing_half_angle_deg > 0.0 && self.facing_half_angle_deg < 180.0) {
            return Err(VisibilityError::config(format!(
                "facing_half_angle_deg must be in (0, 180), got {}",
                self.facing_half_angle_deg
            )));
        }
        // A zero lock would let two transitions share one deadline
        if self.transition_duration.is_zero() {
            return Err(VisibilityError::config("transition_duration must be non-zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum VisibilityError {
    #[error("Invalid camera pose: {0}")]
    NonFinite(#[from] PoseError),

    #[error("Invalid visibility config: {0}")]
    InvalidConfig(String),
}

impl VisibilityError {
    fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

// ============================================================================
// ANCHOR STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VisibilityState {
    AvatarVisible,
    PhotoVisible,
}

/// Which 3D object of an anchor an animation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnimationTarget {
    Photo,
    Avatar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnimationKind {
    /// Scale from zero to full size
    Expand,
    /// Scale from full size to zero
    Shrink,
}

/// Instruction for the renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimationCommand {
    pub anchor_id: AnchorId,
    pub target: AnimationTarget,
    pub kind: AnimationKind,
    pub duration: Duration,
}

/// A photo assigned to the live scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedAnchor {
    pub id: AnchorId,

    /// Marker the photo was registered against
    pub reference_id: ReferenceId,

    /// Absolute photo pose in the session frame
    pub photo: Pose,

    /// Absolute avatar pose in the session frame
    pub avatar: Pose,

    pub state: VisibilityState,

    /// No re-evaluation before this session time
    pub lock_until: Duration,
}

impl PlacedAnchor {
    pub fn new(id: AnchorId, reference_id: ReferenceId, photo: Pose, avatar: Pose) -> Self {
        Self {
            id,
            reference_id,
            photo,
            avatar,
            state: VisibilityState::AvatarVisible,
            lock_until: Duration::ZERO,
        }
    }

    pub fn is_locked(&self, now: Duration) -> bool {
        now < self.lock_until
    }
}

// ============================================================================
// MEASUREMENT & EVALUATION
// ============================================================================

/// What the camera tells us about one anchor on one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// Planar distance from the observer point to the avatar
    pub distance: f64,

    pub within_geofence: bool,

    /// `None` when the facing test was not needed
    pub facing: Option<bool>,
}

/// Result of evaluating one anchor.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub state: VisibilityState,
    pub lock_until: Duration,
    pub commands: Vec<AnimationCommand>,
}

impl Evaluation {
    pub fn transitioned(&self) -> bool {
        !self.commands.is_empty()
    }
}

/// Bearing of an XZ vector in degrees, normalized to [0, 360).
pub fn bearing_deg(v: &Vector2<f64>) -> f64 {
    let deg = v.y.atan2(v.x).to_degrees();
    let normalized = deg.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs
    if normalized >= 360.0 {
        0.0
    } else {
        normalized
    }
}

/// Whether `gamma` lies within `half_angle` of `beta`, across the 0/360 seam.
pub fn is_facing(beta: f64, gamma: f64, half_angle: f64) -> bool {
    if beta < half_angle {
        gamma <= beta + half_angle || gamma >= 360.0 + beta - half_angle
    } else if beta > 360.0 - half_angle {
        gamma <= half_angle - (360.0 - beta) || gamma >= beta - half_angle
    } else {
        gamma >= beta - half_angle && gamma <= beta + half_angle
    }
}

/// Point slightly behind the camera used for the distance test.
pub fn observer_point(camera: &Pose, config: &VisibilityConfig) -> Vector2<f64> {
    let (sin_yaw, cos_yaw) = camera.yaw().sin_cos();
    let cos_pitch = camera.pitch().cos();
    let forward = Vector2::new(-sin_yaw * cos_pitch, -cos_yaw * cos_pitch);
    Vector2::new(camera.position.x, camera.position.z) - forward * config.observer_offset
}

/// Measures one anchor against the current camera pose.
pub fn measure(anchor: &PlacedAnchor, camera: &Pose, config: &VisibilityConfig) -> Measurement {
    let observer = observer_point(camera, config);
    let avatar = Vector2::new(anchor.avatar.position.x, anchor.avatar.position.z);
    let distance = (observer - avatar).norm();
    let within_geofence = distance < config.geofence_radius;

    let facing = if within_geofence && anchor.state == VisibilityState::AvatarVisible {
        let to_photo = Vector2::new(
            anchor.photo.position.x - anchor.avatar.position.x,
            anchor.photo.position.z - anchor.avatar.position.z,
        );
        let beta = bearing_deg(&to_photo);
        let gamma = bearing_deg(&camera.forward_xz());
        Some(is_facing(beta, gamma, config.facing_half_angle_deg))
    } else {
        None
    };

    Measurement {
        distance,
        within_geofence,
        facing,
    }
}

/// Applies the transition table to one anchor.
pub fn evaluate(
    anchor: &PlacedAnchor,
    measurement: &Measurement,
    now: Duration,
    config: &VisibilityConfig,
) -> Evaluation {
    let unchanged = Evaluation {
        state: anchor.state,
        lock_until: anchor.lock_until,
        commands: Vec::new(),
    };
    if anchor.is_locked(now) {
        return unchanged;
    }

    let (next, photo_kind, avatar_kind) = match anchor.state {
        VisibilityState::AvatarVisible
            if measurement.within_geofence && measurement.facing == Some(true) =>
        {
            (
                VisibilityState::PhotoVisible,
                AnimationKind::Expand,
                AnimationKind::Shrink,
            )
        }
        VisibilityState::PhotoVisible if !measurement.within_geofence => (
            VisibilityState::AvatarVisible,
            AnimationKind::Shrink,
            AnimationKind::Expand,
        ),
        _ => return unchanged,
    };

    let duration = config.transition_duration;
    Evaluation {
        state: next,
        lock_until: now + duration,
        commands: vec![
            AnimationCommand {
                anchor_id: anchor.id,
                target: AnimationTarget::Photo,
                kind: photo_kind,
                duration,
            },
            AnimationCommand {
                anchor_id: anchor.id,
                target: AnimationTarget::Avatar,
                kind: avatar_kind,
                duration,
            },
        ],
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// Per-anchor visibility state for one session.
#[derive(Debug, Clone)]
pub struct VisibilityEngine {
    config: VisibilityConfig,
    anchors: BTreeMap<AnchorId, PlacedAnchor>,

    /// Most recently revealed photo, while it stays revealed
    presented: Option<AnchorId>,
}

impl VisibilityEngine {
    pub fn new(config: VisibilityConfig) -> Result<Self, VisibilityError> {
        config.validate()?;
        Ok(Self {
            config,
            anchors: BTreeMap::new(),
            presented: None,
        })
    }

    pub fn with_defaults() -> Self {
        Self {
            config: VisibilityConfig::default(),
            anchors: BTreeMap::new(),
            presented: None,
        }
    }

    pub fn config(&self) -> &VisibilityConfig {
        &self.config
    }

    /// Adds an anchor, replacing any anchor with the same id.
    pub fn insert(&mut self, anchor: PlacedAnchor) -> Option<PlacedAnchor> {
        let previous = self.anchors.insert(anchor.id, anchor);
        if let Some(old) = &previous {
            self.forget_presented(old.id);
        }
        previous
    }

    pub fn remove(&mut self, id: AnchorId) -> Option<PlacedAnchor> {
        self.forget_presented(id);
        self.anchors.remove(&id)
    }

    /// Removes every anchor registered against one of `references`.
    pub fn remove_for_references(&mut self, references: &BTreeSet<ReferenceId>) -> Vec<AnchorId> {
        let doomed: Vec<AnchorId> = self
            .anchors
            .values()
            .filter(|a| references.contains(&a.reference_id))
            .map(|a| a.id)
            .collect();
        for id in &doomed {
            self.remove(*id);
        }
        doomed
    }

    pub fn clear(&mut self) {
        self.anchors.clear();
        self.presented = None;
    }

    /// Evaluates every anchor against the camera pose.
    pub fn tick(&mut self, camera: &Pose, now: Duration) -> Result<Vec<AnimationCommand>, VisibilityError> {
        camera.validate()?;

        let mut commands = Vec::new();
        for anchor in self.anchors.values_mut() {
            if anchor.is_locked(now) {
                continue;
            }
            let measurement = measure(anchor, camera, &self.config);
            let evaluation = evaluate(anchor, &measurement, now, &self.config);
            if !evaluation.transitioned() {
                continue;
            }

            debug!(
                "Anchor {} {:?} -> {:?} (distance {:.2} m)",
                anchor.id, anchor.state, evaluation.state, measurement.distance
            );
            anchor.state = evaluation.state;
            anchor.lock_until = evaluation.lock_until;

            match evaluation.state {
                VisibilityState::PhotoVisible => self.presented = Some(anchor.id),
                VisibilityState::AvatarVisible => {
                    if self.presented == Some(anchor.id) {
                        self.presented = None;
                    }
                }
            }
            commands.extend(evaluation.commands);
        }

        Ok(commands)
    }

    pub fn state(&self, id: AnchorId) -> Option<VisibilityState> {
        self.anchors.get(&id).map(|a| a.state)
    }

    pub fn get(&self, id: AnchorId) -> Option<&PlacedAnchor> {
        self.anchors.get(&id)
    }

    pub fn anchors(&self) -> impl Iterator<Item = &PlacedAnchor> {
        self.anchors.values()
    }

    /// The photo most recently revealed, if it is still showing.
    pub fn presented(&self) -> Option<AnchorId> {
        self.presented
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    fn forget_presented(&mut self, id: AnchorId) {
        if self.presented == Some(id) {
            self.presented = None;
        }
    }
}

/// Downsamples the frame callback to the evaluation rate.
#[derive(Debug, Clone)]
pub struct TickDivider {
    every: u64,
    frames: u64,
}

impl TickDivider {
    /// Fires on every `every`-th frame (at least every frame).
    pub fn new(every: u32) -> Self {
        Self {
            every: u64::from(every.max(1)),
            frames: 0,
        }
    }

    /// Counts a frame; returns true when this frame should be evaluated.
    pub fn tick(&mut self) -> bool {
        self.frames += 1;
        self.frames % self.every == 0
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl Default for TickDivider {
    fn default() -> Self {
        // 60 Hz tracking -> 10 Hz evaluation
        Self::new(6)
    }
}

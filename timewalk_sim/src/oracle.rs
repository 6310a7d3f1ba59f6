//! Ground truth oracle for simulation.
//!
//! The Oracle maintains the "God's eye view" of the simulated walk:
//! - True world poses of every marker and photo
//! - One session frame per simulated device (random origin and heading)
//! - Tracking event generation (marker sightings with noise, camera frames)

use nalgebra::{Rotation3, Vector3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::PI;
use timewalk_core::{
    compose_from_relative, compose_to_relative, AnchorId, PhotoPlacement, Pose, ReferenceId,
};
use timewalk_env::{CameraFrame, DeviceId, InterfaceOrientation, MarkerSighting};

/// A reference marker at its true world pose.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruthMarker {
    pub id: ReferenceId,
    pub pose: Pose,
}

/// A photo at its true world pose, hung off one marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruthPhoto {
    pub photo_id: AnchorId,
    pub reference_id: ReferenceId,

    /// Where the print is displayed
    pub photo: Pose,

    /// Where the photographer stood, facing the scene
    pub avatar: Pose,
}

/// One device's tracking session: the world pose of its session origin.
#[derive(Debug, Clone)]
pub struct DeviceSession {
    pub device: DeviceId,
    pub origin: Pose,
}

impl DeviceSession {
    /// Expresses a world pose in this session's frame.
    pub fn to_session(&self, world: &Pose) -> Pose {
        compose_to_relative(&self.origin, world)
    }

    /// Maps a session-frame pose back to the world.
    pub fn to_world(&self, session: &Pose) -> Pose {
        compose_from_relative(&self.origin, session)
    }
}

/// Screen geometry stamped on generated camera frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameOptics {
    pub viewport: [f64; 2],
    pub projection_scale: [f64; 2],
    pub interface_orientation: InterfaceOrientation,
}

impl Default for FrameOptics {
    /// A phone held in landscape with a level, unrolled camera.
    fn default() -> Self {
        Self {
            viewport: [844.0, 390.0],
            projection_scale: [1.732, 3.75], // ~60 degree horizontal field of view
            interface_orientation: InterfaceOrientation::LandscapeRight,
        }
    }
}

/// The Oracle - maintains ground truth and generates tracking events.
pub struct Oracle {
    /// Master seed for layout and noise
    physics_seed: u64,

    physics_rng: ChaCha8Rng,

    markers: BTreeMap<ReferenceId, GroundTruthMarker>,
    photos: BTreeMap<AnchorId, GroundTruthPhoto>,

    /// Devices spawned so far
    device_count: u64,

    /// Marker position noise standard deviation (meters)
    position_noise_std: f64,

    /// Marker heading noise standard deviation (radians)
    yaw_noise_std: f64,
}

impl Oracle {
    /// Creates a new Oracle with the given seed.
    pub fn new(physics_seed: u64) -> Self {
        Self {
            physics_seed,
            physics_rng: ChaCha8Rng::seed_from_u64(physics_seed),
            markers: BTreeMap::new(),
            photos: BTreeMap::new(),
            device_count: 0,
            position_noise_std: 0.01, // 1cm noise by default
            yaw_noise_std: 0.005,
        }
    }

    /// Sets the marker position noise standard deviation.
    pub fn set_position_noise(&mut self, std_dev: f64) {
        self.position_noise_std = std_dev;
    }

    /// Sets the marker heading noise standard deviation.
    pub fn set_yaw_noise(&mut self, std_dev: f64) {
        self.yaw_noise_std = std_dev;
    }

    pub fn add_marker(&mut self, id: ReferenceId, pose: Pose) {
        self.markers.insert(id, GroundTruthMarker { id, pose });
    }

    /// Lays `count` markers out along a walk, `spacing` meters apart with
    /// random headings. Ids start at `first_id`.
    pub fn add_marker_walk(&mut self, first_id: ReferenceId, count: usize, spacing: f64) -> Vec<ReferenceId> {
        let mut ids = Vec::with_capacity(count);
        let mut position = Vector3::new(0.0, 0.0, 0.0);
        for i in 0..count {
            let id = first_id + i as ReferenceId;
            let heading = self.physics_rng.gen_range(-PI..PI);
            let height = self.physics_rng.gen_range(1.0..1.8);
            self.add_marker(id, Pose::from_position_yaw(position.x, height, position.z, heading));
            ids.push(id);

            let bend: f64 = self.physics_rng.gen_range(-0.6..0.6);
            position += Vector3::new(bend.sin(), 0.0, -bend.cos()) * spacing;
        }
        ids
    }

    pub fn marker(&self, id: ReferenceId) -> Option<&GroundTruthMarker> {
        self.markers.get(&id)
    }

    pub fn markers(&self) -> impl Iterator<Item = &GroundTruthMarker> {
        self.markers.values()
    }

    /// Places a photo whose photographer stood at `avatar`. The print
    /// hangs `photo_distance` meters ahead of them at eye level.
    pub fn add_photo(
        &mut self,
        photo_id: AnchorId,
        reference_id: ReferenceId,
        avatar: Pose,
        photo_distance: f64,
    ) -> GroundTruthPhoto {
        let forward = avatar.forward_xz();
        let photo = Pose::new(
            avatar.position + Vector3::new(forward.x, 0.0, forward.y) * photo_distance
                + Vector3::new(0.0, 1.5, 0.0),
            avatar.orientation,
        );
        let truth = GroundTruthPhoto {
            photo_id,
            reference_id,
            photo,
            avatar,
        };
        self.photos.insert(photo_id, truth.clone());
        truth
    }

    pub fn photo(&self, photo_id: AnchorId) -> Option<&GroundTruthPhoto> {
        self.photos.get(&photo_id)
    }

    /// Exact stored placement of a photo relative to its marker.
    pub fn placement(&self, photo_id: AnchorId) -> Option<PhotoPlacement> {
        let photo = self.photos.get(&photo_id)?;
        let marker = self.markers.get(&photo.reference_id)?;
        // Any common frame works for the relative pose; use the world
        Some(PhotoPlacement::from_session(
            photo_id,
            photo.reference_id,
            &marker.pose,
            &photo.photo,
            &photo.avatar,
        ))
    }

    /// Starts a new device session with a random origin and heading.
    pub fn spawn_device(&mut self) -> DeviceSession {
        self.device_count += 1;
        let x = self.physics_rng.gen_range(-20.0..20.0);
        let z = self.physics_rng.gen_range(-20.0..20.0);
        let heading = self.physics_rng.gen_range(-PI..PI);

        DeviceSession {
            device: DeviceId::from_seed(self.physics_seed ^ self.device_count),
            origin: Pose::from_position_yaw(x, 0.0, z, heading),
        }
    }

    /// Generates a noisy sighting of marker `id` in `session`'s frame.
    pub fn sight_marker(
        &mut self,
        session: &DeviceSession,
        id: ReferenceId,
        timestamp_ms: u64,
    ) -> Option<MarkerSighting> {
        let truth = session.to_session(&self.markers.get(&id)?.pose);

        let noise = Vector3::new(
            self.sample_noise(self.position_noise_std),
            self.sample_noise(self.position_noise_std),
            self.sample_noise(self.position_noise_std),
        );
        let position = truth.position + noise;
        let yaw = truth.yaw() + self.sample_noise(self.yaw_noise_std);

        let m = Rotation3::from_axis_angle(&Vector3::y_axis(), yaw);
        let m = m.matrix();
        Some(MarkerSighting {
            marker_id: id,
            position: [position.x, position.y, position.z],
            rotation: [
                [m[(0, 0)], m[(0, 1)], m[(0, 2)]],
                [m[(1, 0)], m[(1, 1)], m[(1, 2)]],
                [m[(2, 0)], m[(2, 1)], m[(2, 2)]],
            ],
            timestamp_ms,
        })
    }

    /// Generates the tracking frame of a camera at world pose `camera`.
    pub fn camera_frame(
        &self,
        session: &DeviceSession,
        camera: &Pose,
        optics: &FrameOptics,
        timestamp_ms: u64,
    ) -> CameraFrame {
        let local = session.to_session(camera);
        CameraFrame {
            position: [local.position.x, local.position.y, local.position.z],
            euler: [local.pitch(), local.yaw(), local.roll()],
            interface_orientation: optics.interface_orientation,
            viewport: optics.viewport,
            projection_scale: optics.projection_scale,
            timestamp_ms,
        }
    }

    /// Gaussian jitter with the given deviation.
    pub fn jitter(&mut self, std_dev: f64) -> f64 {
        self.sample_noise(std_dev)
    }

    fn sample_noise(&mut self, std_dev: f64) -> f64 {
        match Normal::new(0.0, std_dev) {
            Ok(normal) => normal.sample(&mut self.physics_rng),
            Err(_) => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use timewalk_core::session::{camera_pose, marker_pose};

    #[test]
    fn test_oracle_noiseless_sighting_matches_session_frame() {
        let mut oracle = Oracle::new(42);
        oracle.set_position_noise(0.0);
        oracle.set_yaw_noise(0.0);
        oracle.add_marker(1, Pose::from_position_yaw(3.0, 1.5, -4.0, 0.7));

        let session = oracle.spawn_device();
        let sighting = oracle.sight_marker(&session, 1, 0).unwrap();
        let seen = marker_pose(&sighting).unwrap();

        let world = session.to_world(&seen);
        assert!((world.position - Vector3::new(3.0, 1.5, -4.0)).norm() < 1e-9);
        assert!((world.yaw() - 0.7).sin().abs() < 1e-9);
    }

    #[test]
    fn test_oracle_unknown_marker() {
        let mut oracle = Oracle::new(42);
        let session = oracle.spawn_device();
        assert!(oracle.sight_marker(&session, 9, 0).is_none());
    }

    #[test]
    fn test_oracle_camera_frame_round_trip() {
        let mut oracle = Oracle::new(3);
        let session = oracle.spawn_device();
        let camera = Pose::new(Vector3::new(1.0, 1.6, 2.0), Vector3::new(0.1, -0.4, 0.0));

        let frame = oracle.camera_frame(&session, &camera, &FrameOptics::default(), 16);
        let back = session.to_world(&camera_pose(&frame));

        assert!((back.position - camera.position).norm() < 1e-9);
        assert!((back.yaw() - camera.yaw()).sin().abs() < 1e-9);
        assert_eq!(frame.timestamp_ms, 16);
    }

    #[test]
    fn test_oracle_placement_survives_device_frame() {
        let mut oracle = Oracle::new(5);
        oracle.add_marker(1, Pose::from_position_yaw(0.0, 1.4, 0.0, 1.2));
        let truth = oracle.add_photo(10, 1, Pose::from_position_yaw(2.0, 0.0, -3.0, 0.3), 2.0);

        let placement = oracle.placement(10).unwrap();
        let session = oracle.spawn_device();
        let marker_in_session = session.to_session(&oracle.marker(1).unwrap().pose);
        let (_, avatar) = placement.place(&marker_in_session);

        let expected = session.to_session(&truth.avatar);
        assert!((avatar.position - expected.position).norm() < 1e-9);
    }

    #[test]
    fn test_oracle_deterministic_noise() {
        let mut oracle1 = Oracle::new(42);
        let mut oracle2 = Oracle::new(42);
        oracle1.add_marker(1, Pose::origin());
        oracle2.add_marker(1, Pose::origin());

        let s1 = oracle1.spawn_device();
        let s2 = oracle2.spawn_device();
        let reading1 = oracle1.sight_marker(&s1, 1, 0).unwrap();
        let reading2 = oracle2.sight_marker(&s2, 1, 0).unwrap();

        // Same seed = same noise
        assert_eq!(reading1.position, reading2.position);
        assert_eq!(reading1.rotation, reading2.rotation);
        assert_eq!(s1.device, s2.device);
    }

    #[test]
    fn test_oracle_marker_walk_spacing() {
        let mut oracle = Oracle::new(8);
        let ids = oracle.add_marker_walk(1, 4, 5.0);
        assert_eq!(ids, vec![1, 2, 3, 4]);

        let a = oracle.marker(1).unwrap().pose;
        let b = oracle.marker(2).unwrap().pose;
        assert!((a.planar_distance(&b) - 5.0).abs() < 1e-9);
    }
}

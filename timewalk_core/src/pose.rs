//! Pose algebra - composing poses between marker frames
//!
//! Every reference marker is a vertical, gravity-aligned plane, so two
//! marker frames differ by a translation and a rotation about +y only.
//! Composition therefore rotates the horizontal (x, z) pair by yaw and
//! carries pitch/roll through from the operand that owns them.
//!
//! Axes follow the tracking convention: right-handed, +y up, -z forward.

use nalgebra::{Matrix3, Rotation3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when a caller hands us a pose that is not physical.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PoseError {
    #[error("Non-finite pose component: {component} = {value}")]
    NonFinite { component: &'static str, value: f64 },
}

/// A position plus euler orientation in some frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// Position [x, y, z] in meters
    pub position: Vector3<f64>,

    /// Euler angles [pitch, yaw, roll] in radians
    pub orientation: Vector3<f64>,
}

impl Default for Pose {
    fn default() -> Self {
        Self::origin()
    }
}

impl Pose {
    pub fn new(position: Vector3<f64>, orientation: Vector3<f64>) -> Self {
        Self {
            position,
            orientation,
        }
    }

    /// The identity pose.
    pub fn origin() -> Self {
        Self::new(Vector3::zeros(), Vector3::zeros())
    }

    /// A level pose at `(x, y, z)` turned by `yaw` radians.
    pub fn from_position_yaw(x: f64, y: f64, z: f64, yaw: f64) -> Self {
        Self::new(Vector3::new(x, y, z), Vector3::new(0.0, yaw, 0.0))
    }

    pub fn pitch(&self) -> f64 {
        self.orientation.x
    }

    pub fn yaw(&self) -> f64 {
        self.orientation.y
    }

    pub fn roll(&self) -> f64 {
        self.orientation.z
    }

    /// Horizontal viewing direction `(x, z)` of this pose.
    pub fn forward_xz(&self) -> Vector2<f64> {
        let yaw = self.yaw();
        Vector2::new(-yaw.sin(), -yaw.cos())
    }

    /// Full 3-axis rotation, applied as yaw · pitch · roll.
    pub fn rotation(&self) -> Rotation3<f64> {
        Rotation3::from_axis_angle(&Vector3::y_axis(), self.yaw())
            * Rotation3::from_axis_angle(&Vector3::x_axis(), self.pitch())
            * Rotation3::from_axis_angle(&Vector3::z_axis(), self.roll())
    }

    /// Distance between two poses projected onto the floor plane.
    pub fn planar_distance(&self, other: &Pose) -> f64 {
        let dx = self.position.x - other.position.x;
        let dz = self.position.z - other.position.z;
        (dx * dx + dz * dz).sqrt()
    }

    /// Rejects NaN or infinite components.
    pub fn validate(&self) -> Result<(), PoseError> {
        const NAMES: [&str; 6] = [
            "position.x",
            "position.y",
            "position.z",
            "orientation.pitch",
            "orientation.yaw",
            "orientation.roll",
        ];
        let values = self.position.iter().chain(self.orientation.iter());
        for (&component, &value) in NAMES.iter().zip(values) {
            if !value.is_finite() {
                return Err(PoseError::NonFinite { component, value });
            }
        }
        Ok(())
    }
}

/// Places `relative` (expressed in `reference`'s local frame) into the
/// frame `reference` itself lives in.
pub fn compose_from_relative(reference: &Pose, relative: &Pose) -> Pose {
    let (sin, cos) = reference.yaw().sin_cos();
    let local = relative.position;

    let position = Vector3::new(
        local.x * cos + local.z * sin,
        local.y,
        -local.x * sin + local.z * cos,
    ) + reference.position;

    let orientation = Vector3::new(
        relative.pitch(),
        relative.yaw() + reference.yaw(),
        relative.roll(),
    );

    Pose::new(position, orientation)
}

/// Expresses `target` in `reference`'s local frame.
///
/// Exact inverse of [`compose_from_relative`].
pub fn compose_to_relative(reference: &Pose, target: &Pose) -> Pose {
    let (sin, cos) = reference.yaw().sin_cos();
    let d = target.position - reference.position;

    let position = Vector3::new(d.x * cos - d.z * sin, d.y, d.x * sin + d.z * cos);

    let orientation = Vector3::new(
        target.pitch(),
        target.yaw() - reference.yaw(),
        target.roll(),
    );

    Pose::new(position, orientation)
}

/// Recovers a marker's yaw from the tracking system's anchor rotation.
pub fn yaw_from_rotation(m: &Matrix3<f64>) -> f64 {
    let yaw = m[(0, 0)].clamp(-1.0, 1.0).acos();
    if m[(2, 0)] > 0.0 {
        -yaw
    } else {
        yaw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn assert_pose_eq(a: &Pose, b: &Pose, epsilon: f64) {
        assert_relative_eq!(a.position, b.position, epsilon = epsilon);
        assert_relative_eq!(a.orientation, b.orientation, epsilon = epsilon);
    }

    #[test]
    fn test_identity_reference() {
        let p = Pose::new(Vector3::new(1.5, -0.2, 3.0), Vector3::new(0.1, 0.7, -0.3));
        let composed = compose_from_relative(&Pose::origin(), &p);
        assert_eq!(composed, p);
    }

    #[test]
    fn test_quarter_turn() {
        let reference = Pose::from_position_yaw(1.0, 0.0, 0.0, FRAC_PI_2);
        let relative = Pose::from_position_yaw(0.0, 0.0, -1.0, 0.0);

        // One meter ahead of a pose facing -x
        let absolute = compose_from_relative(&reference, &relative);
        assert_relative_eq!(absolute.position, Vector3::new(0.0, 0.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(absolute.yaw(), FRAC_PI_2, epsilon = 1e-12);
    }

    #[test]
    fn test_height_untouched() {
        let reference = Pose::from_position_yaw(0.0, 2.0, 0.0, 1.1);
        let relative = Pose::from_position_yaw(0.3, -0.5, 0.4, 0.0);
        let absolute = compose_from_relative(&reference, &relative);
        assert_relative_eq!(absolute.position.y, 1.5, epsilon = 1e-12);
    }

    #[test]
    fn test_pitch_roll_from_operand() {
        let reference = Pose::new(Vector3::zeros(), Vector3::new(0.4, 0.2, 0.9));
        let relative = Pose::new(Vector3::zeros(), Vector3::new(-0.1, 0.3, 0.05));

        let absolute = compose_from_relative(&reference, &relative);
        assert_relative_eq!(absolute.pitch(), -0.1);
        assert_relative_eq!(absolute.roll(), 0.05);

        let back = compose_to_relative(&reference, &absolute);
        assert_relative_eq!(back.pitch(), -0.1);
        assert_relative_eq!(back.roll(), 0.05);
    }

    #[test]
    fn test_chain_associativity() {
        let a = Pose::from_position_yaw(2.0, 0.0, -1.0, 0.6);
        let ab = Pose::from_position_yaw(3.0, 0.1, 1.0, -1.2);
        let bc = Pose::from_position_yaw(-0.5, 0.0, 2.0, 2.5);

        let b = compose_from_relative(&a, &ab);
        let c = compose_from_relative(&b, &bc);

        let ac = compose_from_relative(&ab, &bc);
        let c_direct = compose_from_relative(&a, &ac);

        assert_pose_eq(&c, &c_direct, 1e-9);
    }

    #[test]
    fn test_yaw_from_rotation() {
        for &yaw in &[0.0, 0.3, -0.3, 1.2, -2.5, PI - 1e-6] {
            let m = *Rotation3::from_axis_angle(&Vector3::y_axis(), yaw).matrix();
            assert_relative_eq!(yaw_from_rotation(&m), yaw, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_yaw_from_rotation_clamps() {
        let mut m = Matrix3::identity();
        m[(0, 0)] = 1.0 + 1e-12;
        assert_eq!(yaw_from_rotation(&m), 0.0);
    }

    #[test]
    fn test_rotation_matches_forward() {
        let pose = Pose::from_position_yaw(0.0, 0.0, 0.0, 0.8);
        let forward = pose.rotation() * Vector3::new(0.0, 0.0, -1.0);
        let xz = pose.forward_xz();
        assert_relative_eq!(forward.x, xz.x, epsilon = 1e-12);
        assert_relative_eq!(forward.z, xz.y, epsilon = 1e-12);
    }

    #[test]
    fn test_validate_names_component() {
        let mut pose = Pose::origin();
        assert!(pose.validate().is_ok());

        pose.orientation.y = f64::NAN;
        match pose.validate() {
            Err(PoseError::NonFinite { component, .. }) => assert_eq!(component, "orientation.yaw"),
            other => panic!("expected NonFinite, got {:?}", other),
        }
    }

    fn finite_pose() -> impl Strategy<Value = Pose> {
        (
            -100.0..100.0f64,
            -10.0..10.0f64,
            -100.0..100.0f64,
            -PI..PI,
            -4.0 * PI..4.0 * PI,
            -PI..PI,
        )
            .prop_map(|(x, y, z, pitch, yaw, roll)| {
                Pose::new(Vector3::new(x, y, z), Vector3::new(pitch, yaw, roll))
            })
    }

    proptest! {
        #[test]
        fn prop_round_trip(reference in finite_pose(), relative in finite_pose()) {
            let absolute = compose_from_relative(&reference, &relative);
            let back = compose_to_relative(&reference, &absolute);

            prop_assert!((back.position - relative.position).norm() < 1e-4);
            prop_assert!((back.orientation - relative.orientation).norm() < 1e-4);
        }

        #[test]
        fn prop_finite_in_finite_out(reference in finite_pose(), target in finite_pose()) {
            prop_assert!(compose_to_relative(&reference, &target).validate().is_ok());
            prop_assert!(compose_from_relative(&reference, &target).validate().is_ok());
        }
    }
}

//! Screen projection guide - where to point the user for off-screen avatars
//!
//! A target in the session frame is moved into camera space, turned into a
//! pair of spherical angles `(theta, phi)` and projected through a pinhole
//! model onto the viewport. Targets outside the field of view snap to the
//! viewport edge they lie beyond, so the HUD can show an arrow there.
//!
//! `theta` is measured from the screen's vertical axis (pi/2 on the
//! horizon line), `phi` is the signed horizontal angle from straight ahead.
//! The camera sensor is mounted landscape, so which camera axis is "screen
//! vertical" depends on the interface orientation.

use crate::pose::Pose;
use nalgebra::{Point2, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_2, PI};
use thiserror::Error;
use timewalk_env::InterfaceOrientation;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GuideError {
    #[error("Invalid field of view on {axis}: {value} rad")]
    InvalidFov { axis: &'static str, value: f64 },

    #[error("Invalid viewport {width}x{height}")]
    InvalidViewport { width: f64, height: f64 },

    #[error("Non-finite camera intrinsics: {0}")]
    NonFinite(String),
}

/// Configuration for the guide
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuideConfig {
    /// Avatars are targeted at eye level above their feet (default: 1.65 m)
    pub eye_height: f64,
}

impl Default for GuideConfig {
    fn default() -> Self {
        Self { eye_height: 1.65 }
    }
}

/// Viewport size, focal lengths and field of view for one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    /// Viewport [width, height] in points
    pub viewport: Vector2<f64>,

    /// Focal length [fx, fy] in points
    pub focal_px: Vector2<f64>,

    /// Full field of view [horizontal, vertical] in radians
    pub fov: Vector2<f64>,
}

impl CameraIntrinsics {
    pub fn new(
        viewport: Vector2<f64>,
        focal_px: Vector2<f64>,
        fov: Vector2<f64>,
    ) -> Result<Self, GuideError> {
        let intrinsics = Self {
            viewport,
            focal_px,
            fov,
        };
        intrinsics.validate()?;
        Ok(intrinsics)
    }

    /// Derives intrinsics from the projection matrix scale terms
    /// (`m00`, `m11`) computed for the current viewport.
    pub fn from_projection(
        x_scale: f64,
        y_scale: f64,
        viewport: Vector2<f64>,
    ) -> Result<Self, GuideError> {
        let (width, height) = (viewport.x, viewport.y);
        let fov_x = 2.0 * (1.0 / x_scale).atan();
        let fov_y = fov_x * height / width;

        Self::new(
            viewport,
            Vector2::new(x_scale * width / 2.0, y_scale * height / 2.0),
            Vector2::new(fov_x, fov_y),
        )
    }

    pub fn validate(&self) -> Result<(), GuideError> {
        let mut all = self
            .viewport
            .iter()
            .chain(self.focal_px.iter())
            .chain(self.fov.iter());
        if all.any(|v| !v.is_finite()) {
            return Err(GuideError::NonFinite(format!(
                "viewport={:?} focal={:?} fov={:?}",
                self.viewport, self.focal_px, self.fov
            )));
        }
        if self.viewport.x <= 0.0 || self.viewport.y <= 0.0 {
            return Err(GuideError::InvalidViewport {
                width: self.viewport.x,
                height: self.viewport.y,
            });
        }
        for (axis, value) in [("x", self.fov.x), ("y", self.fov.y)] {
            if value <= 0.0 || value >= PI {
                return Err(GuideError::InvalidFov { axis, value });
            }
        }
        Ok(())
    }

    pub fn center(&self) -> Point2<f64> {
        Point2::new(self.viewport.x / 2.0, self.viewport.y / 2.0)
    }
}

/// Projection of one pair of angles onto the viewport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenProjection {
    /// Position in viewport points, clamped to the viewport
    pub screen: Point2<f64>,

    pub on_frame: bool,

    /// 0 at the center, 1 at (or beyond) the half-width circle
    pub fixed_distance_from_center: f64,

    /// 0 inside the frustum, 1 at the far side of the sphere
    pub fixed_great_circle_distance_to_frame: f64,
}

/// Where a target appears to the camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewingPosition {
    pub theta: f64,
    pub phi: f64,

    /// Distance from the camera in meters
    pub radius: f64,

    pub screen: Point2<f64>,
    pub on_frame: bool,
    pub fixed_distance_from_center: f64,
    pub fixed_great_circle_distance_to_frame: f64,
}

/// Safe-area insets of the display in points.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SafeAreaInsets {
    pub top: f64,
    pub bottom: f64,
    pub left: f64,
    pub right: f64,
}

/// Projects targets for one camera configuration.
#[derive(Debug, Clone)]
pub struct SpatialGuide {
    intrinsics: CameraIntrinsics,
    config: GuideConfig,
}

impl SpatialGuide {
    pub fn new(intrinsics: CameraIntrinsics, config: GuideConfig) -> Result<Self, GuideError> {
        intrinsics.validate()?;
        Ok(Self { intrinsics, config })
    }

    pub fn intrinsics(&self) -> &CameraIntrinsics {
        &self.intrinsics
    }

    pub fn config(&self) -> &GuideConfig {
        &self.config
    }

    /// Replaces the intrinsics after a viewport or orientation change.
    pub fn set_intrinsics(&mut self, intrinsics: CameraIntrinsics) -> Result<(), GuideError> {
        intrinsics.validate()?;
        self.intrinsics = intrinsics;
        Ok(())
    }

    /// Full pipeline for an arbitrary world point.
    pub fn view(
        &self,
        camera: &Pose,
        target: &Vector3<f64>,
        orientation: InterfaceOrientation,
    ) -> ViewingPosition {
        let local = camera_space(camera, target);
        let (theta, phi) = spherical_angles(&local, orientation);
        let projection = self.view_angles(theta, phi);

        ViewingPosition {
            theta,
            phi,
            radius: local.norm(),
            screen: projection.screen,
            on_frame: projection.on_frame,
            fixed_distance_from_center: projection.fixed_distance_from_center,
            fixed_great_circle_distance_to_frame: projection.fixed_great_circle_distance_to_frame,
        }
    }

    /// Guide toward an avatar's eye level.
    pub fn view_avatar(
        &self,
        camera: &Pose,
        avatar: &Pose,
        orientation: InterfaceOrientation,
    ) -> ViewingPosition {
        self.view(camera, &avatar_target(avatar, &self.config), orientation)
    }

    /// Projection step alone.
    pub fn view_angles(&self, theta: f64, phi: f64) -> ScreenProjection {
        let CameraIntrinsics {
            viewport,
            focal_px,
            fov,
        } = &self.intrinsics;
        let (width, height) = (viewport.x, viewport.y);
        let half_x = fov.x / 2.0;
        let half_y = fov.y / 2.0;
        let elevation = theta - FRAC_PI_2;

        let mut x = width / 2.0 + phi.tan() * focal_px.x;
        let mut y = height / 2.0 + (FRAC_PI_2 - theta).tan() * focal_px.y;

        if phi.abs() <= half_x {
            x = x.clamp(0.0, width);
        } else if phi > 0.0 {
            x = width;
        } else {
            x = 0.0;
        }

        if elevation < -half_y {
            y = height;
        } else if elevation > half_y {
            y = 0.0;
        } else {
            y = y.clamp(0.0, height);
        }

        let screen = Point2::new(x, y);
        ScreenProjection {
            screen,
            on_frame: phi.abs() <= half_x && elevation.abs() < half_y,
            fixed_distance_from_center: fixed_distance_from_center(&screen, viewport),
            fixed_great_circle_distance_to_frame: fixed_great_circle_distance_to_frame(theta, phi, fov),
        }
    }
}

/// Target expressed in the camera's local frame.
pub fn camera_space(camera: &Pose, target: &Vector3<f64>) -> Vector3<f64> {
    camera.rotation().inverse() * (target - camera.position)
}

/// Point the guide aims at for an avatar.
pub fn avatar_target(avatar: &Pose, config: &GuideConfig) -> Vector3<f64> {
    avatar.position + Vector3::new(0.0, config.eye_height, 0.0)
}

fn sign(v: f64) -> f64 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn safe_acos(v: f64) -> f64 {
    v.clamp(-1.0, 1.0).acos()
}

/// `acos(num / den)`, or `fallback` when `den` is zero.
fn ratio_acos(num: f64, den: f64, fallback: f64) -> f64 {
    if den > 0.0 {
        safe_acos(num / den)
    } else {
        fallback
    }
}

/// Spherical angles of a camera-space point for the given orientation.
pub fn spherical_angles(p: &Vector3<f64>, orientation: InterfaceOrientation) -> (f64, f64) {
    let r = p.norm();
    let yz = p.y.hypot(p.z);
    let xz = p.x.hypot(p.z);

    match orientation {
        InterfaceOrientation::Portrait => (
            ratio_acos(p.x, r, FRAC_PI_2),
            sign(p.y) * ratio_acos(-p.z, yz, 0.0),
        ),
        InterfaceOrientation::PortraitUpsideDown => (
            ratio_acos(-p.x, r, FRAC_PI_2),
            sign(-p.y) * ratio_acos(-p.z, yz, 0.0),
        ),
        InterfaceOrientation::LandscapeLeft => (
            ratio_acos(p.y, r, FRAC_PI_2),
            sign(-p.x) * ratio_acos(-p.z, xz, 0.0),
        ),
        InterfaceOrientation::LandscapeRight => (
            ratio_acos(-p.y, r, FRAC_PI_2),
            sign(p.x) * ratio_acos(-p.z, xz, 0.0),
        ),
    }
}

/// Aspect-corrected distance of a screen point from the center,
/// in half-widths, capped at 1.
pub fn fixed_distance_from_center(screen: &Point2<f64>, viewport: &Vector2<f64>) -> f64 {
    let aspect = viewport.y / viewport.x;
    let x = screen.x - viewport.x / 2.0;
    let y = (screen.y - viewport.y / 2.0) / aspect;
    ((x * x + y * y).sqrt() / (viewport.x / 2.0)).clamp(0.0, 1.0)
}

/// How far the camera must turn before the target enters the frustum,
/// normalized by the frustum's far corner.
pub fn fixed_great_circle_distance_to_frame(theta: f64, phi: f64, fov: &Vector2<f64>) -> f64 {
    let max_theta = FRAC_PI_2 - fov.y / 2.0;
    let max_phi = PI - fov.x / 2.0;
    let max = safe_acos(max_theta.cos() * max_phi.cos());

    let delta_theta = ((theta - FRAC_PI_2).abs() - fov.y / 2.0).max(0.0);
    let delta_phi = (phi.abs() - fov.x / 2.0).max(0.0);
    let delta = safe_acos(delta_theta.cos() * delta_phi.cos());

    if max > 0.0 {
        (delta / max).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Rotation of the HUD arrow pointing from the screen center to `screen`.
pub fn arrow_direction(screen: &Point2<f64>, viewport: &Vector2<f64>) -> f64 {
    let x = screen.x - viewport.x / 2.0;
    let y = screen.y - viewport.y / 2.0;
    let length = x.hypot(y);
    if length == 0.0 {
        return 0.0;
    }
    sign(y) * safe_acos(x / length)
}

/// Keeps an icon of `icon_size` points fully inside the safe area.
pub fn clamp_icon(
    screen: &Point2<f64>,
    viewport: &Vector2<f64>,
    icon_size: f64,
    safe_area: &SafeAreaInsets,
) -> Point2<f64> {
    let half = icon_size / 2.0;
    let mut fixed = *screen;

    if screen.x < half + safe_area.left {
        fixed.x = half + safe_area.left;
    } else if viewport.x - half - safe_area.right < screen.x {
        fixed.x = viewport.x - half - safe_area.right;
    }
    if screen.y < half + safe_area.top {
        fixed.y = half + safe_area.top;
    } else if viewport.y - half - safe_area.bottom < screen.y {
        fixed.y = viewport.y - half - safe_area.bottom;
    }

    fixed
}

/// Fade for on-frame icons: invisible in the central half, opaque at the rim.
pub fn on_frame_opacity(fixed_distance_from_center: f64) -> f64 {
    ((fixed_distance_from_center - 0.5) / 0.5).clamp(0.0, 1.0)
}

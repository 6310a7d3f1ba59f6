//! Scenario runner - executes cross-session test scenarios.
//!
//! Every scenario builds a ground-truth world in the [`Oracle`], drives one
//! or more [`PresentationSession`]s with generated tracking events, and
//! checks what the sessions placed or showed against that truth.

use crate::context::SimContext;
use crate::exporter::{AnchorFrame, SimEvent, SimExport, SimFrame};
use crate::oracle::{DeviceSession, FrameOptics, Oracle};
use crate::scenarios::ScenarioId;

use nalgebra::{Vector2, Vector3};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use timewalk_core::spatial_guide::clamp_icon;
use timewalk_core::{
    compose_from_relative, AnchorId, AnimationKind, AnimationTarget, CameraIntrinsics,
    FrameOutcome, LinkStore, MarkerOutcome, MemoryLinkStore, Pose, PresentationSession,
    ReferenceId, SafeAreaInsets, SessionConfig, SessionError, StoreError,
};
use timewalk_env::{tracking_channel, EnvError, SessionContext, TrackingEvent};
use tracing::{debug, info};

/// Camera height above the floor for a walking viewer (meters).
const CAMERA_HEIGHT: f64 = 1.6;

/// HUD icon edge length used when clamping off-screen guides (points).
const ICON_SIZE: f64 = 44.0;

/// Errors that abort a scenario before its assertions run.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Tracking channel error: {0}")]
    Env(#[from] EnvError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("No ground truth for {0}")]
    MissingTruth(String),
}

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Tracking frame rate in Hz
    pub tick_rate_hz: u32,

    /// Simulation duration in seconds
    pub max_duration_secs: f64,

    /// Marker position noise standard deviation (meters)
    pub position_noise_std: f64,

    /// Marker heading noise standard deviation (radians)
    pub yaw_noise_std: f64,

    /// Session configuration handed to every simulated device
    pub session: SessionConfig,

    /// Record every n-th frame for export (0 = no export)
    pub export_every: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            tick_rate_hz: 60,
            max_duration_secs: 10.0,
            position_noise_std: 0.01,
            yaw_noise_std: 0.005,
            session: SessionConfig::default(),
            export_every: 0,
        }
    }
}

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total tracking frames executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,

    /// Recorded frames, when export was requested
    pub export: Option<SimExport>,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScenarioMetrics {
    /// Camera frames fed to sessions
    pub frames: u64,

    /// Marker sightings fed to sessions
    pub markers: u64,

    /// Links created by relocalization
    pub links_created: u64,

    /// Anchors placed on relocalization
    pub anchors_placed: u64,

    /// Photo reveal or hide transitions
    pub transitions: u64,

    /// Shortest gap between two transitions of one anchor (ms)
    pub min_transition_gap_ms: Option<u64>,

    /// Worst avatar placement error against ground truth (meters)
    pub max_position_error_m: Option<f64>,

    /// Frames where the guided avatar was inside the frustum
    pub on_frame_ticks: u64,

    /// Largest normalized great-circle distance seen off-frame
    pub max_great_circle: f64,

    /// Tracking events the session refused
    pub rejected_events: u64,
}

/// Runs cross-session scenarios.
pub struct ScenarioRunner {
    config: SimConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self::from_config(SimConfig {
            seed,
            ..SimConfig::default()
        })
    }

    pub fn from_config(config: SimConfig) -> Self {
        Self { config }
    }

    /// Sets the tick rate.
    pub fn with_tick_rate(mut self, hz: u32) -> Self {
        self.config.tick_rate_hz = hz.max(1);
        self
    }

    /// Sets the maximum duration.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.config.max_duration_secs = secs;
        self
    }

    /// Sets the marker sighting noise.
    pub fn with_noise(mut self, position_std: f64, yaw_std: f64) -> Self {
        self.config.position_noise_std = position_std;
        self.config.yaw_noise_std = yaw_std;
        self
    }

    /// Records every `every`-th frame into the result's export.
    pub fn with_export(mut self, every: u32) -> Self {
        self.config.export_every = every;
        self
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.config.seed);
        if scenario.uses_channel() {
            debug!("Second device is fed through a tracking channel");
        }

        let mut run = ScenarioRun::new(scenario, &self.config);
        let outcome = match scenario {
            ScenarioId::CrossSession => self.run_cross_session(&mut run),
            ScenarioId::ChainResolve => self.run_chain_resolve(&mut run),
            ScenarioId::Hysteresis => self.run_hysteresis(&mut run),
            ScenarioId::FacingSweep => self.run_facing_sweep(&mut run),
            ScenarioId::GuideSweep => self.run_guide_sweep(&mut run),
        };
        run.finish(scenario, outcome)
    }

    /// DST-001: CrossSession - photo found through a linked marker.
    ///
    /// Device A registers a photo at marker 1 and then walks to marker 2,
    /// which links the two. Device B, in a fresh session frame, only sees
    /// marker 2 and must still place the photo.
    ///
    /// **Assertion**: B's avatar lands within the noise bound of ground truth.
    fn run_cross_session(&self, run: &mut ScenarioRun) -> Result<Option<String>, SimError> {
        info!("DST-001: CrossSession - photo found through a linked marker");

        let photo_id: AnchorId = 100;
        run.oracle.add_marker(1, Pose::from_position_yaw(0.0, 1.5, 0.0, 0.0));
        run.oracle.add_marker(2, Pose::from_position_yaw(6.0, 1.2, -2.0, 0.8));
        let truth = run
            .oracle
            .add_photo(photo_id, 1, Pose::from_position_yaw(1.0, 0.0, 3.0, 0.2), 2.0);

        let store: Arc<dyn LinkStore> = Arc::new(MemoryLinkStore::new());
        let region: BTreeSet<ReferenceId> = [1, 2].into_iter().collect();
        let optics = FrameOptics::default();
        let walk_ticks = (self.target_ticks() / 2).max(1);

        // Device A registers at marker 1, then walks over to marker 2
        let device_a = run.oracle.spawn_device();
        let mut session_a = self.session(run, &store, &region)?;
        run.sight(&mut session_a, &device_a, 1)?;
        session_a.register_photo(
            photo_id,
            &device_a.to_session(&truth.photo),
            &device_a.to_session(&truth.avatar),
        )?;

        let start = Vector3::new(0.0, CAMERA_HEIGHT, 2.0);
        let end = Vector3::new(6.0, CAMERA_HEIGHT, 0.0);
        let heading = look_yaw(&start, &end);
        for tick in 0..walk_ticks {
            let t = (tick + 1) as f64 / walk_ticks as f64;
            let camera = Pose::new(start.lerp(&end, t), Vector3::new(0.0, heading, 0.0));
            run.frame(&mut session_a, &device_a, &camera, &optics)?;
        }

        let linked = run.sight(&mut session_a, &device_a, 2)?;
        if linked.links.len() != 2 {
            return Ok(Some(format!(
                "Expected a link pair between markers 1 and 2, got {} links",
                linked.links.len()
            )));
        }

        // Device B only ever sees marker 2
        let device_b = run.oracle.spawn_device();
        let mut session_b = self.session(run, &store, &region)?;
        let frames = self.target_ticks().saturating_sub(walk_ticks).max(1);
        let (sink, source) = tracking_channel(device_b.device, frames as usize + 1);

        let sighting = run
            .oracle
            .sight_marker(&device_b, 2, run.context.time_ms())
            .ok_or_else(|| SimError::MissingTruth("marker 2".to_string()))?;
        sink.try_push(TrackingEvent::Marker(sighting))?;

        let view_from = Vector3::new(4.0, CAMERA_HEIGHT, 1.0);
        let frame_ms = (run.dt.as_millis() as u64).max(1);
        for tick in 0..frames {
            let heading = 2.0 * PI * tick as f64 / frames as f64;
            let camera = Pose::new(view_from, Vector3::new(0.0, heading, 0.0));
            let timestamp = run.context.time_ms() + (tick + 1) * frame_ms;
            let frame = run.oracle.camera_frame(&device_b, &camera, &optics, timestamp);
            sink.try_push(TrackingEvent::Frame(frame))?;
        }
        drop(sink);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let summary = runtime.block_on(session_b.run(&source));

        run.context.advance_time(run.dt * frames as u32);
        run.total_ticks += frames;
        run.metrics.frames += summary.frames;
        run.metrics.markers += summary.markers;
        run.metrics.transitions += summary.transitions;
        run.metrics.rejected_events += summary.rejected;
        run.metrics.anchors_placed += session_b.anchors().count() as u64;

        if summary.rejected > 0 {
            return Ok(Some(format!("{} tracking events rejected", summary.rejected)));
        }
        let Some(error) = run.placement_error(&session_b, &device_b, photo_id) else {
            return Ok(Some(format!("Photo {} was not placed from marker 2", photo_id)));
        };
        run.note_error(error);

        let tolerance = self.tolerance(10.0, 4);
        info!(
            "✓ CrossSession complete: {} links, placement error {:.3}m (bound {:.3}m)",
            run.metrics.links_created, error, tolerance
        );
        Ok((error > tolerance).then(|| {
            format!("Placement error {:.3}m exceeds {:.3}m", error, tolerance)
        }))
    }

    /// DST-002: ChainResolve - photos resolved down a marker chain.
    ///
    /// Device A walks a six-marker path, linking each marker to the last.
    /// Device B starts at the far end and must reach every photo.
    ///
    /// **Assertion**: nothing unreachable, every avatar within the noise bound.
    fn run_chain_resolve(&self, run: &mut ScenarioRun) -> Result<Option<String>, SimError> {
        info!("DST-002: ChainResolve - resolving photos down a marker chain");

        const CHAIN: usize = 6;
        const SPACING: f64 = 5.0;

        let ids = run.oracle.add_marker_walk(1, CHAIN, SPACING);
        let store: Arc<dyn LinkStore> = Arc::new(MemoryLinkStore::new());

        let mut photo_ids = Vec::new();
        for (n, &marker_id) in ids.iter().enumerate().step_by(2) {
            let marker = run.marker_pose(marker_id)?;
            // Photographer stood three meters out, facing the marker
            let avatar = compose_from_relative(
                &marker,
                &Pose::new(
                    Vector3::new(0.5, -marker.position.y, 3.0),
                    Vector3::new(0.0, PI, 0.0),
                ),
            );
            let photo_id = 200 + n as AnchorId;
            run.oracle.add_photo(photo_id, marker_id, avatar, 2.0);

            let placement = run
                .oracle
                .placement(photo_id)
                .ok_or_else(|| SimError::MissingTruth(format!("photo {}", photo_id)))?;
            store.put_reference(marker_id)?;
            store.put_placement(&placement)?;
            photo_ids.push(photo_id);
        }

        let region: BTreeSet<ReferenceId> = ids.iter().copied().collect();
        let optics = FrameOptics::default();
        let legs = (CHAIN - 1) as u64;
        let leg_ticks = (self.target_ticks() / (2 * legs)).max(1);

        // Device A walks the chain
        let device_a = run.oracle.spawn_device();
        let mut session_a = self.session(run, &store, &region)?;
        for (i, &marker_id) in ids.iter().enumerate() {
            run.sight(&mut session_a, &device_a, marker_id)?;
            let Some(&next) = ids.get(i + 1) else {
                break;
            };

            let from = eye_level(&run.marker_pose(marker_id)?.position);
            let to = eye_level(&run.marker_pose(next)?.position);
            let heading = look_yaw(&from, &to);
            for tick in 0..leg_ticks {
                let t = (tick + 1) as f64 / leg_ticks as f64;
                let camera = Pose::new(from.lerp(&to, t), Vector3::new(0.0, heading, 0.0));
                run.frame(&mut session_a, &device_a, &camera, &optics)?;
            }
        }

        // Device B starts at the far end
        let first = ids.first().copied().unwrap_or(1);
        let last = ids.last().copied().unwrap_or(1);
        let device_b = run.oracle.spawn_device();
        let mut session_b = self.session(run, &store, &region)?;
        let outcome = run.sight(&mut session_b, &device_b, last)?;

        let unreachable = outcome
            .resolution
            .map(|resolution| resolution.unreachable)
            .unwrap_or_default();
        if !unreachable.is_empty() {
            return Ok(Some(format!("Unreachable references from {}: {:?}", last, unreachable)));
        }

        let from = eye_level(&run.marker_pose(last)?.position);
        let heading = look_yaw(&from, &eye_level(&run.marker_pose(first)?.position));
        let remaining = self.target_ticks().saturating_sub(leg_ticks * legs).max(1);
        for _ in 0..remaining {
            let camera = Pose::new(from, Vector3::new(0.0, heading, 0.0));
            run.frame(&mut session_b, &device_b, &camera, &optics)?;
        }

        let tolerance = self.tolerance(SPACING * CHAIN as f64, 2 * CHAIN);
        for &photo_id in &photo_ids {
            let Some(error) = run.placement_error(&session_b, &device_b, photo_id) else {
                return Ok(Some(format!("Photo {} was not placed from marker {}", photo_id, last)));
            };
            run.note_error(error);
            debug!("  photo {} error {:.3}m", photo_id, error);
        }

        let worst = run.metrics.max_position_error_m.unwrap_or(0.0);
        info!(
            "✓ ChainResolve complete: {} links, worst placement error {:.3}m (bound {:.3}m)",
            run.metrics.links_created, worst, tolerance
        );
        Ok((worst > tolerance).then(|| {
            format!("Placement error {:.3}m exceeds {:.3}m", worst, tolerance)
        }))
    }

    /// DST-003: Hysteresis - pacing on the geofence edge.
    ///
    /// The viewer faces the photo while drifting back and forth across the
    /// geofence radius, with jitter on every frame.
    ///
    /// **Assertion**: transitions of one anchor are never closer than the
    /// animation lock.
    fn run_hysteresis(&self, run: &mut ScenarioRun) -> Result<Option<String>, SimError> {
        info!("DST-003: Hysteresis - pacing on the geofence edge");

        const EDGE_PERIOD_SECS: f64 = 1.7;
        const SWING: f64 = 0.6;

        let photo_id: AnchorId = 300;
        run.oracle.add_marker(1, Pose::from_position_yaw(0.0, 1.4, 0.0, 0.0));
        let avatar = Pose::from_position_yaw(0.0, 0.0, 4.0, 0.4);
        run.oracle.add_photo(photo_id, 1, avatar, 2.0);
        let store = self.seed_store(run, &[photo_id])?;
        let region: BTreeSet<ReferenceId> = [1].into_iter().collect();

        let device = run.oracle.spawn_device();
        let mut session = self.session(run, &store, &region)?;
        run.sight(&mut session, &device, 1)?;

        let visibility = &self.config.session.visibility;
        let optics = FrameOptics::default();
        let forward = avatar.forward_xz();
        let forward = Vector3::new(forward.x, 0.0, forward.y);
        let dt_secs = run.dt.as_secs_f64();

        for tick in 0..self.target_ticks() {
            let t = tick as f64 * dt_secs;
            // Starts inside the fence, then swings out and back
            let standoff = visibility.geofence_radius - visibility.observer_offset
                - SWING * (2.0 * PI * t / EDGE_PERIOD_SECS).sin()
                + run.oracle.jitter(0.05);
            let position = avatar.position - forward * standoff + Vector3::new(0.0, CAMERA_HEIGHT, 0.0);
            let heading = avatar.yaw() + run.oracle.jitter(0.02);
            let camera = Pose::new(position, Vector3::new(0.0, heading, 0.0));
            run.frame(&mut session, &device, &camera, &optics)?;
        }

        let lock_ms = visibility.transition_duration.as_millis() as u64;
        if run.metrics.transitions == 0 {
            return Ok(Some("Geofence edge never produced a transition".to_string()));
        }
        if let Some(gap) = run.metrics.min_transition_gap_ms {
            if gap < lock_ms {
                return Ok(Some(format!(
                    "Transitions {}ms apart, lock is {}ms",
                    gap, lock_ms
                )));
            }
        }

        info!(
            "✓ Hysteresis complete: {} transitions, min gap {:?}ms",
            run.metrics.transitions, run.metrics.min_transition_gap_ms
        );
        Ok(None)
    }

    /// DST-004: FacingSweep - reveal only inside the facing cone.
    ///
    /// The viewer stands just behind the avatar and turns a full circle,
    /// starting with their back to the photo.
    ///
    /// **Assertion**: exactly one reveal, at a heading on the cone's edge.
    fn run_facing_sweep(&self, run: &mut ScenarioRun) -> Result<Option<String>, SimError> {
        info!("DST-004: FacingSweep - reveal only inside the facing cone");

        let photo_id: AnchorId = 400;
        run.oracle.add_marker(1, Pose::from_position_yaw(0.0, 1.4, 0.0, 0.0));
        let avatar = Pose::from_position_yaw(1.0, 0.0, 3.0, -0.7);
        run.oracle.add_photo(photo_id, 1, avatar, 2.0);
        let store = self.seed_store(run, &[photo_id])?;
        let region: BTreeSet<ReferenceId> = [1].into_iter().collect();

        let device = run.oracle.spawn_device();
        let mut session = self.session(run, &store, &region)?;
        run.sight(&mut session, &device, 1)?;

        let optics = FrameOptics::default();
        let forward = avatar.forward_xz();
        let position = avatar.position - Vector3::new(forward.x, 0.0, forward.y) * 2.0
            + Vector3::new(0.0, CAMERA_HEIGHT, 0.0);

        let total = self.target_ticks();
        let rate = 2.0 * PI / total as f64;
        let mut reveal_offset_deg = None;
        for tick in 0..total {
            let heading = avatar.yaw() + PI + rate * (tick + 1) as f64;
            let camera = Pose::new(position, Vector3::new(0.0, heading, 0.0));
            let outcome = run.frame(&mut session, &device, &camera, &optics)?;

            let revealed = outcome
                .commands
                .iter()
                .any(|c| c.target == AnimationTarget::Photo && c.kind == AnimationKind::Expand);
            if revealed && reveal_offset_deg.is_none() {
                reveal_offset_deg = Some(wrap_angle(heading - avatar.yaw()).to_degrees().abs());
            }
        }

        let Some(offset) = reveal_offset_deg else {
            return Ok(Some("Photo never revealed during the sweep".to_string()));
        };
        if run.metrics.transitions != 1 {
            return Ok(Some(format!(
                "Expected a single reveal, saw {} transitions",
                run.metrics.transitions
            )));
        }

        let half = self.config.session.visibility.facing_half_angle_deg;
        let per_evaluation = (rate * self.config.session.evaluation_divider as f64).to_degrees();
        let noise = (6.0 * self.config.yaw_noise_std).to_degrees() + 0.1;
        info!(
            "✓ FacingSweep complete: revealed {:.1}° off the photo heading (cone ±{:.0}°)",
            offset, half
        );
        if offset > half + noise || offset < half - per_evaluation - noise {
            return Ok(Some(format!(
                "Revealed {:.1}° off heading, expected just inside {:.0}°",
                offset, half
            )));
        }
        Ok(None)
    }

    /// DST-005: GuideSweep - panning past an off-screen avatar.
    ///
    /// The camera stands outside the geofence and pans a full circle while
    /// the guide tracks the avatar.
    ///
    /// **Assertion**: screen points stay in the viewport, on-frame guides
    /// have zero great-circle distance, and the on-frame share of the pan
    /// matches the horizontal field of view.
    fn run_guide_sweep(&self, run: &mut ScenarioRun) -> Result<Option<String>, SimError> {
        info!("DST-005: GuideSweep - panning past an off-screen avatar");

        let photo_id: AnchorId = 500;
        run.oracle.add_marker(1, Pose::from_position_yaw(0.0, 1.4, 0.0, 0.0));
        let avatar = Pose::from_position_yaw(0.0, 0.0, 5.0, 0.0);
        run.oracle.add_photo(photo_id, 1, avatar, 2.0);
        let store = self.seed_store(run, &[photo_id])?;
        let region: BTreeSet<ReferenceId> = [1].into_iter().collect();

        let device = run.oracle.spawn_device();
        let mut session = self.session(run, &store, &region)?;
        run.sight(&mut session, &device, 1)?;

        let optics = FrameOptics::default();
        let viewport = Vector2::new(optics.viewport[0], optics.viewport[1]);
        let intrinsics = CameraIntrinsics::from_projection(
            optics.projection_scale[0],
            optics.projection_scale[1],
            viewport,
        )
        .map_err(SessionError::from)?;

        let position = Vector3::new(0.0, CAMERA_HEIGHT, 20.0);
        let target = avatar.position + Vector3::new(0.0, self.config.session.guide.eye_height, 0.0);
        let toward = look_yaw(&position, &target);

        let total = self.target_ticks();
        let rate = 2.0 * PI / total as f64;
        let half_icon = ICON_SIZE / 2.0;
        for tick in 0..total {
            let heading = toward + PI + rate * (tick + 1) as f64;
            let camera = Pose::new(position, Vector3::new(0.0, heading, 0.0));
            let outcome = run.frame(&mut session, &device, &camera, &optics)?;

            let Some((_, view)) = outcome.guides.iter().find(|(id, _)| *id == photo_id) else {
                return Ok(Some(format!("No guide for photo {} at tick {}", photo_id, tick)));
            };
            let screen = view.screen;
            if screen.x < 0.0 || screen.x > viewport.x || screen.y < 0.0 || screen.y > viewport.y {
                return Ok(Some(format!("Guide left the viewport: ({:.1}, {:.1})", screen.x, screen.y)));
            }

            if view.on_frame {
                run.metrics.on_frame_ticks += 1;
                if view.fixed_great_circle_distance_to_frame != 0.0 {
                    return Ok(Some(format!(
                        "On-frame guide with great-circle distance {:.4}",
                        view.fixed_great_circle_distance_to_frame
                    )));
                }
            } else {
                run.metrics.max_great_circle = run
                    .metrics
                    .max_great_circle
                    .max(view.fixed_great_circle_distance_to_frame);
                let icon = clamp_icon(&screen, &viewport, ICON_SIZE, &SafeAreaInsets::default());
                if icon.x < half_icon || icon.x > viewport.x - half_icon {
                    return Ok(Some(format!("Icon clamped outside the safe area at x={:.1}", icon.x)));
                }
            }
        }

        let expected = intrinsics.fov.x / (2.0 * PI);
        let observed = run.metrics.on_frame_ticks as f64 / total as f64;
        info!(
            "✓ GuideSweep complete: on-frame {:.1}% of the pan (field of view {:.1}%)",
            observed * 100.0,
            expected * 100.0
        );
        if (observed - expected).abs() > 0.05 {
            return Ok(Some(format!(
                "On-frame share {:.3} does not match field of view share {:.3}",
                observed, expected
            )));
        }
        if run.metrics.max_great_circle < 0.5 {
            return Ok(Some("Guide never reported the avatar behind the camera".to_string()));
        }
        Ok(None)
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn target_ticks(&self) -> u64 {
        let ticks = self.config.max_duration_secs * self.config.tick_rate_hz.max(1) as f64;
        (ticks as u64).max(1)
    }

    /// Placement error bound for a pose carried through `sightings` noisy
    /// marker sightings over a `lever` meter lever arm.
    fn tolerance(&self, lever: f64, sightings: usize) -> f64 {
        0.05 + 6.0
            * (sightings as f64).sqrt()
            * (self.config.position_noise_std + lever * self.config.yaw_noise_std)
    }

    fn session(
        &self,
        run: &ScenarioRun,
        store: &Arc<dyn LinkStore>,
        region: &BTreeSet<ReferenceId>,
    ) -> Result<PresentationSession<SimContext>, SimError> {
        Ok(PresentationSession::from_store(
            Arc::clone(&run.context),
            self.config.session.clone(),
            Arc::clone(store),
            region,
        )?)
    }

    /// Store holding the exact placements of `photo_ids`.
    fn seed_store(&self, run: &ScenarioRun, photo_ids: &[AnchorId]) -> Result<Arc<dyn LinkStore>, SimError> {
        let store: Arc<dyn LinkStore> = Arc::new(MemoryLinkStore::new());
        for &photo_id in photo_ids {
            let placement = run
                .oracle
                .placement(photo_id)
                .ok_or_else(|| SimError::MissingTruth(format!("photo {}", photo_id)))?;
            store.put_reference(placement.reference_id)?;
            store.put_placement(&placement)?;
        }
        Ok(store)
    }
}

// ============================================================================
// PER-RUN STATE
// ============================================================================

/// Mutable state shared by every step of one scenario run.
struct ScenarioRun {
    context: Arc<SimContext>,
    oracle: Oracle,
    metrics: ScenarioMetrics,
    total_ticks: u64,
    dt: Duration,

    export: Option<SimExport>,
    export_every: u64,
    events: Vec<SimEvent>,

    /// Virtual time of each anchor's latest transition
    last_transition: BTreeMap<AnchorId, Duration>,
}

impl ScenarioRun {
    fn new(scenario: ScenarioId, config: &SimConfig) -> Self {
        // Layout and noise are seeded apart from the clock
        let physics_seed = config.seed.wrapping_mul(0x9e3779b97f4a7c15);
        let mut oracle = Oracle::new(physics_seed);
        oracle.set_position_noise(config.position_noise_std);
        oracle.set_yaw_noise(config.yaw_noise_std);

        Self {
            context: SimContext::shared(config.seed),
            oracle,
            metrics: ScenarioMetrics::default(),
            total_ticks: 0,
            dt: Duration::from_secs_f64(1.0 / config.tick_rate_hz.max(1) as f64),
            export: (config.export_every > 0).then(|| SimExport::new(scenario.name(), config.seed)),
            export_every: u64::from(config.export_every),
            events: Vec::new(),
            last_transition: BTreeMap::new(),
        }
    }

    fn marker_pose(&self, id: ReferenceId) -> Result<Pose, SimError> {
        self.oracle
            .marker(id)
            .map(|marker| marker.pose)
            .ok_or_else(|| SimError::MissingTruth(format!("marker {}", id)))
    }

    /// Feeds a noisy sighting of marker `id` to the session.
    fn sight(
        &mut self,
        session: &mut PresentationSession<SimContext>,
        device: &DeviceSession,
        id: ReferenceId,
    ) -> Result<MarkerOutcome, SimError> {
        let sighting = self
            .oracle
            .sight_marker(device, id, self.context.time_ms())
            .ok_or_else(|| SimError::MissingTruth(format!("marker {}", id)))?;
        let outcome = session.on_marker(&sighting)?;

        self.metrics.markers += 1;
        self.metrics.links_created += outcome.links.len() as u64;
        self.metrics.anchors_placed += outcome.placed_anchors.len() as u64;
        self.event(format!("Device {} localized at marker {}", device.device, id));
        Ok(outcome)
    }

    /// Advances the clock one tick and feeds the camera frame at `camera`.
    fn frame(
        &mut self,
        session: &mut PresentationSession<SimContext>,
        device: &DeviceSession,
        camera: &Pose,
        optics: &FrameOptics,
    ) -> Result<FrameOutcome, SimError> {
        self.context.advance_time(self.dt);
        self.total_ticks += 1;

        let frame = self
            .oracle
            .camera_frame(device, camera, optics, self.context.time_ms());
        let outcome = session.on_frame(&frame)?;
        self.metrics.frames += 1;

        let now = self.context.now();
        for command in outcome
            .commands
            .iter()
            .filter(|c| c.target == AnimationTarget::Photo)
        {
            self.metrics.transitions += 1;
            if let Some(previous) = self.last_transition.insert(command.anchor_id, now) {
                let gap = now.saturating_sub(previous).as_millis() as u64;
                self.metrics.min_transition_gap_ms = Some(
                    self.metrics
                        .min_transition_gap_ms
                        .map_or(gap, |shortest| shortest.min(gap)),
                );
            }
            self.event(format!("Anchor {} photo {:?}", command.anchor_id, command.kind));
        }

        if self.export_every > 0 && self.total_ticks % self.export_every == 0 {
            self.record(session, device, camera, &outcome);
        }
        Ok(outcome)
    }

    /// World-frame distance between a placed avatar and its true pose.
    fn placement_error(
        &self,
        session: &PresentationSession<SimContext>,
        device: &DeviceSession,
        photo_id: AnchorId,
    ) -> Option<f64> {
        let anchor = session.visibility().get(photo_id)?;
        let truth = self.oracle.photo(photo_id)?;
        Some((device.to_world(&anchor.avatar).position - truth.avatar.position).norm())
    }

    fn note_error(&mut self, error: f64) {
        self.metrics.max_position_error_m = Some(
            self.metrics
                .max_position_error_m
                .map_or(error, |worst| worst.max(error)),
        );
    }

    fn event(&mut self, message: String) {
        if self.export.is_some() {
            self.events.push(SimEvent::info(message));
        }
    }

    fn record(
        &mut self,
        session: &PresentationSession<SimContext>,
        device: &DeviceSession,
        camera: &Pose,
        outcome: &FrameOutcome,
    ) {
        let Some(export) = self.export.as_mut() else {
            return;
        };

        let anchors = session
            .anchors()
            .map(|anchor| {
                let guide = outcome
                    .guides
                    .iter()
                    .find(|(id, _)| *id == anchor.id)
                    .map(|(_, view)| view);
                AnchorFrame {
                    anchor_id: anchor.id,
                    state: AnchorFrame::state_name(anchor.state),
                    avatar: device.to_world(&anchor.avatar).position.into(),
                    screen: guide.map(|view| [view.screen.x, view.screen.y]),
                    on_frame: guide.map(|view| view.on_frame),
                }
            })
            .collect();

        export.add_frame(SimFrame {
            time_sec: self.context.now().as_secs_f64(),
            camera: camera.position.into(),
            anchors,
            events: std::mem::take(&mut self.events),
        });
    }

    fn finish(
        mut self,
        scenario: ScenarioId,
        outcome: Result<Option<String>, SimError>,
    ) -> ScenarioResult {
        let failure_reason = match outcome {
            Ok(reason) => reason,
            Err(e) => Some(format!("Scenario aborted: {}", e)),
        };
        let passed = failure_reason.is_none();

        if let Some(export) = self.export.as_mut() {
            export.finalize(passed, self.metrics.max_position_error_m);
        }

        ScenarioResult {
            scenario,
            seed: self.context.seed(),
            passed,
            total_ticks: self.total_ticks,
            final_time_secs: self.context.now().as_secs_f64(),
            failure_reason,
            metrics: self.metrics,
            export: self.export,
        }
    }
}

/// Yaw that turns a camera at `from` toward `to` on the floor plane.
fn look_yaw(from: &Vector3<f64>, to: &Vector3<f64>) -> f64 {
    let d = to - from;
    (-d.x).atan2(-d.z)
}

fn eye_level(position: &Vector3<f64>) -> Vector3<f64> {
    Vector3::new(position.x, CAMERA_HEIGHT, position.z)
}

/// Wraps an angle into (-PI, PI].
fn wrap_angle(angle: f64) -> f64 {
    angle.sin().atan2(angle.cos())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_cross_session_scenario() {
        let runner = ScenarioRunner::new(42).with_duration(2.0);

        let result = runner.run(ScenarioId::CrossSession);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.links_created, 2);
        assert_eq!(result.metrics.rejected_events, 0);
        assert!(result.metrics.max_position_error_m.is_some());
    }

    #[test]
    fn test_chain_resolve_scenario() {
        let runner = ScenarioRunner::new(42).with_duration(2.0);

        let result = runner.run(ScenarioId::ChainResolve);

        assert!(result.passed, "{:?}", result.failure_reason);
        // One link pair per leg of the walk
        assert_eq!(result.metrics.links_created, 10);
    }

    #[test]
    fn test_hysteresis_scenario() {
        let runner = ScenarioRunner::new(42).with_duration(6.0);

        let result = runner.run(ScenarioId::Hysteresis);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.transitions >= 2);
        assert!(result.metrics.min_transition_gap_ms.unwrap() >= 500);
    }

    #[test]
    fn test_facing_sweep_scenario() {
        let runner = ScenarioRunner::new(42).with_duration(8.0);

        let result = runner.run(ScenarioId::FacingSweep);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.transitions, 1);
    }

    #[test]
    fn test_guide_sweep_scenario() {
        let runner = ScenarioRunner::new(42).with_duration(4.0);

        let result = runner.run(ScenarioId::GuideSweep);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.on_frame_ticks > 0);
        assert!(result.metrics.on_frame_ticks < result.total_ticks);
    }

    #[test]
    fn test_hysteresis_deterministic() {
        // Same seed should give the same transitions
        let runner1 = ScenarioRunner::new(7).with_duration(3.0);
        let runner2 = ScenarioRunner::new(7).with_duration(3.0);

        let result1 = runner1.run(ScenarioId::Hysteresis);
        let result2 = runner2.run(ScenarioId::Hysteresis);

        assert_eq!(result1.metrics, result2.metrics);
        assert_eq!(result1.total_ticks, result2.total_ticks);
    }

    #[test]
    fn test_noiseless_chain_is_exact() {
        let runner = ScenarioRunner::new(3).with_duration(1.0).with_noise(0.0, 0.0);

        let result = runner.run(ScenarioId::ChainResolve);

        assert!(result.passed);
        assert!(result.metrics.max_position_error_m.unwrap() < 1e-4);
    }

    #[test]
    fn test_export_records_frames() {
        let runner = ScenarioRunner::new(42).with_duration(1.0).with_export(10);

        let result = runner.run(ScenarioId::Hysteresis);
        let export = result.export.expect("export requested");

        assert_eq!(export.frames.len() as u64, result.total_ticks / 10);
        assert_eq!(export.passed, result.passed);
        assert!(export.frames.iter().all(|f| f.anchors.len() == 1));
    }

    #[test]
    fn test_final_time_matches_ticks() {
        let runner = ScenarioRunner::new(42).with_duration(1.0).with_tick_rate(30);

        let result = runner.run(ScenarioId::GuideSweep);

        assert_eq!(result.total_ticks, 30);
        assert!((result.final_time_secs - 1.0).abs() < 1e-6);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn prop_chain_resolves_for_any_seed(seed in any::<u64>()) {
            let result = ScenarioRunner::new(seed).with_duration(1.0).run(ScenarioId::ChainResolve);
            prop_assert!(result.passed, "{:?}", result.failure_reason);
        }
    }
}

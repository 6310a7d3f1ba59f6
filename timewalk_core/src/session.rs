//! Presentation Session - drives the engines from tracking callbacks.
//!
//! This module is the integration layer between the pure engines (pose
//! algebra, reference graph, visibility, guide) and the environment
//! abstraction (`SessionContext`, `TrackingSource`).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   PresentationSession                       │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │              Context: SessionContext                 │   │
//! │  │  • now() → visibility lock deadlines                 │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │                              │                              │
//! │  on_marker ──► ┌───────────┐ │ ┌────────────┐ ◄── on_frame  │
//! │                │ REFERENCE │ │ │ VISIBILITY │   (every 6th) │
//! │                │   GRAPH   │─┼►│   ENGINE   │               │
//! │                └───────────┘ │ └────────────┘               │
//! │                              │ ┌────────────┐ ◄── on_frame  │
//! │                              └►│   GUIDE    │   (every)     │
//! │                                └────────────┘               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use timewalk_core::session::{PresentationSession, SessionConfig};
//! use timewalk_env::{tracking_channel, DeviceId, TokioContext};
//!
//! let ctx = TokioContext::shared();
//! let (sink, source) = tracking_channel(DeviceId::new(), 64);
//! let mut session = PresentationSession::new(ctx, SessionConfig::default(), graph, placements)?;
//!
//! // Host forwards frame/anchor callbacks into `sink`
//! session.run(&source).await;
//! ```

use crate::link_store::{load_graph, LinkStore, PhotoPlacement, StoreError};
use crate::pose::{yaw_from_rotation, Pose, PoseError};
use crate::reference_graph::{GraphError, Link, ReferenceGraph, ReferenceId, Resolution};
use crate::spatial_guide::{CameraIntrinsics, GuideConfig, GuideError, SpatialGuide, ViewingPosition};
use crate::visibility::{
    AnchorId, AnimationCommand, PlacedAnchor, TickDivider, VisibilityConfig, VisibilityEngine,
    VisibilityError,
};
use nalgebra::{Matrix3, Vector2, Vector3};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use timewalk_env::{CameraFrame, EnvError, MarkerSighting, SessionContext, TrackingEvent, TrackingSource};
use tracing::{debug, info, warn};

/// Configuration for a presentation session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub visibility: VisibilityConfig,
    pub guide: GuideConfig,

    /// Frames per visibility evaluation (default: 6, i.e. 10 Hz at 60 Hz)
    pub evaluation_divider: u32,

    /// Write new links and placements to the store (default: true)
    pub publish_links: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            visibility: VisibilityConfig::default(),
            guide: GuideConfig::default(),
            evaluation_divider: 6,
            publish_links: true,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        self.visibility.validate()?;
        if self.evaluation_divider == 0 {
            return Err(SessionError::InvalidConfig(
                "evaluation_divider must be at least 1".to_string(),
            ));
        }
        if !self.guide.eye_height.is_finite() {
            return Err(SessionError::InvalidConfig(format!(
                "eye_height must be finite, got {}",
                self.guide.eye_height
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Non-finite input: {0}")]
    NonFinite(#[from] PoseError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Visibility error: {0}")]
    Visibility(#[from] VisibilityError),

    #[error("Guide error: {0}")]
    Guide(#[from] GuideError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Environment error: {0}")]
    Env(#[from] EnvError),

    #[error("No marker localized yet")]
    NotLocalized,

    #[error("Invalid session config: {0}")]
    InvalidConfig(String),
}

/// Result of handling one marker sighting.
#[derive(Debug, Clone, Default)]
pub struct MarkerOutcome {
    pub marker_id: ReferenceId,

    /// False for a repeated sighting of the marker already in use
    pub relocalized: bool,

    /// Link pair recorded between the previous and this marker
    pub links: Vec<Link>,

    /// Anchors dropped with the previous connected component
    pub removed_anchors: Vec<AnchorId>,

    /// Anchors newly assigned to the scene
    pub placed_anchors: Vec<AnchorId>,

    pub resolution: Option<Resolution>,
}

/// Result of handling one camera frame.
#[derive(Debug, Clone, Default)]
pub struct FrameOutcome {
    /// Whether the visibility engine ran on this frame
    pub evaluated: bool,

    pub commands: Vec<AnimationCommand>,

    /// Guide position of every anchor's avatar
    pub guides: Vec<(AnchorId, ViewingPosition)>,

    /// Set when the frame's viewport or projection could not drive the
    /// guide; visibility still ran
    pub guide_error: Option<GuideError>,
}

/// Counters reported when a tracking source closes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub frames: u64,
    pub markers: u64,
    pub transitions: u64,
    pub rejected: u64,
}

/// One device's AR presentation session.
///
/// Generic over the context implementation, so the same session code runs
/// against the live tracking host (tokio) or the simulator.
pub struct PresentationSession<Ctx>
where
    Ctx: SessionContext,
{
    /// Environment context
    pub context: Arc<Ctx>,

    config: SessionConfig,
    graph: ReferenceGraph,
    visibility: VisibilityEngine,
    guide: Option<SpatialGuide>,

    /// Stored placements keyed by the reference they hang off
    placements: BTreeMap<ReferenceId, Vec<PhotoPlacement>>,

    /// Marker currently localizing the session and its tracked pose
    localized: Option<(ReferenceId, Pose)>,

    divider: TickDivider,
    store: Option<Arc<dyn LinkStore>>,
}

impl<Ctx> PresentationSession<Ctx>
where
    Ctx: SessionContext,
{
    /// Creates a session over an already loaded graph and placements.
    pub fn new(
        context: Arc<Ctx>,
        config: SessionConfig,
        graph: ReferenceGraph,
        placements: Vec<PhotoPlacement>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let visibility = VisibilityEngine::new(config.visibility.clone())?;

        let mut by_reference: BTreeMap<ReferenceId, Vec<PhotoPlacement>> = BTreeMap::new();
        for placement in placements {
            by_reference
                .entry(placement.reference_id)
                .or_default()
                .push(placement);
        }

        Ok(Self {
            context,
            divider: TickDivider::new(config.evaluation_divider),
            config,
            graph,
            visibility,
            guide: None,
            placements: by_reference,
            localized: None,
            store: None,
        })
    }

    /// Loads the region `ids` from `store` and publishes back into it.
    pub fn from_store(
        context: Arc<Ctx>,
        config: SessionConfig,
        store: Arc<dyn LinkStore>,
        ids: &BTreeSet<ReferenceId>,
    ) -> Result<Self, SessionError> {
        let graph = load_graph(store.as_ref(), ids)?;
        let mut placements = Vec::new();
        for &id in ids {
            placements.extend(store.placements_for(id)?);
        }
        info!(
            "Loaded {} references, {} links, {} photos",
            graph.node_count(),
            graph.link_count(),
            placements.len()
        );

        let mut session = Self::new(context, config, graph, placements)?;
        session.store = Some(store);
        Ok(session)
    }

    /// Handles the recognition of a marker.
    pub fn on_marker(&mut self, sighting: &MarkerSighting) -> Result<MarkerOutcome, SessionError> {
        let id = sighting.marker_id;
        let pose = marker_pose(sighting)?;
        let mut outcome = MarkerOutcome {
            marker_id: id,
            ..Default::default()
        };

        let previous = self.localized;
        match previous {
            Some((prev_id, _)) if prev_id == id => {
                debug!("Marker {} seen again, keeping localization", id);
                return Ok(outcome);
            }
            Some((prev_id, prev_pose)) => {
                let links = ReferenceGraph::link_pair(prev_id, &prev_pose, id, &pose)?;
                let component = self.graph.connected_component(prev_id);

                self.graph.insert_links(links.iter().cloned());
                if self.config.publish_links {
                    self.publish_links(&links)?;
                }
                info!("Linked reference {} <-> {}", prev_id, id);

                outcome.removed_anchors = self.visibility.remove_for_references(&component);
                outcome.links = links.to_vec();
                self.graph.reset_resolution();
            }
            None => {
                self.graph.insert_node(id);
            }
        }

        self.graph.seed_root(id, pose)?;
        self.localized = Some((id, pose));

        let resolution = self.graph.resolve();
        outcome.placed_anchors = self.place_resolved();
        for unreachable in &resolution.unreachable {
            if self.placements.contains_key(unreachable) {
                warn!("Reference {} unreachable from {}", unreachable, id);
            }
        }
        info!(
            "Localized at reference {}: {} resolved, {} anchors placed",
            id,
            resolution.resolved.len(),
            outcome.placed_anchors.len()
        );

        outcome.relocalized = true;
        outcome.resolution = Some(resolution);
        Ok(outcome)
    }

    /// Handles one tracking frame.
    pub fn on_frame(&mut self, frame: &CameraFrame) -> Result<FrameOutcome, SessionError> {
        let camera = camera_pose(frame);
        camera.validate()?;

        let mut outcome = FrameOutcome::default();
        if self.divider.tick() {
            outcome.evaluated = true;
            outcome.commands = self.visibility.tick(&camera, self.context.now())?;
        }

        if let Err(e) = self.update_guide(frame) {
            warn!("Guide skipped at {}ms: {}", frame.timestamp_ms, e);
            outcome.guide_error = Some(e);
            return Ok(outcome);
        }
        if let Some(guide) = &self.guide {
            outcome.guides = self
                .visibility
                .anchors()
                .map(|anchor| {
                    (
                        anchor.id,
                        guide.view_avatar(&camera, &anchor.avatar, frame.interface_orientation),
                    )
                })
                .collect();
        }

        Ok(outcome)
    }

    /// Registers a new photo against the marker currently in use.
    pub fn register_photo(
        &mut self,
        photo_id: AnchorId,
        photo: &Pose,
        avatar: &Pose,
    ) -> Result<PhotoPlacement, SessionError> {
        photo.validate()?;
        avatar.validate()?;
        let (reference_id, reference_pose) = self.localized.ok_or(SessionError::NotLocalized)?;

        let placement = PhotoPlacement::from_session(photo_id, reference_id, &reference_pose, photo, avatar)
            .registered_at(self.context.system_time());
        if self.config.publish_links {
            if let Some(store) = &self.store {
                store.put_reference(reference_id)?;
                store.put_placement(&placement)?;
            }
        }

        self.placements
            .entry(reference_id)
            .or_default()
            .push(placement.clone());
        self.place_resolved();
        info!("Registered photo {} at reference {}", photo_id, reference_id);

        Ok(placement)
    }

    /// Drains a tracking source until it closes.
    ///
    /// Events that fail validation are logged and skipped.
    pub async fn run<S>(&mut self, source: &S) -> SessionSummary
    where
        S: TrackingSource,
    {
        let mut summary = SessionSummary::default();
        info!("Session started on device {}", source.device_id());

        while let Some(event) = source.next_event().await {
            let result = match &event {
                TrackingEvent::Frame(frame) => {
                    summary.frames += 1;
                    self.on_frame(frame).map(|outcome| {
                        // Every transition emits a photo and an avatar command
                        summary.transitions += outcome.commands.len() as u64 / 2;
                        if outcome.guide_error.is_some() {
                            summary.rejected += 1;
                        }
                    })
                }
                TrackingEvent::Marker(sighting) => {
                    summary.markers += 1;
                    self.on_marker(sighting).map(|_| ())
                }
            };

            if let Err(e) = result {
                summary.rejected += 1;
                warn!("Rejected event at {}ms: {}", event.timestamp_ms(), e);
            }
        }

        info!(
            "Session ended: {} frames, {} markers, {} transitions",
            summary.frames, summary.markers, summary.transitions
        );
        summary
    }

    /// Anchors currently assigned to the scene, with absolute poses.
    pub fn anchors(&self) -> impl Iterator<Item = &PlacedAnchor> {
        self.visibility.anchors()
    }

    pub fn graph(&self) -> &ReferenceGraph {
        &self.graph
    }

    pub fn visibility(&self) -> &VisibilityEngine {
        &self.visibility
    }

    /// The marker currently localizing the session.
    pub fn localized(&self) -> Option<ReferenceId> {
        self.localized.map(|(id, _)| id)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn publish_links(&self, links: &[Link]) -> Result<(), SessionError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        for link in links {
            store.put_reference(link.from_id)?;
            store.put_link(link)?;
        }
        Ok(())
    }

    /// Assigns every placement whose reference is resolved and not yet shown.
    fn place_resolved(&mut self) -> Vec<AnchorId> {
        let mut placed = Vec::new();
        for (reference_id, placements) in &self.placements {
            let Some(reference_pose) = self.graph.pose(*reference_id) else {
                continue;
            };
            for placement in placements {
                if self.visibility.get(placement.photo_id).is_some() {
                    continue;
                }
                let (photo, avatar) = placement.place(&reference_pose);
                self.visibility.insert(PlacedAnchor::new(
                    placement.photo_id,
                    *reference_id,
                    photo,
                    avatar,
                ));
                placed.push(placement.photo_id);
            }
        }
        placed
    }

    fn update_guide(&mut self, frame: &CameraFrame) -> Result<(), GuideError> {
        let intrinsics = CameraIntrinsics::from_projection(
            frame.projection_scale[0],
            frame.projection_scale[1],
            Vector2::new(frame.viewport[0], frame.viewport[1]),
        )?;

        if let Some(guide) = self.guide.as_mut() {
            if guide.intrinsics() != &intrinsics {
                guide.set_intrinsics(intrinsics)?;
            }
            return Ok(());
        }
        self.guide = Some(SpatialGuide::new(intrinsics, self.config.guide.clone())?);
        Ok(())
    }
}

/// Session-frame pose of a sighted marker: position plus yaw only.
pub fn marker_pose(sighting: &MarkerSighting) -> Result<Pose, SessionError> {
    let r = &sighting.rotation;
    let rotation = Matrix3::new(
        r[0][0], r[0][1], r[0][2], //
        r[1][0], r[1][1], r[1][2], //
        r[2][0], r[2][1], r[2][2],
    );
    if rotation.iter().any(|v| !v.is_finite()) {
        return Err(PoseError::NonFinite {
            component: "rotation",
            value: rotation.iter().copied().find(|v| !v.is_finite()).unwrap_or(f64::NAN),
        }
        .into());
    }

    let [x, y, z] = sighting.position;
    let pose = Pose::from_position_yaw(x, y, z, yaw_from_rotation(&rotation));
    pose.validate()?;
    Ok(pose)
}

/// Camera pose carried by a tracking frame.
pub fn camera_pose(frame: &CameraFrame) -> Pose {
    Pose::new(Vector3::from(frame.position), Vector3::from(frame.euler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link_store::MemoryLinkStore;
    use crate::visibility::VisibilityState;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;
    use std::f64::consts::FRAC_PI_2;
    use std::sync::Mutex;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};
    use timewalk_env::{tracking_channel, DeviceId, InterfaceOrientation, TrackingSink};

    /// Manually advanced clock.
    #[derive(Default)]
    struct ManualContext {
        now_ms: Mutex<u64>,
    }

    impl ManualContext {
        fn advance(&self, ms: u64) {
            *self.now_ms.lock().unwrap() += ms;
        }
    }

    impl SessionContext for ManualContext {
        fn now(&self) -> Duration {
            Duration::from_millis(*self.now_ms.lock().unwrap())
        }

        fn system_time(&self) -> SystemTime {
            UNIX_EPOCH + Duration::from_secs(1_000) + self.now()
        }
    }

    fn sighting(marker_id: ReferenceId, x: f64, z: f64, yaw: f64) -> MarkerSighting {
        let m = Rotation3::from_axis_angle(&Vector3::y_axis(), yaw);
        let mut rotation = [[0.0; 3]; 3];
        for (i, row) in rotation.iter_mut().enumerate() {
            for (j, value) in row.iter_mut().enumerate() {
                *value = m.matrix()[(i, j)];
            }
        }
        MarkerSighting {
            marker_id,
            position: [x, 0.0, z],
            rotation,
            timestamp_ms: 0,
        }
    }

    fn frame(x: f64, z: f64, yaw: f64) -> CameraFrame {
        CameraFrame {
            position: [x, 1.5, z],
            euler: [0.0, yaw, 0.0],
            interface_orientation: InterfaceOrientation::Portrait,
            viewport: [390.0, 844.0],
            projection_scale: [3.0, 1.5],
            timestamp_ms: 0,
        }
    }

    /// Photo one meter in front of an avatar standing one meter in front
    /// of marker 2. Markers 1 and 2 face -z, 1 sits at x=-3 from 2.
    fn fixture() -> (ReferenceGraph, Vec<PhotoPlacement>) {
        let mut graph = ReferenceGraph::new();
        let a = Pose::from_position_yaw(0.0, 0.0, 0.0, 0.0);
        let b = Pose::from_position_yaw(3.0, 0.0, 0.0, 0.0);
        graph.insert_links(ReferenceGraph::link_pair(1, &a, 2, &b).unwrap());

        let placement = PhotoPlacement {
            photo_id: 100,
            reference_id: 2,
            photo: Pose::from_position_yaw(0.0, 0.0, -2.0, 0.0),
            avatar: Pose::from_position_yaw(0.0, 0.0, -1.0, 0.0),
            registered_at_ms: 0,
        };
        (graph, vec![placement])
    }

    fn session() -> PresentationSession<ManualContext> {
        let (graph, placements) = fixture();
        PresentationSession::new(
            Arc::new(ManualContext::default()),
            SessionConfig::default(),
            graph,
            placements,
        )
        .unwrap()
    }

    #[test]
    fn test_marker_pose_from_rotation() {
        let pose = marker_pose(&sighting(1, 2.0, -1.0, 0.7)).unwrap();
        assert_relative_eq!(pose.yaw(), 0.7, epsilon = 1e-12);
        assert_relative_eq!(pose.position.x, 2.0);
    }

    #[test]
    fn test_marker_pose_rejects_nan() {
        let mut s = sighting(1, 0.0, 0.0, 0.0);
        s.rotation[1][1] = f64::NAN;
        assert!(matches!(marker_pose(&s), Err(SessionError::NonFinite(_))));
    }

    #[test]
    fn test_first_marker_places_linked_photos() {
        let mut session = session();

        // Marker 1 seen at the session origin, marker 2 is 3 m to the right
        let outcome = session.on_marker(&sighting(1, 0.0, 0.0, 0.0)).unwrap();
        assert!(outcome.relocalized);
        assert_eq!(outcome.placed_anchors, vec![100]);
        assert!(outcome.links.is_empty());

        let anchor = session.anchors().next().unwrap();
        assert_relative_eq!(anchor.avatar.position, Vector3::new(3.0, 0.0, -1.0), epsilon = 1e-9);
        assert_relative_eq!(anchor.photo.position, Vector3::new(3.0, 0.0, -2.0), epsilon = 1e-9);
    }

    #[test]
    fn test_repeat_sighting_is_ignored() {
        let mut session = session();
        session.on_marker(&sighting(1, 0.0, 0.0, 0.0)).unwrap();
        let outcome = session.on_marker(&sighting(1, 0.1, 0.0, 0.0)).unwrap();
        assert!(!outcome.relocalized);
        assert!(outcome.resolution.is_none());
    }

    #[test]
    fn test_relocalization_links_and_replaces_anchors() {
        let store = Arc::new(MemoryLinkStore::new());
        let (_, placements) = fixture();
        for p in &placements {
            store.put_reference(p.reference_id).unwrap();
            store.put_placement(p).unwrap();
        }
        let mut session = PresentationSession::from_store(
            Arc::new(ManualContext::default()),
            SessionConfig::default(),
            store.clone(),
            &BTreeSet::from([2, 5]),
        )
        .unwrap();

        // Marker 2 first: photo placed directly
        let first = session.on_marker(&sighting(2, 0.0, 0.0, FRAC_PI_2)).unwrap();
        assert_eq!(first.placed_anchors, vec![100]);

        // Then a marker nobody linked before
        let second = session.on_marker(&sighting(5, 4.0, 0.0, 0.0)).unwrap();
        assert_eq!(second.links.len(), 2);
        assert_eq!(second.removed_anchors, vec![100]);
        assert_eq!(second.placed_anchors, vec![100]);
        assert_eq!(session.localized(), Some(5));

        // The new link pair went to the store
        assert_eq!(store.links_from(2).unwrap().len(), 1);
        assert_eq!(store.links_from(5).unwrap().len(), 1);

        // Re-resolved from marker 5, the photo lands where it was
        let anchor = session.anchors().next().unwrap();
        assert_relative_eq!(anchor.avatar.position, Vector3::new(-1.0, 0.0, 0.0), epsilon = 1e-9);
    }

    #[test]
    fn test_register_photo_requires_localization() {
        let mut session = session();
        let photo = Pose::origin();
        assert!(matches!(
            session.register_photo(7, &photo, &photo),
            Err(SessionError::NotLocalized)
        ));

        session.on_marker(&sighting(2, 3.0, 0.0, 0.0)).unwrap();
        let photo = Pose::from_position_yaw(3.0, 0.0, -4.0, 0.0);
        let avatar = Pose::from_position_yaw(3.0, 0.0, -3.0, 0.0);
        session.context.advance(250);
        let placement = session.register_photo(7, &photo, &avatar).unwrap();
        assert_relative_eq!(placement.avatar.position.z, -3.0, epsilon = 1e-12);
        assert_eq!(placement.registered_at_ms, 1_000_250);
        assert!(session.visibility().get(7).is_some());
    }

    #[test]
    fn test_frames_evaluate_every_sixth() {
        let mut session = session();
        session.on_marker(&sighting(1, 0.0, 0.0, 0.0)).unwrap();

        // Standing 1 m behind the avatar, looking the photographer's way
        let mut evaluated = 0;
        let mut commands = Vec::new();
        for _ in 0..12 {
            let outcome = session.on_frame(&frame(3.0, 0.0, 0.0)).unwrap();
            assert_eq!(outcome.guides.len(), 1);
            if outcome.evaluated {
                evaluated += 1;
            }
            commands.extend(outcome.commands);
        }

        assert_eq!(evaluated, 2);
        assert_eq!(commands.len(), 2);
        assert_eq!(session.visibility().state(100), Some(VisibilityState::PhotoVisible));
    }

    #[test]
    fn test_lock_uses_context_clock() {
        let mut session = session();
        session.on_marker(&sighting(1, 0.0, 0.0, 0.0)).unwrap();
        for _ in 0..6 {
            session.on_frame(&frame(3.0, 0.0, 0.0)).unwrap();
        }
        assert_eq!(session.visibility().state(100), Some(VisibilityState::PhotoVisible));

        // Walk far away: locked until the clock passes 500 ms
        session.context.advance(400);
        for _ in 0..6 {
            session.on_frame(&frame(3.0, 40.0, 0.0)).unwrap();
        }
        assert_eq!(session.visibility().state(100), Some(VisibilityState::PhotoVisible));

        session.context.advance(100);
        for _ in 0..6 {
            session.on_frame(&frame(3.0, 40.0, 0.0)).unwrap();
        }
        assert_eq!(session.visibility().state(100), Some(VisibilityState::AvatarVisible));
    }

    #[test]
    fn test_frame_rejects_bad_intrinsics() {
        let mut session = session();
        let mut f = frame(0.0, 0.0, 0.0);
        f.viewport = [0.0, 0.0];
        let outcome = session.on_frame(&f).unwrap();
        assert!(outcome.guide_error.is_some());
        assert!(outcome.guides.is_empty());

        let mut f = frame(0.0, 0.0, 0.0);
        f.euler[1] = f64::INFINITY;
        assert!(matches!(session.on_frame(&f), Err(SessionError::NonFinite(_))));
    }

    #[test]
    fn test_bad_viewport_does_not_stall_visibility() {
        let mut session = session();
        session.on_marker(&sighting(1, 0.0, 0.0, 0.0)).unwrap();

        let mut hud_broken = frame(3.0, 0.0, 0.0);
        hud_broken.projection_scale = [0.0, 1.5];

        let mut commands = Vec::new();
        for _ in 0..6 {
            let outcome = session.on_frame(&hud_broken).unwrap();
            assert!(outcome.guide_error.is_some());
            commands.extend(outcome.commands);
        }

        assert_eq!(commands.len(), 2);
        assert_eq!(session.visibility().state(100), Some(VisibilityState::PhotoVisible));
    }

    #[tokio::test]
    async fn test_run_drains_source() {
        let mut session = session();
        let (sink, source) = tracking_channel(DeviceId::from_seed(9), 64);

        sink.push(TrackingEvent::Marker(sighting(1, 0.0, 0.0, 0.0))).await.unwrap();
        for _ in 0..6 {
            sink.push(TrackingEvent::Frame(frame(3.0, 0.0, 0.0))).await.unwrap();
        }
        let mut bad = frame(0.0, 0.0, 0.0);
        bad.position[0] = f64::NAN;
        sink.push(TrackingEvent::Frame(bad)).await.unwrap();
        drop(sink);

        let summary = session.run(&source).await;
        assert_eq!(summary.markers, 1);
        assert_eq!(summary.frames, 7);
        assert_eq!(summary.transitions, 1);
        assert_eq!(summary.rejected, 1);
    }
}

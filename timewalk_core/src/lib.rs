//! TimeWalk Core - Relative positioning engine for photos anchored in space
//!
//! This library solves three problems for AR photo walks:
//! 1. **No Shared Frame Problem**: every tracking session has its own origin,
//!    so markers are located through stored relative poses (reference graph)
//! 2. **Clutter Problem**: photos appear only when the viewer stands where the
//!    photographer stood and looks the same way (proximity visibility)
//! 3. **Off-Screen Problem**: targets outside the camera frustum are projected
//!    onto the viewport edge for HUD guidance (spatial guide)

pub mod pose;
pub mod reference_graph;
pub mod visibility;
pub mod spatial_guide;
pub mod link_store;
pub mod session;

// Re-export key types for convenience
pub use pose::{compose_from_relative, compose_to_relative, yaw_from_rotation, Pose, PoseError};
pub use reference_graph::{
    DeletionDecision, GraphError, Link, ReferenceGraph, ReferenceId, ReferenceNode, Resolution,
};
pub use visibility::{
    AnchorId, AnimationCommand, AnimationKind, AnimationTarget, PlacedAnchor, TickDivider,
    VisibilityConfig, VisibilityEngine, VisibilityError, VisibilityState,
};
pub use spatial_guide::{
    CameraIntrinsics, GuideConfig, GuideError, SafeAreaInsets, SpatialGuide, ViewingPosition,
};
pub use link_store::{
    delete_reference, load_graph, DeletionOutcome, LinkStore, MemoryLinkStore, PhotoPlacement,
    SledLinkStore, StoreError,
};
pub use session::{
    FrameOutcome, MarkerOutcome, PresentationSession, SessionConfig, SessionError, SessionSummary,
};

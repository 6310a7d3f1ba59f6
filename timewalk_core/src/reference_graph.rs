//! The reference graph - locating markers through stored relative poses
//!
//! Nodes are recognized markers, directed edges are the pose of one marker
//! in another marker's local frame. Links are always published in matched
//! pairs, so the graph is effectively undirected, but each direction keeps
//! its own relative pose.
//!
//! Resolution seeds the marker currently seen by the camera at its tracked
//! pose, then sweeps the link list until a pass resolves nothing:
//!
//! ```text
//!   pass 1: R --(R->A)--> A --(A->B)--> B      (later links may use A)
//!   pass 2: C --(C->B)      ...               (reverse edges picked up)
//!   pass 3: nothing new -> fixed point
//! ```

use crate::pose::{compose_from_relative, compose_to_relative, Pose};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use thiserror::Error;
use tracing::debug;

/// Identifier of a reference marker, shared across devices.
pub type ReferenceId = i64;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("Reference {0} is already resolved in this session")]
    AlreadyResolved(ReferenceId),

    #[error("Cannot link reference {0} to itself")]
    SelfLink(ReferenceId),
}

/// A marker known to the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceNode {
    pub id: ReferenceId,

    /// Pose in the current session frame, once resolved
    pub pose: Option<Pose>,
}

/// Pose of `to_id` expressed in `from_id`'s local frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub from_id: ReferenceId,
    pub to_id: ReferenceId,
    pub relative_pose: Pose,
}

/// Outcome of one resolution run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// Nodes resolved by this run, in resolution order
    pub resolved: Vec<(ReferenceId, Pose)>,

    /// Nodes still without a pose at the fixed point
    pub unreachable: BTreeSet<ReferenceId>,

    /// Passes over the link list, including the final empty one
    pub passes: usize,
}

/// What may be deleted together with a marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionDecision {
    /// No marker in the network survives: every marker in `component`
    /// goes together with its photos.
    Cascade { component: BTreeSet<ReferenceId> },

    /// Markers in the same network still reach this one; keep its photos.
    DeferPhotos { survivors: BTreeSet<ReferenceId> },
}

/// Markers and the links between them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReferenceGraph {
    nodes: BTreeMap<ReferenceId, ReferenceNode>,
    links: Vec<Link>,
}

impl ReferenceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an unresolved node. Returns `false` if it was already known.
    pub fn insert_node(&mut self, id: ReferenceId) -> bool {
        if self.nodes.contains_key(&id) {
            return false;
        }
        self.nodes.insert(id, ReferenceNode { id, pose: None });
        true
    }

    /// Adds a link, creating its endpoints as needed.
    ///
    /// Published links never change, so a second link for the same
    /// ordered pair is ignored and `false` is returned.
    pub fn insert_link(&mut self, link: Link) -> bool {
        if self
            .links
            .iter()
            .any(|l| l.from_id == link.from_id && l.to_id == link.to_id)
        {
            return false;
        }
        self.insert_node(link.from_id);
        self.insert_node(link.to_id);
        self.links.push(link);
        true
    }

    /// Adds many links, returning how many were new.
    pub fn insert_links<I>(&mut self, links: I) -> usize
    where
        I: IntoIterator<Item = Link>,
    {
        links
            .into_iter()
            .map(|link| self.insert_link(link))
            .filter(|&inserted| inserted)
            .count()
    }

    /// Drops a node and every link touching it.
    pub fn remove_node(&mut self, id: ReferenceId) -> Option<ReferenceNode> {
        self.links.retain(|l| l.from_id != id && l.to_id != id);
        self.nodes.remove(&id)
    }

    /// Resolves the marker the camera is looking at straight from tracking.
    pub fn seed_root(&mut self, id: ReferenceId, pose: Pose) -> Result<(), GraphError> {
        let node = self
            .nodes
            .entry(id)
            .or_insert(ReferenceNode { id, pose: None });
        if node.pose.is_some() {
            return Err(GraphError::AlreadyResolved(id));
        }
        node.pose = Some(pose);
        Ok(())
    }

    /// Propagates resolved poses along links until nothing changes.
    pub fn resolve(&mut self) -> Resolution {
        let Self { nodes, links } = self;
        let mut result = Resolution::default();

        loop {
            result.passes += 1;
            let before = result.resolved.len();

            for link in links.iter() {
                let from_pose = match nodes.get(&link.from_id).and_then(|n| n.pose) {
                    Some(pose) => pose,
                    None => continue,
                };
                let Some(to) = nodes.get_mut(&link.to_id) else {
                    continue;
                };
                if to.pose.is_some() {
                    continue;
                }

                let pose = compose_from_relative(&from_pose, &link.relative_pose);
                to.pose = Some(pose);
                result.resolved.push((link.to_id, pose));
            }

            let gained = result.resolved.len() - before;
            debug!("Resolution pass {}: {} new", result.passes, gained);
            if gained == 0 {
                break;
            }
        }

        result.unreachable = nodes
            .values()
            .filter(|n| n.pose.is_none())
            .map(|n| n.id)
            .collect();

        result
    }

    /// Forgets every resolved pose but keeps nodes and links.
    pub fn reset_resolution(&mut self) {
        for node in self.nodes.values_mut() {
            node.pose = None;
        }
    }

    /// Builds the two links recorded when the camera moves from one marker
    /// to another within a session.
    pub fn link_pair(
        prev_id: ReferenceId,
        prev_pose: &Pose,
        curr_id: ReferenceId,
        curr_pose: &Pose,
    ) -> Result<[Link; 2], GraphError> {
        if prev_id == curr_id {
            return Err(GraphError::SelfLink(prev_id));
        }
        Ok([
            Link {
                from_id: prev_id,
                to_id: curr_id,
                relative_pose: compose_to_relative(prev_pose, curr_pose),
            },
            Link {
                from_id: curr_id,
                to_id: prev_id,
                relative_pose: compose_to_relative(curr_pose, prev_pose),
            },
        ])
    }

    /// Direct neighbors of `id`, following links in either direction.
    pub fn linked_references(&self, id: ReferenceId) -> BTreeSet<ReferenceId> {
        self.links
            .iter()
            .filter_map(|l| {
                if l.from_id == id {
                    Some(l.to_id)
                } else if l.to_id == id {
                    Some(l.from_id)
                } else {
                    None
                }
            })
            .filter(|&other| other != id)
            .collect()
    }

    /// Everything reachable from `id`, `id` included.
    pub fn connected_component(&self, id: ReferenceId) -> BTreeSet<ReferenceId> {
        let mut seen = BTreeSet::from([id]);
        let mut queue = VecDeque::from([id]);

        while let Some(current) = queue.pop_front() {
            for next in self.linked_references(current) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        seen
    }

    /// Decides whether deleting `id` may take its photos with it.
    ///
    /// Deleted markers still relay poses, so any surviving marker in the
    /// connected component keeps the photos reachable.
    pub fn deletion_decision<F>(&self, id: ReferenceId, is_deleted: F) -> DeletionDecision
    where
        F: Fn(ReferenceId) -> bool,
    {
        let component = self.connected_component(id);
        let survivors: BTreeSet<ReferenceId> = component
            .iter()
            .copied()
            .filter(|&other| other != id && !is_deleted(other))
            .collect();

        if survivors.is_empty() {
            DeletionDecision::Cascade { component }
        } else {
            DeletionDecision::DeferPhotos { survivors }
        }
    }

    pub fn pose(&self, id: ReferenceId) -> Option<Pose> {
        self.nodes.get(&id).and_then(|n| n.pose)
    }

    pub fn contains(&self, id: ReferenceId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ReferenceNode> {
        self.nodes.values()
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    /// Ground truth marker poses in a shared world frame.
    fn world() -> BTreeMap<ReferenceId, Pose> {
        BTreeMap::from([
            (1, Pose::from_position_yaw(0.0, 0.0, 0.0, 0.0)),
            (2, Pose::from_position_yaw(4.0, 0.2, -1.0, 0.9)),
            (3, Pose::from_position_yaw(7.5, 0.0, 3.0, -2.1)),
            (4, Pose::from_position_yaw(-3.0, 0.5, 6.0, 3.0)),
        ])
    }

    fn pair(world: &BTreeMap<ReferenceId, Pose>, a: ReferenceId, b: ReferenceId) -> [Link; 2] {
        ReferenceGraph::link_pair(a, &world[&a], b, &world[&b]).unwrap()
    }

    #[test]
    fn test_single_link_resolution() {
        let mut graph = ReferenceGraph::new();
        graph.insert_link(Link {
            from_id: 10,
            to_id: 20,
            relative_pose: Pose::from_position_yaw(1.0, 0.0, 0.0, FRAC_PI_2),
        });
        graph.seed_root(10, Pose::origin()).unwrap();

        let resolution = graph.resolve();
        assert_eq!(resolution.resolved.len(), 1);
        assert!(resolution.unreachable.is_empty());

        let p = graph.pose(20).unwrap();
        assert_relative_eq!(p.position, nalgebra::Vector3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(p.yaw(), FRAC_PI_2);
    }

    #[test]
    fn test_chain_uses_nodes_from_same_pass() {
        let w = world();
        let mut graph = ReferenceGraph::new();
        graph.insert_links(pair(&w, 1, 2));
        graph.insert_links(pair(&w, 2, 3));
        graph.seed_root(1, w[&1]).unwrap();

        let resolution = graph.resolve();
        // 1->2 then 2->3 in the first pass, then a pass with nothing new
        assert_eq!(resolution.passes, 2);
        let order: Vec<_> = resolution.resolved.iter().map(|(id, _)| *id).collect();
        assert_eq!(order, vec![2, 3]);

        let c = graph.pose(3).unwrap();
        assert_relative_eq!(c.position, w[&3].position, epsilon = 1e-9);
        assert_relative_eq!(c.yaw(), w[&3].yaw(), epsilon = 1e-9);
    }

    #[test]
    fn test_fixed_point_independent_of_link_order() {
        let w = world();
        let mut links: Vec<Link> = Vec::new();
        links.extend(pair(&w, 3, 4));
        links.extend(pair(&w, 2, 3));
        links.extend(pair(&w, 1, 2));

        let mut forward = ReferenceGraph::new();
        forward.insert_links(links.clone());
        forward.seed_root(4, w[&4]).unwrap();
        forward.resolve();

        let mut reversed = ReferenceGraph::new();
        reversed.insert_links(links.into_iter().rev());
        reversed.seed_root(4, w[&4]).unwrap();
        reversed.resolve();

        for id in 1..=4 {
            let a = forward.pose(id).unwrap();
            let b = reversed.pose(id).unwrap();
            assert_relative_eq!(a.position, b.position, epsilon = 1e-9);
            assert_relative_eq!(a.position, w[&id].position, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_unreachable_reported() {
        let w = world();
        let mut graph = ReferenceGraph::new();
        graph.insert_links(pair(&w, 1, 2));
        graph.insert_links(pair(&w, 3, 4));
        graph.seed_root(2, w[&2]).unwrap();

        let resolution = graph.resolve();
        assert_eq!(resolution.unreachable, BTreeSet::from([3, 4]));
        assert!(graph.pose(1).is_some());
        assert!(graph.pose(3).is_none());
    }

    #[test]
    fn test_resolve_without_root() {
        let mut graph = ReferenceGraph::new();
        graph.insert_node(5);
        let resolution = graph.resolve();
        assert_eq!(resolution.passes, 1);
        assert_eq!(resolution.unreachable, BTreeSet::from([5]));
    }

    #[test]
    fn test_seed_is_write_once() {
        let mut graph = ReferenceGraph::new();
        graph.seed_root(1, Pose::origin()).unwrap();
        assert_eq!(
            graph.seed_root(1, Pose::origin()),
            Err(GraphError::AlreadyResolved(1))
        );

        graph.reset_resolution();
        assert!(graph.pose(1).is_none());
        assert!(graph.seed_root(1, Pose::origin()).is_ok());
    }

    #[test]
    fn test_resolved_nodes_not_overwritten() {
        let mut graph = ReferenceGraph::new();
        graph.insert_link(Link {
            from_id: 1,
            to_id: 2,
            relative_pose: Pose::from_position_yaw(5.0, 0.0, 0.0, 0.0),
        });
        graph.seed_root(1, Pose::origin()).unwrap();
        graph.seed_root(2, Pose::from_position_yaw(9.0, 0.0, 0.0, 0.0)).unwrap();

        let resolution = graph.resolve();
        assert!(resolution.resolved.is_empty());
        assert_relative_eq!(graph.pose(2).unwrap().position.x, 9.0);
    }

    #[test]
    fn test_link_pair_rejects_self_link() {
        let p = Pose::origin();
        assert_eq!(
            ReferenceGraph::link_pair(3, &p, 3, &p),
            Err(GraphError::SelfLink(3))
        );
    }

    #[test]
    fn test_duplicate_link_ignored() {
        let w = world();
        let mut graph = ReferenceGraph::new();
        assert_eq!(graph.insert_links(pair(&w, 1, 2)), 2);
        assert_eq!(graph.insert_links(pair(&w, 1, 2)), 0);
        assert_eq!(graph.link_count(), 2);
        assert_eq!(graph.node_count(), 2);
    }

    #[test]
    fn test_connected_component() {
        let w = world();
        let mut graph = ReferenceGraph::new();
        graph.insert_links(pair(&w, 1, 2));
        graph.insert_links(pair(&w, 2, 3));
        graph.insert_node(4);

        assert_eq!(graph.connected_component(3), BTreeSet::from([1, 2, 3]));
        assert_eq!(graph.connected_component(4), BTreeSet::from([4]));
    }

    #[test]
    fn test_deletion_cascades_without_links() {
        let mut graph = ReferenceGraph::new();
        graph.insert_node(1);
        assert_eq!(
            graph.deletion_decision(1, |_| false),
            DeletionDecision::Cascade {
                component: BTreeSet::from([1])
            }
        );
    }

    #[test]
    fn test_deletion_cascades_when_neighbors_deleted() {
        let w = world();
        let mut graph = ReferenceGraph::new();
        graph.insert_links(pair(&w, 1, 2));
        graph.insert_links(pair(&w, 1, 3));

        let decision = graph.deletion_decision(1, |id| id == 2 || id == 3);
        assert_eq!(
            decision,
            DeletionDecision::Cascade {
                component: BTreeSet::from([1, 2, 3])
            }
        );
    }

    #[test]
    fn test_deletion_defers_through_deleted_relay() {
        let w = world();
        let mut graph = ReferenceGraph::new();
        graph.insert_links(pair(&w, 1, 2));
        graph.insert_links(pair(&w, 2, 3));

        // 2 is gone but still links 1 to the surviving 3
        let decision = graph.deletion_decision(1, |id| id == 2);
        assert_eq!(
            decision,
            DeletionDecision::DeferPhotos {
                survivors: BTreeSet::from([3])
            }
        );
    }

    #[test]
    fn test_deletion_defers_with_survivor() {
        let w = world();
        let mut graph = ReferenceGraph::new();
        graph.insert_links(pair(&w, 1, 2));
        graph.insert_links(pair(&w, 1, 3));

        let decision = graph.deletion_decision(1, |id| id == 2);
        assert_eq!(
            decision,
            DeletionDecision::DeferPhotos {
                survivors: BTreeSet::from([3])
            }
        );
    }

    #[test]
    fn test_remove_node_drops_links() {
        let w = world();
        let mut graph = ReferenceGraph::new();
        graph.insert_links(pair(&w, 1, 2));
        graph.insert_links(pair(&w, 2, 3));

        graph.remove_node(2);
        assert_eq!(graph.link_count(), 0);
        assert!(!graph.contains(2));
    }
}

//! Quadtree nodes.

use orbis_math::{BoundingSphere, Extent, Quadrant};

use crate::{NodeHandle, Segment};

/// Lifecycle of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Leaf without a segment: never visited, or its segment was evicted.
    Unloaded,
    /// Leaf drawn with its own segment.
    Rendering,
    /// Has four children that are drawn instead.
    Subdivided,
}

/// One tile of the quadtree. Children are owned by their parent; freeing a
/// node frees its whole subtree.
#[derive(Debug)]
pub struct QuadNode {
    pub(crate) parent: Option<NodeHandle>,
    pub(crate) children: [Option<NodeHandle>; 4],
    pub(crate) partition: Option<Quadrant>,
    pub(crate) depth: u8,
    pub(crate) extent: Extent,
    pub(crate) bounds: BoundingSphere,
    pub(crate) segment: Option<Segment>,
    pub(crate) state: NodeState,
    pub(crate) last_visited_frame: u64,
}

impl QuadNode {
    pub(crate) fn new(
        parent: Option<NodeHandle>,
        partition: Option<Quadrant>,
        depth: u8,
        extent: Extent,
        bounds: BoundingSphere,
    ) -> Self {
        Self {
            parent,
            children: [None; 4],
            partition,
            depth,
            extent,
            bounds,
            segment: None,
            state: NodeState::Unloaded,
            last_visited_frame: 0,
        }
    }

    pub fn parent(&self) -> Option<NodeHandle> {
        self.parent
    }

    pub fn child(&self, quadrant: Quadrant) -> Option<NodeHandle> {
        self.children[quadrant.index()]
    }

    pub fn children(&self) -> impl Iterator<Item = NodeHandle> + '_ {
        self.children.iter().flatten().copied()
    }

    pub fn has_children(&self) -> bool {
        self.children.iter().any(Option::is_some)
    }

    /// Which quarter of the parent this node covers; `None` for the root.
    pub fn partition(&self) -> Option<Quadrant> {
        self.partition
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn extent(&self) -> &Extent {
        &self.extent
    }

    pub fn bounds(&self) -> &BoundingSphere {
        &self.bounds
    }

    pub fn segment(&self) -> Option<&Segment> {
        self.segment.as_ref()
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn last_visited_frame(&self) -> u64 {
        self.last_visited_frame
    }

    /// State a node settles in once its children are gone.
    pub(crate) fn leaf_state(&self) -> NodeState {
        if self.segment.is_some() {
            NodeState::Rendering
        } else {
            NodeState::Unloaded
        }
    }
}

//! The per-planet quadtree: decides every frame which tiles exist and which
//! are drawn, and keeps their GPU data and tile requests in step.
//!
//! Traversal is depth-first from the root. Each in-frustum node is sized on
//! screen by its bounding sphere; a leaf above the refine threshold splits
//! into four children, and a subdivided node below the (looser) collapse
//! threshold drops its subtree. Visible leaves end up in the visible list
//! that the render passes consume.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use orbis_config::QuadTreeConfig;
use orbis_math::{BoundingSphere, Ellipsoid, Extent, Frustum, Quadrant, TileProjection};
use orbis_render::{GpuContext, GpuError};

use crate::geometry::{IndexBuffer, IndexBufferTable, MAX_GRID_SIZE, SegmentGeometry};
use crate::loader::{RequestSpec, TileLoader};
use crate::segment::{ImageryState, SegmentIdAllocator, TerrainState};
use crate::{
    FrameState, LayerId, NodeArena, NodeHandle, NodeState, QuadNode, Segment, SegmentId,
    TextureBinding, TileKind, TilePayload, TileProvider,
};

/// A visible imagery layer as the manager sees it.
#[derive(Clone)]
pub struct ImageryLayer {
    pub id: LayerId,
    /// Bumped whenever the layer's loads are aborted; older results are
    /// discarded.
    pub generation: u64,
    pub provider: Arc<dyn TileProvider>,
}

/// Split/merge thresholds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RefinePolicy {
    pub refine_threshold_px: f64,
    pub hysteresis: f64,
    pub max_depth: u8,
}

impl RefinePolicy {
    pub fn from_config(config: &QuadTreeConfig) -> Self {
        Self {
            refine_threshold_px: config.refine_threshold_px,
            hysteresis: config.hysteresis,
            max_depth: config.max_depth,
        }
    }

    pub fn collapse_threshold_px(&self) -> f64 {
        self.refine_threshold_px * (1.0 - self.hysteresis)
    }

    pub fn should_refine(&self, size_px: f64, depth: u8) -> bool {
        depth < self.max_depth && size_px > self.refine_threshold_px
    }

    pub fn should_collapse(&self, size_px: f64) -> bool {
        size_px < self.collapse_threshold_px()
    }
}

struct Traversal<'a> {
    frame: &'a FrameState,
    frustum: Frustum,
    layers: &'a [ImageryLayer],
    frame_index: u64,
}

/// Owns the node tree, segments, shared index buffers and tile loader.
pub struct QuadTreeManager {
    config: QuadTreeConfig,
    policy: RefinePolicy,
    ellipsoid: Ellipsoid,
    projection: TileProjection,
    root_extent: Extent,
    nodes: NodeArena<QuadNode>,
    root: Option<NodeHandle>,
    segments: FxHashMap<SegmentId, NodeHandle>,
    segment_ids: SegmentIdAllocator,
    index_buffers: IndexBufferTable,
    loader: TileLoader,
    terrain_provider: Option<Arc<dyn TileProvider>>,
    height_factor: f64,
    visible: Vec<SegmentId>,
    visited_nodes: usize,
    rendered_nodes: usize,
}

impl QuadTreeManager {
    pub fn new(
        mut config: QuadTreeConfig,
        ellipsoid: Ellipsoid,
        projection: TileProjection,
        root_extent: Extent,
    ) -> Self {
        let grid_size = drawable_grid_size(config.grid_size);
        if grid_size != config.grid_size {
            warn!(
                requested = config.grid_size,
                grid_size,
                "Segment grid size rounded to a power of two up to {MAX_GRID_SIZE}"
            );
            config.grid_size = grid_size;
        }
        Self {
            policy: RefinePolicy::from_config(&config),
            config,
            ellipsoid,
            projection,
            root_extent,
            nodes: NodeArena::new(),
            root: None,
            segments: FxHashMap::default(),
            segment_ids: SegmentIdAllocator::new(),
            index_buffers: IndexBufferTable::default(),
            loader: TileLoader::new(),
            terrain_provider: None,
            height_factor: 1.0,
            visible: Vec::new(),
            visited_nodes: 0,
            rendered_nodes: 0,
        }
    }

    /// Create the shared index buffers and the root node.
    pub fn init(&mut self, gpu: &mut dyn GpuContext) -> Result<(), GpuError> {
        if self.root.is_some() {
            return Ok(());
        }
        self.index_buffers = IndexBufferTable::create(gpu)?;
        self.root = Some(self.create_root());
        debug!(
            "Quadtree initialized: root {:?}, {} index buffers",
            self.root_extent,
            self.index_buffers.len()
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.root.is_some()
    }

    fn create_root(&mut self) -> NodeHandle {
        let bounds = self.bounds_for(&self.root_extent);
        self.nodes
            .insert(QuadNode::new(None, None, 0, self.root_extent, bounds))
    }

    fn bounds_for(&self, extent: &Extent) -> BoundingSphere {
        BoundingSphere::from_extent(
            extent,
            self.projection,
            &self.ellipsoid,
            self.config.terrain_margin_m * self.height_factor,
        )
    }

    /// Traverse the tree for `frame`, refining and collapsing nodes and
    /// filling the visible list.
    pub fn render_tree(
        &mut self,
        frame: &FrameState,
        gpu: &mut dyn GpuContext,
        layers: &[ImageryLayer],
        frame_index: u64,
    ) -> Result<(), GpuError> {
        self.visited_nodes = 0;
        self.rendered_nodes = 0;
        self.visible.clear();

        let Some(root) = self.root else {
            debug!("render_tree called before init");
            return Ok(());
        };
        let traversal = Traversal {
            frame,
            frustum: frame.frustum(),
            layers,
            frame_index,
        };
        self.visit(root, &traversal, gpu)?;
        trace!(
            visited = self.visited_nodes,
            rendered = self.rendered_nodes,
            segments = self.segments.len(),
            "Quadtree traversal done"
        );
        Ok(())
    }

    fn visit(
        &mut self,
        handle: NodeHandle,
        t: &Traversal<'_>,
        gpu: &mut dyn GpuContext,
    ) -> Result<(), GpuError> {
        self.visited_nodes += 1;
        let Some(node) = self.nodes.get_mut(handle) else {
            return Ok(());
        };
        if !t.frustum.intersects_sphere(&node.bounds) {
            return Ok(());
        }
        node.last_visited_frame = t.frame_index;
        let size_px = t.frame.apparent_size_px(&node.bounds);
        let depth = node.depth;
        let state = node.state;

        self.ensure_segment(handle, t.layers, gpu)?;

        let refine = match state {
            NodeState::Subdivided => {
                if self.policy.should_collapse(size_px) {
                    self.collapse(handle, gpu);
                    false
                } else {
                    true
                }
            }
            NodeState::Unloaded | NodeState::Rendering => {
                if self.policy.should_refine(size_px, depth) {
                    self.subdivide(handle);
                    true
                } else {
                    false
                }
            }
        };

        if refine {
            let children = self
                .nodes
                .get(handle)
                .map(|n| n.children)
                .unwrap_or([None; 4]);
            for child in children.into_iter().flatten() {
                self.visit(child, t, gpu)?;
            }
        } else {
            self.render_leaf(handle, t.layers);
        }
        Ok(())
    }

    /// Create the node's segment on first visit, rebuild stale geometry and
    /// request any tiles it is missing.
    fn ensure_segment(
        &mut self,
        handle: NodeHandle,
        layers: &[ImageryLayer],
        gpu: &mut dyn GpuContext,
    ) -> Result<(), GpuError> {
        let Some(node) = self.nodes.get(handle) else {
            return Ok(());
        };
        let extent = node.extent;
        let depth = node.depth;

        if node.segment.is_none() {
            let geometry = SegmentGeometry::build(
                &extent,
                self.projection,
                &self.ellipsoid,
                self.config.grid_size,
                None,
                self.height_factor,
            );
            let Some(id) = self.segment_ids.allocate() else {
                warn!(
                    live = self.segments.len(),
                    "Segment ids exhausted, depth {depth} tile left without a segment"
                );
                return Ok(());
            };
            let terrain = if self.terrain_provider.is_some() {
                TerrainState::Missing
            } else {
                TerrainState::Flat
            };
            let segment = Segment::new(gpu, id, handle, geometry, terrain)?;
            self.segments.insert(id, handle);
            if let Some(node) = self.nodes.get_mut(handle) {
                node.segment = Some(segment);
                if !node.has_children() {
                    node.state = NodeState::Rendering;
                }
            }
        }

        let projection = self.projection;
        let ellipsoid = self.ellipsoid;
        let grid_size = self.config.grid_size;
        let height_factor = self.height_factor;
        let Some(segment) = self
            .nodes
            .get_mut(handle)
            .and_then(|n| n.segment.as_mut())
        else {
            return Ok(());
        };

        if segment.geometry_stale {
            let geometry = SegmentGeometry::build(
                &extent,
                projection,
                &ellipsoid,
                grid_size,
                segment.terrain_heights(),
                height_factor,
            );
            segment.replace_geometry(gpu, geometry)?;
        }

        let spec = |kind, generation| RequestSpec {
            node: handle,
            extent,
            depth,
            projection,
            kind,
            generation,
        };

        if segment.terrain == TerrainState::Missing {
            if let Some(provider) = &self.terrain_provider {
                let token = self.loader.request(provider, spec(TileKind::Terrain, 0));
                segment.terrain = TerrainState::Pending(token);
            }
        }

        for layer in layers {
            let needs_request = match segment.imagery.get(&layer.id) {
                None => true,
                Some(ImageryState::Pending { generation, .. }) => *generation != layer.generation,
                Some(ImageryState::Ready(_) | ImageryState::Failed) => false,
            };
            if needs_request {
                let token = self.loader.request(
                    &layer.provider,
                    spec(TileKind::Imagery(layer.id), layer.generation),
                );
                segment.imagery.insert(
                    layer.id,
                    ImageryState::Pending {
                        token,
                        generation: layer.generation,
                    },
                );
            }
        }
        Ok(())
    }

    fn subdivide(&mut self, handle: NodeHandle) {
        let Some(node) = self.nodes.get(handle) else {
            return;
        };
        if node.has_children() {
            return;
        }
        let extent = node.extent;
        let depth = node.depth + 1;

        let mut children = [None; 4];
        for quadrant in Quadrant::ALL {
            let child_extent = extent.quadrant(quadrant);
            let bounds = self.bounds_for(&child_extent);
            let child = QuadNode::new(Some(handle), Some(quadrant), depth, child_extent, bounds);
            children[quadrant.index()] = Some(self.nodes.insert(child));
        }
        if let Some(node) = self.nodes.get_mut(handle) {
            node.children = children;
            node.state = NodeState::Subdivided;
        }
    }

    /// Destroy the node's children and make it a leaf again.
    fn collapse(&mut self, handle: NodeHandle, gpu: &mut dyn GpuContext) {
        let Some(node) = self.nodes.get_mut(handle) else {
            return;
        };
        let children = std::mem::replace(&mut node.children, [None; 4]);
        node.state = node.leaf_state();
        for child in children.into_iter().flatten() {
            self.destroy_subtree(child, gpu);
        }
    }

    /// Free `handle` and all its descendants, releasing their segments and
    /// cancelling their requests.
    fn destroy_subtree(&mut self, handle: NodeHandle, gpu: &mut dyn GpuContext) {
        let mut stack = vec![handle];
        while let Some(h) = stack.pop() {
            let Some(node) = self.nodes.remove(h) else {
                continue;
            };
            stack.extend(node.children.into_iter().flatten());
            if let Some(segment) = node.segment {
                self.release_segment(segment, gpu);
            }
        }
    }

    fn release_segment(&mut self, segment: Segment, gpu: &mut dyn GpuContext) {
        for token in segment.pending_tokens() {
            self.loader.cancel(token);
        }
        self.segments.remove(&segment.id());
        self.segment_ids.release(segment.id());
        segment.release(gpu);
    }

    /// Resolve this frame's textures for a visible leaf and list it.
    fn render_leaf(&mut self, handle: NodeHandle, layers: &[ImageryLayer]) {
        let Some(node) = self.nodes.get(handle) else {
            return;
        };
        let Some(segment) = node.segment.as_ref() else {
            return;
        };

        let mut bindings = FxHashMap::default();
        for layer in layers {
            if let Some(texture) = segment.own_texture(layer.id) {
                bindings.insert(layer.id, TextureBinding::own(texture));
            } else if let Some(binding) = self.ancestor_binding(node, layer.id) {
                bindings.insert(layer.id, binding);
            }
        }
        let id = segment.id();

        if let Some(segment) = self
            .nodes
            .get_mut(handle)
            .and_then(|n| n.segment.as_mut())
        {
            segment.bindings = bindings;
        }
        self.visible.push(id);
        self.rendered_nodes += 1;
    }

    /// The nearest ancestor texture for `layer`, biased to cover `node`.
    fn ancestor_binding(&self, node: &QuadNode, layer: LayerId) -> Option<TextureBinding> {
        let mut current = node.parent;
        while let Some(handle) = current {
            let ancestor = self.nodes.get(handle)?;
            if let Some(texture) = ancestor.segment.as_ref().and_then(|s| s.own_texture(layer)) {
                return Some(TextureBinding {
                    texture,
                    bias: ancestor_bias(&node.extent, &ancestor.extent),
                    inherited: true,
                });
            }
            current = ancestor.parent;
        }
        None
    }

    /// Apply every tile result that arrived since the last call.
    ///
    /// Results for destroyed nodes, cancelled requests or aborted layer
    /// generations are dropped. Returns how many were applied.
    pub fn apply_completions(
        &mut self,
        gpu: &mut dyn GpuContext,
        layers: &[ImageryLayer],
    ) -> Result<usize, GpuError> {
        let mut applied = 0;
        for completion in self.loader.drain() {
            let Some(segment) = self
                .nodes
                .get_mut(completion.node)
                .and_then(|n| n.segment.as_mut())
            else {
                trace!(token = completion.token.0, "Completion for a freed node");
                continue;
            };

            match completion.kind {
                TileKind::Imagery(layer) => {
                    let expected = ImageryState::Pending {
                        token: completion.token,
                        generation: completion.generation,
                    };
                    if segment.imagery.get(&layer) != Some(&expected) {
                        continue;
                    }
                    let current = layers.iter().find(|l| l.id == layer).map(|l| l.generation);
                    if current != Some(completion.generation) {
                        segment.imagery.remove(&layer);
                        continue;
                    }
                    match completion.result {
                        Ok(TilePayload::Imagery(image)) => {
                            let texture = gpu.create_texture_from_image(&image)?;
                            segment.set_texture(gpu, layer, texture);
                            applied += 1;
                        }
                        Ok(other) => {
                            warn!(
                                "{layer} provider returned {} for an imagery tile",
                                other.kind_name()
                            );
                            segment.imagery.insert(layer, ImageryState::Failed);
                        }
                        Err(e) => {
                            warn!("Imagery tile for {layer} failed: {e}");
                            segment.imagery.insert(layer, ImageryState::Failed);
                        }
                    }
                }
                TileKind::Terrain => {
                    if segment.terrain != TerrainState::Pending(completion.token) {
                        continue;
                    }
                    match completion.result {
                        Ok(TilePayload::Terrain(heights)) => {
                            segment.terrain = TerrainState::Ready(heights);
                            segment.geometry_stale = true;
                            applied += 1;
                        }
                        Ok(other) => {
                            warn!(
                                "Terrain provider returned {} for a terrain tile",
                                other.kind_name()
                            );
                            segment.terrain = TerrainState::Failed;
                        }
                        Err(e) => {
                            warn!("Terrain tile failed: {e}");
                            segment.terrain = TerrainState::Failed;
                        }
                    }
                }
            }
        }
        Ok(applied)
    }

    /// Cancel `layer`'s in-flight requests and forget them, so the layer is
    /// requested afresh if it becomes visible again.
    pub fn abort_layer(&mut self, layer: LayerId) -> usize {
        let cancelled = self.loader.cancel_layer(layer);
        for handle in self.segments.values() {
            if let Some(segment) = self
                .nodes
                .get_mut(*handle)
                .and_then(|n| n.segment.as_mut())
            {
                if matches!(
                    segment.imagery.get(&layer),
                    Some(ImageryState::Pending { .. })
                ) {
                    segment.imagery.remove(&layer);
                }
            }
        }
        debug!("Aborted {cancelled} requests for {layer}");
        cancelled
    }

    /// Replace the terrain source. Existing segments fall back to sea level
    /// until the new provider delivers.
    pub fn set_terrain_provider(&mut self, provider: Option<Arc<dyn TileProvider>>) {
        self.loader.cancel_terrain();
        let next = if provider.is_some() {
            TerrainState::Missing
        } else {
            TerrainState::Flat
        };
        self.terrain_provider = provider;
        for handle in self.segments.values() {
            if let Some(segment) = self
                .nodes
                .get_mut(*handle)
                .and_then(|n| n.segment.as_mut())
            {
                segment.terrain = next.clone();
                segment.geometry_stale = true;
            }
        }
    }

    pub fn height_factor(&self) -> f64 {
        self.height_factor
    }

    /// Change the terrain exaggeration. Returns whether it changed.
    pub fn set_height_factor(&mut self, factor: f64) -> bool {
        if factor == self.height_factor {
            return false;
        }
        self.height_factor = factor;
        self.reload_terrain();
        true
    }

    /// Mark every segment's geometry for rebuild on its next visit.
    pub fn reload_terrain(&mut self) {
        for handle in self.segments.values() {
            if let Some(segment) = self
                .nodes
                .get_mut(*handle)
                .and_then(|n| n.segment.as_mut())
            {
                segment.geometry_stale = true;
            }
        }
    }

    /// Release segments of nodes not visited this frame, least recently
    /// visited first, until the live count is within `max_segments`.
    /// Nothing happens when no cap is configured.
    pub fn evict_lru(&mut self, gpu: &mut dyn GpuContext, frame_index: u64) -> usize {
        let Some(cap) = self.config.max_segments else {
            return 0;
        };
        if self.segments.len() <= cap {
            return 0;
        }

        // A node not visited this frame has no descendant visited this frame.
        let mut candidates: Vec<(u64, u8, NodeHandle)> = self
            .segments
            .values()
            .filter_map(|h| self.nodes.get(*h).map(|n| (n, *h)))
            .filter(|(n, _)| n.last_visited_frame < frame_index)
            .map(|(n, h)| (n.last_visited_frame, n.depth, h))
            .collect();
        // Oldest first; deeper nodes before their ancestors.
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

        let mut evicted = 0;
        for (_, _, handle) in candidates {
            if self.segments.len() <= cap {
                break;
            }
            let Some(node) = self.nodes.get_mut(handle) else {
                continue;
            };
            let Some(segment) = node.segment.take() else {
                continue;
            };
            if node.state == NodeState::Rendering {
                node.state = NodeState::Unloaded;
            }
            self.release_segment(segment, gpu);
            evicted += 1;
        }
        if evicted > 0 {
            debug!("Evicted {evicted} segments (cap {cap})");
        }
        evicted
    }

    /// Drop the whole tree and start again from a fresh root.
    pub fn clear_tree(&mut self, gpu: &mut dyn GpuContext) {
        if let Some(root) = self.root.take() {
            self.destroy_subtree(root, gpu);
            self.root = Some(self.create_root());
        }
        self.visible.clear();
    }

    /// Release everything, including the shared index buffers.
    pub fn destroy(&mut self, gpu: &mut dyn GpuContext) {
        if let Some(root) = self.root.take() {
            self.destroy_subtree(root, gpu);
        }
        self.index_buffers.release(gpu);
        self.visible.clear();
    }

    pub fn visible_segments(&self) -> &[SegmentId] {
        &self.visible
    }

    pub fn clear_visible(&mut self) {
        self.visible.clear();
    }

    pub fn visited_nodes(&self) -> usize {
        self.visited_nodes
    }

    pub fn rendered_nodes(&self) -> usize {
        self.rendered_nodes
    }

    pub fn root(&self) -> Option<NodeHandle> {
        self.root
    }

    pub fn node(&self, handle: NodeHandle) -> Option<&QuadNode> {
        self.nodes.get(handle)
    }

    pub fn segment_node(&self, id: SegmentId) -> Option<NodeHandle> {
        self.segments.get(&id).copied()
    }

    pub fn segment(&self, id: SegmentId) -> Option<&Segment> {
        self.segment_node(id)
            .and_then(|h| self.nodes.get(h))
            .and_then(|n| n.segment.as_ref())
    }

    /// Shared index buffer for a segment's grid size.
    pub fn index_buffer(&self, grid_size: u32) -> Option<IndexBuffer> {
        self.index_buffers.get(grid_size)
    }

    /// Extents of every leaf in the tree, visible or not.
    pub fn leaf_extents(&self) -> Vec<Extent> {
        self.nodes
            .iter()
            .filter(|(_, n)| !n.has_children())
            .map(|(_, n)| n.extent)
            .collect()
    }

    pub fn live_segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn pending_requests(&self) -> usize {
        self.loader.pending_count()
    }

    pub fn policy(&self) -> RefinePolicy {
        self.policy
    }

    pub fn ellipsoid(&self) -> &Ellipsoid {
        &self.ellipsoid
    }

    pub fn projection(&self) -> TileProjection {
        self.projection
    }

    pub fn root_extent(&self) -> &Extent {
        &self.root_extent
    }
}

/// Texture-coordinate bias mapping `child` into `ancestor`'s texture, with
/// `v` growing southward.
pub fn ancestor_bias(child: &Extent, ancestor: &Extent) -> [f32; 3] {
    let scale = child.width() / ancestor.width();
    let offset_u = (child.west() - ancestor.west()) / ancestor.width();
    let offset_v = (ancestor.north() - child.north()) / ancestor.height();
    [offset_u as f32, offset_v as f32, scale as f32]
}

/// Nearest grid size with a shared index buffer, rounding up.
fn drawable_grid_size(requested: u32) -> u32 {
    requested.clamp(1, MAX_GRID_SIZE).next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ImmediateProvider, ManualProvider};
    use crate::TerrainHeights;
    use glam::DVec3;
    use orbis_render::{HeadlessContext, TileImage};

    const VIEWPORT: (u32, u32) = (1280, 720);

    fn config() -> QuadTreeConfig {
        QuadTreeConfig {
            grid_size: 4,
            ..QuadTreeConfig::default()
        }
    }

    fn manager_with(config: QuadTreeConfig) -> (QuadTreeManager, HeadlessContext) {
        let mut gpu = HeadlessContext::new();
        let mut m = QuadTreeManager::new(
            config,
            Ellipsoid::WGS84,
            TileProjection::Geographic,
            Extent::geographic_world(),
        );
        m.init(&mut gpu).unwrap();
        (m, gpu)
    }

    fn manager() -> (QuadTreeManager, HeadlessContext) {
        manager_with(config())
    }

    /// Camera above (lon, lat) at `altitude`, looking at the planet centre.
    fn camera(lon: f64, lat: f64, altitude: f64) -> FrameState {
        let e = Ellipsoid::WGS84;
        let eye = e.geodetic_to_cartesian(lon, lat, altitude);
        FrameState::look_at(eye, DVec3::ZERO, DVec3::Z, 45f64.to_radians(), VIEWPORT)
    }

    fn imagery_layer(id: u32, provider: Arc<dyn TileProvider>) -> ImageryLayer {
        ImageryLayer {
            id: LayerId(id),
            generation: 0,
            provider,
        }
    }

    fn solid_provider() -> Arc<dyn TileProvider> {
        Arc::new(ImmediateProvider::new(|_| {
            Ok(TilePayload::Imagery(TileImage::solid(2, 2, [10, 20, 30, 255])))
        }))
    }

    fn assert_disjoint_tiling(leaves: &[Extent], root: &Extent) {
        let total: f64 = leaves.iter().map(Extent::area).sum();
        assert!((total - root.area()).abs() / root.area() < 1e-9);
        for (i, a) in leaves.iter().enumerate() {
            assert!(root.contains_extent(a));
            for b in &leaves[i + 1..] {
                assert!(!a.intersects(b), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn test_init_creates_root_and_index_buffers() {
        let (m, gpu) = manager();
        assert!(m.is_initialized());
        assert_eq!(m.node_count(), 1);
        assert_eq!(gpu.live_buffers(), 6);
        assert!(m.index_buffer(4).is_some());
    }

    #[test]
    fn test_far_camera_draws_only_root() {
        let (mut m, mut gpu) = manager();
        m.render_tree(&camera(0.0, 0.0, 2.0e8), &mut gpu, &[], 1)
            .unwrap();
        assert_eq!(m.visible_segments().len(), 1);
        assert_eq!(m.rendered_nodes(), 1);
        assert_eq!(m.node_count(), 1);
        assert_eq!(m.live_segment_count(), 1);
        let root = m.root().unwrap();
        assert_eq!(m.node(root).unwrap().state(), NodeState::Rendering);
        assert_eq!(m.segment_node(m.visible_segments()[0]), Some(root));
    }

    #[test]
    fn test_near_camera_refines_into_disjoint_leaves() {
        let (mut m, mut gpu) = manager();
        let frame = camera(10.0, 20.0, 5.0e4);
        for i in 1..=3 {
            m.render_tree(&frame, &mut gpu, &[], i).unwrap();
        }
        assert!(m.visible_segments().len() > 1);

        let root = *m.root_extent();
        assert_disjoint_tiling(&m.leaf_extents(), &root);

        let visible: Vec<Extent> = m
            .visible_segments()
            .iter()
            .map(|id| *m.node(m.segment_node(*id).unwrap()).unwrap().extent())
            .collect();
        for (i, a) in visible.iter().enumerate() {
            assert!(root.contains_extent(a));
            for b in &visible[i + 1..] {
                assert!(!a.intersects(b));
            }
        }
    }

    #[test]
    fn test_segment_ids_recycle_at_the_top_of_the_range() {
        let near = camera(10.0, 20.0, 5.0e4);
        let (mut reference, mut gpu) = manager();
        for i in 1..=3 {
            reference.render_tree(&near, &mut gpu, &[], i).unwrap();
        }
        let n = reference.live_segment_count() as u32;
        assert!(n > 2);

        // The first near pass takes exactly the last `n` ids.
        let (mut m, mut gpu) = manager();
        m.segment_ids = SegmentIdAllocator::starting_after(SegmentId::MAX - n);
        for i in 1..=3 {
            m.render_tree(&near, &mut gpu, &[], i).unwrap();
        }
        assert_eq!(m.live_segment_count() as u32, n);
        let root_id = m.node(m.root().unwrap()).unwrap().segment().unwrap().id();

        m.render_tree(&camera(10.0, 20.0, 2.0e8), &mut gpu, &[], 4).unwrap();
        assert_eq!(m.live_segment_count(), 1);

        for i in 5..=7 {
            m.render_tree(&near, &mut gpu, &[], i).unwrap();
        }
        assert_eq!(m.live_segment_count() as u32, n);
        let visible = m.visible_segments();
        assert!(visible.len() > 1);
        for (i, id) in visible.iter().enumerate() {
            assert!(id.get() > SegmentId::MAX - n && id.get() <= SegmentId::MAX);
            assert_ne!(*id, root_id);
            assert!(!visible[i + 1..].contains(id));
        }
    }

    #[test]
    fn test_odd_grid_size_rounds_up_to_an_indexed_one() {
        assert_eq!(drawable_grid_size(0), 1);
        assert_eq!(drawable_grid_size(12), 16);
        assert_eq!(drawable_grid_size(16), 16);
        assert_eq!(drawable_grid_size(100), MAX_GRID_SIZE);

        let (mut m, mut gpu) = manager_with(QuadTreeConfig {
            grid_size: 12,
            ..QuadTreeConfig::default()
        });
        m.render_tree(&camera(0.0, 0.0, 2.0e8), &mut gpu, &[], 1)
            .unwrap();
        let id = m.visible_segments()[0];
        let grid = m.segment(id).unwrap().grid_size();
        assert_eq!(grid, 16);
        assert!(m.index_buffer(grid).is_some());
    }

    #[test]
    fn test_max_depth_respected() {
        let (mut m, mut gpu) = manager_with(QuadTreeConfig {
            max_depth: 3,
            ..config()
        });
        m.render_tree(&camera(0.0, 0.0, 100.0), &mut gpu, &[], 1)
            .unwrap();
        for id in m.visible_segments() {
            let node = m.node(m.segment_node(*id).unwrap()).unwrap();
            assert!(node.depth() <= 3);
        }
    }

    #[test]
    fn test_counters_reset_each_traversal() {
        let (mut m, mut gpu) = manager();
        m.render_tree(&camera(0.0, 0.0, 5.0e4), &mut gpu, &[], 1)
            .unwrap();
        let visited = m.visited_nodes();
        assert!(visited > 1);
        m.render_tree(&camera(0.0, 0.0, 2.0e8), &mut gpu, &[], 2)
            .unwrap();
        assert!(m.visited_nodes() < visited);
        assert_eq!(m.rendered_nodes(), m.visible_segments().len());
    }

    #[test]
    fn test_zooming_out_collapses_and_releases() {
        let (mut m, mut gpu) = manager();
        m.render_tree(&camera(0.0, 0.0, 5.0e4), &mut gpu, &[], 1)
            .unwrap();
        assert!(m.node_count() > 1);

        m.render_tree(&camera(0.0, 0.0, 2.0e8), &mut gpu, &[], 2)
            .unwrap();
        assert_eq!(m.node_count(), 1);
        assert_eq!(m.live_segment_count(), 1);
        // root segment + index buffers
        assert_eq!(gpu.live_buffers(), 3 + 6);
    }

    #[test]
    fn test_policy_hysteresis_band() {
        let policy = RefinePolicy {
            refine_threshold_px: 256.0,
            hysteresis: 0.25,
            max_depth: 10,
        };
        assert_eq!(policy.collapse_threshold_px(), 192.0);
        assert!(policy.should_refine(257.0, 0));
        assert!(!policy.should_refine(257.0, 10));
        assert!(!policy.should_refine(200.0, 0));
        assert!(!policy.should_collapse(200.0));
        assert!(policy.should_collapse(191.0));
    }

    #[test]
    fn test_sweep_around_threshold_toggles_at_most_once() {
        let (mut m, mut gpu) = manager();
        let root = m.root().unwrap();
        let bounds = *m.node(root).unwrap().bounds();
        let policy = m.policy();

        // Find the altitude at which the root crosses the refine threshold.
        let base = camera(0.0, 0.0, 1.0e7);
        let scale = base.apparent_size_px(&bounds) / policy.refine_threshold_px;
        let distance = base.eye.distance(bounds.center) - bounds.radius;
        let crossing = distance * scale;

        let mut toggles = 0;
        let mut last = None;
        for step in 0..40 {
            // Jitter within ±5% of the crossing distance, well inside the band.
            let wobble = if step % 2 == 0 { 0.97 } else { 1.03 };
            let d = crossing * wobble + bounds.radius;
            let eye = DVec3::new(d, 0.0, 0.0) + bounds.center;
            let frame = FrameState::look_at(
                eye,
                bounds.center,
                DVec3::Z,
                base.view_angle,
                VIEWPORT,
            );
            m.render_tree(&frame, &mut gpu, &[], step + 1).unwrap();
            let state = m.node(root).unwrap().state();
            if last.is_some_and(|s| s != state) {
                toggles += 1;
            }
            last = Some(state);
        }
        assert!(toggles <= 1, "root toggled {toggles} times");
    }

    #[test]
    fn test_culled_node_keeps_children() {
        let (mut m, mut gpu) = manager();
        m.render_tree(&camera(0.0, 0.0, 5.0e4), &mut gpu, &[], 1)
            .unwrap();
        let nodes_before = m.node_count();
        let segments_before = m.live_segment_count();

        // Far away and looking away from the planet: the root is culled.
        let eye = Ellipsoid::WGS84.geodetic_to_cartesian(0.0, 0.0, 2.0e8);
        let away = FrameState::look_at(eye, eye * 2.0, DVec3::Z, 45f64.to_radians(), VIEWPORT);
        m.render_tree(&away, &mut gpu, &[], 2).unwrap();
        assert!(m.visible_segments().is_empty());
        assert_eq!(m.rendered_nodes(), 0);
        assert_eq!(m.node_count(), nodes_before);
        assert_eq!(m.live_segment_count(), segments_before);
    }

    #[test]
    fn test_imagery_requested_and_applied() {
        let (mut m, mut gpu) = manager();
        let manual = Arc::new(ManualProvider::new());
        let layers = [imagery_layer(1, manual.clone())];

        m.render_tree(&camera(0.0, 0.0, 2.0e8), &mut gpu, &layers, 1)
            .unwrap();
        assert_eq!(manual.pending_count(), 1);
        let id = m.visible_segments()[0];
        assert!(!m.segment(id).unwrap().imagery_ready(LayerId(1)));
        assert!(m.segment(id).unwrap().binding(LayerId(1)).is_none());

        manual.complete_all(|_| Ok(TilePayload::Imagery(TileImage::solid(2, 2, [1; 4]))));
        assert_eq!(m.apply_completions(&mut gpu, &layers).unwrap(), 1);
        m.render_tree(&camera(0.0, 0.0, 2.0e8), &mut gpu, &layers, 2)
            .unwrap();
        let segment = m.segment(id).unwrap();
        assert!(segment.imagery_ready(LayerId(1)));
        let binding = segment.binding(LayerId(1)).unwrap();
        assert!(!binding.inherited);
        assert_eq!(binding.bias, [0.0, 0.0, 1.0]);
        // No re-request once ready.
        assert_eq!(manual.requested_count(), 1);
    }

    #[test]
    fn test_failed_imagery_stays_not_ready() {
        let (mut m, mut gpu) = manager();
        let manual = Arc::new(ManualProvider::new());
        let layers = [imagery_layer(1, manual.clone())];
        m.render_tree(&camera(0.0, 0.0, 2.0e8), &mut gpu, &layers, 1)
            .unwrap();
        manual.fail_all("404");
        assert_eq!(m.apply_completions(&mut gpu, &layers).unwrap(), 0);
        m.render_tree(&camera(0.0, 0.0, 2.0e8), &mut gpu, &layers, 2)
            .unwrap();
        let id = m.visible_segments()[0];
        assert!(!m.segment(id).unwrap().imagery_ready(LayerId(1)));
        assert_eq!(manual.requested_count(), 1);
    }

    #[test]
    fn test_children_inherit_ancestor_texture_with_bias() {
        let (mut m, mut gpu) = manager();
        let manual = Arc::new(ManualProvider::new());
        let layers = [imagery_layer(1, manual.clone())];

        // Root alone first, and give it a texture.
        m.render_tree(&camera(0.0, 0.0, 2.0e8), &mut gpu, &layers, 1)
            .unwrap();
        manual.complete_all(|_| Ok(TilePayload::Imagery(TileImage::solid(2, 2, [1; 4]))));
        m.apply_completions(&mut gpu, &layers).unwrap();

        // Zoom in; children have no imagery yet.
        m.render_tree(&camera(0.0, 0.0, 5.0e6), &mut gpu, &layers, 2)
            .unwrap();
        let root = m.root().unwrap();
        let root_extent = *m.node(root).unwrap().extent();
        assert_eq!(m.node(root).unwrap().state(), NodeState::Subdivided);

        assert!(!m.visible_segments().is_empty());
        for id in m.visible_segments() {
            let handle = m.segment_node(*id).unwrap();
            let node = m.node(handle).unwrap();
            assert!(node.depth() > 0);
            let binding = node.segment().unwrap().binding(LayerId(1)).unwrap();
            assert!(binding.inherited);
            assert_eq!(binding.bias, ancestor_bias(node.extent(), &root_extent));
        }
    }

    #[test]
    fn test_ancestor_bias_quadrants() {
        let root = Extent::geographic_world();
        assert_eq!(
            ancestor_bias(&root.quadrant(Quadrant::NorthWest), &root),
            [0.0, 0.0, 0.5]
        );
        assert_eq!(
            ancestor_bias(&root.quadrant(Quadrant::SouthEast), &root),
            [0.5, 0.5, 0.5]
        );
        let grandchild = root
            .quadrant(Quadrant::NorthEast)
            .quadrant(Quadrant::SouthWest);
        assert_eq!(ancestor_bias(&grandchild, &root), [0.5, 0.25, 0.25]);
    }

    #[test]
    fn test_stale_completion_after_collapse_is_noop() {
        let (mut m, mut gpu) = manager();
        let manual = Arc::new(ManualProvider::new());
        let layers = [imagery_layer(1, manual.clone())];

        m.render_tree(&camera(0.0, 0.0, 5.0e4), &mut gpu, &layers, 1)
            .unwrap();
        let requested = manual.requested_count();
        assert!(requested > 1);

        // Zoom out: everything below the root collapses and is cancelled.
        m.render_tree(&camera(0.0, 0.0, 2.0e8), &mut gpu, &layers, 2)
            .unwrap();
        assert_eq!(m.pending_requests(), 1);
        assert_eq!(manual.cancelled().len(), requested - 1);

        let textures_before = gpu.live_textures();
        let applied = manual.complete_all(|_| {
            Ok(TilePayload::Imagery(TileImage::solid(1, 1, [5; 4])))
        });
        assert_eq!(applied, requested);
        // Only the root's request is still wanted.
        assert_eq!(m.apply_completions(&mut gpu, &layers).unwrap(), 1);
        assert_eq!(gpu.live_textures(), textures_before + 1);
    }

    #[test]
    fn test_aborted_layer_drops_late_imagery() {
        let (mut m, mut gpu) = manager();
        let manual = Arc::new(ManualProvider::new());
        let mut layer = imagery_layer(1, manual.clone());

        m.render_tree(&camera(0.0, 0.0, 2.0e8), &mut gpu, &[layer.clone()], 1)
            .unwrap();
        assert_eq!(m.abort_layer(LayerId(1)), 1);
        layer.generation += 1;

        manual.complete_all(|_| Ok(TilePayload::Imagery(TileImage::solid(1, 1, [5; 4]))));
        assert_eq!(
            m.apply_completions(&mut gpu, &[layer.clone()]).unwrap(),
            0
        );
        assert_eq!(gpu.live_textures(), 0);

        // Visible again: requested afresh under the new generation.
        m.render_tree(&camera(0.0, 0.0, 2.0e8), &mut gpu, &[layer.clone()], 2)
            .unwrap();
        assert_eq!(manual.requested_count(), 2);
        assert_eq!(manual.requests()[0].kind, TileKind::Imagery(LayerId(1)));
    }

    #[test]
    fn test_generation_mismatch_is_dropped() {
        let (mut m, mut gpu) = manager();
        let manual = Arc::new(ManualProvider::new());
        let layer = imagery_layer(1, manual.clone());
        m.render_tree(&camera(0.0, 0.0, 2.0e8), &mut gpu, &[layer.clone()], 1)
            .unwrap();
        manual.complete_all(|_| Ok(TilePayload::Imagery(TileImage::solid(1, 1, [5; 4]))));

        let bumped = ImageryLayer {
            generation: 7,
            ..layer
        };
        assert_eq!(m.apply_completions(&mut gpu, &[bumped]).unwrap(), 0);
        assert_eq!(gpu.live_textures(), 0);
    }

    #[test]
    fn test_terrain_rebuilds_geometry_and_height_factor_reloads() {
        let (mut m, mut gpu) = manager();
        m.set_terrain_provider(Some(Arc::new(ImmediateProvider::new(|_| {
            Ok(TilePayload::Terrain(TerrainHeights::flat(2, 1000.0)))
        }))));
        let frame = camera(0.0, 0.0, 2.0e8);
        m.render_tree(&frame, &mut gpu, &[], 1).unwrap();
        let id = m.visible_segments()[0];
        assert!(!m.segment(id).unwrap().terrain_ready());

        assert_eq!(m.apply_completions(&mut gpu, &[]).unwrap(), 1);
        m.render_tree(&frame, &mut gpu, &[], 2).unwrap();
        let altitude_of_corner = |m: &QuadTreeManager| {
            let p = m.segment(id).unwrap().geometry().position(0, 2).unwrap();
            Ellipsoid::WGS84.cartesian_to_geodetic(p).2
        };
        assert!(m.segment(id).unwrap().terrain_ready());
        assert!((altitude_of_corner(&m) - 1000.0).abs() < 1e-3);

        assert!(m.set_height_factor(3.0));
        assert!(!m.set_height_factor(3.0));
        m.render_tree(&frame, &mut gpu, &[], 3).unwrap();
        assert!((altitude_of_corner(&m) - 3000.0).abs() < 1e-3);
    }

    #[test]
    fn test_lru_eviction_respects_cap() {
        let (mut m, mut gpu) = manager_with(QuadTreeConfig {
            max_segments: Some(12),
            ..config()
        });
        let near = camera(0.0, 0.0, 5.0e4);
        m.render_tree(&near, &mut gpu, &[], 1).unwrap();
        assert!(m.live_segment_count() > 12);
        assert_eq!(m.evict_lru(&mut gpu, 1), 0, "everything was visited");

        m.render_tree(&near, &mut gpu, &[], 2).unwrap();
        assert_eq!(m.evict_lru(&mut gpu, 2), 0);

        // Nothing is visited while looking away, so everything is evictable.
        let eye = Ellipsoid::WGS84.geodetic_to_cartesian(0.0, 0.0, 2.0e8);
        let away = FrameState::look_at(eye, eye * 2.0, DVec3::Z, 45f64.to_radians(), VIEWPORT);
        m.render_tree(&away, &mut gpu, &[], 3).unwrap();
        let before = m.live_segment_count();
        assert_eq!(m.evict_lru(&mut gpu, 3), before - 12);
        assert_eq!(m.live_segment_count(), 12);

        // Deepest segments go first, so the root keeps its own.
        let root = m.root().unwrap();
        assert!(m.node(root).unwrap().segment().is_some());
        assert_eq!(gpu.live_buffers(), 12 * 3 + 6);
    }

    #[test]
    fn test_eviction_disabled_by_default() {
        let (mut m, mut gpu) = manager();
        m.render_tree(&camera(0.0, 0.0, 5.0e4), &mut gpu, &[], 1)
            .unwrap();
        m.render_tree(&camera(180.0, 0.0, 5.0e4), &mut gpu, &[], 2)
            .unwrap();
        assert_eq!(m.evict_lru(&mut gpu, 2), 0);
    }

    #[test]
    fn test_evicted_segment_recreated_on_visit() {
        let (mut m, mut gpu) = manager_with(QuadTreeConfig {
            max_segments: Some(0),
            ..config()
        });
        let frame = camera(0.0, 0.0, 2.0e8);
        m.render_tree(&frame, &mut gpu, &[], 1).unwrap();
        let old = m.visible_segments()[0];
        assert_eq!(m.evict_lru(&mut gpu, 2), 1);
        assert_eq!(m.live_segment_count(), 0);
        let root = m.root().unwrap();
        assert_eq!(m.node(root).unwrap().state(), NodeState::Unloaded);

        m.render_tree(&frame, &mut gpu, &[], 3).unwrap();
        let new = m.visible_segments()[0];
        assert_ne!(old, new);
        assert_eq!(m.segment_node(new), Some(root));
    }

    #[test]
    fn test_clear_tree_resets_to_root() {
        let (mut m, mut gpu) = manager();
        let layers = [imagery_layer(1, solid_provider())];
        m.render_tree(&camera(0.0, 0.0, 5.0e4), &mut gpu, &layers, 1)
            .unwrap();
        m.apply_completions(&mut gpu, &layers).unwrap();
        assert!(gpu.live_textures() > 0);

        m.clear_tree(&mut gpu);
        assert_eq!(m.node_count(), 1);
        assert_eq!(m.live_segment_count(), 0);
        assert_eq!(gpu.live_textures(), 0);
        assert_eq!(gpu.live_buffers(), 6);
        assert!(m.visible_segments().is_empty());
    }

    #[test]
    fn test_destroy_releases_everything() {
        let (mut m, mut gpu) = manager();
        m.render_tree(&camera(0.0, 0.0, 5.0e4), &mut gpu, &[], 1)
            .unwrap();
        m.destroy(&mut gpu);
        assert_eq!(gpu.live_buffers(), 0);
        assert!(!m.is_initialized());
    }
}

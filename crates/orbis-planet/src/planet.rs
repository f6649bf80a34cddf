//! The globe as a frame-loop renderable: quadtree, layers, color pass and
//! picking pass tied to one ellipsoid.

use std::sync::Arc;

use glam::DVec3;
use orbis_config::{Config, QuadTreeConfig};
use orbis_math::{Ellipsoid, Ray, TileProjection};
use orbis_quadtree::{FrameState, LayerId, QuadTreeManager, SegmentId, TileProvider};
use orbis_render::{FramebufferHandle, GpuContext, TextureHandle, TileImage};

use crate::picking::{PickResult, PickingPass};
use crate::render::RenderPassOrchestrator;
use crate::{Layer, LayerRegistry, PlanetError};

/// Texel drawn where no imagery is loaded.
const EMPTY_TEXEL: [u8; 4] = [128, 128, 128, 255];

const DEFAULT_VIEWPORT: (u32, u32) = (1280, 720);

/// Something the application initializes once and then drives every frame.
pub trait FrameRenderable {
    fn init(&mut self, gpu: &mut dyn GpuContext) -> Result<(), PlanetError>;

    fn frame(
        &mut self,
        gpu: &mut dyn GpuContext,
        frame: &FrameState,
    ) -> Result<FrameStats, PlanetError>;
}

/// Counters from one [`Planet::frame`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameStats {
    pub frame_index: u64,
    pub visited_nodes: usize,
    pub rendered_nodes: usize,
    pub live_segments: usize,
    pub draw_calls: usize,
    pub pick_draw_calls: usize,
    pub completions_applied: usize,
    pub evicted_segments: usize,
    /// Distance from the eye to the surface along the ray toward the centre.
    /// From inside the ellipsoid this is the distance to the far side.
    pub camera_altitude: Option<f64>,
}

/// A tiled globe.
pub struct Planet {
    name: String,
    ellipsoid: Ellipsoid,
    quadtree: QuadTreeManager,
    layers: LayerRegistry,
    orchestrator: RenderPassOrchestrator,
    picking: PickingPass,
    empty_texture: Option<TextureHandle>,
    viewport: (u32, u32),
    frame_index: u64,
    mouse_position_on_earth: Option<DVec3>,
    camera_altitude: Option<f64>,
    last_frame: Option<FrameState>,
    last_visible: Vec<SegmentId>,
}

impl Planet {
    /// A planet whose root tile covers the whole of `projection`.
    pub fn new(
        name: impl Into<String>,
        ellipsoid: Ellipsoid,
        projection: TileProjection,
        quadtree: QuadTreeConfig,
    ) -> Self {
        Self {
            name: name.into(),
            ellipsoid,
            quadtree: QuadTreeManager::new(
                quadtree,
                ellipsoid,
                projection,
                projection.world_extent(),
            ),
            layers: LayerRegistry::new(),
            orchestrator: RenderPassOrchestrator::new(),
            picking: PickingPass::new(),
            empty_texture: None,
            viewport: DEFAULT_VIEWPORT,
            frame_index: 0,
            mouse_position_on_earth: None,
            camera_altitude: None,
            last_frame: None,
            last_visible: Vec::new(),
        }
    }

    /// Build from the `planet`, `quadtree` and `window` sections. Layers are
    /// left to the caller, which owns their providers.
    pub fn from_config(name: impl Into<String>, config: &Config) -> Result<Self, PlanetError> {
        config.quadtree.validate()?;
        let ellipsoid = Ellipsoid::new(
            config.planet.semi_major_axis_m,
            config.planet.semi_minor_axis_m,
        )?;
        let mut planet = Self::new(
            name,
            ellipsoid,
            config.planet.projection,
            config.quadtree.clone(),
        )
        .with_viewport((config.window.width, config.window.height));
        planet.quadtree.set_height_factor(config.planet.height_factor);
        Ok(planet)
    }

    /// Size of the picking framebuffer created by `init`.
    pub fn with_viewport(mut self, viewport: (u32, u32)) -> Self {
        self.viewport = viewport;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ellipsoid(&self) -> &Ellipsoid {
        &self.ellipsoid
    }

    pub fn quadtree(&self) -> &QuadTreeManager {
        &self.quadtree
    }

    pub fn is_initialized(&self) -> bool {
        self.empty_texture.is_some()
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Where the mouse ray met the ellipsoid in the last frame.
    pub fn mouse_position_on_earth(&self) -> Option<DVec3> {
        self.mouse_position_on_earth
    }

    /// Eye-to-surface distance from the last frame; see
    /// [`FrameStats::camera_altitude`].
    pub fn camera_altitude(&self) -> Option<f64> {
        self.camera_altitude
    }

    /// Segments drawn by the last frame, in draw order.
    pub fn last_visible(&self) -> &[SegmentId] {
        &self.last_visible
    }

    pub fn picking_framebuffer(&self) -> Option<FramebufferHandle> {
        self.picking.framebuffer()
    }

    pub fn empty_texture(&self) -> Option<TextureHandle> {
        self.empty_texture
    }

    // --- Layers ---

    pub fn layers(&self) -> &LayerRegistry {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut LayerRegistry {
        &mut self.layers
    }

    pub fn add_layer(&mut self, layer: Layer) -> bool {
        let added = self.layers.add_layer(layer);
        self.cancel_aborted();
        added
    }

    pub fn add_layers(&mut self, layers: impl IntoIterator<Item = Layer>) -> usize {
        let added = self.layers.add_layers(layers);
        self.cancel_aborted();
        added
    }

    pub fn set_base_layer(&mut self, id: LayerId) {
        self.layers.set_base_layer(id);
        self.cancel_aborted();
    }

    pub fn set_layer_visibility(&mut self, id: LayerId, visible: bool) {
        self.layers.set_visibility(id, visible);
        self.cancel_aborted();
    }

    pub fn remove_layer(&mut self, id: LayerId) -> Option<Layer> {
        let removed = self.layers.remove_layer(id);
        self.cancel_aborted();
        removed
    }

    /// Cancel in-flight requests of layers the registry aborted.
    fn cancel_aborted(&mut self) {
        for id in self.layers.take_aborted() {
            self.quadtree.abort_layer(id);
        }
    }

    // --- Terrain ---

    pub fn height_factor(&self) -> f64 {
        self.quadtree.height_factor()
    }

    /// Change the terrain exaggeration; segments rebuild on their next visit.
    pub fn set_height_factor(&mut self, factor: f64) {
        if self.quadtree.set_height_factor(factor) {
            log::info!("Planet '{}' height factor set to {factor}", self.name);
        }
    }

    pub fn set_terrain_provider(&mut self, provider: Option<Arc<dyn TileProvider>>) {
        log::info!(
            "Planet '{}' terrain provider {}",
            self.name,
            if provider.is_some() { "set" } else { "cleared" }
        );
        self.quadtree.set_terrain_provider(provider);
    }

    // --- Picking ---

    /// What is drawn at pixel `(x, y)` of the last frame, or `None` over
    /// the background.
    pub fn pick(
        &self,
        gpu: &mut dyn GpuContext,
        x: u32,
        y: u32,
    ) -> Result<Option<PickResult>, PlanetError> {
        if !self.is_initialized() {
            return Err(PlanetError::NotInitialized(self.name.clone()));
        }
        let Some(segment) = self.picking.read(gpu, x, y)? else {
            return Ok(None);
        };
        let Some(node_handle) = self.quadtree.segment_node(segment) else {
            return Ok(None);
        };
        let Some(node) = self.quadtree.node(node_handle) else {
            return Ok(None);
        };

        let hit = self.last_frame.as_ref().and_then(|frame| {
            let direction = frame.pixel_ray_direction(f64::from(x) + 0.5, f64::from(y) + 0.5);
            self.ellipsoid.hit(&Ray::new(frame.eye, direction))
        });
        let position = hit.unwrap_or(node.bounds().center);

        Ok(Some(PickResult {
            segment,
            node: node_handle,
            depth: node.depth(),
            extent: *node.extent(),
            position,
            geodetic: self.ellipsoid.cartesian_to_geodetic(position),
        }))
    }

    /// Release every GPU resource the planet holds.
    pub fn destroy(&mut self, gpu: &mut dyn GpuContext) {
        self.quadtree.destroy(gpu);
        self.picking.release(gpu);
        if let Some(texture) = self.empty_texture.take() {
            gpu.release_texture(texture);
        }
        self.last_frame = None;
        self.last_visible.clear();
    }
}

impl FrameRenderable for Planet {
    fn init(&mut self, gpu: &mut dyn GpuContext) -> Result<(), PlanetError> {
        if self.is_initialized() {
            return Ok(());
        }
        self.quadtree.init(gpu)?;
        let empty = gpu.create_texture_from_image(&TileImage::solid(1, 1, EMPTY_TEXEL))?;
        self.empty_texture = Some(empty);
        self.picking.ensure_framebuffer(gpu, self.viewport)?;
        self.layers.update_visible_layers();
        self.cancel_aborted();
        log::info!(
            "Planet '{}' initialized: {} layers, {:?} root",
            self.name,
            self.layers.len(),
            self.quadtree.projection()
        );
        Ok(())
    }

    fn frame(
        &mut self,
        gpu: &mut dyn GpuContext,
        frame: &FrameState,
    ) -> Result<FrameStats, PlanetError> {
        let Some(empty) = self.empty_texture else {
            return Err(PlanetError::NotInitialized(self.name.clone()));
        };
        self.frame_index += 1;
        self.cancel_aborted();

        self.mouse_position_on_earth = self.ellipsoid.hit(&frame.mouse_ray());
        self.camera_altitude = self.ellipsoid.altitude(frame.eye);

        let imagery = self.layers.visible_imagery();
        let completions_applied = self.quadtree.apply_completions(gpu, &imagery)?;
        self.quadtree
            .render_tree(frame, gpu, &imagery, self.frame_index)?;

        let visible = self.layers.visible_layers();
        let draw_calls = self
            .orchestrator
            .render(gpu, frame, &self.quadtree, &visible, empty)?;
        let pick_draw_calls = self.picking.render(gpu, frame, &self.quadtree)?;

        let evicted_segments = self.quadtree.evict_lru(gpu, self.frame_index);

        let stats = FrameStats {
            frame_index: self.frame_index,
            visited_nodes: self.quadtree.visited_nodes(),
            rendered_nodes: self.quadtree.rendered_nodes(),
            live_segments: self.quadtree.live_segment_count(),
            draw_calls,
            pick_draw_calls,
            completions_applied,
            evicted_segments,
            camera_altitude: self.camera_altitude,
        };
        self.last_visible.clear();
        self.last_visible
            .extend_from_slice(self.quadtree.visible_segments());
        self.quadtree.clear_visible();
        self.last_frame = Some(frame.clone());
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbis_math::Extent;
    use orbis_quadtree::providers::{ImmediateProvider, ManualProvider};
    use orbis_quadtree::{TilePayload, TileRequest};
    use orbis_render::{GpuError, HeadlessContext, Technique};

    fn planet() -> (Planet, HeadlessContext) {
        let mut gpu = HeadlessContext::new();
        let mut planet = Planet::new(
            "earth",
            Ellipsoid::WGS84,
            TileProjection::Geographic,
            QuadTreeConfig {
                grid_size: 4,
                ..QuadTreeConfig::default()
            },
        )
        .with_viewport((640, 360));
        planet.init(&mut gpu).unwrap();
        (planet, gpu)
    }

    fn camera(altitude: f64) -> FrameState {
        let eye = Ellipsoid::WGS84.geodetic_to_cartesian(0.0, 0.0, altitude);
        FrameState::look_at(eye, DVec3::ZERO, DVec3::Z, 45f64.to_radians(), (640, 360))
    }

    fn solid(request: &TileRequest) -> Result<TilePayload, orbis_quadtree::TileError> {
        let shade = request.depth.saturating_mul(10);
        Ok(TilePayload::Imagery(TileImage::solid(2, 2, [shade, 0, 0, 255])))
    }

    #[test]
    fn test_frame_before_init_fails() {
        let mut gpu = HeadlessContext::new();
        let mut planet = Planet::new(
            "earth",
            Ellipsoid::WGS84,
            TileProjection::Geographic,
            QuadTreeConfig::default(),
        );
        let err = planet.frame(&mut gpu, &camera(1.0e7)).unwrap_err();
        assert_eq!(err, PlanetError::NotInitialized("earth".to_string()));
        assert!(matches!(
            planet.pick(&mut gpu, 0, 0),
            Err(PlanetError::NotInitialized(_))
        ));
    }

    #[test]
    fn test_init_creates_empty_texture_and_picking_target() {
        let (planet, gpu) = planet();
        assert_eq!(gpu.live_textures(), 1);
        assert_eq!(gpu.live_framebuffers(), 1);
        assert!(planet.is_initialized());
        assert!(planet.picking_framebuffer().is_some());
    }

    #[test]
    fn test_frame_reports_altitude_and_mouse_hit() {
        let (mut planet, mut gpu) = planet();
        let stats = planet.frame(&mut gpu, &camera(1.0e7)).unwrap();
        let altitude = stats.camera_altitude.unwrap();
        assert!((altitude - 1.0e7).abs() < 1.0);
        assert_eq!(planet.camera_altitude(), Some(altitude));

        let hit = planet.mouse_position_on_earth().unwrap();
        assert!((hit - DVec3::new(Ellipsoid::WGS84.a(), 0.0, 0.0)).length() < 1e-3);
        assert_eq!(stats.frame_index, 1);
        assert!(planet.quadtree().visible_segments().is_empty());
    }

    #[test]
    fn test_frame_draws_color_and_picking_passes() {
        let (mut planet, mut gpu) = planet();
        let stats = planet.frame(&mut gpu, &camera(2.0e8)).unwrap();
        assert_eq!(stats.rendered_nodes, 1);
        assert_eq!(stats.draw_calls, 1);
        assert_eq!(stats.pick_draw_calls, 1);
        assert_eq!(gpu.draws_with(Technique::Single), 1);
        assert_eq!(gpu.draws_with(Technique::Picking), 1);
    }

    #[test]
    fn test_two_layers_draw_overlays() {
        let (mut planet, mut gpu) = planet();
        planet.add_layers([
            Layer::new(LayerId(1), "base", Arc::new(ImmediateProvider::new(solid))).with_base(true),
            Layer::new(LayerId(2), "top", Arc::new(ImmediateProvider::new(solid)))
                .with_opacity(0.5),
        ]);
        planet.frame(&mut gpu, &camera(2.0e8)).unwrap();
        let stats = planet.frame(&mut gpu, &camera(2.0e8)).unwrap();
        assert_eq!(stats.completions_applied, 2);
        assert!(gpu.draws_with(Technique::Overlays) >= 2);
    }

    #[test]
    fn test_switching_base_cancels_pending_loads() {
        let (mut planet, mut gpu) = planet();
        let first = Arc::new(ManualProvider::new());
        let second = Arc::new(ManualProvider::new());
        planet.add_layers([
            Layer::new(LayerId(1), "a", first.clone()).with_base(true),
            Layer::new(LayerId(2), "b", second.clone())
                .with_base(true)
                .with_visibility(false),
        ]);
        planet.frame(&mut gpu, &camera(2.0e8)).unwrap();
        assert_eq!(first.requested_count(), 1);
        assert_eq!(planet.quadtree().pending_requests(), 1);

        planet.set_base_layer(LayerId(2));
        assert_eq!(first.cancelled().len(), 1);
        assert_eq!(planet.quadtree().pending_requests(), 0);

        // A late answer from the old base is ignored.
        first.complete_all(|_| Ok(TilePayload::Imagery(TileImage::solid(1, 1, [1; 4]))));
        let stats = planet.frame(&mut gpu, &camera(2.0e8)).unwrap();
        assert_eq!(stats.completions_applied, 0);
        assert_eq!(second.requested_count(), 1);
        let root = planet.quadtree().root().unwrap();
        let segment = planet.quadtree().node(root).unwrap().segment().unwrap();
        assert!(!segment.imagery_ready(LayerId(1)));
    }

    #[test]
    fn test_pick_resolves_segment_and_surface_point() {
        let (mut planet, mut gpu) = planet();
        let frame = camera(5.0e7);
        planet.frame(&mut gpu, &frame).unwrap();
        let root = planet.quadtree().root().unwrap();
        let id = planet
            .quadtree()
            .node(root)
            .unwrap()
            .segment()
            .unwrap()
            .id();

        let fb = planet.picking_framebuffer().unwrap();
        gpu.set_pixel(fb, 320, 180, crate::encode_pick_color(id));
        let result = planet.pick(&mut gpu, 320, 180).unwrap().unwrap();
        assert_eq!(result.segment, id);
        assert_eq!(result.node, root);
        assert!(Ellipsoid::WGS84.altitude(result.position).unwrap().abs() < 1.0);

        // The ray goes through the pixel centre, about half a degree off nadir
        // at this altitude.
        let expected = Ellipsoid::WGS84
            .hit(&Ray::new(frame.eye, frame.pixel_ray_direction(320.5, 180.5)))
            .unwrap();
        assert!((result.position - expected).length() < 1e-3);
        assert!(result.geodetic.0.abs() < 1.0);
        assert!(result.geodetic.1.abs() < 1.0);

        assert_eq!(planet.pick(&mut gpu, 0, 0).unwrap(), None);
    }

    #[test]
    fn test_height_factor_marks_geometry_for_rebuild() {
        let (mut planet, mut gpu) = planet();
        planet.set_terrain_provider(Some(Arc::new(ImmediateProvider::new(|_| {
            Ok(TilePayload::Terrain(orbis_quadtree::TerrainHeights::flat(
                2, 100.0,
            )))
        }))));
        planet.frame(&mut gpu, &camera(2.0e8)).unwrap();
        planet.frame(&mut gpu, &camera(2.0e8)).unwrap();
        planet.frame(&mut gpu, &camera(2.0e8)).unwrap();
        let root = planet.quadtree().root().unwrap();
        let r0 = planet.quadtree().node(root).unwrap().segment().unwrap().geometry().positions[0]
            .length();

        planet.set_height_factor(10.0);
        assert_eq!(planet.height_factor(), 10.0);
        planet.frame(&mut gpu, &camera(2.0e8)).unwrap();
        let r1 = planet.quadtree().node(root).unwrap().segment().unwrap().geometry().positions[0]
            .length();
        assert!((r1 - r0 - 900.0).abs() < 1.0);
    }

    #[test]
    fn test_destroy_releases_gpu_resources() {
        let (mut planet, mut gpu) = planet();
        planet.frame(&mut gpu, &camera(5.0e4)).unwrap();
        planet.destroy(&mut gpu);
        assert_eq!(gpu.live_buffers(), 0);
        assert_eq!(gpu.live_textures(), 0);
        assert_eq!(gpu.live_framebuffers(), 0);
        assert!(!planet.is_initialized());
    }

    #[test]
    fn test_gpu_failure_propagates() {
        let (mut planet, mut gpu) = planet();
        planet.add_layer(Layer::new(
            LayerId(1),
            "base",
            Arc::new(ImmediateProvider::new(solid)),
        ));
        gpu.fail_textures_after(0);
        planet.frame(&mut gpu, &camera(2.0e8)).unwrap();
        let err = planet.frame(&mut gpu, &camera(2.0e8)).unwrap_err();
        assert!(matches!(err, PlanetError::Gpu(GpuError::TextureCreation(_))));
    }

    #[test]
    fn test_from_config_uses_sections() {
        let mut config = Config::default();
        config.window.width = 800;
        config.window.height = 600;
        config.planet.height_factor = 2.0;
        let mut planet = Planet::from_config("earth", &config).unwrap();
        assert_eq!(planet.height_factor(), 2.0);
        assert_eq!(
            *planet.quadtree().root_extent(),
            Extent::web_mercator_world()
        );
        let mut gpu = HeadlessContext::new();
        planet.init(&mut gpu).unwrap();
        assert_eq!(planet.picking.size(), (800, 600));

        config.planet.semi_minor_axis_m = -1.0;
        assert!(matches!(
            Planet::from_config("bad", &config),
            Err(PlanetError::Math(_))
        ));
    }

    #[test]
    fn test_from_config_rejects_grid_without_index_buffer() {
        let mut config = Config::default();
        config.quadtree.grid_size = 12;
        match Planet::from_config("earth", &config) {
            Err(PlanetError::InvalidConfig { field, .. }) => {
                assert_eq!(field, "quadtree.grid_size")
            }
            other => panic!("expected an invalid grid size, got {:?}", other.err()),
        }
    }
}

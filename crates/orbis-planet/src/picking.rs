//! Off-screen identity-color pass for resolving what is under a pixel.

use glam::DVec3;
use orbis_math::Extent;
use orbis_quadtree::{FrameState, NodeHandle, QuadTreeManager, SegmentId};
use orbis_render::{
    FramebufferHandle, GpuContext, GpuError, Primitive, Technique, UniformValue, uniforms,
};

use crate::render::upload_camera;

/// Picking color of a segment: its id in 24-bit RGB, alpha 255. The
/// quadtree never hands out ids above [`SegmentId::MAX`].
pub fn encode_pick_color(id: SegmentId) -> [u8; 4] {
    let [_, r, g, b] = id.get().to_be_bytes();
    [r, g, b, 255]
}

/// Segment id encoded in `rgba`; `None` for the cleared background.
pub fn decode_pick_color(rgba: [u8; 4]) -> Option<SegmentId> {
    if rgba[3] == 0 {
        return None;
    }
    SegmentId::new(u32::from_be_bytes([0, rgba[0], rgba[1], rgba[2]]))
}

fn pick_color_uniform(id: SegmentId) -> UniformValue {
    UniformValue::Vec4(encode_pick_color(id).map(|c| f32::from(c) / 255.0))
}

/// What [`Planet::pick`](crate::Planet::pick) found under a pixel.
#[derive(Clone, Debug, PartialEq)]
pub struct PickResult {
    pub segment: SegmentId,
    pub node: NodeHandle,
    pub depth: u8,
    /// Node extent in the tiling projection.
    pub extent: Extent,
    /// World position under the pixel.
    pub position: DVec3,
    /// `(longitude°, latitude°, height)` of `position`.
    pub geodetic: (f64, f64, f64),
}

/// Owns the picking framebuffer and redraws it every frame.
#[derive(Debug, Default)]
pub struct PickingPass {
    framebuffer: Option<FramebufferHandle>,
    size: (u32, u32),
}

impl PickingPass {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn framebuffer(&self) -> Option<FramebufferHandle> {
        self.framebuffer
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    /// Make sure the framebuffer matches `viewport`, recreating it on resize.
    pub fn ensure_framebuffer(
        &mut self,
        gpu: &mut dyn GpuContext,
        viewport: (u32, u32),
    ) -> Result<FramebufferHandle, GpuError> {
        let viewport = (viewport.0.max(1), viewport.1.max(1));
        if let Some(fb) = self.framebuffer {
            if self.size == viewport {
                return Ok(fb);
            }
            gpu.release_framebuffer(fb);
            self.framebuffer = None;
            log::debug!(
                "Picking framebuffer resized {}x{} -> {}x{}",
                self.size.0,
                self.size.1,
                viewport.0,
                viewport.1
            );
        }
        let fb = gpu.create_framebuffer(viewport.0, viewport.1)?;
        self.framebuffer = Some(fb);
        self.size = viewport;
        Ok(fb)
    }

    /// Draw every visible segment in its identity color. Returns the number
    /// of draw calls.
    pub fn render(
        &mut self,
        gpu: &mut dyn GpuContext,
        frame: &FrameState,
        quadtree: &QuadTreeManager,
    ) -> Result<usize, GpuError> {
        let fb = self.ensure_framebuffer(gpu, frame.viewport)?;
        gpu.activate_framebuffer(fb)?;
        let drawn = Self::draw_segments(gpu, frame, quadtree);
        gpu.deactivate_framebuffer();
        drawn
    }

    fn draw_segments(
        gpu: &mut dyn GpuContext,
        frame: &FrameState,
        quadtree: &QuadTreeManager,
    ) -> Result<usize, GpuError> {
        gpu.clear_framebuffer([0.0; 4])?;
        gpu.activate_program(Technique::Picking)?;
        upload_camera(gpu, frame)?;

        let mut draws = 0;
        for id in quadtree.visible_segments() {
            let Some(segment) = quadtree.segment(*id) else {
                continue;
            };
            let Some(indices) = quadtree.index_buffer(segment.index_key()) else {
                continue;
            };
            gpu.set_uniform(uniforms::PICK_COLOR, pick_color_uniform(*id))?;
            gpu.bind_vertex_buffers(&segment.buffers().as_array())?;
            gpu.draw_indexed(Primitive::Triangles, indices.handle, 0..indices.count)?;
            draws += 1;
        }
        Ok(draws)
    }

    /// Segment drawn at pixel `(x, y)` in the last pass. Pixels outside the
    /// framebuffer read as nothing.
    pub fn read(
        &self,
        gpu: &mut dyn GpuContext,
        x: u32,
        y: u32,
    ) -> Result<Option<SegmentId>, GpuError> {
        let Some(fb) = self.framebuffer else {
            return Ok(None);
        };
        if x >= self.size.0 || y >= self.size.1 {
            return Ok(None);
        }
        Ok(decode_pick_color(gpu.read_pixel(fb, x, y)?))
    }

    pub fn release(&mut self, gpu: &mut dyn GpuContext) {
        if let Some(fb) = self.framebuffer.take() {
            gpu.release_framebuffer(fb);
        }
        self.size = (0, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbis_config::QuadTreeConfig;
    use orbis_math::{Ellipsoid, TileProjection};
    use orbis_render::{GpuCommand, HeadlessContext};

    #[test]
    fn test_pick_color_round_trip() {
        for raw in [1, 255, 256, 65_535, 65_536, 0x00AB_CDEF, SegmentId::MAX] {
            let id = SegmentId::new(raw).unwrap();
            assert_eq!(decode_pick_color(encode_pick_color(id)), Some(id));
        }
    }

    #[test]
    fn test_pick_color_layout() {
        let id = SegmentId::new(0x0012_3456).unwrap();
        assert_eq!(encode_pick_color(id), [0x12, 0x34, 0x56, 255]);
    }

    #[test]
    fn test_background_decodes_to_none() {
        assert_eq!(decode_pick_color([0, 0, 0, 0]), None);
        assert_eq!(decode_pick_color([0, 0, 0, 255]), None);
        assert_eq!(decode_pick_color([9, 9, 9, 0]), None);
    }

    #[test]
    fn test_framebuffer_recreated_on_resize() {
        let mut gpu = HeadlessContext::new();
        let mut pass = PickingPass::new();
        let a = pass.ensure_framebuffer(&mut gpu, (640, 480)).unwrap();
        let same = pass.ensure_framebuffer(&mut gpu, (640, 480)).unwrap();
        assert_eq!(a, same);
        assert_eq!(gpu.live_framebuffers(), 1);

        let b = pass.ensure_framebuffer(&mut gpu, (800, 600)).unwrap();
        assert_ne!(a, b);
        assert_eq!(gpu.live_framebuffers(), 1);
        assert_eq!(pass.size(), (800, 600));

        pass.release(&mut gpu);
        assert_eq!(gpu.live_framebuffers(), 0);
    }

    #[test]
    fn test_pass_draws_identity_colors_off_screen() {
        let mut gpu = HeadlessContext::new();
        let mut quadtree = QuadTreeManager::new(
            QuadTreeConfig {
                grid_size: 2,
                ..QuadTreeConfig::default()
            },
            Ellipsoid::WGS84,
            TileProjection::Geographic,
            Extent::geographic_world(),
        );
        quadtree.init(&mut gpu).unwrap();
        let eye = Ellipsoid::WGS84.geodetic_to_cartesian(0.0, 0.0, 2.0e8);
        let frame =
            FrameState::look_at(eye, DVec3::ZERO, DVec3::Z, 45f64.to_radians(), (320, 240));
        quadtree.render_tree(&frame, &mut gpu, &[], 1).unwrap();
        gpu.clear_commands();

        let mut pass = PickingPass::new();
        let draws = pass.render(&mut gpu, &frame, &quadtree).unwrap();
        assert_eq!(draws, 1);
        assert_eq!(gpu.draws_with(Technique::Picking), 1);

        let id = quadtree.visible_segments()[0];
        let color = gpu.commands().iter().find_map(|c| match c {
            GpuCommand::SetUniform {
                name: uniforms::PICK_COLOR,
                value,
            } => Some(*value),
            _ => None,
        });
        assert_eq!(color, Some(pick_color_uniform(id)));
        assert_eq!(gpu.commands().last(), Some(&GpuCommand::DeactivateFramebuffer));

        let fb = pass.framebuffer().unwrap();
        gpu.set_pixel(fb, 10, 20, encode_pick_color(id));
        assert_eq!(pass.read(&mut gpu, 10, 20).unwrap(), Some(id));
        assert_eq!(pass.read(&mut gpu, 11, 20).unwrap(), None);
        assert_eq!(pass.read(&mut gpu, 320, 0).unwrap(), None);
    }
}

//! Draws the visible segments of one traversal with the planet's layers.

use orbis_quadtree::{FrameState, QuadTreeManager};
use orbis_render::{
    GpuContext, GpuError, LayerTints, MAX_OVERLAYS, Primitive, Technique, TextureHandle,
    TextureSlot, UniformValue, uniforms,
};

use crate::Layer;

/// Upload the camera uniforms shared by every technique.
pub(crate) fn upload_camera(gpu: &mut dyn GpuContext, frame: &FrameState) -> Result<(), GpuError> {
    gpu.set_uniform(
        uniforms::VIEW_PROJECTION_RTE,
        UniformValue::Mat4(frame.view_projection_rte().to_cols_array_2d()),
    )?;
    gpu.set_uniform(
        uniforms::EYE_HIGH,
        UniformValue::Vec3(frame.eye_high_low.high.to_array()),
    )?;
    gpu.set_uniform(
        uniforms::EYE_LOW,
        UniformValue::Vec3(frame.eye_high_low.low.to_array()),
    )
}

/// Per-frame color pass over the visible list.
#[derive(Debug, Default)]
pub struct RenderPassOrchestrator {
    last_technique: Option<Technique>,
    last_draw_calls: usize,
    warned_overflow: bool,
}

impl RenderPassOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Technique used by the last [`render`](Self::render).
    pub fn last_technique(&self) -> Option<Technique> {
        self.last_technique
    }

    pub fn last_draw_calls(&self) -> usize {
        self.last_draw_calls
    }

    /// Draw every visible segment. `layers` are the visible layers in draw
    /// order; slots without a texture sample `empty`. Returns the number of
    /// draw calls.
    pub fn render(
        &mut self,
        gpu: &mut dyn GpuContext,
        frame: &FrameState,
        quadtree: &QuadTreeManager,
        layers: &[&Layer],
        empty: TextureHandle,
    ) -> Result<usize, GpuError> {
        let technique = if layers.len() > 1 {
            Technique::Overlays
        } else {
            Technique::Single
        };
        gpu.activate_program(technique)?;
        upload_camera(gpu, frame)?;

        let layers = if layers.len() > MAX_OVERLAYS {
            if !self.warned_overflow {
                log::warn!(
                    "{} visible layers, only the first {MAX_OVERLAYS} are drawn",
                    layers.len()
                );
                self.warned_overflow = true;
            }
            &layers[..MAX_OVERLAYS]
        } else {
            layers
        };

        if technique == Technique::Overlays {
            let mut tints = LayerTints {
                count: layers.len() as u32,
                ..LayerTints::default()
            };
            for (slot, layer) in tints.tints.iter_mut().zip(layers) {
                *slot = layer.tint_with_opacity();
            }
            gpu.set_uniform(uniforms::LAYER_TINTS, UniformValue::LayerTints(tints))?;
        }

        let mut slots: Vec<TextureSlot> = Vec::with_capacity(layers.len().max(1));
        let mut draws = 0;
        for id in quadtree.visible_segments() {
            let Some(segment) = quadtree.segment(*id) else {
                continue;
            };
            let Some(indices) = quadtree.index_buffer(segment.index_key()) else {
                continue;
            };

            slots.clear();
            slots.extend(layers.iter().map(|layer| {
                segment
                    .binding(layer.id())
                    .map(|binding| binding.slot())
                    .unwrap_or_else(|| TextureSlot::identity(empty))
            }));
            if slots.is_empty() {
                slots.push(TextureSlot::identity(empty));
            }

            gpu.bind_vertex_buffers(&segment.buffers().as_array())?;
            gpu.bind_textures(&slots)?;
            gpu.draw_indexed(Primitive::Triangles, indices.handle, 0..indices.count)?;
            draws += 1;
        }

        self.last_technique = Some(technique);
        self.last_draw_calls = draws;
        Ok(draws)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use glam::DVec3;
    use orbis_config::QuadTreeConfig;
    use orbis_math::{Ellipsoid, Extent, TileProjection};
    use orbis_quadtree::providers::ImmediateProvider;
    use orbis_quadtree::{LayerId, TilePayload, TileProvider};
    use orbis_render::{GpuCommand, HeadlessContext, TileImage};

    fn provider() -> Arc<dyn TileProvider> {
        Arc::new(ImmediateProvider::new(|_| {
            Ok(TilePayload::Imagery(TileImage::solid(2, 2, [200, 100, 50, 255])))
        }))
    }

    fn camera(altitude: f64) -> FrameState {
        let eye = Ellipsoid::WGS84.geodetic_to_cartesian(10.0, 20.0, altitude);
        FrameState::look_at(eye, DVec3::ZERO, DVec3::Z, 45f64.to_radians(), (1280, 720))
    }

    struct Scene {
        gpu: HeadlessContext,
        quadtree: QuadTreeManager,
        empty: TextureHandle,
    }

    fn scene(layers: &[&Layer], altitude: f64) -> Scene {
        let mut gpu = HeadlessContext::new();
        let mut quadtree = QuadTreeManager::new(
            QuadTreeConfig {
                grid_size: 4,
                ..QuadTreeConfig::default()
            },
            Ellipsoid::WGS84,
            TileProjection::Geographic,
            Extent::geographic_world(),
        );
        quadtree.init(&mut gpu).unwrap();
        let empty = gpu
            .create_texture_from_image(&TileImage::solid(1, 1, [128, 128, 128, 255]))
            .unwrap();
        let imagery: Vec<_> = layers.iter().map(|l| l.imagery_layer()).collect();
        let frame = camera(altitude);
        for i in 1..=3 {
            quadtree.apply_completions(&mut gpu, &imagery).unwrap();
            quadtree
                .render_tree(&frame, &mut gpu, &imagery, i)
                .unwrap();
        }
        gpu.clear_commands();
        Scene {
            gpu,
            quadtree,
            empty,
        }
    }

    #[test]
    fn test_single_layer_uses_single_technique() {
        let layer = Layer::new(LayerId(1), "base", provider());
        let mut s = scene(&[&layer], 5.0e4);
        let mut pass = RenderPassOrchestrator::new();
        let draws = pass
            .render(&mut s.gpu, &camera(5.0e4), &s.quadtree, &[&layer], s.empty)
            .unwrap();

        assert_eq!(pass.last_technique(), Some(Technique::Single));
        assert_eq!(draws, s.quadtree.visible_segments().len());
        assert_eq!(s.gpu.draws_with(Technique::Single), draws);
        assert!(draws > 1);
    }

    #[test]
    fn test_every_visible_segment_drawn_once() {
        let layer = Layer::new(LayerId(1), "base", provider());
        let mut s = scene(&[&layer], 2.0e8);
        assert_eq!(s.quadtree.visible_segments().len(), 1);
        let mut pass = RenderPassOrchestrator::new();
        let draws = pass
            .render(&mut s.gpu, &camera(2.0e8), &s.quadtree, &[&layer], s.empty)
            .unwrap();
        assert_eq!(draws, 1);
        assert_eq!(s.gpu.draw_count(), 1);
    }

    #[test]
    fn test_overlays_upload_tints_once() {
        let a = Layer::new(LayerId(1), "a", provider()).with_tint([1.0, 0.0, 0.0]);
        let b = Layer::new(LayerId(2), "b", provider()).with_opacity(0.5);
        let mut s = scene(&[&a, &b], 5.0e4);
        let mut pass = RenderPassOrchestrator::new();
        let draws = pass
            .render(&mut s.gpu, &camera(5.0e4), &s.quadtree, &[&a, &b], s.empty)
            .unwrap();

        assert_eq!(pass.last_technique(), Some(Technique::Overlays));
        assert_eq!(s.gpu.draws_with(Technique::Overlays), draws);

        let tint_uploads: Vec<&LayerTints> = s
            .gpu
            .commands()
            .iter()
            .filter_map(|c| match c {
                GpuCommand::SetUniform {
                    value: UniformValue::LayerTints(t),
                    ..
                } => Some(t),
                _ => None,
            })
            .collect();
        assert_eq!(tint_uploads.len(), 1);
        assert_eq!(tint_uploads[0].count, 2);
        assert_eq!(tint_uploads[0].tints[0], [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(tint_uploads[0].tints[1], [1.0, 1.0, 1.0, 0.5]);

        // Two slots per draw, in layer order.
        for command in s.gpu.commands() {
            if let GpuCommand::BindTextures(slots) = command {
                assert_eq!(slots.len(), 2);
            }
        }
    }

    #[test]
    fn test_camera_uniforms_uploaded_once_per_activation() {
        let layer = Layer::new(LayerId(1), "base", provider());
        let mut s = scene(&[&layer], 5.0e4);
        let mut pass = RenderPassOrchestrator::new();
        pass.render(&mut s.gpu, &camera(5.0e4), &s.quadtree, &[&layer], s.empty)
            .unwrap();
        let matrix_uploads = s
            .gpu
            .commands()
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    GpuCommand::SetUniform {
                        name: uniforms::VIEW_PROJECTION_RTE,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(matrix_uploads, 1);
    }

    #[test]
    fn test_missing_imagery_binds_empty_texture() {
        let mut s = scene(&[], 2.0e8);
        let mut pass = RenderPassOrchestrator::new();
        pass.render(&mut s.gpu, &camera(2.0e8), &s.quadtree, &[], s.empty)
            .unwrap();
        let bound: Vec<&Vec<TextureSlot>> = s
            .gpu
            .commands()
            .iter()
            .filter_map(|c| match c {
                GpuCommand::BindTextures(slots) => Some(slots),
                _ => None,
            })
            .collect();
        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0], &vec![TextureSlot::identity(s.empty)]);
        assert_eq!(pass.last_technique(), Some(Technique::Single));
    }
}

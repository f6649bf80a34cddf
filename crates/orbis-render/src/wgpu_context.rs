//! [`GpuContext`] on top of wgpu.
//!
//! Calls are recorded into passes during the frame: each draw captures a
//! snapshot of the uniform block and clones of the buffers and texture views
//! it uses. [`end_frame`](GpuContext::end_frame) packs all snapshots into one
//! dynamic-offset uniform buffer, encodes the passes, submits and presents.
//! Off-screen passes are flushed early when a pixel is read back.

use std::num::NonZeroU64;
use std::ops::Range;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use rustc_hash::FxHashMap;
use wgpu::util::DeviceExt;
use winit::window::Window;

use crate::gpu::{
    DEPTH_FORMAT, RenderContext, RenderContextError, create_depth_view,
    init_render_context_blocking,
};
use crate::{
    BufferHandle, FramebufferHandle, GpuContext, GpuError, MAX_OVERLAYS, Primitive, Technique,
    TextureHandle, TextureSlot, TileImage, UniformValue, shaders, uniforms,
};

/// Color format of off-screen framebuffers; linear so pick colors survive
/// unchanged.
const FRAMEBUFFER_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

const IMAGE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;

/// Clear color of the window when nothing else was requested.
const SPACE_BLACK: wgpu::Color = wgpu::Color {
    r: 0.01,
    g: 0.01,
    b: 0.03,
    a: 1.0,
};

/// Mirror of the WGSL `Globals` block.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct GlobalsUniform {
    view_projection_rte: [[f32; 4]; 4],
    eye_high: [f32; 4],
    eye_low: [f32; 4],
    pick_color: [f32; 4],
    layer_count: [u32; 4],
    tints: [[f32; 4]; MAX_OVERLAYS],
    biases: [[f32; 4]; MAX_OVERLAYS],
}

impl Default for GlobalsUniform {
    fn default() -> Self {
        Self {
            view_projection_rte: glam::Mat4::IDENTITY.to_cols_array_2d(),
            eye_high: [0.0; 4],
            eye_low: [0.0; 4],
            pick_color: [0.0; 4],
            layer_count: [0; 4],
            tints: [[1.0; 4]; MAX_OVERLAYS],
            biases: [[0.0, 0.0, 1.0, 0.0]; MAX_OVERLAYS],
        }
    }
}

const GLOBALS_SIZE: u64 = std::mem::size_of::<GlobalsUniform>() as u64;

struct GpuTexture {
    view: wgpu::TextureView,
}

struct Framebuffer {
    color: wgpu::Texture,
    color_view: wgpu::TextureView,
    depth_view: wgpu::TextureView,
    width: u32,
    height: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct PipelineKey {
    technique: Technique,
    primitive: Primitive,
    format: wgpu::TextureFormat,
}

enum DrawKind {
    Arrays(Range<u32>),
    Indexed(wgpu::Buffer, Range<u32>),
}

struct RecordedDraw {
    key: PipelineKey,
    globals: GlobalsUniform,
    vertex_buffers: Vec<wgpu::Buffer>,
    textures: Vec<wgpu::TextureView>,
    kind: DrawKind,
}

struct RecordedPass {
    target: Option<FramebufferHandle>,
    clear: Option<[f32; 4]>,
    draws: Vec<RecordedDraw>,
}

/// wgpu-backed GPU context drawing into a window surface.
pub struct WgpuContext {
    ctx: RenderContext,
    surface_depth: wgpu::TextureView,
    globe_shader: wgpu::ShaderModule,
    picking_shader: wgpu::ShaderModule,
    globals_layout: wgpu::BindGroupLayout,
    imagery_layout: wgpu::BindGroupLayout,
    globe_pipeline_layout: wgpu::PipelineLayout,
    picking_pipeline_layout: wgpu::PipelineLayout,
    pipelines: FxHashMap<PipelineKey, wgpu::RenderPipeline>,
    sampler: wgpu::Sampler,
    fallback_view: wgpu::TextureView,
    uniform_buffer: wgpu::Buffer,
    uniform_slots: u64,
    uniform_stride: u64,

    buffers: FxHashMap<BufferHandle, wgpu::Buffer>,
    textures: FxHashMap<TextureHandle, GpuTexture>,
    framebuffers: FxHashMap<FramebufferHandle, Framebuffer>,
    next_id: u32,

    program: Option<Technique>,
    globals: GlobalsUniform,
    vertex_buffers: Vec<wgpu::Buffer>,
    bound_textures: Vec<wgpu::TextureView>,
    target: Option<FramebufferHandle>,
    passes: Vec<RecordedPass>,
}

impl WgpuContext {
    /// Bring up the GPU for `window` and build the globe programs.
    pub fn new(window: Arc<Window>, vsync: bool) -> Result<Self, RenderContextError> {
        let ctx = init_render_context_blocking(window, vsync)?;
        Ok(Self::from_render_context(ctx))
    }

    pub fn from_render_context(ctx: RenderContext) -> Self {
        let device = &ctx.device;

        let globe_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("globe-shader"),
            source: wgpu::ShaderSource::Wgsl(shaders::globe_shader_source().into()),
        });
        let picking_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("picking-shader"),
            source: wgpu::ShaderSource::Wgsl(shaders::picking_shader_source().into()),
        });

        let globals_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("globals-bind-group-layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: NonZeroU64::new(GLOBALS_SIZE),
                },
                count: None,
            }],
        });

        let mut imagery_entries = vec![wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        }];
        for slot in 0..MAX_OVERLAYS as u32 {
            imagery_entries.push(wgpu::BindGroupLayoutEntry {
                binding: slot + 1,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            });
        }
        let imagery_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("imagery-bind-group-layout"),
            entries: &imagery_entries,
        });

        let globe_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("globe-pipeline-layout"),
            bind_group_layouts: &[&globals_layout, &imagery_layout],
            immediate_size: 0,
        });
        let picking_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("picking-pipeline-layout"),
                bind_group_layouts: &[&globals_layout],
                immediate_size: 0,
            });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("imagery-sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::MipmapFilterMode::Linear,
            ..Default::default()
        });

        let fallback = upload_texture(
            &ctx.device,
            &ctx.queue,
            &TileImage::solid(1, 1, [255, 255, 255, 0]),
            "fallback-texture",
        );

        let uniform_stride = align_up(
            GLOBALS_SIZE,
            u64::from(device.limits().min_uniform_buffer_offset_alignment),
        );
        let uniform_slots = 64;
        let uniform_buffer = create_uniform_buffer(device, uniform_stride * uniform_slots);

        let surface_depth = ctx.create_depth_view();

        Self {
            surface_depth,
            globe_shader,
            picking_shader,
            globals_layout,
            imagery_layout,
            globe_pipeline_layout,
            picking_pipeline_layout,
            pipelines: FxHashMap::default(),
            sampler,
            fallback_view: fallback.view,
            uniform_buffer,
            uniform_slots,
            uniform_stride,
            buffers: FxHashMap::default(),
            textures: FxHashMap::default(),
            framebuffers: FxHashMap::default(),
            next_id: 0,
            program: None,
            globals: GlobalsUniform::default(),
            vertex_buffers: Vec::new(),
            bound_textures: Vec::new(),
            target: None,
            passes: Vec::new(),
            ctx,
        }
    }

    /// Reconfigure the surface and its depth buffer.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.ctx.resize(width, height);
        self.surface_depth = self.ctx.create_depth_view();
    }

    /// Surface size in physical pixels.
    pub fn surface_size(&self) -> (u32, u32) {
        (
            self.ctx.surface_config.width,
            self.ctx.surface_config.height,
        )
    }

    pub fn render_context(&self) -> &RenderContext {
        &self.ctx
    }

    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn target_format(&self, target: Option<FramebufferHandle>) -> wgpu::TextureFormat {
        match target {
            Some(_) => FRAMEBUFFER_FORMAT,
            None => self.ctx.surface_format,
        }
    }

    fn current_pass(&mut self) -> &mut RecordedPass {
        let target = self.target;
        let reuse = self.passes.last().is_some_and(|p| p.target == target);
        if !reuse {
            self.passes.push(RecordedPass {
                target,
                clear: None,
                draws: Vec::new(),
            });
        }
        let last = self.passes.len() - 1;
        &mut self.passes[last]
    }

    fn record_draw(&mut self, primitive: Primitive, kind: DrawKind) -> Result<(), GpuError> {
        let technique = self.program.ok_or(GpuError::NoActiveProgram)?;
        let key = PipelineKey {
            technique,
            primitive,
            format: self.target_format(self.target),
        };
        let textures = if technique == Technique::Picking {
            Vec::new()
        } else {
            self.bound_textures.clone()
        };
        let draw = RecordedDraw {
            key,
            globals: self.globals,
            vertex_buffers: self.vertex_buffers.clone(),
            textures,
            kind,
        };
        self.current_pass().draws.push(draw);
        Ok(())
    }

    fn ensure_pipeline(&mut self, key: PipelineKey) {
        if self.pipelines.contains_key(&key) {
            return;
        }
        let pipeline = self.create_pipeline(key);
        self.pipelines.insert(key, pipeline);
    }

    fn create_pipeline(&self, key: PipelineKey) -> wgpu::RenderPipeline {
        let (module, layout, fs_entry, label) = match key.technique {
            Technique::Single => (
                &self.globe_shader,
                &self.globe_pipeline_layout,
                "fs_single",
                "globe-single-pipeline",
            ),
            Technique::Overlays => (
                &self.globe_shader,
                &self.globe_pipeline_layout,
                "fs_overlays",
                "globe-overlays-pipeline",
            ),
            Technique::Picking => (
                &self.picking_shader,
                &self.picking_pipeline_layout,
                "fs_picking",
                "globe-picking-pipeline",
            ),
        };
        let (topology, strip_index_format) = match key.primitive {
            Primitive::Triangles => (wgpu::PrimitiveTopology::TriangleList, None),
            Primitive::TriangleStrip => (
                wgpu::PrimitiveTopology::TriangleStrip,
                Some(wgpu::IndexFormat::Uint32),
            ),
            Primitive::Lines => (wgpu::PrimitiveTopology::LineList, None),
        };
        let vertex_buffers = [
            vertex_layout(0, wgpu::VertexFormat::Float32x3),
            vertex_layout(1, wgpu::VertexFormat::Float32x3),
            vertex_layout(2, wgpu::VertexFormat::Float32x2),
        ];

        self.ctx
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(layout),
                vertex: wgpu::VertexState {
                    module,
                    entry_point: Some("vs_main"),
                    buffers: &vertex_buffers,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                primitive: wgpu::PrimitiveState {
                    topology,
                    strip_index_format,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: None,
                    unclipped_depth: false,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    conservative: false,
                },
                depth_stencil: Some(wgpu::DepthStencilState {
                    format: DEPTH_FORMAT,
                    depth_write_enabled: true,
                    depth_compare: wgpu::CompareFunction::GreaterEqual, // reverse-Z
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState {
                    count: 1,
                    mask: !0,
                    alpha_to_coverage_enabled: false,
                },
                fragment: Some(wgpu::FragmentState {
                    module,
                    entry_point: Some(fs_entry),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: key.format,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                multiview_mask: None,
                cache: None,
            })
    }

    /// Grow the uniform buffer to hold at least `slots` snapshots.
    fn reserve_uniform_slots(&mut self, slots: u64) {
        if slots <= self.uniform_slots {
            return;
        }
        let new_slots = slots.next_power_of_two();
        self.uniform_buffer =
            create_uniform_buffer(&self.ctx.device, self.uniform_stride * new_slots);
        self.uniform_slots = new_slots;
        log::debug!("Uniform ring grown to {new_slots} slots");
    }

    /// Encode `passes` into `encoder`. Surface passes are skipped when
    /// `surface_view` is `None`.
    fn encode_passes(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        passes: &[RecordedPass],
        surface_view: Option<&wgpu::TextureView>,
    ) -> Result<(), GpuError> {
        let draw_count: u64 = passes.iter().map(|p| p.draws.len() as u64).sum();
        self.reserve_uniform_slots(draw_count.max(1));

        let mut bytes = vec![0u8; (self.uniform_stride * draw_count.max(1)) as usize];
        let mut slot = 0usize;
        for draw in passes.iter().flat_map(|p| p.draws.iter()) {
            let offset = slot * self.uniform_stride as usize;
            bytes[offset..offset + GLOBALS_SIZE as usize]
                .copy_from_slice(bytemuck::bytes_of(&draw.globals));
            slot += 1;
            self.ensure_pipeline(draw.key);
        }
        self.ctx.queue.write_buffer(&self.uniform_buffer, 0, &bytes);

        let globals_bind_group = self
            .ctx
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("globals-bind-group"),
                layout: &self.globals_layout,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: &self.uniform_buffer,
                        offset: 0,
                        size: NonZeroU64::new(GLOBALS_SIZE),
                    }),
                }],
            });

        let mut slot = 0u64;
        for pass in passes {
            let (color_view, depth_view) = match pass.target {
                Some(fb) => {
                    let framebuffer =
                        self.framebuffers
                            .get(&fb)
                            .ok_or(GpuError::UnknownHandle {
                                kind: "framebuffer",
                                id: fb.id(),
                            })?;
                    (&framebuffer.color_view, &framebuffer.depth_view)
                }
                None => match surface_view {
                    Some(view) => (view, &self.surface_depth),
                    None => {
                        slot += pass.draws.len() as u64;
                        continue;
                    }
                },
            };

            let (color_load, depth_load) = match pass.clear {
                Some([r, g, b, a]) => (
                    wgpu::LoadOp::Clear(wgpu::Color {
                        r: f64::from(r),
                        g: f64::from(g),
                        b: f64::from(b),
                        a: f64::from(a),
                    }),
                    wgpu::LoadOp::Clear(0.0),
                ),
                None => (wgpu::LoadOp::Load, wgpu::LoadOp::Load),
            };

            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(if pass.target.is_some() {
                    "offscreen-pass"
                } else {
                    "globe-pass"
                }),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: color_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: color_load,
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: depth_load,
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });

            for draw in &pass.draws {
                let offset = (slot * self.uniform_stride) as u32;
                slot += 1;

                let Some(pipeline) = self.pipelines.get(&draw.key) else {
                    continue;
                };
                render_pass.set_pipeline(pipeline);
                render_pass.set_bind_group(0, &globals_bind_group, &[offset]);
                if draw.key.technique != Technique::Picking {
                    let imagery = self.imagery_bind_group(&draw.textures);
                    render_pass.set_bind_group(1, &imagery, &[]);
                }
                for (i, buffer) in draw.vertex_buffers.iter().enumerate().take(3) {
                    render_pass.set_vertex_buffer(i as u32, buffer.slice(..));
                }
                match &draw.kind {
                    DrawKind::Arrays(range) => render_pass.draw(range.clone(), 0..1),
                    DrawKind::Indexed(index_buffer, range) => {
                        render_pass
                            .set_index_buffer(index_buffer.slice(..), wgpu::IndexFormat::Uint32);
                        render_pass.draw_indexed(range.clone(), 0, 0..1);
                    }
                }
            }
        }
        Ok(())
    }

    fn imagery_bind_group(&self, textures: &[wgpu::TextureView]) -> wgpu::BindGroup {
        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: wgpu::BindingResource::Sampler(&self.sampler),
        }];
        for slot in 0..MAX_OVERLAYS {
            let view = textures.get(slot).unwrap_or(&self.fallback_view);
            entries.push(wgpu::BindGroupEntry {
                binding: slot as u32 + 1,
                resource: wgpu::BindingResource::TextureView(view),
            });
        }
        self.ctx
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("imagery-bind-group"),
                layout: &self.imagery_layout,
                entries: &entries,
            })
    }

    /// Submit recorded off-screen passes so their results can be read.
    fn flush_offscreen(&mut self) -> Result<(), GpuError> {
        let (offscreen, onscreen): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.passes)
                .into_iter()
                .partition(|p| p.target.is_some());
        self.passes = onscreen;
        if offscreen.is_empty() {
            return Ok(());
        }
        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("offscreen-encoder"),
            });
        self.encode_passes(&mut encoder, &offscreen, None)?;
        self.ctx.queue.submit([encoder.finish()]);
        Ok(())
    }
}

/// Round `size` up to a multiple of `alignment`.
fn align_up(size: u64, alignment: u64) -> u64 {
    let alignment = alignment.max(1);
    size.div_ceil(alignment) * alignment
}

fn create_uniform_buffer(device: &wgpu::Device, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("globals-uniform-ring"),
        size,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

fn vertex_layout(
    location: u32,
    format: wgpu::VertexFormat,
) -> wgpu::VertexBufferLayout<'static> {
    let attributes: &'static [wgpu::VertexAttribute] = match location {
        0 => &[wgpu::VertexAttribute {
            format: wgpu::VertexFormat::Float32x3,
            offset: 0,
            shader_location: 0,
        }],
        1 => &[wgpu::VertexAttribute {
            format: wgpu::VertexFormat::Float32x3,
            offset: 0,
            shader_location: 1,
        }],
        _ => &[wgpu::VertexAttribute {
            format: wgpu::VertexFormat::Float32x2,
            offset: 0,
            shader_location: 2,
        }],
    };
    wgpu::VertexBufferLayout {
        array_stride: format.size(),
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes,
    }
}

fn upload_texture(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    image: &TileImage,
    label: &'static str,
) -> GpuTexture {
    let size = wgpu::Extent3d {
        width: image.width(),
        height: image.height(),
        depth_or_array_layers: 1,
    };
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size,
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: IMAGE_FORMAT,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    queue.write_texture(
        wgpu::TexelCopyTextureInfo {
            texture: &texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        image.rgba(),
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(image.width() * 4),
            rows_per_image: Some(image.height()),
        },
        size,
    );
    GpuTexture {
        view: texture.create_view(&wgpu::TextureViewDescriptor::default()),
    }
}

impl GpuContext for WgpuContext {
    fn create_vertex_buffer(
        &mut self,
        data: &[f32],
        item_size: u32,
        count: u32,
    ) -> Result<BufferHandle, GpuError> {
        if data.is_empty() || data.len() != (item_size * count) as usize {
            return Err(GpuError::BufferCreation {
                label: "vertex",
                reason: format!(
                    "{} floats for {count} items of size {item_size}",
                    data.len()
                ),
            });
        }
        let buffer = self
            .ctx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("segment-vertices"),
                contents: bytemuck::cast_slice(data),
                usage: wgpu::BufferUsages::VERTEX,
            });
        let handle = BufferHandle::from_raw(self.next_id());
        self.buffers.insert(handle, buffer);
        Ok(handle)
    }

    fn create_index_buffer(&mut self, data: &[u32], count: u32) -> Result<BufferHandle, GpuError> {
        if data.is_empty() || data.len() != count as usize {
            return Err(GpuError::BufferCreation {
                label: "index",
                reason: format!("{} indices, expected {count}", data.len()),
            });
        }
        let buffer = self
            .ctx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("grid-indices"),
                contents: bytemuck::cast_slice(data),
                usage: wgpu::BufferUsages::INDEX,
            });
        let handle = BufferHandle::from_raw(self.next_id());
        self.buffers.insert(handle, buffer);
        Ok(handle)
    }

    fn create_texture_from_image(&mut self, image: &TileImage) -> Result<TextureHandle, GpuError> {
        let max = self.ctx.device.limits().max_texture_dimension_2d;
        if image.width() > max || image.height() > max {
            return Err(GpuError::TextureCreation(format!(
                "{}x{} exceeds the device limit of {max}",
                image.width(),
                image.height()
            )));
        }
        let texture = upload_texture(&self.ctx.device, &self.ctx.queue, image, "tile-texture");
        let handle = TextureHandle::from_raw(self.next_id());
        self.textures.insert(handle, texture);
        Ok(handle)
    }

    fn release_buffer(&mut self, buffer: BufferHandle) {
        if self.buffers.remove(&buffer).is_none() {
            log::warn!("Released unknown buffer {}", buffer.id());
        }
    }

    fn release_texture(&mut self, texture: TextureHandle) {
        if self.textures.remove(&texture).is_none() {
            log::warn!("Released unknown texture {}", texture.id());
        }
    }

    fn activate_program(&mut self, technique: Technique) -> Result<(), GpuError> {
        self.program = Some(technique);
        self.globals = GlobalsUniform::default();
        self.bound_textures.clear();
        Ok(())
    }

    fn set_uniform(&mut self, name: &'static str, value: UniformValue) -> Result<(), GpuError> {
        if self.program.is_none() {
            return Err(GpuError::NoActiveProgram);
        }
        match (name, value) {
            (uniforms::VIEW_PROJECTION_RTE, UniformValue::Mat4(m)) => {
                self.globals.view_projection_rte = m;
            }
            (uniforms::EYE_HIGH, UniformValue::Vec3([x, y, z])) => {
                self.globals.eye_high = [x, y, z, 0.0];
            }
            (uniforms::EYE_LOW, UniformValue::Vec3([x, y, z])) => {
                self.globals.eye_low = [x, y, z, 0.0];
            }
            (uniforms::PICK_COLOR, UniformValue::Vec4(c)) => {
                self.globals.pick_color = c;
            }
            (uniforms::LAYER_TINTS, UniformValue::LayerTints(t)) => {
                self.globals.layer_count = [t.count.min(MAX_OVERLAYS as u32), 0, 0, 0];
                self.globals.tints = t.tints;
            }
            _ => return Err(GpuError::UnknownUniform(name)),
        }
        Ok(())
    }

    fn bind_vertex_buffers(&mut self, buffers: &[BufferHandle]) -> Result<(), GpuError> {
        let mut bound = Vec::with_capacity(buffers.len());
        for handle in buffers {
            let buffer = self.buffers.get(handle).ok_or(GpuError::UnknownHandle {
                kind: "buffer",
                id: handle.id(),
            })?;
            bound.push(buffer.clone());
        }
        self.vertex_buffers = bound;
        Ok(())
    }

    fn bind_textures(&mut self, textures: &[TextureSlot]) -> Result<(), GpuError> {
        let mut bound = Vec::with_capacity(textures.len());
        for (i, slot) in textures.iter().take(MAX_OVERLAYS).enumerate() {
            let texture = self
                .textures
                .get(&slot.texture)
                .ok_or(GpuError::UnknownHandle {
                    kind: "texture",
                    id: slot.texture.id(),
                })?;
            bound.push(texture.view.clone());
            let [u, v, s] = slot.bias;
            self.globals.biases[i] = [u, v, s, 0.0];
        }
        self.bound_textures = bound;
        Ok(())
    }

    fn draw_arrays(&mut self, primitive: Primitive, vertices: Range<u32>) -> Result<(), GpuError> {
        self.record_draw(primitive, DrawKind::Arrays(vertices))
    }

    fn draw_indexed(
        &mut self,
        primitive: Primitive,
        index_buffer: BufferHandle,
        indices: Range<u32>,
    ) -> Result<(), GpuError> {
        let buffer = self
            .buffers
            .get(&index_buffer)
            .ok_or(GpuError::UnknownHandle {
                kind: "buffer",
                id: index_buffer.id(),
            })?
            .clone();
        self.record_draw(primitive, DrawKind::Indexed(buffer, indices))
    }

    fn create_framebuffer(
        &mut self,
        width: u32,
        height: u32,
    ) -> Result<FramebufferHandle, GpuError> {
        let max = self.ctx.device.limits().max_texture_dimension_2d;
        if width == 0 || height == 0 || width > max || height > max {
            return Err(GpuError::FramebufferCreation {
                width,
                height,
                reason: format!("dimensions must be within 1..={max}"),
            });
        }
        let color = self.ctx.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("framebuffer-color"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: FRAMEBUFFER_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let color_view = color.create_view(&wgpu::TextureViewDescriptor::default());
        let depth_view = create_depth_view(&self.ctx.device, width, height, "framebuffer-depth");
        let handle = FramebufferHandle::from_raw(self.next_id());
        self.framebuffers.insert(
            handle,
            Framebuffer {
                color,
                color_view,
                depth_view,
                width,
                height,
            },
        );
        Ok(handle)
    }

    fn release_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.passes.retain(|p| p.target != Some(framebuffer));
        if self.target == Some(framebuffer) {
            self.target = None;
        }
        self.framebuffers.remove(&framebuffer);
    }

    fn activate_framebuffer(&mut self, framebuffer: FramebufferHandle) -> Result<(), GpuError> {
        if !self.framebuffers.contains_key(&framebuffer) {
            return Err(GpuError::UnknownHandle {
                kind: "framebuffer",
                id: framebuffer.id(),
            });
        }
        self.target = Some(framebuffer);
        Ok(())
    }

    fn clear_framebuffer(&mut self, color: [f32; 4]) -> Result<(), GpuError> {
        let target = self.target;
        // A clear after draws starts a new pass on the same target.
        let fresh = self
            .passes
            .last()
            .is_some_and(|p| p.target == target && p.draws.is_empty());
        if !fresh {
            self.passes.push(RecordedPass {
                target,
                clear: None,
                draws: Vec::new(),
            });
        }
        self.current_pass().clear = Some(color);
        Ok(())
    }

    fn deactivate_framebuffer(&mut self) {
        self.target = None;
    }

    fn read_pixel(
        &mut self,
        framebuffer: FramebufferHandle,
        x: u32,
        y: u32,
    ) -> Result<[u8; 4], GpuError> {
        let (width, height) = self
            .framebuffers
            .get(&framebuffer)
            .map(|f| (f.width, f.height))
            .ok_or(GpuError::UnknownHandle {
                kind: "framebuffer",
                id: framebuffer.id(),
            })?;
        if x >= width || y >= height {
            return Err(GpuError::PixelOutOfBounds {
                x,
                y,
                width,
                height,
            });
        }

        self.flush_offscreen()?;

        let padded = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let readback = self.ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("pick-readback"),
            size: u64::from(padded),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("pick-readback-encoder"),
            });
        let Some(fb) = self.framebuffers.get(&framebuffer) else {
            return Err(GpuError::UnknownHandle {
                kind: "framebuffer",
                id: framebuffer.id(),
            });
        };
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &fb.color,
                mip_level: 0,
                origin: wgpu::Origin3d { x, y, z: 0 },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(1),
                },
            },
            wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
        );
        self.ctx.queue.submit([encoder.finish()]);

        let slice = readback.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.ctx.device.poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        });
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(GpuError::Readback(e.to_string())),
            Err(e) => return Err(GpuError::Readback(e.to_string())),
        }
        let pixel = {
            let mapped = slice.get_mapped_range();
            [mapped[0], mapped[1], mapped[2], mapped[3]]
        };
        readback.unmap();
        Ok(pixel)
    }

    fn end_frame(&mut self) -> Result<(), GpuError> {
        let mut passes = std::mem::take(&mut self.passes);
        self.program = None;
        self.target = None;
        self.vertex_buffers.clear();
        self.bound_textures.clear();

        // The first window pass clears the screen unless asked otherwise.
        match passes.iter_mut().find(|p| p.target.is_none()) {
            Some(first) if first.clear.is_none() => {
                first.clear = Some(wgpu_color_to_array(SPACE_BLACK));
            }
            Some(_) => {}
            None => passes.push(RecordedPass {
                target: None,
                clear: Some(wgpu_color_to_array(SPACE_BLACK)),
                draws: Vec::new(),
            }),
        }

        let surface_texture = match self.ctx.acquire() {
            Ok(texture) => texture,
            Err(wgpu::SurfaceError::Timeout) => {
                log::warn!("Surface timeout, skipping frame");
                return Ok(());
            }
            Err(e) => return Err(GpuError::ContextLost(e.to_string())),
        };
        let view = surface_texture
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame-encoder"),
            });
        self.encode_passes(&mut encoder, &passes, Some(&view))?;
        self.ctx.queue.submit([encoder.finish()]);
        surface_texture.present();
        Ok(())
    }
}

fn wgpu_color_to_array(c: wgpu::Color) -> [f32; 4] {
    [c.r as f32, c.g as f32, c.b as f32, c.a as f32]
}

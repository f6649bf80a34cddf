//! The GPU abstraction the globe renders through.
//!
//! The core never touches a graphics API directly. It creates buffers and
//! textures, selects one of a fixed set of programs, uploads named uniforms,
//! and issues draws through [`GpuContext`]. Resources are referred to by
//! small copyable handles; a released handle must not be used again.

use std::ops::Range;

use crate::{GpuError, TileImage};

/// Maximum number of imagery layers blended in one overlay draw.
pub const MAX_OVERLAYS: usize = 8;

/// Names of the uniforms the programs understand.
pub mod uniforms {
    /// `Mat4`: projection * view with the translation removed (relative to eye).
    pub const VIEW_PROJECTION_RTE: &str = "view_projection_rte";
    /// `Vec3`: high part of the eye position.
    pub const EYE_HIGH: &str = "eye_high";
    /// `Vec3`: low part of the eye position.
    pub const EYE_LOW: &str = "eye_low";
    /// `LayerTints`: layer count and per-layer tint/opacity (overlay program).
    pub const LAYER_TINTS: &str = "layer_tints";
    /// `Vec4`: flat identity color (picking program).
    pub const PICK_COLOR: &str = "pick_color";
}

macro_rules! gpu_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            /// Wrap a backend-assigned id.
            pub fn from_raw(id: u32) -> Self {
                Self(id)
            }

            pub fn id(self) -> u32 {
                self.0
            }
        }
    };
}

gpu_handle!(
    /// A vertex or index buffer.
    BufferHandle
);
gpu_handle!(
    /// A sampled 2D texture.
    TextureHandle
);
gpu_handle!(
    /// An off-screen color + depth render target.
    FramebufferHandle
);

/// The shader programs the globe uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Technique {
    /// One imagery layer per tile.
    Single,
    /// Up to [`MAX_OVERLAYS`] layers blended per tile.
    Overlays,
    /// Flat identity colors for picking.
    Picking,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Primitive {
    Triangles,
    TriangleStrip,
    Lines,
}

/// Per-layer tint and opacity, uploaded in one call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LayerTints {
    pub count: u32,
    /// RGB tint in `xyz`, opacity in `w`, indexed by draw order.
    pub tints: [[f32; 4]; MAX_OVERLAYS],
}

impl Default for LayerTints {
    fn default() -> Self {
        Self {
            count: 0,
            tints: [[1.0, 1.0, 1.0, 1.0]; MAX_OVERLAYS],
        }
    }
}

/// A value for [`GpuContext::set_uniform`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    /// Column-major.
    Mat4([[f32; 4]; 4]),
    LayerTints(LayerTints),
}

/// A texture bound to an imagery slot, with the texture-coordinate bias
/// `(offset_u, offset_v, scale)` applied as `uv * scale + offset`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TextureSlot {
    pub texture: TextureHandle,
    pub bias: [f32; 3],
}

impl TextureSlot {
    /// Bind `texture` with the identity mapping.
    pub fn identity(texture: TextureHandle) -> Self {
        Self {
            texture,
            bias: [0.0, 0.0, 1.0],
        }
    }
}

/// Synchronous GPU interface used from the frame loop.
///
/// Vertex buffers hold `f32` components; a draw binds them in the order
/// `[position_high, position_low, texcoord]`.
pub trait GpuContext {
    /// Create a vertex buffer of `count` items with `item_size` components each.
    fn create_vertex_buffer(
        &mut self,
        data: &[f32],
        item_size: u32,
        count: u32,
    ) -> Result<BufferHandle, GpuError>;

    fn create_index_buffer(&mut self, data: &[u32], count: u32) -> Result<BufferHandle, GpuError>;

    fn create_texture_from_image(&mut self, image: &TileImage) -> Result<TextureHandle, GpuError>;

    fn release_buffer(&mut self, buffer: BufferHandle);

    fn release_texture(&mut self, texture: TextureHandle);

    /// Select the program for subsequent uniforms and draws.
    fn activate_program(&mut self, technique: Technique) -> Result<(), GpuError>;

    /// Upload a uniform of the active program. Values persist until
    /// overwritten or another program is activated.
    fn set_uniform(&mut self, name: &'static str, value: UniformValue) -> Result<(), GpuError>;

    fn bind_vertex_buffers(&mut self, buffers: &[BufferHandle]) -> Result<(), GpuError>;

    /// Bind textures to consecutive imagery slots starting at 0.
    fn bind_textures(&mut self, textures: &[TextureSlot]) -> Result<(), GpuError>;

    fn draw_arrays(&mut self, primitive: Primitive, vertices: Range<u32>) -> Result<(), GpuError>;

    fn draw_indexed(
        &mut self,
        primitive: Primitive,
        index_buffer: BufferHandle,
        indices: Range<u32>,
    ) -> Result<(), GpuError>;

    fn create_framebuffer(&mut self, width: u32, height: u32)
    -> Result<FramebufferHandle, GpuError>;

    fn release_framebuffer(&mut self, framebuffer: FramebufferHandle);

    /// Redirect draws into `framebuffer` until deactivated.
    fn activate_framebuffer(&mut self, framebuffer: FramebufferHandle) -> Result<(), GpuError>;

    /// Clear the active target's color to `color` and its depth.
    fn clear_framebuffer(&mut self, color: [f32; 4]) -> Result<(), GpuError>;

    /// Return to drawing into the default target.
    fn deactivate_framebuffer(&mut self);

    /// Read one RGBA8 pixel of `framebuffer`, origin top-left.
    fn read_pixel(
        &mut self,
        framebuffer: FramebufferHandle,
        x: u32,
        y: u32,
    ) -> Result<[u8; 4], GpuError>;

    /// Submit everything recorded this frame and present.
    fn end_frame(&mut self) -> Result<(), GpuError>;
}

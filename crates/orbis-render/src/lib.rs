//! Rendering backend for the globe: the [`GpuContext`] abstraction, a wgpu
//! implementation drawing into a window, and a recording headless context.

mod context;
mod error;
pub mod gpu;
mod headless;
mod image;
pub mod shaders;
mod wgpu_context;

pub use context::{
    BufferHandle, FramebufferHandle, GpuContext, LayerTints, MAX_OVERLAYS, Primitive, Technique,
    TextureHandle, TextureSlot, UniformValue, uniforms,
};
pub use error::{GpuError, ImageError};
pub use gpu::{DEPTH_FORMAT, RenderContext, RenderContextError, init_render_context_blocking};
pub use headless::{GpuCommand, HeadlessContext};
pub use image::TileImage;
pub use wgpu_context::WgpuContext;

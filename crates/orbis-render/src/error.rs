//! GPU error types.

/// Failures reported by a [`GpuContext`](crate::GpuContext) implementation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GpuError {
    #[error("failed to create buffer `{label}`: {reason}")]
    BufferCreation { label: &'static str, reason: String },

    #[error("failed to create texture: {0}")]
    TextureCreation(String),

    #[error("failed to create framebuffer {width}x{height}: {reason}")]
    FramebufferCreation {
        width: u32,
        height: u32,
        reason: String,
    },

    /// A handle that was never issued or was already released.
    #[error("unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u32 },

    /// A draw or uniform upload without an active program.
    #[error("no program is active")]
    NoActiveProgram,

    #[error("uniform `{0}` is not used by the active program")]
    UnknownUniform(&'static str),

    #[error("pixel ({x}, {y}) is outside the {width}x{height} framebuffer")]
    PixelOutOfBounds { x: u32, y: u32, width: u32, height: u32 },

    /// The device or surface was lost and could not be recovered.
    #[error("GPU context lost: {0}")]
    ContextLost(String),

    #[error("GPU readback failed: {0}")]
    Readback(String),
}

/// Errors decoding or validating raster tile images.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("image data size ({actual}) does not match {width}x{height} RGBA ({expected})")]
    DataSizeMismatch {
        actual: usize,
        expected: usize,
        width: u32,
        height: u32,
    },

    #[error("image dimensions must be non-zero, got {width}x{height}")]
    ZeroDimensions { width: u32, height: u32 },

    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
}

//! A [`GpuContext`] that validates calls and records them instead of drawing.
//!
//! Used by tests and by headless runs. Every call that reaches a backend is
//! appended to a command log, resource lifetimes are tracked so leaks and
//! double releases surface as errors, and picking reads return pixels the
//! caller placed with [`HeadlessContext::set_pixel`].

use std::ops::Range;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    BufferHandle, FramebufferHandle, GpuContext, GpuError, Primitive, Technique, TextureHandle,
    TextureSlot, TileImage, UniformValue, uniforms,
};

/// One recorded call.
#[derive(Clone, Debug, PartialEq)]
pub enum GpuCommand {
    CreateVertexBuffer {
        buffer: BufferHandle,
        item_size: u32,
        count: u32,
    },
    CreateIndexBuffer {
        buffer: BufferHandle,
        count: u32,
    },
    CreateTexture {
        texture: TextureHandle,
        width: u32,
        height: u32,
    },
    ReleaseBuffer(BufferHandle),
    ReleaseTexture(TextureHandle),
    ActivateProgram(Technique),
    SetUniform {
        name: &'static str,
        value: UniformValue,
    },
    BindVertexBuffers(Vec<BufferHandle>),
    BindTextures(Vec<TextureSlot>),
    DrawArrays {
        primitive: Primitive,
        vertices: Range<u32>,
    },
    DrawIndexed {
        primitive: Primitive,
        index_buffer: BufferHandle,
        indices: Range<u32>,
    },
    CreateFramebuffer {
        framebuffer: FramebufferHandle,
        width: u32,
        height: u32,
    },
    ReleaseFramebuffer(FramebufferHandle),
    ActivateFramebuffer(FramebufferHandle),
    ClearFramebuffer([f32; 4]),
    DeactivateFramebuffer,
    ReadPixel {
        framebuffer: FramebufferHandle,
        x: u32,
        y: u32,
    },
    EndFrame,
}

impl GpuCommand {
    pub fn is_draw(&self) -> bool {
        matches!(
            self,
            GpuCommand::DrawArrays { .. } | GpuCommand::DrawIndexed { .. }
        )
    }
}

#[derive(Clone, Copy, Debug)]
struct FramebufferInfo {
    width: u32,
    height: u32,
}

fn uniforms_of(technique: Technique) -> &'static [&'static str] {
    match technique {
        Technique::Single => &[
            uniforms::VIEW_PROJECTION_RTE,
            uniforms::EYE_HIGH,
            uniforms::EYE_LOW,
        ],
        Technique::Overlays => &[
            uniforms::VIEW_PROJECTION_RTE,
            uniforms::EYE_HIGH,
            uniforms::EYE_LOW,
            uniforms::LAYER_TINTS,
        ],
        Technique::Picking => &[
            uniforms::VIEW_PROJECTION_RTE,
            uniforms::EYE_HIGH,
            uniforms::EYE_LOW,
            uniforms::PICK_COLOR,
        ],
    }
}

/// Recording GPU context with no device behind it.
#[derive(Debug, Default)]
pub struct HeadlessContext {
    commands: Vec<GpuCommand>,
    next_id: u32,
    buffers: FxHashSet<BufferHandle>,
    textures: FxHashMap<TextureHandle, (u32, u32)>,
    framebuffers: FxHashMap<FramebufferHandle, FramebufferInfo>,
    pixels: FxHashMap<(FramebufferHandle, u32, u32), [u8; 4]>,
    active_program: Option<Technique>,
    active_framebuffer: Option<FramebufferHandle>,
    frames: u64,
    fail_textures_after: Option<usize>,
    textures_created: usize,
}

impl HeadlessContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call recorded so far.
    pub fn commands(&self) -> &[GpuCommand] {
        &self.commands
    }

    /// Forget the command log (resources stay alive).
    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    pub fn draw_count(&self) -> usize {
        self.commands.iter().filter(|c| c.is_draw()).count()
    }

    /// Draws recorded while `technique` was the active program.
    pub fn draws_with(&self, technique: Technique) -> usize {
        let mut current = None;
        let mut n = 0;
        for c in &self.commands {
            match c {
                GpuCommand::ActivateProgram(t) => current = Some(*t),
                c if c.is_draw() && current == Some(technique) => n += 1,
                _ => {}
            }
        }
        n
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn is_texture_live(&self, texture: TextureHandle) -> bool {
        self.textures.contains_key(&texture)
    }

    pub fn frames_ended(&self) -> u64 {
        self.frames
    }

    pub fn active_program(&self) -> Option<Technique> {
        self.active_program
    }

    /// Store a pixel for [`GpuContext::read_pixel`] to return. Unset pixels
    /// read as transparent black.
    pub fn set_pixel(&mut self, framebuffer: FramebufferHandle, x: u32, y: u32, rgba: [u8; 4]) {
        self.pixels.insert((framebuffer, x, y), rgba);
    }

    /// Make texture creation fail once `n` more textures have been created.
    pub fn fail_textures_after(&mut self, n: usize) {
        self.fail_textures_after = Some(self.textures_created + n);
    }

    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn check_buffer(&self, buffer: BufferHandle) -> Result<(), GpuError> {
        if self.buffers.contains(&buffer) {
            Ok(())
        } else {
            Err(GpuError::UnknownHandle {
                kind: "buffer",
                id: buffer.id(),
            })
        }
    }

    fn check_framebuffer(&self, fb: FramebufferHandle) -> Result<FramebufferInfo, GpuError> {
        self.framebuffers
            .get(&fb)
            .copied()
            .ok_or(GpuError::UnknownHandle {
                kind: "framebuffer",
                id: fb.id(),
            })
    }
}

impl GpuContext for HeadlessContext {
    fn create_vertex_buffer(
        &mut self,
        data: &[f32],
        item_size: u32,
        count: u32,
    ) -> Result<BufferHandle, GpuError> {
        if data.len() != (item_size * count) as usize {
            return Err(GpuError::BufferCreation {
                label: "vertex",
                reason: format!(
                    "{} floats for {count} items of size {item_size}",
                    data.len()
                ),
            });
        }
        let buffer = BufferHandle::from_raw(self.next_id());
        self.buffers.insert(buffer);
        self.commands.push(GpuCommand::CreateVertexBuffer {
            buffer,
            item_size,
            count,
        });
        Ok(buffer)
    }

    fn create_index_buffer(&mut self, data: &[u32], count: u32) -> Result<BufferHandle, GpuError> {
        if data.len() != count as usize {
            return Err(GpuError::BufferCreation {
                label: "index",
                reason: format!("{} indices, expected {count}", data.len()),
            });
        }
        let buffer = BufferHandle::from_raw(self.next_id());
        self.buffers.insert(buffer);
        self.commands
            .push(GpuCommand::CreateIndexBuffer { buffer, count });
        Ok(buffer)
    }

    fn create_texture_from_image(&mut self, image: &TileImage) -> Result<TextureHandle, GpuError> {
        if self
            .fail_textures_after
            .is_some_and(|limit| self.textures_created >= limit)
        {
            return Err(GpuError::TextureCreation("injected failure".to_string()));
        }
        self.textures_created += 1;
        let texture = TextureHandle::from_raw(self.next_id());
        self.textures
            .insert(texture, (image.width(), image.height()));
        self.commands.push(GpuCommand::CreateTexture {
            texture,
            width: image.width(),
            height: image.height(),
        });
        Ok(texture)
    }

    fn release_buffer(&mut self, buffer: BufferHandle) {
        if !self.buffers.remove(&buffer) {
            log::warn!("Released unknown buffer {}", buffer.id());
        }
        self.commands.push(GpuCommand::ReleaseBuffer(buffer));
    }

    fn release_texture(&mut self, texture: TextureHandle) {
        if self.textures.remove(&texture).is_none() {
            log::warn!("Released unknown texture {}", texture.id());
        }
        self.commands.push(GpuCommand::ReleaseTexture(texture));
    }

    fn activate_program(&mut self, technique: Technique) -> Result<(), GpuError> {
        self.active_program = Some(technique);
        self.commands.push(GpuCommand::ActivateProgram(technique));
        Ok(())
    }

    fn set_uniform(&mut self, name: &'static str, value: UniformValue) -> Result<(), GpuError> {
        let program = self.active_program.ok_or(GpuError::NoActiveProgram)?;
        if !uniforms_of(program).contains(&name) {
            return Err(GpuError::UnknownUniform(name));
        }
        self.commands.push(GpuCommand::SetUniform { name, value });
        Ok(())
    }

    fn bind_vertex_buffers(&mut self, buffers: &[BufferHandle]) -> Result<(), GpuError> {
        for b in buffers {
            self.check_buffer(*b)?;
        }
        self.commands
            .push(GpuCommand::BindVertexBuffers(buffers.to_vec()));
        Ok(())
    }

    fn bind_textures(&mut self, textures: &[TextureSlot]) -> Result<(), GpuError> {
        for slot in textures {
            if !self.textures.contains_key(&slot.texture) {
                return Err(GpuError::UnknownHandle {
                    kind: "texture",
                    id: slot.texture.id(),
                });
            }
        }
        self.commands.push(GpuCommand::BindTextures(textures.to_vec()));
        Ok(())
    }

    fn draw_arrays(&mut self, primitive: Primitive, vertices: Range<u32>) -> Result<(), GpuError> {
        if self.active_program.is_none() {
            return Err(GpuError::NoActiveProgram);
        }
        self.commands.push(GpuCommand::DrawArrays {
            primitive,
            vertices,
        });
        Ok(())
    }

    fn draw_indexed(
        &mut self,
        primitive: Primitive,
        index_buffer: BufferHandle,
        indices: Range<u32>,
    ) -> Result<(), GpuError> {
        if self.active_program.is_none() {
            return Err(GpuError::NoActiveProgram);
        }
        self.check_buffer(index_buffer)?;
        self.commands.push(GpuCommand::DrawIndexed {
            primitive,
            index_buffer,
            indices,
        });
        Ok(())
    }

    fn create_framebuffer(
        &mut self,
        width: u32,
        height: u32,
    ) -> Result<FramebufferHandle, GpuError> {
        if width == 0 || height == 0 {
            return Err(GpuError::FramebufferCreation {
                width,
                height,
                reason: "zero-sized".to_string(),
            });
        }
        let framebuffer = FramebufferHandle::from_raw(self.next_id());
        self.framebuffers
            .insert(framebuffer, FramebufferInfo { width, height });
        self.commands.push(GpuCommand::CreateFramebuffer {
            framebuffer,
            width,
            height,
        });
        Ok(framebuffer)
    }

    fn release_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.framebuffers.remove(&framebuffer);
        self.pixels.retain(|(fb, _, _), _| *fb != framebuffer);
        if self.active_framebuffer == Some(framebuffer) {
            self.active_framebuffer = None;
        }
        self.commands
            .push(GpuCommand::ReleaseFramebuffer(framebuffer));
    }

    fn activate_framebuffer(&mut self, framebuffer: FramebufferHandle) -> Result<(), GpuError> {
        self.check_framebuffer(framebuffer)?;
        self.active_framebuffer = Some(framebuffer);
        self.commands
            .push(GpuCommand::ActivateFramebuffer(framebuffer));
        Ok(())
    }

    fn clear_framebuffer(&mut self, color: [f32; 4]) -> Result<(), GpuError> {
        self.commands.push(GpuCommand::ClearFramebuffer(color));
        Ok(())
    }

    fn deactivate_framebuffer(&mut self) {
        self.active_framebuffer = None;
        self.commands.push(GpuCommand::DeactivateFramebuffer);
    }

    fn read_pixel(
        &mut self,
        framebuffer: FramebufferHandle,
        x: u32,
        y: u32,
    ) -> Result<[u8; 4], GpuError> {
        let info = self.check_framebuffer(framebuffer)?;
        if x >= info.width || y >= info.height {
            return Err(GpuError::PixelOutOfBounds {
                x,
                y,
                width: info.width,
                height: info.height,
            });
        }
        self.commands
            .push(GpuCommand::ReadPixel { framebuffer, x, y });
        Ok(self
            .pixels
            .get(&(framebuffer, x, y))
            .copied()
            .unwrap_or([0, 0, 0, 0]))
    }

    fn end_frame(&mut self) -> Result<(), GpuError> {
        self.frames += 1;
        self.active_program = None;
        self.commands.push(GpuCommand::EndFrame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_buffer_size_validated() {
        let mut gpu = HeadlessContext::new();
        assert!(gpu.create_vertex_buffer(&[0.0; 9], 3, 3).is_ok());
        assert!(gpu.create_vertex_buffer(&[0.0; 8], 3, 3).is_err());
        assert_eq!(gpu.live_buffers(), 1);
    }

    #[test]
    fn test_release_tracks_live_resources() {
        let mut gpu = HeadlessContext::new();
        let b = gpu.create_index_buffer(&[0, 1, 2], 3).unwrap();
        let t = gpu
            .create_texture_from_image(&TileImage::solid(1, 1, [0, 0, 0, 255]))
            .unwrap();
        assert_eq!((gpu.live_buffers(), gpu.live_textures()), (1, 1));
        gpu.release_buffer(b);
        gpu.release_texture(t);
        assert_eq!((gpu.live_buffers(), gpu.live_textures()), (0, 0));
        assert!(gpu.bind_vertex_buffers(&[b]).is_err());
    }

    #[test]
    fn test_uniform_requires_matching_program() {
        let mut gpu = HeadlessContext::new();
        let v = UniformValue::Vec4([1.0, 0.0, 0.0, 1.0]);
        assert_eq!(
            gpu.set_uniform(uniforms::PICK_COLOR, v),
            Err(GpuError::NoActiveProgram)
        );
        gpu.activate_program(Technique::Single).unwrap();
        assert_eq!(
            gpu.set_uniform(uniforms::PICK_COLOR, v),
            Err(GpuError::UnknownUniform(uniforms::PICK_COLOR))
        );
        gpu.activate_program(Technique::Picking).unwrap();
        assert!(gpu.set_uniform(uniforms::PICK_COLOR, v).is_ok());
    }

    #[test]
    fn test_draws_with_counts_per_program() {
        let mut gpu = HeadlessContext::new();
        let ib = gpu.create_index_buffer(&[0, 1, 2], 3).unwrap();
        gpu.activate_program(Technique::Single).unwrap();
        gpu.draw_indexed(Primitive::Triangles, ib, 0..3).unwrap();
        gpu.draw_indexed(Primitive::Triangles, ib, 0..3).unwrap();
        gpu.activate_program(Technique::Picking).unwrap();
        gpu.draw_arrays(Primitive::Triangles, 0..3).unwrap();
        assert_eq!(gpu.draw_count(), 3);
        assert_eq!(gpu.draws_with(Technique::Single), 2);
        assert_eq!(gpu.draws_with(Technique::Picking), 1);
    }

    #[test]
    fn test_read_pixel_bounds_and_values() {
        let mut gpu = HeadlessContext::new();
        let fb = gpu.create_framebuffer(4, 4).unwrap();
        gpu.set_pixel(fb, 1, 2, [9, 8, 7, 255]);
        assert_eq!(gpu.read_pixel(fb, 1, 2), Ok([9, 8, 7, 255]));
        assert_eq!(gpu.read_pixel(fb, 0, 0), Ok([0, 0, 0, 0]));
        assert!(matches!(
            gpu.read_pixel(fb, 4, 0),
            Err(GpuError::PixelOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_injected_texture_failure() {
        let mut gpu = HeadlessContext::new();
        gpu.fail_textures_after(1);
        let img = TileImage::solid(1, 1, [1, 2, 3, 4]);
        assert!(gpu.create_texture_from_image(&img).is_ok());
        assert!(matches!(
            gpu.create_texture_from_image(&img),
            Err(GpuError::TextureCreation(_))
        ));
    }
}

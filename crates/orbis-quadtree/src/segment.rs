//! Per-node renderable tile data.

use std::collections::VecDeque;
use std::num::NonZeroU32;

use rustc_hash::FxHashMap;

use orbis_render::{BufferHandle, GpuContext, GpuError, TextureHandle, TextureSlot};

use crate::geometry::SegmentGeometry;
use crate::{LayerId, NodeHandle, RequestToken, TerrainHeights};

/// Identity of a segment, unique within one manager. Never zero, so the
/// value can double as a picking color with black meaning "nothing".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(NonZeroU32);

impl SegmentId {
    /// Largest id handed out: ids fit the 24 bits of an RGB picking color.
    pub const MAX: u32 = 0x00FF_FFFF;

    pub fn new(id: u32) -> Option<Self> {
        NonZeroU32::new(id).map(Self)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

/// Hands out segment ids in `1..=SegmentId::MAX`, reusing released ones
/// oldest first once the range has been walked.
#[derive(Debug, Default)]
pub struct SegmentIdAllocator {
    last: u32,
    free: VecDeque<SegmentId>,
}

impl SegmentIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue after `last`, as if every id up to it had been handed out.
    pub fn starting_after(last: u32) -> Self {
        Self {
            last: last.min(SegmentId::MAX),
            free: VecDeque::new(),
        }
    }

    /// `None` when every id is live.
    pub fn allocate(&mut self) -> Option<SegmentId> {
        if self.last < SegmentId::MAX {
            self.last += 1;
            return SegmentId::new(self.last);
        }
        self.free.pop_front()
    }

    pub fn release(&mut self, id: SegmentId) {
        self.free.push_back(id);
    }
}

/// A texture to sample for one layer, with the `(offset_u, offset_v, scale)`
/// bias mapping this segment's texture coordinates into it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TextureBinding {
    pub texture: TextureHandle,
    pub bias: [f32; 3],
    /// Borrowed from an ancestor while this segment's own tile is missing.
    pub inherited: bool,
}

impl TextureBinding {
    pub fn own(texture: TextureHandle) -> Self {
        Self {
            texture,
            bias: [0.0, 0.0, 1.0],
            inherited: false,
        }
    }

    pub fn slot(&self) -> TextureSlot {
        TextureSlot {
            texture: self.texture,
            bias: self.bias,
        }
    }
}

/// Load state of one layer's imagery for a segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ImageryState {
    Pending {
        token: RequestToken,
        generation: u64,
    },
    Ready(TextureHandle),
    Failed,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum TerrainState {
    /// No terrain provider; the surface stays at sea level.
    Flat,
    /// To be requested on the next visit.
    Missing,
    Pending(RequestToken),
    Ready(TerrainHeights),
    Failed,
}

/// The three vertex buffers of a segment, in bind order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentBuffers {
    pub position_high: BufferHandle,
    pub position_low: BufferHandle,
    pub texcoords: BufferHandle,
}

impl SegmentBuffers {
    fn create(gpu: &mut dyn GpuContext, geometry: &SegmentGeometry) -> Result<Self, GpuError> {
        let count = geometry.vertex_count();
        let position_high = gpu.create_vertex_buffer(&geometry.high, 3, count)?;
        let position_low = match gpu.create_vertex_buffer(&geometry.low, 3, count) {
            Ok(b) => b,
            Err(e) => {
                gpu.release_buffer(position_high);
                return Err(e);
            }
        };
        let texcoords = match gpu.create_vertex_buffer(&geometry.texcoords, 2, count) {
            Ok(b) => b,
            Err(e) => {
                gpu.release_buffer(position_high);
                gpu.release_buffer(position_low);
                return Err(e);
            }
        };
        Ok(Self {
            position_high,
            position_low,
            texcoords,
        })
    }

    pub fn as_array(&self) -> [BufferHandle; 3] {
        [self.position_high, self.position_low, self.texcoords]
    }

    fn release(self, gpu: &mut dyn GpuContext) {
        for buffer in self.as_array() {
            gpu.release_buffer(buffer);
        }
    }
}

/// Renderable data for one quadtree node.
#[derive(Debug)]
pub struct Segment {
    id: SegmentId,
    node: NodeHandle,
    geometry: SegmentGeometry,
    buffers: SegmentBuffers,
    pub(crate) imagery: FxHashMap<LayerId, ImageryState>,
    pub(crate) bindings: FxHashMap<LayerId, TextureBinding>,
    pub(crate) terrain: TerrainState,
    /// Geometry must be rebuilt before the next draw.
    pub(crate) geometry_stale: bool,
}

impl Segment {
    pub(crate) fn new(
        gpu: &mut dyn GpuContext,
        id: SegmentId,
        node: NodeHandle,
        geometry: SegmentGeometry,
        terrain: TerrainState,
    ) -> Result<Self, GpuError> {
        let buffers = SegmentBuffers::create(gpu, &geometry)?;
        Ok(Self {
            id,
            node,
            geometry,
            buffers,
            imagery: FxHashMap::default(),
            bindings: FxHashMap::default(),
            terrain,
            geometry_stale: false,
        })
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn node(&self) -> NodeHandle {
        self.node
    }

    pub fn grid_size(&self) -> u32 {
        self.geometry.grid_size
    }

    /// Grid size of the shared index buffer this segment draws with.
    pub fn index_key(&self) -> u32 {
        self.geometry.grid_size
    }

    pub fn geometry(&self) -> &SegmentGeometry {
        &self.geometry
    }

    pub fn buffers(&self) -> SegmentBuffers {
        self.buffers
    }

    /// Texture to use for `layer` this frame, own or inherited.
    pub fn binding(&self, layer: LayerId) -> Option<TextureBinding> {
        self.bindings.get(&layer).copied()
    }

    pub fn imagery_ready(&self, layer: LayerId) -> bool {
        matches!(self.imagery.get(&layer), Some(ImageryState::Ready(_)))
    }

    pub(crate) fn own_texture(&self, layer: LayerId) -> Option<TextureHandle> {
        match self.imagery.get(&layer) {
            Some(ImageryState::Ready(texture)) => Some(*texture),
            _ => None,
        }
    }

    pub fn terrain_ready(&self) -> bool {
        matches!(self.terrain, TerrainState::Flat | TerrainState::Ready(_))
    }

    pub fn terrain_heights(&self) -> Option<&TerrainHeights> {
        match &self.terrain {
            TerrainState::Ready(heights) => Some(heights),
            _ => None,
        }
    }

    /// Tokens of every request still outstanding for this segment.
    pub(crate) fn pending_tokens(&self) -> Vec<RequestToken> {
        let mut tokens: Vec<RequestToken> = self
            .imagery
            .values()
            .filter_map(|state| match state {
                ImageryState::Pending { token, .. } => Some(*token),
                _ => None,
            })
            .collect();
        if let TerrainState::Pending(token) = &self.terrain {
            tokens.push(*token);
        }
        tokens
    }

    /// Swap in freshly built geometry.
    pub(crate) fn replace_geometry(
        &mut self,
        gpu: &mut dyn GpuContext,
        geometry: SegmentGeometry,
    ) -> Result<(), GpuError> {
        let buffers = SegmentBuffers::create(gpu, &geometry)?;
        let old = std::mem::replace(&mut self.buffers, buffers);
        old.release(gpu);
        self.geometry = geometry;
        self.geometry_stale = false;
        Ok(())
    }

    /// Store a loaded texture for `layer`, releasing any previous one.
    pub(crate) fn set_texture(
        &mut self,
        gpu: &mut dyn GpuContext,
        layer: LayerId,
        texture: TextureHandle,
    ) {
        if let Some(ImageryState::Ready(old)) =
            self.imagery.insert(layer, ImageryState::Ready(texture))
        {
            gpu.release_texture(old);
        }
    }

    /// Release every GPU resource the segment owns. Inherited bindings are
    /// not released.
    pub(crate) fn release(self, gpu: &mut dyn GpuContext) {
        self.buffers.release(gpu);
        for state in self.imagery.into_values() {
            if let ImageryState::Ready(texture) = state {
                gpu.release_texture(texture);
            }
        }
    }
}

//! View-dependent quadtree of globe tiles: node arena, segments with their
//! GPU buffers, asynchronous tile loading and the per-frame manager.

mod arena;
mod frame;
pub mod geometry;
mod loader;
mod manager;
mod node;
mod provider;
pub mod providers;
mod segment;

pub use arena::{NodeArena, NodeHandle};
pub use frame::{DEFAULT_NEAR_M, FrameState, MIN_DISTANCE_M};
pub use geometry::{IndexBuffer, IndexBufferTable, SegmentGeometry};
pub use loader::{Completion, RequestSpec, TileLoader};
pub use manager::{ImageryLayer, QuadTreeManager, RefinePolicy, ancestor_bias};
pub use node::{NodeState, QuadNode};
pub use provider::{
    LayerId, RequestToken, TerrainHeights, TileCallback, TileError, TileKind, TilePayload,
    TileProvider, TileRequest,
};
pub use segment::{Segment, SegmentBuffers, SegmentId, SegmentIdAllocator, TextureBinding};

//! Grid meshes for tile segments and the shared index buffers they draw with.

use glam::DVec3;
use orbis_math::{Ellipsoid, Extent, HighLowVec3, TileProjection};
use orbis_render::{BufferHandle, GpuContext, GpuError};

use crate::TerrainHeights;

/// Largest supported grid size (cells per side).
pub const MAX_GRID_SIZE: u32 = 32;

/// Grid sizes with a prebuilt index buffer: `2^0 ..= 2^5`.
pub const GRID_SIZES: [u32; 6] = [1, 2, 4, 8, 16, 32];

/// CPU-side vertex data for one `grid × grid` cell patch.
///
/// Vertices are stored row-major from the north edge to the south edge,
/// west to east within a row, so texture `v` grows southward like image rows.
#[derive(Clone, Debug, Default)]
pub struct SegmentGeometry {
    pub grid_size: u32,
    /// Planet-centred surface positions in meters.
    pub positions: Vec<DVec3>,
    /// `xyz` high parts of the positions.
    pub high: Vec<f32>,
    /// `xyz` low parts of the positions.
    pub low: Vec<f32>,
    /// `uv` per vertex.
    pub texcoords: Vec<f32>,
}

impl SegmentGeometry {
    /// Lay a grid over `extent` and drape it on the ellipsoid.
    ///
    /// Heights, when given, are scaled by `height_factor`.
    pub fn build(
        extent: &Extent,
        projection: TileProjection,
        ellipsoid: &Ellipsoid,
        grid_size: u32,
        heights: Option<&TerrainHeights>,
        height_factor: f64,
    ) -> Self {
        let grid = grid_size.clamp(1, MAX_GRID_SIZE);
        let side = (grid + 1) as usize;
        let count = side * side;

        let mut geometry = SegmentGeometry {
            grid_size: grid,
            positions: Vec::with_capacity(count),
            high: Vec::with_capacity(count * 3),
            low: Vec::with_capacity(count * 3),
            texcoords: Vec::with_capacity(count * 2),
        };

        for row in 0..side {
            let v = row as f64 / grid as f64;
            let y = extent.north() - v * extent.height();
            for col in 0..side {
                let u = col as f64 / grid as f64;
                let x = extent.west() + u * extent.width();
                let lon_lat = projection.to_lon_lat(glam::DVec2::new(x, y));
                let height = heights.map_or(0.0, |h| h.sample(u, v) * height_factor);
                let position = ellipsoid.geodetic_to_cartesian(lon_lat.x, lon_lat.y, height);

                let split = HighLowVec3::split(position);
                geometry.positions.push(position);
                geometry.high.extend_from_slice(&split.high.to_array());
                geometry.low.extend_from_slice(&split.low.to_array());
                geometry.texcoords.extend_from_slice(&[u as f32, v as f32]);
            }
        }
        geometry
    }

    pub fn vertex_count(&self) -> u32 {
        self.positions.len() as u32
    }

    /// Surface position at grid coordinates `(col, row)`.
    pub fn position(&self, col: u32, row: u32) -> Option<DVec3> {
        let side = self.grid_size + 1;
        if col >= side || row >= side {
            return None;
        }
        self.positions.get((row * side + col) as usize).copied()
    }
}

/// Triangle-list indices for a `grid × grid` patch laid out as in
/// [`SegmentGeometry`]. Counter-clockwise seen from above the surface.
pub fn grid_indices(grid_size: u32) -> Vec<u32> {
    let grid = grid_size.max(1);
    let side = grid + 1;
    let mut indices = Vec::with_capacity((grid * grid * 6) as usize);
    for row in 0..grid {
        for col in 0..grid {
            let nw = row * side + col;
            let ne = nw + 1;
            let sw = nw + side;
            let se = sw + 1;
            indices.extend_from_slice(&[nw, sw, ne, ne, sw, se]);
        }
    }
    indices
}

/// A shared index buffer for one grid size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexBuffer {
    pub handle: BufferHandle,
    pub count: u32,
}

/// Index buffers for every supported grid size, owned by the manager.
///
/// Segments refer to an entry by grid size only.
#[derive(Debug, Default)]
pub struct IndexBufferTable {
    buffers: Vec<(u32, IndexBuffer)>,
}

impl IndexBufferTable {
    pub fn create(gpu: &mut dyn GpuContext) -> Result<Self, GpuError> {
        let mut buffers = Vec::with_capacity(GRID_SIZES.len());
        for grid in GRID_SIZES {
            let indices = grid_indices(grid);
            let count = indices.len() as u32;
            let handle = gpu.create_index_buffer(&indices, count)?;
            buffers.push((grid, IndexBuffer { handle, count }));
        }
        Ok(Self { buffers })
    }

    pub fn get(&self, grid_size: u32) -> Option<IndexBuffer> {
        self.buffers
            .iter()
            .find(|(g, _)| *g == grid_size)
            .map(|(_, b)| *b)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn release(&mut self, gpu: &mut dyn GpuContext) {
        for (_, buffer) in self.buffers.drain(..) {
            gpu.release_buffer(buffer.handle);
        }
    }
}

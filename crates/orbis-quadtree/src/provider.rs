//! The contract between the quadtree and whatever produces tile data.
//!
//! A provider receives a [`TileRequest`] and a completion callback. It may
//! call the callback synchronously or from any thread later; the tile loader
//! only forwards the result into a channel that the frame loop drains.

use std::fmt;

use orbis_math::{Extent, TileProjection};
use orbis_render::TileImage;

/// Identifies an imagery layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub u32);

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer#{}", self.0)
    }
}

/// Identifies one outstanding tile request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestToken(pub u64);

/// What a request is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TileKind {
    Terrain,
    Imagery(LayerId),
}

#[derive(Clone, Debug, PartialEq)]
pub struct TileRequest {
    pub token: RequestToken,
    pub extent: Extent,
    pub depth: u8,
    pub projection: TileProjection,
    pub kind: TileKind,
}

/// Errors a tile fetch can end with.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TileError {
    #[error("tile provider failed: {0}")]
    Provider(String),

    #[error("tile request was cancelled")]
    Cancelled,

    #[error("terrain grid of size {size} needs {expected} heights, got {actual}")]
    InvalidTerrain {
        size: u32,
        expected: usize,
        actual: usize,
    },

    #[error("provider returned {got} for a {expected} request")]
    UnexpectedPayload {
        expected: &'static str,
        got: &'static str,
    },
}

/// A square grid of heights in meters covering a tile's extent.
///
/// Rows run north to south and columns west to east; the first and last
/// rows and columns lie on the extent's edges.
#[derive(Clone, Debug, PartialEq)]
pub struct TerrainHeights {
    size: u32,
    heights: Vec<f32>,
}

impl TerrainHeights {
    /// `size` samples per side, at least 2.
    pub fn new(size: u32, heights: Vec<f32>) -> Result<Self, TileError> {
        let expected = (size as usize) * (size as usize);
        if size < 2 || heights.len() != expected {
            return Err(TileError::InvalidTerrain {
                size,
                expected,
                actual: heights.len(),
            });
        }
        Ok(Self { size, heights })
    }

    pub fn flat(size: u32, height: f32) -> Self {
        let size = size.max(2);
        Self {
            size,
            heights: vec![height; (size * size) as usize],
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn heights(&self) -> &[f32] {
        &self.heights
    }

    /// Bilinearly sample at normalized `(u, v)`, `u` eastward and `v`
    /// southward, both clamped to `[0, 1]`.
    pub fn sample(&self, u: f64, v: f64) -> f64 {
        let last = (self.size - 1) as f64;
        let x = u.clamp(0.0, 1.0) * last;
        let y = v.clamp(0.0, 1.0) * last;
        let x0 = x.floor().min(last - 1.0);
        let y0 = y.floor().min(last - 1.0);
        let fx = x - x0;
        let fy = y - y0;
        let at = |col: f64, row: f64| {
            f64::from(self.heights[row as usize * self.size as usize + col as usize])
        };
        let top = at(x0, y0) * (1.0 - fx) + at(x0 + 1.0, y0) * fx;
        let bottom = at(x0, y0 + 1.0) * (1.0 - fx) + at(x0 + 1.0, y0 + 1.0) * fx;
        top * (1.0 - fy) + bottom * fy
    }

    pub fn max_height(&self) -> f32 {
        self.heights.iter().copied().fold(f32::MIN, f32::max)
    }
}

/// Data delivered for a request.
#[derive(Clone, Debug, PartialEq)]
pub enum TilePayload {
    Imagery(TileImage),
    Terrain(TerrainHeights),
}

impl TilePayload {
    pub fn kind_name(&self) -> &'static str {
        match self {
            TilePayload::Imagery(_) => "imagery",
            TilePayload::Terrain(_) => "terrain",
        }
    }
}

/// Completion callback handed to providers. Must be called at most once.
pub type TileCallback = Box<dyn FnOnce(Result<TilePayload, TileError>) + Send>;

/// A source of terrain or imagery tiles.
pub trait TileProvider: Send + Sync {
    /// Start fetching `request`, reporting through `on_complete`.
    ///
    /// Returns the token under which the request can later be cancelled,
    /// normally `request.token`.
    fn request_tile(&self, request: TileRequest, on_complete: TileCallback) -> RequestToken;

    /// Stop work on `token` if possible. Calling `on_complete` afterwards is
    /// allowed; the result is ignored.
    fn cancel(&self, token: RequestToken) {
        let _ = token;
    }
}

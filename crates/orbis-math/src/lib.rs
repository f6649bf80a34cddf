//! Double-precision globe math for Orbis: the reference ellipsoid, ray casting,
//! planar tile extents, bounding volumes, and the high/low float split used to
//! keep planetary coordinates stable in single-precision render backends.

mod bounds;
mod ellipsoid;
mod error;
mod extent;
mod frustum;
mod high_low;
mod ray;

pub use bounds::BoundingSphere;
pub use ellipsoid::Ellipsoid;
pub use error::MathError;
pub use extent::{Extent, Quadrant, TileProjection, WEB_MERCATOR_HALF_WORLD};
pub use frustum::Frustum;
pub use high_low::{HighLow, HighLowVec3};
pub use ray::Ray;

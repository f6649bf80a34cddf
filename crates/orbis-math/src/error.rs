//! Math construction errors.

/// Errors raised when constructing geometric primitives with invalid parameters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MathError {
    /// Ellipsoid axes violate `a >= b > 0`.
    #[error("invalid ellipsoid axes: a={a}, b={b} (expected a >= b > 0)")]
    InvalidEllipsoid { a: f64, b: f64 },

    /// Extent corners are not strictly ordered.
    #[error("invalid extent: west={west}, south={south}, east={east}, north={north}")]
    InvalidExtent {
        west: f64,
        south: f64,
        east: f64,
        north: f64,
    },
}

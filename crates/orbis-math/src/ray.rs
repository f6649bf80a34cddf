//! Half-lines in planet-centred f64 space.

use glam::DVec3;

/// A ray with an origin and a direction. The direction is not required to
/// be normalized; intersection routines treat a zero direction as a miss.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Ray {
    pub origin: DVec3,
    pub direction: DVec3,
}

impl Ray {
    pub fn new(origin: DVec3, direction: DVec3) -> Self {
        Self { origin, direction }
    }

    /// Point at parameter `t` along the ray.
    pub fn at(&self, t: f64) -> DVec3 {
        self.origin + self.direction * t
    }
}

//! View-frustum culling of bounding spheres in f64 planet space.

use glam::{DMat4, DVec3, DVec4};

use crate::BoundingSphere;

const LEFT: usize = 0;
const RIGHT: usize = 1;
const BOTTOM: usize = 2;
const TOP: usize = 3;
const DEPTH_MAX: usize = 4;
const DEPTH_MIN: usize = 5;

/// Six inward-facing planes extracted from a view-projection matrix.
#[derive(Clone, Debug)]
pub struct Frustum {
    /// `(a, b, c, d)` with `(a, b, c)` the unit inward normal.
    planes: [DVec4; 6],
}

impl Frustum {
    /// Extract planes with the Gribb/Hartmann method for a `[0, 1]` clip
    /// depth range.
    ///
    /// The depth planes are `z >= 0` and `z <= w`, which bound the clip volume
    /// for both standard and reverse-Z projections. An infinite projection
    /// produces a degenerate plane with zero normal that never rejects.
    pub fn from_view_projection(vp: &DMat4) -> Self {
        let rows = [vp.row(0), vp.row(1), vp.row(2), vp.row(3)];

        let mut planes = [DVec4::ZERO; 6];
        planes[LEFT] = rows[3] + rows[0];
        planes[RIGHT] = rows[3] - rows[0];
        planes[BOTTOM] = rows[3] + rows[1];
        planes[TOP] = rows[3] - rows[1];
        planes[DEPTH_MAX] = rows[3] - rows[2];
        planes[DEPTH_MIN] = rows[2];

        for plane in &mut planes {
            let len = plane.truncate().length();
            if len > 0.0 {
                *plane /= len;
            }
        }

        Self { planes }
    }

    /// Whether any part of `sphere` may be inside the frustum.
    pub fn intersects_sphere(&self, sphere: &BoundingSphere) -> bool {
        self.planes.iter().all(|plane| {
            let normal: DVec3 = plane.truncate();
            if normal == DVec3::ZERO {
                return plane.w >= 0.0;
            }
            normal.dot(sphere.center) + plane.w >= -sphere.radius
        })
    }
}

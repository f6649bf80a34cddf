//! Tile bounding volumes for culling and screen-space error.

use glam::{DVec2, DVec3};

use crate::{Ellipsoid, Extent, TileProjection};

/// Samples per axis when fitting a sphere to an extent.
const SAMPLES: usize = 5;

/// A bounding sphere in planet-centred f64 space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingSphere {
    pub center: DVec3,
    pub radius: f64,
}

impl BoundingSphere {
    pub fn new(center: DVec3, radius: f64) -> Self {
        Self { center, radius }
    }

    /// Fit a sphere around the surface patch covered by `extent`, from sea
    /// level up to `max_height`.
    ///
    /// A grid of points across the extent is projected onto the ellipsoid at
    /// both heights; the center is the midpoint of their bounding box and the
    /// radius is the farthest sample from it.
    pub fn from_extent(
        extent: &Extent,
        projection: TileProjection,
        ellipsoid: &Ellipsoid,
        max_height: f64,
    ) -> Self {
        let mut points = Vec::with_capacity(SAMPLES * SAMPLES * 2);
        let step = (SAMPLES - 1) as f64;
        for j in 0..SAMPLES {
            for i in 0..SAMPLES {
                let planar = extent.south_west
                    + DVec2::new(
                        extent.width() * i as f64 / step,
                        extent.height() * j as f64 / step,
                    );
                let ll = projection.to_lon_lat(planar);
                points.push(ellipsoid.geodetic_to_cartesian(ll.x, ll.y, 0.0));
                if max_height > 0.0 {
                    points.push(ellipsoid.geodetic_to_cartesian(ll.x, ll.y, max_height));
                }
            }
        }

        let (min, max) = points.iter().fold(
            (DVec3::splat(f64::INFINITY), DVec3::splat(f64::NEG_INFINITY)),
            |(lo, hi), p| (lo.min(*p), hi.max(*p)),
        );
        let center = (min + max) * 0.5;
        let radius = points
            .iter()
            .map(|p| p.distance(center))
            .fold(0.0_f64, f64::max);

        Self { center, radius }
    }

    /// Distance from `p` to the sphere's surface; negative inside.
    pub fn distance_to(&self, p: DVec3) -> f64 {
        p.distance(self.center) - self.radius
    }

    pub fn contains(&self, p: DVec3) -> bool {
        self.distance_to(p) <= 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_extent_encloses_samples() {
        let e = Ellipsoid::WGS84;
        let extent = Extent::from_bounds(10.0, 20.0, 30.0, 40.0).unwrap();
        let sphere = BoundingSphere::from_extent(&extent, TileProjection::Geographic, &e, 1000.0);
        for (lon, lat) in [(10.0, 20.0), (30.0, 40.0), (20.0, 30.0), (12.5, 37.0)] {
            for h in [0.0, 1000.0] {
                let p = e.geodetic_to_cartesian(lon, lat, h);
                assert!(sphere.contains(p), "({lon}, {lat}, {h}) outside");
            }
        }
    }

    #[test]
    fn test_child_sphere_is_smaller() {
        let e = Ellipsoid::WGS84;
        let parent = Extent::geographic_world();
        let child = parent.quadrant(crate::Quadrant::NorthEast).quadrant(crate::Quadrant::SouthWest);
        let sp = BoundingSphere::from_extent(&parent, TileProjection::Geographic, &e, 0.0);
        let sc = BoundingSphere::from_extent(&child, TileProjection::Geographic, &e, 0.0);
        assert!(sc.radius < sp.radius);
    }

    #[test]
    fn test_distance_to() {
        let s = BoundingSphere::new(DVec3::ZERO, 10.0);
        assert_eq!(s.distance_to(DVec3::new(15.0, 0.0, 0.0)), 5.0);
        assert!(s.distance_to(DVec3::ZERO) < 0.0);
    }
}

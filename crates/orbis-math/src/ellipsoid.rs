//! Oblate ellipsoid of revolution with ray intersection and altitude queries.
//!
//! The ellipsoid is centred on the origin with the polar axis along Z. All
//! intersection math runs in f64; callers may store results in f32 high/low
//! pairs afterwards.

use glam::DVec3;

use crate::{MathError, Ray};

/// Rays whose nearest root lies within this distance behind the origin are
/// treated as starting on the surface.
const SURFACE_TOLERANCE: f64 = 1e-6;

/// Below this length a position is treated as the ellipsoid centre.
const CENTER_EPSILON: f64 = 1e-9;

/// A planet-shaped ellipsoid with semi-major axis `a` (equatorial) and
/// semi-minor axis `b` (polar).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Ellipsoid {
    a: f64,
    b: f64,
    inv_a2: f64,
    inv_b2: f64,
}

impl Ellipsoid {
    /// WGS84 reference ellipsoid in meters.
    pub const WGS84: Ellipsoid = Ellipsoid {
        a: 6_378_137.0,
        b: 6_356_752.314_245,
        inv_a2: 1.0 / (6_378_137.0 * 6_378_137.0),
        inv_b2: 1.0 / (6_356_752.314_245 * 6_356_752.314_245),
    };

    /// Create an ellipsoid. Requires `a >= b > 0` and both finite.
    pub fn new(a: f64, b: f64) -> Result<Self, MathError> {
        if !(a.is_finite() && b.is_finite() && b > 0.0 && a >= b) {
            return Err(MathError::InvalidEllipsoid { a, b });
        }
        Ok(Self {
            a,
            b,
            inv_a2: 1.0 / (a * a),
            inv_b2: 1.0 / (b * b),
        })
    }

    /// Equatorial radius.
    pub fn a(&self) -> f64 {
        self.a
    }

    /// Polar radius.
    pub fn b(&self) -> f64 {
        self.b
    }

    pub fn flattening(&self) -> f64 {
        (self.a - self.b) / self.a
    }

    /// First eccentricity squared.
    pub fn eccentricity_squared(&self) -> f64 {
        1.0 - (self.b * self.b) / (self.a * self.a)
    }

    /// Nearest intersection of `ray` with the surface at `t >= 0`.
    ///
    /// The ray is mapped into unit-sphere space by scaling each axis by the
    /// inverse radius, and the resulting quadratic is solved with the
    /// cancellation-free form of the root formula. Returns `None` when the
    /// ray misses, points away, or has a zero direction.
    pub fn hit(&self, ray: &Ray) -> Option<DVec3> {
        let scale = DVec3::new(1.0 / self.a, 1.0 / self.a, 1.0 / self.b);
        let o = ray.origin * scale;
        let d = ray.direction * scale;

        let qa = d.dot(d);
        if qa <= f64::EPSILON * f64::EPSILON {
            return None;
        }
        let qb = 2.0 * o.dot(d);
        let qc = o.dot(o) - 1.0;

        let disc = qb * qb - 4.0 * qa * qc;
        if disc < 0.0 {
            return None;
        }

        let q = -0.5 * (qb + qb.signum() * disc.sqrt());
        let (t0, t1) = if q == 0.0 {
            // qb == 0 and disc == 0: ray grazes with the origin on the surface.
            (0.0, 0.0)
        } else {
            let r0 = q / qa;
            let r1 = qc / q;
            (r0.min(r1), r0.max(r1))
        };

        let t = if t0 >= -SURFACE_TOLERANCE {
            t0.max(0.0)
        } else if t1 >= -SURFACE_TOLERANCE {
            t1.max(0.0)
        } else {
            return None;
        };
        Some(ray.at(t))
    }

    /// Height of `p` above the surface, measured along the ray from `p`
    /// towards the centre. For `p` inside the ellipsoid this is the distance
    /// to the far side, not a depth.
    ///
    /// At the centre itself the direction falls back to +X, which yields the
    /// equatorial radius.
    pub fn altitude(&self, p: DVec3) -> Option<f64> {
        let len = p.length();
        let direction = if len < CENTER_EPSILON {
            DVec3::X
        } else {
            -p / len
        };
        let hit = self.hit(&Ray::new(p, direction))?;
        Some(p.distance(hit))
    }

    /// Outward geodetic surface normal at (or near) `p`.
    pub fn surface_normal(&self, p: DVec3) -> DVec3 {
        DVec3::new(p.x * self.inv_a2, p.y * self.inv_a2, p.z * self.inv_b2).normalize_or_zero()
    }

    /// Cartesian position of a geodetic coordinate. Longitude and latitude
    /// are in degrees, height in meters along the surface normal.
    pub fn geodetic_to_cartesian(&self, lon_deg: f64, lat_deg: f64, height: f64) -> DVec3 {
        let lon = lon_deg.to_radians();
        let lat = lat_deg.to_radians();
        let (sin_lat, cos_lat) = lat.sin_cos();
        let (sin_lon, cos_lon) = lon.sin_cos();
        let e2 = self.eccentricity_squared();
        let n = self.a / (1.0 - e2 * sin_lat * sin_lat).sqrt();
        DVec3::new(
            (n + height) * cos_lat * cos_lon,
            (n + height) * cos_lat * sin_lon,
            (n * (1.0 - e2) + height) * sin_lat,
        )
    }

    /// Geodetic longitude/latitude in degrees and height in meters of a
    /// cartesian position. Uses a fixed number of Bowring iterations, which
    /// converges to sub-millimetre accuracy for terrestrial heights.
    pub fn cartesian_to_geodetic(&self, p: DVec3) -> (f64, f64, f64) {
        let lon = p.y.atan2(p.x);
        let r = (p.x * p.x + p.y * p.y).sqrt();
        let e2 = self.eccentricity_squared();

        if r < CENTER_EPSILON {
            let lat = if p.z >= 0.0 { 90.0 } else { -90.0 };
            return (lon.to_degrees(), lat, p.z.abs() - self.b);
        }

        let mut lat = (p.z / (r * (1.0 - e2))).atan();
        let mut height = 0.0;
        for _ in 0..5 {
            let sin_lat = lat.sin();
            let n = self.a / (1.0 - e2 * sin_lat * sin_lat).sqrt();
            height = r / lat.cos() - n;
            lat = (p.z / (r * (1.0 - e2 * n / (n + height)))).atan();
        }
        (lon.to_degrees(), lat.to_degrees(), height)
    }
}

impl Default for Ellipsoid {
    fn default() -> Self {
        Self::WGS84
    }
}

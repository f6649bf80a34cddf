//! Planar tile extents, quadrant subdivision and tile projections.

use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::MathError;

/// Half the side of the Web Mercator square, in meters.
pub const WEB_MERCATOR_HALF_WORLD: f64 = 20_037_508.34;

/// Sphere radius used by the Web Mercator projection.
const WEB_MERCATOR_RADIUS: f64 = 6_378_137.0;

/// One of the four children of a subdivided extent. The discriminant is the
/// child's slot in its parent's child array.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Quadrant {
    NorthWest = 0,
    NorthEast = 1,
    SouthWest = 2,
    SouthEast = 3,
}

impl Quadrant {
    pub const ALL: [Quadrant; 4] = [
        Quadrant::NorthWest,
        Quadrant::NorthEast,
        Quadrant::SouthWest,
        Quadrant::SouthEast,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Whether this quadrant is on the east half.
    pub fn is_east(self) -> bool {
        matches!(self, Quadrant::NorthEast | Quadrant::SouthEast)
    }

    /// Whether this quadrant is on the north half.
    pub fn is_north(self) -> bool {
        matches!(self, Quadrant::NorthWest | Quadrant::NorthEast)
    }
}

/// Axis-aligned rectangle in a planar tile projection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Extent {
    pub south_west: DVec2,
    pub north_east: DVec2,
}

impl Extent {
    /// Create an extent. Requires `west < east` and `south < north`.
    pub fn new(south_west: DVec2, north_east: DVec2) -> Result<Self, MathError> {
        if !(south_west.x < north_east.x && south_west.y < north_east.y) {
            return Err(MathError::InvalidExtent {
                west: south_west.x,
                south: south_west.y,
                east: north_east.x,
                north: north_east.y,
            });
        }
        Ok(Self {
            south_west,
            north_east,
        })
    }

    /// Create from `(west, south, east, north)`.
    pub fn from_bounds(west: f64, south: f64, east: f64, north: f64) -> Result<Self, MathError> {
        Self::new(DVec2::new(west, south), DVec2::new(east, north))
    }

    /// The full Web Mercator square.
    pub fn web_mercator_world() -> Self {
        Self {
            south_west: DVec2::splat(-WEB_MERCATOR_HALF_WORLD),
            north_east: DVec2::splat(WEB_MERCATOR_HALF_WORLD),
        }
    }

    /// The full geographic range `[-180, -90, 180, 90]`.
    pub fn geographic_world() -> Self {
        Self {
            south_west: DVec2::new(-180.0, -90.0),
            north_east: DVec2::new(180.0, 90.0),
        }
    }

    pub fn west(&self) -> f64 {
        self.south_west.x
    }

    pub fn south(&self) -> f64 {
        self.south_west.y
    }

    pub fn east(&self) -> f64 {
        self.north_east.x
    }

    pub fn north(&self) -> f64 {
        self.north_east.y
    }

    pub fn width(&self) -> f64 {
        self.north_east.x - self.south_west.x
    }

    pub fn height(&self) -> f64 {
        self.north_east.y - self.south_west.y
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    pub fn center(&self) -> DVec2 {
        (self.south_west + self.north_east) * 0.5
    }

    /// The exact quarter of this extent in the given quadrant. Children share
    /// the parent's center as a corner, so siblings tile the parent exactly.
    pub fn quadrant(&self, q: Quadrant) -> Extent {
        let c = self.center();
        let (west, east) = if q.is_east() {
            (c.x, self.north_east.x)
        } else {
            (self.south_west.x, c.x)
        };
        let (south, north) = if q.is_north() {
            (c.y, self.north_east.y)
        } else {
            (self.south_west.y, c.y)
        };
        Extent {
            south_west: DVec2::new(west, south),
            north_east: DVec2::new(east, north),
        }
    }

    /// Whether `p` lies inside or on the boundary.
    pub fn contains(&self, p: DVec2) -> bool {
        p.x >= self.south_west.x
            && p.x <= self.north_east.x
            && p.y >= self.south_west.y
            && p.y <= self.north_east.y
    }

    /// Whether `other` lies entirely within this extent.
    pub fn contains_extent(&self, other: &Extent) -> bool {
        self.contains(other.south_west) && self.contains(other.north_east)
    }

    /// Whether the two extents overlap with positive area. Extents that only
    /// share an edge or a corner do not intersect.
    pub fn intersects(&self, other: &Extent) -> bool {
        self.south_west.x < other.north_east.x
            && other.south_west.x < self.north_east.x
            && self.south_west.y < other.north_east.y
            && other.south_west.y < self.north_east.y
    }
}

/// Planar projection the tile extents are expressed in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TileProjection {
    /// Plate carrée, coordinates in degrees.
    Geographic,
    /// Spherical Mercator, coordinates in meters.
    #[default]
    WebMercator,
}

impl TileProjection {
    /// Default root extent covering the whole projected world.
    pub fn world_extent(self) -> Extent {
        match self {
            TileProjection::Geographic => Extent::geographic_world(),
            TileProjection::WebMercator => Extent::web_mercator_world(),
        }
    }

    /// Convert a projected point to `(lon, lat)` in degrees.
    pub fn to_lon_lat(self, p: DVec2) -> DVec2 {
        match self {
            TileProjection::Geographic => p,
            TileProjection::WebMercator => {
                let lon = (p.x / WEB_MERCATOR_RADIUS).to_degrees();
                let lat = (2.0 * (p.y / WEB_MERCATOR_RADIUS).exp().atan()
                    - std::f64::consts::FRAC_PI_2)
                    .to_degrees();
                DVec2::new(lon, lat)
            }
        }
    }

    /// Convert `(lon, lat)` in degrees to a projected point.
    pub fn from_lon_lat(self, lon_lat: DVec2) -> DVec2 {
        match self {
            TileProjection::Geographic => lon_lat,
            TileProjection::WebMercator => {
                let x = lon_lat.x.to_radians() * WEB_MERCATOR_RADIUS;
                let lat = lon_lat.y.to_radians();
                let y = (std::f64::consts::FRAC_PI_4 + lat * 0.5).tan().ln() * WEB_MERCATOR_RADIUS;
                DVec2::new(x, y)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_degenerate() {
        assert!(Extent::from_bounds(0.0, 0.0, 0.0, 1.0).is_err());
        assert!(Extent::from_bounds(0.0, 1.0, 1.0, 0.0).is_err());
        assert!(Extent::from_bounds(-1.0, -1.0, 1.0, 1.0).is_ok());
    }

    #[test]
    fn test_quadrants_tile_parent() {
        let parent = Extent::geographic_world();
        let total: f64 = Quadrant::ALL.iter().map(|q| parent.quadrant(*q).area()).sum();
        assert!((total - parent.area()).abs() < 1e-9);

        for (i, a) in Quadrant::ALL.iter().enumerate() {
            let ea = parent.quadrant(*a);
            assert!(parent.contains_extent(&ea));
            for b in &Quadrant::ALL[i + 1..] {
                assert!(!ea.intersects(&parent.quadrant(*b)), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn test_quadrant_positions() {
        let e = Extent::from_bounds(0.0, 0.0, 2.0, 2.0).unwrap();
        let nw = e.quadrant(Quadrant::NorthWest);
        assert_eq!(nw.south_west, DVec2::new(0.0, 1.0));
        assert_eq!(nw.north_east, DVec2::new(1.0, 2.0));
        let se = e.quadrant(Quadrant::SouthEast);
        assert_eq!(se.south_west, DVec2::new(1.0, 0.0));
        assert_eq!(se.north_east, DVec2::new(2.0, 1.0));
        assert_eq!(Quadrant::SouthWest.index(), 2);
    }

    #[test]
    fn test_shared_edge_is_not_intersection() {
        let a = Extent::from_bounds(0.0, 0.0, 1.0, 1.0).unwrap();
        let b = Extent::from_bounds(1.0, 0.0, 2.0, 1.0).unwrap();
        let c = Extent::from_bounds(0.5, 0.5, 1.5, 1.5).unwrap();
        assert!(!a.intersects(&b));
        assert!(a.intersects(&c));
        assert!(b.intersects(&c));
    }

    #[test]
    fn test_web_mercator_corners() {
        let p = TileProjection::WebMercator;
        let ll = p.to_lon_lat(DVec2::splat(WEB_MERCATOR_HALF_WORLD));
        assert!((ll.x - 180.0).abs() < 1e-6);
        assert!((ll.y - 85.051_128_78).abs() < 1e-6, "lat = {}", ll.y);
        assert_eq!(p.to_lon_lat(DVec2::ZERO), DVec2::ZERO);
    }

    #[test]
    fn test_web_mercator_roundtrip() {
        let p = TileProjection::WebMercator;
        let ll = DVec2::new(-73.98, 40.75);
        let back = p.to_lon_lat(p.from_lon_lat(ll));
        assert!((back - ll).length() < 1e-9);
    }
}

//! High/low float split for planetary-scale coordinates.
//!
//! A 64-bit world coordinate is stored as two `f32` values: `high` holds the
//! value rounded towards zero to a multiple of 65536, `low` holds the
//! remainder. Shaders subtract the camera's high and low parts separately
//! (relative-to-eye), so the large magnitudes cancel before any precision is
//! lost.
//!
//! Precision: `high` is exact in `f32` up to ~1.1e12, and `low` lies in
//! `[0, 65536)`, giving ~4 mm resolution at any planetary magnitude.

use glam::{DVec3, Vec3};

const SPLIT: f64 = 65536.0;

/// One double-precision scalar encoded as two single-precision floats.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct HighLow {
    pub high: f32,
    pub low: f32,
}

impl HighLow {
    /// Split a double into its high and low parts.
    pub fn split(value: f64) -> Self {
        if value >= 0.0 {
            let high = (value / SPLIT).floor() * SPLIT;
            Self {
                high: high as f32,
                low: (value - high) as f32,
            }
        } else {
            let high = (-value / SPLIT).floor() * SPLIT;
            Self {
                high: -high as f32,
                low: (value + high) as f32,
            }
        }
    }

    /// Recombine into a double.
    pub fn reconstruct(self) -> f64 {
        f64::from(self.high) + f64::from(self.low)
    }
}

/// A world-space position split component-wise into high and low vectors.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct HighLowVec3 {
    pub high: Vec3,
    pub low: Vec3,
}

impl HighLowVec3 {
    /// Split a double-precision vector.
    pub fn split(v: DVec3) -> Self {
        let x = HighLow::split(v.x);
        let y = HighLow::split(v.y);
        let z = HighLow::split(v.z);
        Self {
            high: Vec3::new(x.high, y.high, z.high),
            low: Vec3::new(x.low, y.low, z.low),
        }
    }

    /// Recombine into a double-precision vector.
    pub fn reconstruct(self) -> DVec3 {
        self.high.as_dvec3() + self.low.as_dvec3()
    }

    /// Position relative to `eye`, computed the way the vertex shaders do:
    /// high and low differences are taken separately, then summed.
    pub fn relative_to(self, eye: &HighLowVec3) -> Vec3 {
        (self.high - eye.high) + (self.low - eye.low)
    }
}

impl From<DVec3> for HighLowVec3 {
    fn from(v: DVec3) -> Self {
        Self::split(v)
    }
}

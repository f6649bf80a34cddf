//! Orbit camera: hangs above a geodetic point looking straight down, with
//! north up on screen.

use glam::{DVec3, Vec2};
use orbis_config::CameraConfig;
use orbis_math::Ellipsoid;
use orbis_planet::FrameState;

const MAX_LATITUDE_DEG: f64 = 89.5;
const MIN_ALTITUDE_M: f64 = 10.0;
const MAX_ALTITUDE_M: f64 = 1.0e9;

#[derive(Debug, Clone, PartialEq)]
pub struct OrbitCamera {
    lon_deg: f64,
    lat_deg: f64,
    altitude: f64,
    fov: f64,
    orbit_speed_deg_s: f64,
    zoom_rate: f64,
    reference_altitude: f64,
}

impl OrbitCamera {
    pub fn from_config(config: &CameraConfig) -> Self {
        let mut camera = Self {
            lon_deg: 0.0,
            lat_deg: 0.0,
            altitude: config.start_altitude_m.clamp(MIN_ALTITUDE_M, MAX_ALTITUDE_M),
            fov: config.fov_degrees.clamp(1.0, 170.0).to_radians(),
            orbit_speed_deg_s: config.orbit_speed_deg_s,
            zoom_rate: config.zoom_rate,
            reference_altitude: config.start_altitude_m.max(MIN_ALTITUDE_M),
        };
        camera.set_position(config.start_lon_deg, config.start_lat_deg);
        camera
    }

    pub fn lon_deg(&self) -> f64 {
        self.lon_deg
    }

    pub fn lat_deg(&self) -> f64 {
        self.lat_deg
    }

    pub fn altitude(&self) -> f64 {
        self.altitude
    }

    /// Vertical field of view in radians.
    pub fn fov(&self) -> f64 {
        self.fov
    }

    /// Move over the point `(lon, lat)`. Longitude wraps, latitude stops
    /// short of the poles.
    pub fn set_position(&mut self, lon_deg: f64, lat_deg: f64) {
        self.lon_deg = wrap_longitude(lon_deg);
        self.lat_deg = lat_deg.clamp(-MAX_LATITUDE_DEG, MAX_LATITUDE_DEG);
    }

    pub fn orbit(&mut self, d_lon_deg: f64, d_lat_deg: f64) {
        self.set_position(self.lon_deg + d_lon_deg, self.lat_deg + d_lat_deg);
    }

    /// Orbit speed scaled to the current altitude, so the ground moves at
    /// the same apparent pace at any height.
    pub fn orbit_rate_deg_s(&self) -> f64 {
        self.orbit_speed_deg_s * (self.altitude / self.reference_altitude).min(1.0)
    }

    /// Zoom in by `amount` (negative zooms out). One unit scales the
    /// altitude by `e^-zoom_rate`.
    pub fn zoom(&mut self, amount: f64) {
        self.altitude =
            (self.altitude * (-amount * self.zoom_rate).exp()).clamp(MIN_ALTITUDE_M, MAX_ALTITUDE_M);
    }

    /// Pan by a mouse drag of `delta` pixels, keeping the ground under the
    /// cursor.
    pub fn drag(&mut self, delta: Vec2, ellipsoid: &Ellipsoid, viewport_height: u32) {
        let meters_per_px =
            2.0 * self.altitude * (self.fov * 0.5).tan() / f64::from(viewport_height.max(1));
        let degrees_per_m = (1.0 / ellipsoid.a()).to_degrees();
        let d_lat = f64::from(delta.y) * meters_per_px * degrees_per_m;
        let d_lon = -f64::from(delta.x) * meters_per_px * degrees_per_m
            / self.lat_deg.to_radians().cos().max(0.01);
        self.orbit(d_lon, d_lat);
    }

    pub fn eye(&self, ellipsoid: &Ellipsoid) -> DVec3 {
        ellipsoid.geodetic_to_cartesian(self.lon_deg, self.lat_deg, self.altitude)
    }

    /// Local north at the camera's ground point.
    fn north(&self) -> DVec3 {
        let (lon, lat) = (self.lon_deg.to_radians(), self.lat_deg.to_radians());
        DVec3::new(-lat.sin() * lon.cos(), -lat.sin() * lon.sin(), lat.cos())
    }

    /// Frame state for `viewport`, with the mouse ray through `mouse` or the
    /// screen centre.
    pub fn frame_state(
        &self,
        ellipsoid: &Ellipsoid,
        viewport: (u32, u32),
        mouse: Option<Vec2>,
    ) -> FrameState {
        let eye = self.eye(ellipsoid);
        let target = ellipsoid.geodetic_to_cartesian(self.lon_deg, self.lat_deg, 0.0);
        let frame = FrameState::look_at(eye, target, self.north(), self.fov, viewport);
        match mouse {
            Some(p) => frame.with_mouse(f64::from(p.x), f64::from(p.y)),
            None => frame,
        }
    }
}

fn wrap_longitude(lon_deg: f64) -> f64 {
    let wrapped = (lon_deg + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped == -180.0 { 180.0 } else { wrapped }
}

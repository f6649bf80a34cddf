//! Per-frame camera state consumed by the tile manager and render passes.

use glam::{DMat3, DMat4, DVec3, DVec4, Mat4};
use orbis_math::{BoundingSphere, Frustum, HighLowVec3, Ray};

/// Near plane of the default reverse-Z projection, in meters.
pub const DEFAULT_NEAR_M: f64 = 1.0;

/// Closest distance used when sizing a tile on screen.
pub const MIN_DISTANCE_M: f64 = 1.0;

/// Camera state for one frame. Read-only to the globe.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameState {
    pub eye: DVec3,
    pub eye_high_low: HighLowVec3,
    pub view: DMat4,
    pub projection: DMat4,
    /// Unit direction from the eye through the mouse cursor.
    pub mouse_ray_direction: DVec3,
    /// Vertical field of view in radians.
    pub view_angle: f64,
    /// `(width, height)` in physical pixels.
    pub viewport: (u32, u32),
}

impl FrameState {
    pub fn new(
        eye: DVec3,
        view: DMat4,
        projection: DMat4,
        mouse_ray_direction: DVec3,
        view_angle: f64,
        viewport: (u32, u32),
    ) -> Self {
        Self {
            eye,
            eye_high_low: HighLowVec3::split(eye),
            view,
            projection,
            mouse_ray_direction: mouse_ray_direction.normalize_or_zero(),
            view_angle,
            viewport,
        }
    }

    /// A camera at `eye` looking at `target`, with an infinite reverse-Z
    /// projection. The mouse ray points through the viewport centre.
    pub fn look_at(
        eye: DVec3,
        target: DVec3,
        up: DVec3,
        view_angle: f64,
        viewport: (u32, u32),
    ) -> Self {
        let view = DMat4::look_at_rh(eye, target, up);
        let aspect = viewport.0.max(1) as f64 / viewport.1.max(1) as f64;
        let projection = DMat4::perspective_infinite_reverse_rh(view_angle, aspect, DEFAULT_NEAR_M);
        Self::new(eye, view, projection, target - eye, view_angle, viewport)
    }

    pub fn aspect(&self) -> f64 {
        self.viewport.0.max(1) as f64 / self.viewport.1.max(1) as f64
    }

    pub fn view_projection(&self) -> DMat4 {
        self.projection * self.view
    }

    /// Projection times the view rotation only, for vertices already made
    /// relative to the eye.
    pub fn view_projection_rte(&self) -> Mat4 {
        let mut rotation = self.view;
        rotation.w_axis = DVec4::W;
        (self.projection * rotation).as_mat4()
    }

    pub fn frustum(&self) -> Frustum {
        Frustum::from_view_projection(&self.view_projection())
    }

    pub fn mouse_ray(&self) -> Ray {
        Ray::new(self.eye, self.mouse_ray_direction)
    }

    /// Unit direction from the eye through pixel `(x, y)`, origin top-left.
    pub fn pixel_ray_direction(&self, x: f64, y: f64) -> DVec3 {
        let (w, h) = (self.viewport.0.max(1) as f64, self.viewport.1.max(1) as f64);
        let ndc_x = 2.0 * x / w - 1.0;
        let ndc_y = 1.0 - 2.0 * y / h;
        let t = (self.view_angle * 0.5).tan();
        let camera_dir = DVec3::new(ndc_x * t * self.aspect(), ndc_y * t, -1.0);
        let to_world = DMat3::from_mat4(self.view).transpose();
        (to_world * camera_dir).normalize()
    }

    /// Re-aim the mouse ray at pixel `(x, y)`.
    pub fn with_mouse(mut self, x: f64, y: f64) -> Self {
        self.mouse_ray_direction = self.pixel_ray_direction(x, y);
        self
    }

    /// Projected diameter of `sphere` in pixels.
    pub fn apparent_size_px(&self, sphere: &BoundingSphere) -> f64 {
        let distance = (sphere.center.distance(self.eye) - sphere.radius).max(MIN_DISTANCE_M);
        let half_angle = (self.view_angle * 0.5).tan();
        2.0 * sphere.radius / (2.0 * distance * half_angle) * self.viewport.1 as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> FrameState {
        FrameState::look_at(
            DVec3::new(0.0, 0.0, 10.0),
            DVec3::ZERO,
            DVec3::Y,
            60f64.to_radians(),
            (800, 600),
        )
    }

    #[test]
    fn test_centre_pixel_looks_forward() {
        let f = frame();
        let d = f.pixel_ray_direction(400.0, 300.0);
        assert!(d.distance(DVec3::NEG_Z) < 1e-12);
        assert!(f.mouse_ray_direction.distance(DVec3::NEG_Z) < 1e-12);
    }

    #[test]
    fn test_corner_pixel_on_frustum_edge() {
        let f = frame();
        let d = f.pixel_ray_direction(400.0, 0.0);
        // Top edge: angle to the forward axis is half the vertical fov.
        let angle = d.angle_between(DVec3::NEG_Z);
        assert!((angle - 30f64.to_radians()).abs() < 1e-9);
        assert!(d.y > 0.0);
    }

    #[test]
    fn test_rte_matrix_matches_full_matrix() {
        let f = FrameState::look_at(
            DVec3::new(7.0e6, 1.0e5, 2.0e5),
            DVec3::ZERO,
            DVec3::Z,
            45f64.to_radians(),
            (1280, 720),
        );
        let p = DVec3::new(6.4e6, 0.0, 0.0);
        let full = f.view_projection() * p.extend(1.0);
        let rte = f.view_projection_rte().as_dmat4() * (p - f.eye).extend(1.0);
        let a = full.truncate() / full.w;
        let b = rte.truncate() / rte.w;
        assert!(a.distance(b) < 1e-4);
    }

    #[test]
    fn test_apparent_size_shrinks_with_distance() {
        let f = frame();
        let near = BoundingSphere::new(DVec3::new(0.0, 0.0, -10.0), 1.0);
        let far = BoundingSphere::new(DVec3::new(0.0, 0.0, -1000.0), 1.0);
        assert!(f.apparent_size_px(&near) > f.apparent_size_px(&far));
    }

    #[test]
    fn test_apparent_size_clamps_inside_sphere() {
        let f = frame();
        let around = BoundingSphere::new(f.eye, 100.0);
        let size = f.apparent_size_px(&around);
        assert!(size.is_finite());
        assert!(size > 1.0e4);
    }
}

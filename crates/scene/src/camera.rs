//! Camera and first-person controller.
//!
//! The ray generation shader reconstructs primary rays from the inverse view
//! and inverse projection matrices, so [`Camera`] exposes both alongside the
//! forward view-projection used for temporal reprojection.

use glam::{Mat4, Quat, Vec3};

#[derive(Clone, Debug, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    /// Rotation around world up, radians.
    pub yaw: f32,
    /// Rotation around the camera's right axis, radians.
    pub pitch: f32,
    pub fov_y: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 2.0, 7.0),
            yaw: 0.0,
            pitch: -0.15,
            fov_y: 60.0_f32.to_radians(),
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 512.0,
        }
    }
}

const PITCH_LIMIT: f32 = 1.55;

impl Camera {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aspect ratio of a `width`x`height` surface; zero sizes are ignored.
    pub fn set_extent(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.aspect = width as f32 / height as f32;
        }
    }

    pub fn rotation(&self) -> Quat {
        Quat::from_rotation_y(self.yaw) * Quat::from_rotation_x(self.pitch)
    }

    pub fn forward(&self) -> Vec3 {
        self.rotation() * Vec3::NEG_Z
    }

    pub fn right(&self) -> Vec3 {
        self.rotation() * Vec3::X
    }

    pub fn up(&self) -> Vec3 {
        self.rotation() * Vec3::Y
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.forward(), Vec3::Y)
    }

    pub fn projection_matrix(&self) -> Mat4 {
        let mut proj = Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far);
        // Vulkan clip space has y pointing down
        proj.y_axis.y *= -1.0;
        proj
    }

    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    pub fn view_inverse(&self) -> Mat4 {
        self.view_matrix().inverse()
    }

    pub fn projection_inverse(&self) -> Mat4 {
        self.projection_matrix().inverse()
    }

    pub fn look_at(&mut self, target: Vec3) {
        let dir = (target - self.position).normalize_or_zero();
        if dir == Vec3::ZERO {
            return;
        }
        self.yaw = (-dir.x).atan2(-dir.z);
        self.pitch = dir.y.asin().clamp(-PITCH_LIMIT, PITCH_LIMIT);
    }
}

/// Per-frame movement request, each axis in `[-1, 1]`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CameraInput {
    pub forward: f32,
    pub right: f32,
    pub up: f32,
    pub yaw: f32,
    pub pitch: f32,
}

impl CameraInput {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// WASD-style controller moving along the camera's own axes.
#[derive(Clone, Debug)]
pub struct FpsController {
    /// World units per second.
    pub move_speed: f32,
    /// Radians per second.
    pub turn_speed: f32,
}

impl Default for FpsController {
    fn default() -> Self {
        Self {
            move_speed: 2.5,
            turn_speed: 1.2,
        }
    }
}

impl FpsController {
    /// Applies `input` over `dt` seconds. Returns whether the camera moved.
    pub fn update(&self, camera: &mut Camera, input: &CameraInput, dt: f32) -> bool {
        if input.is_idle() || dt <= 0.0 {
            return false;
        }

        camera.yaw -= input.yaw * self.turn_speed * dt;
        camera.pitch =
            (camera.pitch + input.pitch * self.turn_speed * dt).clamp(-PITCH_LIMIT, PITCH_LIMIT);

        let step = self.move_speed * dt;
        let motion = camera.forward() * input.forward + camera.right() * input.right
            + Vec3::Y * input.up;
        camera.position += motion * step;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: Vec3, b: Vec3) -> bool {
        (a - b).length() < 1e-5
    }

    #[test]
    fn test_default_camera_axes_are_orthonormal() {
        let camera = Camera {
            pitch: 0.0,
            ..Camera::default()
        };
        assert!(approx(camera.forward(), Vec3::NEG_Z));
        assert!(approx(camera.right(), Vec3::X));
        assert!(approx(camera.up(), Vec3::Y));
    }

    #[test]
    fn test_inverses_round_trip() {
        let camera = Camera::default();
        let identity = camera.view_matrix() * camera.view_inverse();
        assert!(identity.abs_diff_eq(Mat4::IDENTITY, 1e-4));

        let identity = camera.projection_matrix() * camera.projection_inverse();
        assert!(identity.abs_diff_eq(Mat4::IDENTITY, 1e-4));
    }

    #[test]
    fn test_view_inverse_translation_is_position() {
        let camera = Camera::default();
        let origin = camera.view_inverse().transform_point3(Vec3::ZERO);
        assert!(approx(origin, camera.position));
    }

    #[test]
    fn test_projection_flips_y() {
        let camera = Camera::default();
        let point = camera.position + camera.forward() * 5.0 + camera.up();
        let clip = camera.view_projection_matrix().project_point3(point);
        assert!(clip.y < 0.0);
    }

    #[test]
    fn test_look_at() {
        let mut camera = Camera::default();
        camera.position = Vec3::new(0.0, 0.0, 5.0);
        camera.look_at(Vec3::new(5.0, 0.0, 5.0));
        assert!(approx(camera.forward(), Vec3::X));
    }

    #[test]
    fn test_set_extent_ignores_zero() {
        let mut camera = Camera::default();
        camera.set_extent(800, 400);
        assert_eq!(camera.aspect, 2.0);
        camera.set_extent(0, 400);
        assert_eq!(camera.aspect, 2.0);
    }

    #[test]
    fn test_controller_moves_forward() {
        let mut camera = Camera {
            pitch: 0.0,
            ..Camera::default()
        };
        let start = camera.position;
        let controller = FpsController::default();
        let input = CameraInput {
            forward: 1.0,
            ..Default::default()
        };
        assert!(controller.update(&mut camera, &input, 0.5));
        assert!(approx(camera.position, start + Vec3::NEG_Z * 1.25));
    }

    #[test]
    fn test_controller_idle_does_nothing() {
        let mut camera = Camera::default();
        let before = camera.clone();
        assert!(!FpsController::default().update(&mut camera, &CameraInput::default(), 0.1));
        assert_eq!(camera, before);
    }

    #[test]
    fn test_controller_clamps_pitch() {
        let mut camera = Camera::default();
        let input = CameraInput {
            pitch: 1.0,
            ..Default::default()
        };
        FpsController::default().update(&mut camera, &input, 100.0);
        assert_eq!(camera.pitch, PITCH_LIMIT);
    }
}

use glam::{Mat4, Vec3};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Projection {
    #[default]
    Perspective,
    /// `fovy` is the full height of the view volume in world units.
    Orthographic,
}

/// Camera handed to [`crate::Renderer::begin`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    /// Vertical field of view in degrees for perspective cameras.
    pub fovy: f32,
    pub projection: Projection,
    pub near: f32,
    pub far: f32,
}

impl Camera {
    pub fn perspective(position: Vec3, target: Vec3, fovy: f32) -> Self {
        Self {
            position,
            target,
            fovy,
            ..Self::default()
        }
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    pub fn proj(&self, aspect: f32) -> Mat4 {
        match self.projection {
            Projection::Perspective => {
                Mat4::perspective_rh_gl(self.fovy.to_radians(), aspect, self.near, self.far)
            }
            Projection::Orthographic => {
                let top = self.fovy * 0.5;
                let right = top * aspect;
                Mat4::orthographic_rh_gl(-right, right, -top, top, self.near, self.far)
            }
        }
    }

    pub fn view_proj(&self, aspect: f32) -> Mat4 {
        self.proj(aspect) * self.view()
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 3.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
            fovy: 60.0,
            projection: Projection::Perspective,
            near: 0.01,
            far: 1000.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_proj_is_invertible() {
        let cam = Camera::default();
        let vp = cam.view_proj(16.0 / 9.0);
        let id = vp * vp.inverse();
        assert!(id.abs_diff_eq(Mat4::IDENTITY, 1e-4));
    }

    #[test]
    fn orthographic_maps_half_height_to_ndc_edge() {
        let cam = Camera {
            projection: Projection::Orthographic,
            fovy: 10.0,
            ..Camera::default()
        };
        let p = cam.proj(1.0).project_point3(Vec3::new(0.0, 5.0, -1.0));
        assert!((p.y - 1.0).abs() < 1e-5);
    }
}

use glam::{Mat4, Vec3, Vec4};

use super::Aabb;

const BACK: usize = 0;
const FRONT: usize = 1;
const BOTTOM: usize = 2;
const TOP: usize = 3;
const RIGHT: usize = 4;
const LEFT: usize = 5;

/// Six-plane view volume extracted from a view-projection matrix.
///
/// Planes point inward: a point is inside a plane when its signed distance
/// is positive. Extraction assumes an OpenGL-style clip space (`-w..w` on
/// every axis), which is what [`Camera`](crate::renderer::Camera) and the
/// light projections produce.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Frustum {
    planes: [Vec4; 6],
}

impl Frustum {
    pub fn from_view_proj(view_proj: &Mat4) -> Self {
        let r0 = view_proj.row(0);
        let r1 = view_proj.row(1);
        let r2 = view_proj.row(2);
        let r3 = view_proj.row(3);

        let mut planes = [Vec4::ZERO; 6];
        planes[RIGHT] = normalize_plane(r3 - r0);
        planes[LEFT] = normalize_plane(r3 + r0);
        planes[TOP] = normalize_plane(r3 - r1);
        planes[BOTTOM] = normalize_plane(r3 + r1);
        planes[BACK] = normalize_plane(r3 - r2);
        planes[FRONT] = normalize_plane(r3 + r2);

        Self { planes }
    }

    pub fn from_view_and_proj(view: &Mat4, proj: &Mat4) -> Self {
        Self::from_view_proj(&(*proj * *view))
    }

    pub fn planes(&self) -> &[Vec4; 6] {
        &self.planes
    }

    pub fn point_in(&self, position: Vec3) -> bool {
        self.planes
            .iter()
            .all(|plane| distance_to_plane(plane, position) > 0.0)
    }

    pub fn sphere_in(&self, center: Vec3, radius: f32) -> bool {
        self.planes
            .iter()
            .all(|plane| distance_to_plane(plane, center) >= -radius)
    }

    /// Conservative box test: never rejects a box that touches the volume,
    /// but may accept one that only straddles two planes outside a corner.
    pub fn aabb_in(&self, aabb: &Aabb) -> bool {
        let corners = aabb.corners();

        // Fast accept: one corner inside every plane.
        if corners.iter().any(|&corner| self.point_in(corner)) {
            return true;
        }

        // Fast reject: every corner behind a single plane.
        for plane in &self.planes {
            if corners
                .iter()
                .all(|&corner| distance_to_plane(plane, corner) < 0.0)
            {
                return false;
            }
        }

        true
    }
}

fn normalize_plane(plane: Vec4) -> Vec4 {
    let mag = plane.truncate().length();
    if mag > 1e-6 {
        plane / mag
    } else {
        Vec4::ZERO
    }
}

#[inline]
fn distance_to_plane(plane: &Vec4, p: Vec3) -> f32 {
    plane.x * p.x + plane.y * p.y + plane.z * p.z + plane.w
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera_frustum() -> Frustum {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        let proj = Mat4::perspective_rh_gl(60f32.to_radians(), 4.0 / 3.0, 0.1, 100.0);
        Frustum::from_view_and_proj(&view, &proj)
    }

    #[test]
    fn planes_are_unit_length() {
        let frustum = camera_frustum();
        for plane in frustum.planes() {
            assert!((plane.truncate().length() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn origin_is_inside_and_behind_camera_is_not() {
        let frustum = camera_frustum();
        assert!(frustum.point_in(Vec3::ZERO));
        assert!(!frustum.point_in(Vec3::new(0.0, 0.0, 10.0)));
        assert!(!frustum.point_in(Vec3::new(0.0, 0.0, -200.0)));
    }

    #[test]
    fn sphere_straddling_near_plane_is_accepted() {
        let frustum = camera_frustum();
        assert!(frustum.sphere_in(Vec3::new(0.0, 0.0, 5.5), 1.0));
        assert!(!frustum.sphere_in(Vec3::new(0.0, 0.0, 8.0), 1.0));
    }

    #[test]
    fn box_larger_than_frustum_is_accepted() {
        let frustum = camera_frustum();
        // No corner inside and no single plane rejects it.
        let huge = Aabb::new(Vec3::splat(-500.0), Vec3::splat(500.0));
        assert!(frustum.aabb_in(&huge));
    }

    #[test]
    fn degenerate_matrix_yields_zero_planes() {
        let frustum = Frustum::from_view_proj(&Mat4::ZERO);
        assert!(frustum.planes().iter().all(|p| *p == Vec4::ZERO));
        // Zero planes give zero distance, which is never strictly inside.
        assert!(!frustum.point_in(Vec3::ZERO));
    }
}

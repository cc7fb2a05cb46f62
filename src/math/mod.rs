pub mod aabb;
pub mod frustum;
pub mod transform;

pub use aabb::Aabb;
pub use frustum::Frustum;
pub use transform::{
    apply_billboard, billboard_rotation, translation_of, BillboardMode, SharedTransform,
    Transform,
};

use glam::{Mat4, Vec3, Vec4};

/// Rotation about `axis` by `degrees`; a zero axis yields identity.
pub fn rotation_axis_degrees(axis: Vec3, degrees: f32) -> Mat4 {
    let axis = axis.normalize_or_zero();
    if axis == Vec3::ZERO || degrees == 0.0 {
        return Mat4::IDENTITY;
    }
    Mat4::from_axis_angle(axis, degrees.to_radians())
}

/// Euler rotation in degrees applied X, then Y, then Z.
pub fn rotation_xyz_degrees(degrees: Vec3) -> Mat4 {
    let r = degrees * (std::f32::consts::PI / 180.0);
    Mat4::from_rotation_z(r.z) * Mat4::from_rotation_y(r.y) * Mat4::from_rotation_x(r.x)
}

/// 8-bit RGBA color to normalized floats.
pub fn color_vec4(color: [u8; 4]) -> Vec4 {
    Vec4::new(color[0] as f32, color[1] as f32, color[2] as f32, color[3] as f32) / 255.0
}

pub fn color_vec3(color: [u8; 4]) -> Vec3 {
    color_vec4(color).truncate()
}

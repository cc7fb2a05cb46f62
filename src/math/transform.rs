use std::cell::RefCell;
use std::rc::Rc;

use glam::{Mat4, Quat, Vec3, Vec4};

/// A transform that several objects can parent themselves to.
pub type SharedTransform = Rc<RefCell<Transform>>;

/// Object transform with an optional parent.
///
/// The local matrix is `T * R * S`; the global matrix prepends every
/// parent's global matrix.
#[derive(Clone, Debug)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
    pub parent: Option<SharedTransform>,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
            parent: None,
        }
    }
}

impl Transform {
    pub fn identity(parent: Option<SharedTransform>) -> Self {
        Self {
            parent,
            ..Self::default()
        }
    }

    pub fn from_trs(position: Vec3, rotation: Quat, scale: Vec3) -> Self {
        Self {
            position,
            rotation,
            scale,
            parent: None,
        }
    }

    /// Decomposes an affine matrix. The parent is left unset.
    pub fn from_matrix(mat: &Mat4) -> Self {
        let (scale, rotation, position) = mat.to_scale_rotation_translation();
        Self::from_trs(position, rotation, scale)
    }

    pub fn into_shared(self) -> SharedTransform {
        Rc::new(RefCell::new(self))
    }

    pub fn to_local(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }

    pub fn to_global(&self) -> Mat4 {
        match &self.parent {
            Some(parent) => parent.borrow().to_global() * self.to_local(),
            None => self.to_local(),
        }
    }
}

/// Camera-facing behaviour of sprites, particles and models.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BillboardMode {
    #[default]
    Disabled,
    /// Faces the camera on every axis.
    Enabled,
    /// Yaws toward the camera and stays upright.
    YAxis,
}

/// Rotation whose +Z axis points from `model_pos` toward `view_pos`.
pub fn billboard_rotation(mode: BillboardMode, model_pos: Vec3, view_pos: Vec3) -> Mat4 {
    match mode {
        BillboardMode::Disabled => Mat4::IDENTITY,
        BillboardMode::Enabled => {
            let to_camera = (view_pos - model_pos).try_normalize().unwrap_or(Vec3::Z);
            // Seen from straight above or below, Y is parallel to the view.
            let reference = if to_camera.y.abs() > 0.999 { Vec3::Z } else { Vec3::Y };
            let right = reference.cross(to_camera).normalize();
            let up = to_camera.cross(right);
            basis(right, up, to_camera)
        }
        BillboardMode::YAxis => {
            let mut to_camera = view_pos - model_pos;
            to_camera.y = 0.0;
            let to_camera = to_camera.try_normalize().unwrap_or(Vec3::Z);
            let right = Vec3::Y.cross(to_camera);
            basis(right, Vec3::Y, to_camera)
        }
    }
}

/// Applies the billboard rotation around the matrix's own translation.
pub fn apply_billboard(mode: BillboardMode, mat: Mat4, view_pos: Vec3) -> Mat4 {
    if mode == BillboardMode::Disabled {
        return mat;
    }
    let position = mat.w_axis.truncate();
    let rotation = billboard_rotation(mode, position, view_pos);
    Mat4::from_translation(position) * rotation * Mat4::from_translation(-position) * mat
}

/// Translation stored in the last column.
#[inline]
pub fn translation_of(mat: &Mat4) -> Vec3 {
    mat.w_axis.truncate()
}

fn basis(right: Vec3, up: Vec3, forward: Vec3) -> Mat4 {
    Mat4::from_cols(
        right.extend(0.0),
        up.extend(0.0),
        forward.extend(0.0),
        Vec4::W,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_identity() {
        let m = Transform::default().to_global();
        assert!(m.abs_diff_eq(Mat4::IDENTITY, 1e-6));
    }

    #[test]
    fn parent_chain_is_applied() {
        let parent = Transform::from_trs(Vec3::new(10.0, 0.0, 0.0), Quat::IDENTITY, Vec3::ONE)
            .into_shared();
        let child = Transform {
            position: Vec3::new(0.0, 1.0, 0.0),
            parent: Some(parent.clone()),
            ..Transform::default()
        };
        let p = child.to_global().transform_point3(Vec3::ZERO);
        assert!(p.abs_diff_eq(Vec3::new(10.0, 1.0, 0.0), 1e-6));

        parent.borrow_mut().position = Vec3::new(-2.0, 0.0, 0.0);
        let p = child.to_global().transform_point3(Vec3::ZERO);
        assert!(p.abs_diff_eq(Vec3::new(-2.0, 1.0, 0.0), 1e-6));
    }

    #[test]
    fn full_billboard_faces_camera() {
        let model = Vec3::new(1.0, 2.0, 3.0);
        let cam = Vec3::new(4.0, 6.0, 3.0);
        let m = billboard_rotation(BillboardMode::Enabled, model, cam);
        let forward = m.transform_vector3(Vec3::Z);
        assert!(forward.abs_diff_eq((cam - model).normalize(), 1e-5));
    }

    #[test]
    fn y_axis_billboard_stays_upright() {
        let m = billboard_rotation(BillboardMode::YAxis, Vec3::ZERO, Vec3::new(3.0, 50.0, 0.0));
        assert!(m.transform_vector3(Vec3::Y).abs_diff_eq(Vec3::Y, 1e-6));
        assert!(m.transform_vector3(Vec3::Z).abs_diff_eq(Vec3::X, 1e-6));
    }

    #[test]
    fn billboard_seen_from_above_or_below_stays_a_rotation() {
        for cam in [Vec3::new(0.0, 10.0, 0.0), Vec3::new(0.0, -10.0, 0.0), Vec3::ZERO] {
            for mode in [BillboardMode::Enabled, BillboardMode::YAxis] {
                let m = billboard_rotation(mode, Vec3::ZERO, cam);
                assert!(m.is_finite());
                assert!((m.determinant() - 1.0).abs() < 1e-5, "{:?} from {:?}", mode, cam);
            }
        }
        let m = billboard_rotation(BillboardMode::Enabled, Vec3::ZERO, Vec3::new(0.0, 10.0, 0.0));
        assert!(m.transform_vector3(Vec3::Z).abs_diff_eq(Vec3::Y, 1e-6));
    }

    #[test]
    fn billboard_keeps_translation() {
        let mat = Mat4::from_translation(Vec3::new(5.0, 0.0, 0.0));
        let out = apply_billboard(BillboardMode::Enabled, mat, Vec3::new(5.0, 0.0, 10.0));
        assert!(translation_of(&out).abs_diff_eq(Vec3::new(5.0, 0.0, 0.0), 1e-6));
    }
}

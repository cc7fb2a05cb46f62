//! Drawable objects accepted by the renderer.

use glam::{Mat4, Vec2, Vec3};

use super::lights::Layers;
use super::material::{CastShadow, Material, MaterialConfig};
use crate::gpu::{GraphicsDevice, MeshData, MeshHandle, TextureId};
use crate::math::{rotation_xyz_degrees, Aabb, BillboardMode, Transform};

/// GPU mesh plus the data needed to cull it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Mesh {
    pub handle: MeshHandle,
    pub vertex_count: u32,
    pub index_count: u32,
    pub aabb: Aabb,
}

impl Mesh {
    pub fn upload<D: GraphicsDevice>(device: &mut D, data: &MeshData) -> Self {
        let aabb = Aabb::from_points(data.positions.iter().map(|p| Vec3::from(*p)));
        Self {
            handle: device.create_mesh(data),
            vertex_count: data.vertex_count() as u32,
            index_count: data.indices.len() as u32,
            aabb,
        }
    }

    pub fn destroy<D: GraphicsDevice>(self, device: &mut D) {
        device.destroy_mesh(self.handle);
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Surface {
    pub mesh: Mesh,
    pub material: Material,
}

#[derive(Clone, Debug)]
pub struct Model {
    pub surfaces: Vec<Surface>,
    pub transform: Transform,
    /// Local bounds covering every surface.
    pub aabb: Aabb,
    pub shadow: CastShadow,
    pub billboard: BillboardMode,
    pub layer: Layers,
}

impl Model {
    pub fn new(surfaces: Vec<Surface>) -> Self {
        let aabb = surfaces
            .iter()
            .map(|s| s.mesh.aabb)
            .reduce(|a, b| a.union(&b))
            .unwrap_or(Aabb::UNIT);
        Self {
            surfaces,
            transform: Transform::default(),
            aabb,
            shadow: CastShadow::On,
            billboard: BillboardMode::Disabled,
            layer: Layers::LAYER_1,
        }
    }

    pub fn from_mesh(mesh: Mesh, material: Material) -> Self {
        Self::new(vec![Surface { mesh, material }])
    }
}

/// Frame-atlas billboard.
///
/// Frame coordinates are in normalized texture units; frames run left to
/// right, then top to bottom.
#[derive(Clone, Debug)]
pub struct Sprite {
    pub material: Material,
    pub transform: Transform,
    pub current_frame: f32,
    pub frame_size: Vec2,
    pub x_frames: u32,
    pub y_frames: u32,
    pub shadow: CastShadow,
    pub billboard: BillboardMode,
    pub layer: Layers,
}

impl Sprite {
    pub fn new(texture: TextureId, x_frames: u32, y_frames: u32, config: MaterialConfig) -> Self {
        let x_frames = x_frames.max(1);
        let y_frames = y_frames.max(1);
        let mut sprite = Self {
            material: Material::new(config).with_albedo(Some(texture), [255; 4]),
            transform: Transform::default(),
            current_frame: 0.0,
            frame_size: Vec2::new(1.0 / x_frames as f32, 1.0 / y_frames as f32),
            x_frames,
            y_frames,
            shadow: CastShadow::Off,
            billboard: BillboardMode::YAxis,
            layer: Layers::LAYER_1,
        };
        sprite.apply_frame();
        sprite
    }

    /// Advances through every frame of the atlas.
    pub fn update(&mut self, speed: f32) {
        self.update_ex(0, self.x_frames * self.y_frames, speed);
    }

    /// Advances within `[first, last)`, wrapping around.
    pub fn update_ex(&mut self, first: u32, last: u32, speed: f32) {
        self.current_frame = wrap(self.current_frame + speed, first as f32, last as f32);
        self.apply_frame();
    }

    pub fn current_frame_coord(&self) -> Vec2 {
        let frame = self.current_frame.max(0.0) as u32;
        let column = frame % self.x_frames;
        let row = frame / self.x_frames;
        Vec2::new(column as f32, row as f32) * self.frame_size
    }

    /// `(x, y, width, height)` of the current frame.
    pub fn current_frame_rect(&self) -> [f32; 4] {
        let coord = self.current_frame_coord();
        [coord.x, coord.y, self.frame_size.x, self.frame_size.y]
    }

    fn apply_frame(&mut self) {
        let [x, y, w, h] = self.current_frame_rect();
        self.material.uv_offset = Vec2::new(x, y);
        self.material.uv_scale = Vec2::new(w, h);
    }
}

fn wrap(value: f32, min: f32, max: f32) -> f32 {
    let range = max - min;
    if range <= 0.0 {
        return min;
    }
    value - range * ((value - min) / range).floor()
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Particle {
    pub position: Vec3,
    /// Euler rotation in degrees.
    pub rotation: Vec3,
    pub scale: Vec3,
    pub color: [u8; 4],
}

impl Default for Particle {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Vec3::ZERO,
            scale: Vec3::ONE,
            color: [255; 4],
        }
    }
}

impl Particle {
    /// `scale`, then XYZ rotation, then translation.
    pub fn local_matrix(&self) -> Mat4 {
        Mat4::from_translation(self.position) * rotation_xyz_degrees(self.rotation) * Mat4::from_scale(self.scale)
    }
}

/// CPU particle system. Simulation happens elsewhere; the renderer only reads
/// the current particle array.
#[derive(Clone, Debug)]
pub struct ParticleSystem {
    pub particles: Vec<Particle>,
    pub surface: Surface,
    pub transform: Transform,
    /// Bounds of the emitted particles, relative to `transform`.
    pub aabb: Aabb,
    pub billboard: BillboardMode,
    pub shadow: CastShadow,
    pub layer: Layers,
}

impl ParticleSystem {
    pub fn new(surface: Surface) -> Self {
        Self {
            particles: Vec::new(),
            surface,
            transform: Transform::default(),
            aabb: Aabb::UNIT,
            billboard: BillboardMode::Enabled,
            shadow: CastShadow::Off,
            layer: Layers::LAYER_1,
        }
    }

    /// Recomputes `aabb` from particle positions, padded by their largest scale.
    pub fn compute_aabb(&mut self) {
        if self.particles.is_empty() {
            return;
        }
        let pad = self
            .particles
            .iter()
            .map(|p| p.scale.max_element())
            .fold(0.0f32, f32::max)
            * 0.5;
        let bounds = Aabb::from_points(self.particles.iter().map(|p| p.position));
        self.aabb = Aabb::new(bounds.min - Vec3::splat(pad), bounds.max + Vec3::splat(pad));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sprite_frames_walk_rows() {
        let mut sprite = Sprite::new(TextureId(1), 4, 2, MaterialConfig::default());
        assert_eq!(sprite.material.uv_scale, Vec2::new(0.25, 0.5));
        sprite.update(5.0);
        assert_eq!(sprite.current_frame_coord(), Vec2::new(0.25, 0.5));
        assert_eq!(sprite.material.uv_offset, Vec2::new(0.25, 0.5));
    }

    #[test]
    fn sprite_frame_wraps() {
        let mut sprite = Sprite::new(TextureId(1), 2, 2, MaterialConfig::default());
        sprite.update(3.5);
        sprite.update(1.0);
        assert!((sprite.current_frame - 0.5).abs() < 1e-6);
        sprite.update_ex(1, 3, 0.0);
        assert!((sprite.current_frame - 2.5).abs() < 1e-6);
    }

    #[test]
    fn particle_matrix_scales_before_translating() {
        let particle = Particle {
            position: Vec3::new(1.0, 0.0, 0.0),
            scale: Vec3::splat(2.0),
            ..Particle::default()
        };
        let p = particle.local_matrix().transform_point3(Vec3::X);
        assert!(p.abs_diff_eq(Vec3::new(3.0, 0.0, 0.0), 1e-6));
    }

    #[test]
    fn particle_bounds_include_scale() {
        let mesh = Mesh {
            handle: MeshHandle(1),
            vertex_count: 4,
            index_count: 6,
            aabb: Aabb::UNIT,
        };
        let mut system = ParticleSystem::new(Surface {
            mesh,
            material: Material::default(),
        });
        system.particles = vec![
            Particle {
                position: Vec3::new(-1.0, 0.0, 0.0),
                ..Particle::default()
            },
            Particle {
                position: Vec3::new(3.0, 2.0, 0.0),
                scale: Vec3::splat(4.0),
                ..Particle::default()
            },
        ];
        system.compute_aabb();
        assert_eq!(system.aabb.min, Vec3::new(-3.0, -2.0, -2.0));
        assert_eq!(system.aabb.max, Vec3::new(5.0, 4.0, 2.0));
    }
}

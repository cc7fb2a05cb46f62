use std::rc::Rc;

use glam::{Mat4, Vec3};

use super::shader_cache::{self, DefaultTextures, SHADER_LIGHT_COUNT};
use crate::gpu::{GraphicsDevice, MeshHandle};
use crate::math::{apply_billboard, translation_of, BillboardMode};
use crate::renderer::lights::{Light, LightId, LightStore};
use crate::renderer::material::{Material, MaterialShaderConfig};
use crate::renderer::objects::Particle;

/// Lights affecting one scene draw, in ascending id order.
pub type LightSlots = [Option<LightId>; SHADER_LIGHT_COUNT];

/// Particle array captured at submission, shared by the shadow and scene calls.
#[derive(Clone, Debug)]
pub struct ParticleBatch {
    pub mesh: MeshHandle,
    pub particles: Rc<[Particle]>,
    /// System transform applied after each particle's own matrix.
    pub base: Mat4,
    pub billboard: BillboardMode,
}

impl ParticleBatch {
    fn world(&self, particle: &Particle, view_pos: Vec3) -> Mat4 {
        apply_billboard(self.billboard, self.base * particle.local_matrix(), view_pos)
    }
}

/// Queued shadow-map draw for one light.
#[derive(Clone, Debug)]
pub enum ShadowDrawCall {
    Surface { mesh: MeshHandle, transform: Mat4 },
    Sprite { transform: Mat4 },
    Particles(ParticleBatch),
}

/// Matrices for the light being rendered.
pub(crate) struct ShadowView {
    pub view_proj: Mat4,
    /// Set for omni lights, which also write the distance to the light.
    pub light_pos: Option<Vec3>,
}

impl ShadowDrawCall {
    pub(crate) fn draw<D: GraphicsDevice>(&self, device: &mut D, view: &ShadowView) {
        match self {
            ShadowDrawCall::Surface { mesh, transform } => {
                set_shadow_matrices(device, view, transform);
                device.draw_mesh(*mesh);
            }
            ShadowDrawCall::Sprite { transform } => {
                set_shadow_matrices(device, view, transform);
                device.draw_quad();
            }
            ShadowDrawCall::Particles(batch) => {
                // Shadow casters are never billboarded toward the light.
                for particle in batch.particles.iter() {
                    let transform = batch.base * particle.local_matrix();
                    set_shadow_matrices(device, view, &transform);
                    device.draw_mesh(batch.mesh);
                }
            }
        }
    }
}

fn set_shadow_matrices<D: GraphicsDevice>(device: &mut D, view: &ShadowView, model: &Mat4) {
    if let Some(light_pos) = view.light_pos {
        device.set_uniform("viewPos", light_pos.into());
        device.set_uniform("matModel", (*model).into());
    }
    device.set_uniform("mvp", (view.view_proj * *model).into());
}

/// Queued scene draw, keyed by its material config in the scene batches.
#[derive(Clone, Debug)]
pub enum SceneDrawCall {
    Surface {
        mesh: MeshHandle,
        material: Material,
        transform: Mat4,
        lights: LightSlots,
    },
    Sprite {
        material: Material,
        transform: Mat4,
        lights: LightSlots,
    },
    Particles {
        batch: ParticleBatch,
        material: Material,
        lights: LightSlots,
    },
}

/// State shared by every draw of one scene batch.
pub(crate) struct SceneView<'a> {
    pub shader: MaterialShaderConfig,
    pub view_proj: Mat4,
    pub view_pos: Vec3,
    pub lights: &'a LightStore,
    pub defaults: &'a DefaultTextures,
}

impl SceneDrawCall {
    /// World transform used for depth sorting; particles have none.
    pub fn transform(&self) -> Option<&Mat4> {
        match self {
            SceneDrawCall::Surface { transform, .. } | SceneDrawCall::Sprite { transform, .. } => {
                Some(transform)
            }
            SceneDrawCall::Particles { .. } => None,
        }
    }

    pub(crate) fn draw<D: GraphicsDevice>(&self, device: &mut D, view: &SceneView<'_>) {
        match self {
            SceneDrawCall::Surface {
                mesh,
                material,
                transform,
                lights,
            } => {
                shader_cache::set_material(device, view.shader, material, view.defaults);
                shader_cache::set_model(device, transform, &view.view_proj);
                shader_cache::set_lights(device, view.shader, &resolve(view.lights, lights));
                device.draw_mesh(*mesh);
            }
            SceneDrawCall::Sprite {
                material,
                transform,
                lights,
            } => {
                shader_cache::set_material(device, view.shader, material, view.defaults);
                shader_cache::set_model(device, transform, &view.view_proj);
                shader_cache::set_lights(device, view.shader, &resolve(view.lights, lights));
                device.draw_quad();
            }
            SceneDrawCall::Particles {
                batch,
                material,
                lights,
            } => {
                let mut particles: Vec<&Particle> = batch.particles.iter().collect();
                particles.sort_by(|a, b| {
                    let da = a.position.distance_squared(view.view_pos);
                    let db = b.position.distance_squared(view.view_pos);
                    db.total_cmp(&da)
                });

                let resolved = resolve(view.lights, lights);
                let base = material.albedo.color;
                for particle in particles {
                    let mut material = *material;
                    material.albedo.color = modulate(base, particle.color);
                    let transform = batch.world(particle, view.view_pos);
                    shader_cache::set_material(device, view.shader, &material, view.defaults);
                    shader_cache::set_model(device, &transform, &view.view_proj);
                    shader_cache::set_lights(device, view.shader, &resolved);
                    device.draw_mesh(batch.mesh);
                }
            }
        }
    }

    pub(crate) fn distance_squared(&self, from: Vec3) -> Option<f32> {
        self.transform().map(|m| translation_of(m).distance_squared(from))
    }
}

fn resolve<'a>(store: &'a LightStore, slots: &LightSlots) -> [Option<&'a Light>; SHADER_LIGHT_COUNT] {
    (*slots).map(|slot| slot.and_then(|id| store.try_get(id)))
}

fn modulate(a: [u8; 4], b: [u8; 4]) -> [u8; 4] {
    std::array::from_fn(|i| ((a[i] as u16 * b[i] as u16) / 255) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modulate_multiplies_channels() {
        assert_eq!(modulate([255, 128, 0, 255], [255, 255, 255, 128]), [255, 128, 0, 128]);
    }

    #[test]
    fn particles_have_no_sort_transform() {
        let call = SceneDrawCall::Particles {
            batch: ParticleBatch {
                mesh: MeshHandle(1),
                particles: Rc::from(Vec::<Particle>::new()),
                base: Mat4::IDENTITY,
                billboard: BillboardMode::Disabled,
            },
            material: Material::default(),
            lights: [None; SHADER_LIGHT_COUNT],
        };
        assert!(call.transform().is_none());
        assert!(call.distance_squared(Vec3::ZERO).is_none());
    }
}

use std::collections::{BTreeSet, HashMap};

use glam::{Mat4, Vec3};
use log::{error, info};

use super::batches::BatchMap;
use crate::environment::{BloomMode, Environment};
use crate::error::Result;
use crate::gpu::{Attachment, GraphicsDevice, ProgramDesc, ProgramId, TextureId};
use crate::math::color_vec3;
use crate::renderer::lights::{Light, LightType};
use crate::renderer::material::{DiffuseMode, Material, MaterialConfig, MaterialFlags, MaterialShaderConfig};
use crate::renderer::shaders;

/// Number of lights a material program can shade at once.
pub const SHADER_LIGHT_COUNT: usize = 8;

/// Material programs keyed by their shader permutation.
///
/// Several [`MaterialConfig`]s that differ only in blend or cull state share
/// one program; it is freed when the last of them is unloaded.
#[derive(Debug, Default)]
pub struct ShaderVariantCache {
    programs: HashMap<MaterialShaderConfig, ProgramId>,
    registered: BTreeSet<MaterialConfig>,
}

impl ShaderVariantCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `config`, creates its batch bucket and compiles the program
    /// for its shader bits if none exists yet.
    pub fn load<D: GraphicsDevice, C>(
        &mut self,
        device: &mut D,
        batches: &mut BatchMap<MaterialConfig, C>,
        config: MaterialConfig,
    ) -> Result<()> {
        batches.add_batch(config);
        self.registered.insert(config);

        let shader = config.shader();
        if self.programs.contains_key(&shader) {
            return Ok(());
        }

        let desc = program_desc(shader);
        match device.compile_program(&desc) {
            Ok(program) => {
                info!("Compiled material program {:#010x}", shader.raw());
                self.programs.insert(shader, program);
                Ok(())
            }
            Err(err) => {
                error!("Material program {:#010x} failed to compile: {err}", shader.raw());
                Err(err)
            }
        }
    }

    /// Drops the bucket for `config` and frees the program once no other
    /// registered config uses it.
    pub fn unload<D: GraphicsDevice, C>(
        &mut self,
        device: &mut D,
        batches: &mut BatchMap<MaterialConfig, C>,
        config: MaterialConfig,
    ) {
        batches.erase_batch(config);
        if !self.registered.remove(&config) {
            return;
        }

        let shader = config.shader();
        let shared = self.registered.iter().any(|c| c.shader() == shader);
        if shared {
            return;
        }
        if let Some(program) = self.programs.remove(&shader) {
            device.delete_program(program);
            info!("Released material program {:#010x}", shader.raw());
        }
    }

    pub fn is_valid(&self, config: MaterialConfig) -> bool {
        self.programs.contains_key(&config.shader())
    }

    pub fn is_registered(&self, config: MaterialConfig) -> bool {
        self.registered.contains(&config)
    }

    pub fn program(&self, config: MaterialConfig) -> Option<ProgramId> {
        self.programs.get(&config.shader()).copied()
    }

    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    pub fn clear<D: GraphicsDevice>(&mut self, device: &mut D) {
        for (_, program) in self.programs.drain() {
            device.delete_program(program);
        }
        self.registered.clear();
    }
}

fn program_desc(shader: MaterialShaderConfig) -> ProgramDesc {
    let mut desc = ProgramDesc::new(
        format!("Material {:#010x}", shader.raw()),
        shaders::MATERIAL_VERT,
        shaders::MATERIAL_FRAG,
    );
    desc.vertex_defines = vertex_defines(shader);
    desc.fragment_defines = fragment_defines(shader);
    desc
}

pub(crate) fn vertex_defines(shader: MaterialShaderConfig) -> Vec<String> {
    let flags = shader.flags();
    let mut defines = Vec::new();
    if flags.contains(MaterialFlags::VERTEX_COLOR) {
        defines.push("VERTEX_COLOR".to_owned());
    }
    if shader.diffuse() == DiffuseMode::Unshaded {
        defines.push("DIFFUSE_UNSHADED".to_owned());
    } else {
        if flags.contains(MaterialFlags::RECEIVE_SHADOW) {
            defines.push("RECEIVE_SHADOW".to_owned());
        }
        if flags.contains(MaterialFlags::MAP_NORMAL) {
            defines.push("MAP_NORMAL".to_owned());
        }
    }
    defines
}

pub(crate) fn fragment_defines(shader: MaterialShaderConfig) -> Vec<String> {
    let flags = shader.flags();
    let mut defines = vec![shader.diffuse().define().to_owned()];
    if flags.contains(MaterialFlags::VERTEX_COLOR) {
        defines.push("VERTEX_COLOR".to_owned());
    }
    if shader.diffuse() == DiffuseMode::Unshaded {
        return defines;
    }

    if let Some(specular) = shader.specular().define() {
        defines.push(specular.to_owned());
    }
    for (flag, name) in [
        (MaterialFlags::RECEIVE_SHADOW, "RECEIVE_SHADOW"),
        (MaterialFlags::MAP_EMISSION, "MAP_EMISSION"),
        (MaterialFlags::MAP_NORMAL, "MAP_NORMAL"),
        (MaterialFlags::MAP_AO, "MAP_AO"),
        (MaterialFlags::SKY_IBL, "SKY_IBL"),
    ] {
        if flags.contains(flag) {
            defines.push(name.to_owned());
        }
    }
    defines
}

/// Fallback textures substituted for unset material maps.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DefaultTextures {
    pub white: TextureId,
    pub black: TextureId,
    pub normal: TextureId,
}

/// Per-batch uniforms shared by every draw of one material program.
pub(crate) fn set_environment<D: GraphicsDevice>(
    device: &mut D,
    shader: MaterialShaderConfig,
    env: &Environment,
    view_pos: Vec3,
) {
    let mut sky_ambient = false;
    if shader.flags().contains(MaterialFlags::SKY_IBL) {
        device.set_uniform("uHasSkybox", env.world.skybox.is_some().into());
        if let Some(sky) = &env.world.skybox {
            device.bind_texture("uCubeIrradiance", sky.irradiance);
            device.bind_texture("uCubePrefilter", sky.prefilter);
            device.bind_texture("uTexBrdfLUT", sky.brdf_lut);
            device.set_uniform("uQuatSkybox", sky.quat().into());
            sky_ambient = true;
        }
    }
    if !sky_ambient {
        device.set_uniform("uColAmbient", color_vec3(env.world.ambient).into());
    }
    if env.bloom.mode != BloomMode::Disabled {
        device.set_uniform("uBloomHdrThreshold", env.bloom.hdr_threshold.into());
    }
    device.set_uniform("uViewPos", view_pos.into());
}

pub(crate) fn set_material<D: GraphicsDevice>(
    device: &mut D,
    shader: MaterialShaderConfig,
    material: &Material,
    defaults: &DefaultTextures,
) {
    device.bind_texture("uTexAlbedo", material.albedo.texture.unwrap_or(defaults.white));
    device.set_uniform("uColAlbedo", crate::math::color_vec4(material.albedo.color).into());
    device.set_uniform("uTexCoordOffset", material.uv_offset.into());
    device.set_uniform("uTexCoordScale", material.uv_scale.into());

    if shader.diffuse() == DiffuseMode::Unshaded {
        return;
    }

    device.bind_texture("uTexMetalness", material.metalness.texture.unwrap_or(defaults.white));
    device.set_uniform("uValMetalness", material.metalness.factor.into());
    device.bind_texture("uTexRoughness", material.roughness.texture.unwrap_or(defaults.white));
    device.set_uniform("uValRoughness", material.roughness.factor.into());

    let flags = shader.flags();
    if flags.contains(MaterialFlags::MAP_EMISSION) {
        device.bind_texture("uTexEmission", material.emission.texture.unwrap_or(defaults.black));
        device.set_uniform("uColEmission", color_vec3(material.emission.color).into());
        device.set_uniform("uValEmissionEnergy", material.emission.energy.into());
    }
    if flags.contains(MaterialFlags::MAP_NORMAL) {
        device.bind_texture("uTexNormal", material.normal.texture.unwrap_or(defaults.normal));
    }
    if flags.contains(MaterialFlags::MAP_AO) {
        device.bind_texture("uTexAO", material.ao.texture.unwrap_or(defaults.white));
        device.set_uniform("uValAOLightAffect", material.ao.light_affect.into());
    }
}

/// Model and normal matrices plus the final MVP.
pub(crate) fn set_model<D: GraphicsDevice>(device: &mut D, model: &Mat4, view_proj: &Mat4) {
    device.set_uniform("uMatModel", (*model).into());
    device.set_uniform("uMatNormal", model.inverse().transpose().into());
    device.set_uniform("uMatMVP", (*view_proj * *model).into());
}

/// Streams every light slot; empty and disabled slots are switched off.
pub(crate) fn set_lights<D: GraphicsDevice>(
    device: &mut D,
    shader: MaterialShaderConfig,
    lights: &[Option<&Light>; SHADER_LIGHT_COUNT],
) {
    if shader.diffuse() == DiffuseMode::Unshaded {
        return;
    }
    let receive_shadow = shader.flags().contains(MaterialFlags::RECEIVE_SHADOW);

    for (i, slot) in lights.iter().enumerate() {
        let name = |field: &str| format!("uLights[{i}].{field}");

        let Some(light) = (*slot).filter(|l| l.is_enabled()) else {
            device.set_uniform(&name("enabled"), false.into());
            continue;
        };

        device.set_uniform(&name("enabled"), true.into());
        device.set_uniform(&name("color"), color_vec3(light.color()).into());
        device.set_uniform(&name("energy"), light.energy().into());
        device.set_uniform(&name("kind"), light.kind().as_uniform().into());

        let shadow = receive_shadow && light.shadow_enabled();
        if receive_shadow {
            device.set_uniform(&name("shadow"), light.shadow_enabled().into());
            if light.shadow_enabled() {
                device.set_uniform(&name("shadowBias"), light.shadow_bias().into());
            }
        }

        match light.kind() {
            LightType::Directional | LightType::Spot => {
                device.set_uniform(&name("direction"), light.direction().into());
                if light.kind() == LightType::Spot {
                    let (inner, outer) = light.cutoff_cosines();
                    device.set_uniform(&name("position"), light.position().into());
                    device.set_uniform(&name("maxDistance"), light.max_distance().into());
                    device.set_uniform(&name("attenuation"), light.attenuation().into());
                    device.set_uniform(&name("innerCutOff"), inner.into());
                    device.set_uniform(&name("outerCutOff"), outer.into());
                }
                if let Some(map) = light.shadow_map().filter(|_| shadow) {
                    device.set_uniform(&format!("uMatLightMVP[{i}]"), light.view_proj().into());
                    device.set_uniform(&name("shadowMapTxlSz"), map.texel_width().into());
                    if let Some(depth) = map.attachment(Attachment::DEPTH) {
                        device.bind_texture(&name("shadowMap"), depth);
                    }
                }
            }
            LightType::Omni => {
                device.set_uniform(&name("position"), light.position().into());
                device.set_uniform(&name("maxDistance"), light.max_distance().into());
                device.set_uniform(&name("attenuation"), light.attenuation().into());
                if let Some(map) = light.shadow_map().filter(|_| shadow) {
                    if let Some(cube) = map.attachment(Attachment::COLOR_0) {
                        device.bind_texture(&name("shadowCubemap"), cube);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::HeadlessDevice;
    use crate::renderer::material::{BlendMode, CullMode, SpecularMode};

    fn shader(diffuse: DiffuseMode, specular: SpecularMode, flags: MaterialFlags) -> MaterialShaderConfig {
        MaterialShaderConfig::new(diffuse, specular, flags)
    }

    #[test]
    fn unshaded_skips_lighting_defines() {
        let s = shader(
            DiffuseMode::Unshaded,
            SpecularMode::SchlickGgx,
            MaterialFlags::all(),
        );
        assert_eq!(vertex_defines(s), vec!["VERTEX_COLOR", "DIFFUSE_UNSHADED"]);
        assert_eq!(fragment_defines(s), vec!["DIFFUSE_UNSHADED", "VERTEX_COLOR"]);
    }

    #[test]
    fn shaded_defines_follow_flags() {
        let s = shader(
            DiffuseMode::Lambert,
            SpecularMode::Disabled,
            MaterialFlags::RECEIVE_SHADOW | MaterialFlags::MAP_AO,
        );
        assert_eq!(vertex_defines(s), vec!["RECEIVE_SHADOW"]);
        assert_eq!(
            fragment_defines(s),
            vec!["DIFFUSE_LAMBERT", "RECEIVE_SHADOW", "MAP_AO"]
        );

        let s = shader(DiffuseMode::Toon, SpecularMode::BlinnPhong, MaterialFlags::MAP_NORMAL);
        assert_eq!(vertex_defines(s), vec!["MAP_NORMAL"]);
        assert_eq!(
            fragment_defines(s),
            vec!["DIFFUSE_TOON", "SPECULAR_BLINN_PHONG", "MAP_NORMAL"]
        );
    }

    #[test]
    fn shared_program_survives_partial_unload() {
        let mut device = HeadlessDevice::default();
        let mut batches: BatchMap<MaterialConfig, ()> = BatchMap::new();
        let mut cache = ShaderVariantCache::new();

        let a = MaterialConfig::default();
        let b = a.with_cull(CullMode::Disabled).with_blend(BlendMode::Additive);
        cache.load(&mut device, &mut batches, a).unwrap();
        cache.load(&mut device, &mut batches, b).unwrap();
        assert_eq!(cache.program_count(), 1);
        assert_eq!(device.compiled_program_count(), 1);

        cache.unload(&mut device, &mut batches, a);
        assert!(cache.is_valid(b));
        assert!(!batches.is_batch_exist(a));
        assert!(batches.is_batch_exist(b));

        cache.unload(&mut device, &mut batches, b);
        assert!(!cache.is_valid(b));
        assert_eq!(device.live_program_count(), 0);
    }

    #[test]
    fn failed_compile_leaves_config_invalid() {
        let mut device = HeadlessDevice::default();
        device.fail_programs_with_define("MAP_AO");
        let mut batches: BatchMap<MaterialConfig, ()> = BatchMap::new();
        let mut cache = ShaderVariantCache::new();

        let config = MaterialConfig::default().with_shader(
            MaterialShaderConfig::default().with_flags(MaterialFlags::MAP_AO),
        );
        assert!(cache.load(&mut device, &mut batches, config).is_err());
        assert!(!cache.is_valid(config));
        assert!(cache.is_registered(config));
    }
}

use glam::{EulerRot, Quat, Vec3};

use crate::gpu::TextureId;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BloomMode {
    #[default]
    Disabled,
    Additive,
    SoftLight,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FogMode {
    #[default]
    Disabled,
    /// Uses `start`/`end`.
    Linear,
    /// Uses `density`.
    Exp2,
    Exp,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Tonemap {
    #[default]
    Linear,
    Reinhard,
    Filmic,
    Aces,
}

impl BloomMode {
    pub(crate) fn as_uniform(self) -> i32 {
        self as i32
    }
}

impl FogMode {
    pub(crate) fn as_uniform(self) -> i32 {
        self as i32
    }
}

impl Tonemap {
    pub(crate) fn as_uniform(self) -> i32 {
        self as i32
    }
}

/// Precomputed sky textures. Generation happens outside the renderer; only
/// the handles are consumed here.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Skybox {
    pub cubemap: TextureId,
    pub irradiance: TextureId,
    pub prefilter: TextureId,
    pub brdf_lut: TextureId,
    /// Euler rotation in degrees.
    pub rotation: Vec3,
}

impl Skybox {
    pub fn new(cubemap: TextureId, irradiance: TextureId, prefilter: TextureId, brdf_lut: TextureId) -> Self {
        Self {
            cubemap,
            irradiance,
            prefilter,
            brdf_lut,
            rotation: Vec3::ZERO,
        }
    }

    pub fn quat(&self) -> Quat {
        let r = self.rotation * (std::f32::consts::PI / 180.0);
        Quat::from_euler(EulerRot::ZYX, r.z, r.y, r.x)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bloom {
    pub mode: BloomMode,
    pub intensity: f32,
    pub hdr_threshold: f32,
    pub iterations: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Fog {
    pub mode: FogMode,
    pub color: [u8; 4],
    pub start: f32,
    pub end: f32,
    pub density: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ToneMapping {
    pub mode: Tonemap,
    pub exposure: f32,
    pub white: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Adjustments {
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct World {
    pub skybox: Option<Skybox>,
    pub background: [u8; 4],
    pub ambient: [u8; 4],
}

/// Global scene parameters, read every frame by the scene and post-FX passes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Environment {
    pub bloom: Bloom,
    pub fog: Fog,
    pub tonemap: ToneMapping,
    pub adjustments: Adjustments,
    pub world: World,
}

const GRAY: [u8; 4] = [130, 130, 130, 255];
const DARK_GRAY: [u8; 4] = [80, 80, 80, 255];

impl Default for Environment {
    fn default() -> Self {
        Self {
            bloom: Bloom {
                mode: BloomMode::Disabled,
                intensity: 1.0,
                hdr_threshold: 1.0,
                iterations: 10,
            },
            fog: Fog {
                mode: FogMode::Disabled,
                color: GRAY,
                start: 10.0,
                end: 30.0,
                density: 0.1,
            },
            tonemap: ToneMapping {
                mode: Tonemap::Linear,
                exposure: 1.0,
                white: 1.0,
            },
            adjustments: Adjustments {
                brightness: 1.0,
                contrast: 1.0,
                saturation: 1.0,
            },
            world: World {
                skybox: None,
                background: DARK_GRAY,
                ambient: DARK_GRAY,
            },
        }
    }
}

macro_rules! env_field {
    ($get:ident, $set:ident, $with:ident, $($path:ident).+ : $ty:ty) => {
        pub fn $get(&self) -> $ty {
            self.$($path).+
        }

        pub fn $set(&mut self, value: $ty) {
            self.$($path).+ = value;
        }

        pub fn $with(mut self, value: $ty) -> Self {
            self.$($path).+ = value;
            self
        }
    };
}

impl Environment {
    env_field!(bloom_mode, set_bloom_mode, with_bloom_mode, bloom.mode: BloomMode);
    env_field!(bloom_intensity, set_bloom_intensity, with_bloom_intensity, bloom.intensity: f32);
    env_field!(bloom_hdr_threshold, set_bloom_hdr_threshold, with_bloom_hdr_threshold, bloom.hdr_threshold: f32);
    env_field!(bloom_iterations, set_bloom_iterations, with_bloom_iterations, bloom.iterations: u32);

    env_field!(fog_mode, set_fog_mode, with_fog_mode, fog.mode: FogMode);
    env_field!(fog_color, set_fog_color, with_fog_color, fog.color: [u8; 4]);
    env_field!(fog_start, set_fog_start, with_fog_start, fog.start: f32);
    env_field!(fog_end, set_fog_end, with_fog_end, fog.end: f32);
    env_field!(fog_density, set_fog_density, with_fog_density, fog.density: f32);

    env_field!(tonemap_mode, set_tonemap_mode, with_tonemap_mode, tonemap.mode: Tonemap);
    env_field!(tonemap_exposure, set_tonemap_exposure, with_tonemap_exposure, tonemap.exposure: f32);
    env_field!(tonemap_white, set_tonemap_white, with_tonemap_white, tonemap.white: f32);

    env_field!(brightness, set_brightness, with_brightness, adjustments.brightness: f32);
    env_field!(contrast, set_contrast, with_contrast, adjustments.contrast: f32);
    env_field!(saturation, set_saturation, with_saturation, adjustments.saturation: f32);

    env_field!(skybox, set_skybox, with_skybox, world.skybox: Option<Skybox>);
    env_field!(background, set_background, with_background, world.background: [u8; 4]);
    env_field!(ambient, set_ambient, with_ambient, world.ambient: [u8; 4]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_values() {
        let env = Environment::default();
        assert_eq!(env.bloom_mode(), BloomMode::Disabled);
        assert_eq!(env.bloom_iterations(), 10);
        assert_eq!(env.fog_color(), [130, 130, 130, 255]);
        assert_eq!(env.fog_start(), 10.0);
        assert_eq!(env.fog_end(), 30.0);
        assert_eq!(env.tonemap_mode(), Tonemap::Linear);
        assert_eq!(env.background(), [80, 80, 80, 255]);
        assert!(env.skybox().is_none());
    }

    #[test]
    fn uniform_indices_follow_shader_constants() {
        assert_eq!(BloomMode::SoftLight.as_uniform(), 2);
        assert_eq!(FogMode::Linear.as_uniform(), 1);
        assert_eq!(FogMode::Exp.as_uniform(), 3);
        assert_eq!(Tonemap::Aces.as_uniform(), 3);
    }

    #[test]
    fn builders_and_setters_agree() {
        let a = Environment::default().with_fog_mode(FogMode::Exp2).with_fog_density(0.3);
        let mut b = Environment::default();
        b.set_fog_mode(FogMode::Exp2);
        b.set_fog_density(0.3);
        assert_eq!(a, b);
    }

    #[test]
    fn skybox_rotation_about_y() {
        let mut sky = Skybox::new(TextureId(1), TextureId(2), TextureId(3), TextureId(4));
        sky.rotation = Vec3::new(0.0, 90.0, 0.0);
        let v = sky.quat() * Vec3::Z;
        assert!(v.abs_diff_eq(Vec3::X, 1e-5));
    }
}

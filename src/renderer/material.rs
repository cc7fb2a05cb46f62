// renderer/material.rs

use bitflags::bitflags;
use glam::Vec2;

use crate::gpu::{BlendEquation, CullFace, TextureId};

macro_rules! packed_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:literal),+ $(,)? } default $default:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u8)]
        pub enum $name {
            $($variant = $value,)+
        }

        impl $name {
            pub const DEFAULT: Self = Self::$default;

            pub fn from_u8(value: u8) -> Option<Self> {
                match value {
                    $($value => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::DEFAULT
            }
        }
    };
}

packed_enum!(
    /// Diffuse lighting model.
    DiffuseMode {
        Unshaded = 0,
        Burley = 1,
        Disney = 2,
        Lambert = 3,
        Phong = 4,
        Toon = 5,
    } default Burley
);

packed_enum!(
    /// Specular lighting model.
    SpecularMode {
        Disabled = 0,
        SchlickGgx = 1,
        Disney = 2,
        BlinnPhong = 3,
        Toon = 4,
    } default SchlickGgx
);

packed_enum!(
    BlendMode {
        Disabled = 0,
        Alpha = 1,
        Additive = 2,
        Multiplied = 3,
        AddColors = 4,
        SubtractColors = 5,
        AlphaPremultiply = 6,
    } default Alpha
);

packed_enum!(
    CullMode {
        Disabled = 0,
        Front = 1,
        Back = 2,
    } default Back
);

packed_enum!(
    /// How a model takes part in the shadow and scene passes.
    CastShadow {
        Off = 0,
        On = 1,
        ShadowOnly = 2,
    } default On
);

impl DiffuseMode {
    pub(crate) fn define(self) -> &'static str {
        match self {
            DiffuseMode::Unshaded => "DIFFUSE_UNSHADED",
            DiffuseMode::Burley => "DIFFUSE_BURLEY",
            DiffuseMode::Disney => "DIFFUSE_DISNEY",
            DiffuseMode::Lambert => "DIFFUSE_LAMBERT",
            DiffuseMode::Phong => "DIFFUSE_PHONG",
            DiffuseMode::Toon => "DIFFUSE_TOON",
        }
    }
}

impl SpecularMode {
    pub(crate) fn define(self) -> Option<&'static str> {
        match self {
            SpecularMode::Disabled => None,
            SpecularMode::SchlickGgx => Some("SPECULAR_SCHLICK_GGX"),
            SpecularMode::Disney => Some("SPECULAR_DISNEY"),
            SpecularMode::BlinnPhong => Some("SPECULAR_BLINN_PHONG"),
            SpecularMode::Toon => Some("SPECULAR_TOON"),
        }
    }
}

impl BlendMode {
    /// Device blend equation, `None` when blending is disabled.
    pub fn equation(self) -> Option<BlendEquation> {
        match self {
            BlendMode::Disabled => None,
            BlendMode::Alpha => Some(BlendEquation::Alpha),
            BlendMode::Additive => Some(BlendEquation::Additive),
            BlendMode::Multiplied => Some(BlendEquation::Multiplied),
            BlendMode::AddColors => Some(BlendEquation::AddColors),
            BlendMode::SubtractColors => Some(BlendEquation::SubtractColors),
            BlendMode::AlphaPremultiply => Some(BlendEquation::AlphaPremultiply),
        }
    }
}

impl CullMode {
    pub fn face(self) -> Option<CullFace> {
        match self {
            CullMode::Disabled => None,
            CullMode::Front => Some(CullFace::Front),
            CullMode::Back => Some(CullFace::Back),
        }
    }
}

bitflags! {
    /// Per-material shader features.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct MaterialFlags: u8 {
        const VERTEX_COLOR = 1 << 0;
        const RECEIVE_SHADOW = 1 << 1;
        const MAP_EMISSION = 1 << 2;
        const MAP_NORMAL = 1 << 3;
        const MAP_AO = 1 << 4;
        const SKY_IBL = 1 << 5;
    }
}

/// Shader permutation key: diffuse in byte 0, specular in byte 1, flags in byte 3.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialShaderConfig(u32);

impl MaterialShaderConfig {
    pub const fn new(diffuse: DiffuseMode, specular: SpecularMode, flags: MaterialFlags) -> Self {
        Self(diffuse as u32 | (specular as u32) << 8 | (flags.bits() as u32) << 24)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn diffuse(self) -> DiffuseMode {
        DiffuseMode::from_u8((self.0 & 0xFF) as u8).unwrap_or(DiffuseMode::DEFAULT)
    }

    pub fn specular(self) -> SpecularMode {
        SpecularMode::from_u8(((self.0 >> 8) & 0xFF) as u8).unwrap_or(SpecularMode::DEFAULT)
    }

    pub fn flags(self) -> MaterialFlags {
        MaterialFlags::from_bits_truncate((self.0 >> 24) as u8)
    }

    pub fn with_diffuse(self, diffuse: DiffuseMode) -> Self {
        Self::new(diffuse, self.specular(), self.flags())
    }

    pub fn with_specular(self, specular: SpecularMode) -> Self {
        Self::new(self.diffuse(), specular, self.flags())
    }

    pub fn with_flags(self, flags: MaterialFlags) -> Self {
        Self::new(self.diffuse(), self.specular(), flags)
    }
}

impl Default for MaterialShaderConfig {
    fn default() -> Self {
        Self::new(
            DiffuseMode::Burley,
            SpecularMode::SchlickGgx,
            MaterialFlags::RECEIVE_SHADOW | MaterialFlags::SKY_IBL,
        )
    }
}

/// Full material key: shader bits in 0..32, blend in 32..40, cull in 40..48.
///
/// Ordering is over the packed integer, which makes it the scene batch order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialConfig(u64);

impl MaterialConfig {
    pub const fn new(shader: MaterialShaderConfig, blend: BlendMode, cull: CullMode) -> Self {
        Self(shader.raw() as u64 | (blend as u64) << 32 | (cull as u64) << 40)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn shader(self) -> MaterialShaderConfig {
        MaterialShaderConfig::from_raw(self.0 as u32)
    }

    pub fn blend(self) -> BlendMode {
        BlendMode::from_u8(((self.0 >> 32) & 0xFF) as u8).unwrap_or(BlendMode::DEFAULT)
    }

    pub fn cull(self) -> CullMode {
        CullMode::from_u8(((self.0 >> 40) & 0xFF) as u8).unwrap_or(CullMode::DEFAULT)
    }

    pub fn with_shader(self, shader: MaterialShaderConfig) -> Self {
        Self::new(shader, self.blend(), self.cull())
    }

    pub fn with_blend(self, blend: BlendMode) -> Self {
        Self::new(self.shader(), blend, self.cull())
    }

    pub fn with_cull(self, cull: CullMode) -> Self {
        Self::new(self.shader(), self.blend(), cull)
    }
}

impl Default for MaterialConfig {
    fn default() -> Self {
        Self::new(MaterialShaderConfig::default(), BlendMode::Alpha, CullMode::Back)
    }
}

/// Texture maps left as `None` are substituted by the renderer: white for
/// albedo, metalness, roughness and AO, black for emission, flat for normals.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AlbedoMap {
    pub texture: Option<TextureId>,
    pub color: [u8; 4],
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FactorMap {
    pub texture: Option<TextureId>,
    pub factor: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EmissionMap {
    pub texture: Option<TextureId>,
    pub color: [u8; 4],
    pub energy: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NormalMap {
    pub texture: Option<TextureId>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OcclusionMap {
    pub texture: Option<TextureId>,
    pub light_affect: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Material {
    pub albedo: AlbedoMap,
    pub metalness: FactorMap,
    pub roughness: FactorMap,
    pub emission: EmissionMap,
    pub normal: NormalMap,
    pub ao: OcclusionMap,
    pub uv_offset: Vec2,
    pub uv_scale: Vec2,
    pub config: MaterialConfig,
}

impl Material {
    pub fn new(config: MaterialConfig) -> Self {
        Self {
            albedo: AlbedoMap {
                texture: None,
                color: [255; 4],
            },
            metalness: FactorMap {
                texture: None,
                factor: 0.0,
            },
            roughness: FactorMap {
                texture: None,
                factor: 1.0,
            },
            emission: EmissionMap {
                texture: None,
                color: [0, 0, 0, 255],
                energy: 0.0,
            },
            normal: NormalMap::default(),
            ao: OcclusionMap {
                texture: None,
                light_affect: 0.0,
            },
            uv_offset: Vec2::ZERO,
            uv_scale: Vec2::ONE,
            config,
        }
    }

    pub fn with_albedo(mut self, texture: Option<TextureId>, color: [u8; 4]) -> Self {
        self.albedo = AlbedoMap { texture, color };
        self
    }

    pub fn with_metalness(mut self, factor: f32) -> Self {
        self.metalness.factor = factor.clamp(0.0, 1.0);
        self
    }

    pub fn with_roughness(mut self, factor: f32) -> Self {
        self.roughness.factor = factor.clamp(0.0, 1.0);
        self
    }

    pub fn with_emission(mut self, texture: Option<TextureId>, color: [u8; 4], energy: f32) -> Self {
        self.emission = EmissionMap {
            texture,
            color,
            energy,
        };
        self
    }
}

impl Default for Material {
    fn default() -> Self {
        Self::new(MaterialConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shader_config_packs_bytes() {
        let cfg = MaterialShaderConfig::new(
            DiffuseMode::Toon,
            SpecularMode::BlinnPhong,
            MaterialFlags::MAP_AO | MaterialFlags::VERTEX_COLOR,
        );
        assert_eq!(cfg.raw() & 0xFF, 5);
        assert_eq!((cfg.raw() >> 8) & 0xFF, 3);
        assert_eq!((cfg.raw() >> 16) & 0xFF, 0);
        assert_eq!(cfg.raw() >> 24, 0b1_0001);
        assert_eq!(cfg.diffuse(), DiffuseMode::Toon);
        assert_eq!(cfg.specular(), SpecularMode::BlinnPhong);
        assert_eq!(cfg.flags(), MaterialFlags::MAP_AO | MaterialFlags::VERTEX_COLOR);
    }

    #[test]
    fn material_config_keeps_shader_bits_in_low_word() {
        let shader = MaterialShaderConfig::default();
        let cfg = MaterialConfig::new(shader, BlendMode::Additive, CullMode::Front);
        assert_eq!(cfg.shader(), shader);
        assert_eq!(cfg.blend(), BlendMode::Additive);
        assert_eq!(cfg.cull(), CullMode::Front);
        assert_eq!(cfg.raw() >> 48, 0);

        let other = cfg.with_blend(BlendMode::Disabled);
        assert_eq!(other.shader(), cfg.shader());
        assert_ne!(other, cfg);
    }

    #[test]
    fn default_config_matches_engine_default() {
        let cfg = MaterialConfig::default();
        assert_eq!(cfg.shader().diffuse(), DiffuseMode::Burley);
        assert_eq!(cfg.shader().specular(), SpecularMode::SchlickGgx);
        assert_eq!(
            cfg.shader().flags(),
            MaterialFlags::RECEIVE_SHADOW | MaterialFlags::SKY_IBL
        );
        assert_eq!(cfg.blend().equation(), Some(BlendEquation::Alpha));
        assert_eq!(cfg.cull().face(), Some(CullFace::Back));
    }

    #[test]
    fn configs_order_by_packed_value() {
        let a = MaterialConfig::from_raw(1);
        let b = MaterialConfig::from_raw(1 << 40);
        assert!(a < b);
    }
}

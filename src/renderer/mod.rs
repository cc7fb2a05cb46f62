pub mod camera;
pub mod internal;
pub mod lights;
pub mod material;
pub mod objects;
pub mod render_target;
#[allow(clippy::module_inception)]
pub mod renderer;
pub mod shaders;

pub use camera::{Camera, Projection};
pub use internal::{BatchMap, ShaderVariantCache, SHADER_LIGHT_COUNT};
pub use lights::{Layers, Light, LightId, LightStore, LightType};
pub use material::{
    AlbedoMap, BlendMode, CastShadow, CullMode, DiffuseMode, EmissionMap, FactorMap, Material,
    MaterialConfig, MaterialFlags, MaterialShaderConfig, NormalMap, OcclusionMap, SpecularMode,
};
pub use objects::{Mesh, Model, Particle, ParticleSystem, Sprite, Surface};
pub use render_target::{letterbox, RenderTarget, RenderTargetHandle};
pub use renderer::{DepthSortingOrder, InitFlags, Renderer};

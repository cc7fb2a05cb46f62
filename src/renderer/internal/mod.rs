pub mod batches;
pub mod draw_call;
pub(crate) mod id_pool;
pub mod shader_cache;

pub use batches::BatchMap;
pub use draw_call::{LightSlots, ParticleBatch, SceneDrawCall, ShadowDrawCall};
pub use shader_cache::{ShaderVariantCache, SHADER_LIGHT_COUNT};

//! Forward renderer with a fixed frame graph: shadow maps, an HDR scene pass,
//! bloom, post-processing and a final blit, driven through the
//! [`gpu::GraphicsDevice`] seam.

pub mod environment;
pub mod error;
pub mod gpu;
pub mod math;
pub mod renderer;
pub mod settings;

pub use environment::Environment;
pub use error::{RenderError, Result};
pub use renderer::{
    Camera, DepthSortingOrder, InitFlags, Layers, LightId, LightType, Material, MaterialConfig,
    Model, ParticleSystem, RenderTarget, RenderTargetHandle, Renderer, Sprite,
};
pub use settings::RenderSettings;

#[cfg(target_arch = "wasm32")]
pub fn init_logging() {
    std::panic::set_hook(Box::new(console_error_panic_hook::hook));
    let _ = console_log::init_with_level(log::Level::Info);
}

/// Installs the `env_logger` backend; later calls are no-ops.
#[cfg(not(target_arch = "wasm32"))]
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .try_init();
}

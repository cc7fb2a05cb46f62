use crate::error::{RenderError, Result};

/// Device and queue plus the optional features the backend relies on.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub border_clamp: bool,
}

impl GpuContext {
    /// Requests an adapter without a surface, for offscreen rendering.
    pub async fn new_headless() -> Result<Self> {
        let backends = if cfg!(target_arch = "wasm32") {
            wgpu::Backends::BROWSER_WEBGPU | wgpu::Backends::GL
        } else {
            wgpu::Backends::all()
        };
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|_| RenderError::NoAdapter)?;
        Self::from_adapter(&adapter).await
    }

    pub async fn from_adapter(adapter: &wgpu::Adapter) -> Result<Self> {
        log::info!("Using adapter: {:?}", adapter.get_info());
        let adapter_features = adapter.features();

        let mut required_features = wgpu::Features::empty();
        let border_clamp = adapter_features.contains(wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER);
        if border_clamp {
            required_features |= wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER;
        } else {
            log::warn!("Clamp-to-border sampling not supported, falling back to clamp-to-edge");
        }

        // The material fragment stage samples more textures than the default limit allows.
        let adapter_limits = adapter.limits();
        let mut limits = wgpu::Limits::default();
        limits.max_sampled_textures_per_shader_stage = adapter_limits
            .max_sampled_textures_per_shader_stage
            .max(limits.max_sampled_textures_per_shader_stage);
        limits.max_samplers_per_shader_stage = adapter_limits
            .max_samplers_per_shader_stage
            .max(limits.max_samplers_per_shader_stage);

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Device"),
                required_features,
                required_limits: limits,
                experimental_features: wgpu::ExperimentalFeatures::disabled(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|e| RenderError::RequestDevice(e.to_string()))?;

        Ok(Self {
            device,
            queue,
            border_clamp,
        })
    }
}

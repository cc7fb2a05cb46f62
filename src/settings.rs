use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::renderer::{DepthSortingOrder, InitFlags, Layers};

/// Startup configuration for [`crate::Renderer::from_settings`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderSettings {
    /// 0 means the screen width.
    #[serde(default)]
    pub internal_width: u32,
    #[serde(default)]
    pub internal_height: u32,
    #[serde(default = "RenderSettings::default_screen_width")]
    pub screen_width: u32,
    #[serde(default = "RenderSettings::default_screen_height")]
    pub screen_height: u32,
    #[serde(default)]
    pub blit_linear: bool,
    #[serde(default)]
    pub aspect_keep: bool,
    #[serde(default = "RenderSettings::default_frustum_culling")]
    pub frustum_culling: bool,
    #[serde(default)]
    pub debug_shadow_map: bool,
    /// Seconds between shadow map refreshes, 0 refreshes every frame.
    #[serde(default)]
    pub shadow_update_interval: f32,
    #[serde(default)]
    pub depth_sorting: DepthSortingOrder,
    #[serde(default = "RenderSettings::default_active_layers")]
    pub active_layers: u16,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            internal_width: 0,
            internal_height: 0,
            screen_width: Self::default_screen_width(),
            screen_height: Self::default_screen_height(),
            blit_linear: false,
            aspect_keep: false,
            frustum_culling: Self::default_frustum_culling(),
            debug_shadow_map: false,
            shadow_update_interval: 0.0,
            depth_sorting: DepthSortingOrder::default(),
            active_layers: Self::default_active_layers(),
        }
    }
}

impl RenderSettings {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let settings: RenderSettings = serde_json::from_str(json)?;
        Ok(settings.validate())
    }

    #[cfg(not(target_arch = "wasm32"))]
    pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(contents) => match Self::from_json_str(&contents) {
                Ok(settings) => {
                    info!("Loaded render settings from {:?}", path);
                    settings
                }
                Err(err) => {
                    warn!(
                        "Failed to parse {:?} ({}). Falling back to default render settings.",
                        path, err
                    );
                    RenderSettings::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "Render settings file {:?} not found. Using default settings.",
                    path
                );
                RenderSettings::default()
            }
            Err(err) => {
                warn!(
                    "Failed to read {:?} ({}). Falling back to default render settings.",
                    path, err
                );
                RenderSettings::default()
            }
        }
    }

    pub fn validate(mut self) -> Self {
        if self.screen_width == 0 || self.screen_height == 0 {
            warn!("Screen size must be greater than zero. Using default size.");
            self.screen_width = Self::default_screen_width();
            self.screen_height = Self::default_screen_height();
        }

        if !self.shadow_update_interval.is_finite() || self.shadow_update_interval < 0.0 {
            warn!("Shadow update interval must be a non-negative number. Updating every frame.");
            self.shadow_update_interval = 0.0;
        }

        if self.active_layers == 0 {
            warn!("No active layer configured. Enabling layer 1.");
            self.active_layers = Self::default_active_layers();
        }

        self
    }

    pub fn init_flags(&self) -> InitFlags {
        let mut flags = InitFlags::empty();
        flags.set(InitFlags::BLIT_LINEAR, self.blit_linear);
        flags.set(InitFlags::ASPECT_KEEP, self.aspect_keep);
        flags.set(InitFlags::NO_FRUSTUM_CULLING, !self.frustum_culling);
        flags.set(InitFlags::DEBUG_SHADOW_MAP, self.debug_shadow_map);
        flags
    }

    pub fn layers(&self) -> Layers {
        Layers::from_bits_truncate(self.active_layers)
    }

    const fn default_screen_width() -> u32 {
        800
    }

    const fn default_screen_height() -> u32 {
        600
    }

    const fn default_frustum_culling() -> bool {
        true
    }

    const fn default_active_layers() -> u16 {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let settings = RenderSettings::from_json_str("{}").unwrap();
        assert_eq!(settings, RenderSettings::default());
        assert_eq!(settings.init_flags(), InitFlags::empty());
        assert_eq!(settings.layers(), Layers::LAYER_1);
    }

    #[test]
    fn flags_follow_toggles() {
        let settings = RenderSettings::from_json_str(
            r#"{ "blit_linear": true, "frustum_culling": false, "depth_sorting": "FarToNear" }"#,
        )
        .unwrap();
        let flags = settings.init_flags();
        assert!(flags.contains(InitFlags::BLIT_LINEAR | InitFlags::NO_FRUSTUM_CULLING));
        assert!(!flags.contains(InitFlags::ASPECT_KEEP));
        assert_eq!(settings.depth_sorting, DepthSortingOrder::FarToNear);
    }

    #[test]
    fn validate_repairs_bad_values() {
        let settings = RenderSettings::from_json_str(
            r#"{ "screen_width": 0, "shadow_update_interval": -2.0, "active_layers": 0 }"#,
        )
        .unwrap();
        assert_eq!(settings.screen_width, 800);
        assert_eq!(settings.shadow_update_interval, 0.0);
        assert_eq!(settings.active_layers, 1);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(RenderSettings::from_json_str("{ not json").is_err());
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[test]
    fn missing_file_falls_back_to_defaults() {
        let settings = RenderSettings::load_from_path("definitely/not/here.json");
        assert_eq!(settings, RenderSettings::default());
    }
}

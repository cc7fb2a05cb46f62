// renderer/renderer.rs
use std::cmp::Ordering;
use std::rc::Rc;

use bitflags::bitflags;
use glam::{Mat4, Vec2, Vec3};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::environment::{BloomMode, Environment, FogMode};
use crate::error::Result;
use crate::gpu::{
    Attachment, BlendEquation, CullFace, Filter, FramebufferTarget, GraphicsDevice, ProgramDesc,
    ProgramId, Rect, TextureDesc, TextureFormat, TextureId, Wrap,
};
use crate::math::{
    apply_billboard, color_vec3, color_vec4, rotation_axis_degrees, translation_of, Aabb,
    BillboardMode, Frustum, Transform,
};
use crate::renderer::camera::Camera;
use crate::renderer::internal::draw_call::{SceneView, ShadowView};
use crate::renderer::internal::shader_cache::{self, DefaultTextures};
use crate::renderer::internal::{
    BatchMap, LightSlots, ParticleBatch, SceneDrawCall, ShaderVariantCache, ShadowDrawCall,
    SHADER_LIGHT_COUNT,
};
use crate::renderer::lights::{Layers, Light, LightId, LightStore, LightType};
use crate::renderer::material::{CastShadow, MaterialConfig};
use crate::renderer::objects::{Model, ParticleSystem, Sprite};
use crate::renderer::render_target::{RenderTarget, RenderTargetHandle};
use crate::renderer::shaders;
use crate::settings::RenderSettings;

bitflags! {
    /// Options fixed at renderer creation. The blit and culling bits can be
    /// changed later through [`Renderer::set_blit_mode`] and
    /// [`Renderer::set_frustum_culling`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct InitFlags: u8 {
        /// Bilinear filtering on the final blit.
        const BLIT_LINEAR = 1 << 0;
        /// Letterbox the internal resolution into the destination.
        const ASPECT_KEEP = 1 << 1;
        const NO_FRUSTUM_CULLING = 1 << 2;
        /// Compiles the programs used by [`Renderer::draw_shadow_map`].
        const DEBUG_SHADOW_MAP = 1 << 3;
    }
}

/// Order of scene draw calls inside each material batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepthSortingOrder {
    #[default]
    Disabled,
    NearToFar,
    FarToNear,
}

/// Local bounds of the sprite quad.
const SPRITE_AABB: Aabb = Aabb {
    min: Vec3::new(-0.5, -0.5, 0.0),
    max: Vec3::new(0.5, 0.5, 0.0),
};

struct Programs {
    depth: ProgramId,
    depth_cube: ProgramId,
    blur: ProgramId,
    postfx: ProgramId,
    skybox: ProgramId,
}

struct DebugPrograms {
    depth: ProgramId,
    depth_cube: ProgramId,
}

/// Camera state captured by [`Renderer::begin`].
#[derive(Clone, Copy, Debug, Default)]
struct FrameCamera {
    position: Vec3,
    view: Mat4,
    proj: Mat4,
    view_proj: Mat4,
    frustum: Frustum,
    near: f32,
    far: f32,
}

/// Object placement resolved for one submission.
struct Placement {
    transform: Mat4,
    aabb: Aabb,
    layer: Layers,
    cast: CastShadow,
}

/// Forward renderer driven frame by frame through a [`GraphicsDevice`].
///
/// Between [`Renderer::begin`] and [`Renderer::present`] the `draw_*` calls
/// only record work into per-material and per-light batches. `present` plays
/// the batches back: shadow maps, the HDR scene, bloom, post-processing and
/// the final blit.
pub struct Renderer<D: GraphicsDevice> {
    device: D,
    flags: InitFlags,

    shader_cache: ShaderVariantCache,
    programs: Programs,
    debug_programs: Option<DebugPrograms>,
    defaults: DefaultTextures,
    default_config: MaterialConfig,

    scene_batches: BatchMap<MaterialConfig, SceneDrawCall>,
    shadow_batches: BatchMap<LightId, ShadowDrawCall>,
    lights: LightStore,

    scene_target: RenderTarget,
    postfx_target: RenderTarget,
    blur_targets: [RenderTarget; 2],
    custom_target: Option<RenderTargetHandle>,

    /// Requested internal size; 0 follows the screen.
    requested_size: (u32, u32),
    internal_size: (u32, u32),

    environment: Environment,
    camera: FrameCamera,
    external_transform: Mat4,
    depth_sorting: DepthSortingOrder,
    active_layers: Layers,

    shadow_interval: f32,
    shadow_timer: f32,
}

impl<D: GraphicsDevice> Renderer<D> {
    /// Builds every render target and fixed program. `width`/`height` set the
    /// internal resolution; 0 uses the screen size.
    pub fn new(mut device: D, width: u32, height: u32, flags: InitFlags) -> Result<Self> {
        let internal_size = resolve_internal_size(&device, (width, height));

        let programs = Programs {
            depth: device.compile_program(&ProgramDesc::new(
                "Shadow depth",
                shaders::DEPTH_VERT,
                shaders::DEPTH_FRAG,
            ))?,
            depth_cube: device.compile_program(&ProgramDesc::new(
                "Shadow distance cube",
                shaders::DEPTH_CUBE_VERT,
                shaders::DEPTH_CUBE_FRAG,
            ))?,
            blur: device.compile_program(&ProgramDesc::new(
                "Gaussian blur",
                shaders::FULLSCREEN_VERT,
                shaders::BLUR_FRAG,
            ))?,
            postfx: device.compile_program(&ProgramDesc::new(
                "Post-FX",
                shaders::FULLSCREEN_VERT,
                shaders::POSTFX_FRAG,
            ))?,
            skybox: device.compile_program(&ProgramDesc::new(
                "Skybox",
                shaders::SKYBOX_VERT,
                shaders::SKYBOX_FRAG,
            ))?,
        };

        let debug_programs = if flags.contains(InitFlags::DEBUG_SHADOW_MAP) {
            let mut cube = ProgramDesc::new(
                "Debug depth cube",
                shaders::DEBUG_DEPTH_VERT,
                shaders::DEBUG_DEPTH_FRAG,
            );
            cube.fragment_defines.push("DEPTH_CUBE".to_owned());
            Some(DebugPrograms {
                depth: device.compile_program(&ProgramDesc::new(
                    "Debug depth",
                    shaders::DEBUG_DEPTH_VERT,
                    shaders::DEBUG_DEPTH_FRAG,
                ))?,
                depth_cube: device.compile_program(&cube)?,
            })
        } else {
            None
        };

        let defaults = DefaultTextures {
            white: solid_texture(&mut device, [255, 255, 255, 255]),
            black: solid_texture(&mut device, [0, 0, 0, 255]),
            normal: solid_texture(&mut device, [128, 128, 255, 255]),
        };

        let (w, h) = internal_size;
        let scene_target = create_scene_target(&mut device, w, h);
        let postfx_target = create_postfx_target(&mut device, w, h);
        let blur_targets = [
            create_blur_target(&mut device, "Bloom ping", w, h),
            create_blur_target(&mut device, "Bloom pong", w, h),
        ];
        info!("Renderer created at {}x{} internal resolution", w, h);

        let mut renderer = Self {
            device,
            flags,
            shader_cache: ShaderVariantCache::new(),
            programs,
            debug_programs,
            defaults,
            default_config: MaterialConfig::default(),
            scene_batches: BatchMap::new(),
            shadow_batches: BatchMap::new(),
            lights: LightStore::new(),
            scene_target,
            postfx_target,
            blur_targets,
            custom_target: None,
            requested_size: (width, height),
            internal_size,
            environment: Environment::default(),
            camera: FrameCamera::default(),
            external_transform: Mat4::IDENTITY,
            depth_sorting: DepthSortingOrder::Disabled,
            active_layers: Layers::LAYER_1,
            shadow_interval: 0.0,
            shadow_timer: 0.0,
        };

        let default_config = renderer.default_config;
        renderer.try_load_material_config(default_config)?;
        Ok(renderer)
    }

    pub fn from_settings(mut device: D, settings: &RenderSettings) -> Result<Self> {
        device.set_screen_size(settings.screen_width, settings.screen_height);
        let mut renderer = Self::new(
            device,
            settings.internal_width,
            settings.internal_height,
            settings.init_flags(),
        )?;
        renderer.depth_sorting = settings.depth_sorting;
        renderer.active_layers = settings.layers();
        renderer.shadow_interval = settings.shadow_update_interval.max(0.0);
        renderer.shadow_timer = renderer.shadow_interval;
        Ok(renderer)
    }

    /// Releases every GPU resource owned by the renderer and hands the device back.
    pub fn shutdown(mut self) -> D {
        let device = &mut self.device;
        self.lights.clear(device);
        self.shader_cache.clear(device);

        let programs = [
            self.programs.depth,
            self.programs.depth_cube,
            self.programs.blur,
            self.programs.postfx,
            self.programs.skybox,
        ];
        for program in programs {
            device.delete_program(program);
        }
        if let Some(debug) = self.debug_programs.take() {
            device.delete_program(debug.depth);
            device.delete_program(debug.depth_cube);
        }

        for texture in [self.defaults.white, self.defaults.black, self.defaults.normal] {
            device.destroy_texture(texture);
        }

        self.scene_target.destroy(device);
        self.postfx_target.destroy(device);
        for target in self.blur_targets {
            target.destroy(device);
        }
        info!("Renderer shut down");
        self.device
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    // ---------------------------------------------------------------------
    // Frame
    // ---------------------------------------------------------------------

    /// Captures the camera for the frame's submissions.
    pub fn begin(&mut self, camera: &Camera) {
        let (w, h) = if self.flags.contains(InitFlags::ASPECT_KEEP) {
            self.internal_size
        } else {
            self.device.screen_size()
        };
        let aspect = w.max(1) as f32 / h.max(1) as f32;

        let view = camera.view();
        let proj = camera.proj(aspect);
        let view_proj = proj * view;
        let frustum = if self.flags.contains(InitFlags::NO_FRUSTUM_CULLING) {
            Frustum::default()
        } else {
            Frustum::from_view_proj(&view_proj)
        };

        self.camera = FrameCamera {
            position: camera.position,
            view,
            proj,
            view_proj,
            frustum,
            near: camera.near,
            far: camera.far,
        };
    }

    pub fn draw_model(&mut self, model: &Model) {
        self.draw_model_pro(model, Vec3::ZERO, Vec3::ZERO, 0.0, Vec3::ONE);
    }

    pub fn draw_model_ex(&mut self, model: &Model, position: Vec3, scale: f32) {
        self.draw_model_pro(model, position, Vec3::ZERO, 0.0, Vec3::splat(scale));
    }

    pub fn draw_model_pro(
        &mut self,
        model: &Model,
        position: Vec3,
        rotation_axis: Vec3,
        rotation_degrees: f32,
        scale: Vec3,
    ) {
        let transform = self.world_transform(
            &model.transform,
            position,
            rotation_axis,
            rotation_degrees,
            scale,
            model.billboard,
        );
        let placement = Placement {
            aabb: model.aabb.transformed(&transform),
            transform,
            layer: model.layer,
            cast: model.shadow,
        };

        let visible = self.is_visible(&placement);
        let casters: Vec<ShadowDrawCall> = if placement.cast == CastShadow::Off {
            Vec::new()
        } else {
            model
                .surfaces
                .iter()
                .map(|surface| ShadowDrawCall::Surface {
                    mesh: surface.mesh.handle,
                    transform,
                })
                .collect()
        };
        let lights = self.gather_lights(&placement, visible, &casters);
        if !visible {
            return;
        }

        for surface in &model.surfaces {
            self.push_scene_call(
                surface.material.config,
                SceneDrawCall::Surface {
                    mesh: surface.mesh.handle,
                    material: surface.material,
                    transform,
                    lights,
                },
            );
        }
    }

    pub fn draw_sprite(&mut self, sprite: &Sprite) {
        self.draw_sprite_pro(sprite, Vec3::ZERO, Vec3::ZERO, 0.0, Vec2::ONE);
    }

    pub fn draw_sprite_ex(&mut self, sprite: &Sprite, position: Vec3, size: f32) {
        self.draw_sprite_pro(sprite, position, Vec3::ZERO, 0.0, Vec2::splat(size));
    }

    pub fn draw_sprite_pro(
        &mut self,
        sprite: &Sprite,
        position: Vec3,
        rotation_axis: Vec3,
        rotation_degrees: f32,
        size: Vec2,
    ) {
        let transform = self.world_transform(
            &sprite.transform,
            position,
            rotation_axis,
            rotation_degrees,
            size.extend(1.0),
            sprite.billboard,
        );
        let placement = Placement {
            aabb: SPRITE_AABB.transformed(&transform),
            transform,
            layer: sprite.layer,
            cast: sprite.shadow,
        };

        let visible = self.is_visible(&placement);
        let casters = if placement.cast == CastShadow::Off {
            Vec::new()
        } else {
            vec![ShadowDrawCall::Sprite { transform }]
        };
        let lights = self.gather_lights(&placement, visible, &casters);
        if visible {
            self.push_scene_call(
                sprite.material.config,
                SceneDrawCall::Sprite {
                    material: sprite.material,
                    transform,
                    lights,
                },
            );
        }
    }

    /// Queues every live particle of `system` as one batched draw.
    pub fn draw_particle_system(&mut self, system: &ParticleSystem) {
        if system.particles.is_empty() {
            return;
        }

        let base = self.external_transform * system.transform.to_global();
        let placement = Placement {
            aabb: system.aabb.transformed(&base),
            transform: base,
            layer: system.layer,
            cast: system.shadow,
        };
        let batch = ParticleBatch {
            mesh: system.surface.mesh.handle,
            particles: Rc::from(system.particles.as_slice()),
            base,
            billboard: system.billboard,
        };

        let visible = self.is_visible(&placement);
        let casters = if placement.cast == CastShadow::Off {
            Vec::new()
        } else {
            vec![ShadowDrawCall::Particles(batch.clone())]
        };
        let lights = self.gather_lights(&placement, visible, &casters);
        if visible {
            self.push_scene_call(
                system.surface.material.config,
                SceneDrawCall::Particles {
                    batch,
                    material: system.surface.material,
                    lights,
                },
            );
        }
    }

    /// Renders every queued batch and presents the result.
    pub fn present(&mut self) {
        let (scene, shadow) = self.draw_call_count();
        debug!("Presenting {} scene and {} shadow draw calls", scene, shadow);

        self.render_shadow_maps();
        self.sort_scene_batches();
        self.render_scene();
        let bloom = self.render_bloom();
        self.render_post_fx(bloom);
        self.blit_to_destination();
    }

    /// Advances the shadow update timer.
    pub fn tick(&mut self, dt: f32) {
        self.shadow_timer += dt.max(0.0);
    }

    /// Refreshes shadow maps `hz` times per second; `hz <= 0` refreshes
    /// every frame. The next frame always refreshes.
    pub fn set_shadow_update_frequency(&mut self, hz: f32) {
        self.shadow_interval = if hz > 0.0 { 1.0 / hz } else { 0.0 };
        self.shadow_timer = self.shadow_interval;
    }

    // ---------------------------------------------------------------------
    // Materials
    // ---------------------------------------------------------------------

    /// Loads `config`, logging compile failures. Use
    /// [`Renderer::is_material_config_valid`] to check the outcome.
    pub fn load_material_config(&mut self, config: MaterialConfig) {
        if let Err(err) = self.try_load_material_config(config) {
            warn!("Material config {:#018x} left invalid: {}", config.raw(), err);
        }
    }

    pub fn try_load_material_config(&mut self, config: MaterialConfig) -> Result<()> {
        self.shader_cache
            .load(&mut self.device, &mut self.scene_batches, config)
    }

    pub fn unload_material_config(&mut self, config: MaterialConfig) {
        self.shader_cache
            .unload(&mut self.device, &mut self.scene_batches, config);
    }

    /// Loads a list of configs up front so the first frame does not compile.
    pub fn precompile(&mut self, configs: &[MaterialConfig]) {
        for config in configs {
            self.load_material_config(*config);
        }
    }

    pub fn is_material_config_valid(&self, config: MaterialConfig) -> bool {
        self.shader_cache.is_valid(config)
    }

    pub fn is_batch_exist(&self, config: MaterialConfig) -> bool {
        self.scene_batches.is_batch_exist(config)
    }

    pub fn default_material_config(&self) -> MaterialConfig {
        self.default_config
    }

    pub fn set_default_material_config(&mut self, config: MaterialConfig) {
        self.load_material_config(config);
        self.default_config = config;
    }

    // ---------------------------------------------------------------------
    // Lights
    // ---------------------------------------------------------------------

    /// Adds a disabled light; a non-zero `shadow_resolution` gives it a shadow map.
    pub fn add_light(&mut self, kind: LightType, shadow_resolution: u32) -> LightId {
        let id = self.lights.add(&mut self.device, kind, shadow_resolution);
        self.shadow_batches.add_batch(id);
        info!("Added {:?} light {:?}", kind, id);
        id
    }

    pub fn remove_light(&mut self, id: LightId) -> bool {
        self.shadow_batches.erase_batch(id);
        self.lights.remove(&mut self.device, id)
    }

    /// Panics on an unknown id.
    pub fn light(&self, id: LightId) -> &Light {
        self.lights.get(id)
    }

    /// Panics on an unknown id.
    pub fn light_mut(&mut self, id: LightId) -> &mut Light {
        self.lights.get_mut(id)
    }

    pub fn try_light(&self, id: LightId) -> Option<&Light> {
        self.lights.try_get(id)
    }

    pub fn lights(&self) -> &LightStore {
        &self.lights
    }

    pub fn enable_light_shadow(&mut self, id: LightId, resolution: u32) {
        self.lights.enable_shadow(&mut self.device, id, resolution);
    }

    pub fn disable_light_shadow(&mut self, id: LightId) {
        self.lights.disable_shadow(&mut self.device, id);
    }

    pub fn set_light_type(&mut self, id: LightId, kind: LightType) {
        self.lights.set_kind(&mut self.device, id, kind);
    }

    // ---------------------------------------------------------------------
    // Environment and resources
    // ---------------------------------------------------------------------

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn environment_mut(&mut self) -> &mut Environment {
        &mut self.environment
    }

    pub fn set_environment(&mut self, environment: Environment) {
        self.environment = environment;
    }

    pub fn texture_white(&self) -> TextureId {
        self.defaults.white
    }

    pub fn texture_black(&self) -> TextureId {
        self.defaults.black
    }

    /// Transform applied on top of every object submitted afterwards.
    pub fn set_external_transform(&mut self, transform: Mat4) {
        self.external_transform = transform;
    }

    pub fn external_transform(&self) -> Mat4 {
        self.external_transform
    }

    // ---------------------------------------------------------------------
    // Toggles
    // ---------------------------------------------------------------------

    /// Redirects the final blit; `None` targets the screen. The handle keeps
    /// the size it was taken at, so set it again after resizing the target.
    pub fn set_render_target(&mut self, target: Option<RenderTargetHandle>) {
        self.custom_target = target;
    }

    pub fn set_blit_mode(&mut self, aspect_keep: bool, linear: bool) {
        self.flags.set(InitFlags::ASPECT_KEEP, aspect_keep);
        self.flags.set(InitFlags::BLIT_LINEAR, linear);
    }

    pub fn set_frustum_culling(&mut self, enabled: bool) {
        self.flags.set(InitFlags::NO_FRUSTUM_CULLING, !enabled);
    }

    pub fn flags(&self) -> InitFlags {
        self.flags
    }

    pub fn depth_sorting_order(&self) -> DepthSortingOrder {
        self.depth_sorting
    }

    pub fn set_depth_sorting_order(&mut self, order: DepthSortingOrder) {
        self.depth_sorting = order;
    }

    pub fn active_layers(&self) -> Layers {
        self.active_layers
    }

    pub fn set_active_layers(&mut self, layers: Layers) {
        self.active_layers = layers;
    }

    pub fn enable_layer(&mut self, layer: Layers) {
        self.active_layers.insert(layer);
    }

    pub fn disable_layer(&mut self, layer: Layers) {
        self.active_layers.remove(layer);
    }

    // ---------------------------------------------------------------------
    // Resolution
    // ---------------------------------------------------------------------

    pub fn internal_resolution(&self) -> (u32, u32) {
        self.internal_size
    }

    /// Resizes the internal targets; 0 follows the screen size.
    pub fn update_internal_resolution(&mut self, width: u32, height: u32) {
        self.requested_size = (width, height);
        let size = resolve_internal_size(&self.device, self.requested_size);
        if size == self.internal_size {
            return;
        }
        self.resize_targets(size);
    }

    pub fn set_screen_size(&mut self, width: u32, height: u32) {
        self.device.set_screen_size(width, height);
        let size = resolve_internal_size(&self.device, self.requested_size);
        if size != self.internal_size {
            self.resize_targets(size);
        }
    }

    fn resize_targets(&mut self, (w, h): (u32, u32)) {
        let device = &mut self.device;
        self.scene_target.resize(device, w, h);
        self.postfx_target.resize(device, w, h);
        for target in &mut self.blur_targets {
            target.resize(device, w, h);
        }
        self.internal_size = (w, h);
        info!("Internal resolution set to {}x{}", w, h);
    }

    // ---------------------------------------------------------------------
    // Debug
    // ---------------------------------------------------------------------

    /// `(scene, shadow)` draw calls queued since the last present.
    pub fn draw_call_count(&self) -> (usize, usize) {
        let scene = self.scene_batches.iter().map(|(_, calls)| calls.len()).sum();
        let shadow = self.shadow_batches.iter().map(|(_, calls)| calls.len()).sum();
        (scene, shadow)
    }

    /// Draws the shadow map of light `id` into a screen rectangle given in
    /// pixels from the top left. Only available with
    /// [`InitFlags::DEBUG_SHADOW_MAP`].
    #[allow(clippy::too_many_arguments)]
    pub fn draw_shadow_map(
        &mut self,
        id: LightId,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        near: f32,
        far: f32,
    ) {
        let Some(debug) = &self.debug_programs else {
            return;
        };
        let light = self.lights.get(id);
        let Some(map) = light.shadow_map() else {
            return;
        };

        let (sw, sh) = self.device.screen_size();
        let mvp = debug_quad_matrix(x, y, width, height, sw, sh);
        let device = &mut self.device;

        match light.kind() {
            LightType::Directional | LightType::Spot => {
                let Some(depth) = map.attachment(Attachment::DEPTH) else {
                    return;
                };
                device.use_program(debug.depth);
                device.set_uniform("uMVP", mvp.into());
                device.set_uniform("uNear", near.into());
                device.set_uniform("uFar", far.into());
                device.bind_texture("uTexture", depth);
            }
            LightType::Omni => {
                let Some(cube) = map.attachment(Attachment::COLOR_0) else {
                    return;
                };
                device.use_program(debug.depth_cube);
                device.set_uniform("uMVP", mvp.into());
                device.set_uniform("uMaxVal", far.into());
                device.bind_texture("uCubemap", cube);
            }
        }
        device.draw_quad();
    }

    // ---------------------------------------------------------------------
    // Submission helpers
    // ---------------------------------------------------------------------

    fn world_transform(
        &self,
        transform: &Transform,
        position: Vec3,
        rotation_axis: Vec3,
        rotation_degrees: f32,
        scale: Vec3,
        billboard: BillboardMode,
    ) -> Mat4 {
        let local = Mat4::from_translation(position)
            * rotation_axis_degrees(rotation_axis, rotation_degrees)
            * Mat4::from_scale(scale);
        let world = self.external_transform * transform.to_global() * local;
        apply_billboard(billboard, world, self.camera.position)
    }

    fn is_visible(&self, placement: &Placement) -> bool {
        if placement.cast == CastShadow::ShadowOnly {
            return false;
        }
        if self.flags.contains(InitFlags::NO_FRUSTUM_CULLING) {
            return true;
        }
        if !self.active_layers.intersects(placement.layer) {
            return false;
        }
        self.camera.frustum.aabb_in(&placement.aabb)
    }

    fn shadow_due(&self) -> bool {
        self.shadow_timer >= self.shadow_interval
    }

    /// Walks the lights in id order, queueing `casters` into the shadow
    /// batch of every shadowed light that reaches the object, and returns
    /// the first lights that illuminate it.
    fn gather_lights(
        &mut self,
        placement: &Placement,
        visible: bool,
        casters: &[ShadowDrawCall],
    ) -> LightSlots {
        let mut slots: LightSlots = [None; SHADER_LIGHT_COUNT];
        if !self.active_layers.intersects(placement.layer) {
            return slots;
        }

        let shadow = !casters.is_empty() && self.shadow_due();
        if !shadow && !visible {
            return slots;
        }

        let position = translation_of(&placement.transform);
        let mut count = 0;

        for (id, light) in self.lights.iter() {
            if !light.is_enabled() || (!visible && !light.shadow_enabled()) {
                continue;
            }
            if !light.layers().intersects(self.active_layers)
                || !light.layers().intersects(placement.layer)
            {
                continue;
            }

            // Naive range test on the object origin.
            let max_distance = light.max_distance();
            if light.kind() != LightType::Directional
                && position.distance_squared(light.position()) > max_distance * max_distance
            {
                continue;
            }
            if light.kind() != LightType::Omni && !light.frustum().aabb_in(&placement.aabb) {
                continue;
            }

            if shadow && light.shadow_enabled() {
                for call in casters {
                    if self.shadow_batches.push(id, call.clone()).is_err() {
                        warn!("No shadow batch for light {:?}", id);
                        break;
                    }
                }
            }

            if visible && count < SHADER_LIGHT_COUNT {
                slots[count] = Some(id);
                count += 1;
            }
        }
        slots
    }

    fn push_scene_call(&mut self, config: MaterialConfig, call: SceneDrawCall) {
        if !self.scene_batches.is_batch_exist(config) {
            warn!(
                "Material config {:#018x} used before being loaded; loading it now",
                config.raw()
            );
            self.load_material_config(config);
        }
        if self.scene_batches.push(config, call).is_err() {
            warn!("Dropped draw call for material config {:#018x}", config.raw());
        }
    }

    // ---------------------------------------------------------------------
    // Passes
    // ---------------------------------------------------------------------

    fn render_shadow_maps(&mut self) {
        let device = &mut self.device;
        let mut rendered = false;

        device.set_blend(None);
        device.set_cull(None);

        for (id, calls) in self.shadow_batches.iter_mut() {
            if calls.is_empty() {
                continue;
            }
            let Some(light) = self.lights.try_get(*id) else {
                calls.clear();
                continue;
            };
            let Some(map) = light.shadow_map() else {
                calls.clear();
                continue;
            };

            match light.kind() {
                LightType::Directional | LightType::Spot => {
                    let view = ShadowView {
                        view_proj: light.view_proj(),
                        light_pos: None,
                    };
                    device.use_program(self.programs.depth);
                    map.begin(device);
                    device.clear(None, true);
                    for call in calls.iter() {
                        call.draw(device, &view);
                    }
                    map.end(device);
                }
                LightType::Omni => {
                    let proj = light.proj();
                    let far = light.max_distance();
                    device.use_program(self.programs.depth_cube);
                    map.begin(device);
                    for face in 0..6 {
                        map.bind_face(device, Attachment::COLOR_0, face as u32);
                        device.clear(Some([far, far, far, 1.0]), true);
                        let view = ShadowView {
                            view_proj: proj * light.face_view(face),
                            light_pos: Some(light.position()),
                        };
                        for call in calls.iter() {
                            call.draw(device, &view);
                        }
                    }
                    map.end(device);
                }
            }

            calls.clear();
            rendered = true;
        }

        if rendered {
            self.shadow_timer = 0.0;
        }
    }

    fn sort_scene_batches(&mut self) {
        let far_first = match self.depth_sorting {
            DepthSortingOrder::Disabled => return,
            DepthSortingOrder::NearToFar => false,
            DepthSortingOrder::FarToNear => true,
        };
        let eye = self.camera.position;
        for (_, calls) in self.scene_batches.iter_mut() {
            calls.sort_by(|a, b| {
                compare_depth(a.distance_squared(eye), b.distance_squared(eye), far_first)
            });
        }
    }

    fn render_scene(&mut self) {
        let device = &mut self.device;
        let camera = &self.camera;
        let env = &self.environment;

        self.scene_target.begin(device);
        device.clear(Some(color_vec4(env.world.background).to_array()), true);

        if let Some(sky) = &env.world.skybox {
            device.set_blend(None);
            device.set_cull(None);
            device.use_program(self.programs.skybox);
            device.set_uniform("uMatProj", camera.proj.into());
            device.set_uniform("uMatView", camera.view.into());
            device.set_uniform("uQuatSkybox", sky.quat().into());
            device.bind_texture("uCubemap", sky.cubemap);
            device.draw_cube();
        }

        for (config, calls) in self.scene_batches.iter_mut() {
            if calls.is_empty() {
                continue;
            }
            let Some(program) = self.shader_cache.program(*config) else {
                calls.clear();
                continue;
            };

            let shader = config.shader();
            device.set_blend(config.blend().equation());
            device.set_cull(config.cull().face());
            device.use_program(program);
            shader_cache::set_environment(device, shader, env, camera.position);

            let view = SceneView {
                shader,
                view_proj: camera.view_proj,
                view_pos: camera.position,
                lights: &self.lights,
                defaults: &self.defaults,
            };
            for call in calls.iter() {
                call.draw(device, &view);
            }
            calls.clear();
        }

        device.set_blend(Some(BlendEquation::Alpha));
        device.set_cull(Some(CullFace::Back));
        self.scene_target.end(device);
    }

    /// Ping-pongs the bright pass between the two blur targets and returns
    /// the last written texture.
    fn render_bloom(&mut self) -> Option<TextureId> {
        let bloom = self.environment.bloom;
        if bloom.mode == BloomMode::Disabled {
            return None;
        }

        let device = &mut self.device;
        let bright = self.scene_target.attachment(Attachment::COLOR_1)?;
        let mut horizontal = true;

        device.set_blend(None);
        device.use_program(self.programs.blur);
        for i in 0..bloom.iterations {
            let target = &self.blur_targets[horizontal as usize];
            let source = if i > 0 {
                self.blur_targets[!horizontal as usize].attachment(Attachment::COLOR_0)
            } else {
                Some(bright)
            };

            target.begin(device);
            device.set_uniform("uHorizontal", (horizontal as i32).into());
            if let Some(source) = source {
                device.bind_texture("uTexture", source);
            }
            device.draw_fullscreen();
            horizontal = !horizontal;
        }

        self.blur_targets[!horizontal as usize].attachment(Attachment::COLOR_0)
    }

    fn render_post_fx(&mut self, bloom: Option<TextureId>) {
        let device = &mut self.device;
        let env = &self.environment;

        self.postfx_target.begin(device);
        device.set_blend(None);
        device.use_program(self.programs.postfx);

        device.set_uniform("uBloomMode", env.bloom.mode.as_uniform().into());
        if let Some(blur) = bloom {
            device.bind_texture("uTexBloomBlurHDR", blur);
            device.set_uniform("uBloomIntensity", env.bloom.intensity.into());
        }

        device.set_uniform("uFogMode", env.fog.mode.as_uniform().into());
        if env.fog.mode != FogMode::Disabled {
            device.set_uniform("uFogColor", color_vec3(env.fog.color).into());
            match env.fog.mode {
                FogMode::Linear => {
                    device.set_uniform("uFogStart", env.fog.start.into());
                    device.set_uniform("uFogEnd", env.fog.end.into());
                }
                FogMode::Exp2 | FogMode::Exp => {
                    device.set_uniform("uFogDensity", env.fog.density.into());
                }
                FogMode::Disabled => {}
            }
        }

        device.set_uniform("uTonemapper", env.tonemap.mode.as_uniform().into());
        device.set_uniform("uExposure", env.tonemap.exposure.into());
        device.set_uniform("uWhite", env.tonemap.white.into());

        device.set_uniform("uBrightness", env.adjustments.brightness.into());
        device.set_uniform("uContrast", env.adjustments.contrast.into());
        device.set_uniform("uSaturation", env.adjustments.saturation.into());

        if let Some(hdr) = self.scene_target.attachment(Attachment::COLOR_0) {
            device.bind_texture("uTexSceneHDR", hdr);
        }
        if let Some(depth) = self.scene_target.attachment(Attachment::DEPTH) {
            device.bind_texture("uTexSceneDepth", depth);
        }
        device.set_uniform("uNear", self.camera.near.into());
        device.set_uniform("uFar", self.camera.far.into());

        device.draw_fullscreen();
        device.set_blend(Some(BlendEquation::Alpha));
        self.postfx_target.end(device);
    }

    fn blit_to_destination(&mut self) {
        let device = &mut self.device;
        let (dst, dst_size) = match self.custom_target {
            Some(handle) => (
                FramebufferTarget::Offscreen(handle.framebuffer),
                (handle.width, handle.height),
            ),
            None => (FramebufferTarget::Default, device.screen_size()),
        };
        let linear = self.flags.contains(InitFlags::BLIT_LINEAR);

        if self.flags.contains(InitFlags::ASPECT_KEEP) {
            self.postfx_target
                .blit_aspect_keep(device, dst, dst_size, Some(Attachment::COLOR_0), false, linear);
            self.scene_target
                .blit_aspect_keep(device, dst, dst_size, None, true, false);
        } else {
            self.postfx_target
                .blit_aspect_expand(device, dst, dst_size, Some(Attachment::COLOR_0), false, linear);
            self.scene_target
                .blit_aspect_expand(device, dst, dst_size, None, true, false);
        }

        device.bind_framebuffer(FramebufferTarget::Default);
        device.set_viewport(Rect::sized(dst_size.0, dst_size.1));
        device.flush();
    }
}

fn resolve_internal_size<D: GraphicsDevice>(device: &D, requested: (u32, u32)) -> (u32, u32) {
    let (sw, sh) = device.screen_size();
    let w = if requested.0 == 0 { sw } else { requested.0 };
    let h = if requested.1 == 0 { sh } else { requested.1 };
    (w.max(1), h.max(1))
}

/// Items without a distance always go last.
fn compare_depth(a: Option<f32>, b: Option<f32>, far_first: bool) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) if far_first => b.total_cmp(&a),
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Clip-space transform placing the unit quad over a pixel rectangle whose
/// origin is the top-left corner of the screen.
fn debug_quad_matrix(x: i32, y: i32, width: i32, height: i32, sw: u32, sh: u32) -> Mat4 {
    let (sw, sh) = (sw.max(1) as f32, sh.max(1) as f32);
    let (x, y, w, h) = (x as f32, y as f32, width as f32, height as f32);
    let x_ndc = 2.0 * (x + w * 0.5) / sw - 1.0;
    let y_ndc = 1.0 - 2.0 * (y + h * 0.5) / sh;
    Mat4::from_translation(Vec3::new(x_ndc, y_ndc, 0.0))
        * Mat4::from_scale(Vec3::new(2.0 * w / sw, 2.0 * h / sh, 1.0))
}

fn solid_texture<D: GraphicsDevice>(device: &mut D, rgba: [u8; 4]) -> TextureId {
    device.create_texture_with_data(&TextureDesc::new_2d(TextureFormat::Rgba8, 1, 1), &rgba)
}

fn create_scene_target<D: GraphicsDevice>(device: &mut D, w: u32, h: u32) -> RenderTarget {
    let mut target = RenderTarget::new(device, "Scene HDR", w, h);
    target.create_attachment(device, Attachment::DEPTH, TextureDesc::new_2d(TextureFormat::Depth, w, h));
    target.create_attachment(
        device,
        Attachment::COLOR_0,
        TextureDesc::new_2d(TextureFormat::Rgba16Float, w, h),
    );
    target.create_attachment(
        device,
        Attachment::COLOR_1,
        TextureDesc::new_2d(TextureFormat::Rgba16Float, w, h),
    );
    target.set_draw_buffers(device, &[Attachment::COLOR_0, Attachment::COLOR_1]);
    target
}

fn create_postfx_target<D: GraphicsDevice>(device: &mut D, w: u32, h: u32) -> RenderTarget {
    let mut target = RenderTarget::new(device, "Post-FX", w, h);
    target.create_attachment(
        device,
        Attachment::COLOR_0,
        TextureDesc::new_2d(TextureFormat::Rgba8, w, h),
    );
    target
}

fn create_blur_target<D: GraphicsDevice>(device: &mut D, label: &str, w: u32, h: u32) -> RenderTarget {
    let mut target = RenderTarget::new(device, label, w, h);
    target.create_attachment(
        device,
        Attachment::COLOR_0,
        TextureDesc::new_2d(TextureFormat::Rgba16Float, w, h)
            .with_filter(Filter::Bilinear)
            .with_wrap(Wrap::ClampBorder),
    );
    target
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::{Command, HeadlessDevice};

    fn renderer() -> Renderer<HeadlessDevice> {
        Renderer::new(HeadlessDevice::new(800, 600), 0, 0, InitFlags::empty()).unwrap()
    }

    #[test]
    fn internal_size_follows_screen() {
        let mut r = renderer();
        assert_eq!(r.internal_resolution(), (800, 600));
        r.set_screen_size(1024, 768);
        assert_eq!(r.internal_resolution(), (1024, 768));
        r.update_internal_resolution(320, 240);
        r.set_screen_size(640, 480);
        assert_eq!(r.internal_resolution(), (320, 240));
    }

    #[test]
    fn depth_compare_puts_unsorted_last() {
        assert_eq!(compare_depth(Some(1.0), None, true), Ordering::Less);
        assert_eq!(compare_depth(None, Some(1.0), false), Ordering::Greater);
        assert_eq!(compare_depth(Some(1.0), Some(4.0), true), Ordering::Greater);
        assert_eq!(compare_depth(Some(1.0), Some(4.0), false), Ordering::Less);
    }

    #[test]
    fn debug_quad_covers_pixel_rect() {
        let m = debug_quad_matrix(0, 0, 400, 300, 800, 600);
        let top_left = m.transform_point3(Vec3::new(-0.5, 0.5, 0.0));
        let bottom_right = m.transform_point3(Vec3::new(0.5, -0.5, 0.0));
        assert!(top_left.abs_diff_eq(Vec3::new(-1.0, 1.0, 0.0), 1e-6));
        assert!(bottom_right.abs_diff_eq(Vec3::new(0.0, 0.0, 0.0), 1e-6));
    }

    #[test]
    fn shadow_map_view_needs_debug_flag() {
        let mut r = renderer();
        let id = r.add_light(LightType::Spot, 256);
        r.device_mut().take_commands();
        r.draw_shadow_map(id, 0, 0, 128, 128, 0.1, 50.0);
        assert_eq!(r.device().draw_count(), 0);

        let mut r = Renderer::new(HeadlessDevice::new(800, 600), 0, 0, InitFlags::DEBUG_SHADOW_MAP).unwrap();
        let id = r.add_light(LightType::Omni, 256);
        r.device_mut().take_commands();
        r.draw_shadow_map(id, 0, 0, 128, 128, 0.1, 50.0);
        let commands = r.device().commands();
        assert!(commands.contains(&Command::Uniform("uMaxVal".into(), 50.0f32.into())));
        assert_eq!(commands.last(), Some(&Command::DrawQuad));
    }

    #[test]
    fn shadow_frequency_gates_casters() {
        let mut r = renderer();
        r.set_shadow_update_frequency(10.0);
        assert!(r.shadow_due());
        r.shadow_timer = 0.0;
        r.tick(0.05);
        assert!(!r.shadow_due());
        r.tick(0.06);
        assert!(r.shadow_due());
        r.set_shadow_update_frequency(0.0);
        assert!(r.shadow_due());
    }

    #[test]
    fn new_shadow_interval_starts_due() {
        let settings = RenderSettings {
            shadow_update_interval: 0.5,
            ..RenderSettings::default()
        };
        let r = Renderer::from_settings(HeadlessDevice::new(800, 600), &settings).unwrap();
        assert!(r.shadow_due());

        let mut r = renderer();
        r.shadow_timer = 0.0;
        r.set_shadow_update_frequency(30.0);
        assert!(r.shadow_due());
    }

    #[test]
    fn shutdown_releases_everything() {
        let mut r = renderer();
        r.add_light(LightType::Omni, 128);
        r.load_material_config(MaterialConfig::default().with_blend(crate::renderer::BlendMode::Additive));
        let device = r.shutdown();
        assert_eq!(device.live_program_count(), 0);
        assert_eq!(device.live_texture_count(), 0);
        assert_eq!(device.live_framebuffer_count(), 0);
    }
}

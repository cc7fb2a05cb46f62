use std::collections::BTreeMap;

use bitflags::bitflags;
use glam::{Mat4, Vec3};
use log::info;

use super::internal::id_pool::IdPool;
use super::render_target::RenderTarget;
use crate::gpu::{Attachment, Filter, GraphicsDevice, TextureDesc, TextureFormat, Wrap};
use crate::math::Frustum;

bitflags! {
    /// Render layers. Objects sit on one layer, lights illuminate a set.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Layers: u16 {
        const LAYER_1 = 1 << 0;
        const LAYER_2 = 1 << 1;
        const LAYER_3 = 1 << 2;
        const LAYER_4 = 1 << 3;
        const LAYER_5 = 1 << 4;
        const LAYER_6 = 1 << 5;
        const LAYER_7 = 1 << 6;
        const LAYER_8 = 1 << 7;
        const LAYER_9 = 1 << 8;
        const LAYER_10 = 1 << 9;
        const LAYER_11 = 1 << 10;
        const LAYER_12 = 1 << 11;
        const LAYER_13 = 1 << 12;
        const LAYER_14 = 1 << 13;
        const LAYER_15 = 1 << 14;
        const LAYER_16 = 1 << 15;
    }
}

impl Default for Layers {
    fn default() -> Self {
        Layers::LAYER_1
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LightType {
    Directional,
    Spot,
    Omni,
}

impl LightType {
    pub(crate) fn as_uniform(self) -> i32 {
        match self {
            LightType::Directional => 0,
            LightType::Spot => 1,
            LightType::Omni => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LightId(pub u32);

/// Cube face directions and up vectors, in +X, -X, +Y, -Y, +Z, -Z order.
const CUBE_FACES: [(Vec3, Vec3); 6] = [
    (Vec3::X, Vec3::NEG_Y),
    (Vec3::NEG_X, Vec3::NEG_Y),
    (Vec3::Y, Vec3::Z),
    (Vec3::NEG_Y, Vec3::NEG_Z),
    (Vec3::Z, Vec3::NEG_Y),
    (Vec3::NEG_Z, Vec3::NEG_Y),
];

#[derive(Debug)]
pub struct Light {
    kind: LightType,
    enabled: bool,
    color: [u8; 4],
    energy: f32,
    position: Vec3,
    direction: Vec3,
    max_distance: f32,
    attenuation: f32,
    inner_cutoff: f32,
    outer_cutoff: f32,
    shadow_bias: f32,
    layers: Layers,
    shadow_map: Option<RenderTarget>,
    frustum: Frustum,
}

impl Light {
    fn new(kind: LightType) -> Self {
        let mut light = Self {
            kind,
            enabled: false,
            color: [255; 4],
            energy: 1.0,
            position: Vec3::ZERO,
            direction: Vec3::NEG_Z,
            max_distance: 32.0,
            attenuation: 1.0,
            inner_cutoff: -1.0,
            outer_cutoff: -1.0,
            shadow_bias: 0.0,
            layers: Layers::LAYER_1,
            shadow_map: None,
            frustum: Frustum::default(),
        };
        light.update_frustum();
        light
    }

    pub fn kind(&self) -> LightType {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn toggle(&mut self) {
        self.enabled = !self.enabled;
    }

    pub fn color(&self) -> [u8; 4] {
        self.color
    }

    pub fn set_color(&mut self, color: [u8; 4]) {
        self.color = color;
    }

    pub fn energy(&self) -> f32 {
        self.energy
    }

    pub fn set_energy(&mut self, energy: f32) {
        self.energy = energy;
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
        self.update_frustum();
    }

    pub fn direction(&self) -> Vec3 {
        self.direction
    }

    pub fn set_direction(&mut self, direction: Vec3) {
        self.direction = direction.normalize_or_zero();
        self.update_frustum();
    }

    /// Points the light at `target` from its current position.
    pub fn set_target(&mut self, target: Vec3) {
        self.direction = (target - self.position).normalize_or_zero();
        self.update_frustum();
    }

    pub fn set_position_target(&mut self, position: Vec3, target: Vec3) {
        self.position = position;
        self.direction = (target - position).normalize_or_zero();
        self.update_frustum();
    }

    pub fn max_distance(&self) -> f32 {
        self.max_distance
    }

    pub fn set_max_distance(&mut self, distance: f32) {
        self.max_distance = distance;
        self.update_frustum();
    }

    pub fn attenuation(&self) -> f32 {
        self.attenuation
    }

    pub fn set_attenuation(&mut self, attenuation: f32) {
        self.attenuation = attenuation;
    }

    /// Inner spot cone half-angle in degrees.
    pub fn inner_cutoff(&self) -> f32 {
        self.inner_cutoff.clamp(-1.0, 1.0).acos().to_degrees()
    }

    pub fn set_inner_cutoff(&mut self, degrees: f32) {
        self.inner_cutoff = degrees.to_radians().cos();
    }

    pub fn outer_cutoff(&self) -> f32 {
        self.outer_cutoff.clamp(-1.0, 1.0).acos().to_degrees()
    }

    pub fn set_outer_cutoff(&mut self, degrees: f32) {
        self.outer_cutoff = degrees.to_radians().cos();
    }

    pub fn set_spot_angles(&mut self, inner_degrees: f32, outer_degrees: f32) {
        self.set_inner_cutoff(inner_degrees);
        self.set_outer_cutoff(outer_degrees);
    }

    /// Cosines of the inner and outer cone angles, as the shader consumes them.
    pub(crate) fn cutoff_cosines(&self) -> (f32, f32) {
        (self.inner_cutoff, self.outer_cutoff)
    }

    pub fn shadow_bias(&self) -> f32 {
        self.shadow_bias
    }

    pub fn set_shadow_bias(&mut self, bias: f32) {
        self.shadow_bias = bias;
    }

    pub fn layers(&self) -> Layers {
        self.layers
    }

    pub fn set_layers(&mut self, layers: Layers) {
        self.layers = layers;
    }

    pub fn add_layer(&mut self, layer: Layers) {
        self.layers.insert(layer);
    }

    pub fn remove_layer(&mut self, layer: Layers) {
        self.layers.remove(layer);
    }

    pub fn toggle_layer(&mut self, layer: Layers) {
        self.layers.toggle(layer);
    }

    pub fn shadow_enabled(&self) -> bool {
        self.shadow_map.is_some()
    }

    pub fn has_shadow_map(&self) -> bool {
        self.shadow_map.is_some()
    }

    pub fn shadow_map(&self) -> Option<&RenderTarget> {
        self.shadow_map.as_ref()
    }

    /// Side length of the shadow map, 0 without a shadow.
    pub fn shadow_map_resolution(&self) -> u32 {
        self.shadow_map.as_ref().map_or(0, |map| map.width())
    }

    pub fn frustum(&self) -> &Frustum {
        &self.frustum
    }

    /// View matrix for directional and spot lights.
    pub fn view(&self) -> Mat4 {
        // Vertical lights need an up vector that is not parallel to them.
        let up = if self.direction.dot(Vec3::Y).abs() > 0.999 {
            Vec3::Z
        } else {
            Vec3::Y
        };
        Mat4::look_at_rh(self.position, self.position + self.direction, up)
    }

    /// View matrix for one cube face of an omni light.
    pub fn face_view(&self, face: usize) -> Mat4 {
        let (dir, up) = CUBE_FACES[face.min(5)];
        Mat4::look_at_rh(self.position, self.position + dir, up)
    }

    pub fn proj(&self) -> Mat4 {
        match self.kind {
            LightType::Directional => Mat4::orthographic_rh_gl(-10.0, 10.0, -10.0, 10.0, 0.05, 4000.0),
            _ => Mat4::perspective_rh_gl(90f32.to_radians(), 1.0, 0.05, self.max_distance),
        }
    }

    pub fn view_proj(&self) -> Mat4 {
        self.proj() * self.view()
    }

    fn update_frustum(&mut self) {
        if self.kind != LightType::Omni {
            self.frustum = Frustum::from_view_proj(&self.view_proj());
        }
    }

    fn enable_shadow<D: GraphicsDevice>(&mut self, device: &mut D, resolution: u32) {
        if resolution == 0 || self.shadow_map.is_some() {
            return;
        }
        self.shadow_map = Some(create_shadow_map(device, self.kind, resolution));
    }

    fn disable_shadow<D: GraphicsDevice>(&mut self, device: &mut D) {
        if let Some(map) = self.shadow_map.take() {
            map.destroy(device);
        }
    }

    fn set_kind<D: GraphicsDevice>(&mut self, device: &mut D, kind: LightType) {
        if self.kind == kind {
            return;
        }
        self.kind = kind;
        if let Some(map) = self.shadow_map.take() {
            let resolution = map.width();
            map.destroy(device);
            self.shadow_map = Some(create_shadow_map(device, kind, resolution));
        }
        self.update_frustum();
    }
}

fn create_shadow_map<D: GraphicsDevice>(device: &mut D, kind: LightType, resolution: u32) -> RenderTarget {
    let mut map = RenderTarget::new(device, "Shadow map", resolution, resolution);
    match kind {
        LightType::Directional | LightType::Spot => {
            map.create_attachment(
                device,
                Attachment::DEPTH,
                TextureDesc::new_2d(TextureFormat::Depth, resolution, resolution)
                    .with_wrap(Wrap::ClampBorder)
                    .with_border([1.0; 4]),
            );
        }
        LightType::Omni => {
            map.create_attachment(
                device,
                Attachment::DEPTH,
                TextureDesc::new_2d(TextureFormat::Depth, resolution, resolution),
            );
            map.create_attachment(
                device,
                Attachment::COLOR_0,
                TextureDesc::new_cube(TextureFormat::R16Float, resolution).with_filter(Filter::Nearest),
            );
        }
    }
    info!("Created {:?} shadow map ({resolution}x{resolution})", kind);
    map
}

/// Owns every light and its shadow map.
///
/// Lights live in id order so the per-object light loop and the shadow pass
/// visit them deterministically.
#[derive(Debug, Default)]
pub struct LightStore {
    lights: BTreeMap<LightId, Light>,
    ids: IdPool,
}

impl LightStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a disabled light; a non-zero `resolution` gives it a shadow map.
    pub fn add<D: GraphicsDevice>(&mut self, device: &mut D, kind: LightType, resolution: u32) -> LightId {
        let id = LightId(self.ids.generate());
        let mut light = Light::new(kind);
        light.enable_shadow(device, resolution);
        self.lights.insert(id, light);
        id
    }

    /// Removes the light and releases its shadow map. Returns false for an unknown id.
    pub fn remove<D: GraphicsDevice>(&mut self, device: &mut D, id: LightId) -> bool {
        match self.lights.remove(&id) {
            Some(mut light) => {
                light.disable_shadow(device);
                self.ids.release(id.0);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: LightId) -> bool {
        self.lights.contains_key(&id)
    }

    /// Panics on an unknown id.
    pub fn get(&self, id: LightId) -> &Light {
        match self.lights.get(&id) {
            Some(light) => light,
            None => panic!("unknown light id {:?}", id),
        }
    }

    pub fn get_mut(&mut self, id: LightId) -> &mut Light {
        match self.lights.get_mut(&id) {
            Some(light) => light,
            None => panic!("unknown light id {:?}", id),
        }
    }

    pub fn try_get(&self, id: LightId) -> Option<&Light> {
        self.lights.get(&id)
    }

    /// No-op when `resolution` is 0 or the light already has a shadow map.
    pub fn enable_shadow<D: GraphicsDevice>(&mut self, device: &mut D, id: LightId, resolution: u32) {
        self.get_mut(id).enable_shadow(device, resolution);
    }

    pub fn disable_shadow<D: GraphicsDevice>(&mut self, device: &mut D, id: LightId) {
        self.get_mut(id).disable_shadow(device);
    }

    /// Changes the light type, rebuilding the shadow map for the new layout.
    pub fn set_kind<D: GraphicsDevice>(&mut self, device: &mut D, id: LightId, kind: LightType) {
        self.get_mut(id).set_kind(device, kind);
    }

    pub fn iter(&self) -> impl Iterator<Item = (LightId, &Light)> {
        self.lights.iter().map(|(id, light)| (*id, light))
    }

    pub fn len(&self) -> usize {
        self.lights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lights.is_empty()
    }

    /// Releases every shadow map.
    pub fn clear<D: GraphicsDevice>(&mut self, device: &mut D) {
        for (_, mut light) in std::mem::take(&mut self.lights) {
            light.disable_shadow(device);
        }
        self.ids = IdPool::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::HeadlessDevice;

    #[test]
    fn new_light_defaults() {
        let mut device = HeadlessDevice::default();
        let mut store = LightStore::new();
        let id = store.add(&mut device, LightType::Spot, 0);
        let light = store.get(id);
        assert!(!light.is_enabled());
        assert!(!light.shadow_enabled());
        assert_eq!(light.shadow_map_resolution(), 0);
        assert_eq!(light.max_distance(), 32.0);
        assert_eq!(light.direction(), Vec3::NEG_Z);
        assert_eq!(light.layers(), Layers::LAYER_1);
    }

    #[test]
    fn shadow_toggles_are_idempotent() {
        let mut device = HeadlessDevice::default();
        let mut store = LightStore::new();
        let id = store.add(&mut device, LightType::Directional, 512);
        assert_eq!(device.live_texture_count(), 1);

        store.enable_shadow(&mut device, id, 1024);
        assert_eq!(store.get(id).shadow_map_resolution(), 512);
        assert_eq!(device.live_texture_count(), 1);

        store.disable_shadow(&mut device, id);
        store.disable_shadow(&mut device, id);
        assert!(!store.get(id).has_shadow_map());
        assert_eq!(device.live_texture_count(), 0);
        assert_eq!(device.live_framebuffer_count(), 0);
    }

    #[test]
    fn omni_map_has_distance_cube() {
        let mut device = HeadlessDevice::default();
        let mut store = LightStore::new();
        let id = store.add(&mut device, LightType::Omni, 256);
        let map = store.get(id).shadow_map().unwrap();
        let cube = map.attachment(Attachment::COLOR_0).unwrap();
        let desc = device.texture_desc(cube).unwrap();
        assert_eq!(desc.kind, crate::gpu::TextureKind::Cube);
        assert_eq!(desc.format, TextureFormat::R16Float);

        store.set_kind(&mut device, id, LightType::Spot);
        let map = store.get(id).shadow_map().unwrap();
        assert!(!map.has_attachment(Attachment::COLOR_0));
        assert_eq!(map.width(), 256);
        assert_eq!(device.live_texture_count(), 1);
    }

    #[test]
    fn spot_angles_round_trip_through_cosines() {
        let mut device = HeadlessDevice::default();
        let mut store = LightStore::new();
        let id = store.add(&mut device, LightType::Spot, 0);
        store.get_mut(id).set_spot_angles(15.0, 30.0);
        let light = store.get(id);
        assert!((light.inner_cutoff() - 15.0).abs() < 1e-3);
        assert!((light.outer_cutoff() - 30.0).abs() < 1e-3);
        assert!((light.cutoff_cosines().0 - 15f32.to_radians().cos()).abs() < 1e-6);
    }

    #[test]
    fn moving_a_spot_light_moves_its_frustum() {
        let mut device = HeadlessDevice::default();
        let mut store = LightStore::new();
        let id = store.add(&mut device, LightType::Spot, 0);
        let light = store.get_mut(id);
        light.set_position_target(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO);
        assert!(light.frustum().point_in(Vec3::ZERO));
        light.set_target(Vec3::new(0.0, 0.0, 20.0));
        assert!(!light.frustum().point_in(Vec3::ZERO));
    }

    #[test]
    fn straight_down_sun_keeps_a_usable_frustum() {
        use crate::math::Aabb;

        let mut device = HeadlessDevice::default();
        let mut store = LightStore::new();
        let id = store.add(&mut device, LightType::Directional, 0);
        let light = store.get_mut(id);
        light.set_position_target(Vec3::new(0.0, 10.0, 0.0), Vec3::ZERO);
        assert!(light.view().is_finite());
        assert!(light.view_proj().is_finite());

        let frustum = light.frustum();
        assert!(frustum.aabb_in(&Aabb::UNIT));
        assert!(!frustum.aabb_in(&Aabb::UNIT.transformed(&Mat4::from_translation(Vec3::new(50.0, 0.0, 0.0)))));
        assert!(!frustum.aabb_in(&Aabb::UNIT.transformed(&Mat4::from_translation(Vec3::new(0.0, 0.0, 50.0)))));
    }

    #[test]
    fn omni_face_views_look_down_axes() {
        let mut device = HeadlessDevice::default();
        let mut store = LightStore::new();
        let id = store.add(&mut device, LightType::Omni, 0);
        let light = store.get(id);
        // A point on +X lands straight ahead (negative view z) in face 0.
        let p = light.face_view(0).transform_point3(Vec3::X);
        assert!(p.truncate().length() < 1e-5);
        assert!(p.z < 0.0);
    }

    #[test]
    #[should_panic]
    fn unknown_id_panics() {
        let store = LightStore::new();
        store.get(LightId(3));
    }
}

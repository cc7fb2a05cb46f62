use glam::{Mat4, Vec3};
use wgpu_forward::gpu::headless::{Command, HeadlessDevice};
use wgpu_forward::gpu::{primitives, UniformValue};
use wgpu_forward::math::{Aabb, Frustum};
use wgpu_forward::renderer::{
    BlendMode, CullMode, DiffuseMode, MaterialFlags, MaterialShaderConfig, Mesh, SpecularMode,
    SHADER_LIGHT_COUNT,
};
use wgpu_forward::{Camera, InitFlags, LightType, Material, MaterialConfig, Model, Renderer};

fn renderer() -> Renderer<HeadlessDevice> {
    Renderer::new(HeadlessDevice::new(800, 600), 0, 0, InitFlags::empty()).unwrap()
}

fn lambert_config() -> MaterialConfig {
    MaterialConfig::new(
        MaterialShaderConfig::new(
            DiffuseMode::Lambert,
            SpecularMode::BlinnPhong,
            MaterialFlags::empty(),
        ),
        BlendMode::Disabled,
        CullMode::Back,
    )
}

#[test]
fn configs_sharing_shader_bits_share_one_program() {
    let mut r = renderer();
    let opaque = lambert_config();
    let additive = opaque.with_blend(BlendMode::Additive);
    let compiled = r.device().compiled_program_count();

    r.load_material_config(opaque);
    r.load_material_config(additive);
    assert_eq!(r.device().compiled_program_count(), compiled + 1);
    assert!(r.is_material_config_valid(opaque));
    assert!(r.is_material_config_valid(additive));

    r.unload_material_config(opaque);
    assert!(!r.is_batch_exist(opaque));
    assert!(r.is_material_config_valid(additive));

    r.unload_material_config(additive);
    assert!(!r.is_material_config_valid(additive));
}

#[test]
fn failed_compile_leaves_config_invalid() {
    let mut r = renderer();
    r.device_mut().fail_programs_with_define("DIFFUSE_TOON");
    let toon = MaterialConfig::default().with_shader(
        MaterialShaderConfig::default().with_diffuse(DiffuseMode::Toon),
    );

    assert!(r.try_load_material_config(toon).is_err());
    assert!(!r.is_material_config_valid(toon));

    r.load_material_config(toon);
    assert!(!r.is_material_config_valid(toon));
}

#[test]
fn batches_exist_only_for_loaded_configs() {
    let mut r = renderer();
    let default = r.default_material_config();
    assert!(r.is_batch_exist(default));
    assert!(!r.is_batch_exist(lambert_config()));

    r.precompile(&[lambert_config()]);
    assert!(r.is_batch_exist(lambert_config()));

    r.set_default_material_config(lambert_config().with_cull(CullMode::Front));
    assert!(r.is_batch_exist(r.default_material_config()));
}

#[test]
fn unloaded_config_is_loaded_on_first_use() {
    let mut r = renderer();
    let mesh = Mesh::upload(r.device_mut(), &primitives::cube(0.5));
    let model = Model::from_mesh(mesh, Material::new(lambert_config()));

    r.begin(&Camera::default());
    r.draw_model(&model);
    assert!(r.is_batch_exist(lambert_config()));
    assert_eq!(r.draw_call_count(), (1, 0));

    r.present();
    assert_eq!(r.draw_call_count(), (0, 0));
    assert!(r.is_batch_exist(lambert_config()));
}

#[test]
fn shadow_map_tracks_shadow_state() {
    let mut r = renderer();
    let id = r.add_light(LightType::Spot, 0);
    let check = |r: &Renderer<HeadlessDevice>| {
        let light = r.light(id);
        assert_eq!(light.has_shadow_map(), light.shadow_enabled());
    };
    check(&r);

    r.enable_light_shadow(id, 512);
    check(&r);
    assert_eq!(r.light(id).shadow_map_resolution(), 512);

    let textures = r.device().live_texture_count();
    r.enable_light_shadow(id, 2048);
    assert_eq!(r.light(id).shadow_map_resolution(), 512);
    assert_eq!(r.device().live_texture_count(), textures);

    r.set_light_type(id, LightType::Omni);
    check(&r);
    assert_eq!(r.device().live_texture_count(), textures + 1);

    r.disable_light_shadow(id);
    check(&r);
    r.disable_light_shadow(id);
    check(&r);

    r.set_light_type(id, LightType::Directional);
    check(&r);
    assert!(!r.light(id).shadow_enabled());
    assert_eq!(r.device().live_texture_count(), textures - 1);
}

#[test]
fn removed_light_ids_are_reused() {
    let mut r = renderer();
    let a = r.add_light(LightType::Omni, 0);
    let b = r.add_light(LightType::Omni, 256);
    let c = r.add_light(LightType::Spot, 0);
    assert!(a != b && b != c);

    assert!(r.remove_light(b));
    assert!(r.try_light(b).is_none());
    assert!(!r.remove_light(b));

    let d = r.add_light(LightType::Directional, 0);
    assert_eq!(d, b);
    assert_eq!(r.light(d).kind(), LightType::Directional);
}

#[test]
#[should_panic]
fn unknown_light_id_panics() {
    let mut r = renderer();
    let id = r.add_light(LightType::Omni, 0);
    r.remove_light(id);
    r.light(id);
}

#[test]
fn scene_draws_see_at_most_eight_lights() {
    let mut r = renderer();
    for i in 0..16 {
        let id = r.add_light(LightType::Omni, 0);
        let light = r.light_mut(id);
        light.set_enabled(true);
        light.set_position(Vec3::new(i as f32 * 0.1, 1.0, 0.0));
    }
    let mesh = Mesh::upload(r.device_mut(), &primitives::cube(0.5));
    let model = Model::from_mesh(mesh, Material::default());

    r.begin(&Camera::default());
    r.draw_model(&model);
    r.present();

    let commands = r.device().commands();
    let lit = commands
        .iter()
        .filter(|c| matches!(c, Command::Uniform(name, UniformValue::Bool(true)) if name.ends_with(".enabled")))
        .count();
    assert_eq!(lit, SHADER_LIGHT_COUNT);
    assert!(!commands
        .iter()
        .any(|c| matches!(c, Command::Uniform(name, _) if name.starts_with("uLights[8]"))));
}

#[test]
fn disabled_lights_and_foreign_layers_do_not_light() {
    use wgpu_forward::Layers;

    let mut r = renderer();
    let off = r.add_light(LightType::Omni, 0);
    r.light_mut(off).set_position(Vec3::Y);
    let other_layer = r.add_light(LightType::Omni, 0);
    {
        let light = r.light_mut(other_layer);
        light.set_enabled(true);
        light.set_layers(Layers::LAYER_2);
    }
    let mesh = Mesh::upload(r.device_mut(), &primitives::cube(0.5));
    let model = Model::from_mesh(mesh, Material::default());

    r.set_active_layers(Layers::LAYER_1 | Layers::LAYER_2);
    r.begin(&Camera::default());
    r.draw_model(&model);
    r.present();

    let lit = r
        .device()
        .commands()
        .iter()
        .filter(|c| matches!(c, Command::Uniform(name, UniformValue::Bool(true)) if name.ends_with(".enabled")))
        .count();
    assert_eq!(lit, 0);
}

#[test]
fn frustum_accepts_inside_and_rejects_outside() {
    let camera = Camera::default();
    let frustum = Frustum::from_view_proj(&camera.view_proj(4.0 / 3.0));

    assert!(frustum.aabb_in(&Aabb::UNIT));
    assert!(!frustum.aabb_in(&Aabb::UNIT.transformed(&Mat4::from_translation(Vec3::new(0.0, 0.0, 10.0)))));
    assert!(!frustum.aabb_in(&Aabb::UNIT.transformed(&Mat4::from_translation(Vec3::new(500.0, 0.0, 0.0)))));

    // Straddling the left plane is still accepted.
    let edge = Aabb::new(Vec3::new(-10.0, -0.5, -0.5), Vec3::new(0.0, 0.5, 0.5));
    assert!(frustum.aabb_in(&edge));
}

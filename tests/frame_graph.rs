use glam::Vec3;
use wgpu_forward::environment::{BloomMode, FogMode};
use wgpu_forward::gpu::headless::{Command, HeadlessDevice};
use wgpu_forward::gpu::{primitives, FramebufferTarget, Rect, UniformValue};
use wgpu_forward::renderer::{CastShadow, Layers, Mesh, Surface};
use wgpu_forward::{
    Camera, DepthSortingOrder, InitFlags, LightType, Material, Model, RenderSettings, Renderer,
};

fn renderer(width: u32, height: u32, flags: InitFlags) -> Renderer<HeadlessDevice> {
    Renderer::new(HeadlessDevice::new(800, 600), width, height, flags).unwrap()
}

fn cube_model(renderer: &mut Renderer<HeadlessDevice>) -> Model {
    let mesh = Mesh::upload(renderer.device_mut(), &primitives::cube(0.5));
    let config = renderer.default_material_config();
    Model::from_mesh(mesh, Material::new(config))
}

fn uniform<'a>(commands: &'a [Command], name: &str) -> Vec<&'a UniformValue> {
    commands
        .iter()
        .filter_map(|c| match c {
            Command::Uniform(n, v) if n == name => Some(v),
            _ => None,
        })
        .collect()
}

#[test]
fn directional_shadow_caster_is_batched_then_flushed() {
    let mut r = renderer(800, 600, InitFlags::empty());
    let sun = r.add_light(LightType::Directional, 1024);
    {
        let light = r.light_mut(sun);
        light.set_enabled(true);
        light.set_position_target(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO);
    }
    let model = cube_model(&mut r);

    r.begin(&Camera::default());
    r.draw_model(&model);
    assert_eq!(r.draw_call_count(), (1, 1));

    r.present();
    assert_eq!(r.draw_call_count(), (0, 0));

    let commands = r.device().commands();
    assert!(commands.iter().any(|c| c == &Command::Clear { color: None, depth: true }));
    assert_eq!(uniform(commands, "uLights[0].enabled"), vec![&UniformValue::Bool(true)]);
    assert_eq!(uniform(commands, "uLights[0].shadow"), vec![&UniformValue::Bool(true)]);
}

#[test]
fn shadow_maps_refresh_at_the_update_frequency() {
    let mut r = renderer(800, 600, InitFlags::empty());
    r.set_shadow_update_frequency(10.0);
    let sun = r.add_light(LightType::Directional, 1024);
    {
        let light = r.light_mut(sun);
        light.set_enabled(true);
        light.set_position_target(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO);
    }
    let model = cube_model(&mut r);
    let shadow_clear = Command::Clear { color: None, depth: true };

    r.begin(&Camera::default());
    r.draw_model(&model);
    assert_eq!(r.draw_call_count(), (1, 1));
    r.present();
    assert!(r.device().commands().contains(&shadow_clear));

    r.device_mut().take_commands();
    r.tick(0.05);
    r.begin(&Camera::default());
    r.draw_model(&model);
    assert_eq!(r.draw_call_count(), (1, 0));
    r.present();
    assert!(!r.device().commands().contains(&shadow_clear));

    r.tick(0.1);
    r.begin(&Camera::default());
    r.draw_model(&model);
    assert_eq!(r.draw_call_count(), (1, 1));
    r.present();
    assert!(r.device().commands().contains(&shadow_clear));
}

#[test]
fn omni_light_out_of_range_is_skipped() {
    let mut r = renderer(800, 600, InitFlags::empty());
    let bulb = r.add_light(LightType::Omni, 512);
    {
        let light = r.light_mut(bulb);
        light.set_enabled(true);
        light.set_position(Vec3::ZERO);
        light.set_max_distance(5.0);
    }
    let model = cube_model(&mut r);

    r.begin(&Camera::perspective(
        Vec3::new(10.0, 0.0, 5.0),
        Vec3::new(10.0, 0.0, 0.0),
        60.0,
    ));
    r.draw_model_ex(&model, Vec3::new(10.0, 0.0, 0.0), 1.0);
    assert_eq!(r.draw_call_count(), (1, 0));

    r.present();
    let commands = r.device().commands();
    assert_eq!(uniform(commands, "uLights[0].enabled"), vec![&UniformValue::Bool(false)]);
    assert!(!commands.iter().any(|c| matches!(c, Command::BindCubeFace { .. })));
}

#[test]
fn omni_shadow_renders_six_faces() {
    let mut r = renderer(800, 600, InitFlags::empty());
    let bulb = r.add_light(LightType::Omni, 256);
    {
        let light = r.light_mut(bulb);
        light.set_enabled(true);
        light.set_position(Vec3::new(2.0, 0.0, 0.0));
    }
    let model = cube_model(&mut r);

    r.begin(&Camera::default());
    r.draw_model(&model);
    r.present();

    let commands = r.device().commands();
    let faces: Vec<u32> = commands
        .iter()
        .filter_map(|c| match c {
            Command::BindCubeFace { face, .. } => Some(*face),
            _ => None,
        })
        .collect();
    assert_eq!(faces, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(uniform(commands, "viewPos").len(), 6);
}

#[test]
fn shadow_only_objects_skip_the_scene() {
    let mut r = renderer(800, 600, InitFlags::empty());
    let sun = r.add_light(LightType::Directional, 512);
    {
        let light = r.light_mut(sun);
        light.set_enabled(true);
        light.set_position_target(Vec3::new(0.0, 5.0, 5.0), Vec3::ZERO);
    }
    let mut model = cube_model(&mut r);
    model.shadow = CastShadow::ShadowOnly;

    r.begin(&Camera::default());
    r.draw_model(&model);
    assert_eq!(r.draw_call_count(), (0, 1));
}

#[test]
fn inactive_layer_is_not_drawn() {
    let mut r = renderer(800, 600, InitFlags::empty());
    let mut model = cube_model(&mut r);
    model.layer = Layers::LAYER_3;

    r.begin(&Camera::default());
    r.draw_model(&model);
    assert_eq!(r.draw_call_count(), (0, 0));

    r.enable_layer(Layers::LAYER_3);
    r.draw_model(&model);
    assert_eq!(r.draw_call_count(), (1, 0));
}

#[test]
fn frustum_culling_can_be_disabled() {
    let mut r = renderer(800, 600, InitFlags::empty());
    let model = cube_model(&mut r);
    let behind = Vec3::new(0.0, 0.0, 20.0);

    r.begin(&Camera::default());
    r.draw_model_ex(&model, behind, 1.0);
    assert_eq!(r.draw_call_count(), (0, 0));

    r.set_frustum_culling(false);
    r.begin(&Camera::default());
    r.draw_model_ex(&model, behind, 1.0);
    assert_eq!(r.draw_call_count(), (1, 0));
}

#[test]
fn present_ends_on_the_destination() {
    let mut r = renderer(800, 600, InitFlags::empty());
    let model = cube_model(&mut r);
    r.environment_mut().bloom.mode = BloomMode::Additive;
    r.environment_mut().bloom.iterations = 4;

    r.begin(&Camera::default());
    r.draw_model(&model);
    r.device_mut().take_commands();
    r.present();

    let commands = r.device().commands();
    let n = commands.len();
    assert_eq!(commands[n - 1], Command::Flush);
    assert_eq!(commands[n - 2], Command::Viewport(Rect::new(0, 0, 800, 600)));
    assert_eq!(commands[n - 3], Command::BindFramebuffer(FramebufferTarget::Default));
    assert!(matches!(commands[n - 4], Command::Blit { .. }));
    assert!(matches!(commands[n - 5], Command::Blit { .. }));

    // Four blur passes plus post-FX.
    let fullscreen = commands
        .iter()
        .filter(|c| matches!(c, Command::DrawFullscreen))
        .count();
    assert_eq!(fullscreen, 5);
    assert_eq!(
        uniform(commands, "uHorizontal"),
        vec![
            &UniformValue::Int(1),
            &UniformValue::Int(0),
            &UniformValue::Int(1),
            &UniformValue::Int(0)
        ]
    );

    let draw = commands.iter().position(|c| matches!(c, Command::DrawMesh(_)));
    let first_blur = commands.iter().position(|c| matches!(c, Command::DrawFullscreen));
    assert!(draw < first_blur);
}

#[test]
fn fog_uniforms_follow_the_mode() {
    let mut r = renderer(800, 600, InitFlags::empty());
    r.environment_mut().fog.mode = FogMode::Exp2;

    r.begin(&Camera::default());
    r.present();

    let commands = r.device().commands();
    assert_eq!(uniform(commands, "uFogMode"), vec![&UniformValue::Int(2)]);
    assert_eq!(uniform(commands, "uFogDensity").len(), 1);
    assert!(uniform(commands, "uFogStart").is_empty());
}

#[test]
fn aspect_keep_letterboxes_the_blit() {
    let mut r = renderer(400, 400, InitFlags::ASPECT_KEEP | InitFlags::BLIT_LINEAR);
    r.begin(&Camera::default());
    r.present();

    let blits: Vec<_> = r
        .device()
        .commands()
        .iter()
        .filter_map(|c| match c {
            Command::Blit { desc, .. } => Some(*desc),
            _ => None,
        })
        .collect();
    assert_eq!(blits.len(), 2);
    assert_eq!(blits[0].dst, Rect::new(100, 0, 600, 600));
    assert!(blits[0].linear);
    assert!(blits[1].depth);
    assert!(!blits[1].linear);
}

#[test]
fn custom_target_receives_the_blit() {
    let mut r = renderer(800, 600, InitFlags::empty());
    let target = wgpu_forward::RenderTarget::new(r.device_mut(), "Custom", 320, 200);
    r.set_render_target(Some(target.handle()));

    r.begin(&Camera::default());
    r.present();

    let commands = r.device().commands();
    assert!(commands.iter().any(|c| matches!(
        c,
        Command::Blit { dst: FramebufferTarget::Offscreen(fb), desc, .. }
            if *fb == target.framebuffer() && desc.dst == Rect::new(0, 0, 320, 200)
    )));
    assert_eq!(commands[commands.len() - 2], Command::Viewport(Rect::new(0, 0, 320, 200)));
}

#[test]
fn custom_target_handle_is_retaken_after_resize() {
    let mut r = renderer(800, 600, InitFlags::empty());
    let mut target = wgpu_forward::RenderTarget::new(r.device_mut(), "Custom", 320, 200);
    r.set_render_target(Some(target.handle()));
    target.resize(r.device_mut(), 640, 400);
    r.set_render_target(Some(target.handle()));

    r.begin(&Camera::default());
    r.present();

    let commands = r.device().commands();
    assert!(commands.iter().any(|c| matches!(
        c,
        Command::Blit { dst: FramebufferTarget::Offscreen(_), desc, .. }
            if desc.dst == Rect::new(0, 0, 640, 400)
    )));
    assert_eq!(commands[commands.len() - 2], Command::Viewport(Rect::new(0, 0, 640, 400)));
}

#[test]
fn far_to_near_sorting_draws_farthest_first() {
    let mut r = renderer(800, 600, InitFlags::empty());
    r.set_depth_sorting_order(DepthSortingOrder::FarToNear);

    let near = cube_model(&mut r);
    let far = cube_model(&mut r);
    let near_mesh = near.surfaces[0].mesh.handle;
    let far_mesh = far.surfaces[0].mesh.handle;

    r.begin(&Camera::default());
    r.draw_model(&near);
    r.draw_model_ex(&far, Vec3::new(0.0, 0.0, -5.0), 1.0);
    r.present();

    let order: Vec<_> = r
        .device()
        .commands()
        .iter()
        .filter_map(|c| match c {
            Command::DrawMesh(mesh) => Some(*mesh),
            _ => None,
        })
        .collect();
    assert_eq!(order, vec![far_mesh, near_mesh]);
}

#[test]
fn internal_resolution_resizes_targets() {
    let mut r = renderer(0, 0, InitFlags::empty());
    assert_eq!(r.internal_resolution(), (800, 600));

    let textures = r.device().live_texture_count();
    r.update_internal_resolution(640, 360);
    assert_eq!(r.internal_resolution(), (640, 360));
    assert_eq!(r.device().live_texture_count(), textures);

    r.update_internal_resolution(0, 0);
    assert_eq!(r.internal_resolution(), (800, 600));
}

#[test]
fn settings_drive_renderer_creation() {
    let settings = RenderSettings::from_json_str(
        r#"{ "screen_width": 1280, "screen_height": 720, "aspect_keep": true,
             "depth_sorting": "NearToFar", "active_layers": 3 }"#,
    )
    .unwrap();
    let r = Renderer::from_settings(HeadlessDevice::default(), &settings).unwrap();
    assert_eq!(r.internal_resolution(), (1280, 720));
    assert!(r.flags().contains(InitFlags::ASPECT_KEEP));
    assert_eq!(r.depth_sorting_order(), DepthSortingOrder::NearToFar);
    assert_eq!(r.active_layers(), Layers::LAYER_1 | Layers::LAYER_2);
}

#[test]
fn sprite_and_particles_share_the_scene_pass() {
    use wgpu_forward::renderer::{Particle, ParticleSystem, Sprite};

    let mut r = renderer(800, 600, InitFlags::empty());
    let config = r.default_material_config();
    let sprite = Sprite::new(r.texture_white(), 2, 2, config);

    let quad = Mesh::upload(r.device_mut(), &primitives::quad());
    let mut system = ParticleSystem::new(Surface {
        mesh: quad,
        material: Material::new(config),
    });
    system.particles = vec![
        Particle::default(),
        Particle {
            position: Vec3::new(0.5, 0.0, 0.0),
            color: [255, 0, 0, 255],
            ..Particle::default()
        },
    ];
    system.compute_aabb();

    r.begin(&Camera::default());
    r.draw_sprite(&sprite);
    r.draw_particle_system(&system);
    assert_eq!(r.draw_call_count(), (2, 0));

    r.present();
    let commands = r.device().commands();
    assert_eq!(commands.iter().filter(|c| matches!(c, Command::DrawQuad)).count(), 1);
    assert_eq!(
        commands
            .iter()
            .filter(|c| matches!(c, Command::DrawMesh(m) if *m == quad.handle))
            .count(),
        2
    );
}

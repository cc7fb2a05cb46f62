//! wgpu implementation of [`GraphicsDevice`].
//!
//! Immediate-mode calls are recorded into render pass descriptions and
//! replayed in one command encoder on [`GraphicsDevice::flush`]. Uniforms are
//! staged per program on the CPU, exactly like GL program state, and copied
//! into a per-frame arena at every draw so later changes never affect earlier
//! draws.

mod context;
pub mod layout;
mod pipeline_builder;
pub mod preprocess;
mod vertex;

use std::borrow::Cow;
use std::collections::HashMap;

use wgpu::util::DeviceExt;

use self::context::GpuContext;
use self::layout::{StageLayout, TextureBindingKind};
use self::pipeline_builder::PipelineBuilder;
use self::preprocess::preprocess;
use self::vertex::{interleave, MeshVertex};
use super::{
    primitives, Attachment, BlendEquation, BlitDesc, CullFace, Filter, FramebufferId,
    FramebufferTarget, GraphicsDevice, MeshData, MeshHandle, ProgramDesc, ProgramId, Rect,
    TextureDesc, TextureFormat, TextureId, TextureKind, UniformValue, Wrap,
};
use crate::error::{RenderError, Result};

const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;
const DEFAULT_COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const UNIFORM_ALIGN: usize = 256;

const BLIT_VERT: &str = include_str!("../../shader/blit.vert.wgsl");
const BLIT_FRAG: &str = include_str!("../../shader/blit.frag.wgsl");

fn map_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Depth => DEPTH_FORMAT,
        TextureFormat::R16Float => wgpu::TextureFormat::R16Float,
        TextureFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
    }
}

fn blend_state(eq: BlendEquation) -> wgpu::BlendState {
    use wgpu::{BlendComponent, BlendFactor, BlendOperation};
    let both = |src_factor, dst_factor, operation| {
        let component = BlendComponent {
            src_factor,
            dst_factor,
            operation,
        };
        wgpu::BlendState {
            color: component,
            alpha: component,
        }
    };
    match eq {
        BlendEquation::Alpha => wgpu::BlendState::ALPHA_BLENDING,
        BlendEquation::Additive => {
            both(BlendFactor::SrcAlpha, BlendFactor::One, BlendOperation::Add)
        }
        BlendEquation::Multiplied => both(
            BlendFactor::Dst,
            BlendFactor::OneMinusSrcAlpha,
            BlendOperation::Add,
        ),
        BlendEquation::AddColors => both(BlendFactor::One, BlendFactor::One, BlendOperation::Add),
        BlendEquation::SubtractColors => both(
            BlendFactor::One,
            BlendFactor::One,
            BlendOperation::ReverseSubtract,
        ),
        BlendEquation::AlphaPremultiply => wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING,
    }
}

fn cull_face(cull: Option<CullFace>) -> Option<wgpu::Face> {
    cull.map(|c| match c {
        CullFace::Front => wgpu::Face::Front,
        CullFace::Back => wgpu::Face::Back,
    })
}

/// Converts a GL viewport (origin bottom-left) into wgpu coordinates,
/// clipped to the attachment size.
fn viewport_in(rect: Rect, size: (u32, u32)) -> Option<[f32; 4]> {
    let (w, h) = (size.0 as i32, size.1 as i32);
    let top = h - (rect.y + rect.height);
    let x0 = rect.x.max(0);
    let y0 = top.max(0);
    let x1 = (rect.x + rect.width).min(w);
    let y1 = (top + rect.height).min(h);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some([x0 as f32, y0 as f32, (x1 - x0) as f32, (y1 - y0) as f32])
}

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    faces: Vec<wgpu::TextureView>,
    sampler: wgpu::Sampler,
    desc: TextureDesc,
    format: wgpu::TextureFormat,
}

impl GpuTexture {
    fn matches(&self, kind: TextureBindingKind) -> bool {
        match kind {
            TextureBindingKind::Float2d => {
                self.desc.kind == TextureKind::D2 && !self.desc.format.is_depth()
            }
            TextureBindingKind::FloatCube => {
                self.desc.kind == TextureKind::Cube && !self.desc.format.is_depth()
            }
            TextureBindingKind::Depth2d => {
                self.desc.kind == TextureKind::D2 && self.desc.format.is_depth()
            }
        }
    }
}

struct GpuMesh {
    vertices: wgpu::Buffer,
    indices: Option<wgpu::Buffer>,
    count: u32,
}

struct GpuProgram {
    label: String,
    vertex: wgpu::ShaderModule,
    fragment: wgpu::ShaderModule,
    vs: StageLayout,
    fs: StageLayout,
    vs_data: Vec<u8>,
    fs_data: Vec<u8>,
    bindings: HashMap<String, TextureId>,
    uniform_layout: wgpu::BindGroupLayout,
    texture_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
}

#[derive(Default)]
struct FramebufferRecord {
    attachments: HashMap<Attachment, TextureId>,
    faces: HashMap<Attachment, u32>,
    draw_buffers: Vec<Attachment>,
}

#[derive(Clone, Copy)]
enum AttachmentRef {
    Texture { id: TextureId, face: Option<u32> },
    DefaultColor,
    DefaultDepth,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum DepthMode {
    Test,
    Overwrite,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct PipelineKey {
    program: ProgramId,
    colors: Vec<wgpu::TextureFormat>,
    depth: Option<wgpu::TextureFormat>,
    blend: Option<BlendEquation>,
    cull: Option<CullFace>,
    depth_mode: DepthMode,
}

#[derive(Clone, Copy)]
enum Geometry {
    Mesh(MeshHandle),
    Quad,
    Fullscreen,
    Cube,
}

struct DrawRecord {
    key: PipelineKey,
    offsets: Vec<u32>,
    textures: wgpu::BindGroup,
    geometry: Geometry,
    viewport: Option<Rect>,
}

struct PassRecord {
    colors: Vec<AttachmentRef>,
    color_formats: Vec<wgpu::TextureFormat>,
    depth: Option<AttachmentRef>,
    size: (u32, u32),
    clear_color: Option<[f32; 4]>,
    clear_depth: bool,
    draws: Vec<DrawRecord>,
}

impl PassRecord {
    fn is_empty(&self) -> bool {
        self.draws.is_empty() && self.clear_color.is_none() && !self.clear_depth
    }
}

#[derive(Clone, Copy)]
struct State {
    target: FramebufferTarget,
    viewport: Option<Rect>,
    blend: Option<BlendEquation>,
    cull: Option<CullFace>,
    program: Option<ProgramId>,
}

struct Fallbacks {
    white_2d: TextureId,
    white_cube: TextureId,
    depth: TextureId,
    nearest: wgpu::Sampler,
    linear: wgpu::Sampler,
}

/// [`GraphicsDevice`] backed by wgpu.
///
/// The default framebuffer is an owned RGBA8 texture sized to the screen
/// unless [`WgpuDevice::set_default_color_view`] redirects it, typically to
/// the current surface texture.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    border_clamp: bool,
    screen: (u32, u32),
    default_color: wgpu::Texture,
    default_color_view: wgpu::TextureView,
    default_depth_view: wgpu::TextureView,
    external_color: Option<(wgpu::TextureView, wgpu::TextureFormat)>,
    next_id: u32,
    textures: HashMap<TextureId, GpuTexture>,
    meshes: HashMap<MeshHandle, GpuMesh>,
    builtin_quad: GpuMesh,
    builtin_fullscreen: GpuMesh,
    builtin_cube: GpuMesh,
    framebuffers: HashMap<FramebufferId, FramebufferRecord>,
    programs: HashMap<ProgramId, GpuProgram>,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
    fallbacks: Option<Fallbacks>,
    blit_color: Option<ProgramId>,
    blit_depth: Option<ProgramId>,
    state: State,
    current: Option<PassRecord>,
    passes: Vec<PassRecord>,
    arena: Vec<u8>,
    uniform_buffer: wgpu::Buffer,
}

impl WgpuDevice {
    /// Creates a device rendering into offscreen textures only.
    pub fn new_headless(width: u32, height: u32) -> Result<Self> {
        let ctx = pollster::block_on(GpuContext::new_headless())?;
        Self::from_context(ctx, width, height)
    }

    /// Wraps a device obtained from `adapter`, e.g. one compatible with a window surface.
    pub async fn from_adapter(adapter: &wgpu::Adapter, width: u32, height: u32) -> Result<Self> {
        let ctx = GpuContext::from_adapter(adapter).await?;
        Self::from_context(ctx, width, height)
    }

    fn from_context(ctx: GpuContext, width: u32, height: u32) -> Result<Self> {
        let GpuContext {
            device,
            queue,
            border_clamp,
        } = ctx;
        let screen = (width.max(1), height.max(1));
        let (default_color, default_color_view) = create_default_color(&device, screen);
        let default_depth_view = create_default_depth(&device, screen);
        let builtin_quad = upload_mesh(&device, &primitives::quad(), "Quad");
        let builtin_fullscreen = upload_mesh(&device, &primitives::fullscreen(), "Fullscreen");
        let builtin_cube = upload_mesh(&device, &primitives::cube(1.0), "Cube");
        let uniform_buffer = create_uniform_buffer(&device, 64 * 1024);

        let mut this = Self {
            device,
            queue,
            border_clamp,
            screen,
            default_color,
            default_color_view,
            default_depth_view,
            external_color: None,
            next_id: 1,
            textures: HashMap::new(),
            meshes: HashMap::new(),
            builtin_quad,
            builtin_fullscreen,
            builtin_cube,
            framebuffers: HashMap::new(),
            programs: HashMap::new(),
            pipelines: HashMap::new(),
            fallbacks: None,
            blit_color: None,
            blit_depth: None,
            state: State {
                target: FramebufferTarget::Default,
                viewport: None,
                blend: None,
                cull: None,
                program: None,
            },
            current: None,
            passes: Vec::new(),
            arena: Vec::new(),
            uniform_buffer,
        };
        this.create_fallbacks();

        let mut blit = ProgramDesc::new("Blit color", BLIT_VERT, BLIT_FRAG);
        blit.fragment_defines.push("BLIT_COLOR".into());
        this.blit_color = Some(this.compile_program(&blit)?);
        blit.label = "Blit depth".into();
        blit.fragment_defines = vec!["BLIT_DEPTH".into()];
        this.blit_depth = Some(this.compile_program(&blit)?);
        Ok(this)
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Redirects the default framebuffer's color to `view` until cleared with `None`.
    pub fn set_default_color_view(&mut self, target: Option<(wgpu::TextureView, wgpu::TextureFormat)>) {
        self.end_pass();
        self.external_color = target;
    }

    /// Owned default color texture, for readback when no surface is attached.
    pub fn default_color_texture(&self) -> &wgpu::Texture {
        &self.default_color
    }

    fn alloc(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn create_fallbacks(&mut self) {
        let white = [255u8; 4];
        let white_2d = self.create_texture_with_data(
            &TextureDesc::new_2d(TextureFormat::Rgba8, 1, 1).with_filter(Filter::Bilinear),
            &white,
        );
        let white_cube = self.create_texture_with_data(
            &TextureDesc::new_cube(TextureFormat::Rgba8, 1).with_filter(Filter::Bilinear),
            &[255u8; 24],
        );
        let depth = self.create_texture(&TextureDesc::new_2d(TextureFormat::Depth, 1, 1));
        let nearest = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Nearest sampler"),
            ..Default::default()
        });
        let linear = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Linear sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        self.fallbacks = Some(Fallbacks {
            white_2d,
            white_cube,
            depth,
            nearest,
            linear,
        });
    }

    fn create_gpu_texture(&self, desc: &TextureDesc) -> GpuTexture {
        let format = map_format(desc.format);
        let cube = desc.kind == TextureKind::Cube;
        let mut usage = wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::RENDER_ATTACHMENT;
        if !desc.format.is_depth() {
            usage |= wgpu::TextureUsages::COPY_DST;
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Texture"),
            size: wgpu::Extent3d {
                width: desc.width.max(1),
                height: desc.height.max(1),
                depth_or_array_layers: if cube { 6 } else { 1 },
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor {
            dimension: Some(if cube {
                wgpu::TextureViewDimension::Cube
            } else {
                wgpu::TextureViewDimension::D2
            }),
            ..Default::default()
        });
        let faces = if cube {
            (0..6)
                .map(|layer| {
                    texture.create_view(&wgpu::TextureViewDescriptor {
                        label: Some("Cube face"),
                        dimension: Some(wgpu::TextureViewDimension::D2),
                        base_array_layer: layer,
                        array_layer_count: Some(1),
                        ..Default::default()
                    })
                })
                .collect()
        } else {
            Vec::new()
        };

        // Depth textures are read with textureLoad or a non-filtering sampler.
        let filter = if desc.filter == Filter::Bilinear && !desc.format.is_depth() {
            wgpu::FilterMode::Linear
        } else {
            wgpu::FilterMode::Nearest
        };
        let (address, border_color) = match desc.wrap {
            Wrap::Repeat => (wgpu::AddressMode::Repeat, None),
            Wrap::ClampEdge => (wgpu::AddressMode::ClampToEdge, None),
            Wrap::ClampBorder if self.border_clamp => {
                let border = if desc.border[3] < 0.5 {
                    wgpu::SamplerBorderColor::TransparentBlack
                } else if desc.border[..3].iter().all(|&c| c >= 0.5) {
                    wgpu::SamplerBorderColor::OpaqueWhite
                } else {
                    wgpu::SamplerBorderColor::OpaqueBlack
                };
                (wgpu::AddressMode::ClampToBorder, Some(border))
            }
            Wrap::ClampBorder => (wgpu::AddressMode::ClampToEdge, None),
        };
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Texture sampler"),
            address_mode_u: address,
            address_mode_v: address,
            address_mode_w: address,
            mag_filter: filter,
            min_filter: filter,
            border_color,
            ..Default::default()
        });

        GpuTexture {
            texture,
            view,
            faces,
            sampler,
            desc: *desc,
            format,
        }
    }

    fn default_color_format(&self) -> wgpu::TextureFormat {
        self.external_color
            .as_ref()
            .map_or(DEFAULT_COLOR_FORMAT, |(_, format)| *format)
    }

    fn view_of(&self, attachment: AttachmentRef) -> Option<&wgpu::TextureView> {
        match attachment {
            AttachmentRef::DefaultColor => Some(
                self.external_color
                    .as_ref()
                    .map_or(&self.default_color_view, |(view, _)| view),
            ),
            AttachmentRef::DefaultDepth => Some(&self.default_depth_view),
            AttachmentRef::Texture { id, face } => {
                let texture = self.textures.get(&id)?;
                match face {
                    Some(face) => texture.faces.get(face as usize),
                    None => Some(&texture.view),
                }
            }
        }
    }

    /// Describes a pass over `target` with nothing recorded yet.
    fn pass_for(&self, target: FramebufferTarget) -> Option<PassRecord> {
        let mut pass = PassRecord {
            colors: Vec::new(),
            color_formats: Vec::new(),
            depth: None,
            size: self.screen,
            clear_color: None,
            clear_depth: false,
            draws: Vec::new(),
        };
        match target {
            FramebufferTarget::Default => {
                pass.colors.push(AttachmentRef::DefaultColor);
                pass.color_formats.push(self.default_color_format());
                pass.depth = Some(AttachmentRef::DefaultDepth);
            }
            FramebufferTarget::Offscreen(fb) => {
                let record = self.framebuffers.get(&fb)?;
                let slots: Vec<Attachment> = if record.draw_buffers.is_empty() {
                    let mut slots: Vec<Attachment> = record
                        .attachments
                        .keys()
                        .copied()
                        .filter(|slot| *slot != Attachment::DEPTH)
                        .collect();
                    slots.sort();
                    slots
                } else {
                    record.draw_buffers.clone()
                };
                let mut size = None;
                for slot in slots {
                    let Some(&id) = record.attachments.get(&slot) else {
                        continue;
                    };
                    let Some(texture) = self.textures.get(&id) else {
                        continue;
                    };
                    pass.colors.push(AttachmentRef::Texture {
                        id,
                        face: record.faces.get(&slot).copied(),
                    });
                    pass.color_formats.push(texture.format);
                    size.get_or_insert((texture.desc.width, texture.desc.height));
                }
                if let Some(&id) = record.attachments.get(&Attachment::DEPTH) {
                    if let Some(texture) = self.textures.get(&id) {
                        pass.depth = Some(AttachmentRef::Texture {
                            id,
                            face: record.faces.get(&Attachment::DEPTH).copied(),
                        });
                        size.get_or_insert((texture.desc.width, texture.desc.height));
                    }
                }
                pass.size = size?;
            }
        }
        Some(pass)
    }

    fn depth_format_of(pass: &PassRecord) -> Option<wgpu::TextureFormat> {
        pass.depth.map(|_| DEPTH_FORMAT)
    }

    fn end_pass(&mut self) {
        if let Some(pass) = self.current.take() {
            if !pass.is_empty() {
                self.passes.push(pass);
            }
        }
    }

    fn ensure_pass(&mut self) -> bool {
        if self.current.is_none() {
            self.current = self.pass_for(self.state.target);
            if self.current.is_none() {
                log::warn!("Framebuffer {:?} has no usable attachments", self.state.target);
            }
        }
        self.current.is_some()
    }

    fn ensure_pipeline(&mut self, key: &PipelineKey) {
        if self.pipelines.contains_key(key) {
            return;
        }
        let Some(program) = self.programs.get(&key.program) else {
            return;
        };
        let mut builder = PipelineBuilder::new(
            &self.device,
            &program.pipeline_layout,
            &program.vertex,
            &program.fragment,
        )
        .with_label(&program.label)
        .with_vertex_buffer(MeshVertex::layout())
        .with_cull_mode(cull_face(key.cull));
        for &format in &key.colors {
            builder = builder.with_color_target(format, key.blend.map(blend_state));
        }
        if let Some(format) = key.depth {
            let compare = match key.depth_mode {
                DepthMode::Test => wgpu::CompareFunction::LessEqual,
                DepthMode::Overwrite => wgpu::CompareFunction::Always,
            };
            builder = builder.with_depth_stencil(format, true, compare);
        }
        let pipeline = builder.build();
        self.pipelines.insert(key.clone(), pipeline);
    }

    /// Copies the program's staged uniforms into the frame arena.
    fn push_uniforms(&mut self, program: ProgramId) -> Vec<u32> {
        let Some(p) = self.programs.get(&program) else {
            return Vec::new();
        };
        let mut offsets = Vec::with_capacity(2);
        for (layout, data) in [(&p.vs, &p.vs_data), (&p.fs, &p.fs_data)] {
            if layout.uniforms.is_none() {
                continue;
            }
            let start = self.arena.len().next_multiple_of(UNIFORM_ALIGN);
            self.arena.resize(start, 0);
            self.arena.extend_from_slice(data);
            offsets.push(start as u32);
        }
        offsets
    }

    /// Builds group 1 for `program`. `linear_override` forces one built-in
    /// sampler for every `*_sampler` binding.
    fn texture_group(&self, program: ProgramId, linear_override: Option<bool>) -> Option<wgpu::BindGroup> {
        let p = self.programs.get(&program)?;
        let fallbacks = self.fallbacks.as_ref()?;
        let resolve = |name: &str, kind: TextureBindingKind| -> Option<&GpuTexture> {
            let bound = p
                .bindings
                .get(name)
                .and_then(|id| self.textures.get(id))
                .filter(|t| t.matches(kind));
            bound.or_else(|| {
                let fallback = match kind {
                    TextureBindingKind::Float2d => fallbacks.white_2d,
                    TextureBindingKind::FloatCube => fallbacks.white_cube,
                    TextureBindingKind::Depth2d => fallbacks.depth,
                };
                self.textures.get(&fallback)
            })
        };

        let mut entries = Vec::with_capacity(p.fs.textures.len() + p.fs.samplers.len());
        for binding in &p.fs.textures {
            let texture = resolve(&binding.name, binding.kind)?;
            entries.push(wgpu::BindGroupEntry {
                binding: binding.binding,
                resource: wgpu::BindingResource::TextureView(&texture.view),
            });
        }
        for binding in &p.fs.samplers {
            let sampler = match binding.name.strip_suffix("_sampler") {
                Some(base) => {
                    let kind = p
                        .fs
                        .textures
                        .iter()
                        .find(|t| t.name == base)
                        .map_or(TextureBindingKind::Float2d, |t| t.kind);
                    match linear_override {
                        Some(true) => &fallbacks.linear,
                        Some(false) => &fallbacks.nearest,
                        None => &resolve(base, kind)?.sampler,
                    }
                }
                None if binding.name == "uSamplerLinear" => &fallbacks.linear,
                None => &fallbacks.nearest,
            };
            entries.push(wgpu::BindGroupEntry {
                binding: binding.binding,
                resource: wgpu::BindingResource::Sampler(sampler),
            });
        }

        Some(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Texture bind group"),
            layout: &p.texture_layout,
            entries: &entries,
        }))
    }

    fn record_draw(&mut self, geometry: Geometry) {
        let Some(program) = self.state.program else {
            log::warn!("Draw issued without a program");
            return;
        };
        if !self.ensure_pass() {
            return;
        }
        let Some(pass) = self.current.as_ref() else {
            return;
        };
        let key = PipelineKey {
            program,
            colors: pass.color_formats.clone(),
            depth: Self::depth_format_of(pass),
            blend: self.state.blend,
            cull: self.state.cull,
            depth_mode: DepthMode::Test,
        };
        self.ensure_pipeline(&key);
        let Some(textures) = self.texture_group(program, None) else {
            return;
        };
        let offsets = self.push_uniforms(program);
        let viewport = self.state.viewport;
        if let Some(pass) = self.current.as_mut() {
            pass.draws.push(DrawRecord {
                key,
                offsets,
                textures,
                geometry,
                viewport,
            });
        }
    }

    fn blit_attachment(
        &mut self,
        program: ProgramId,
        source: TextureId,
        dst: FramebufferTarget,
        desc: &BlitDesc,
        depth: bool,
    ) {
        let Some(mut pass) = self.pass_for(dst) else {
            log::warn!("Blit destination {dst:?} has no usable attachments");
            return;
        };
        if depth {
            pass.colors.clear();
            pass.color_formats.clear();
            if pass.depth.is_none() {
                log::debug!("Blit destination {dst:?} has no depth attachment");
                return;
            }
        } else {
            pass.depth = None;
            if pass.colors.is_empty() {
                return;
            }
        }

        let Some(src) = self.textures.get(&source) else {
            return;
        };
        let (w, h) = (src.desc.width.max(1) as f32, src.desc.height.max(1) as f32);
        let r = desc.src;
        let src_rect = glam::Vec4::new(
            r.x as f32 / w,
            1.0 - (r.y + r.height) as f32 / h,
            r.width as f32 / w,
            r.height as f32 / h,
        );

        let key = PipelineKey {
            program,
            colors: pass.color_formats.clone(),
            depth: Self::depth_format_of(&pass),
            blend: None,
            cull: None,
            depth_mode: DepthMode::Overwrite,
        };
        self.ensure_pipeline(&key);

        if let Some(p) = self.programs.get_mut(&program) {
            p.bindings.insert("uSource".into(), source);
            if let Some(layout) = &p.vs.uniforms {
                layout.write(&mut p.vs_data, "uSrcRect", src_rect.into());
            }
        }
        let Some(textures) = self.texture_group(program, Some(desc.linear)) else {
            return;
        };
        let offsets = self.push_uniforms(program);
        pass.draws.push(DrawRecord {
            key,
            offsets,
            textures,
            geometry: Geometry::Fullscreen,
            viewport: Some(desc.dst),
        });
        self.passes.push(pass);
    }

    fn upload_uniforms(&mut self) {
        if self.arena.is_empty() {
            return;
        }
        let needed = self.arena.len() as u64;
        if needed > self.uniform_buffer.size() {
            self.uniform_buffer = create_uniform_buffer(&self.device, needed.next_power_of_two());
        }
        self.queue.write_buffer(&self.uniform_buffer, 0, &self.arena);
    }

    fn uniform_group(&self, program: &GpuProgram) -> wgpu::BindGroup {
        let mut entries = Vec::with_capacity(2);
        for (binding, layout) in [(0, &program.vs), (1, &program.fs)] {
            if let Some(uniforms) = &layout.uniforms {
                entries.push(wgpu::BindGroupEntry {
                    binding,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: &self.uniform_buffer,
                        offset: 0,
                        size: wgpu::BufferSize::new(uniforms.size as u64),
                    }),
                });
            }
        }
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Uniform bind group"),
            layout: &program.uniform_layout,
            entries: &entries,
        })
    }

    fn encode_pass(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        pass: &PassRecord,
        uniform_groups: &HashMap<ProgramId, wgpu::BindGroup>,
    ) {
        let color_views: Vec<&wgpu::TextureView> =
            pass.colors.iter().filter_map(|a| self.view_of(*a)).collect();
        if color_views.len() != pass.colors.len() {
            log::warn!("Skipping pass with destroyed attachments");
            return;
        }
        let depth_view = match pass.depth {
            Some(a) => match self.view_of(a) {
                Some(view) => Some(view),
                None => {
                    log::warn!("Skipping pass with destroyed depth attachment");
                    return;
                }
            },
            None => None,
        };

        let load = match pass.clear_color {
            Some([r, g, b, a]) => wgpu::LoadOp::Clear(wgpu::Color {
                r: r as f64,
                g: g as f64,
                b: b as f64,
                a: a as f64,
            }),
            None => wgpu::LoadOp::Load,
        };
        let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = color_views
            .into_iter()
            .map(|view| {
                Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    depth_slice: None,
                    ops: wgpu::Operations {
                        load,
                        store: wgpu::StoreOp::Store,
                    },
                })
            })
            .collect();
        let depth_stencil_attachment =
            depth_view.map(|view| wgpu::RenderPassDepthStencilAttachment {
                view,
                depth_ops: Some(wgpu::Operations {
                    load: if pass.clear_depth {
                        wgpu::LoadOp::Clear(1.0)
                    } else {
                        wgpu::LoadOp::Load
                    },
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            });

        let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Frame pass"),
            color_attachments: &color_attachments,
            depth_stencil_attachment,
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        for draw in &pass.draws {
            let Some(pipeline) = self.pipelines.get(&draw.key) else {
                continue;
            };
            let Some(uniforms) = uniform_groups.get(&draw.key.program) else {
                continue;
            };
            let mesh = match draw.geometry {
                Geometry::Mesh(handle) => match self.meshes.get(&handle) {
                    Some(mesh) => mesh,
                    None => continue,
                },
                Geometry::Quad => &self.builtin_quad,
                Geometry::Fullscreen => &self.builtin_fullscreen,
                Geometry::Cube => &self.builtin_cube,
            };
            let viewport = draw.viewport.unwrap_or_else(|| Rect::sized(pass.size.0, pass.size.1));
            let Some([x, y, w, h]) = viewport_in(viewport, pass.size) else {
                continue;
            };

            rpass.set_pipeline(pipeline);
            rpass.set_viewport(x, y, w, h, 0.0, 1.0);
            rpass.set_bind_group(0, uniforms, &draw.offsets);
            rpass.set_bind_group(1, &draw.textures, &[]);
            rpass.set_vertex_buffer(0, mesh.vertices.slice(..));
            match &mesh.indices {
                Some(indices) => {
                    rpass.set_index_buffer(indices.slice(..), wgpu::IndexFormat::Uint32);
                    rpass.draw_indexed(0..mesh.count, 0, 0..1);
                }
                None => rpass.draw(0..mesh.count, 0..1),
            }
        }
    }
}

fn create_default_color(device: &wgpu::Device, size: (u32, u32)) -> (wgpu::Texture, wgpu::TextureView) {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Default color"),
        size: wgpu::Extent3d {
            width: size.0,
            height: size.1,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: DEFAULT_COLOR_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    (texture, view)
}

fn create_default_depth(device: &wgpu::Device, size: (u32, u32)) -> wgpu::TextureView {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Default depth"),
        size: wgpu::Extent3d {
            width: size.0,
            height: size.1,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: DEPTH_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        view_formats: &[],
    });
    texture.create_view(&wgpu::TextureViewDescriptor::default())
}

fn create_uniform_buffer(device: &wgpu::Device, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("Uniform arena"),
        size,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

fn upload_mesh(device: &wgpu::Device, data: &MeshData, label: &str) -> GpuMesh {
    let vertices = interleave(data);
    let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents: bytemuck::cast_slice(&vertices),
        usage: wgpu::BufferUsages::VERTEX,
    });
    let (indices, count) = if data.indices.is_empty() {
        (None, vertices.len() as u32)
    } else {
        let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(&data.indices),
            usage: wgpu::BufferUsages::INDEX,
        });
        (Some(buffer), data.indices.len() as u32)
    };
    GpuMesh {
        vertices: vertex_buffer,
        indices,
        count,
    }
}

fn uniform_layout_entries(vs: &StageLayout, fs: &StageLayout) -> Vec<wgpu::BindGroupLayoutEntry> {
    [(0, vs), (1, fs)]
        .into_iter()
        .filter_map(|(binding, stage)| {
            let uniforms = stage.uniforms.as_ref()?;
            Some(wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: wgpu::BufferSize::new(uniforms.size as u64),
                },
                count: None,
            })
        })
        .collect()
}

fn texture_layout_entries(fs: &StageLayout) -> Vec<wgpu::BindGroupLayoutEntry> {
    let mut entries = Vec::new();
    for texture in &fs.textures {
        let (sample_type, view_dimension) = match texture.kind {
            TextureBindingKind::Float2d => (
                wgpu::TextureSampleType::Float { filterable: true },
                wgpu::TextureViewDimension::D2,
            ),
            TextureBindingKind::FloatCube => (
                wgpu::TextureSampleType::Float { filterable: true },
                wgpu::TextureViewDimension::Cube,
            ),
            TextureBindingKind::Depth2d => {
                (wgpu::TextureSampleType::Depth, wgpu::TextureViewDimension::D2)
            }
        };
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: texture.binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type,
                view_dimension,
                multisampled: false,
            },
            count: None,
        });
    }
    for sampler in &fs.samplers {
        let depth_sampler = sampler
            .name
            .strip_suffix("_sampler")
            .and_then(|base| fs.textures.iter().find(|t| t.name == base))
            .is_some_and(|t| t.kind == TextureBindingKind::Depth2d);
        let ty = if depth_sampler || sampler.name == "uSamplerNearest" {
            wgpu::SamplerBindingType::NonFiltering
        } else {
            wgpu::SamplerBindingType::Filtering
        };
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: sampler.binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(ty),
            count: None,
        });
    }
    entries
}

impl GraphicsDevice for WgpuDevice {
    fn screen_size(&self) -> (u32, u32) {
        self.screen
    }

    fn set_screen_size(&mut self, width: u32, height: u32) {
        let size = (width.max(1), height.max(1));
        if size == self.screen {
            return;
        }
        self.end_pass();
        self.screen = size;
        let (texture, view) = create_default_color(&self.device, size);
        self.default_color = texture;
        self.default_color_view = view;
        self.default_depth_view = create_default_depth(&self.device, size);
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> TextureId {
        let texture = self.create_gpu_texture(desc);
        let id = TextureId(self.alloc());
        self.textures.insert(id, texture);
        id
    }

    fn create_texture_with_data(&mut self, desc: &TextureDesc, data: &[u8]) -> TextureId {
        let texture = self.create_gpu_texture(desc);
        let layers = if desc.kind == TextureKind::Cube { 6 } else { 1 };
        let row = desc.format.bytes_per_pixel() * desc.width;
        let expected = (row * desc.height * layers) as usize;
        if desc.format.is_depth() || data.len() < expected {
            log::warn!(
                "Ignoring texture data: {} bytes for {:?} (expected {expected})",
                data.len(),
                desc.format
            );
        } else {
            self.queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: &texture.texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                &data[..expected],
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(row),
                    rows_per_image: Some(desc.height),
                },
                wgpu::Extent3d {
                    width: desc.width,
                    height: desc.height,
                    depth_or_array_layers: layers,
                },
            );
        }
        let id = TextureId(self.alloc());
        self.textures.insert(id, texture);
        id
    }

    fn texture_desc(&self, texture: TextureId) -> Option<TextureDesc> {
        self.textures.get(&texture).map(|t| t.desc)
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
    }

    fn create_mesh(&mut self, data: &MeshData) -> MeshHandle {
        let mesh = upload_mesh(&self.device, data, "Mesh");
        let id = MeshHandle(self.alloc());
        self.meshes.insert(id, mesh);
        id
    }

    fn destroy_mesh(&mut self, mesh: MeshHandle) {
        self.meshes.remove(&mesh);
    }

    fn create_framebuffer(&mut self, label: &str) -> FramebufferId {
        let id = FramebufferId(self.alloc());
        log::debug!("Framebuffer '{label}' created as {id:?}");
        self.framebuffers.insert(id, FramebufferRecord::default());
        id
    }

    fn attach_texture(&mut self, fb: FramebufferId, slot: Attachment, texture: TextureId) {
        if let Some(record) = self.framebuffers.get_mut(&fb) {
            record.attachments.insert(slot, texture);
            record.faces.remove(&slot);
        }
    }

    fn set_draw_buffers(&mut self, fb: FramebufferId, slots: &[Attachment]) {
        if let Some(record) = self.framebuffers.get_mut(&fb) {
            record.draw_buffers = slots.to_vec();
        }
    }

    fn is_framebuffer_complete(&self, fb: FramebufferId) -> bool {
        let Some(record) = self.framebuffers.get(&fb) else {
            return false;
        };
        let mut size = None;
        for texture in record.attachments.values() {
            let Some(t) = self.textures.get(texture) else {
                return false;
            };
            let s = (t.desc.width, t.desc.height);
            if *size.get_or_insert(s) != s {
                return false;
            }
        }
        size.is_some()
    }

    fn destroy_framebuffer(&mut self, fb: FramebufferId) {
        if self.state.target == FramebufferTarget::Offscreen(fb) {
            self.end_pass();
            self.state.target = FramebufferTarget::Default;
        }
        self.framebuffers.remove(&fb);
    }

    fn compile_program(&mut self, desc: &ProgramDesc) -> Result<ProgramId> {
        let vs_source = preprocess(&desc.vertex, &desc.vertex_defines);
        let fs_source = preprocess(&desc.fragment, &desc.fragment_defines);

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let vertex = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&desc.label),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(vs_source.as_str())),
        });
        let fragment = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&desc.label),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(fs_source.as_str())),
        });
        let vs = layout::reflect(&vs_source);
        let fs = layout::reflect(&fs_source);
        if !vs.textures.is_empty() {
            log::warn!("'{}': vertex stage textures are not bound", desc.label);
        }

        let uniform_layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Uniform layout"),
            entries: &uniform_layout_entries(&vs, &fs),
        });
        let texture_layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Texture layout"),
            entries: &texture_layout_entries(&fs),
        });
        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&desc.label),
            bind_group_layouts: &[&uniform_layout, &texture_layout],
            push_constant_ranges: &[],
        });

        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(RenderError::ShaderCompile {
                label: desc.label.clone(),
                details: error.to_string(),
            });
        }

        let vs_data = vec![0; vs.uniforms.as_ref().map_or(0, |u| u.size as usize)];
        let fs_data = vec![0; fs.uniforms.as_ref().map_or(0, |u| u.size as usize)];
        let id = ProgramId(self.alloc());
        self.programs.insert(
            id,
            GpuProgram {
                label: desc.label.clone(),
                vertex,
                fragment,
                vs,
                fs,
                vs_data,
                fs_data,
                bindings: HashMap::new(),
                uniform_layout,
                texture_layout,
                pipeline_layout,
            },
        );
        Ok(id)
    }

    fn delete_program(&mut self, program: ProgramId) {
        self.programs.remove(&program);
        self.pipelines.retain(|key, _| key.program != program);
        if self.state.program == Some(program) {
            self.state.program = None;
        }
    }

    fn bind_framebuffer(&mut self, target: FramebufferTarget) {
        self.end_pass();
        self.state.target = target;
    }

    fn bind_cube_face(&mut self, fb: FramebufferId, slot: Attachment, texture: TextureId, face: u32) {
        self.end_pass();
        if let Some(record) = self.framebuffers.get_mut(&fb) {
            record.attachments.insert(slot, texture);
            record.faces.insert(slot, face.min(5));
        }
        self.state.target = FramebufferTarget::Offscreen(fb);
    }

    fn set_viewport(&mut self, rect: Rect) {
        self.state.viewport = Some(rect);
    }

    fn clear(&mut self, color: Option<[f32; 4]>, depth: bool) {
        if self.current.as_ref().is_some_and(|p| !p.draws.is_empty()) {
            self.end_pass();
        }
        if !self.ensure_pass() {
            return;
        }
        if let Some(pass) = self.current.as_mut() {
            if color.is_some() {
                pass.clear_color = color;
            }
            pass.clear_depth |= depth;
        }
    }

    fn set_blend(&mut self, blend: Option<BlendEquation>) {
        self.state.blend = blend;
    }

    fn set_cull(&mut self, cull: Option<CullFace>) {
        self.state.cull = cull;
    }

    fn use_program(&mut self, program: ProgramId) {
        self.state.program = Some(program);
    }

    fn set_uniform(&mut self, name: &str, value: UniformValue) {
        let Some(p) = self.state.program.and_then(|id| self.programs.get_mut(&id)) else {
            return;
        };
        if let Some(layout) = &p.vs.uniforms {
            layout.write(&mut p.vs_data, name, value);
        }
        if let Some(layout) = &p.fs.uniforms {
            layout.write(&mut p.fs_data, name, value);
        }
    }

    fn bind_texture(&mut self, sampler: &str, texture: TextureId) {
        if let Some(p) = self.state.program.and_then(|id| self.programs.get_mut(&id)) {
            p.bindings.insert(layout::sanitize_name(sampler), texture);
        }
    }

    fn draw_mesh(&mut self, mesh: MeshHandle) {
        self.record_draw(Geometry::Mesh(mesh));
    }

    fn draw_quad(&mut self) {
        self.record_draw(Geometry::Quad);
    }

    fn draw_fullscreen(&mut self) {
        self.record_draw(Geometry::Fullscreen);
    }

    fn draw_cube(&mut self) {
        self.record_draw(Geometry::Cube);
    }

    fn blit(&mut self, src: FramebufferId, dst: FramebufferTarget, desc: &BlitDesc) {
        self.end_pass();
        let Some(record) = self.framebuffers.get(&src) else {
            log::warn!("Blit from unknown framebuffer {src:?}");
            return;
        };
        let color = desc
            .color
            .and_then(|slot| record.attachments.get(&slot).copied());
        let depth = if desc.depth {
            record.attachments.get(&Attachment::DEPTH).copied()
        } else {
            None
        };
        if let (Some(texture), Some(program)) = (color, self.blit_color) {
            self.blit_attachment(program, texture, dst, desc, false);
        }
        if let (Some(texture), Some(program)) = (depth, self.blit_depth) {
            self.blit_attachment(program, texture, dst, desc, true);
        }
    }

    fn flush(&mut self) {
        self.end_pass();
        if self.passes.is_empty() {
            return;
        }
        self.upload_uniforms();

        let passes = std::mem::take(&mut self.passes);
        let mut uniform_groups = HashMap::new();
        for draw in passes.iter().flat_map(|p| p.draws.iter()) {
            if uniform_groups.contains_key(&draw.key.program) {
                continue;
            }
            if let Some(program) = self.programs.get(&draw.key.program) {
                uniform_groups.insert(draw.key.program, self.uniform_group(program));
            }
        }

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame encoder"),
            });
        for pass in &passes {
            self.encode_pass(&mut encoder, pass, &uniform_groups);
        }
        self.queue.submit(Some(encoder.finish()));
        self.arena.clear();
    }
}

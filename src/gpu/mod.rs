//! Immediate-mode graphics device seam.
//!
//! The frame graph talks to the GPU exclusively through [`GraphicsDevice`]:
//! GL-style calls that bind a framebuffer, set state, select a program, set
//! uniforms by name and issue draws. [`headless::HeadlessDevice`] records those
//! calls for tests; [`wgpu_backend::WgpuDevice`] turns them into wgpu passes.

pub mod headless;
pub mod primitives;
pub mod wgpu_backend;

use glam::{Mat4, Quat, Vec2, Vec3, Vec4};

use crate::error::Result;

macro_rules! resource_id {
    ($name:ident) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);
    };
}

resource_id!(TextureId);
resource_id!(FramebufferId);
resource_id!(ProgramId);
resource_id!(MeshHandle);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureKind {
    D2,
    Cube,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Depth,
    R16Float,
    Rgba8,
    Rgba16Float,
}

impl TextureFormat {
    pub fn is_depth(self) -> bool {
        matches!(self, TextureFormat::Depth)
    }

    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            TextureFormat::Depth => 4,
            TextureFormat::R16Float => 2,
            TextureFormat::Rgba8 => 4,
            TextureFormat::Rgba16Float => 8,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Filter {
    #[default]
    Nearest,
    Bilinear,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Wrap {
    #[default]
    ClampEdge,
    ClampBorder,
    Repeat,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TextureDesc {
    pub kind: TextureKind,
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
    pub filter: Filter,
    pub wrap: Wrap,
    /// Only meaningful with [`Wrap::ClampBorder`].
    pub border: [f32; 4],
}

impl TextureDesc {
    pub fn new_2d(format: TextureFormat, width: u32, height: u32) -> Self {
        Self {
            kind: TextureKind::D2,
            format,
            width,
            height,
            filter: Filter::Nearest,
            wrap: Wrap::ClampEdge,
            border: [0.0; 4],
        }
    }

    pub fn new_cube(format: TextureFormat, size: u32) -> Self {
        Self {
            kind: TextureKind::Cube,
            ..Self::new_2d(format, size, size)
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_wrap(mut self, wrap: Wrap) -> Self {
        self.wrap = wrap;
        self
    }

    pub fn with_border(mut self, border: [f32; 4]) -> Self {
        self.border = border;
        self
    }
}

/// Framebuffer attachment slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Attachment {
    Depth,
    Color(u8),
}

impl Attachment {
    pub const DEPTH: Attachment = Attachment::Depth;
    pub const COLOR_0: Attachment = Attachment::Color(0);
    pub const COLOR_1: Attachment = Attachment::Color(1);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FramebufferTarget {
    /// The presentation surface.
    Default,
    Offscreen(FramebufferId),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn sized(width: u32, height: u32) -> Self {
        Self::new(0, 0, width as i32, height as i32)
    }
}

/// Color blending equations available to the scene pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlendEquation {
    Alpha,
    Additive,
    Multiplied,
    AddColors,
    SubtractColors,
    AlphaPremultiply,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CullFace {
    Front,
    Back,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UniformValue {
    Int(i32),
    Bool(bool),
    Float(f32),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Quat(Quat),
    Mat4(Mat4),
}

impl From<i32> for UniformValue {
    fn from(v: i32) -> Self {
        UniformValue::Int(v)
    }
}

impl From<bool> for UniformValue {
    fn from(v: bool) -> Self {
        UniformValue::Bool(v)
    }
}

impl From<f32> for UniformValue {
    fn from(v: f32) -> Self {
        UniformValue::Float(v)
    }
}

impl From<Vec2> for UniformValue {
    fn from(v: Vec2) -> Self {
        UniformValue::Vec2(v)
    }
}

impl From<Vec3> for UniformValue {
    fn from(v: Vec3) -> Self {
        UniformValue::Vec3(v)
    }
}

impl From<Vec4> for UniformValue {
    fn from(v: Vec4) -> Self {
        UniformValue::Vec4(v)
    }
}

impl From<Quat> for UniformValue {
    fn from(v: Quat) -> Self {
        UniformValue::Quat(v)
    }
}

impl From<Mat4> for UniformValue {
    fn from(v: Mat4) -> Self {
        UniformValue::Mat4(v)
    }
}

/// Source for one GPU program plus the preprocessor symbols it is built with.
#[derive(Clone, Debug, Default)]
pub struct ProgramDesc {
    pub label: String,
    pub vertex: String,
    pub fragment: String,
    pub vertex_defines: Vec<String>,
    pub fragment_defines: Vec<String>,
}

impl ProgramDesc {
    pub fn new(label: impl Into<String>, vertex: &str, fragment: &str) -> Self {
        Self {
            label: label.into(),
            vertex: vertex.to_owned(),
            fragment: fragment.to_owned(),
            vertex_defines: Vec::new(),
            fragment_defines: Vec::new(),
        }
    }
}

/// CPU-side mesh data handed to [`GraphicsDevice::create_mesh`].
///
/// Missing streams are filled with defaults by the backend (white vertex
/// color, +Z normal, zero tangent).
#[derive(Clone, Debug, Default)]
pub struct MeshData {
    pub positions: Vec<[f32; 3]>,
    pub texcoords: Vec<[f32; 2]>,
    pub normals: Vec<[f32; 3]>,
    pub colors: Vec<[u8; 4]>,
    pub tangents: Vec<[f32; 4]>,
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BlitDesc {
    pub src: Rect,
    pub dst: Rect,
    /// Color attachment copied from the source, if any.
    pub color: Option<Attachment>,
    pub depth: bool,
    pub linear: bool,
}

/// Immediate-mode device driven by the frame graph.
///
/// State set through this trait (bound framebuffer, program, blend, cull,
/// viewport, uniforms, sampler bindings) persists until changed, like a GL
/// context.
pub trait GraphicsDevice {
    /// Size of the default framebuffer.
    fn screen_size(&self) -> (u32, u32);
    fn set_screen_size(&mut self, width: u32, height: u32);

    fn create_texture(&mut self, desc: &TextureDesc) -> TextureId;
    fn create_texture_with_data(&mut self, desc: &TextureDesc, data: &[u8]) -> TextureId;
    fn texture_desc(&self, texture: TextureId) -> Option<TextureDesc>;
    fn destroy_texture(&mut self, texture: TextureId);

    fn create_mesh(&mut self, data: &MeshData) -> MeshHandle;
    fn destroy_mesh(&mut self, mesh: MeshHandle);

    fn create_framebuffer(&mut self, label: &str) -> FramebufferId;
    fn attach_texture(&mut self, fb: FramebufferId, slot: Attachment, texture: TextureId);
    fn set_draw_buffers(&mut self, fb: FramebufferId, slots: &[Attachment]);
    fn is_framebuffer_complete(&self, fb: FramebufferId) -> bool;
    fn destroy_framebuffer(&mut self, fb: FramebufferId);

    fn compile_program(&mut self, desc: &ProgramDesc) -> Result<ProgramId>;
    fn delete_program(&mut self, program: ProgramId);

    fn bind_framebuffer(&mut self, target: FramebufferTarget);
    /// Attaches one face of a cube texture to `slot` of `fb` and makes it current.
    fn bind_cube_face(&mut self, fb: FramebufferId, slot: Attachment, texture: TextureId, face: u32);
    fn set_viewport(&mut self, rect: Rect);
    fn clear(&mut self, color: Option<[f32; 4]>, depth: bool);
    fn set_blend(&mut self, blend: Option<BlendEquation>);
    fn set_cull(&mut self, cull: Option<CullFace>);

    fn use_program(&mut self, program: ProgramId);
    fn set_uniform(&mut self, name: &str, value: UniformValue);
    fn bind_texture(&mut self, sampler: &str, texture: TextureId);

    fn draw_mesh(&mut self, mesh: MeshHandle);
    /// Unit quad in the XY plane facing +Z, used for sprites.
    fn draw_quad(&mut self);
    /// Clip-space quad covering the viewport.
    fn draw_fullscreen(&mut self);
    /// Unit cube, used for the skybox.
    fn draw_cube(&mut self);

    fn blit(&mut self, src: FramebufferId, dst: FramebufferTarget, desc: &BlitDesc);

    /// Submits all recorded work for the frame.
    fn flush(&mut self);
}

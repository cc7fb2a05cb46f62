use std::collections::HashMap;

use super::{
    Attachment, BlendEquation, BlitDesc, CullFace, FramebufferId, FramebufferTarget,
    GraphicsDevice, MeshData, MeshHandle, ProgramDesc, ProgramId, Rect, TextureDesc, TextureId,
    UniformValue,
};
use crate::error::{RenderError, Result};

/// One recorded device call.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    BindFramebuffer(FramebufferTarget),
    BindCubeFace {
        fb: FramebufferId,
        texture: TextureId,
        face: u32,
    },
    Viewport(Rect),
    Clear {
        color: Option<[f32; 4]>,
        depth: bool,
    },
    Blend(Option<BlendEquation>),
    Cull(Option<CullFace>),
    UseProgram(ProgramId),
    Uniform(String, UniformValue),
    BindTexture(String, TextureId),
    DrawMesh(MeshHandle),
    DrawQuad,
    DrawFullscreen,
    DrawCube,
    Blit {
        src: FramebufferId,
        dst: FramebufferTarget,
        desc: BlitDesc,
    },
    Flush,
}

impl Command {
    pub fn is_draw(&self) -> bool {
        matches!(
            self,
            Command::DrawMesh(_) | Command::DrawQuad | Command::DrawFullscreen | Command::DrawCube
        )
    }
}

#[derive(Debug)]
struct FramebufferRecord {
    label: String,
    attachments: HashMap<Attachment, TextureId>,
    draw_buffers: Vec<Attachment>,
}

/// Device that performs no GPU work and records every call.
///
/// Resources get sequential ids and are tracked so tests can assert on
/// ownership and lifetimes.
#[derive(Debug)]
pub struct HeadlessDevice {
    screen: (u32, u32),
    next_id: u32,
    textures: HashMap<TextureId, TextureDesc>,
    meshes: HashMap<MeshHandle, usize>,
    framebuffers: HashMap<FramebufferId, FramebufferRecord>,
    programs: HashMap<ProgramId, ProgramDesc>,
    compiled: usize,
    failing_define: Option<String>,
    commands: Vec<Command>,
}

impl HeadlessDevice {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            screen: (width, height),
            next_id: 1,
            textures: HashMap::new(),
            meshes: HashMap::new(),
            framebuffers: HashMap::new(),
            programs: HashMap::new(),
            compiled: 0,
            failing_define: None,
            commands: Vec::new(),
        }
    }

    /// Makes every later compilation fail when its fragment defines contain `define`.
    pub fn fail_programs_with_define(&mut self, define: impl Into<String>) {
        self.failing_define = Some(define.into());
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    pub fn draw_count(&self) -> usize {
        self.commands.iter().filter(|c| c.is_draw()).count()
    }

    pub fn live_texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn live_framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn live_program_count(&self) -> usize {
        self.programs.len()
    }

    /// Total successful compilations since creation.
    pub fn compiled_program_count(&self) -> usize {
        self.compiled
    }

    pub fn program(&self, program: ProgramId) -> Option<&ProgramDesc> {
        self.programs.get(&program)
    }

    pub fn has_texture(&self, texture: TextureId) -> bool {
        self.textures.contains_key(&texture)
    }

    pub fn framebuffer_label(&self, fb: FramebufferId) -> Option<&str> {
        self.framebuffers.get(&fb).map(|r| r.label.as_str())
    }

    pub fn framebuffer_attachment(&self, fb: FramebufferId, slot: Attachment) -> Option<TextureId> {
        self.framebuffers
            .get(&fb)
            .and_then(|r| r.attachments.get(&slot).copied())
    }

    pub fn framebuffer_draw_buffers(&self, fb: FramebufferId) -> &[Attachment] {
        self.framebuffers
            .get(&fb)
            .map(|r| r.draw_buffers.as_slice())
            .unwrap_or(&[])
    }

    fn alloc(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new(800, 600)
    }
}

impl GraphicsDevice for HeadlessDevice {
    fn screen_size(&self) -> (u32, u32) {
        self.screen
    }

    fn set_screen_size(&mut self, width: u32, height: u32) {
        self.screen = (width.max(1), height.max(1));
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> TextureId {
        let id = TextureId(self.alloc());
        self.textures.insert(id, *desc);
        id
    }

    fn create_texture_with_data(&mut self, desc: &TextureDesc, _data: &[u8]) -> TextureId {
        self.create_texture(desc)
    }

    fn texture_desc(&self, texture: TextureId) -> Option<TextureDesc> {
        self.textures.get(&texture).copied()
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
    }

    fn create_mesh(&mut self, data: &MeshData) -> MeshHandle {
        let id = MeshHandle(self.alloc());
        self.meshes.insert(id, data.vertex_count());
        id
    }

    fn destroy_mesh(&mut self, mesh: MeshHandle) {
        self.meshes.remove(&mesh);
    }

    fn create_framebuffer(&mut self, label: &str) -> FramebufferId {
        let id = FramebufferId(self.alloc());
        self.framebuffers.insert(
            id,
            FramebufferRecord {
                label: label.to_owned(),
                attachments: HashMap::new(),
                draw_buffers: Vec::new(),
            },
        );
        id
    }

    fn attach_texture(&mut self, fb: FramebufferId, slot: Attachment, texture: TextureId) {
        if let Some(record) = self.framebuffers.get_mut(&fb) {
            record.attachments.insert(slot, texture);
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
        if record.attachments.is_empty() {
            return false;
        }
        // All attachments must exist and share one size.
        let mut size = None;
        for texture in record.attachments.values() {
            let Some(desc) = self.textures.get(texture) else {
                return false;
            };
            match size {
                None => size = Some((desc.width, desc.height)),
                Some(s) if s != (desc.width, desc.height) => return false,
                _ => {}
            }
        }
        true
    }

    fn destroy_framebuffer(&mut self, fb: FramebufferId) {
        self.framebuffers.remove(&fb);
    }

    fn compile_program(&mut self, desc: &ProgramDesc) -> Result<ProgramId> {
        if let Some(define) = &self.failing_define {
            if desc.fragment_defines.iter().any(|d| d == define) {
                return Err(RenderError::ShaderCompile {
                    label: desc.label.clone(),
                    details: format!("rejected define {define}"),
                });
            }
        }
        let id = ProgramId(self.alloc());
        self.programs.insert(id, desc.clone());
        self.compiled += 1;
        Ok(id)
    }

    fn delete_program(&mut self, program: ProgramId) {
        self.programs.remove(&program);
    }

    fn bind_framebuffer(&mut self, target: FramebufferTarget) {
        self.commands.push(Command::BindFramebuffer(target));
    }

    fn bind_cube_face(&mut self, fb: FramebufferId, slot: Attachment, texture: TextureId, face: u32) {
        debug_assert!(face < 6, "cube face out of range: {face}");
        if let Some(record) = self.framebuffers.get_mut(&fb) {
            record.attachments.insert(slot, texture);
        }
        self.commands.push(Command::BindCubeFace { fb, texture, face });
    }

    fn set_viewport(&mut self, rect: Rect) {
        self.commands.push(Command::Viewport(rect));
    }

    fn clear(&mut self, color: Option<[f32; 4]>, depth: bool) {
        self.commands.push(Command::Clear { color, depth });
    }

    fn set_blend(&mut self, blend: Option<BlendEquation>) {
        self.commands.push(Command::Blend(blend));
    }

    fn set_cull(&mut self, cull: Option<CullFace>) {
        self.commands.push(Command::Cull(cull));
    }

    fn use_program(&mut self, program: ProgramId) {
        debug_assert!(
            self.programs.contains_key(&program),
            "using deleted program {program:?}"
        );
        self.commands.push(Command::UseProgram(program));
    }

    fn set_uniform(&mut self, name: &str, value: UniformValue) {
        self.commands.push(Command::Uniform(name.to_owned(), value));
    }

    fn bind_texture(&mut self, sampler: &str, texture: TextureId) {
        self.commands
            .push(Command::BindTexture(sampler.to_owned(), texture));
    }

    fn draw_mesh(&mut self, mesh: MeshHandle) {
        self.commands.push(Command::DrawMesh(mesh));
    }

    fn draw_quad(&mut self) {
        self.commands.push(Command::DrawQuad);
    }

    fn draw_fullscreen(&mut self) {
        self.commands.push(Command::DrawFullscreen);
    }

    fn draw_cube(&mut self) {
        self.commands.push(Command::DrawCube);
    }

    fn blit(&mut self, src: FramebufferId, dst: FramebufferTarget, desc: &BlitDesc) {
        self.commands.push(Command::Blit {
            src,
            dst,
            desc: *desc,
        });
    }

    fn flush(&mut self) {
        self.commands.push(Command::Flush);
    }
}

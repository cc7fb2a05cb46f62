use std::collections::BTreeMap;

use log::info;

use crate::gpu::{
    Attachment, BlitDesc, FramebufferId, FramebufferTarget, GraphicsDevice, Rect, TextureDesc,
    TextureId, TextureKind,
};

/// Lightweight reference to a render target, used to redirect the final blit.
///
/// The size is captured when the handle is taken. After resizing the target,
/// take a fresh handle and pass it to `Renderer::set_render_target` again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderTargetHandle {
    pub framebuffer: FramebufferId,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy, Debug)]
struct AttachmentRecord {
    texture: TextureId,
    desc: TextureDesc,
}

/// Framebuffer plus the textures attached to it.
///
/// The target owns its attachments: [`RenderTarget::destroy`] and
/// [`RenderTarget::resize`] release them on the device.
#[derive(Debug)]
pub struct RenderTarget {
    label: String,
    framebuffer: FramebufferId,
    width: u32,
    height: u32,
    attachments: BTreeMap<Attachment, AttachmentRecord>,
    draw_buffers: Vec<Attachment>,
}

impl RenderTarget {
    pub fn new<D: GraphicsDevice>(device: &mut D, label: &str, width: u32, height: u32) -> Self {
        let framebuffer = device.create_framebuffer(label);
        Self {
            label: label.to_owned(),
            framebuffer,
            width: width.max(1),
            height: height.max(1),
            attachments: BTreeMap::new(),
            draw_buffers: Vec::new(),
        }
    }

    /// Creates a texture sized to the target and attaches it to `slot`,
    /// replacing any previous attachment there. The size in `desc` is ignored.
    pub fn create_attachment<D: GraphicsDevice>(
        &mut self,
        device: &mut D,
        slot: Attachment,
        desc: TextureDesc,
    ) -> TextureId {
        let desc = TextureDesc {
            width: self.width,
            height: if desc.kind == TextureKind::Cube {
                self.width
            } else {
                self.height
            },
            ..desc
        };
        if let Some(old) = self.attachments.remove(&slot) {
            device.destroy_texture(old.texture);
        }
        let texture = device.create_texture(&desc);
        device.attach_texture(self.framebuffer, slot, texture);
        self.attachments.insert(slot, AttachmentRecord { texture, desc });
        info!(
            "Render target '{}': {:?} attachment {}x{} {:?}",
            self.label, slot, desc.width, desc.height, desc.format
        );
        texture
    }

    pub fn attachment(&self, slot: Attachment) -> Option<TextureId> {
        let texture = self.attachments.get(&slot).map(|a| a.texture);
        debug_assert!(
            texture.is_some(),
            "render target '{}' has no {:?} attachment",
            self.label,
            slot
        );
        texture
    }

    pub fn has_attachment(&self, slot: Attachment) -> bool {
        self.attachments.contains_key(&slot)
    }

    pub fn set_draw_buffers<D: GraphicsDevice>(&mut self, device: &mut D, slots: &[Attachment]) {
        debug_assert!(
            slots.iter().all(|s| self.attachments.contains_key(s)),
            "draw buffer without attachment on '{}'",
            self.label
        );
        self.draw_buffers = slots.to_vec();
        device.set_draw_buffers(self.framebuffer, slots);
    }

    /// Binds the target with a viewport covering it.
    pub fn begin<D: GraphicsDevice>(&self, device: &mut D) {
        debug_assert!(
            device.is_framebuffer_complete(self.framebuffer),
            "framebuffer '{}' is incomplete",
            self.label
        );
        device.bind_framebuffer(FramebufferTarget::Offscreen(self.framebuffer));
        device.set_viewport(Rect::sized(self.width, self.height));
    }

    /// Rebinds the default framebuffer.
    pub fn end<D: GraphicsDevice>(&self, device: &mut D) {
        device.bind_framebuffer(FramebufferTarget::Default);
    }

    /// Binds one face of the cube attached at `slot` as the render surface.
    pub fn bind_face<D: GraphicsDevice>(&self, device: &mut D, slot: Attachment, face: u32) {
        debug_assert!(face < 6);
        if let Some(record) = self.attachments.get(&slot) {
            debug_assert_eq!(record.desc.kind, TextureKind::Cube);
            device.bind_cube_face(self.framebuffer, slot, record.texture, face);
        } else {
            debug_assert!(false, "no {:?} attachment on '{}'", slot, self.label);
        }
    }

    /// Re-creates every attachment at the new size.
    pub fn resize<D: GraphicsDevice>(&mut self, device: &mut D, width: u32, height: u32) {
        let width = width.max(1);
        let height = height.max(1);
        if width == self.width && height == self.height {
            return;
        }
        self.width = width;
        self.height = height;

        let slots: Vec<(Attachment, TextureDesc)> =
            self.attachments.iter().map(|(s, a)| (*s, a.desc)).collect();
        for (slot, desc) in slots {
            debug_assert!(
                desc.kind != TextureKind::Cube || width == height,
                "cube attachment on '{}' resized to a non-square size",
                self.label
            );
            self.create_attachment(device, slot, desc);
        }
        if !self.draw_buffers.is_empty() {
            device.set_draw_buffers(self.framebuffer, &self.draw_buffers);
        }
    }

    /// Copies the target onto `dst`, stretched to `dst_size`.
    pub fn blit_aspect_expand<D: GraphicsDevice>(
        &self,
        device: &mut D,
        dst: FramebufferTarget,
        dst_size: (u32, u32),
        color: Option<Attachment>,
        depth: bool,
        linear: bool,
    ) {
        let dst_rect = Rect::sized(dst_size.0, dst_size.1);
        self.blit(device, dst, dst_rect, color, depth, linear);
    }

    /// Copies the target onto `dst`, letterboxed or pillarboxed to keep its
    /// aspect ratio.
    pub fn blit_aspect_keep<D: GraphicsDevice>(
        &self,
        device: &mut D,
        dst: FramebufferTarget,
        dst_size: (u32, u32),
        color: Option<Attachment>,
        depth: bool,
        linear: bool,
    ) {
        let dst_rect = letterbox(self.width, self.height, dst_size.0, dst_size.1);
        self.blit(device, dst, dst_rect, color, depth, linear);
    }

    fn blit<D: GraphicsDevice>(
        &self,
        device: &mut D,
        dst: FramebufferTarget,
        dst_rect: Rect,
        color: Option<Attachment>,
        depth: bool,
        linear: bool,
    ) {
        if color.is_none() && !depth {
            return;
        }
        debug_assert!(color.map_or(true, |c| self.attachments.contains_key(&c)));
        debug_assert!(!depth || self.attachments.contains_key(&Attachment::DEPTH));
        device.blit(
            self.framebuffer,
            dst,
            &BlitDesc {
                src: Rect::sized(self.width, self.height),
                dst: dst_rect,
                color,
                depth,
                linear,
            },
        );
    }

    pub fn destroy<D: GraphicsDevice>(self, device: &mut D) {
        for record in self.attachments.values() {
            device.destroy_texture(record.texture);
        }
        device.destroy_framebuffer(self.framebuffer);
    }

    pub fn handle(&self) -> RenderTargetHandle {
        RenderTargetHandle {
            framebuffer: self.framebuffer,
            width: self.width,
            height: self.height,
        }
    }

    pub fn framebuffer(&self) -> FramebufferId {
        self.framebuffer
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn texel_width(&self) -> f32 {
        1.0 / self.width as f32
    }
}

/// Largest rect with the source aspect ratio centred in the destination.
pub fn letterbox(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> Rect {
    let screen_ratio = dst_w as f32 / dst_h.max(1) as f32;
    let content_ratio = src_w as f32 / src_h.max(1) as f32;
    let (dst_w, dst_h) = (dst_w as i32, dst_h as i32);

    if content_ratio > screen_ratio {
        let height = (dst_w as f32 / content_ratio) as i32;
        Rect::new(0, (dst_h - height) / 2, dst_w, height)
    } else {
        let width = (dst_h as f32 * content_ratio) as i32;
        Rect::new((dst_w - width) / 2, 0, width, dst_h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::{Command, HeadlessDevice};
    use crate::gpu::TextureFormat;

    #[test]
    fn letterbox_wide_content() {
        // 2:1 content on a 4:3 screen gets bars top and bottom.
        let r = letterbox(200, 100, 800, 600);
        assert_eq!(r, Rect::new(0, 100, 800, 400));
    }

    #[test]
    fn pillarbox_tall_content() {
        let r = letterbox(100, 100, 800, 600);
        assert_eq!(r, Rect::new(100, 0, 600, 600));
    }

    #[test]
    fn resize_recreates_attachments() {
        let mut device = HeadlessDevice::new(800, 600);
        let mut target = RenderTarget::new(&mut device, "test", 64, 64);
        let old = target.create_attachment(
            &mut device,
            Attachment::COLOR_0,
            TextureDesc::new_2d(TextureFormat::Rgba8, 0, 0),
        );
        assert_eq!(device.texture_desc(old).map(|d| d.width), Some(64));

        target.resize(&mut device, 128, 32);
        let new = target.attachment(Attachment::COLOR_0).unwrap();
        assert_ne!(old, new);
        assert!(!device.has_texture(old));
        let desc = device.texture_desc(new).unwrap();
        assert_eq!((desc.width, desc.height), (128, 32));
        assert_eq!(device.framebuffer_attachment(target.framebuffer(), Attachment::COLOR_0), Some(new));
    }

    #[test]
    fn blit_without_buffers_is_skipped() {
        let mut device = HeadlessDevice::new(800, 600);
        let target = RenderTarget::new(&mut device, "test", 64, 64);
        target.blit_aspect_expand(&mut device, FramebufferTarget::Default, (800, 600), None, false, false);
        assert!(!device.commands().iter().any(|c| matches!(c, Command::Blit { .. })));
    }

    #[test]
    fn destroy_releases_everything() {
        let mut device = HeadlessDevice::new(800, 600);
        let mut target = RenderTarget::new(&mut device, "test", 16, 16);
        target.create_attachment(&mut device, Attachment::DEPTH, TextureDesc::new_2d(TextureFormat::Depth, 0, 0));
        assert_eq!(device.live_texture_count(), 1);
        target.destroy(&mut device);
        assert_eq!(device.live_texture_count(), 0);
        assert_eq!(device.live_framebuffer_count(), 0);
    }
}

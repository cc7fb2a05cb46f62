use thiserror::Error;

/// Errors surfaced outside the per-frame path.
///
/// Frame submission and `present` never return these: a failed program
/// compile leaves its material config invalid and is logged instead.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("shader compilation failed for '{label}': {details}")]
    ShaderCompile { label: String, details: String },

    #[error("framebuffer '{0}' is incomplete")]
    IncompleteFramebuffer(String),

    #[error("render target has no {0:?} attachment")]
    MissingAttachment(crate::gpu::Attachment),

    #[error("texture kind {0:?} cannot be resized")]
    UnsupportedTarget(crate::gpu::TextureKind),

    #[error("no suitable graphics adapter found")]
    NoAdapter,

    #[error("failed to create device: {0}")]
    RequestDevice(String),

    #[error("invalid settings: {0}")]
    Settings(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RenderError>;

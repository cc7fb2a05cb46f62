//! WGSL sources for every program the renderer compiles.

pub const MATERIAL_VERT: &str = include_str!("../shader/material.vert.wgsl");
pub const MATERIAL_FRAG: &str = include_str!("../shader/material.frag.wgsl");

pub const DEPTH_VERT: &str = include_str!("../shader/depth.vert.wgsl");
pub const DEPTH_FRAG: &str = include_str!("../shader/depth.frag.wgsl");
pub const DEPTH_CUBE_VERT: &str = include_str!("../shader/depth_cube.vert.wgsl");
pub const DEPTH_CUBE_FRAG: &str = include_str!("../shader/depth_cube.frag.wgsl");

pub const FULLSCREEN_VERT: &str = include_str!("../shader/fullscreen.vert.wgsl");
pub const BLUR_FRAG: &str = include_str!("../shader/blur.frag.wgsl");
pub const POSTFX_FRAG: &str = include_str!("../shader/postfx.frag.wgsl");

pub const SKYBOX_VERT: &str = include_str!("../shader/skybox.vert.wgsl");
pub const SKYBOX_FRAG: &str = include_str!("../shader/skybox.frag.wgsl");

pub const DEBUG_DEPTH_VERT: &str = include_str!("../shader/debug_depth.vert.wgsl");
pub const DEBUG_DEPTH_FRAG: &str = include_str!("../shader/debug_depth.frag.wgsl");

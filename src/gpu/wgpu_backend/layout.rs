//! Uniform and texture layout recovered from preprocessed WGSL.
//!
//! Programs declare one uniform struct per stage and a flat list of texture
//! and sampler variables. The layout maps every leaf field, including array
//! elements and nested struct members, to a byte offset so uniforms can be
//! set by name.

use std::collections::HashMap;

use crate::gpu::UniformValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalarKind {
    I32,
    U32,
    F32,
    Vec2,
    Vec3,
    Vec4,
    Mat4,
}

impl ScalarKind {
    fn parse(ty: &str) -> Option<Self> {
        Some(match ty {
            "i32" => ScalarKind::I32,
            "u32" => ScalarKind::U32,
            "f32" => ScalarKind::F32,
            "vec2<f32>" | "vec2f" => ScalarKind::Vec2,
            "vec3<f32>" | "vec3f" => ScalarKind::Vec3,
            "vec4<f32>" | "vec4f" => ScalarKind::Vec4,
            "mat4x4<f32>" | "mat4x4f" => ScalarKind::Mat4,
            _ => return None,
        })
    }

    fn align(self) -> u32 {
        match self {
            ScalarKind::I32 | ScalarKind::U32 | ScalarKind::F32 => 4,
            ScalarKind::Vec2 => 8,
            ScalarKind::Vec3 | ScalarKind::Vec4 | ScalarKind::Mat4 => 16,
        }
    }

    fn size(self) -> u32 {
        match self {
            ScalarKind::I32 | ScalarKind::U32 | ScalarKind::F32 => 4,
            ScalarKind::Vec2 => 8,
            ScalarKind::Vec3 => 12,
            ScalarKind::Vec4 => 16,
            ScalarKind::Mat4 => 64,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UniformSlot {
    pub offset: u32,
    pub kind: ScalarKind,
}

/// Byte layout of one stage's uniform struct.
#[derive(Clone, Debug, Default)]
pub struct UniformLayout {
    pub size: u32,
    pub slots: HashMap<String, UniformSlot>,
}

impl UniformLayout {
    /// Writes `value` into `buffer` if `name` is declared. Returns whether it was.
    pub fn write(&self, buffer: &mut [u8], name: &str, value: UniformValue) -> bool {
        let Some(slot) = self.slots.get(name) else {
            return false;
        };
        let start = slot.offset as usize;
        let bytes = encode(value, slot.kind);
        let end = (start + bytes.len()).min(buffer.len());
        buffer[start..end].copy_from_slice(&bytes[..end - start]);
        true
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureBindingKind {
    Float2d,
    FloatCube,
    Depth2d,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextureBinding {
    pub name: String,
    pub binding: u32,
    pub kind: TextureBindingKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SamplerBinding {
    pub name: String,
    pub binding: u32,
}

/// Everything the backend needs to know about one compiled stage.
#[derive(Clone, Debug, Default)]
pub struct StageLayout {
    pub uniforms: Option<UniformLayout>,
    pub textures: Vec<TextureBinding>,
    pub samplers: Vec<SamplerBinding>,
}

#[derive(Clone, Debug)]
enum FieldType {
    Scalar(ScalarKind),
    Struct(String),
    Array(Box<FieldType>, u32),
}

#[derive(Clone, Debug)]
struct StructDecl {
    fields: Vec<(String, FieldType)>,
}

fn round_up(align: u32, n: u32) -> u32 {
    n.div_ceil(align) * align
}

fn parse_type(ty: &str) -> Option<FieldType> {
    let ty = ty.trim();
    if let Some(inner) = ty.strip_prefix("array<").and_then(|s| s.strip_suffix('>')) {
        let (elem, count) = inner.rsplit_once(',')?;
        let count = count.trim().parse().ok()?;
        return Some(FieldType::Array(Box::new(parse_type(elem)?), count));
    }
    if let Some(kind) = ScalarKind::parse(ty) {
        return Some(FieldType::Scalar(kind));
    }
    if ty.chars().all(|c| c.is_alphanumeric() || c == '_') && !ty.is_empty() {
        return Some(FieldType::Struct(ty.to_owned()));
    }
    None
}

fn parse_structs(source: &str) -> HashMap<String, StructDecl> {
    let mut structs = HashMap::new();
    let mut current: Option<(String, StructDecl)> = None;

    for raw in source.lines() {
        let line = raw.split("//").next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('}') {
            if let Some((name, decl)) = current.take() {
                structs.insert(name, decl);
            }
            continue;
        }
        if let Some((_, decl)) = current.as_mut() {
            let line = line.trim_end_matches(',');
            if let Some((field, ty)) = line.split_once(':') {
                match parse_type(ty) {
                    Some(ty) => decl.fields.push((field.trim().to_owned(), ty)),
                    None => log::warn!("unsupported uniform field type '{}'", ty.trim()),
                }
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("struct ") {
            let name = rest.trim_end_matches('{').trim().to_owned();
            current = Some((name, StructDecl { fields: Vec::new() }));
        }
    }
    structs
}

/// (align, size) of a type in the uniform address space.
fn measure(ty: &FieldType, structs: &HashMap<String, StructDecl>) -> (u32, u32) {
    match ty {
        FieldType::Scalar(kind) => (kind.align(), kind.size()),
        FieldType::Struct(name) => {
            let Some(decl) = structs.get(name) else {
                return (16, 0);
            };
            let mut offset = 0;
            let mut align = 16;
            for (_, field) in &decl.fields {
                let (a, s) = measure(field, structs);
                offset = round_up(a, offset) + s;
                align = align.max(a);
            }
            (align, round_up(align, offset))
        }
        FieldType::Array(elem, count) => {
            let (a, s) = measure(elem, structs);
            let align = a.max(16);
            let stride = round_up(align, s);
            (align, stride * count)
        }
    }
}

fn flatten(
    prefix: &str,
    base: u32,
    ty: &FieldType,
    structs: &HashMap<String, StructDecl>,
    out: &mut HashMap<String, UniformSlot>,
) {
    match ty {
        FieldType::Scalar(kind) => {
            out.insert(
                prefix.to_owned(),
                UniformSlot {
                    offset: base,
                    kind: *kind,
                },
            );
        }
        FieldType::Struct(name) => {
            let Some(decl) = structs.get(name) else {
                return;
            };
            let mut offset = 0;
            for (field, fty) in &decl.fields {
                let (a, s) = measure(fty, structs);
                offset = round_up(a, offset);
                let path = if prefix.is_empty() {
                    field.clone()
                } else {
                    format!("{prefix}.{field}")
                };
                flatten(&path, base + offset, fty, structs, out);
                offset += s;
            }
        }
        FieldType::Array(elem, count) => {
            let (a, s) = measure(elem, structs);
            let stride = round_up(a.max(16), s);
            for i in 0..*count {
                flatten(&format!("{prefix}[{i}]"), base + i * stride, elem, structs, out);
            }
        }
    }
}

fn binding_of(line: &str) -> Option<u32> {
    let start = line.find("@binding(")? + "@binding(".len();
    let end = line[start..].find(')')? + start;
    line[start..end].trim().parse().ok()
}

fn var_name_and_type(line: &str) -> Option<(&str, &str)> {
    let after_var = line.split_once("var")?.1;
    // Skip an address-space qualifier such as `<uniform>`.
    let after_var = match after_var.trim_start().strip_prefix('<') {
        Some(rest) => rest.split_once('>')?.1,
        None => after_var,
    };
    let (name, ty) = after_var.split_once(':')?;
    Some((name.trim(), ty.trim().trim_end_matches(';').trim()))
}

/// Parses the uniform struct and resource variables of one preprocessed stage.
pub fn reflect(source: &str) -> StageLayout {
    let structs = parse_structs(source);
    let mut layout = StageLayout::default();

    for raw in source.lines() {
        let line = raw.split("//").next().unwrap_or("").trim();
        if !line.starts_with('@') || !line.contains("var") {
            continue;
        }
        let Some(binding) = binding_of(line) else {
            continue;
        };
        let Some((name, ty)) = var_name_and_type(line) else {
            continue;
        };

        if line.contains("var<uniform>") {
            let ty = FieldType::Struct(ty.to_owned());
            let (_, size) = measure(&ty, &structs);
            let mut slots = HashMap::new();
            flatten("", 0, &ty, &structs, &mut slots);
            layout.uniforms = Some(UniformLayout {
                size: size.max(16),
                slots,
            });
        } else if ty == "sampler" {
            layout.samplers.push(SamplerBinding {
                name: name.to_owned(),
                binding,
            });
        } else {
            let kind = if ty.starts_with("texture_depth_2d") {
                TextureBindingKind::Depth2d
            } else if ty.starts_with("texture_cube") {
                TextureBindingKind::FloatCube
            } else if ty.starts_with("texture_2d") {
                TextureBindingKind::Float2d
            } else {
                log::warn!("unsupported resource type '{ty}' for '{name}'");
                continue;
            };
            layout.textures.push(TextureBinding {
                name: name.to_owned(),
                binding,
                kind,
            });
        }
    }
    layout
}

/// Maps a GL-style sampler name (`uLights[2].shadowMap`) to a WGSL identifier.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|&c| c != ']')
        .map(|c| if c == '[' || c == '.' { '_' } else { c })
        .collect()
}

fn encode(value: UniformValue, kind: ScalarKind) -> Vec<u8> {
    let floats: Vec<f32> = match value {
        UniformValue::Int(v) => match kind {
            ScalarKind::F32 => vec![v as f32],
            _ => return v.to_le_bytes().to_vec(),
        },
        UniformValue::Bool(v) => match kind {
            ScalarKind::F32 => vec![if v { 1.0 } else { 0.0 }],
            _ => return (v as i32).to_le_bytes().to_vec(),
        },
        UniformValue::Float(v) => match kind {
            ScalarKind::I32 | ScalarKind::U32 => return (v as i32).to_le_bytes().to_vec(),
            _ => vec![v],
        },
        UniformValue::Vec2(v) => v.to_array().to_vec(),
        UniformValue::Vec3(v) => v.to_array().to_vec(),
        UniformValue::Vec4(v) => v.to_array().to_vec(),
        UniformValue::Quat(q) => q.to_array().to_vec(),
        UniformValue::Mat4(m) => m.to_cols_array().to_vec(),
    };
    let mut bytes: Vec<u8> = bytemuck::cast_slice(&floats).to_vec();
    bytes.truncate(kind.size() as usize);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Mat4, Vec3};

    const SRC: &str = r#"
struct Light {
    color: vec3<f32>,
    energy: f32,
    position: vec3<f32>,
    kind: i32,
};

struct FsUniforms {
    uViewPos: vec3<f32>,
    uLights: array<Light, 2>,
    uMatLightMVP: array<mat4x4<f32>, 2>,
    uBloomHdrThreshold: f32,
};

@group(0) @binding(1) var<uniform> fs: FsUniforms;
@group(1) @binding(0) var uTexAlbedo: texture_2d<f32>;
@group(1) @binding(1) var uTexAlbedo_sampler: sampler;
@group(1) @binding(2) var uLights_0_shadowMap: texture_depth_2d;
@group(1) @binding(3) var uLights_0_shadowCubemap: texture_cube<f32>;
"#;

    #[test]
    fn offsets_follow_uniform_alignment() {
        let layout = reflect(SRC);
        let uniforms = layout.uniforms.expect("uniform struct");
        let slot = |n: &str| uniforms.slots[n].offset;
        assert_eq!(slot("uViewPos"), 0);
        // Light is 32 bytes, aligned to 16.
        assert_eq!(slot("uLights[0].color"), 16);
        assert_eq!(slot("uLights[0].energy"), 28);
        assert_eq!(slot("uLights[1].kind"), 48 + 28);
        assert_eq!(slot("uMatLightMVP[0]"), 80);
        assert_eq!(slot("uMatLightMVP[1]"), 144);
        assert_eq!(slot("uBloomHdrThreshold"), 208);
        assert_eq!(uniforms.size, 224);
    }

    #[test]
    fn resources_are_collected() {
        let layout = reflect(SRC);
        assert_eq!(layout.textures.len(), 3);
        assert_eq!(layout.samplers.len(), 1);
        assert_eq!(layout.textures[1].kind, TextureBindingKind::Depth2d);
        assert_eq!(layout.textures[2].kind, TextureBindingKind::FloatCube);
    }

    #[test]
    fn write_places_bytes_at_offset() {
        let uniforms = reflect(SRC).uniforms.expect("uniform struct");
        let mut buf = vec![0u8; uniforms.size as usize];
        assert!(uniforms.write(&mut buf, "uLights[1].position", Vec3::new(1.0, 2.0, 3.0).into()));
        let floats: &[f32] = bytemuck::cast_slice(&buf);
        assert_eq!(&floats[(48 + 16) / 4..(48 + 28) / 4], &[1.0, 2.0, 3.0]);
        assert!(uniforms.write(&mut buf, "uMatLightMVP[1]", Mat4::IDENTITY.into()));
        assert!(!uniforms.write(&mut buf, "uMissing", 1.0f32.into()));
    }

    #[test]
    fn sanitized_names_are_identifiers() {
        assert_eq!(sanitize_name("uLights[3].shadowMap"), "uLights_3_shadowMap");
        assert_eq!(sanitize_name("uTexAlbedo"), "uTexAlbedo");
    }
}

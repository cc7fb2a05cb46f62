use bytemuck::{Pod, Zeroable};
use std::mem;

use crate::gpu::MeshData;

/// Interleaved vertex shared by every program the backend builds.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
pub struct MeshVertex {
    pub pos: [f32; 3],
    pub uv: [f32; 2],
    pub normal: [f32; 3],
    pub color: [u8; 4],
    pub tangent: [f32; 4],
}

impl MeshVertex {
    pub const ATTRS: [wgpu::VertexAttribute; 5] = wgpu::vertex_attr_array![
        0 => Float32x3,
        1 => Float32x2,
        2 => Float32x3,
        3 => Unorm8x4,
        4 => Float32x4
    ];

    pub fn layout<'a>() -> wgpu::VertexBufferLayout<'a> {
        wgpu::VertexBufferLayout {
            array_stride: mem::size_of::<MeshVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &Self::ATTRS,
        }
    }
}

/// Interleaves the streams of `data`, filling missing ones with defaults.
pub fn interleave(data: &MeshData) -> Vec<MeshVertex> {
    data.positions
        .iter()
        .enumerate()
        .map(|(i, &pos)| MeshVertex {
            pos,
            uv: data.texcoords.get(i).copied().unwrap_or([0.0; 2]),
            normal: data.normals.get(i).copied().unwrap_or([0.0, 0.0, 1.0]),
            color: data.colors.get(i).copied().unwrap_or([255; 4]),
            tangent: data.tangents.get(i).copied().unwrap_or([0.0; 4]),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_stride_matches_struct_size() {
        assert_eq!(
            MeshVertex::layout().array_stride,
            std::mem::size_of::<MeshVertex>() as wgpu::BufferAddress
        );
        assert_eq!(std::mem::size_of::<MeshVertex>(), 52);
    }

    #[test]
    fn missing_streams_get_defaults() {
        let data = MeshData {
            positions: vec![[1.0, 2.0, 3.0]],
            texcoords: vec![[0.5, 0.25]],
            ..Default::default()
        };
        let v = interleave(&data);
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].uv, [0.5, 0.25]);
        assert_eq!(v[0].normal, [0.0, 0.0, 1.0]);
        assert_eq!(v[0].color, [255; 4]);
    }
}

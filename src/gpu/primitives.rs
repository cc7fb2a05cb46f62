//! Procedural meshes used by the backends and available to callers.

use glam::Vec3;
use std::f32::consts::PI;

use super::MeshData;

/// Unit quad in the XY plane facing +Z. Texture row 0 is at the top.
pub fn quad() -> MeshData {
    rect(0.5)
}

/// Quad spanning clip space.
pub fn fullscreen() -> MeshData {
    rect(1.0)
}

fn rect(half: f32) -> MeshData {
    MeshData {
        positions: vec![
            [-half, -half, 0.0],
            [half, -half, 0.0],
            [half, half, 0.0],
            [-half, half, 0.0],
        ],
        texcoords: vec![[0.0, 1.0], [1.0, 1.0], [1.0, 0.0], [0.0, 0.0]],
        normals: vec![[0.0, 0.0, 1.0]; 4],
        colors: vec![[255; 4]; 4],
        tangents: vec![[1.0, 0.0, 0.0, 1.0]; 4],
        indices: vec![0, 1, 2, 0, 2, 3],
    }
}

/// Axis-aligned cube with the given half extent and per-face normals.
pub fn cube(half: f32) -> MeshData {
    // (normal, u axis, v axis) with u x v == normal so faces wind CCW from outside.
    let faces = [
        (Vec3::X, Vec3::NEG_Z, Vec3::Y),
        (Vec3::NEG_X, Vec3::Z, Vec3::Y),
        (Vec3::Y, Vec3::X, Vec3::NEG_Z),
        (Vec3::NEG_Y, Vec3::X, Vec3::Z),
        (Vec3::Z, Vec3::X, Vec3::Y),
        (Vec3::NEG_Z, Vec3::NEG_X, Vec3::Y),
    ];

    let mut mesh = MeshData::default();
    for (normal, u, v) in faces {
        let base = mesh.positions.len() as u32;
        for (su, sv, uv) in [
            (-1.0, -1.0, [0.0, 1.0]),
            (1.0, -1.0, [1.0, 1.0]),
            (1.0, 1.0, [1.0, 0.0]),
            (-1.0, 1.0, [0.0, 0.0]),
        ] {
            let p = (normal + u * su + v * sv) * half;
            mesh.positions.push(p.to_array());
            mesh.texcoords.push(uv);
            mesh.normals.push(normal.to_array());
            mesh.colors.push([255; 4]);
            mesh.tangents.push([u.x, u.y, u.z, 1.0]);
        }
        mesh.indices
            .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    mesh
}

/// UV sphere of radius 1.
pub fn sphere(segments: u32, rings: u32) -> MeshData {
    let segments = segments.max(3);
    let rings = rings.max(2);
    let mut mesh = MeshData::default();

    for ring in 0..=rings {
        let phi = PI * ring as f32 / rings as f32;
        let y = phi.cos();
        let ring_radius = phi.sin();

        for segment in 0..=segments {
            let theta = 2.0 * PI * segment as f32 / segments as f32;
            let x = ring_radius * theta.cos();
            let z = ring_radius * theta.sin();

            mesh.positions.push([x, y, z]);
            mesh.normals.push([x, y, z]);
            mesh.texcoords.push([
                segment as f32 / segments as f32,
                ring as f32 / rings as f32,
            ]);
            mesh.colors.push([255; 4]);
            mesh.tangents.push([-theta.sin(), 0.0, theta.cos(), 1.0]);
        }
    }

    for ring in 0..rings {
        for segment in 0..segments {
            let current = ring * (segments + 1) + segment;
            let next = current + segments + 1;
            mesh.indices
                .extend_from_slice(&[current, current + 1, next, current + 1, next + 1, next]);
        }
    }
    mesh
}

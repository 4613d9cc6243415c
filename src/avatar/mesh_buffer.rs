//! Per-instance writable copy of a shared body mesh, and the immutable snapshot
//! handed to the renderer once the apply phase of a frame is done.

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3, Vec4};
use std::io::Write;
use std::sync::Arc;

use crate::assets::mesh::MeshData;
use crate::avatar::morph_data::MorphRecord;
use crate::utils::math::normalize_or_zero;

/// Normal deltas are damped so morph edges don't shade too sharply
pub const NORMAL_SOFTEN_FACTOR: f32 = 0.65;

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct RenderVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub tangent: [f32; 3],
    pub uv: [f32; 2],
}

/// Geometry of one mesh as it stood at the end of an apply pass
#[derive(Debug, Clone, PartialEq)]
pub struct MeshSnapshot {
    pub mesh_name: String,
    pub vertices: Vec<RenderVertex>,
    pub indices: Vec<u32>,
}

impl MeshSnapshot {
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }
}

#[derive(Debug, Clone)]
pub struct WritableMesh {
    base: Arc<MeshData>,
    positions: Vec<Vec3>,
    normals: Vec<Vec3>,
    tangents: Vec<Vec3>,
    uvs: Vec<Vec2>,
    scaled_normals: Vec<Vec3>,
    scaled_tangents: Vec<Vec3>,
    clothing_weights: Vec<Vec4>,
}

impl WritableMesh {
    pub fn new(base: Arc<MeshData>) -> Self {
        let n = base.vertex_count();
        Self {
            positions: base.positions().to_vec(),
            normals: base.normals().to_vec(),
            tangents: base.tangents().to_vec(),
            uvs: base.uvs().to_vec(),
            scaled_normals: base.normals().to_vec(),
            scaled_tangents: base.tangents().to_vec(),
            clothing_weights: vec![Vec4::ZERO; n],
            base,
        }
    }

    pub fn base(&self) -> &Arc<MeshData> {
        &self.base
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    pub fn normals(&self) -> &[Vec3] {
        &self.normals
    }

    pub fn tangents(&self) -> &[Vec3] {
        &self.tangents
    }

    pub fn uvs(&self) -> &[Vec2] {
        &self.uvs
    }

    pub fn clothing_weights(&self) -> &[Vec4] {
        &self.clothing_weights
    }

    /// Add `delta * scale` to one vertex. Normals and tangents accumulate in
    /// unnormalized buffers and are re-derived from them, so applying and then
    /// removing the same amount restores the original frame.
    pub(crate) fn displace_vertex(&mut self, index: usize, delta: &MorphRecord, scale: f32) {
        if index >= self.positions.len() {
            return;
        }
        self.positions[index] += delta.position * scale;

        self.scaled_normals[index] += delta.normal * (scale * NORMAL_SOFTEN_FACTOR);
        let normal = normalize_or_zero(self.scaled_normals[index]);
        self.normals[index] = normal;

        // Gram-Schmidt the accumulated tangent against the new normal
        self.scaled_tangents[index] += delta.tangent * scale;
        let tangent = self.scaled_tangents[index].cross(normal);
        self.tangents[index] = normalize_or_zero(normal.cross(tangent));

        self.uvs[index] += delta.uv * scale;
    }

    pub(crate) fn offset_clothing_weight(&mut self, index: usize, offset: Vec3) {
        if let Some(weight) = self.clothing_weights.get_mut(index) {
            *weight += offset.extend(0.0);
        }
    }

    pub(crate) fn set_clothing_mask(&mut self, index: usize, mask: f32) {
        if let Some(weight) = self.clothing_weights.get_mut(index) {
            weight.w = mask;
        }
    }

    pub fn snapshot(&self) -> MeshSnapshot {
        let vertices = (0..self.vertex_count())
            .map(|i| RenderVertex {
                position: self.positions[i].to_array(),
                normal: self.normals[i].to_array(),
                tangent: self.tangents[i].to_array(),
                uv: self.uvs[i].to_array(),
            })
            .collect();
        let indices = self.base.faces().iter().flatten().copied().collect();
        MeshSnapshot {
            mesh_name: self.name().to_string(),
            vertices,
            indices,
        }
    }

    /// Write the current (morphed) geometry as Wavefront OBJ
    pub fn write_obj<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writeln!(writer, "# {}", self.name())?;
        for p in &self.positions {
            writeln!(writer, "v {} {} {}", p.x, p.y, p.z)?;
        }
        for n in &self.normals {
            writeln!(writer, "vn {} {} {}", n.x, n.y, n.z)?;
        }
        for uv in &self.uvs {
            writeln!(writer, "vt {} {}", uv.x, uv.y)?;
        }
        for face in self.base.faces() {
            let [a, b, c] = face.map(|i| i + 1);
            writeln!(writer, "f {a}/{a}/{a} {b}/{b}/{b} {c}/{c}/{c}")?;
        }
        Ok(())
    }
}

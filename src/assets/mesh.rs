//! Shared, read-only avatar body mesh and its binary (`.llm`) loader

use byteorder::{LittleEndian, ReadBytesExt};
use glam::{Vec2, Vec3};
use std::collections::HashMap;
use std::io::{BufRead, Read};
use tracing::{debug, info};

use crate::avatar::morph_data::MorphDeltaSet;
use crate::error::{AvatarError, AvatarResult};

pub const MESH_HEADER: &[u8] = b"Linden Binary Mesh 1.0";
const HEADER_SIZE: usize = 24;
const NAME_SIZE: usize = 64;
pub const END_MORPHS: &str = "End Morphs";

/// Placement of the mesh relative to its joint
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshPlacement {
    pub position: Vec3,
    /// Euler angles in degrees
    pub rotation_angles: Vec3,
    pub rotation_order: u8,
    pub scale: Vec3,
}

impl Default for MeshPlacement {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation_angles: Vec3::ZERO,
            rotation_order: 0,
            scale: Vec3::ONE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeshData {
    name: String,
    placement: MeshPlacement,
    positions: Vec<Vec3>,
    normals: Vec<Vec3>,
    tangents: Vec<Vec3>,
    uvs: Vec<Vec2>,
    detail_uvs: Option<Vec<Vec2>>,
    weights: Option<Vec<f32>>,
    faces: Vec<[u32; 3]>,
    joint_names: Vec<String>,
    shared_verts: HashMap<u32, u32>,
}

impl MeshData {
    /// Build a mesh in memory. All per-vertex arrays must have the same length
    /// and every face/shared-vertex index must be in range.
    pub fn from_parts(
        name: impl Into<String>,
        positions: Vec<Vec3>,
        normals: Vec<Vec3>,
        tangents: Vec<Vec3>,
        uvs: Vec<Vec2>,
        faces: Vec<[u32; 3]>,
        shared_verts: HashMap<u32, u32>,
    ) -> AvatarResult<Self> {
        let mesh = Self {
            name: name.into(),
            placement: MeshPlacement::default(),
            positions,
            normals,
            tangents,
            uvs,
            detail_uvs: None,
            weights: None,
            faces,
            joint_names: Vec::new(),
            shared_verts,
        };
        mesh.validate()?;
        Ok(mesh)
    }

    fn validate(&self) -> AvatarResult<()> {
        let n = self.positions.len();
        if self.normals.len() != n || self.tangents.len() != n || self.uvs.len() != n {
            return Err(AvatarError::malformed(format!(
                "'{}': vertex arrays disagree (positions {}, normals {}, tangents {}, uvs {})",
                self.name,
                n,
                self.normals.len(),
                self.tangents.len(),
                self.uvs.len()
            )));
        }
        if let Some(face) = self.faces.iter().find(|f| f.iter().any(|&i| i as usize >= n)) {
            return Err(AvatarError::malformed(format!("'{}': face {:?} out of range", self.name, face)));
        }
        if let Some((src, dst)) = self
            .shared_verts
            .iter()
            .find(|&(&s, &d)| s as usize >= n || d as usize >= n)
        {
            return Err(AvatarError::malformed(format!(
                "'{}': shared vertex {} -> {} out of range",
                self.name, src, dst
            )));
        }
        Ok(())
    }

    /// Parse a binary avatar mesh, returning the mesh and the morph blocks
    /// embedded in it. Embedded morphs are validated against the mesh.
    pub fn load<R: Read>(name: &str, reader: &mut R, max_morph_index: u32) -> AvatarResult<(Self, Vec<MorphDeltaSet>)> {
        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header).map_err(|e| read_err(e, name, "header"))?;
        if !header.starts_with(MESH_HEADER) {
            return Err(AvatarError::malformed(format!("'{}': not a binary mesh", name)));
        }

        let has_weights = read_u8(reader, name, "weight flag")? != 0;
        let has_detail_uvs = read_u8(reader, name, "detail flag")? != 0;
        let placement = MeshPlacement {
            position: read_vec3(reader, name, "position")?,
            rotation_angles: read_vec3(reader, name, "rotation")?,
            rotation_order: read_u8(reader, name, "rotation order")?,
            scale: read_vec3(reader, name, "scale")?,
        };

        let vertex_count = reader
            .read_u16::<LittleEndian>()
            .map_err(|e| read_err(e, name, "vertex count"))? as usize;
        let positions = read_vec3s(reader, vertex_count, name, "positions")?;
        let normals = read_vec3s(reader, vertex_count, name, "normals")?;
        let tangents = read_vec3s(reader, vertex_count, name, "tangents")?;
        let uvs = read_vec2s(reader, vertex_count, name, "uvs")?;
        let detail_uvs = if has_detail_uvs {
            Some(read_vec2s(reader, vertex_count, name, "detail uvs")?)
        } else {
            None
        };
        let weights = if has_weights {
            let mut weights = Vec::with_capacity(vertex_count);
            for _ in 0..vertex_count {
                weights.push(
                    reader
                        .read_f32::<LittleEndian>()
                        .map_err(|e| read_err(e, name, "weights"))?,
                );
            }
            Some(weights)
        } else {
            None
        };

        let face_count = reader
            .read_u16::<LittleEndian>()
            .map_err(|e| read_err(e, name, "face count"))? as usize;
        let mut faces = Vec::with_capacity(face_count);
        for _ in 0..face_count {
            let mut face = [0u32; 3];
            for slot in face.iter_mut() {
                *slot = reader
                    .read_u16::<LittleEndian>()
                    .map_err(|e| read_err(e, name, "faces"))? as u32;
            }
            faces.push(face);
        }

        let mut joint_names = Vec::new();
        if has_weights {
            let joint_count = reader
                .read_u16::<LittleEndian>()
                .map_err(|e| read_err(e, name, "joint count"))?;
            for _ in 0..joint_count {
                joint_names.push(read_name(reader, name, "joint names")?);
            }
        }

        // Morph section: named blocks until the terminator
        let mut morph_blocks = Vec::new();
        loop {
            let morph_name = read_name(reader, name, "morph name")?;
            if morph_name == END_MORPHS {
                break;
            }
            let morph = MorphDeltaSet::load_bounded(&morph_name, name, reader, max_morph_index)?;
            morph_blocks.push(morph);
        }

        let remap_count = reader
            .read_i32::<LittleEndian>()
            .map_err(|e| read_err(e, name, "remap count"))?;
        if remap_count < 0 {
            return Err(AvatarError::malformed(format!("'{}': negative remap count", name)));
        }
        let mut shared_verts = HashMap::new();
        for _ in 0..remap_count {
            let src = reader
                .read_i32::<LittleEndian>()
                .map_err(|e| read_err(e, name, "remaps"))?;
            let dst = reader
                .read_i32::<LittleEndian>()
                .map_err(|e| read_err(e, name, "remaps"))?;
            if src < 0 || dst < 0 {
                return Err(AvatarError::malformed(format!("'{}': negative remap {} -> {}", name, src, dst)));
            }
            shared_verts.insert(src as u32, dst as u32);
        }

        let mesh = Self {
            name: name.to_string(),
            placement,
            positions,
            normals,
            tangents,
            uvs,
            detail_uvs,
            weights,
            faces,
            joint_names,
            shared_verts,
        };
        mesh.validate()?;
        for morph in &morph_blocks {
            morph.validate_against(&mesh)?;
        }

        info!(
            "Loaded mesh '{}': {} vertices, {} faces, {} morphs",
            name,
            mesh.vertex_count(),
            mesh.faces.len(),
            morph_blocks.len()
        );
        Ok((mesh, morph_blocks))
    }

    /// Read an externally authored OBJ with the same vertex layout as `base`.
    /// Positions, normals and UVs come from the file (in vertex order); tangents,
    /// faces and seams are taken from the base.
    pub fn authored_from_obj<R: BufRead>(base: &MeshData, reader: R) -> AvatarResult<Self> {
        let mut positions = Vec::with_capacity(base.vertex_count());
        let mut normals = Vec::with_capacity(base.vertex_count());
        let mut uvs = Vec::with_capacity(base.vertex_count());

        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let mut parts = line.split_whitespace();
            let Some(tag) = parts.next() else { continue };
            let values: Vec<f32> = match tag {
                "v" | "vn" | "vt" => parts
                    .map(|p| p.parse::<f32>())
                    .collect::<Result<_, _>>()
                    .map_err(|e| AvatarError::malformed(format!("OBJ line {}: {}", line_no + 1, e)))?,
                _ => continue,
            };
            match (tag, values.as_slice()) {
                ("v", [x, y, z, ..]) => positions.push(Vec3::new(*x, *y, *z)),
                ("vn", [x, y, z, ..]) => normals.push(Vec3::new(*x, *y, *z)),
                ("vt", [u, v, ..]) => uvs.push(Vec2::new(*u, *v)),
                _ => {
                    return Err(AvatarError::malformed(format!(
                        "OBJ line {}: too few components for '{}'",
                        line_no + 1,
                        tag
                    )))
                }
            }
        }

        let n = base.vertex_count();
        if positions.len() != n || normals.len() != n || uvs.len() != n {
            return Err(AvatarError::malformed(format!(
                "OBJ has {} positions, {} normals, {} uvs; base '{}' has {} vertices",
                positions.len(),
                normals.len(),
                uvs.len(),
                base.name,
                n
            )));
        }
        debug!("Read authored OBJ for '{}' ({} vertices)", base.name, n);

        Ok(Self {
            name: base.name.clone(),
            placement: base.placement,
            positions,
            normals,
            tangents: base.tangents.clone(),
            uvs,
            detail_uvs: base.detail_uvs.clone(),
            weights: base.weights.clone(),
            faces: base.faces.clone(),
            joint_names: base.joint_names.clone(),
            shared_verts: base.shared_verts.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn placement(&self) -> &MeshPlacement {
        &self.placement
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

    pub fn detail_uvs(&self) -> Option<&[Vec2]> {
        self.detail_uvs.as_deref()
    }

    pub fn weights(&self) -> Option<&[f32]> {
        self.weights.as_deref()
    }

    pub fn faces(&self) -> &[[u32; 3]] {
        &self.faces
    }

    pub fn joint_names(&self) -> &[String] {
        &self.joint_names
    }

    /// Canonical UV vertex for a seam-duplicated vertex
    pub fn shared_vertex(&self, index: u32) -> Option<u32> {
        self.shared_verts.get(&index).copied()
    }
}

fn read_err(err: std::io::Error, mesh: &str, what: &str) -> AvatarError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        AvatarError::malformed(format!("'{}': truncated while reading {}", mesh, what))
    } else {
        AvatarError::Io(err)
    }
}

fn read_u8<R: Read>(reader: &mut R, mesh: &str, what: &str) -> AvatarResult<u8> {
    reader.read_u8().map_err(|e| read_err(e, mesh, what))
}

fn read_vec3<R: Read>(reader: &mut R, mesh: &str, what: &str) -> AvatarResult<Vec3> {
    let mut v = [0f32; 3];
    reader
        .read_f32_into::<LittleEndian>(&mut v)
        .map_err(|e| read_err(e, mesh, what))?;
    Ok(Vec3::from_array(v))
}

fn read_vec3s<R: Read>(reader: &mut R, count: usize, mesh: &str, what: &str) -> AvatarResult<Vec<Vec3>> {
    (0..count).map(|_| read_vec3(reader, mesh, what)).collect()
}

fn read_vec2s<R: Read>(reader: &mut R, count: usize, mesh: &str, what: &str) -> AvatarResult<Vec<Vec2>> {
    (0..count)
        .map(|_| {
            let mut v = [0f32; 2];
            reader
                .read_f32_into::<LittleEndian>(&mut v)
                .map_err(|e| read_err(e, mesh, what))?;
            Ok(Vec2::from_array(v))
        })
        .collect()
}

fn read_name<R: Read>(reader: &mut R, mesh: &str, what: &str) -> AvatarResult<String> {
    let mut buf = [0u8; NAME_SIZE];
    reader.read_exact(&mut buf).map_err(|e| read_err(e, mesh, what))?;
    Ok(String::from_utf8_lossy(&buf).trim_end_matches('\0').to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::avatar::morph_data::MorphRecord;
    use byteorder::WriteBytesExt;
    use std::io::Cursor;

    pub(crate) fn write_name(out: &mut Vec<u8>, name: &str) {
        let mut buf = [0u8; NAME_SIZE];
        buf[..name.len()].copy_from_slice(name.as_bytes());
        out.extend_from_slice(&buf);
    }

    /// Encode a mesh in the binary format (unweighted, no detail UVs)
    pub(crate) fn encode_mesh(mesh: &MeshData, morphs: &[MorphDeltaSet], remaps: &[(i32, i32)]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut header = [0u8; HEADER_SIZE];
        header[..MESH_HEADER.len()].copy_from_slice(MESH_HEADER);
        out.extend_from_slice(&header);
        out.write_u8(0).unwrap();
        out.write_u8(0).unwrap();
        for v in [Vec3::ZERO, Vec3::ZERO] {
            for c in v.to_array() {
                out.write_f32::<LittleEndian>(c).unwrap();
            }
        }
        out.write_u8(0).unwrap();
        for c in Vec3::ONE.to_array() {
            out.write_f32::<LittleEndian>(c).unwrap();
        }
        out.write_u16::<LittleEndian>(mesh.vertex_count() as u16).unwrap();
        for arr in [mesh.positions(), mesh.normals(), mesh.tangents()] {
            for v in arr {
                for c in v.to_array() {
                    out.write_f32::<LittleEndian>(c).unwrap();
                }
            }
        }
        for uv in mesh.uvs() {
            out.write_f32::<LittleEndian>(uv.x).unwrap();
            out.write_f32::<LittleEndian>(uv.y).unwrap();
        }
        out.write_u16::<LittleEndian>(mesh.faces().len() as u16).unwrap();
        for face in mesh.faces() {
            for &i in face {
                out.write_u16::<LittleEndian>(i as u16).unwrap();
            }
        }
        for morph in morphs {
            write_name(&mut out, morph.name());
            morph.save(&mut out).unwrap();
        }
        write_name(&mut out, END_MORPHS);
        out.write_i32::<LittleEndian>(remaps.len() as i32).unwrap();
        for (s, d) in remaps {
            out.write_i32::<LittleEndian>(*s).unwrap();
            out.write_i32::<LittleEndian>(*d).unwrap();
        }
        out
    }

    pub(crate) fn quad_mesh() -> MeshData {
        MeshData::from_parts(
            "quad",
            vec![Vec3::ZERO, Vec3::X, Vec3::new(1.0, 1.0, 0.0), Vec3::Y],
            vec![Vec3::Z; 4],
            vec![Vec3::X; 4],
            vec![Vec2::ZERO, Vec2::X, Vec2::ONE, Vec2::Y],
            vec![[0, 1, 2], [0, 2, 3]],
            HashMap::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_from_parts_validates() {
        let err = MeshData::from_parts("bad", vec![Vec3::ZERO; 2], vec![Vec3::Z; 1], vec![Vec3::X; 2], vec![Vec2::ZERO; 2], vec![], HashMap::new());
        assert!(matches!(err, Err(AvatarError::MalformedMesh { .. })));
        let err = MeshData::from_parts("bad", vec![Vec3::ZERO; 2], vec![Vec3::Z; 2], vec![Vec3::X; 2], vec![Vec2::ZERO; 2], vec![[0, 1, 2]], HashMap::new());
        assert!(matches!(err, Err(AvatarError::MalformedMesh { .. })));
    }

    #[test]
    fn test_load_binary_with_morph_and_remap() {
        let mesh = quad_mesh();
        let morph = MorphDeltaSet::from_records(
            "Big_Belly",
            "quad",
            &[MorphRecord { index: 2, position: Vec3::Z, normal: Vec3::ZERO, tangent: Vec3::ZERO, uv: Vec2::ZERO }],
        );
        let bytes = encode_mesh(&mesh, &[morph.clone()], &[(3, 0)]);
        let (loaded, morphs) = MeshData::load("quad", &mut Cursor::new(bytes), 10_000).unwrap();

        assert_eq!(loaded.vertex_count(), 4);
        assert_eq!(loaded.positions(), mesh.positions());
        assert_eq!(loaded.faces(), mesh.faces());
        assert_eq!(loaded.shared_vertex(3), Some(0));
        assert_eq!(loaded.shared_vertex(1), None);
        assert_eq!(morphs, vec![morph]);
    }

    #[test]
    fn test_truncated_binary_is_malformed() {
        let bytes = encode_mesh(&quad_mesh(), &[], &[]);
        for cut in [10, 60, 100, bytes.len() - 70, bytes.len() - 1] {
            let err = MeshData::load("quad", &mut Cursor::new(&bytes[..cut]), 10_000).unwrap_err();
            assert!(matches!(err, AvatarError::MalformedMesh { .. }), "cut at {}: {:?}", cut, err);
        }
    }

    #[test]
    fn test_morph_index_beyond_mesh_rejected() {
        let morph = MorphDeltaSet::from_records(
            "Bad",
            "quad",
            &[MorphRecord { index: 7, position: Vec3::Z, normal: Vec3::ZERO, tangent: Vec3::ZERO, uv: Vec2::ZERO }],
        );
        let bytes = encode_mesh(&quad_mesh(), &[morph], &[]);
        let err = MeshData::load("quad", &mut Cursor::new(bytes), 10_000).unwrap_err();
        assert!(matches!(err, AvatarError::IndexOutOfRange { index: 7, bound: 4 }));
    }

    #[test]
    fn test_authored_from_obj() {
        let base = quad_mesh();
        let obj = "# authored\nv 0 0 0.5\nv 1 0 0\nv 1 1 0\nv 0 1 0\n\
                   vn 0 0 1\nvn 0 0 1\nvn 0 0 1\nvn 0 0 1\n\
                   vt 0 0\nvt 1 0\nvt 1 1\nvt 0 1\nf 1/1/1 2/2/2 3/3/3\n";
        let authored = MeshData::authored_from_obj(&base, Cursor::new(obj)).unwrap();
        assert_eq!(authored.positions()[0], Vec3::new(0.0, 0.0, 0.5));
        assert_eq!(authored.tangents(), base.tangents());

        let short = "v 0 0 0\nvn 0 0 1\nvt 0 0\n";
        assert!(matches!(
            MeshData::authored_from_obj(&base, Cursor::new(short)),
            Err(AvatarError::MalformedMesh { .. })
        ));
    }
}

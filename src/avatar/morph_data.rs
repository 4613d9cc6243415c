//! Sparse per-vertex morph deltas and their binary block format
//!
//! Block layout (little-endian): `i32` record count, then per record a `u32`
//! vertex index, position delta (3 x f32), normal delta (3 x f32), tangent
//! delta (3 x f32) and UV delta (2 x f32).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use glam::{Vec2, Vec3};
use std::io::{Read, Write};
use tracing::debug;

use crate::assets::mesh::MeshData;
use crate::error::{AvatarError, AvatarResult};
use crate::utils::math::normalize_or_zero;

/// Largest vertex index accepted before the owning mesh is known
pub const MAX_MORPH_VERTEX_INDEX: u32 = 10_000;

/// Delta magnitude below which an authored vertex is considered unchanged
pub const SIGNIFICANT_DELTA: f32 = 0.0001;

/// One sparse entry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MorphRecord {
    pub index: u32,
    pub position: Vec3,
    pub normal: Vec3,
    pub tangent: Vec3,
    pub uv: Vec2,
}

/// Immutable morph deltas shared by every avatar that uses the owning mesh
#[derive(Debug, Clone, PartialEq)]
pub struct MorphDeltaSet {
    name: String,
    mesh_name: String,
    vertex_indices: Vec<u32>,
    coords: Vec<Vec3>,
    normals: Vec<Vec3>,
    tangents: Vec<Vec3>,
    tex_coords: Vec<Vec2>,
    total_distortion: f32,
    avg_distortion: Vec3,
    max_distortion: f32,
}

impl MorphDeltaSet {
    pub fn from_records(name: impl Into<String>, mesh_name: impl Into<String>, records: &[MorphRecord]) -> Self {
        let mut set = Self::empty(name.into(), mesh_name.into(), records.len());
        for record in records {
            set.push(record);
        }
        set.finish_stats();
        set
    }

    fn empty(name: String, mesh_name: String, capacity: usize) -> Self {
        Self {
            name,
            mesh_name,
            vertex_indices: Vec::with_capacity(capacity),
            coords: Vec::with_capacity(capacity),
            normals: Vec::with_capacity(capacity),
            tangents: Vec::with_capacity(capacity),
            tex_coords: Vec::with_capacity(capacity),
            total_distortion: 0.0,
            avg_distortion: Vec3::ZERO,
            max_distortion: 0.0,
        }
    }

    fn push(&mut self, record: &MorphRecord) {
        let magnitude = record.position.length();
        self.total_distortion += magnitude;
        self.avg_distortion += record.position.abs();
        if magnitude > self.max_distortion {
            self.max_distortion = magnitude;
        }
        self.vertex_indices.push(record.index);
        self.coords.push(record.position);
        self.normals.push(record.normal);
        self.tangents.push(record.tangent);
        self.tex_coords.push(record.uv);
    }

    // An empty set divides by zero here and normalizes to the zero vector;
    // callers guard against empty sets themselves.
    fn finish_stats(&mut self) {
        self.avg_distortion = self.avg_distortion * (1.0 / self.vertex_indices.len() as f32);
        self.avg_distortion = normalize_or_zero(self.avg_distortion);
    }

    /// Read a morph block with the default index bound
    pub fn load<R: Read>(name: &str, mesh_name: &str, reader: &mut R) -> AvatarResult<Self> {
        Self::load_bounded(name, mesh_name, reader, MAX_MORPH_VERTEX_INDEX)
    }

    /// Read a morph block. On error nothing is returned, so a caller's existing
    /// set is never partially overwritten.
    pub fn load_bounded<R: Read>(name: &str, mesh_name: &str, reader: &mut R, bound: u32) -> AvatarResult<Self> {
        let context = format!("morph '{}'", name);
        let count = reader
            .read_i32::<LittleEndian>()
            .map_err(|e| AvatarError::from_read(e, &context))?;
        if count < 0 {
            return Err(AvatarError::InvalidVertexCount { count: count as i64 });
        }
        let count = count as usize;

        // Don't trust the header for the allocation size
        let mut set = Self::empty(name.to_string(), mesh_name.to_string(), count.min(bound as usize + 1));
        for _ in 0..count {
            let record = read_record(reader, bound).map_err(|e| match e {
                AvatarError::Io(io) => AvatarError::from_read(io, &context),
                other => other,
            })?;
            set.push(&record);
        }
        set.finish_stats();
        debug!(
            "Loaded morph '{}' ({} vertices, total distortion {:.4})",
            name,
            set.len(),
            set.total_distortion
        );
        Ok(set)
    }

    /// Write the block back out; the exact inverse of [`MorphDeltaSet::load`].
    pub fn save<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_i32::<LittleEndian>(self.vertex_indices.len() as i32)?;
        for record in self.records() {
            writer.write_u32::<LittleEndian>(record.index)?;
            write_vec3(writer, record.position)?;
            write_vec3(writer, record.normal)?;
            write_vec3(writer, record.tangent)?;
            writer.write_f32::<LittleEndian>(record.uv.x)?;
            writer.write_f32::<LittleEndian>(record.uv.y)?;
        }
        Ok(())
    }

    /// Derive a morph from an authored full mesh by differencing it against
    /// `base`. Only vertices with a significant change on any channel are kept;
    /// an unchanged mesh still yields a single (zero) record.
    pub fn from_mesh_difference(
        name: &str,
        base: &MeshData,
        authored: &MeshData,
        threshold: f32,
    ) -> AvatarResult<Self> {
        if base.vertex_count() != authored.vertex_count() {
            return Err(AvatarError::malformed(format!(
                "authored mesh has {} vertices, base '{}' has {}",
                authored.vertex_count(),
                base.name(),
                base.vertex_count()
            )));
        }

        let deltas: Vec<MorphRecord> = (0..base.vertex_count())
            .map(|i| MorphRecord {
                index: i as u32,
                position: authored.positions()[i] - base.positions()[i],
                normal: authored.normals()[i] - base.normals()[i],
                tangent: authored.tangents()[i] - base.tangents()[i],
                uv: authored.uvs()[i] - base.uvs()[i],
            })
            .collect();

        let is_significant = |d: &MorphRecord| {
            d.position.length() > threshold
                || d.normal.length() > threshold
                || d.tangent.length() > threshold
                || d.uv.length() > threshold
        };

        let mut kept: Vec<MorphRecord> = deltas.iter().filter(|d| is_significant(d)).copied().collect();
        if kept.is_empty() {
            if let Some(first) = deltas.first() {
                kept.push(*first);
            }
        }
        debug!(
            "Derived morph '{}' from authored mesh: {} of {} vertices significant",
            name,
            kept.len(),
            base.vertex_count()
        );
        Ok(Self::from_records(name, base.name(), &kept))
    }

    /// Check every sparse index against the owning mesh
    pub fn validate_against(&self, mesh: &MeshData) -> AvatarResult<()> {
        let bound = mesh.vertex_count() as u32;
        match self.vertex_indices.iter().find(|&&i| i >= bound) {
            Some(&index) => Err(AvatarError::IndexOutOfRange { index, bound }),
            None => Ok(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mesh_name(&self) -> &str {
        &self.mesh_name
    }

    pub fn len(&self) -> usize {
        self.vertex_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertex_indices.is_empty()
    }

    pub fn vertex_indices(&self) -> &[u32] {
        &self.vertex_indices
    }

    pub fn coords(&self) -> &[Vec3] {
        &self.coords
    }

    pub fn normals(&self) -> &[Vec3] {
        &self.normals
    }

    pub fn tangents(&self) -> &[Vec3] {
        &self.tangents
    }

    pub fn tex_coords(&self) -> &[Vec2] {
        &self.tex_coords
    }

    pub fn total_distortion(&self) -> f32 {
        self.total_distortion
    }

    /// Unit direction of the mean absolute position delta
    pub fn avg_distortion(&self) -> Vec3 {
        self.avg_distortion
    }

    pub fn max_distortion(&self) -> f32 {
        self.max_distortion
    }

    pub fn records(&self) -> impl Iterator<Item = MorphRecord> + '_ {
        (0..self.len()).map(move |i| MorphRecord {
            index: self.vertex_indices[i],
            position: self.coords[i],
            normal: self.normals[i],
            tangent: self.tangents[i],
            uv: self.tex_coords[i],
        })
    }
}

fn read_vec3<R: Read>(reader: &mut R) -> std::io::Result<Vec3> {
    Ok(Vec3::new(
        reader.read_f32::<LittleEndian>()?,
        reader.read_f32::<LittleEndian>()?,
        reader.read_f32::<LittleEndian>()?,
    ))
}

fn write_vec3<W: Write>(writer: &mut W, v: Vec3) -> std::io::Result<()> {
    writer.write_f32::<LittleEndian>(v.x)?;
    writer.write_f32::<LittleEndian>(v.y)?;
    writer.write_f32::<LittleEndian>(v.z)
}

fn read_record<R: Read>(reader: &mut R, bound: u32) -> AvatarResult<MorphRecord> {
    let index = reader.read_u32::<LittleEndian>()?;
    if index > bound {
        return Err(AvatarError::IndexOutOfRange { index, bound });
    }
    let position = read_vec3(reader)?;
    let normal = read_vec3(reader)?;
    let tangent = read_vec3(reader)?;
    let uv = Vec2::new(reader.read_f32::<LittleEndian>()?, reader.read_f32::<LittleEndian>()?);
    Ok(MorphRecord { index, position, normal, tangent, uv })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use std::io::Cursor;

    fn record(index: u32, position: Vec3) -> MorphRecord {
        MorphRecord {
            index,
            position,
            normal: Vec3::new(0.0, 0.1, 0.0),
            tangent: Vec3::new(0.0, 0.0, -0.1),
            uv: Vec2::new(0.01, -0.02),
        }
    }

    fn encode(set: &MorphDeltaSet) -> Vec<u8> {
        let mut bytes = Vec::new();
        set.save(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn test_round_trip_preserves_bytes_and_fields() {
        let set = MorphDeltaSet::from_records(
            "Big_Belly",
            "upperBodyMesh",
            &[record(9, Vec3::new(1.0, 0.0, 0.0)), record(5, Vec3::new(0.0, 0.0, 1.0))],
        );
        let bytes = encode(&set);
        assert_eq!(bytes.len(), 4 + 2 * (4 + 11 * 4));

        let loaded = MorphDeltaSet::load("Big_Belly", "upperBodyMesh", &mut Cursor::new(&bytes)).unwrap();
        assert_eq!(loaded, set);
        assert_eq!(encode(&loaded), bytes);
        // unsorted indices are kept in stream order
        assert_eq!(loaded.vertex_indices(), &[9, 5]);
    }

    #[test]
    fn test_statistics() {
        let set = MorphDeltaSet::from_records(
            "m",
            "mesh",
            &[record(0, Vec3::new(3.0, 0.0, -4.0)), record(1, Vec3::new(0.0, 1.0, 0.0))],
        );
        assert!((set.total_distortion() - 6.0).abs() < 1e-6);
        assert!((set.max_distortion() - 5.0).abs() < 1e-6);
        // mean of |delta| is (1.5, 0.5, 2.0), normalized
        let expected = Vec3::new(1.5, 0.5, 2.0).normalize();
        assert!((set.avg_distortion() - expected).length() < 1e-6);
    }

    #[test]
    fn test_empty_block_has_zero_average() {
        let bytes = 0i32.to_le_bytes();
        let set = MorphDeltaSet::load("m", "mesh", &mut Cursor::new(&bytes[..])).unwrap();
        assert!(set.is_empty());
        assert_eq!(set.avg_distortion(), Vec3::ZERO);
        assert_eq!(set.total_distortion(), 0.0);
    }

    #[test]
    fn test_truncated_block_is_data_corruption() {
        let set = MorphDeltaSet::from_records("m", "mesh", &[record(1, Vec3::X), record(2, Vec3::Y)]);
        let mut bytes = encode(&set);
        // claim three records, provide two
        bytes[..4].copy_from_slice(&3i32.to_le_bytes());
        let err = MorphDeltaSet::load("m", "mesh", &mut Cursor::new(&bytes)).unwrap_err();
        assert!(matches!(err, AvatarError::TruncatedData { .. }));
        assert_eq!(err.category(), ErrorCategory::DataCorruption);

        let err = MorphDeltaSet::load("m", "mesh", &mut Cursor::new(&bytes[..2])).unwrap_err();
        assert!(matches!(err, AvatarError::TruncatedData { .. }));
    }

    #[test]
    fn test_index_bound_and_negative_count() {
        let set = MorphDeltaSet::from_records("m", "mesh", &[record(10_001, Vec3::X)]);
        let err = MorphDeltaSet::load("m", "mesh", &mut Cursor::new(encode(&set))).unwrap_err();
        assert!(matches!(err, AvatarError::IndexOutOfRange { index: 10_001, .. }));

        let ok = MorphDeltaSet::from_records("m", "mesh", &[record(10_000, Vec3::X)]);
        assert!(MorphDeltaSet::load("m", "mesh", &mut Cursor::new(encode(&ok))).is_ok());

        let bytes = (-1i32).to_le_bytes();
        let err = MorphDeltaSet::load("m", "mesh", &mut Cursor::new(&bytes[..])).unwrap_err();
        assert!(matches!(err, AvatarError::InvalidVertexCount { count: -1 }));
    }

    #[test]
    fn test_huge_declared_count_fails_without_allocating() {
        let bytes = i32::MAX.to_le_bytes();
        let err = MorphDeltaSet::load("m", "mesh", &mut Cursor::new(&bytes[..])).unwrap_err();
        assert!(matches!(err, AvatarError::TruncatedData { .. }));
    }

    #[test]
    fn test_unchanged_mesh_keeps_one_record() {
        let base = crate::assets::mesh::tests::quad_mesh();
        let derived = MorphDeltaSet::from_mesh_difference("Flat", &base, &base, 0.0001).unwrap();
        assert_eq!(derived.len(), 1);
        assert_eq!(derived.vertex_indices(), &[0]);
        assert_eq!(derived.coords()[0], Vec3::ZERO);
        assert_eq!(derived.mesh_name(), "quad");
    }
}

use glam::Vec2;

use crate::assets::mesh::MeshData;
use crate::assets::texture::{check_layout, TextureData};
use crate::avatar::morph_data::MorphDeltaSet;
use crate::error::AvatarResult;

/// Per-record weights sampled from a mask texture's alpha channel. There is one
/// weight per entry of the morph's sparse index list, not per mesh vertex.
#[derive(Debug, Clone, PartialEq)]
pub struct VertexMask {
    weights: Vec<f32>,
}

impl VertexMask {
    /// Nearest-sample the last channel of `pixels` at each affected vertex's UV
    /// (or its seam twin's UV).
    pub fn generate(
        data: &MorphDeltaSet,
        mesh: &MeshData,
        pixels: &[u8],
        width: u32,
        height: u32,
        components: u8,
        invert: bool,
    ) -> AvatarResult<Self> {
        check_layout(pixels, width, height, components)?;
        let c = components as usize;

        let weights = data
            .vertex_indices()
            .iter()
            .map(|&vert| {
                let uv_vert = mesh.shared_vertex(vert).unwrap_or(vert);
                let uv = mesh.uvs().get(uv_vert as usize).copied().unwrap_or(Vec2::ZERO);
                let s = ((uv.x * (width - 1) as f32) as u32).min(width - 1);
                let t = ((uv.y * (height - 1) as f32) as u32).min(height - 1);
                let texel = (t as usize * width as usize + s as usize) * c;
                let value = pixels[texel + c - 1] as f32 / 255.0;
                if invert {
                    1.0 - value
                } else {
                    value
                }
            })
            .collect();

        Ok(Self { weights })
    }

    pub fn from_texture(data: &MorphDeltaSet, mesh: &MeshData, texture: &TextureData, invert: bool) -> AvatarResult<Self> {
        Self::generate(
            data,
            mesh,
            texture.pixels(),
            texture.width(),
            texture.height(),
            texture.components(),
            invert,
        )
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn weight(&self, record: usize) -> f32 {
        self.weights.get(record).copied().unwrap_or(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avatar::morph_data::MorphRecord;
    use glam::Vec3;
    use std::collections::HashMap;

    fn corner_mesh(shared: HashMap<u32, u32>) -> MeshData {
        MeshData::from_parts(
            "mask",
            vec![Vec3::ZERO; 3],
            vec![Vec3::Z; 3],
            vec![Vec3::X; 3],
            vec![Vec2::ZERO, Vec2::ONE, Vec2::new(1.0, 0.0)],
            vec![[0, 1, 2]],
            shared,
        )
        .unwrap()
    }

    fn morph(indices: &[u32]) -> MorphDeltaSet {
        let records: Vec<_> = indices
            .iter()
            .map(|&index| MorphRecord { index, position: Vec3::Z, normal: Vec3::ZERO, tangent: Vec3::ZERO, uv: Vec2::ZERO })
            .collect();
        MorphDeltaSet::from_records("m", "mask", &records)
    }

    // 2x2 RGBA, alpha [255, 0, 0, 255]
    fn diagonal_rgba() -> Vec<u8> {
        vec![0, 0, 0, 255, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 255]
    }

    #[test]
    fn test_corner_sampling() {
        let mesh = corner_mesh(HashMap::new());
        let data = morph(&[0, 1]);

        let mask = VertexMask::generate(&data, &mesh, &diagonal_rgba(), 2, 2, 4, false).unwrap();
        assert_eq!(mask.weights(), &[1.0, 1.0]);

        let inverted = VertexMask::generate(&data, &mesh, &diagonal_rgba(), 2, 2, 4, true).unwrap();
        assert_eq!(inverted.weights(), &[0.0, 0.0]);
    }

    #[test]
    fn test_shared_vertex_uv_is_used() {
        // vertex 2 sits at UV (1, 0) but shares vertex 1's UV
        let data = morph(&[2]);
        let plain = VertexMask::generate(&data, &corner_mesh(HashMap::new()), &diagonal_rgba(), 2, 2, 4, false).unwrap();
        assert_eq!(plain.weights(), &[0.0]);

        let seamed = VertexMask::generate(&data, &corner_mesh(HashMap::from([(2, 1)])), &diagonal_rgba(), 2, 2, 4, false)
            .unwrap();
        assert_eq!(seamed.weights(), &[1.0]);
    }

    #[test]
    fn test_weights_in_unit_range_and_clamped() {
        // UVs outside [0,1] clamp onto the edge
        let mesh = MeshData::from_parts(
            "mask",
            vec![Vec3::ZERO; 3],
            vec![Vec3::Z; 3],
            vec![Vec3::X; 3],
            vec![Vec2::new(-3.0, -1.0), Vec2::new(7.0, 9.0), Vec2::new(f32::NAN, 0.5)],
            vec![[0, 1, 2]],
            HashMap::new(),
        )
        .unwrap();
        let gray: Vec<u8> = (0..9).map(|i| (i * 31) as u8).collect();
        let mask = VertexMask::generate(&morph(&[0, 1, 2]), &mesh, &gray, 3, 3, 1, false).unwrap();
        assert!(mask.weights().iter().all(|w| (0.0..=1.0).contains(w)));
        assert_eq!(mask.weights()[0], 0.0);
        assert_eq!(mask.weights()[1], 248.0 / 255.0);
    }

    #[test]
    fn test_bad_layout_rejected() {
        let mesh = corner_mesh(HashMap::new());
        assert!(VertexMask::generate(&morph(&[0]), &mesh, &[0; 3], 2, 2, 4, false).is_err());
    }
}

//! Per-instance application of a shared morph delta set
//!
//! A `MorphTarget` remembers the weight it last wrote into the instance mesh and
//! only ever applies the difference, so calling [`MorphTarget::apply`] every
//! frame costs nothing while the weight is steady.

use glam::Vec3;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::assets::mesh::MeshData;
use crate::avatar::mesh_buffer::WritableMesh;
use crate::avatar::morph_data::MorphDeltaSet;
use crate::avatar::param::{ApplyOutcome, ParamInfo};
use crate::avatar::skeleton::{JointHierarchy, JointId};
use crate::avatar::vertex_mask::VertexMask;
use crate::avatar::Sex;
use crate::error::{AvatarError, AvatarResult};

/// A collision volume moved and scaled in step with a morph
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeMorph {
    pub volume: JointId,
    pub scale: Vec3,
    pub position: Vec3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MorphState {
    Idle,
    Applied,
    MaskPending,
}

#[derive(Debug, Clone)]
pub struct MorphTarget {
    info: Arc<ParamInfo>,
    clothing_morph: bool,
    data: Arc<MorphDeltaSet>,
    volume_morphs: Vec<VolumeMorph>,
    mask: Option<VertexMask>,
    mask_pending: bool,
    cur_weight: f32,
    last_weight: f32,
}

impl MorphTarget {
    pub fn new(
        info: Arc<ParamInfo>,
        data: Arc<MorphDeltaSet>,
        mesh: &MeshData,
        clothing_morph: bool,
        volume_morphs: Vec<VolumeMorph>,
    ) -> AvatarResult<Self> {
        if data.mesh_name() != mesh.name() {
            return Err(AvatarError::Configuration {
                reason: format!(
                    "morph '{}' belongs to mesh '{}', not '{}'",
                    data.name(),
                    data.mesh_name(),
                    mesh.name()
                ),
            });
        }
        data.validate_against(mesh)?;
        let cur_weight = info.sanitize(info.default);
        Ok(Self {
            info,
            clothing_morph,
            data,
            volume_morphs,
            mask: None,
            mask_pending: false,
            cur_weight,
            last_weight: 0.0,
        })
    }

    pub fn info(&self) -> &ParamInfo {
        &self.info
    }

    pub fn mesh_name(&self) -> &str {
        self.data.mesh_name()
    }

    pub fn data(&self) -> &Arc<MorphDeltaSet> {
        &self.data
    }

    pub fn mask(&self) -> Option<&VertexMask> {
        self.mask.as_ref()
    }

    pub fn volume_morphs(&self) -> &[VolumeMorph] {
        &self.volume_morphs
    }

    pub fn weight(&self) -> f32 {
        self.cur_weight
    }

    pub fn last_weight(&self) -> f32 {
        self.last_weight
    }

    pub fn state(&self) -> MorphState {
        if self.mask_pending {
            MorphState::MaskPending
        } else if self.last_weight != 0.0 {
            MorphState::Applied
        } else {
            MorphState::Idle
        }
    }

    /// Store a new weight, clamped into range. Mesh buffers are untouched until
    /// the next apply.
    pub fn set_weight(&mut self, weight: f32) {
        self.cur_weight = self.info.sanitize(weight);
    }

    pub fn effective_weight(&self, sex: Sex) -> f32 {
        self.info.effective(self.cur_weight, sex)
    }

    pub fn apply(&mut self, sex: Sex, mesh: &mut WritableMesh, skeleton: &mut JointHierarchy) -> ApplyOutcome {
        if self.mask_pending {
            return ApplyOutcome::Deferred;
        }
        if !self.last_weight.is_finite() {
            warn!("Morph '{}' had a non-finite applied weight, resetting", self.info.name);
            self.last_weight = 0.0;
        }

        let effective = self.effective_weight(sex);
        let delta = effective - self.last_weight;
        if delta == 0.0 {
            return ApplyOutcome::Unchanged;
        }

        self.displace(mesh, delta);
        self.offset_volumes(skeleton, delta);
        self.last_weight = effective;
        ApplyOutcome::Applied
    }

    fn displace(&self, mesh: &mut WritableMesh, delta: f32) {
        for (i, record) in self.data.records().enumerate() {
            let mask_weight = self.mask.as_ref().map_or(1.0, |m| m.weight(i));
            let scale = delta * mask_weight;
            let index = record.index as usize;
            mesh.displace_vertex(index, &record, scale);
            if self.clothing_morph {
                mesh.offset_clothing_weight(index, record.position * scale);
                mesh.set_clothing_mask(index, mask_weight);
            }
        }
    }

    fn offset_volumes(&self, skeleton: &mut JointHierarchy, delta: f32) {
        for volume in &self.volume_morphs {
            skeleton.offset_joint(volume.volume, volume.position * delta, volume.scale * delta);
        }
    }

    /// Remove everything this morph currently contributes and mark it unapplied
    fn remove_contribution(&mut self, mesh: &mut WritableMesh, skeleton: &mut JointHierarchy) {
        if self.last_weight != 0.0 && self.last_weight.is_finite() {
            self.displace(mesh, -self.last_weight);
            self.offset_volumes(skeleton, -self.last_weight);
        }
        self.last_weight = 0.0;
    }

    /// Note that a mask texture has been requested but not delivered. The morph
    /// keeps its current contribution and defers until the mask arrives.
    pub fn request_mask(&mut self) {
        debug!("Morph '{}' waiting for mask texture", self.info.name);
        self.mask_pending = true;
    }

    /// Replace the vertex mask. The old contribution is removed here; the next
    /// apply re-adds the morph from zero through the new mask.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_mask(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        components: u8,
        invert: bool,
        mesh: &mut WritableMesh,
        skeleton: &mut JointHierarchy,
    ) -> AvatarResult<()> {
        let mask = VertexMask::generate(&self.data, mesh.base(), pixels, width, height, components, invert)?;
        self.remove_contribution(mesh, skeleton);
        if self.clothing_morph {
            for (&index, &weight) in self.data.vertex_indices().iter().zip(mask.weights()) {
                mesh.set_clothing_mask(index as usize, weight);
            }
        }
        self.mask = Some(mask);
        self.mask_pending = false;
        Ok(())
    }

    /// Subtract the masked contribution and drop the mask
    pub fn undo_mask(&mut self, mesh: &mut WritableMesh, skeleton: &mut JointHierarchy) {
        self.remove_contribution(mesh, skeleton);
        self.mask = None;
        self.mask_pending = false;
    }

    /// Swap in a rebased delta set without a visible pop: the old deltas are
    /// subtracted at the applied weight and the new ones added at the same
    /// weight. Driven volumes are left alone.
    pub fn set_morph_data(&mut self, data: Arc<MorphDeltaSet>, mesh: &mut WritableMesh) -> AvatarResult<()> {
        if data.mesh_name() != self.data.mesh_name() {
            return Err(AvatarError::Configuration {
                reason: format!(
                    "cannot rebase '{}' onto a morph for mesh '{}'",
                    self.info.name,
                    data.mesh_name()
                ),
            });
        }
        data.validate_against(mesh.base())?;

        let weight = if self.last_weight.is_finite() { self.last_weight } else { 0.0 };
        if weight != 0.0 {
            self.displace(mesh, -weight);
        }
        if self.mask.take().is_some() {
            warn!("Dropping vertex mask of '{}' on rebase", self.info.name);
        }
        self.data = data;
        if weight != 0.0 {
            self.displace(mesh, weight);
        }
        self.last_weight = weight;
        Ok(())
    }
}

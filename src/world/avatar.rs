//! A live avatar instance: its own skeleton, writable meshes, visual
//! parameters and baked appearance. All mutation happens in [`Avatar::update`];
//! [`Avatar::snapshot`] then copies out what the renderer draws.

use glam::Mat4;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::assets::texture::TextureData;
use crate::avatar::composite::{BakeRegion, CompositeAppearance};
use crate::avatar::library::AvatarLibrary;
use crate::avatar::mesh_buffer::{MeshSnapshot, WritableMesh};
use crate::avatar::morph_data::MorphDeltaSet;
use crate::avatar::morph_target::{MorphTarget, VolumeMorph};
use crate::avatar::param::{fold_global_color, ApplyOutcome, ApplyTargets, ColorParam, SkeletalDistortion, VisualParam};
use crate::avatar::skeleton::JointHierarchy;
use crate::avatar::Sex;
use crate::config::AvatarSettings;
use crate::error::{AvatarError, AvatarResult};

/// Everything the renderer needs for one avatar in one frame
#[derive(Debug, Clone)]
pub struct AvatarFrame {
    pub avatar_id: Uuid,
    pub meshes: Vec<MeshSnapshot>,
    /// World matrix per joint, indexed by `JointId::index`
    pub joints: Vec<Mat4>,
    pub textures: BTreeMap<BakeRegion, Uuid>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateStats {
    pub applied: usize,
    pub deferred: usize,
    pub baked: usize,
}

#[derive(Debug, Clone, Copy)]
struct PendingMask {
    param: usize,
    invert: bool,
}

#[derive(Debug)]
pub struct Avatar {
    id: Uuid,
    name: String,
    sex: Sex,
    skeleton: JointHierarchy,
    meshes: BTreeMap<String, WritableMesh>,
    params: Vec<VisualParam>,
    param_index: HashMap<i32, usize>,
    global_colors: Vec<String>,
    appearance: CompositeAppearance,
    pending_masks: HashMap<Uuid, Vec<PendingMask>>,
}

fn commit_weight(param: &mut VisualParam, weight: f32) -> AvatarResult<()> {
    param.set_weight(weight);
    if weight.is_finite() {
        Ok(())
    } else {
        Err(AvatarError::NumericAnomaly { name: param.info().name.clone() })
    }
}

impl Avatar {
    pub fn new(id: Uuid, name: impl Into<String>, library: &AvatarLibrary, settings: &AvatarSettings) -> Self {
        let name = name.into();
        let skeleton = library.skeleton().build();
        let definition = library.definition();

        let meshes: BTreeMap<String, WritableMesh> = library
            .mesh_names()
            .filter_map(|mesh_type| library.mesh(mesh_type))
            .map(|mesh| (mesh.name().to_string(), WritableMesh::new(mesh)))
            .collect();

        let mut params = Vec::with_capacity(definition.param_count());
        for mesh_def in definition.meshes.iter().filter(|m| m.lod == 0) {
            let Some(mesh) = library.mesh(&mesh_def.mesh_type) else {
                continue;
            };
            for morph in &mesh_def.morphs {
                let Some(data) = library.morph(&mesh_def.mesh_type, &morph.info.name) else {
                    warn!("No morph data for '{}' on '{}'", morph.info.name, mesh_def.mesh_type);
                    continue;
                };
                let volumes = morph
                    .volume_morphs
                    .iter()
                    .filter_map(|v| match skeleton.get_joint(&v.volume) {
                        Some(volume) => Some(VolumeMorph { volume, scale: v.scale, position: v.position }),
                        None => {
                            warn!("Morph '{}' drives unknown volume '{}'", morph.info.name, v.volume);
                            None
                        }
                    })
                    .collect();
                match MorphTarget::new(morph.info.clone(), data, &mesh, morph.clothing_morph, volumes) {
                    Ok(target) => params.push(VisualParam::Morph(target)),
                    Err(e) => warn!("Skipping morph '{}': {}", morph.info.name, e),
                }
            }
        }
        for skel in &definition.skeletal_params {
            params.push(VisualParam::Volume(SkeletalDistortion::new(skel.info.clone(), &skel.bones, &skeleton)));
        }
        for global in &definition.global_colors {
            for color in &global.params {
                params.push(VisualParam::Color(ColorParam::new(
                    color.info.clone(),
                    global.name.clone(),
                    color.operation,
                    color.stops.clone(),
                )));
            }
        }

        let mut param_index = HashMap::new();
        for (i, param) in params.iter().enumerate() {
            let id = param.info().id;
            if param_index.contains_key(&id) {
                warn!("Duplicate param id {} ('{}'), keeping the first", id, param.info().name);
            } else {
                param_index.insert(id, i);
            }
        }

        let mut appearance = CompositeAppearance::new(settings.baking.resolution, settings.baking.fallback_texture);
        for set in &definition.layer_sets {
            appearance.set_layers(set.region, set.layers.clone());
        }

        info!("Created avatar '{}' ({}) with {} params", name, id, params.len());
        Self {
            id,
            name,
            sex: settings.deformation.default_sex,
            skeleton,
            meshes,
            params,
            param_index,
            global_colors: definition.global_colors.iter().map(|g| g.name.clone()).collect(),
            appearance,
            pending_masks: HashMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sex(&self) -> Sex {
        self.sex
    }

    /// Takes effect on the next update; sex-restricted params fall back to
    /// their defaults.
    pub fn set_sex(&mut self, sex: Sex) {
        if self.sex != sex {
            debug!("Avatar {} sex -> {:?}", self.id, sex);
            self.sex = sex;
        }
    }

    pub fn skeleton(&self) -> &JointHierarchy {
        &self.skeleton
    }

    pub fn mesh(&self, mesh_type: &str) -> Option<&WritableMesh> {
        self.meshes.get(mesh_type)
    }

    pub fn appearance(&self) -> &CompositeAppearance {
        &self.appearance
    }

    pub fn params(&self) -> &[VisualParam] {
        &self.params
    }

    pub fn param(&self, id: i32) -> Option<&VisualParam> {
        self.param_index.get(&id).map(|&i| &self.params[i])
    }

    fn param_slot(&self, id: i32) -> AvatarResult<usize> {
        self.param_index.get(&id).copied().ok_or_else(|| AvatarError::Configuration {
            reason: format!("unknown visual param {}", id),
        })
    }

    pub fn param_weight(&self, id: i32) -> Option<f32> {
        self.param(id).map(VisualParam::weight)
    }

    /// Set a weight, clamped into the param's range. A non-finite weight is
    /// still committed as 0 but reported as `NumericAnomaly`.
    pub fn set_param_weight(&mut self, id: i32, weight: f32) -> AvatarResult<()> {
        let slot = self.param_slot(id)?;
        commit_weight(&mut self.params[slot], weight)
    }

    pub fn set_param_weight_by_name(&mut self, name: &str, weight: f32) -> AvatarResult<()> {
        let param = self
            .params
            .iter_mut()
            .find(|p| p.info().name == name)
            .ok_or_else(|| AvatarError::Configuration {
                reason: format!("unknown visual param '{}'", name),
            })?;
        commit_weight(param, weight)
    }

    /// Ask for a morph to be masked by `texture`. The morph defers until the
    /// texture data arrives through [`Avatar::on_texture_data_available`].
    pub fn request_morph_mask(&mut self, param_id: i32, texture: Uuid, invert: bool) -> AvatarResult<()> {
        let slot = self.param_slot(param_id)?;
        let morph = self.params[slot].as_morph_mut().ok_or_else(|| AvatarError::Configuration {
            reason: format!("param {} is not a morph", param_id),
        })?;
        morph.request_mask();
        self.pending_masks
            .entry(texture)
            .or_default()
            .push(PendingMask { param: slot, invert });
        Ok(())
    }

    /// Route a delivered texture to the morphs waiting on it as a mask, then
    /// to the compositor if a wearable slot uses it.
    pub fn on_texture_data_available(&mut self, region: BakeRegion, texture: Uuid, data: Arc<TextureData>) {
        let masked = self.pending_masks.remove(&texture);
        if let Some(pending) = &masked {
            for request in pending {
                let Some(morph) = self.params[request.param].as_morph_mut() else {
                    continue;
                };
                let Some(mesh) = self.meshes.get_mut(morph.mesh_name()) else {
                    continue;
                };
                let result = morph.apply_mask(
                    data.pixels(),
                    data.width(),
                    data.height(),
                    data.components(),
                    request.invert,
                    mesh,
                    &mut self.skeleton,
                );
                if let Err(e) = result {
                    warn!("Mask {} for '{}' unusable, dropping mask: {}", texture, morph.info().name, e);
                    morph.undo_mask(mesh, &mut self.skeleton);
                }
            }
        }
        if masked.is_some() && !self.appearance.references(texture) {
            return;
        }
        self.appearance.on_texture_data_available(region, texture, data);
    }

    pub fn set_local_texture(&mut self, slot: &str, texture: Option<Uuid>) -> bool {
        self.appearance.set_local_texture(slot, texture)
    }

    /// Apply phase: every parameter once, differentially; then push changed
    /// global colors, refresh joint matrices and re-bake dirty regions.
    pub fn update(&mut self) -> UpdateStats {
        let mut stats = UpdateStats::default();
        let mut colors_changed = false;
        let mut targets = ApplyTargets {
            meshes: &mut self.meshes,
            skeleton: &mut self.skeleton,
        };
        for param in &mut self.params {
            match param.apply(self.sex, &mut targets) {
                ApplyOutcome::Applied => {
                    stats.applied += 1;
                    colors_changed |= matches!(param, VisualParam::Color(_));
                }
                ApplyOutcome::Deferred => stats.deferred += 1,
                ApplyOutcome::Unchanged => {}
            }
        }

        if colors_changed {
            for name in &self.global_colors {
                let contributors = self
                    .params
                    .iter()
                    .filter_map(VisualParam::as_color)
                    .filter(|c| c.global_color() == name);
                let color = fold_global_color(contributors, self.sex);
                self.appearance.set_global_color(name, color);
            }
        }

        self.skeleton.refresh_world_transforms();
        stats.baked = self.appearance.refresh_dirty().len();
        stats
    }

    /// Render phase: copy out the state left by the last update
    pub fn snapshot(&self) -> AvatarFrame {
        let joints = self
            .skeleton
            .joints()
            .map(|(id, _)| self.skeleton.world_matrix(id))
            .collect();
        let textures = self
            .appearance
            .regions()
            .map(|region| (region, self.appearance.texture_for(region)))
            .collect();
        AvatarFrame {
            avatar_id: self.id,
            meshes: self.meshes.values().map(WritableMesh::snapshot).collect(),
            joints,
            textures,
        }
    }

    pub fn export_obj<W: Write>(&self, mesh_type: &str, writer: &mut W) -> AvatarResult<()> {
        let mesh = self.meshes.get(mesh_type).ok_or_else(|| AvatarError::Configuration {
            reason: format!("avatar has no mesh '{}'", mesh_type),
        })?;
        mesh.write_obj(writer)?;
        Ok(())
    }

    /// Move the morph `(mesh_type, morph)` onto a new shared delta set. Returns
    /// false when this avatar has no such morph.
    pub fn rebase_morph(&mut self, mesh_type: &str, morph: &str, data: Arc<MorphDeltaSet>) -> AvatarResult<bool> {
        let Some(target) = self
            .params
            .iter_mut()
            .filter_map(VisualParam::as_morph_mut)
            .find(|m| m.mesh_name() == mesh_type && m.data().name() == morph)
        else {
            return Ok(false);
        };
        let mesh = self.meshes.get_mut(mesh_type).ok_or_else(|| AvatarError::Configuration {
            reason: format!("avatar has no mesh '{}'", mesh_type),
        })?;
        target.set_morph_data(data, mesh)?;
        Ok(true)
    }
}

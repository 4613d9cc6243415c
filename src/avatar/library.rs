use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::assets::cache::AssetCache;
use crate::assets::mesh::MeshData;
use crate::avatar::definition::{parse_avatar_definition, parse_skeleton, AvatarDefinition, SkeletonDefinition};
use crate::avatar::morph_data::MorphDeltaSet;
use crate::config::DeformationSettings;
use crate::error::{AvatarError, AvatarResult};

/// Morph sets are keyed by (mesh type, morph name)
pub type MorphKey = (String, String);

/// Everything avatars of one definition share: parsed descriptions plus the
/// immutable meshes and morph sets, reference counted across instances.
#[derive(Debug)]
pub struct AvatarLibrary {
    definition: AvatarDefinition,
    skeleton: SkeletonDefinition,
    meshes: AssetCache<String, MeshData>,
    morphs: AssetCache<MorphKey, MorphDeltaSet>,
}

impl AvatarLibrary {
    /// Read an avatar definition plus the skeleton and mesh files it names,
    /// resolved relative to the definition file. A mesh that fails to load is
    /// skipped; avatars simply lack its morphs.
    pub fn load(definition_path: &Path, settings: &DeformationSettings) -> AvatarResult<Self> {
        let base_dir = definition_path.parent().unwrap_or_else(|| Path::new("."));
        let definition = parse_avatar_definition(&fs::read_to_string(definition_path)?)?;

        let skeleton_file = definition.skeleton_file.as_deref().ok_or_else(|| AvatarError::Configuration {
            reason: format!("{} names no skeleton file", definition_path.display()),
        })?;
        let skeleton = parse_skeleton(&fs::read_to_string(base_dir.join(skeleton_file))?)?;

        let mut meshes = Vec::new();
        for mesh_def in &definition.meshes {
            if mesh_def.lod != 0 {
                debug!("Skipping LOD {} of '{}'", mesh_def.lod, mesh_def.mesh_type);
                continue;
            }
            let path = base_dir.join(&mesh_def.file_name);
            let loaded = File::open(&path).map_err(AvatarError::from).and_then(|file| {
                MeshData::load(
                    &mesh_def.mesh_type,
                    &mut BufReader::new(file),
                    settings.max_morph_vertex_index,
                )
            });
            match loaded {
                Ok(mesh) => meshes.push(mesh),
                Err(e) => warn!("Skipping mesh '{}' ({}): {}", mesh_def.mesh_type, path.display(), e),
            }
        }

        Self::from_definitions(definition, skeleton, meshes)
    }

    /// Assemble a library from already parsed parts. Morph sets that don't fit
    /// their mesh are dropped.
    pub fn from_definitions(
        definition: AvatarDefinition,
        skeleton: SkeletonDefinition,
        meshes: Vec<(MeshData, Vec<MorphDeltaSet>)>,
    ) -> AvatarResult<Self> {
        let mut library = Self {
            definition,
            skeleton,
            meshes: AssetCache::new(),
            morphs: AssetCache::new(),
        };
        for (mesh, morphs) in meshes {
            let mesh = Arc::new(mesh);
            for morph in morphs {
                if let Err(e) = library.check_morph(&mesh, &morph) {
                    warn!("Dropping morph '{}' of '{}': {}", morph.name(), mesh.name(), e);
                    continue;
                }
                library
                    .morphs
                    .insert((mesh.name().to_string(), morph.name().to_string()), Arc::new(morph));
            }
            library.meshes.insert(mesh.name().to_string(), mesh);
        }
        info!(
            "Avatar library ready: {} meshes, {} morph sets, {} joints",
            library.meshes.len(),
            library.morphs.len(),
            library.skeleton.joints.len()
        );
        Ok(library)
    }

    fn check_morph(&self, mesh: &MeshData, morph: &MorphDeltaSet) -> AvatarResult<()> {
        if morph.mesh_name() != mesh.name() {
            return Err(AvatarError::Configuration {
                reason: format!("morph is for mesh '{}'", morph.mesh_name()),
            });
        }
        morph.validate_against(mesh)
    }

    pub fn definition(&self) -> &AvatarDefinition {
        &self.definition
    }

    pub fn skeleton(&self) -> &SkeletonDefinition {
        &self.skeleton
    }

    pub fn mesh(&self, mesh_type: &str) -> Option<Arc<MeshData>> {
        self.meshes.get(&mesh_type.to_string())
    }

    pub fn mesh_names(&self) -> impl Iterator<Item = &String> {
        self.meshes.keys()
    }

    pub fn morph(&self, mesh_type: &str, name: &str) -> Option<Arc<MorphDeltaSet>> {
        self.morphs.get(&(mesh_type.to_string(), name.to_string()))
    }

    /// Swap the shared morph set for `(data.mesh_name(), data.name())`.
    /// Avatars keep the set they hold until rebased onto the returned one.
    pub fn replace_morph(&mut self, data: MorphDeltaSet) -> AvatarResult<Arc<MorphDeltaSet>> {
        let mesh = self.mesh(data.mesh_name()).ok_or_else(|| AvatarError::Configuration {
            reason: format!("no mesh '{}' for morph '{}'", data.mesh_name(), data.name()),
        })?;
        self.check_morph(&mesh, &data)?;
        let data = Arc::new(data);
        self.morphs
            .insert((data.mesh_name().to_string(), data.name().to_string()), data.clone());
        info!("Replaced morph '{}' on '{}'", data.name(), data.mesh_name());
        Ok(data)
    }
}

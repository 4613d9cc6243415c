//! Character deformation and appearance compositing

pub mod composite;
pub mod definition;
pub mod library;
pub mod mesh_buffer;
pub mod morph_data;
pub mod morph_target;
pub mod param;
pub mod skeleton;
pub mod vertex_mask;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

pub use composite::{BakeRegion, BakeTicket, BakedTexture, CompositeAppearance, LayerDefinition, TintSource};
pub use definition::{parse_avatar_definition, parse_skeleton, AvatarDefinition, SkeletonDefinition};
pub use library::AvatarLibrary;
pub use mesh_buffer::{MeshSnapshot, RenderVertex, WritableMesh};
pub use morph_data::{MorphDeltaSet, MorphRecord};
pub use morph_target::{MorphState, MorphTarget, VolumeMorph};
pub use param::{ApplyOutcome, ApplyTargets, ColorOperation, ColorParam, ParamInfo, SkeletalDistortion, VisualParam};
pub use skeleton::{JointHierarchy, JointId, JointKind, Transform};
pub use vertex_mask::VertexMask;

/// Logical character sex, used to gate sex-specific morphs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Female,
    Male,
}

bitflags! {
    /// Which sexes a parameter affects
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SexMask: u8 {
        const FEMALE = 0b01;
        const MALE = 0b10;
        const BOTH = Self::FEMALE.bits() | Self::MALE.bits();
    }
}

impl SexMask {
    pub fn allows(self, sex: Sex) -> bool {
        self.contains(SexMask::from(sex))
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "female" => Some(SexMask::FEMALE),
            "male" => Some(SexMask::MALE),
            "both" => Some(SexMask::BOTH),
            _ => None,
        }
    }
}

impl From<Sex> for SexMask {
    fn from(sex: Sex) -> Self {
        match sex {
            Sex::Female => SexMask::FEMALE,
            Sex::Male => SexMask::MALE,
        }
    }
}

//! Visual parameters: morphs, global colors and skeletal distortions behind one
//! tagged variant, each applied differentially once per frame.

use glam::{Vec3, Vec4};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

use crate::avatar::definition::BoneDelta;
use crate::avatar::mesh_buffer::WritableMesh;
use crate::avatar::morph_target::MorphTarget;
use crate::avatar::skeleton::{JointHierarchy, JointId};
use crate::avatar::{Sex, SexMask};

/// Immutable description shared by every instance of a parameter
#[derive(Debug, Clone, PartialEq)]
pub struct ParamInfo {
    pub id: i32,
    pub name: String,
    pub group: u8,
    pub wearable: Option<String>,
    pub min: f32,
    pub max: f32,
    pub default: f32,
    pub sex: SexMask,
}

impl ParamInfo {
    pub fn new(id: i32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            group: 0,
            wearable: None,
            min: 0.0,
            max: 1.0,
            default: 0.0,
            sex: SexMask::BOTH,
        }
    }

    /// Clamp a requested weight into range. A non-finite weight is treated as a
    /// corrupted commit and reset to 0 first.
    pub fn sanitize(&self, weight: f32) -> f32 {
        let weight = if weight.is_finite() {
            weight
        } else {
            warn!("Non-finite weight {} for param '{}' ({}), resetting to 0", weight, self.name, self.id);
            0.0
        };
        weight.max(self.min).min(self.max)
    }

    /// Position of `weight` within [min, max], in 0..1
    pub fn normalized(&self, weight: f32) -> f32 {
        let range = self.max - self.min;
        if range > 0.0 {
            ((weight - self.min) / range).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// The weight to apply for `sex`: the current weight when the param affects
    /// that sex, its default otherwise
    pub fn effective(&self, current: f32, sex: Sex) -> f32 {
        if self.sex.allows(sex) {
            current
        } else {
            self.default
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Effective weight unchanged since the last apply
    Unchanged,
    Applied,
    /// Waiting on a resource (mask texture)
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorOperation {
    Add,
    Multiply,
    Blend,
}

impl ColorOperation {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "add" => Some(ColorOperation::Add),
            "multiply" => Some(ColorOperation::Multiply),
            "blend" => Some(ColorOperation::Blend),
            _ => None,
        }
    }
}

/// One contributor to a global tint
#[derive(Debug, Clone)]
pub struct ColorParam {
    info: Arc<ParamInfo>,
    global_color: String,
    operation: ColorOperation,
    stops: Arc<[Vec4]>,
    cur_weight: f32,
    last_weight: Option<f32>,
}

impl ColorParam {
    pub fn new(info: Arc<ParamInfo>, global_color: impl Into<String>, operation: ColorOperation, stops: Arc<[Vec4]>) -> Self {
        let cur_weight = info.sanitize(info.default);
        Self {
            info,
            global_color: global_color.into(),
            operation,
            stops,
            cur_weight,
            last_weight: None,
        }
    }

    pub fn global_color(&self) -> &str {
        &self.global_color
    }

    pub fn operation(&self) -> ColorOperation {
        self.operation
    }

    /// Color for the current weight, interpolated between neighbouring stops
    pub fn net_color(&self, sex: Sex) -> Vec4 {
        match self.stops.len() {
            0 => Vec4::ONE,
            1 => self.stops[0],
            n => {
                let weight = self.info.normalized(self.info.effective(self.cur_weight, sex));
                let scaled = weight * (n - 1) as f32;
                let start = (scaled as usize).min(n - 1);
                if start == n - 1 {
                    self.stops[n - 1]
                } else {
                    self.stops[start].lerp(self.stops[start + 1], scaled - start as f32)
                }
            }
        }
    }

    /// Fold this contribution into a running global color
    pub fn accumulate(&self, net: Vec4, sex: Sex) -> Vec4 {
        let color = self.net_color(sex);
        match self.operation {
            ColorOperation::Add => net + color,
            ColorOperation::Multiply => net * color,
            ColorOperation::Blend => {
                let t = self.info.normalized(self.info.effective(self.cur_weight, sex));
                net.lerp(color, t)
            }
        }
    }

    fn apply(&mut self, sex: Sex) -> ApplyOutcome {
        let effective = self.info.effective(self.cur_weight, sex);
        if self.last_weight == Some(effective) {
            return ApplyOutcome::Unchanged;
        }
        self.last_weight = Some(effective);
        ApplyOutcome::Applied
    }
}

/// Fold every contributor to one global color in definition order, starting
/// from transparent black. A global color without contributors is white.
pub fn fold_global_color<'a>(params: impl IntoIterator<Item = &'a ColorParam>, sex: Sex) -> Vec4 {
    let mut iter = params.into_iter().peekable();
    if iter.peek().is_none() {
        return Vec4::ONE;
    }
    iter.fold(Vec4::ZERO, |net, param| param.accumulate(net, sex))
        .clamp(Vec4::ZERO, Vec4::ONE)
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoneDistortion {
    pub joint: JointId,
    pub scale: Vec3,
    pub offset: Vec3,
}

/// Per-joint scale/offset deltas driven by a weight
#[derive(Debug, Clone)]
pub struct SkeletalDistortion {
    info: Arc<ParamInfo>,
    bones: Vec<BoneDistortion>,
    cur_weight: f32,
    last_weight: f32,
}

impl SkeletalDistortion {
    /// Resolve bone deltas against the instance skeleton. Unknown joints are
    /// skipped.
    pub fn new(info: Arc<ParamInfo>, bones: &[BoneDelta], skeleton: &JointHierarchy) -> Self {
        let bones = bones
            .iter()
            .filter_map(|bone| match skeleton.get_joint(&bone.name) {
                Some(joint) => Some(BoneDistortion { joint, scale: bone.scale, offset: bone.offset }),
                None => {
                    warn!("Skeletal param '{}' references unknown joint '{}', skipping", info.name, bone.name);
                    None
                }
            })
            .collect();
        let cur_weight = info.sanitize(info.default);
        Self {
            info,
            bones,
            cur_weight,
            last_weight: 0.0,
        }
    }

    pub fn bones(&self) -> &[BoneDistortion] {
        &self.bones
    }

    pub fn apply(&mut self, sex: Sex, skeleton: &mut JointHierarchy) -> ApplyOutcome {
        let effective = self.info.effective(self.cur_weight, sex);
        let delta = effective - self.last_weight;
        if delta == 0.0 {
            return ApplyOutcome::Unchanged;
        }
        for bone in &self.bones {
            skeleton.offset_joint(bone.joint, bone.offset * delta, bone.scale * delta);
        }
        self.last_weight = effective;
        ApplyOutcome::Applied
    }
}

/// Everything a parameter may write to during the apply phase
pub struct ApplyTargets<'a> {
    pub meshes: &'a mut BTreeMap<String, WritableMesh>,
    pub skeleton: &'a mut JointHierarchy,
}

#[derive(Debug, Clone)]
pub enum VisualParam {
    Morph(MorphTarget),
    Color(ColorParam),
    Volume(SkeletalDistortion),
}

impl VisualParam {
    pub fn info(&self) -> &ParamInfo {
        match self {
            VisualParam::Morph(m) => m.info(),
            VisualParam::Color(c) => c.info.as_ref(),
            VisualParam::Volume(v) => v.info.as_ref(),
        }
    }

    pub fn weight(&self) -> f32 {
        match self {
            VisualParam::Morph(m) => m.weight(),
            VisualParam::Color(c) => c.cur_weight,
            VisualParam::Volume(v) => v.cur_weight,
        }
    }

    pub fn set_weight(&mut self, weight: f32) {
        match self {
            VisualParam::Morph(m) => m.set_weight(weight),
            VisualParam::Color(c) => c.cur_weight = c.info.sanitize(weight),
            VisualParam::Volume(v) => v.cur_weight = v.info.sanitize(weight),
        }
    }

    pub fn apply(&mut self, sex: Sex, targets: &mut ApplyTargets<'_>) -> ApplyOutcome {
        match self {
            VisualParam::Morph(m) => match targets.meshes.get_mut(m.mesh_name()) {
                Some(mesh) => m.apply(sex, mesh, targets.skeleton),
                None => ApplyOutcome::Unchanged,
            },
            VisualParam::Color(c) => c.apply(sex),
            VisualParam::Volume(v) => v.apply(sex, targets.skeleton),
        }
    }

    pub fn as_morph(&self) -> Option<&MorphTarget> {
        match self {
            VisualParam::Morph(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_morph_mut(&mut self) -> Option<&mut MorphTarget> {
        match self {
            VisualParam::Morph(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_color(&self) -> Option<&ColorParam> {
        match self {
            VisualParam::Color(c) => Some(c),
            _ => None,
        }
    }
}

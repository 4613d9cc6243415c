//! Skeleton and avatar parameter descriptions
//!
//! Both files are parsed once at startup. A syntax error fails the whole
//! parse; an individual entry with a missing or unparsable attribute is
//! skipped with a warning.

use glam::{EulerRot, Quat, Vec3, Vec4};
use roxmltree::{Document, Node};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::avatar::composite::{BakeRegion, LayerDefinition, TintSource};
use crate::avatar::param::{ColorOperation, ParamInfo};
use crate::avatar::skeleton::{JointHierarchy, JointKind, Transform};
use crate::avatar::SexMask;
use crate::error::{AvatarError, AvatarResult};
use crate::utils::math::{parse_color, parse_vec3, parsing};

#[derive(Debug, Clone, PartialEq)]
pub struct JointDefinition {
    pub name: String,
    pub parent: Option<String>,
    pub kind: JointKind,
    pub local: Transform,
}

/// Joints in parent-before-child order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SkeletonDefinition {
    pub joints: Vec<JointDefinition>,
}

impl SkeletonDefinition {
    /// Build an instance hierarchy. Joints the hierarchy rejects are skipped,
    /// which also drops their descendants.
    pub fn build(&self) -> JointHierarchy {
        let mut hierarchy = JointHierarchy::new();
        for joint in &self.joints {
            if let Err(e) = hierarchy.add_joint(&joint.name, joint.parent.as_deref(), joint.local, joint.kind) {
                warn!("Skipping joint '{}': {}", joint.name, e);
            }
        }
        hierarchy
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeMorphDefinition {
    pub volume: String,
    pub scale: Vec3,
    pub position: Vec3,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MorphParamDefinition {
    pub info: Arc<ParamInfo>,
    pub clothing_morph: bool,
    pub volume_morphs: Vec<VolumeMorphDefinition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeshDefinition {
    /// Mesh type, e.g. `headMesh`; morph blocks are keyed by it
    pub mesh_type: String,
    pub file_name: String,
    pub lod: u32,
    pub morphs: Vec<MorphParamDefinition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoneDelta {
    pub name: String,
    pub scale: Vec3,
    pub offset: Vec3,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkeletalParamDefinition {
    pub info: Arc<ParamInfo>,
    pub bones: Vec<BoneDelta>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColorParamDefinition {
    pub info: Arc<ParamInfo>,
    pub operation: ColorOperation,
    pub stops: Arc<[Vec4]>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalColorDefinition {
    pub name: String,
    pub params: Vec<ColorParamDefinition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerSetDefinition {
    pub region: BakeRegion,
    pub layers: Vec<LayerDefinition>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AvatarDefinition {
    pub skeleton_file: Option<String>,
    pub meshes: Vec<MeshDefinition>,
    pub skeletal_params: Vec<SkeletalParamDefinition>,
    pub global_colors: Vec<GlobalColorDefinition>,
    pub layer_sets: Vec<LayerSetDefinition>,
}

impl AvatarDefinition {
    pub fn param_count(&self) -> usize {
        self.meshes.iter().map(|m| m.morphs.len()).sum::<usize>()
            + self.skeletal_params.len()
            + self.global_colors.iter().map(|g| g.params.len()).sum::<usize>()
    }
}

fn elements<'a, 'input>(node: Node<'a, 'input>, tag: &'static str) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(move |n| n.is_element() && n.tag_name().name() == tag)
}

fn required<'a>(node: Node<'a, '_>, name: &str) -> Result<&'a str, String> {
    node.attribute(name)
        .ok_or_else(|| format!("<{}> missing '{}'", node.tag_name().name(), name))
}

fn optional<T>(node: Node, name: &str, parse: impl Fn(&str) -> Result<T, String>) -> Result<Option<T>, String> {
    node.attribute(name).map(parse).transpose()
}

fn parse_f32(value: &str) -> Result<f32, String> {
    value
        .trim()
        .parse::<f32>()
        .map_err(|e| format!("Invalid number '{}': {}", value, e))
}

fn expect_root<'a, 'input>(doc: &'a Document<'input>, tag: &str) -> AvatarResult<Node<'a, 'input>> {
    let root = doc.root_element();
    if root.tag_name().name() != tag {
        return Err(AvatarError::Configuration {
            reason: format!("expected <{}>, found <{}>", tag, root.tag_name().name()),
        });
    }
    Ok(root)
}

fn parse_transform(node: Node) -> Result<Transform, String> {
    let position = optional(node, "pos", parse_vec3)?.unwrap_or(Vec3::ZERO);
    let degrees = optional(node, "rot", parse_vec3)?.unwrap_or(Vec3::ZERO);
    let scale = optional(node, "scale", parse_vec3)?.unwrap_or(Vec3::ONE);
    let rotation = Quat::from_euler(
        EulerRot::XYZ,
        degrees.x.to_radians(),
        degrees.y.to_radians(),
        degrees.z.to_radians(),
    );
    Ok(Transform::new(position, rotation, scale))
}

/// Parse `<linden_skeleton>`: nested `<bone>` elements, each possibly holding
/// `<collision_volume>` leaves.
pub fn parse_skeleton(xml: &str) -> AvatarResult<SkeletonDefinition> {
    let doc = Document::parse(xml)?;
    let root = expect_root(&doc, "linden_skeleton")?;
    let mut def = SkeletonDefinition::default();
    for bone in elements(root, "bone") {
        collect_joint(bone, None, &mut def.joints);
    }
    debug!("Parsed skeleton with {} joints", def.joints.len());
    Ok(def)
}

fn collect_joint(node: Node, parent: Option<&str>, out: &mut Vec<JointDefinition>) {
    let kind = match node.tag_name().name() {
        "bone" => JointKind::Bone,
        "collision_volume" => JointKind::CollisionVolume,
        _ => return,
    };
    let parsed = required(node, "name").and_then(|name| Ok((name, parse_transform(node)?)));
    let (name, local) = match parsed {
        Ok(v) => v,
        Err(e) => {
            warn!("Skipping skeleton entry (and its children): {}", e);
            return;
        }
    };
    out.push(JointDefinition {
        name: name.to_string(),
        parent: parent.map(str::to_string),
        kind,
        local,
    });
    for child in node.children().filter(|n| n.is_element()) {
        collect_joint(child, Some(name), out);
    }
}

fn parse_param_info(node: Node) -> Result<Arc<ParamInfo>, String> {
    let id = required(node, "id")?
        .trim()
        .parse::<i32>()
        .map_err(|e| format!("Invalid param id: {}", e))?;
    let name = required(node, "name")?;
    let mut info = ParamInfo::new(id, name);
    if let Some(group) = optional(node, "group", |v| v.trim().parse::<u8>().map_err(|e| e.to_string()))? {
        info.group = group;
    }
    info.wearable = node.attribute("wearable").map(str::to_string);
    info.min = optional(node, "value_min", parse_f32)?.unwrap_or(0.0);
    info.max = optional(node, "value_max", parse_f32)?.unwrap_or(1.0);
    if !(info.min <= info.max) {
        return Err(format!("param '{}' has min {} > max {}", name, info.min, info.max));
    }
    let default = optional(node, "value_default", parse_f32)?.unwrap_or(0.0);
    info.default = default.max(info.min).min(info.max);
    if let Some(sex) = node.attribute("sex") {
        info.sex = SexMask::parse(sex).ok_or_else(|| format!("Invalid sex '{}'", sex))?;
    }
    Ok(Arc::new(info))
}

fn parse_morph_param(node: Node) -> Result<MorphParamDefinition, String> {
    let info = parse_param_info(node)?;
    let clothing_morph = optional(node, "clothing_morph", parsing::parse_bool)?.unwrap_or(false);
    let mut volume_morphs = Vec::new();
    if let Some(morph) = elements(node, "param_morph").next() {
        for vol in elements(morph, "volume_morph") {
            let entry = required(vol, "name").and_then(|name| {
                Ok(VolumeMorphDefinition {
                    volume: name.to_string(),
                    scale: optional(vol, "scale", parse_vec3)?.unwrap_or(Vec3::ZERO),
                    position: optional(vol, "pos", parse_vec3)?.unwrap_or(Vec3::ZERO),
                })
            });
            match entry {
                Ok(v) => volume_morphs.push(v),
                Err(e) => warn!("Skipping volume morph of '{}': {}", info.name, e),
            }
        }
    } else {
        return Err(format!("param '{}' has no <param_morph>", info.name));
    }
    Ok(MorphParamDefinition { info, clothing_morph, volume_morphs })
}

fn parse_mesh(node: Node) -> Result<MeshDefinition, String> {
    let mesh_type = required(node, "type")?.to_string();
    let file_name = required(node, "file_name")?.to_string();
    let lod = optional(node, "lod", |v| v.trim().parse::<u32>().map_err(|e| e.to_string()))?.unwrap_or(0);
    let mut morphs = Vec::new();
    for param in elements(node, "param") {
        match parse_morph_param(param) {
            Ok(m) => morphs.push(m),
            Err(e) => warn!("Skipping morph param on mesh '{}': {}", mesh_type, e),
        }
    }
    Ok(MeshDefinition { mesh_type, file_name, lod, morphs })
}

fn parse_skeletal_param(node: Node) -> Result<SkeletalParamDefinition, String> {
    let info = parse_param_info(node)?;
    let skel = elements(node, "param_skeleton")
        .next()
        .ok_or_else(|| format!("param '{}' has no <param_skeleton>", info.name))?;
    let mut bones = Vec::new();
    for bone in elements(skel, "bone") {
        let entry = required(bone, "name").and_then(|name| {
            Ok(BoneDelta {
                name: name.to_string(),
                scale: optional(bone, "scale", parse_vec3)?.unwrap_or(Vec3::ZERO),
                offset: optional(bone, "offset", parse_vec3)?.unwrap_or(Vec3::ZERO),
            })
        });
        match entry {
            Ok(b) => bones.push(b),
            Err(e) => warn!("Skipping bone of '{}': {}", info.name, e),
        }
    }
    Ok(SkeletalParamDefinition { info, bones })
}

fn parse_color_param(node: Node) -> Result<ColorParamDefinition, String> {
    let info = parse_param_info(node)?;
    let color = elements(node, "param_color")
        .next()
        .ok_or_else(|| format!("param '{}' has no <param_color>", info.name))?;
    let operation = match color.attribute("operation") {
        None => ColorOperation::Add,
        Some(op) => ColorOperation::parse(op).ok_or_else(|| format!("Unknown color operation '{}'", op))?,
    };
    let stops = elements(color, "value")
        .map(|v| required(v, "color").and_then(parse_color))
        .collect::<Result<Vec<_>, _>>()?;
    if stops.is_empty() {
        return Err(format!("param '{}' has no color values", info.name));
    }
    Ok(ColorParamDefinition { info, operation, stops: stops.into() })
}

fn parse_layer(node: Node) -> Result<LayerDefinition, String> {
    let name = required(node, "name")?.to_string();
    let local_texture = node
        .attribute("local_texture")
        .or_else(|| elements(node, "texture").find_map(|t| t.attribute("local_texture")))
        .map(str::to_string);
    let tint = match (node.attribute("global_color"), optional(node, "fixed_color", parse_color)?) {
        (Some(global), _) => TintSource::GlobalColor(global.to_string()),
        (None, Some(fixed)) => TintSource::Fixed(fixed),
        (None, None) => TintSource::None,
    };
    Ok(LayerDefinition {
        name,
        local_texture,
        tint,
        alpha_texture: node.attribute("alpha_texture").map(str::to_string),
        invert_alpha: optional(node, "invert_alpha", parsing::parse_bool)?.unwrap_or(false),
    })
}

fn parse_layer_set(node: Node) -> Result<LayerSetDefinition, String> {
    let region_name = required(node, "body_region")?;
    let region = BakeRegion::parse(region_name).ok_or_else(|| format!("Unknown body region '{}'", region_name))?;
    let mut layers = Vec::new();
    for layer in elements(node, "layer") {
        match parse_layer(layer) {
            Ok(l) => layers.push(l),
            Err(e) => warn!("Skipping layer in {}: {}", region, e),
        }
    }
    Ok(LayerSetDefinition { region, layers })
}

fn keep<T>(what: &str, parsed: Result<T, String>, out: &mut Vec<T>) {
    match parsed {
        Ok(v) => out.push(v),
        Err(e) => warn!("Skipping {}: {}", what, e),
    }
}

/// Parse `<linden_avatar>`
pub fn parse_avatar_definition(xml: &str) -> AvatarResult<AvatarDefinition> {
    let doc = Document::parse(xml)?;
    let root = expect_root(&doc, "linden_avatar")?;
    let mut def = AvatarDefinition::default();

    for node in root.children().filter(|n| n.is_element()) {
        match node.tag_name().name() {
            "skeleton" => {
                def.skeleton_file = node.attribute("file_name").map(str::to_string);
                for param in elements(node, "param") {
                    keep("skeletal param", parse_skeletal_param(param), &mut def.skeletal_params);
                }
            }
            "mesh" => keep("mesh", parse_mesh(node), &mut def.meshes),
            "global_color" => match required(node, "name") {
                Ok(name) => {
                    let mut params = Vec::new();
                    for param in elements(node, "param") {
                        keep("color param", parse_color_param(param), &mut params);
                    }
                    def.global_colors.push(GlobalColorDefinition { name: name.to_string(), params });
                }
                Err(e) => warn!("Skipping global color: {}", e),
            },
            "layer_set" => keep("layer set", parse_layer_set(node), &mut def.layer_sets),
            other => debug!("Ignoring <{}>", other),
        }
    }

    debug!(
        "Parsed avatar definition: {} meshes, {} params, {} layer sets",
        def.meshes.len(),
        def.param_count(),
        def.layer_sets.len()
    );
    Ok(def)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SKELETON: &str = r#"<?xml version="1.0"?>
<linden_skeleton version="1.0">
  <bone name="mPelvis" pos="0 0 1.067" rot="0 0 0" scale="1 1 1">
    <collision_volume name="PELVIS" pos="-0.01 0 -0.02" rot="0 8 0" scale="0.12 0.16 0.17"/>
    <bone name="mTorso" pos="0 0 0.084">
      <collision_volume name="BELLY" pos="0.028 0 0.04" scale="0.09 0.13 0.15"/>
      <bone pos="0 0 0.2">
        <bone name="mOrphan"/>
      </bone>
    </bone>
  </bone>
</linden_skeleton>"#;

    #[test]
    fn test_parse_skeleton() {
        let def = parse_skeleton(SKELETON).unwrap();
        let names: Vec<_> = def.joints.iter().map(|j| j.name.as_str()).collect();
        // the nameless bone and its subtree are skipped
        assert_eq!(names, vec!["mPelvis", "PELVIS", "mTorso", "BELLY"]);
        assert_eq!(def.joints[1].kind, JointKind::CollisionVolume);
        assert_eq!(def.joints[3].parent.as_deref(), Some("mTorso"));
        assert_eq!(def.joints[0].local.position, Vec3::new(0.0, 0.0, 1.067));

        let hierarchy = def.build();
        assert_eq!(hierarchy.len(), 4);
        let belly = hierarchy.get_joint("BELLY").unwrap();
        assert_eq!(hierarchy.joint(belly).parent(), hierarchy.get_joint("mTorso"));
    }

    #[test]
    fn test_rotation_is_degrees() {
        let def = parse_skeleton(SKELETON).unwrap();
        let (_, angle) = def.joints[1].local.rotation.to_axis_angle();
        assert!((angle.to_degrees() - 8.0).abs() < 1e-3);
    }

    #[test]
    fn test_build_skips_duplicates() {
        let def = SkeletonDefinition {
            joints: vec![
                JointDefinition { name: "a".into(), parent: None, kind: JointKind::Bone, local: Transform::IDENTITY },
                JointDefinition { name: "b".into(), parent: Some("a".into()), kind: JointKind::Bone, local: Transform::IDENTITY },
                JointDefinition { name: "b".into(), parent: Some("a".into()), kind: JointKind::Bone, local: Transform::IDENTITY },
                JointDefinition { name: "c".into(), parent: Some("zz".into()), kind: JointKind::Bone, local: Transform::IDENTITY },
            ],
        };
        assert_eq!(def.build().len(), 2);
    }

    #[test]
    fn test_wrong_root_and_bad_xml() {
        assert!(matches!(parse_skeleton("<linden_avatar/>"), Err(AvatarError::Configuration { .. })));
        assert!(matches!(parse_skeleton("<linden_skeleton>"), Err(AvatarError::Xml(_))));
    }

    const AVATAR: &str = r#"<?xml version="1.0"?>
<linden_avatar version="1.0">
  <skeleton file_name="avatar_skeleton.xml">
    <param id="32" group="1" wearable="shape" name="Male_Skeleton" value_min="0" value_max="1" sex="male">
      <param_skeleton>
        <bone name="mNeck" scale="0 0 0.1" offset="0 0 0.02"/>
        <bone scale="1 1 1"/>
      </param_skeleton>
    </param>
  </skeleton>
  <mesh type="upperBodyMesh" lod="0" file_name="avatar_upper_body.llm">
    <param id="157" group="0" wearable="shape" name="Belly_Size" value_min="0" value_max="1" value_default="0.25">
      <param_morph>
        <volume_morph name="BELLY" scale="0.075 0.04 0.03" pos="0.07 0 -0.07"/>
      </param_morph>
    </param>
    <param id="828" wearable="shirt" name="Loose_Upper_Clothing" clothing_morph="true" value_max="1">
      <param_morph/>
    </param>
    <param name="No_Id"><param_morph/></param>
    <param id="9" name="Bad_Range" value_min="2" value_max="1"><param_morph/></param>
  </mesh>
  <global_color name="skin_color">
    <param id="108" name="Rainbow_Color" value_min="0" value_max="1">
      <param_color>
        <value color="0, 0, 0, 255"/>
        <value color="255, 0, 255, 255"/>
      </param_color>
    </param>
    <param id="111" name="Pigment" value_min="0" value_max="1">
      <param_color operation="multiply">
        <value color="252, 215, 200, 255"/>
      </param_color>
    </param>
  </global_color>
  <layer_set body_region="head" width="512" height="512">
    <layer name="head bump base" global_color="skin_color"/>
    <layer name="head tattoo">
      <texture local_texture="head_tattoo"/>
    </layer>
    <layer name="eyeliner" fixed_color="0, 0, 0, 255" alpha_texture="head_alpha" invert_alpha="true"/>
    <layer local_texture="nameless"/>
  </layer_set>
  <layer_set body_region="tail"/>
</linden_avatar>"#;

    #[test]
    fn test_parse_avatar_definition() {
        let def = parse_avatar_definition(AVATAR).unwrap();
        assert_eq!(def.skeleton_file.as_deref(), Some("avatar_skeleton.xml"));

        assert_eq!(def.skeletal_params.len(), 1);
        let skel = &def.skeletal_params[0];
        assert_eq!(skel.info.sex, SexMask::MALE);
        assert_eq!(skel.bones.len(), 1);
        assert_eq!(skel.bones[0].offset, Vec3::new(0.0, 0.0, 0.02));

        assert_eq!(def.meshes.len(), 1);
        let mesh = &def.meshes[0];
        assert_eq!(mesh.mesh_type, "upperBodyMesh");
        let names: Vec<_> = mesh.morphs.iter().map(|m| m.info.name.as_str()).collect();
        assert_eq!(names, vec!["Belly_Size", "Loose_Upper_Clothing"]);
        assert_eq!(mesh.morphs[0].info.default, 0.25);
        assert_eq!(mesh.morphs[0].volume_morphs[0].volume, "BELLY");
        assert!(mesh.morphs[1].clothing_morph);
        assert_eq!(mesh.morphs[1].info.wearable.as_deref(), Some("shirt"));

        let skin = &def.global_colors[0];
        assert_eq!(skin.name, "skin_color");
        assert_eq!(skin.params[0].operation, ColorOperation::Add);
        assert_eq!(skin.params[0].stops[1], Vec4::new(1.0, 0.0, 1.0, 1.0));
        assert_eq!(skin.params[1].operation, ColorOperation::Multiply);

        assert_eq!(def.layer_sets.len(), 1);
        let layers = &def.layer_sets[0].layers;
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[0].tint, TintSource::GlobalColor("skin_color".into()));
        assert_eq!(layers[1].local_texture.as_deref(), Some("head_tattoo"));
        assert_eq!(layers[2].tint, TintSource::Fixed(Vec4::new(0.0, 0.0, 0.0, 1.0)));
        assert!(layers[2].invert_alpha);
        assert_eq!(def.param_count(), 5);
    }
}

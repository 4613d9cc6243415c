//! Joint hierarchy: skeletal bones and collision volumes in one name-addressable arena

use glam::{Mat4, Quat, Vec3};
use std::collections::HashMap;

use crate::error::{AvatarError, AvatarResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JointId(usize);

impl JointId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JointKind {
    Bone,
    /// Physics/morph proxy attached under a bone
    CollisionVolume,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Transform = Transform {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    pub fn new(position: Vec3, rotation: Quat, scale: Vec3) -> Self {
        Self { position, rotation, scale }
    }

    pub fn from_position(position: Vec3) -> Self {
        Self { position, ..Self::IDENTITY }
    }

    pub fn to_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }

    pub fn from_matrix(m: &Mat4) -> Self {
        let (scale, rotation, position) = m.to_scale_rotation_translation();
        Self { position, rotation, scale }
    }
}

#[derive(Debug, Clone)]
pub struct Joint {
    pub name: String,
    pub kind: JointKind,
    pub local: Transform,
    parent: Option<JointId>,
    children: Vec<JointId>,
}

impl Joint {
    pub fn parent(&self) -> Option<JointId> {
        self.parent
    }

    pub fn children(&self) -> &[JointId] {
        &self.children
    }
}

/// Tree of named joints rooted at the pelvis. The hierarchy owns every joint;
/// links are indices, so a child never owns its parent.
#[derive(Debug, Clone, Default)]
pub struct JointHierarchy {
    joints: Vec<Joint>,
    name_to_id: HashMap<String, JointId>,
    root: Option<JointId>,
    world: Vec<Mat4>,
    world_dirty: Vec<bool>,
}

impl JointHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.joints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joints.is_empty()
    }

    pub fn root(&self) -> Option<JointId> {
        self.root
    }

    /// Register a joint. `parent` of `None` makes it the root, which may only
    /// happen once.
    pub fn add_joint(
        &mut self,
        name: &str,
        parent: Option<&str>,
        local: Transform,
        kind: JointKind,
    ) -> AvatarResult<JointId> {
        if self.name_to_id.contains_key(name) {
            return Err(AvatarError::DuplicateJoint { name: name.to_string() });
        }
        let parent_id = match parent {
            Some(parent_name) => Some(self.get_joint(parent_name).ok_or_else(|| {
                AvatarError::UnknownParent {
                    name: name.to_string(),
                    parent: parent_name.to_string(),
                }
            })?),
            None if self.root.is_some() => {
                return Err(AvatarError::MultipleRoots { name: name.to_string() });
            }
            None => None,
        };

        let id = JointId(self.joints.len());
        self.joints.push(Joint {
            name: name.to_string(),
            kind,
            local,
            parent: parent_id,
            children: Vec::new(),
        });
        self.name_to_id.insert(name.to_string(), id);
        self.world.push(Mat4::IDENTITY);
        self.world_dirty.push(true);

        match parent_id {
            Some(p) => self.joints[p.0].children.push(id),
            None => self.root = Some(id),
        }
        Ok(id)
    }

    pub fn get_joint(&self, name: &str) -> Option<JointId> {
        self.name_to_id.get(name).copied()
    }

    pub fn joint(&self, id: JointId) -> &Joint {
        &self.joints[id.0]
    }

    pub fn joints(&self) -> impl Iterator<Item = (JointId, &Joint)> {
        self.joints.iter().enumerate().map(|(i, j)| (JointId(i), j))
    }

    pub fn is_descendant_of(&self, id: JointId, ancestor: JointId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.joints[current.0].parent;
        }
        false
    }

    /// Move `id` under `new_parent`. Rejects parenting a joint to itself or to
    /// one of its own descendants, and detaching the root.
    pub fn set_parent(&mut self, id: JointId, new_parent: JointId) -> AvatarResult<()> {
        if self.is_descendant_of(new_parent, id) {
            return Err(AvatarError::JointCycle {
                name: self.joints[id.0].name.clone(),
                parent: self.joints[new_parent.0].name.clone(),
            });
        }
        match self.joints[id.0].parent {
            Some(old) => self.joints[old.0].children.retain(|c| *c != id),
            None => {
                return Err(AvatarError::MultipleRoots { name: self.joints[id.0].name.clone() });
            }
        }
        self.joints[id.0].parent = Some(new_parent);
        self.joints[new_parent.0].children.push(id);
        self.invalidate_subtree(id);
        Ok(())
    }

    pub fn local_transform(&self, id: JointId) -> Transform {
        self.joints[id.0].local
    }

    pub fn set_local_transform(&mut self, id: JointId, local: Transform) {
        self.joints[id.0].local = local;
        self.invalidate_subtree(id);
    }

    pub fn set_position(&mut self, id: JointId, position: Vec3) {
        let mut local = self.joints[id.0].local;
        local.position = position;
        self.set_local_transform(id, local);
    }

    pub fn set_scale(&mut self, id: JointId, scale: Vec3) {
        let mut local = self.joints[id.0].local;
        local.scale = scale;
        self.set_local_transform(id, local);
    }

    /// Add to a joint's local position and scale. Ids from another hierarchy
    /// that fall out of range are ignored.
    pub fn offset_joint(&mut self, id: JointId, position: Vec3, scale: Vec3) {
        let Some(joint) = self.joints.get_mut(id.0) else { return };
        joint.local.position += position;
        joint.local.scale += scale;
        self.invalidate_subtree(id);
    }

    fn invalidate_subtree(&mut self, id: JointId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            self.world_dirty[current.0] = true;
            stack.extend(self.joints[current.0].children.iter().copied());
        }
    }

    /// Compose local matrices up the parent chain. Uses the per-frame cache
    /// where it is clean.
    pub fn world_matrix(&self, id: JointId) -> Mat4 {
        if !self.world_dirty[id.0] {
            return self.world[id.0];
        }
        let local = self.joints[id.0].local.to_matrix();
        match self.joints[id.0].parent {
            Some(parent) => self.world_matrix(parent) * local,
            None => local,
        }
    }

    pub fn world_transform(&self, id: JointId) -> Transform {
        Transform::from_matrix(&self.world_matrix(id))
    }

    /// Recompute every invalidated world matrix. Called once per frame after
    /// all parameters have been applied.
    pub fn refresh_world_transforms(&mut self) {
        // set_parent can break index order, so walk from the root
        let Some(root) = self.root else { return };
        let mut stack = vec![(root, Mat4::IDENTITY, false)];
        while let Some((id, parent_world, parent_changed)) = stack.pop() {
            let changed = parent_changed || self.world_dirty[id.0];
            if changed {
                self.world[id.0] = parent_world * self.joints[id.0].local.to_matrix();
                self.world_dirty[id.0] = false;
            }
            let world = self.world[id.0];
            for &child in &self.joints[id.0].children {
                stack.push((child, world, changed));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pelvis_torso() -> JointHierarchy {
        let mut h = JointHierarchy::new();
        h.add_joint("mPelvis", None, Transform::from_position(Vec3::new(0.0, 0.0, 1.0)), JointKind::Bone)
            .unwrap();
        h.add_joint("mTorso", Some("mPelvis"), Transform::from_position(Vec3::new(0.0, 0.0, 0.25)), JointKind::Bone)
            .unwrap();
        h.add_joint("BELLY", Some("mTorso"), Transform::from_position(Vec3::new(0.1, 0.0, 0.0)), JointKind::CollisionVolume)
            .unwrap();
        h
    }

    #[test]
    fn test_add_and_lookup() {
        let h = pelvis_torso();
        assert_eq!(h.len(), 3);
        let torso = h.get_joint("mTorso").unwrap();
        assert_eq!(h.joint(torso).parent(), h.root());
        assert_eq!(h.joint(h.get_joint("BELLY").unwrap()).kind, JointKind::CollisionVolume);
        assert!(h.get_joint("mHead").is_none());
    }

    #[test]
    fn test_add_rejects_duplicates_unknown_parents_and_second_root() {
        let mut h = pelvis_torso();
        assert!(matches!(
            h.add_joint("mTorso", Some("mPelvis"), Transform::IDENTITY, JointKind::Bone),
            Err(AvatarError::DuplicateJoint { .. })
        ));
        assert!(matches!(
            h.add_joint("mHead", Some("mNeck"), Transform::IDENTITY, JointKind::Bone),
            Err(AvatarError::UnknownParent { .. })
        ));
        assert!(matches!(
            h.add_joint("mOther", None, Transform::IDENTITY, JointKind::Bone),
            Err(AvatarError::MultipleRoots { .. })
        ));
        // self-parenting on add is an unknown parent, since the name isn't registered yet
        assert!(matches!(
            h.add_joint("mLoop", Some("mLoop"), Transform::IDENTITY, JointKind::Bone),
            Err(AvatarError::UnknownParent { .. })
        ));
    }

    #[test]
    fn test_set_parent_rejects_cycles() {
        let mut h = pelvis_torso();
        let pelvis = h.get_joint("mPelvis").unwrap();
        let torso = h.get_joint("mTorso").unwrap();
        let belly = h.get_joint("BELLY").unwrap();
        assert!(matches!(h.set_parent(torso, belly), Err(AvatarError::JointCycle { .. })));
        assert!(matches!(h.set_parent(torso, torso), Err(AvatarError::JointCycle { .. })));
        h.set_parent(belly, pelvis).unwrap();
        assert_eq!(h.joint(belly).parent(), Some(pelvis));
        assert!(!h.joint(torso).children().contains(&belly));
    }

    #[test]
    fn test_world_transform_composes_and_invalidates() {
        let mut h = pelvis_torso();
        let pelvis = h.get_joint("mPelvis").unwrap();
        let belly = h.get_joint("BELLY").unwrap();
        h.refresh_world_transforms();
        let p = h.world_transform(belly).position;
        assert!((p - Vec3::new(0.1, 0.0, 1.25)).length() < 1e-6);

        h.set_position(pelvis, Vec3::new(0.0, 0.0, 2.0));
        // stale cache must not be returned for descendants
        let p = h.world_transform(belly).position;
        assert!((p - Vec3::new(0.1, 0.0, 2.25)).length() < 1e-6);
        h.refresh_world_transforms();
        let p = h.world_transform(belly).position;
        assert!((p - Vec3::new(0.1, 0.0, 2.25)).length() < 1e-6);
    }

    #[test]
    fn test_world_transform_applies_parent_rotation() {
        let mut h = JointHierarchy::new();
        h.add_joint(
            "root",
            None,
            Transform::new(Vec3::ZERO, Quat::from_rotation_z(std::f32::consts::FRAC_PI_2), Vec3::ONE),
            JointKind::Bone,
        )
        .unwrap();
        let child = h
            .add_joint("child", Some("root"), Transform::from_position(Vec3::X), JointKind::Bone)
            .unwrap();
        h.refresh_world_transforms();
        assert!((h.world_transform(child).position - Vec3::Y).length() < 1e-5);
    }
}

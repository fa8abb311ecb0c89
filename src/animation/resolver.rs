//! Skeleton & Animation Resolver
//!
//! Turns name-based joint declarations into a [`JointHierarchy`] arena and
//! binds raw clips (and mesh bone lists) to it, so that nothing downstream
//! has to follow joint names at sample time.

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::animation::clip::{AnimationData, Keyframe, RawClip};
use crate::animation::skeleton::{Joint, JointDefinition, JointHierarchy, JointId};
use crate::animation::transform::{JointTransform, KeyedTransform};
use crate::assets::context::{LoadContext, Section};
use crate::assets::model::MeshSkin;
use crate::errors::{Error, Result};

/// Length given to clips whose keyframes all sit at t = 0 (single-pose clips).
pub const STATIC_CLIP_LENGTH: f32 = 1.0;

/// Resolves a skeleton and its clips without cancellation checkpoints.
pub fn resolve(
    joints: Vec<JointDefinition>,
    clips: Vec<RawClip>,
) -> Result<(JointHierarchy, Vec<AnimationData>)> {
    resolve_with(joints, clips, &LoadContext::default())
}

/// Resolves a skeleton and its clips, checking for cancellation after the
/// hierarchy and after every clip.
pub fn resolve_with(
    joints: Vec<JointDefinition>,
    clips: Vec<RawClip>,
    ctx: &LoadContext,
) -> Result<(JointHierarchy, Vec<AnimationData>)> {
    let hierarchy = build_hierarchy(joints)?;
    ctx.check_cancelled()?;

    let mut animations = Vec::with_capacity(clips.len());
    for clip in clips {
        animations.push(resolve_clip(clip, &hierarchy)?);
        ctx.checkpoint(Section::Clip)?;
    }
    Ok((hierarchy, animations))
}

/// Reconstructs the owning joint tree from child-name declarations.
///
/// Fails with [`Error::UnresolvedJoint`] when a child name has no definition,
/// a joint is claimed by two parents, there is not exactly one root, or the
/// declarations form a cycle.
pub fn build_hierarchy(definitions: Vec<JointDefinition>) -> Result<JointHierarchy> {
    if definitions.is_empty() {
        return Err(Error::malformed("skeleton"));
    }

    let mut by_name: FxHashMap<&str, usize> = FxHashMap::default();
    for (i, def) in definitions.iter().enumerate() {
        if by_name.insert(def.name.as_str(), i).is_some() {
            return Err(Error::unresolved_joint(&def.name, "declared more than once"));
        }
    }

    // Attach every declared child to the joint that declares it.
    let mut parent: Vec<Option<usize>> = vec![None; definitions.len()];
    let mut children: Vec<SmallVec<[usize; 4]>> = vec![SmallVec::new(); definitions.len()];
    for (i, def) in definitions.iter().enumerate() {
        for child_name in &def.children {
            let Some(&c) = by_name.get(child_name.as_str()) else {
                return Err(Error::unresolved_joint(
                    child_name,
                    format!("declared as a child of `{}` but never defined", def.name),
                ));
            };
            if let Some(existing) = parent[c] {
                return Err(Error::unresolved_joint(
                    child_name,
                    format!(
                        "claimed by both `{}` and `{}`",
                        definitions[existing].name, def.name
                    ),
                ));
            }
            parent[c] = Some(i);
            children[i].push(c);
        }
    }

    let roots: Vec<usize> = (0..definitions.len()).filter(|&i| parent[i].is_none()).collect();
    let root = match roots.as_slice() {
        [root] => *root,
        [] => {
            return Err(Error::unresolved_joint(
                &definitions[0].name,
                "joint graph contains a cycle",
            ));
        }
        [first, second, ..] => {
            return Err(Error::unresolved_joint(
                &definitions[*second].name,
                format!("has no parent but `{}` is already the root", definitions[*first].name),
            ));
        }
    };

    // Pre-order walk; the visit order becomes the JointId.
    let mut new_id = vec![u32::MAX; definitions.len()];
    let mut order = Vec::with_capacity(definitions.len());
    let mut visited: FxHashSet<usize> = FxHashSet::default();
    let mut stack = vec![root];
    while let Some(i) = stack.pop() {
        if !visited.insert(i) {
            return Err(Error::unresolved_joint(
                &definitions[i].name,
                "joint graph contains a cycle",
            ));
        }
        new_id[i] = order.len() as u32;
        order.push(i);
        stack.extend(children[i].iter().rev().copied());
    }

    if order.len() != definitions.len() {
        // Joints with a parent that the root never reaches sit on a cycle.
        let stray = (0..definitions.len())
            .find(|i| !visited.contains(i))
            .unwrap_or(0);
        return Err(Error::unresolved_joint(
            &definitions[stray].name,
            "joint graph contains a cycle",
        ));
    }

    let mut slots: Vec<Option<JointDefinition>> = definitions.into_iter().map(Some).collect();
    let mut joints = Vec::with_capacity(order.len());
    for &old in &order {
        let Some(def) = slots[old].take() else {
            continue;
        };
        joints.push(Joint {
            bind_components: JointTransform::from_matrix(&def.bind_local),
            name: def.name,
            parent: parent[old].map(|p| JointId(new_id[p])),
            children: children[old].iter().map(|&c| JointId(new_id[c])).collect(),
            bind_local: def.bind_local,
        });
    }

    Ok(JointHierarchy::from_pre_order(joints))
}

/// Sorts and binds one clip to `hierarchy`.
pub fn resolve_clip(raw: RawClip, hierarchy: &JointHierarchy) -> Result<AnimationData> {
    let RawClip {
        name,
        length_seconds,
        mut keyframes,
    } = raw;

    if keyframes.is_empty() {
        return Err(Error::malformed(format!("animation clip `{name}`")));
    }

    // Stable: equal timestamps keep their declaration order.
    keyframes.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));

    let mut resolved = Vec::with_capacity(keyframes.len());
    for frame in keyframes {
        if !frame.timestamp.is_finite() {
            return Err(Error::malformed(format!("animation clip `{name}`")));
        }

        let mut transforms: Vec<Option<KeyedTransform>> = vec![None; hierarchy.len()];
        for (joint, matrix) in frame.transforms {
            let Some(id) = hierarchy.id(&joint) else {
                return Err(Error::UnknownJointReference {
                    clip: name,
                    joint,
                });
            };
            transforms[id.index()] = Some(KeyedTransform::new(matrix));
        }
        resolved.push(Keyframe {
            timestamp: frame.timestamp.max(0.0),
            transforms,
        });
    }

    let last = resolved.last().map_or(0.0, |k| k.timestamp);
    let mut length = length_seconds.unwrap_or(last);
    if last > length {
        log::warn!(
            "Clip `{name}` declares {length}s but keys run to {last}s, extending"
        );
        length = last;
    }
    if length <= 0.0 || !length.is_finite() {
        length = STATIC_CLIP_LENGTH;
    }

    Ok(AnimationData {
        name,
        length_seconds: length,
        keyframes: resolved,
    })
}

/// Binds a mesh bone list to `hierarchy`, filling in inverse bind matrices
/// from the rest pose when the source did not provide a usable set.
pub fn bind_skin(skin: &mut MeshSkin, mesh_name: &str, hierarchy: &JointHierarchy) -> Result<()> {
    let mut bound = Vec::with_capacity(skin.bone_names.len());
    for bone in &skin.bone_names {
        let Some(id) = hierarchy.id(bone) else {
            return Err(Error::unresolved_joint(
                bone,
                format!("referenced by the bone list of mesh `{mesh_name}` but not declared by the skeleton"),
            ));
        };
        bound.push(id);
    }

    if skin.inverse_bind_matrices.len() != bound.len() {
        if !skin.inverse_bind_matrices.is_empty() {
            log::warn!(
                "Mesh `{mesh_name}` has {} inverse bind matrices for {} bones, deriving from rest pose",
                skin.inverse_bind_matrices.len(),
                bound.len()
            );
        }
        let all = hierarchy.inverse_bind_matrices();
        skin.inverse_bind_matrices = bound.iter().map(|id| all[id.index()]).collect();
    }

    skin.bound = bound;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Mat4;

    #[test]
    fn pre_order_ids_put_parents_first() {
        let defs = vec![
            JointDefinition::new("hand", Mat4::IDENTITY),
            JointDefinition::new("arm", Mat4::IDENTITY).with_children(["hand"]),
            JointDefinition::new("root", Mat4::IDENTITY).with_children(["arm", "leg"]),
            JointDefinition::new("leg", Mat4::IDENTITY),
        ];
        let h = build_hierarchy(defs).unwrap();
        let names: Vec<_> = h.iter().map(|(_, j)| j.name.as_str()).collect();
        assert_eq!(names, ["root", "arm", "hand", "leg"]);
        for (id, joint) in h.iter() {
            if let Some(p) = joint.parent {
                assert!(p < id);
            }
        }
    }
}

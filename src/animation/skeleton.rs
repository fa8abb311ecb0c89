use glam::Mat4;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::animation::transform::JointTransform;

/// A joint as declared by the source document.
///
/// Children are referenced by name only; the resolver turns the declarations
/// into an owning [`JointHierarchy`].
#[derive(Debug, Clone, PartialEq)]
pub struct JointDefinition {
    /// Unique within one skeleton.
    pub name: String,
    /// Rest-pose transform relative to the parent joint.
    pub bind_local: Mat4,
    pub children: Vec<String>,
}

impl JointDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>, bind_local: Mat4) -> Self {
        Self {
            name: name.into(),
            bind_local,
            children: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_children<I, S>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.children.extend(children.into_iter().map(Into::into));
        self
    }
}

/// Stable index of a joint inside its [`JointHierarchy`].
///
/// Ids follow a pre-order walk from the root, so a parent's id is always
/// smaller than its children's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JointId(pub(crate) u32);

impl JointId {
    pub const ROOT: JointId = JointId(0);

    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
pub struct Joint {
    pub name: String,
    pub parent: Option<JointId>,
    pub children: SmallVec<[JointId; 4]>,
    pub bind_local: Mat4,
    pub(crate) bind_components: JointTransform,
}

impl Joint {
    #[inline]
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    #[inline]
    #[must_use]
    pub fn bind_components(&self) -> &JointTransform {
        &self.bind_components
    }
}

/// Joint arena in pre-order, with a name lookup built once at resolution.
///
/// Immutable after loading; share it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct JointHierarchy {
    pub(crate) joints: Vec<Joint>,
    pub(crate) lookup: FxHashMap<String, JointId>,
}

impl JointHierarchy {
    /// Assembles a hierarchy from joints already laid out in pre-order.
    pub(crate) fn from_pre_order(joints: Vec<Joint>) -> Self {
        let lookup = joints
            .iter()
            .enumerate()
            .map(|(i, j)| (j.name.clone(), JointId(i as u32)))
            .collect();
        Self { joints, lookup }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.joints.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.joints.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn root(&self) -> JointId {
        JointId::ROOT
    }

    #[inline]
    #[must_use]
    pub fn joint(&self, id: JointId) -> &Joint {
        &self.joints[id.index()]
    }

    #[inline]
    #[must_use]
    pub fn id(&self, name: &str) -> Option<JointId> {
        self.lookup.get(name).copied()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Joint> {
        self.id(name).map(|id| self.joint(id))
    }

    #[must_use]
    pub fn name(&self, id: JointId) -> &str {
        &self.joints[id.index()].name
    }

    /// Joints in pre-order: every parent precedes its children.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (JointId, &Joint)> {
        self.joints
            .iter()
            .enumerate()
            .map(|(i, j)| (JointId(i as u32), j))
    }

    /// Number of edges between `id` and the root.
    #[must_use]
    pub fn depth(&self, id: JointId) -> usize {
        let mut depth = 0;
        let mut current = self.joint(id).parent;
        while let Some(p) = current {
            depth += 1;
            current = self.joint(p).parent;
        }
        depth
    }

    /// Model-space rest transforms of every joint.
    #[must_use]
    pub fn bind_globals(&self) -> Vec<Mat4> {
        let mut globals = Vec::with_capacity(self.joints.len());
        for joint in &self.joints {
            let parent = joint.parent.map_or(Mat4::IDENTITY, |p| globals[p.index()]);
            globals.push(parent * joint.bind_local);
        }
        globals
    }

    /// Inverse of [`Self::bind_globals`], for skins that carry no inverse bind matrices.
    #[must_use]
    pub fn inverse_bind_matrices(&self) -> Vec<Mat4> {
        self.bind_globals().iter().map(Mat4::inverse).collect()
    }
}

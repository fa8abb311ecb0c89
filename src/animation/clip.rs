use glam::Mat4;
use rustc_hash::FxHashMap;

use crate::animation::skeleton::JointId;
use crate::animation::transform::KeyedTransform;

/// A keyframe as extracted from the document: joint name → local transform.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyFrameData {
    pub timestamp: f32,
    pub transforms: FxHashMap<String, Mat4>,
}

impl KeyFrameData {
    #[must_use]
    pub fn new(timestamp: f32) -> Self {
        Self {
            timestamp,
            transforms: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn with_transform(mut self, joint: impl Into<String>, local: Mat4) -> Self {
        self.transforms.insert(joint.into(), local);
        self
    }
}

/// An animation clip before joint names are bound.
///
/// Keyframes may be in any order here; the resolver sorts them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawClip {
    pub name: String,
    /// Declared clip length; the last keyframe time is used when absent.
    pub length_seconds: Option<f32>,
    pub keyframes: Vec<KeyFrameData>,
}

impl RawClip {
    #[must_use]
    pub fn new(name: impl Into<String>, keyframes: Vec<KeyFrameData>) -> Self {
        Self {
            name: name.into(),
            length_seconds: None,
            keyframes,
        }
    }

    #[must_use]
    pub fn with_length(mut self, length_seconds: f32) -> Self {
        self.length_seconds = Some(length_seconds);
        self
    }
}

/// A resolved keyframe, indexed by [`JointId`].
#[derive(Debug, Clone)]
pub struct Keyframe {
    pub timestamp: f32,
    /// `None` where the source omitted the joint; sampling uses the bind pose.
    pub(crate) transforms: Vec<Option<KeyedTransform>>,
}

impl Keyframe {
    #[inline]
    #[must_use]
    pub fn transform(&self, joint: JointId) -> Option<&KeyedTransform> {
        self.transforms.get(joint.index()).and_then(Option::as_ref)
    }

    /// Joints this keyframe provides a transform for.
    pub fn keyed_joints(&self) -> impl Iterator<Item = JointId> + '_ {
        self.transforms
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_some())
            .map(|(i, _)| JointId(i as u32))
    }
}

/// A clip bound to a joint hierarchy, ready for sampling.
#[derive(Debug, Clone)]
pub struct AnimationData {
    pub name: String,
    /// Always positive.
    pub length_seconds: f32,
    /// Sorted by ascending timestamp. Loaders never produce an empty list;
    /// an empty clip samples to the bind pose.
    pub keyframes: Vec<Keyframe>,
}

impl AnimationData {
    #[inline]
    #[must_use]
    pub fn keyframe_count(&self) -> usize {
        self.keyframes.len()
    }

    #[must_use]
    pub fn first(&self) -> Option<&Keyframe> {
        self.keyframes.first()
    }

    #[must_use]
    pub fn last(&self) -> Option<&Keyframe> {
        self.keyframes.last()
    }
}

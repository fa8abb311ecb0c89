//! Pose sampling.
//!
//! [`Animator`] is a pure function of `(clip, time, hierarchy)`: it keeps no
//! per-frame state and may run on any thread once the clip and hierarchy are
//! loaded. Callers own their [`Pose`] buffers, one per playing instance.

use glam::Mat4;
use rustc_hash::FxHashMap;

use crate::animation::clip::{AnimationData, Keyframe};
use crate::animation::skeleton::{JointHierarchy, JointId};
use crate::animation::transform::JointTransform;
use crate::assets::model::MeshSkin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    /// Clamp to the first/last keyframe.
    Once,
    /// Wrap modulo the clip length.
    #[default]
    Loop,
    /// Play forward, then backward.
    PingPong,
}

impl LoopMode {
    /// Maps any elapsed time into `[0, length]`.
    ///
    /// Never fails: negative or huge times are folded by the mode's policy.
    #[must_use]
    pub fn normalize(self, elapsed: f32, length: f32) -> f32 {
        if elapsed.is_nan() || length <= 0.0 {
            return 0.0;
        }
        match self {
            LoopMode::Once => elapsed.clamp(0.0, length),
            _ if elapsed.is_infinite() => 0.0,
            LoopMode::Loop => {
                let t = elapsed.rem_euclid(length);
                // rem_euclid may round up to `length` for tiny negative inputs
                if t >= length { 0.0 } else { t }
            }
            LoopMode::PingPong => {
                let double = length * 2.0;
                let t = elapsed.rem_euclid(double);
                if t > length { double - t } else { t }
            }
        }
    }

    #[inline]
    fn wraps(self) -> bool {
        matches!(self, LoopMode::Loop)
    }
}

/// Where a time falls relative to the keyframes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bracket {
    /// Exactly on (or clamped to) one keyframe.
    Exact(usize),
    /// Between two keyframes; `next` may precede `prev` when the interval
    /// spans the loop point.
    Between { prev: usize, next: usize, factor: f32 },
}

/// The current local and global transform of every joint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pose {
    locals: Vec<Mat4>,
    globals: Vec<Mat4>,
}

impl Pose {
    /// The rest pose of `hierarchy`.
    #[must_use]
    pub fn bind(hierarchy: &JointHierarchy) -> Self {
        let locals: Vec<Mat4> = hierarchy.iter().map(|(_, j)| j.bind_local).collect();
        let mut pose = Self {
            locals,
            globals: Vec::new(),
        };
        pose.compose(hierarchy);
        pose
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.globals.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.globals.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn local(&self, joint: JointId) -> Mat4 {
        self.locals[joint.index()]
    }

    #[inline]
    #[must_use]
    pub fn global(&self, joint: JointId) -> Mat4 {
        self.globals[joint.index()]
    }

    #[inline]
    #[must_use]
    pub fn globals(&self) -> &[Mat4] {
        &self.globals
    }

    #[inline]
    #[must_use]
    pub fn locals(&self) -> &[Mat4] {
        &self.locals
    }

    #[must_use]
    pub fn global_by_name(&self, hierarchy: &JointHierarchy, name: &str) -> Option<Mat4> {
        hierarchy.id(name).and_then(|id| self.globals.get(id.index()).copied())
    }

    #[must_use]
    pub fn local_by_name(&self, hierarchy: &JointHierarchy, name: &str) -> Option<Mat4> {
        hierarchy.id(name).and_then(|id| self.locals.get(id.index()).copied())
    }

    /// The pose as a joint name → global transform map.
    #[must_use]
    pub fn to_named_map(&self, hierarchy: &JointHierarchy) -> FxHashMap<String, Mat4> {
        hierarchy
            .iter()
            .map(|(id, joint)| (joint.name.clone(), self.globals[id.index()]))
            .collect()
    }

    /// Skinning palette for `skin`: `global × inverse_bind` per bone.
    #[must_use]
    pub fn skinning_matrices(&self, skin: &MeshSkin) -> Vec<Mat4> {
        skin.joint_matrices(self)
    }

    /// Root-to-leaf composition. Relies on ids being in pre-order.
    fn compose(&mut self, hierarchy: &JointHierarchy) {
        self.globals.clear();
        self.globals.reserve(self.locals.len());
        for (id, joint) in hierarchy.iter() {
            let parent = joint.parent.map_or(Mat4::IDENTITY, |p| self.globals[p.index()]);
            self.globals.push(parent * self.locals[id.index()]);
        }
    }
}

/// Stateless pose sampler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Animator {
    pub loop_mode: LoopMode,
}

impl Animator {
    #[must_use]
    pub fn new(loop_mode: LoopMode) -> Self {
        Self { loop_mode }
    }

    #[must_use]
    pub fn sample_pose(&self, clip: &AnimationData, elapsed: f32, hierarchy: &JointHierarchy) -> Pose {
        let mut pose = Pose::default();
        self.sample_into(clip, elapsed, hierarchy, &mut pose);
        pose
    }

    /// Same as [`Self::sample_pose`], reusing `pose`'s allocations.
    pub fn sample_into(&self, clip: &AnimationData, elapsed: f32, hierarchy: &JointHierarchy, pose: &mut Pose) {
        let bracket = self.bracket(clip, elapsed);

        pose.locals.clear();
        pose.locals.reserve(hierarchy.len());

        match bracket {
            Bracket::Exact(i) => {
                let frame = clip.keyframes.get(i);
                for (id, joint) in hierarchy.iter() {
                    let local = frame
                        .and_then(|f| f.transform(id))
                        .map_or(joint.bind_local, |k| k.matrix);
                    pose.locals.push(local);
                }
            }
            Bracket::Between { prev, next, factor } => {
                let a = &clip.keyframes[prev];
                let b = &clip.keyframes[next];
                for (id, joint) in hierarchy.iter() {
                    let from = components(a, id, joint.bind_components());
                    let to = components(b, id, joint.bind_components());
                    pose.locals.push(from.interpolate(&to, factor).to_matrix());
                }
            }
        }

        pose.compose(hierarchy);
    }

    /// Finds the keyframes bracketing `elapsed` after applying the loop policy.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn bracket(&self, clip: &AnimationData, elapsed: f32) -> Bracket {
        let frames = &clip.keyframes;
        let count = frames.len();
        if count <= 1 {
            return Bracket::Exact(0);
        }

        let length = clip.length_seconds;
        let t = self.loop_mode.normalize(elapsed, length);
        let first = frames[0].timestamp;
        let last = frames[count - 1].timestamp;

        // Number of keyframes at or before t.
        let at_or_before = frames.partition_point(|k| k.timestamp <= t);

        if at_or_before == 0 {
            if !self.loop_mode.wraps() {
                return Bracket::Exact(0);
            }
            // Interval from the last keyframe, across the loop point, to the first.
            let span = (length - last) + first;
            let into = (length - last) + t;
            return between(count - 1, 0, into, span);
        }

        let prev = at_or_before - 1;
        let prev_time = frames[prev].timestamp;
        if prev_time == t {
            return Bracket::Exact(prev);
        }

        if prev == count - 1 {
            if !self.loop_mode.wraps() {
                return Bracket::Exact(prev);
            }
            let span = (length - last) + first;
            return between(prev, 0, t - last, span);
        }

        let next = prev + 1;
        between(prev, next, t - prev_time, frames[next].timestamp - prev_time)
    }
}

fn between(prev: usize, next: usize, into: f32, span: f32) -> Bracket {
    let factor = if span > 0.0 { (into / span).clamp(0.0, 1.0) } else { 0.0 };
    if factor <= 0.0 {
        Bracket::Exact(prev)
    } else if factor >= 1.0 {
        Bracket::Exact(next)
    } else {
        Bracket::Between { prev, next, factor }
    }
}

#[inline]
fn components(frame: &Keyframe, id: JointId, bind: &JointTransform) -> JointTransform {
    frame.transform(id).map_or(*bind, |k| k.components)
}

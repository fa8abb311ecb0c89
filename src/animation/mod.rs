pub mod values;
pub mod tracks;
pub mod transform;
pub mod skeleton;
pub mod clip;
pub mod resolver;
pub mod sampler;
pub mod player;

pub use clip::{AnimationData, KeyFrameData, Keyframe, RawClip};
pub use player::AnimationPlayer;
pub use resolver::{bind_skin, build_hierarchy, resolve, resolve_clip, resolve_with};
pub use sampler::{Animator, Bracket, LoopMode, Pose};
pub use skeleton::{Joint, JointDefinition, JointHierarchy, JointId};
pub use tracks::{InterpolationMode, KeyframeTrack};
pub use transform::{JointTransform, KeyedTransform};

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

//! Off-thread COLLADA/glTF loading and skeletal pose sampling.
//!
//! [`assets::AssetLoader`] parses a model on a worker thread and hands it back
//! through a [`assets::LoadTask`] polled on the caller's thread. The resolved
//! [`animation::JointHierarchy`] and [`animation::AnimationData`] clips are
//! sampled with an [`animation::Animator`].

pub mod animation;
pub mod assets;
pub mod document;
pub mod errors;

pub use animation::{
    AnimationData, AnimationPlayer, Animator, JointHierarchy, JointId, KeyFrameData, LoopMode, Pose, RawClip,
};
pub use assets::{AssetLoader, AssetResolver, LoadSettings, LoadTask, ModelData, TaskState};
pub use document::DocumentNode;
pub use errors::{Error, ErrorKind, Result};

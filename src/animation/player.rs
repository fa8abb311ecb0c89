use std::sync::Arc;

use crate::animation::clip::AnimationData;
use crate::animation::sampler::{Animator, LoopMode, Pose};
use crate::animation::skeleton::JointHierarchy;
use crate::assets::settings::LoadSettings;

/// Playback clock for one renderable instance.
///
/// Several players may share the same clip and hierarchy while playing at
/// different times; each owns its pose buffer.
#[derive(Debug, Clone)]
pub struct AnimationPlayer {
    clip: Arc<AnimationData>,

    pub time: f32,
    pub time_scale: f32,
    pub loop_mode: LoopMode,
    pub paused: bool,

    pose: Pose,
}

impl AnimationPlayer {
    #[must_use]
    pub fn new(clip: Arc<AnimationData>, loop_mode: LoopMode) -> Self {
        Self {
            clip,
            time: 0.0,
            time_scale: 1.0,
            loop_mode,
            paused: false,
            pose: Pose::default(),
        }
    }

    /// Uses the loop mode configured for the loader that produced `clip`.
    #[must_use]
    pub fn with_settings(clip: Arc<AnimationData>, settings: &LoadSettings) -> Self {
        Self::new(clip, settings.loop_mode)
    }

    #[must_use]
    pub fn clip(&self) -> &Arc<AnimationData> {
        &self.clip
    }

    /// Switches clips and rewinds.
    pub fn set_clip(&mut self, clip: Arc<AnimationData>) {
        self.clip = clip;
        self.time = 0.0;
        self.paused = false;
    }

    /// Advances the clock by `dt` seconds.
    pub fn update(&mut self, dt: f32) {
        if self.paused {
            return;
        }

        let duration = self.clip.length_seconds;
        if duration <= 0.0 {
            return;
        }

        self.time += dt * self.time_scale;

        match self.loop_mode {
            LoopMode::Once => {
                // Play once, stop at end or start
                if self.time >= duration {
                    self.time = duration;
                    self.paused = true;
                } else if self.time < 0.0 {
                    self.time = 0.0;
                    self.paused = true;
                }
            }
            // Keep the clock bounded so precision does not degrade over long sessions.
            LoopMode::Loop => self.time = self.time.rem_euclid(duration),
            LoopMode::PingPong => self.time = self.time.rem_euclid(duration * 2.0),
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.loop_mode == LoopMode::Once && self.paused && self.time >= self.clip.length_seconds
    }

    /// Samples the clip at the current time into the owned pose buffer.
    pub fn pose(&mut self, hierarchy: &JointHierarchy) -> &Pose {
        Animator::new(self.loop_mode).sample_into(&self.clip, self.time, hierarchy, &mut self.pose);
        &self.pose
    }
}

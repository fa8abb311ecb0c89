use glam::Vec3;

use crate::animation::sampler::LoopMode;

/// Per-loader options. Construct with struct-update syntax over `Default`.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadSettings {
    /// Default playback policy for players created from loaded clips.
    pub loop_mode: LoopMode,
    /// Edge length of the cube the model is fitted into, via `root_transform`.
    pub fit_size: Option<f32>,
    pub fit_center: Vec3,
    /// Run the texture pass after structural parsing.
    pub resolve_textures: bool,
    /// Joint influences kept per vertex, strongest first.
    pub max_influences: usize,
    /// Convert `Z_UP`/`X_UP` COLLADA documents to Y-up.
    pub apply_up_axis: bool,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            loop_mode: LoopMode::Loop,
            fit_size: None,
            fit_center: Vec3::ZERO,
            resolve_textures: true,
            max_influences: 4,
            apply_up_axis: true,
        }
    }
}

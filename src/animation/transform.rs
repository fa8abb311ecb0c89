use glam::{Mat4, Quat, Vec3};

use crate::animation::values::Interpolatable;

/// A joint-local transform split into translation, rotation and scale.
///
/// Blending happens on these components, never on raw matrices: a linear blend
/// of two rotation matrices is not a rotation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JointTransform {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for JointTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl JointTransform {
    pub const IDENTITY: Self = Self {
        translation: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    #[must_use]
    pub fn new(translation: Vec3, rotation: Quat, scale: Vec3) -> Self {
        Self {
            translation,
            rotation,
            scale,
        }
    }

    /// Decomposes an affine matrix. Shear is discarded.
    #[must_use]
    pub fn from_matrix(matrix: &Mat4) -> Self {
        let (scale, rotation, translation) = matrix.to_scale_rotation_translation();
        Self {
            translation,
            rotation: rotation.normalize(),
            scale,
        }
    }

    #[must_use]
    pub fn to_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }

    /// Translation and scale blend linearly, rotation along the shortest arc.
    #[must_use]
    pub fn interpolate(&self, other: &Self, factor: f32) -> Self {
        Self::interpolate_linear(*self, *other, factor)
    }
}

impl Interpolatable for JointTransform {
    fn interpolate_linear(start: Self, end: Self, t: f32) -> Self {
        Self {
            translation: Vec3::interpolate_linear(start.translation, end.translation, t),
            rotation: Quat::interpolate_linear(start.rotation, end.rotation, t),
            scale: Vec3::interpolate_linear(start.scale, end.scale, t),
        }
    }

    fn interpolate_cubic(v0: Self, out_tangent0: Self, in_tangent1: Self, v1: Self, t: f32, dt: f32) -> Self {
        Self {
            translation: Vec3::interpolate_cubic(
                v0.translation,
                out_tangent0.translation,
                in_tangent1.translation,
                v1.translation,
                t,
                dt,
            ),
            rotation: Quat::interpolate_cubic(
                v0.rotation,
                out_tangent0.rotation,
                in_tangent1.rotation,
                v1.rotation,
                t,
                dt,
            ),
            scale: Vec3::interpolate_cubic(v0.scale, out_tangent0.scale, in_tangent1.scale, v1.scale, t, dt),
        }
    }
}

/// A keyed local transform: the authored matrix plus its decomposition.
///
/// The matrix is kept so that sampling exactly on a keyframe reproduces the
/// authored value bit for bit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyedTransform {
    pub matrix: Mat4,
    pub components: JointTransform,
}

impl KeyedTransform {
    #[must_use]
    pub fn new(matrix: Mat4) -> Self {
        Self {
            matrix,
            components: JointTransform::from_matrix(&matrix),
        }
    }
}

impl From<Mat4> for KeyedTransform {
    fn from(matrix: Mat4) -> Self {
        Self::new(matrix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    #[test]
    fn decompose_recompose_roundtrip() {
        let m = Mat4::from_scale_rotation_translation(
            Vec3::new(2.0, 2.0, 2.0),
            Quat::from_rotation_y(FRAC_PI_2),
            Vec3::new(1.0, -3.0, 0.5),
        );
        let back = JointTransform::from_matrix(&m).to_matrix();
        assert!(back.abs_diff_eq(m, 1e-5));
    }

    #[test]
    fn interpolate_midpoint_blends_every_component() {
        let a = JointTransform::IDENTITY;
        let b = JointTransform::new(Vec3::new(2.0, 0.0, 0.0), Quat::from_rotation_x(FRAC_PI_2), Vec3::splat(3.0));
        let mid = a.interpolate(&b, 0.5);
        assert!(mid.translation.abs_diff_eq(Vec3::new(1.0, 0.0, 0.0), 1e-6));
        assert!(mid.scale.abs_diff_eq(Vec3::splat(2.0), 1e-6));
        assert!(mid.rotation.angle_between(Quat::from_rotation_x(FRAC_PI_2 / 2.0)) < 1e-4);
    }
}

//! Renderer-agnostic model representation.
//!
//! [`ParsedAsset`] is what a format parser produces; [`ModelData`] is the same
//! content after the joint graph and clips have been resolved. Geometry
//! buffers are plain CPU arrays, opaque to the rest of the pipeline.

use std::sync::Arc;

use glam::{Mat4, Vec2, Vec3, Vec4};
use uuid::Uuid;

use crate::animation::clip::{AnimationData, RawClip};
use crate::animation::resolver;
use crate::animation::sampler::Pose;
use crate::animation::skeleton::{JointDefinition, JointHierarchy, JointId};
use crate::assets::context::LoadContext;
use crate::errors::{Error, Result};

/// Per-mesh skinning data.
#[derive(Debug, Clone, Default)]
pub struct MeshSkin {
    /// Joint names in the order vertex joint indices refer to them.
    pub bone_names: Vec<String>,
    /// One per bone, same order as `bone_names`.
    pub inverse_bind_matrices: Vec<Mat4>,
    /// Per vertex: up to four indices into `bone_names`.
    pub joints: Vec<[u16; 4]>,
    /// Per vertex: weights matching `joints`, summing to one.
    pub weights: Vec<[f32; 4]>,
    pub(crate) bound: Vec<JointId>,
}

impl MeshSkin {
    /// Unbound skin over `bone_names`, without vertex influences.
    #[must_use]
    pub fn new<I, S>(bone_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            bone_names: bone_names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Hierarchy ids of the bones, filled in by the resolver.
    #[inline]
    #[must_use]
    pub fn bound_joints(&self) -> &[JointId] {
        &self.bound
    }

    /// `global × inverse_bind` for every bone, in bone-list order.
    #[must_use]
    pub fn joint_matrices(&self, pose: &Pose) -> Vec<Mat4> {
        let mut out = Vec::with_capacity(self.bound.len());
        self.write_joint_matrices(pose, &mut out);
        out
    }

    pub fn write_joint_matrices(&self, pose: &Pose, out: &mut Vec<Mat4>) {
        out.clear();
        out.extend(
            self.bound
                .iter()
                .zip(&self.inverse_bind_matrices)
                .map(|(id, ibm)| pose.global(*id) * *ibm),
        );
    }
}

#[derive(Debug, Clone, Default)]
pub struct MeshData {
    pub name: String,
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub tex_coords: Vec<Vec2>,
    pub indices: Vec<u32>,
    /// Index into [`ModelData::materials`].
    pub material: Option<usize>,
    pub skin: Option<MeshSkin>,
}

impl MeshData {
    #[inline]
    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    #[inline]
    #[must_use]
    pub fn is_skinned(&self) -> bool {
        self.skin.is_some()
    }
}

/// Where a texture's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextureSource {
    /// Reference resolved through the asset resolver, relative to the model.
    Uri(String),
    /// Bytes stored inside the asset itself.
    Embedded {
        bytes: Arc<[u8]>,
        mime_type: Option<String>,
    },
}

/// Decoded RGBA8 pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureImage {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureBinding {
    pub source: TextureSource,
    /// Filled by the parser's second pass; `None` if not (yet) resolved.
    pub image: Option<TextureImage>,
}

impl TextureBinding {
    #[must_use]
    pub fn new(source: TextureSource) -> Self {
        Self { source, image: None }
    }
}

#[derive(Debug, Clone)]
pub struct MaterialData {
    pub name: String,
    pub diffuse_color: Vec4,
    pub texture: Option<TextureBinding>,
}

impl MaterialData {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            diffuse_color: Vec4::ONE,
            texture: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min: Vec3,
    pub max: Vec3,
}

impl BoundingBox {
    #[must_use]
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let (min, max) = iter.fold((first, first), |(min, max), p| (min.min(p), max.max(p)));
        Some(Self { min, max })
    }

    #[must_use]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    #[must_use]
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }
}

/// Output of a format parser's first pass, before joint resolution.
#[derive(Debug, Clone, Default)]
pub struct ParsedAsset {
    pub meshes: Vec<MeshData>,
    pub materials: Vec<MaterialData>,
    /// Empty for static models.
    pub joints: Vec<JointDefinition>,
    pub clips: Vec<RawClip>,
}

impl ParsedAsset {
    /// Resolves the skeleton and clips and binds every skinned mesh.
    pub fn resolve(self, source: &str, ctx: &LoadContext) -> Result<ModelData> {
        let ParsedAsset {
            mut meshes,
            materials,
            joints,
            clips,
        } = self;

        let (skeleton, animations) = if joints.is_empty() {
            if let Some(bone) = meshes
                .iter()
                .filter_map(|m| m.skin.as_ref())
                .find_map(|s| s.bone_names.first())
            {
                return Err(Error::unresolved_joint(
                    bone,
                    "mesh is skinned but the asset declares no skeleton",
                ));
            }
            if !clips.is_empty() {
                log::warn!("{source}: dropping {} clip(s) without a skeleton", clips.len());
            }
            (None, Vec::new())
        } else {
            let (hierarchy, animations) = resolver::resolve_with(joints, clips, ctx)?;
            for mesh in &mut meshes {
                if let Some(skin) = mesh.skin.as_mut() {
                    resolver::bind_skin(skin, &mesh.name, &hierarchy)?;
                }
            }
            (
                Some(Arc::new(hierarchy)),
                animations.into_iter().map(Arc::new).collect(),
            )
        };

        Ok(ModelData {
            id: Uuid::new_v4(),
            source: source.to_string(),
            meshes,
            materials,
            skeleton,
            animations,
            root_transform: Mat4::IDENTITY,
        })
    }
}

/// A fully loaded model, read-only once its load task completes.
#[derive(Debug, Clone)]
pub struct ModelData {
    pub id: Uuid,
    pub source: String,
    pub meshes: Vec<MeshData>,
    pub materials: Vec<MaterialData>,
    pub skeleton: Option<Arc<JointHierarchy>>,
    pub animations: Vec<Arc<AnimationData>>,
    /// Placement applied on top of the model's own coordinates.
    pub root_transform: Mat4,
}

impl Default for ModelData {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            source: String::new(),
            meshes: Vec::new(),
            materials: Vec::new(),
            skeleton: None,
            animations: Vec::new(),
            root_transform: Mat4::IDENTITY,
        }
    }
}

impl ModelData {
    #[must_use]
    pub fn is_animated(&self) -> bool {
        self.skeleton.is_some() && !self.animations.is_empty()
    }

    #[must_use]
    pub fn animation(&self, name: &str) -> Option<&Arc<AnimationData>> {
        self.animations.iter().find(|a| a.name == name)
    }

    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.meshes.iter().map(MeshData::vertex_count).sum()
    }

    /// Bind-pose bounds over all mesh positions.
    #[must_use]
    pub fn bounds(&self) -> Option<BoundingBox> {
        BoundingBox::from_points(self.meshes.iter().flat_map(|m| m.positions.iter().copied()))
    }

    /// Transform that scales the model uniformly so its largest extent equals
    /// `size`, centred on `center`.
    #[must_use]
    pub fn fit_transform(&self, size: f32, center: Vec3) -> Mat4 {
        let Some(bounds) = self.bounds() else {
            return Mat4::IDENTITY;
        };
        let extent = bounds.size().max_element();
        let scale = if extent > f32::EPSILON { size / extent } else { 1.0 };
        Mat4::from_translation(center)
            * Mat4::from_scale(Vec3::splat(scale))
            * Mat4::from_translation(-bounds.center())
    }
}

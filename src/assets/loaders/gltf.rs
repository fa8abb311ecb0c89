//! glTF 2.0 / GLB loader built on the `gltf` crate.
//!
//! Skin joints become the skeleton; node animation channels are resampled into
//! whole-skeleton keyframes on the union of their sample times.

use std::sync::Arc;

use glam::{Mat4, Quat, Vec2, Vec3, Vec4};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::animation::clip::{KeyFrameData, RawClip};
use crate::animation::skeleton::JointDefinition;
use crate::animation::tracks::{InterpolationMode, KeyframeTrack, merge_sample_times};
use crate::assets::context::Section;
use crate::assets::io::{data_uri_mime, decode_data_uri, resolve_relative};
use crate::assets::loaders::ParseRequest;
use crate::assets::loaders::collada::SYNTHETIC_ROOT;
use crate::assets::model::{
    MaterialData, MeshData, MeshSkin, ParsedAsset, TextureBinding, TextureSource,
};
use crate::errors::{Error, Result};

const TIME_EPSILON: f32 = 1e-5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GltfParser;

impl GltfParser {
    pub fn build(&self, bytes: &[u8], req: &ParseRequest<'_>) -> Result<ParsedAsset> {
        let gltf = gltf::Gltf::from_slice(bytes)?;
        req.ctx.checkpoint(Section::Document)?;

        let buffers = load_buffers(&gltf, req)?;
        let mut loader = GltfBuilder::new(&gltf, &buffers, req)?;
        loader.build()
    }
}

fn load_buffers(gltf: &gltf::Gltf, req: &ParseRequest<'_>) -> Result<Vec<Vec<u8>>> {
    let mut buffer_data = Vec::new();
    for buffer in gltf.buffers() {
        let data = match buffer.source() {
            gltf::buffer::Source::Bin => gltf
                .blob
                .clone()
                .ok_or_else(|| Error::malformed("BIN chunk"))?,
            gltf::buffer::Source::Uri(uri) if uri.starts_with("data:") => {
                decode_data_uri(uri).map_err(|e| Error::stream(uri, e))?
            }
            gltf::buffer::Source::Uri(uri) => {
                req.resolver.read_bytes(&resolve_relative(req.uri, uri)?)?
            }
        };
        if data.len() < buffer.length() {
            return Err(Error::malformed(format!("buffer {}", buffer.index())));
        }
        buffer_data.push(data);
    }
    Ok(buffer_data)
}

fn buffer_slice<'a>(buffers: &'a [Vec<u8>], buffer: &gltf::Buffer<'_>) -> Option<&'a [u8]> {
    buffers.get(buffer.index()).map(Vec::as_slice)
}

fn node_matrix(node: &gltf::Node<'_>) -> Mat4 {
    Mat4::from_cols_array_2d(&node.transform().matrix())
}

struct GltfBuilder<'a> {
    gltf: &'a gltf::Gltf,
    buffers: &'a [Vec<u8>],
    req: &'a ParseRequest<'a>,
    parents: Vec<Option<usize>>,
    world: Vec<Mat4>,
    /// Joint name per node index, for nodes used by any skin.
    joint_names: FxHashMap<usize, String>,
    /// Transform in front of a joint's animated local (ancestors outside the skeleton).
    prefixes: FxHashMap<usize, Mat4>,
    warned: FxHashSet<&'static str>,
}

impl<'a> GltfBuilder<'a> {
    /// Fails with `MalformedAsset("nodes")` unless the node graph is a forest.
    fn new(gltf: &'a gltf::Gltf, buffers: &'a [Vec<u8>], req: &'a ParseRequest<'a>) -> Result<Self> {
        let count = gltf.nodes().len();
        let mut parents = vec![None; count];
        for node in gltf.nodes() {
            for child in node.children() {
                parents[child.index()] = Some(node.index());
            }
        }

        let mut world = vec![Mat4::IDENTITY; count];
        let mut stack: Vec<(usize, Mat4)> = (0..count)
            .filter(|&i| parents[i].is_none())
            .map(|i| (i, Mat4::IDENTITY))
            .collect();
        let nodes: Vec<gltf::Node<'a>> = gltf.nodes().collect();
        let mut visited = vec![false; count];
        while let Some((index, parent_world)) = stack.pop() {
            // A second visit means a cycle or a node shared by two parents.
            if std::mem::replace(&mut visited[index], true) {
                return Err(Error::malformed("nodes"));
            }
            world[index] = parent_world * node_matrix(&nodes[index]);
            stack.extend(nodes[index].children().map(|c| (c.index(), world[index])));
        }
        // Nodes on a cycle with no root are never reached.
        if visited.contains(&false) {
            return Err(Error::malformed("nodes"));
        }

        Ok(Self {
            gltf,
            buffers,
            req,
            parents,
            world,
            joint_names: FxHashMap::default(),
            prefixes: FxHashMap::default(),
            warned: FxHashSet::default(),
        })
    }

    fn warn_once(&mut self, what: &'static str) {
        if self.warned.insert(what) {
            log::warn!("{}: skipping unsupported {what}", self.req.uri);
        }
    }

    fn build(&mut self) -> Result<ParsedAsset> {
        let materials = self.load_materials()?;
        self.req.ctx.checkpoint(Section::Materials)?;

        let joints = self.load_skeleton();
        let meshes = self.load_meshes()?;
        self.req.ctx.checkpoint(Section::Geometry)?;
        self.req.ctx.checkpoint(Section::Skeleton)?;

        let clips = if joints.is_empty() {
            Vec::new()
        } else {
            self.load_animations()?
        };
        self.req.ctx.checkpoint(Section::Animation)?;

        Ok(ParsedAsset {
            meshes,
            materials,
            joints,
            clips,
        })
    }

    fn load_materials(&self) -> Result<Vec<MaterialData>> {
        let mut materials = Vec::new();
        for (i, material) in self.gltf.materials().enumerate() {
            let name = material.name().map_or_else(|| format!("material_{i}"), str::to_string);
            let pbr = material.pbr_metallic_roughness();
            let mut data = MaterialData::new(name);
            data.diffuse_color = Vec4::from_array(pbr.base_color_factor());

            if let Some(info) = pbr.base_color_texture() {
                let source = match info.texture().source().source() {
                    gltf::image::Source::View { view, mime_type } => {
                        let bytes = buffer_slice(self.buffers, &view.buffer())
                            .and_then(|b| b.get(view.offset()..view.offset() + view.length()))
                            .ok_or_else(|| Error::malformed(format!("buffer view {}", view.index())))?;
                        TextureSource::Embedded {
                            bytes: Arc::from(bytes),
                            mime_type: Some(mime_type.to_string()),
                        }
                    }
                    gltf::image::Source::Uri { uri, mime_type } if uri.starts_with("data:") => {
                        let bytes = decode_data_uri(uri).map_err(|e| Error::stream("data:", e))?;
                        TextureSource::Embedded {
                            bytes: Arc::from(bytes),
                            mime_type: mime_type.or_else(|| data_uri_mime(uri)).map(str::to_string),
                        }
                    }
                    gltf::image::Source::Uri { uri, .. } => TextureSource::Uri(uri.to_string()),
                };
                data.texture = Some(TextureBinding::new(source));
            }
            materials.push(data);
        }
        Ok(materials)
    }

    /// Union of all skin joints. Ancestors outside the skeleton are folded
    /// into the top-level joints.
    fn load_skeleton(&mut self) -> Vec<JointDefinition> {
        let joint_set: FxHashSet<usize> = self
            .gltf
            .skins()
            .flat_map(|s| s.joints().map(|j| j.index()).collect::<Vec<_>>())
            .collect();
        if joint_set.is_empty() {
            return Vec::new();
        }

        let document = self.gltf;
        let nodes: Vec<gltf::Node<'a>> = document.nodes().collect();
        let mut ordered: Vec<usize> = joint_set.iter().copied().collect();
        ordered.sort_unstable();

        let mut used = FxHashSet::default();
        for &index in &ordered {
            let mut name = nodes[index]
                .name()
                .map_or_else(|| format!("Node_{index}"), str::to_string);
            if !used.insert(name.clone()) {
                name = format!("{name}_{index}");
                used.insert(name.clone());
            }
            self.joint_names.insert(index, name);
        }

        let mut definitions = Vec::with_capacity(ordered.len() + 1);
        let mut roots = Vec::new();
        for &index in &ordered {
            let node = &nodes[index];
            let mut bind_local = node_matrix(node);
            let parent = self.parents[index];
            if parent.is_none_or(|p| !joint_set.contains(&p)) {
                let prefix = parent.map_or(Mat4::IDENTITY, |p| self.world[p]);
                if prefix != Mat4::IDENTITY {
                    self.prefixes.insert(index, prefix);
                }
                bind_local = prefix * bind_local;
                roots.push(self.joint_names[&index].clone());
            }
            let children: Vec<String> = node
                .children()
                .filter_map(|c| self.joint_names.get(&c.index()).cloned())
                .collect();
            definitions.push(
                JointDefinition::new(self.joint_names[&index].clone(), bind_local).with_children(children),
            );
        }

        if roots.len() > 1 {
            definitions.push(JointDefinition::new(SYNTHETIC_ROOT, Mat4::IDENTITY).with_children(roots));
        }
        definitions
    }

    fn load_meshes(&mut self) -> Result<Vec<MeshData>> {
        let mut meshes = Vec::new();
        let document = self.gltf;
        for node in document.nodes() {
            let Some(mesh) = node.mesh() else { continue };
            let base_name = mesh
                .name()
                .or_else(|| node.name())
                .map_or_else(|| format!("mesh_{}", mesh.index()), str::to_string);
            let skin = node.skin().map(|s| self.read_skin(&s));

            let primitive_count = mesh.primitives().len();
            for primitive in mesh.primitives() {
                if primitive.mode() != gltf::mesh::Mode::Triangles {
                    self.warn_once("non-triangle primitive");
                    continue;
                }
                let mut data = self.read_primitive(&primitive)?;
                data.name = if primitive_count > 1 {
                    format!("{base_name}_{}", primitive.index())
                } else {
                    base_name.clone()
                };

                match &skin {
                    Some((bone_names, inverse_binds)) => {
                        if let Some(skin) = data.skin.as_mut() {
                            skin.bone_names.clone_from(bone_names);
                            skin.inverse_bind_matrices.clone_from(inverse_binds);
                        }
                    }
                    None => {
                        data.skin = None;
                        bake_transform(&mut data, self.world[node.index()]);
                    }
                }
                meshes.push(data);
            }
        }
        Ok(meshes)
    }

    fn read_skin(&self, skin: &gltf::Skin<'_>) -> (Vec<String>, Vec<Mat4>) {
        let bone_names = skin
            .joints()
            .map(|j| {
                self.joint_names
                    .get(&j.index())
                    .cloned()
                    .unwrap_or_else(|| format!("Node_{}", j.index()))
            })
            .collect();
        let buffers = self.buffers;
        let reader = skin.reader(|b| buffer_slice(buffers, &b));
        let inverse_binds = reader
            .read_inverse_bind_matrices()
            .map(|iter| iter.map(|m| Mat4::from_cols_array_2d(&m)).collect())
            .unwrap_or_default();
        (bone_names, inverse_binds)
    }

    fn read_primitive(&self, primitive: &gltf::Primitive<'_>) -> Result<MeshData> {
        let buffers = self.buffers;
        let reader = primitive.reader(|b| buffer_slice(buffers, &b));
        let section = || Error::malformed(format!("mesh primitive {}", primitive.index()));

        let positions: Vec<Vec3> = reader
            .read_positions()
            .ok_or_else(section)?
            .map(Vec3::from_array)
            .collect();
        let normals = reader
            .read_normals()
            .map(|iter| iter.map(Vec3::from_array).collect())
            .unwrap_or_default();
        let tex_coords = reader
            .read_tex_coords(0)
            .map(|tc| tc.into_f32().map(Vec2::from_array).collect())
            .unwrap_or_default();
        let indices: Vec<u32> = match reader.read_indices() {
            Some(indices) => indices.into_u32().collect(),
            None => (0..positions.len() as u32).collect(),
        };
        if indices.iter().any(|&i| i as usize >= positions.len()) {
            return Err(section());
        }

        let skin = match (reader.read_joints(0), reader.read_weights(0)) {
            (Some(joints), Some(weights)) => Some(MeshSkin {
                joints: joints.into_u16().collect(),
                weights: weights.into_f32().collect(),
                ..MeshSkin::default()
            }),
            _ => None,
        };

        Ok(MeshData {
            name: String::new(),
            positions,
            normals,
            tex_coords,
            indices,
            material: primitive.material().index(),
            skin,
        })
    }

    fn load_animations(&mut self) -> Result<Vec<RawClip>> {
        let mut clips = Vec::new();
        let document = self.gltf;
        let buffers = self.buffers;
        let nodes: Vec<gltf::Node<'a>> = document.nodes().collect();
        let mut skipped_morph = false;

        for (i, animation) in document.animations().enumerate() {
            let mut tracks: FxHashMap<usize, NodeTracks> = FxHashMap::default();
            for channel in animation.channels() {
                let target = channel.target();
                let node = target.node().index();
                if !self.joint_names.contains_key(&node) {
                    log::debug!("{}: ignoring animation of non-joint node {node}", self.req.uri);
                    continue;
                }
                let reader = channel.reader(|b| buffer_slice(buffers, &b));
                let times: Vec<f32> = reader
                    .read_inputs()
                    .ok_or_else(|| Error::malformed(format!("animation {i}")))?
                    .collect();
                let interpolation = match channel.sampler().interpolation() {
                    gltf::animation::Interpolation::Linear => InterpolationMode::Linear,
                    gltf::animation::Interpolation::Step => InterpolationMode::Step,
                    gltf::animation::Interpolation::CubicSpline => InterpolationMode::CubicSpline,
                };
                let entry = tracks.entry(node).or_default();
                match reader.read_outputs() {
                    Some(gltf::animation::util::ReadOutputs::Translations(iter)) => {
                        entry.translation = Some(KeyframeTrack::new(times, iter.map(Vec3::from_array).collect(), interpolation));
                    }
                    Some(gltf::animation::util::ReadOutputs::Rotations(iter)) => {
                        // Cubic spline outputs are (in-tangent, value, out-tangent); tangents stay unnormalized.
                        let cubic = interpolation == InterpolationMode::CubicSpline;
                        let values = iter
                            .into_f32()
                            .enumerate()
                            .map(|(k, r)| {
                                let q = Quat::from_array(r);
                                if cubic && k % 3 != 1 { q } else { q.normalize() }
                            })
                            .collect();
                        entry.rotation = Some(KeyframeTrack::new(times, values, interpolation));
                    }
                    Some(gltf::animation::util::ReadOutputs::Scales(iter)) => {
                        entry.scale = Some(KeyframeTrack::new(times, iter.map(Vec3::from_array).collect(), interpolation));
                    }
                    Some(gltf::animation::util::ReadOutputs::MorphTargetWeights(_)) => {
                        skipped_morph = true;
                    }
                    None => return Err(Error::malformed(format!("animation {i}"))),
                }
            }

            let name = animation.name().map_or_else(|| format!("animation_{i}"), str::to_string);
            tracks.retain(|_, t| t.prune());
            if tracks.is_empty() {
                log::warn!("{}: animation `{name}` animates no joints, skipping", self.req.uri);
                continue;
            }

            let times = merge_sample_times(tracks.values().flat_map(|t| t.times()), TIME_EPSILON);
            let mut ordered: Vec<(&usize, &NodeTracks)> = tracks.iter().collect();
            ordered.sort_unstable_by_key(|(node, _)| **node);

            let keyframes = times
                .iter()
                .map(|&t| {
                    let mut frame = KeyFrameData::new(t);
                    for &(&node, node_tracks) in &ordered {
                        let (translation, rotation, scale) = nodes[node].transform().decomposed();
                        let local = Mat4::from_scale_rotation_translation(
                            node_tracks.scale.as_ref().and_then(|s| s.sample(t)).unwrap_or(Vec3::from_array(scale)),
                            node_tracks.rotation.as_ref().and_then(|r| r.sample(t)).unwrap_or(Quat::from_array(rotation)),
                            node_tracks
                                .translation
                                .as_ref()
                                .and_then(|tr| tr.sample(t))
                                .unwrap_or(Vec3::from_array(translation)),
                        );
                        let prefix = self.prefixes.get(&node).copied().unwrap_or(Mat4::IDENTITY);
                        frame.transforms.insert(self.joint_names[&node].clone(), prefix * local);
                    }
                    frame
                })
                .collect();
            clips.push(RawClip::new(name, keyframes));
            self.req.ctx.check_cancelled()?;
        }
        if skipped_morph {
            self.warn_once("morph target weight channel");
        }
        Ok(clips)
    }
}

#[derive(Default)]
struct NodeTracks {
    translation: Option<KeyframeTrack<Vec3>>,
    rotation: Option<KeyframeTrack<Quat>>,
    scale: Option<KeyframeTrack<Vec3>>,
}

impl NodeTracks {
    fn times(&self) -> impl Iterator<Item = &[f32]> {
        [
            self.translation.as_ref().map(|t| t.times.as_slice()),
            self.rotation.as_ref().map(|t| t.times.as_slice()),
            self.scale.as_ref().map(|t| t.times.as_slice()),
        ]
        .into_iter()
        .flatten()
    }

    /// Drops malformed channels; true if anything remains.
    fn prune(&mut self) -> bool {
        if self.translation.as_ref().is_some_and(|t| !t.is_well_formed()) {
            self.translation = None;
        }
        if self.rotation.as_ref().is_some_and(|t| !t.is_well_formed()) {
            self.rotation = None;
        }
        if self.scale.as_ref().is_some_and(|t| !t.is_well_formed()) {
            self.scale = None;
        }
        self.translation.is_some() || self.rotation.is_some() || self.scale.is_some()
    }
}

fn bake_transform(mesh: &mut MeshData, matrix: Mat4) {
    if matrix == Mat4::IDENTITY {
        return;
    }
    let normal_matrix = glam::Mat3::from_mat4(matrix).inverse().transpose();
    for p in &mut mesh.positions {
        *p = matrix.transform_point3(*p);
    }
    for n in &mut mesh.normals {
        *n = (normal_matrix * *n).normalize_or_zero();
    }
}

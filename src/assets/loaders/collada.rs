//! COLLADA 1.4 / 1.5 loader.
//!
//! Works on the generic [`DocumentNode`] tree. Supported: indexed triangle and
//! polylist geometry, common-profile materials, skin controllers, joint trees
//! from the visual scene, baked matrix animation channels and animation clips.
//! Anything else is warned about once per element name and skipped.

use std::f32::consts::FRAC_PI_2;
use std::str::FromStr;

use glam::{Mat3, Mat4, Vec2, Vec3, Vec4};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::animation::clip::{KeyFrameData, RawClip};
use crate::animation::skeleton::JointDefinition;
use crate::animation::tracks::{InterpolationMode, KeyframeTrack, merge_sample_times};
use crate::animation::transform::JointTransform;
use crate::assets::context::Section;
use crate::assets::loaders::ParseRequest;
use crate::assets::model::{
    MaterialData, MeshData, MeshSkin, ParsedAsset, TextureBinding, TextureSource,
};
use crate::document::{self, DocumentNode};
use crate::errors::{Error, Result};

const TIME_EPSILON: f32 = 1e-5;
/// Name of the joint inserted above several top-level joints.
pub const SYNTHETIC_ROOT: &str = "__root";

const KNOWN_LIBRARIES: &[&str] = &[
    "asset",
    "library_geometries",
    "library_controllers",
    "library_visual_scenes",
    "library_animations",
    "library_animation_clips",
    "library_materials",
    "library_effects",
    "library_images",
    "scene",
    "extra",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColladaParser;

impl ColladaParser {
    pub fn build(&self, bytes: &[u8], req: &ParseRequest<'_>) -> Result<ParsedAsset> {
        let root = document::parse(bytes)?;
        req.ctx.checkpoint(Section::Document)?;
        self.build_document(&root, req)
    }

    /// Extracts meshes, materials, joints and raw clips from a parsed tree.
    pub fn build_document(&self, root: &DocumentNode, req: &ParseRequest<'_>) -> Result<ParsedAsset> {
        if root.name != "COLLADA" {
            return Err(Error::malformed("COLLADA"));
        }
        ColladaBuilder::new(root, req).build()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpAxis {
    X,
    Y,
    Z,
}

impl UpAxis {
    fn from_document(root: &DocumentNode) -> Self {
        match root.descendant("asset/up_axis").and_then(DocumentNode::text) {
            Some("Z_UP") => UpAxis::Z,
            Some("X_UP") => UpAxis::X,
            _ => UpAxis::Y,
        }
    }

    /// Rotation taking this axis to +Y.
    fn correction(self) -> Mat4 {
        match self {
            UpAxis::Y => Mat4::IDENTITY,
            UpAxis::Z => Mat4::from_rotation_x(-FRAC_PI_2),
            UpAxis::X => Mat4::from_rotation_z(FRAC_PI_2),
        }
    }
}

// ============================================================================
// Low-level helpers
// ============================================================================

struct Source {
    floats: Vec<f32>,
    names: Vec<String>,
    stride: usize,
}

impl Source {
    fn vec3(&self, index: u32) -> Option<Vec3> {
        let base = index as usize * self.stride;
        let v = self.floats.get(base..base + 3)?;
        Some(Vec3::new(v[0], v[1], v[2]))
    }

    fn vec2(&self, index: u32) -> Option<Vec2> {
        let base = index as usize * self.stride;
        let v = self.floats.get(base..base + 2)?;
        Some(Vec2::new(v[0], v[1]))
    }
}

struct Input<'a> {
    semantic: &'a str,
    source: &'a str,
    offset: usize,
    set: Option<u32>,
}

fn local_ref(url: &str) -> &str {
    url.strip_prefix('#').unwrap_or(url)
}

fn parse_list<T: FromStr>(node: &DocumentNode, section: &str) -> Result<Vec<T>> {
    node.text()
        .unwrap_or_default()
        .split_ascii_whitespace()
        .map(|s| s.parse::<T>().map_err(|_| Error::malformed(section)))
        .collect()
}

/// COLLADA stores matrices row-major.
fn matrix_from_row_major(values: &[f32]) -> Option<Mat4> {
    let values: &[f32; 16] = values.get(..16)?.try_into().ok()?;
    Some(Mat4::from_cols_array(values).transpose())
}

fn read_sources(parent: &DocumentNode, section: &str) -> Result<FxHashMap<String, Source>> {
    let mut sources = FxHashMap::default();
    for source in parent.children_named("source") {
        let Some(id) = source.attribute("id") else {
            continue;
        };
        let floats = match source.child("float_array") {
            Some(array) => parse_list(array, section)?,
            None => Vec::new(),
        };
        let names = source
            .child("Name_array")
            .or_else(|| source.child("IDREF_array"))
            .and_then(DocumentNode::text)
            .map(|t| t.split_ascii_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        let stride = source
            .descendant("technique_common/accessor")
            .and_then(|a| a.attribute("stride"))
            .and_then(|s| s.parse().ok())
            .filter(|&s: &usize| s > 0)
            .unwrap_or(1);
        sources.insert(id.to_string(), Source { floats, names, stride });
    }
    Ok(sources)
}

fn read_inputs(parent: &DocumentNode) -> Vec<Input<'_>> {
    parent
        .children_named("input")
        .filter_map(|input| {
            Some(Input {
                semantic: input.attribute("semantic")?,
                source: local_ref(input.attribute("source")?),
                offset: input.attribute("offset").and_then(|o| o.parse().ok()).unwrap_or(0),
                set: input.attribute("set").and_then(|s| s.parse().ok()),
            })
        })
        .collect()
}

/// Local transform of a scene node: a `matrix`, or the product of its
/// transform elements in document order.
fn node_transform(node: &DocumentNode, section: &str) -> Result<Mat4> {
    let mut local = Mat4::IDENTITY;
    for element in &node.children {
        let values = || parse_list::<f32>(element, section);
        let step = match element.name.as_str() {
            "matrix" => matrix_from_row_major(&values()?).ok_or_else(|| Error::malformed(section))?,
            "translate" => match values()?.as_slice() {
                [x, y, z, ..] => Mat4::from_translation(Vec3::new(*x, *y, *z)),
                _ => return Err(Error::malformed(section)),
            },
            "scale" => match values()?.as_slice() {
                [x, y, z, ..] => Mat4::from_scale(Vec3::new(*x, *y, *z)),
                _ => return Err(Error::malformed(section)),
            },
            "rotate" => match values()?.as_slice() {
                [x, y, z, angle, ..] => {
                    let axis = Vec3::new(*x, *y, *z);
                    if axis.length_squared() > 0.0 {
                        Mat4::from_axis_angle(axis.normalize(), angle.to_radians())
                    } else {
                        Mat4::IDENTITY
                    }
                }
                _ => return Err(Error::malformed(section)),
            },
            _ => continue,
        };
        local *= step;
    }
    Ok(local)
}

// ============================================================================
// Intermediate structures
// ============================================================================

struct SceneNode {
    id: Option<String>,
    joint_name: String,
    local: Mat4,
    is_joint: bool,
    children: Vec<usize>,
}

#[derive(Default)]
struct VisualScene {
    nodes: Vec<SceneNode>,
    top_level: Vec<usize>,
    /// Global transform of the first node instancing each geometry.
    placements: FxHashMap<String, Mat4>,
    /// `instance_material` symbol → material id.
    material_bindings: FxHashMap<String, String>,
}

impl VisualScene {
    fn joint_by_node_id(&self, node_id: &str) -> Option<Option<&str>> {
        self.nodes
            .iter()
            .find(|n| n.id.as_deref() == Some(node_id))
            .map(|n| n.is_joint.then_some(n.joint_name.as_str()))
    }
}

struct SkinController {
    geometry: String,
    bind_shape: Mat4,
    bone_names: Vec<String>,
    inverse_binds: Vec<Mat4>,
    /// Per source position: `(bone index, weight)`, strongest first, normalised.
    influences: Vec<Vec<(u16, f32)>>,
}

struct GeometryMesh {
    mesh: MeshData,
    /// Source position index of every output vertex.
    position_indices: Vec<u32>,
}

struct ChannelTrack {
    joint: String,
    /// Ids of every `animation` element enclosing the channel.
    owners: Vec<String>,
    times: Vec<f32>,
    matrices: Vec<Mat4>,
    components: KeyframeTrack<JointTransform>,
}

impl ChannelTrack {
    fn matrix_at(&self, time: f32) -> Mat4 {
        if let Some(i) = self.times.iter().position(|t| (t - time).abs() <= TIME_EPSILON) {
            return self.matrices[i];
        }
        self.components
            .sample(time)
            .map_or(Mat4::IDENTITY, |c| c.to_matrix())
    }
}

#[derive(Default)]
struct JointLayout {
    definitions: Vec<JointDefinition>,
    /// Transform applied in front of a joint's animated local matrices.
    prefixes: FxHashMap<String, Mat4>,
}

// ============================================================================
// Builder
// ============================================================================

struct ColladaBuilder<'a> {
    root: &'a DocumentNode,
    req: &'a ParseRequest<'a>,
    correction: Mat4,
    warned: FxHashSet<String>,
}

impl<'a> ColladaBuilder<'a> {
    fn new(root: &'a DocumentNode, req: &'a ParseRequest<'a>) -> Self {
        let correction = if req.settings.apply_up_axis {
            UpAxis::from_document(root).correction()
        } else {
            Mat4::IDENTITY
        };
        Self {
            root,
            req,
            correction,
            warned: FxHashSet::default(),
        }
    }

    fn warn_skip(&mut self, element: &str, context: &str) {
        if self.warned.insert(element.to_string()) {
            log::warn!("{}: skipping unsupported element `{element}` in {context}", self.req.uri);
        }
    }

    fn library(&self, name: &str) -> Option<&'a DocumentNode> {
        self.root.child(name)
    }

    fn build(mut self) -> Result<ParsedAsset> {
        let unknown: Vec<String> = self
            .root
            .children
            .iter()
            .filter(|c| !KNOWN_LIBRARIES.contains(&c.name.as_str()))
            .map(|c| c.name.clone())
            .collect();
        for name in unknown {
            self.warn_skip(&name, "COLLADA");
        }

        let (materials, material_index) = self.load_materials()?;
        self.req.ctx.checkpoint(Section::Materials)?;

        let controllers = self.load_controllers()?;
        let bone_set: FxHashSet<&str> = controllers
            .iter()
            .flat_map(|c| c.bone_names.iter().map(String::as_str))
            .collect();
        let scene = self.load_visual_scene(&bone_set)?;

        let mut geometries = self.load_geometries(&scene, &material_index)?;
        self.req.ctx.checkpoint(Section::Geometry)?;

        let layout = if controllers.is_empty() {
            JointLayout::default()
        } else {
            self.layout_joints(&scene)
        };
        let mut meshes = Vec::new();
        for (geometry_id, parts) in &mut geometries {
            let controller = controllers.iter().find(|c| &c.geometry == geometry_id);
            for part in parts.drain(..) {
                meshes.push(self.finish_mesh(part, controller, &scene, geometry_id)?);
            }
        }
        self.req.ctx.checkpoint(Section::Skeleton)?;

        let clips = if layout.definitions.is_empty() {
            Vec::new()
        } else {
            self.load_animations(&scene, &layout)?
        };
        self.req.ctx.checkpoint(Section::Animation)?;

        Ok(ParsedAsset {
            meshes,
            materials,
            joints: layout.definitions,
            clips,
        })
    }

    // ------------------------------------------------------------------------
    // Materials
    // ------------------------------------------------------------------------

    fn load_materials(&mut self) -> Result<(Vec<MaterialData>, FxHashMap<String, usize>)> {
        let mut images: FxHashMap<&str, &str> = FxHashMap::default();
        if let Some(library) = self.library("library_images") {
            for image in library.children_named("image") {
                let path = image
                    .child("init_from")
                    .and_then(|i| i.text().or_else(|| i.child("ref").and_then(DocumentNode::text)));
                if let (Some(id), Some(path)) = (image.attribute("id"), path) {
                    images.insert(id, path);
                }
            }
        }

        let mut effects: FxHashMap<&str, (Vec4, Option<String>)> = FxHashMap::default();
        if let Some(library) = self.library("library_effects") {
            for effect in library.children_named("effect") {
                let Some(id) = effect.attribute("id") else { continue };
                let Some(profile) = effect.child("profile_COMMON") else {
                    if let Some(other) = effect.children.iter().find(|c| c.name.starts_with("profile_")) {
                        let name = other.name.clone();
                        self.warn_skip(&name, "library_effects");
                    }
                    continue;
                };
                effects.insert(id, Self::read_effect(profile, &images));
            }
        }

        let mut materials = Vec::new();
        let mut index = FxHashMap::default();
        if let Some(library) = self.library("library_materials") {
            for material in library.children_named("material") {
                let Some(id) = material.attribute("id") else { continue };
                let mut data = MaterialData::new(material.attribute("name").unwrap_or(id));
                let effect = material
                    .child("instance_effect")
                    .and_then(|e| e.attribute("url"))
                    .and_then(|url| effects.get(local_ref(url)));
                if let Some((color, texture)) = effect {
                    data.diffuse_color = *color;
                    data.texture = texture
                        .as_ref()
                        .map(|uri| TextureBinding::new(TextureSource::Uri(uri.clone())));
                }
                index.insert(id.to_string(), materials.len());
                materials.push(data);
            }
        }
        Ok((materials, index))
    }

    /// Diffuse colour and texture image path of a common-profile effect.
    fn read_effect(profile: &DocumentNode, images: &FxHashMap<&str, &str>) -> (Vec4, Option<String>) {
        let newparams: FxHashMap<&str, &DocumentNode> = profile
            .children_named("newparam")
            .chain(profile.child("technique").into_iter().flat_map(|t| t.children_named("newparam")))
            .filter_map(|p| Some((p.attribute("sid")?, p)))
            .collect();

        let shading = profile.child("technique").and_then(|t| {
            t.children
                .iter()
                .find(|c| matches!(c.name.as_str(), "phong" | "lambert" | "blinn" | "constant"))
        });
        let Some(diffuse) = shading.and_then(|s| s.child("diffuse").or_else(|| s.child("emission"))) else {
            return (Vec4::ONE, None);
        };

        let color = diffuse
            .child("color")
            .and_then(|c| parse_list::<f32>(c, "library_effects").ok())
            .and_then(|v| match v.as_slice() {
                [r, g, b, a, ..] => Some(Vec4::new(*r, *g, *b, *a)),
                [r, g, b] => Some(Vec4::new(*r, *g, *b, 1.0)),
                _ => None,
            })
            .unwrap_or(Vec4::ONE);

        let texture = diffuse.child("texture").and_then(|t| t.attribute("texture")).and_then(|sampler| {
            if let Some(path) = images.get(sampler) {
                return Some((*path).to_string());
            }
            let sampler2d = newparams.get(sampler)?.child("sampler2D")?;
            let image_id = match sampler2d.child("instance_image").and_then(|i| i.attribute("url")) {
                Some(url) => local_ref(url),
                None => {
                    let surface = sampler2d.child("source")?.text()?;
                    newparams.get(surface)?.descendant("surface/init_from")?.text()?
                }
            };
            images.get(image_id).map(|p| (*p).to_string())
        });

        (color, texture)
    }

    // ------------------------------------------------------------------------
    // Controllers
    // ------------------------------------------------------------------------

    fn load_controllers(&mut self) -> Result<Vec<SkinController>> {
        let Some(library) = self.library("library_controllers") else {
            return Ok(Vec::new());
        };

        let mut controllers = Vec::new();
        for controller in library.children_named("controller") {
            let Some(skin) = controller.child("skin") else {
                if let Some(other) = controller.children.first() {
                    let name = other.name.clone();
                    self.warn_skip(&name, "library_controllers");
                }
                continue;
            };
            let section = format!(
                "controller `{}`",
                controller.attribute("id").unwrap_or_default()
            );
            controllers.push(self.read_skin(skin, &section)?);
        }
        Ok(controllers)
    }

    fn read_skin(&self, skin: &DocumentNode, section: &str) -> Result<SkinController> {
        let geometry = skin
            .attribute("source")
            .map(|s| local_ref(s).to_string())
            .ok_or_else(|| Error::malformed(section))?;
        let bind_shape = match skin.child("bind_shape_matrix") {
            Some(m) => matrix_from_row_major(&parse_list::<f32>(m, section)?)
                .ok_or_else(|| Error::malformed(section))?,
            None => Mat4::IDENTITY,
        };

        let sources = read_sources(skin, section)?;
        let joints = skin.child("joints").ok_or_else(|| Error::malformed(section))?;
        let joint_inputs = read_inputs(joints);
        let source_of = |semantic: &str| {
            joint_inputs
                .iter()
                .find(|i| i.semantic == semantic)
                .and_then(|i| sources.get(i.source))
        };

        let bone_names = source_of("JOINT")
            .map(|s| s.names.clone())
            .ok_or_else(|| Error::malformed(section))?;
        let inverse_binds: Vec<Mat4> = source_of("INV_BIND_MATRIX")
            .map(|s| {
                s.floats
                    .chunks_exact(16)
                    .filter_map(matrix_from_row_major)
                    .collect()
            })
            .unwrap_or_default();

        let weights = skin.child("vertex_weights").ok_or_else(|| Error::malformed(section))?;
        let inputs = read_inputs(weights);
        let stride = inputs.iter().map(|i| i.offset + 1).max().unwrap_or(1);
        let joint_offset = inputs.iter().find(|i| i.semantic == "JOINT").map(|i| i.offset);
        let weight_input = inputs.iter().find(|i| i.semantic == "WEIGHT");
        let (Some(joint_offset), Some(weight_input)) = (joint_offset, weight_input) else {
            return Err(Error::malformed(section));
        };
        let weight_values = &sources
            .get(weight_input.source)
            .ok_or_else(|| Error::malformed(section))?
            .floats;

        let vcount: Vec<usize> = match weights.child("vcount") {
            Some(node) => parse_list(node, section)?,
            None => Vec::new(),
        };
        let v: Vec<i64> = match weights.child("v") {
            Some(node) => parse_list(node, section)?,
            None => Vec::new(),
        };

        // Counts come straight from the file; check them against `<v>` before allocating.
        let entries = vcount
            .iter()
            .try_fold(0_usize, |sum, &count| sum.checked_add(count))
            .and_then(|total| total.checked_mul(stride))
            .ok_or_else(|| Error::malformed(section))?;
        if entries > v.len() {
            return Err(Error::malformed(section));
        }

        let max_influences = self.req.settings.max_influences.clamp(1, 4);
        let mut influences = Vec::with_capacity(vcount.len());
        let mut cursor = 0;
        for &count in &vcount {
            let mut list: Vec<(u16, f32)> = Vec::with_capacity(count);
            for _ in 0..count {
                let entry = v.get(cursor..cursor + stride).ok_or_else(|| Error::malformed(section))?;
                cursor += stride;
                let joint = entry[joint_offset];
                // -1 binds to the bind shape itself
                if joint < 0 {
                    continue;
                }
                let joint = usize::try_from(joint).map_err(|_| Error::malformed(section))?;
                if joint >= bone_names.len() {
                    return Err(Error::malformed(section));
                }
                let weight = usize::try_from(entry[weight_input.offset])
                    .ok()
                    .and_then(|i| weight_values.get(i))
                    .copied()
                    .ok_or_else(|| Error::malformed(section))?;
                list.push((joint as u16, weight));
            }
            list.sort_by(|a, b| b.1.total_cmp(&a.1));
            list.truncate(max_influences);
            let total: f32 = list.iter().map(|(_, w)| w).sum();
            if total > 0.0 {
                for (_, w) in &mut list {
                    *w /= total;
                }
            }
            influences.push(list);
        }

        Ok(SkinController {
            geometry,
            bind_shape,
            bone_names,
            inverse_binds,
            influences,
        })
    }

    // ------------------------------------------------------------------------
    // Visual scene
    // ------------------------------------------------------------------------

    fn load_visual_scene(&mut self, bone_set: &FxHashSet<&str>) -> Result<VisualScene> {
        let mut scene = VisualScene::default();
        let Some(library) = self.library("library_visual_scenes") else {
            return Ok(scene);
        };
        let instanced = self
            .root
            .descendant("scene/instance_visual_scene")
            .and_then(|i| i.attribute("url"))
            .map(local_ref);
        let visual = instanced
            .and_then(|id| library.child_with_attribute("visual_scene", "id", id))
            .or_else(|| library.child("visual_scene"));
        let Some(visual) = visual else {
            return Ok(scene);
        };

        for node in visual.children_named("node") {
            let index = self.read_scene_node(node, Mat4::IDENTITY, bone_set, &mut scene)?;
            scene.top_level.push(index);
        }
        Ok(scene)
    }

    fn read_scene_node(
        &mut self,
        node: &DocumentNode,
        parent_global: Mat4,
        bone_set: &FxHashSet<&str>,
        scene: &mut VisualScene,
    ) -> Result<usize> {
        let id = node.attribute("id");
        let joint_name = node
            .attribute("sid")
            .or(id)
            .or_else(|| node.attribute("name"))
            .unwrap_or_default()
            .to_string();
        let is_joint = node.attribute("type") == Some("JOINT")
            || [node.attribute("sid"), id, node.attribute("name")]
                .into_iter()
                .flatten()
                .any(|n| bone_set.contains(n));
        let section = format!("node `{joint_name}`");
        let local = node_transform(node, &section)?;
        let global = parent_global * local;

        for child in &node.children {
            match child.name.as_str() {
                "instance_geometry" | "instance_controller" => {
                    if child.name == "instance_geometry"
                        && let Some(url) = child.attribute("url")
                    {
                        scene.placements.entry(local_ref(url).to_string()).or_insert(global);
                    }
                    let bindings = child
                        .descendant("bind_material/technique_common")
                        .into_iter()
                        .flat_map(|t| t.children_named("instance_material"));
                    for binding in bindings {
                        if let (Some(symbol), Some(target)) = (binding.attribute("symbol"), binding.attribute("target")) {
                            scene
                                .material_bindings
                                .insert(symbol.to_string(), local_ref(target).to_string());
                        }
                    }
                }
                "instance_camera" | "instance_light" | "instance_node" => {
                    let name = child.name.clone();
                    self.warn_skip(&name, "visual_scene");
                }
                _ => {}
            }
        }

        let index = scene.nodes.len();
        scene.nodes.push(SceneNode {
            id: id.map(str::to_string),
            joint_name,
            local,
            is_joint,
            children: Vec::new(),
        });
        for child in node.children_named("node") {
            let child_index = self.read_scene_node(child, global, bone_set, scene)?;
            scene.nodes[index].children.push(child_index);
        }
        Ok(index)
    }

    /// Turns joint nodes into definitions. Transforms of non-joint nodes
    /// between joints are folded into the joint below them.
    fn layout_joints(&self, scene: &VisualScene) -> JointLayout {
        let mut layout = JointLayout::default();
        let mut roots = Vec::new();
        for &top in &scene.top_level {
            Self::walk_joints(scene, top, None, Mat4::IDENTITY, &mut layout, &mut roots);
        }

        if roots.len() == 1 {
            let root = &mut layout.definitions[roots[0]];
            root.bind_local = self.correction * root.bind_local;
            let prefix = layout.prefixes.entry(root.name.clone()).or_insert(Mat4::IDENTITY);
            *prefix = self.correction * *prefix;
        } else if roots.len() > 1 {
            let children: Vec<String> = roots.iter().map(|&r| layout.definitions[r].name.clone()).collect();
            layout
                .definitions
                .push(JointDefinition::new(SYNTHETIC_ROOT, self.correction).with_children(children));
        }
        layout
    }

    fn walk_joints(
        scene: &VisualScene,
        index: usize,
        parent_joint: Option<usize>,
        inherited: Mat4,
        layout: &mut JointLayout,
        roots: &mut Vec<usize>,
    ) {
        let node = &scene.nodes[index];
        if node.is_joint {
            let def = layout.definitions.len();
            layout
                .definitions
                .push(JointDefinition::new(node.joint_name.clone(), inherited * node.local));
            if inherited != Mat4::IDENTITY {
                layout.prefixes.insert(node.joint_name.clone(), inherited);
            }
            match parent_joint {
                Some(p) => layout.definitions[p].children.push(node.joint_name.clone()),
                None => roots.push(def),
            }
            for &child in &node.children {
                Self::walk_joints(scene, child, Some(def), Mat4::IDENTITY, layout, roots);
            }
        } else {
            let carried = inherited * node.local;
            for &child in &node.children {
                Self::walk_joints(scene, child, parent_joint, carried, layout, roots);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Geometry
    // ------------------------------------------------------------------------

    fn load_geometries(
        &mut self,
        scene: &VisualScene,
        material_index: &FxHashMap<String, usize>,
    ) -> Result<Vec<(String, Vec<GeometryMesh>)>> {
        let library = self.root.require_child("library_geometries")?;
        let mut geometries = Vec::new();

        for geometry in library.children_named("geometry") {
            let id = geometry.attribute("id").unwrap_or_default();
            let name = geometry.attribute("name").unwrap_or(id);
            let Some(mesh) = geometry.child("mesh") else {
                if let Some(other) = geometry.children.iter().find(|c| c.name != "extra" && c.name != "asset") {
                    let kind = other.name.clone();
                    self.warn_skip(&kind, "library_geometries");
                }
                continue;
            };
            let section = format!("geometry `{id}`");
            let sources = read_sources(mesh, &section)?;
            let vertices = mesh.child("vertices");
            let vertex_inputs: Vec<Input<'_>> = vertices.map(read_inputs).unwrap_or_default();

            let primitives: Vec<&DocumentNode> = mesh
                .children
                .iter()
                .filter(|c| !matches!(c.name.as_str(), "source" | "vertices" | "extra"))
                .collect();
            let mut parts = Vec::new();
            for primitive in &primitives {
                if !matches!(primitive.name.as_str(), "triangles" | "polylist") {
                    let kind = primitive.name.clone();
                    self.warn_skip(&kind, "mesh");
                    continue;
                }
                let mut part = Self::read_primitive(primitive, &sources, &vertex_inputs, &section)?;
                if part.mesh.positions.is_empty() {
                    continue;
                }
                part.mesh.name = name.to_string();
                part.mesh.material = primitive.attribute("material").and_then(|symbol| {
                    let target = scene.material_bindings.get(symbol).map_or(symbol, String::as_str);
                    material_index.get(target).copied()
                });
                parts.push(part);
            }
            if parts.len() > 1 {
                for (i, part) in parts.iter_mut().enumerate() {
                    part.mesh.name = format!("{name}_{i}");
                }
            }
            geometries.push((id.to_string(), parts));
        }
        Ok(geometries)
    }

    fn read_primitive(
        primitive: &DocumentNode,
        sources: &FxHashMap<String, Source>,
        vertex_inputs: &[Input<'_>],
        section: &str,
    ) -> Result<GeometryMesh> {
        let inputs = read_inputs(primitive);
        let stride = inputs.iter().map(|i| i.offset + 1).max().unwrap_or(1);
        let malformed = || Error::malformed(section);

        let vertex = inputs.iter().find(|i| i.semantic == "VERTEX").ok_or_else(malformed)?;
        let from_vertices = |semantic: &str| {
            vertex_inputs
                .iter()
                .find(|i| i.semantic == semantic)
                .and_then(|i| sources.get(i.source))
        };
        let positions = from_vertices("POSITION").ok_or_else(malformed)?;

        // Attributes either have their own index, or share the vertex index.
        let normal = inputs.iter().find(|i| i.semantic == "NORMAL");
        let normal_source = match normal {
            Some(input) => Some((sources.get(input.source).ok_or_else(malformed)?, input.offset)),
            None => from_vertices("NORMAL").map(|s| (s, vertex.offset)),
        };
        let texcoord = inputs
            .iter()
            .find(|i| i.semantic == "TEXCOORD" && i.set.unwrap_or(0) == 0)
            .or_else(|| inputs.iter().find(|i| i.semantic == "TEXCOORD"));
        let texcoord_source = match texcoord {
            Some(input) => Some((sources.get(input.source).ok_or_else(malformed)?, input.offset)),
            None => from_vertices("TEXCOORD").map(|s| (s, vertex.offset)),
        };

        let indices: Vec<u32> = match primitive.child("p") {
            Some(p) => parse_list(p, section)?,
            None => Vec::new(),
        };

        // Corner order after fan triangulation.
        let mut corners: Vec<usize> = Vec::with_capacity(indices.len() / stride);
        if primitive.name == "polylist" {
            let vcount: Vec<usize> = match primitive.child("vcount") {
                Some(node) => parse_list(node, section)?,
                None => Vec::new(),
            };
            let mut first = 0;
            for count in vcount {
                for i in 1..count.saturating_sub(1) {
                    corners.extend([first, first + i, first + i + 1]);
                }
                first += count;
            }
        } else {
            corners.extend(0..indices.len() / stride / 3 * 3);
        }

        let mut part = GeometryMesh {
            mesh: MeshData::default(),
            position_indices: Vec::new(),
        };
        let mut dedup: FxHashMap<(u32, Option<u32>, Option<u32>), u32> = FxHashMap::default();
        for corner in corners {
            let entry = indices.get(corner * stride..(corner + 1) * stride).ok_or_else(malformed)?;
            let p = entry[vertex.offset];
            let n = normal_source.map(|(_, offset)| entry[offset]);
            let t = texcoord_source.map(|(_, offset)| entry[offset]);

            let next = part.position_indices.len() as u32;
            let index = *dedup.entry((p, n, t)).or_insert(next);
            if index == next {
                part.mesh.positions.push(positions.vec3(p).ok_or_else(malformed)?);
                if let (Some((source, _)), Some(n)) = (normal_source, n) {
                    part.mesh.normals.push(source.vec3(n).ok_or_else(malformed)?);
                }
                if let (Some((source, _)), Some(t)) = (texcoord_source, t) {
                    let uv = source.vec2(t).ok_or_else(malformed)?;
                    part.mesh.tex_coords.push(Vec2::new(uv.x, 1.0 - uv.y));
                }
                part.position_indices.push(p);
            }
            part.mesh.indices.push(index);
        }
        Ok(part)
    }

    /// Applies skinning data or the static placement to one primitive.
    fn finish_mesh(
        &self,
        part: GeometryMesh,
        controller: Option<&SkinController>,
        scene: &VisualScene,
        geometry_id: &str,
    ) -> Result<MeshData> {
        let GeometryMesh {
            mut mesh,
            position_indices,
        } = part;

        let Some(controller) = controller else {
            let placement = scene.placements.get(geometry_id).copied().unwrap_or(Mat4::IDENTITY);
            transform_geometry(&mut mesh, self.correction * placement);
            return Ok(mesh);
        };

        transform_geometry(&mut mesh, controller.bind_shape);
        let mut joints = Vec::with_capacity(position_indices.len());
        let mut weights = Vec::with_capacity(position_indices.len());
        for &p in &position_indices {
            let mut j = [0u16; 4];
            let mut w = [0f32; 4];
            if let Some(list) = controller.influences.get(p as usize) {
                for (slot, (joint, weight)) in list.iter().enumerate().take(4) {
                    j[slot] = *joint;
                    w[slot] = *weight;
                }
            }
            joints.push(j);
            weights.push(w);
        }

        let bone_names = controller
            .bone_names
            .iter()
            .map(|bone| match scene.nodes.iter().find(|n| n.is_joint && &n.joint_name == bone) {
                Some(_) => bone.clone(),
                // IDREF_array entries name nodes by id
                None => match scene.joint_by_node_id(bone) {
                    Some(Some(joint)) => joint.to_string(),
                    _ => bone.clone(),
                },
            })
            .collect();

        mesh.skin = Some(MeshSkin {
            bone_names,
            inverse_bind_matrices: controller.inverse_binds.clone(),
            joints,
            weights,
            ..MeshSkin::default()
        });
        Ok(mesh)
    }

    // ------------------------------------------------------------------------
    // Animations
    // ------------------------------------------------------------------------

    fn load_animations(&mut self, scene: &VisualScene, layout: &JointLayout) -> Result<Vec<RawClip>> {
        let Some(library) = self.library("library_animations") else {
            return Ok(Vec::new());
        };

        let mut tracks = Vec::new();
        for animation in library.children_named("animation") {
            self.read_animation(animation, &mut Vec::new(), scene, layout, &mut tracks)?;
        }
        if tracks.is_empty() {
            return Ok(Vec::new());
        }

        let Some(clips) = self.library("library_animation_clips") else {
            let all: Vec<&ChannelTrack> = tracks.iter().collect();
            return Ok(vec![RawClip::new("default", merge_tracks(&all, 0.0, None))]);
        };

        let mut raw_clips = Vec::new();
        for clip in clips.children_named("animation_clip") {
            let name = clip.attribute("name").or_else(|| clip.attribute("id")).unwrap_or("clip");
            let start: f32 = clip.attribute("start").and_then(|s| s.parse().ok()).unwrap_or(0.0);
            let end: Option<f32> = clip.attribute("end").and_then(|s| s.parse().ok());
            let referenced: FxHashSet<&str> = clip
                .children_named("instance_animation")
                .filter_map(|i| i.attribute("url"))
                .map(local_ref)
                .collect();
            let selected: Vec<&ChannelTrack> = tracks
                .iter()
                .filter(|t| t.owners.iter().any(|o| referenced.contains(o.as_str())))
                .collect();
            if selected.is_empty() {
                log::warn!("{}: animation clip `{name}` has no usable channels, skipping", self.req.uri);
                continue;
            }
            let mut raw = RawClip::new(name, merge_tracks(&selected, start, end));
            if let Some(end) = end {
                raw = raw.with_length(end - start);
            }
            raw_clips.push(raw);
        }
        Ok(raw_clips)
    }

    fn read_animation(
        &mut self,
        animation: &DocumentNode,
        owners: &mut Vec<String>,
        scene: &VisualScene,
        layout: &JointLayout,
        out: &mut Vec<ChannelTrack>,
    ) -> Result<()> {
        let pushed = animation.attribute("id").map(|id| owners.push(id.to_string())).is_some();
        let section = format!("animation `{}`", animation.attribute("id").unwrap_or_default());

        let sources = read_sources(animation, &section)?;
        let samplers: FxHashMap<&str, Vec<Input<'_>>> = animation
            .children_named("sampler")
            .filter_map(|s| Some((s.attribute("id")?, read_inputs(s))))
            .collect();

        for channel in animation.children_named("channel") {
            let (Some(source), Some(target)) = (channel.attribute("source"), channel.attribute("target")) else {
                continue;
            };
            let Some((node_id, path)) = target.split_once('/') else {
                continue;
            };
            if path.contains(['.', '(']) {
                self.warn_skip("component animation channel", "library_animations");
                continue;
            }
            let Some(inputs) = samplers.get(local_ref(source)) else {
                return Err(Error::malformed(section));
            };
            let find = |semantic: &str| {
                inputs
                    .iter()
                    .find(|i| i.semantic == semantic)
                    .and_then(|i| sources.get(i.source))
            };
            let (Some(input), Some(output)) = (find("INPUT"), find("OUTPUT")) else {
                return Err(Error::malformed(section));
            };
            if output.floats.len() != input.floats.len() * 16 {
                self.warn_skip("non-matrix animation output", "library_animations");
                continue;
            }

            let joint = match scene.joint_by_node_id(node_id) {
                Some(Some(joint)) => joint.to_string(),
                // Animated node outside the skeleton.
                Some(None) => {
                    log::debug!("{}: ignoring animation of non-joint node `{node_id}`", self.req.uri);
                    continue;
                }
                None => node_id.to_string(),
            };
            let prefix = layout.prefixes.get(&joint).copied().unwrap_or(Mat4::IDENTITY);
            let matrices: Vec<Mat4> = output
                .floats
                .chunks_exact(16)
                .filter_map(matrix_from_row_major)
                .map(|m| prefix * m)
                .collect();
            let components = KeyframeTrack::new(
                input.floats.clone(),
                matrices.iter().map(JointTransform::from_matrix).collect(),
                InterpolationMode::Linear,
            );
            out.push(ChannelTrack {
                joint,
                owners: owners.clone(),
                times: input.floats.clone(),
                matrices,
                components,
            });
        }

        for nested in animation.children_named("animation") {
            self.read_animation(nested, owners, scene, layout, out)?;
        }
        if pushed {
            owners.pop();
        }
        Ok(())
    }
}

/// Merges per-joint channels into whole-skeleton keyframes on the union of
/// their sample times, rebased so `start` becomes zero.
fn merge_tracks(tracks: &[&ChannelTrack], start: f32, end: Option<f32>) -> Vec<KeyFrameData> {
    let mut times: Vec<f32> = merge_sample_times(tracks.iter().map(|t| t.times.as_slice()), TIME_EPSILON)
        .into_iter()
        .filter(|&t| t >= start - TIME_EPSILON && end.is_none_or(|e| t <= e + TIME_EPSILON))
        .collect();
    if end.is_some() {
        let bounds = [start, end.unwrap_or(start)];
        times = merge_sample_times([times.as_slice(), bounds.as_slice()], TIME_EPSILON);
    }

    times
        .into_iter()
        .map(|t| {
            let mut frame = KeyFrameData::new((t - start).max(0.0));
            for track in tracks {
                frame.transforms.insert(track.joint.clone(), track.matrix_at(t));
            }
            frame
        })
        .collect()
}

fn transform_geometry(mesh: &mut MeshData, matrix: Mat4) {
    if matrix == Mat4::IDENTITY {
        return;
    }
    let normal_matrix = Mat3::from_mat4(matrix).inverse().transpose();
    for p in &mut mesh.positions {
        *p = matrix.transform_point3(*p);
    }
    for n in &mut mesh.normals {
        *n = (normal_matrix * *n).normalize_or_zero();
    }
}

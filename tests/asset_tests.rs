//! Asset Storage and Resolver Tests
//!
//! Tests for:
//! - AssetStorage: add, get, add_with_uuid deduplication, remove
//! - UUID lookup: get_by_uuid
//! - Thread safety: concurrent reads via RwLock
//! - AssetResolver: scheme dispatch, data URIs, unknown schemes
//! - Texture pass: relative URIs, embedded bytes, undecodable data
//! - ModelData bounds and fit transform

use std::io::Read;
use std::sync::Arc;

use glam::{Mat4, Vec3};
use slotmap::new_key_type;
use uuid::Uuid;

use armature::assets::io::{decode_data_uri, resolve_relative};
use armature::assets::loaders::populate_textures;
use armature::assets::{
    AssetResolver, AssetStorage, MaterialData, MemoryStreamHandler, MeshData, ModelData, ModelStorage, TextureBinding,
    TextureSource,
};
use armature::errors::ErrorKind;

new_key_type! { struct TestHandle; }

const EPSILON: f32 = 1e-5;

fn approx(a: Vec3, b: Vec3) -> bool {
    (a - b).length() < EPSILON
}

// ============================================================================
// AssetStorage Basic CRUD
// ============================================================================

#[test]
fn storage_add_and_get() {
    let storage = AssetStorage::<TestHandle, String>::new();
    let handle = storage.add("hello".to_string());
    let value = storage.get(handle).unwrap();
    assert_eq!(&**value, "hello");
}

#[test]
fn storage_get_foreign_handle_returns_none() {
    let storage = AssetStorage::<TestHandle, String>::new();
    let handle = storage.add("test".to_string());
    let other = AssetStorage::<TestHandle, String>::new();
    assert!(other.get(handle).is_none());
}

#[test]
fn storage_multiple_assets() {
    let storage = AssetStorage::<TestHandle, i32>::new();
    let h1 = storage.add(10);
    let h2 = storage.add(20);
    let h3 = storage.add(30);

    assert_eq!(*storage.get(h1).unwrap(), 10);
    assert_eq!(*storage.get(h2).unwrap(), 20);
    assert_eq!(*storage.get(h3).unwrap(), 30);
    assert_eq!(storage.len(), 3);
}

#[test]
fn storage_remove_keeps_outstanding_arcs_alive() {
    let storage = AssetStorage::<TestHandle, String>::new();
    let uuid = Uuid::new_v4();
    let handle = storage.add_with_uuid(uuid, "walk".to_string());
    let held = storage.get(handle).unwrap();

    let removed = storage.remove(handle).unwrap();
    assert!(Arc::ptr_eq(&removed, &held));
    assert!(storage.get(handle).is_none());
    assert!(storage.get_by_uuid(&uuid).is_none());
    assert!(storage.is_empty());
    assert_eq!(&*held, "walk");
}

// ============================================================================
// UUID Lookup
// ============================================================================

#[test]
fn add_with_uuid_deduplicates() {
    let storage = AssetStorage::<TestHandle, String>::new();
    let uuid = Uuid::new_v4();
    let first = storage.add_with_uuid(uuid, "first".to_string());
    let second = storage.add_with_uuid(uuid, "second".to_string());

    assert_eq!(first, second);
    assert_eq!(storage.len(), 1);
    assert_eq!(&**storage.get_by_uuid(&uuid).unwrap(), "first");
}

#[test]
fn get_by_unknown_uuid_returns_none() {
    let storage = AssetStorage::<TestHandle, String>::new();
    storage.add_with_uuid(Uuid::new_v4(), "x".to_string());
    assert!(storage.get_by_uuid(&Uuid::new_v4()).is_none());
}

#[test]
fn model_storage_keys_by_model_id() {
    let storage = ModelStorage::new();
    let model = ModelData::default();
    let id = model.id;
    let handle = storage.insert_model(model);
    assert_eq!(storage.get_by_uuid(&id).unwrap().id, id);
    assert!(storage.get(handle).is_some());
}

// ============================================================================
// Thread Safety
// ============================================================================

#[test]
fn concurrent_reads() {
    let storage = Arc::new(AssetStorage::<TestHandle, u64>::new());
    let handles: Vec<TestHandle> = (0u64..64).map(|i| storage.add(i)).collect();
    let handles = Arc::new(handles);

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let storage = Arc::clone(&storage);
            let handles = Arc::clone(&handles);
            std::thread::spawn(move || handles.iter().map(|h| *storage.get(*h).unwrap()).sum::<u64>())
        })
        .collect();

    for reader in readers {
        assert_eq!(reader.join().unwrap(), (0..64).sum::<u64>());
    }
}

// ============================================================================
// AssetResolver
// ============================================================================

#[test]
fn resolver_dispatches_by_scheme() {
    let memory = MemoryStreamHandler::new().with_entry("models/a.bin", vec![1_u8, 2, 3]);
    let resolver = AssetResolver::new().with_handler("mem", memory);

    assert_eq!(resolver.read_bytes("mem://models/a.bin").unwrap(), [1, 2, 3]);
    // Scheme names are case-insensitive.
    assert_eq!(resolver.read_bytes("MEM://models/a.bin").unwrap(), [1, 2, 3]);
}

#[test]
fn resolver_reports_stream_length() {
    let memory = MemoryStreamHandler::new().with_entry("a", vec![0_u8; 10]);
    let resolver = AssetResolver::new().with_handler("mem", memory);
    let mut stream = resolver.open("mem://a").unwrap();
    assert_eq!(stream.len(), Some(10));

    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes).unwrap();
    assert_eq!(bytes.len(), 10);
}

#[test]
fn resolver_decodes_data_uris() {
    let resolver = AssetResolver::new();
    assert_eq!(resolver.read_bytes("data:application/octet-stream;base64,AAEC").unwrap(), [0, 1, 2]);
    assert_eq!(resolver.read_bytes("data:,plain").unwrap(), b"plain");
    assert!(decode_data_uri("data:;base64").is_err());
}

#[test]
fn unknown_scheme_is_a_retryable_stream_error() {
    let resolver = AssetResolver::new();
    let err = resolver.open("ftp://host/model.dae").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Stream);
    assert!(err.is_retryable());
    assert!(err.to_string().contains("ftp://host/model.dae"));
}

#[test]
fn memory_entries_can_be_replaced_and_removed() {
    let memory = MemoryStreamHandler::new();
    memory.insert("a", vec![1_u8]);
    memory.insert("a", vec![2_u8]);
    assert_eq!(memory.remove("a").as_deref(), Some(&[2_u8][..]));
    assert!(memory.remove("a").is_none());
}

#[test]
fn relative_references_follow_base() {
    assert_eq!(resolve_relative("mem://pack/hero.gltf", "hero.bin").unwrap(), "mem://pack/hero.bin");
    assert_eq!(resolve_relative("hero.dae", "data:,x").unwrap(), "data:,x");
    assert_eq!(resolve_relative("mem://pack/models/hero.gltf", "../tex/skin.png").unwrap(), "mem://pack/tex/skin.png");
}

#[test]
fn texture_pass_follows_parent_directory_references() {
    let memory = MemoryStreamHandler::new().with_entry("pack/tex/skin.png", png_2x1());
    let resolver = AssetResolver::new().with_handler("mem", memory);

    let mut materials = vec![textured("Skin", TextureSource::Uri("../tex/skin.png".to_string()))];
    assert_eq!(populate_textures(&mut materials, "mem://pack/models/hero.dae", &resolver), 1);
}

// ============================================================================
// Texture Pass
// ============================================================================

fn png_2x1() -> Vec<u8> {
    let mut img = image::RgbaImage::new(2, 1);
    img.put_pixel(0, 0, image::Rgba([255, 0, 0, 255]));
    img.put_pixel(1, 0, image::Rgba([0, 0, 255, 128]));
    let mut bytes = std::io::Cursor::new(Vec::new());
    img.write_to(&mut bytes, image::ImageFormat::Png).unwrap();
    bytes.into_inner()
}

fn textured(name: &str, source: TextureSource) -> MaterialData {
    MaterialData {
        texture: Some(TextureBinding::new(source)),
        ..MaterialData::new(name)
    }
}

#[test]
fn texture_pass_decodes_relative_and_embedded_images() {
    let png = png_2x1();
    let memory = MemoryStreamHandler::new().with_entry("models/tex/skin.png", png.clone());
    let resolver = AssetResolver::new().with_handler("mem", memory);

    let mut materials = vec![
        textured("Skin", TextureSource::Uri("tex/skin.png".to_string())),
        textured(
            "Decal",
            TextureSource::Embedded {
                bytes: png.into(),
                mime_type: Some("image/png".to_string()),
            },
        ),
        MaterialData::new("Plain"),
    ];

    let decoded = populate_textures(&mut materials, "mem://models/hero.dae", &resolver);
    assert_eq!(decoded, 2);

    let image = materials[0].texture.as_ref().unwrap().image.as_ref().unwrap();
    assert_eq!((image.width, image.height), (2, 1));
    assert_eq!(image.rgba, [255, 0, 0, 255, 0, 0, 255, 128]);
    assert!(materials[1].texture.as_ref().unwrap().image.is_some());
    assert!(materials[2].texture.is_none());
}

#[test]
fn texture_failures_leave_binding_unresolved() {
    let memory = MemoryStreamHandler::new().with_entry("broken.png", b"not a png".to_vec());
    let resolver = AssetResolver::new().with_handler("mem", memory);

    let mut materials = vec![
        textured("Missing", TextureSource::Uri("mem://absent.png".to_string())),
        textured("Broken", TextureSource::Uri("broken.png".to_string())),
    ];

    assert_eq!(populate_textures(&mut materials, "mem://hero.dae", &resolver), 0);
    for material in &materials {
        let binding = material.texture.as_ref().unwrap();
        assert!(binding.image.is_none());
    }
    assert_eq!(
        materials[1].texture.as_ref().unwrap().source,
        TextureSource::Uri("broken.png".to_string())
    );
}

// ============================================================================
// Bounds and Fit Transform
// ============================================================================

fn model_with(points: &[Vec3]) -> ModelData {
    let mesh = MeshData {
        name: "box".to_string(),
        positions: points.to_vec(),
        ..MeshData::default()
    };
    ModelData {
        meshes: vec![mesh],
        ..ModelData::default()
    }
}

#[test]
fn bounds_cover_all_positions() {
    let model = model_with(&[Vec3::new(-1.0, 0.0, 2.0), Vec3::new(3.0, -4.0, 0.0)]);
    let bounds = model.bounds().unwrap();
    assert!(approx(bounds.min, Vec3::new(-1.0, -4.0, 0.0)));
    assert!(approx(bounds.max, Vec3::new(3.0, 0.0, 2.0)));
}

#[test]
fn fit_transform_scales_largest_extent() {
    let model = model_with(&[Vec3::ZERO, Vec3::new(4.0, 2.0, 1.0)]);
    let fit = model.fit_transform(1.0, Vec3::ZERO);

    assert!(approx(fit.transform_point3(Vec3::new(2.0, 1.0, 0.5)), Vec3::ZERO));
    assert!(approx(fit.transform_point3(Vec3::new(4.0, 1.0, 0.5)), Vec3::new(0.5, 0.0, 0.0)));
}

#[test]
fn empty_model_fits_to_identity() {
    let model = ModelData::default();
    assert!(model.bounds().is_none());
    assert_eq!(model.fit_transform(2.0, Vec3::ONE), Mat4::IDENTITY);
}

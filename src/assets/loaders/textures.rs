//! Second parser pass: turns texture references into decoded pixels.
//!
//! A texture that cannot be opened or decoded is logged and the material keeps
//! its unresolved binding.

use image::GenericImageView;

use crate::assets::io::{AssetResolver, resolve_relative};
use crate::assets::model::{MaterialData, TextureImage, TextureSource};

/// Decodes every material texture, resolving URIs against `base_uri`.
///
/// Returns the number of textures decoded.
pub fn populate_textures(materials: &mut [MaterialData], base_uri: &str, resolver: &AssetResolver) -> usize {
    let mut decoded = 0;
    for material in materials {
        let Some(binding) = material.texture.as_mut() else {
            continue;
        };
        if binding.image.is_some() {
            continue;
        }

        let bytes = match &binding.source {
            TextureSource::Embedded { bytes, .. } => bytes.to_vec(),
            TextureSource::Uri(uri) => {
                match resolve_relative(base_uri, uri).and_then(|uri| resolver.read_bytes(&uri)) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::warn!("Material `{}`: {e}", material.name);
                        continue;
                    }
                }
            }
        };

        match decode_rgba8(&bytes) {
            Ok(image) => {
                binding.image = Some(image);
                decoded += 1;
            }
            Err(e) => log::warn!("Material `{}`: failed to decode texture: {e}", material.name),
        }
    }
    decoded
}

/// Decodes PNG/JPEG bytes into RGBA8.
pub fn decode_rgba8(bytes: &[u8]) -> image::ImageResult<TextureImage> {
    let img = image::load_from_memory(bytes)?;
    let (width, height) = img.dimensions();
    Ok(TextureImage {
        width,
        height,
        rgba: img.into_rgba8().into_raw(),
    })
}

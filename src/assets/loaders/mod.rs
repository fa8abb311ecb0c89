pub mod collada;
pub mod gltf;
pub mod textures;

pub use collada::ColladaParser;
pub use gltf::GltfParser;
pub use textures::populate_textures;

use crate::assets::context::{LoadContext, Section};
use crate::assets::io::AssetResolver;
use crate::assets::model::{ModelData, ParsedAsset};
use crate::assets::settings::LoadSettings;
use crate::errors::{Error, Result};

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const GLB_MAGIC: &[u8] = b"glTF";

/// Everything a parser may consult besides the asset bytes.
#[derive(Debug, Clone, Copy)]
pub struct ParseRequest<'a> {
    /// Identifier the bytes were opened from; relative references resolve against it.
    pub uri: &'a str,
    pub resolver: &'a AssetResolver,
    pub settings: &'a LoadSettings,
    pub ctx: &'a LoadContext,
}

/// Supported formats, selected by sniffing the stream header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetParser {
    Collada(ColladaParser),
    Gltf(GltfParser),
}

impl AssetParser {
    /// Picks a parser from the first meaningful bytes of `bytes`.
    pub fn sniff(bytes: &[u8]) -> Result<Self> {
        if bytes.starts_with(GLB_MAGIC) {
            return Ok(AssetParser::Gltf(GltfParser));
        }
        let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
        match body.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'{') => Ok(AssetParser::Gltf(GltfParser)),
            Some(b'<') => Ok(AssetParser::Collada(ColladaParser)),
            Some(_) => Err(Error::parse_at_start("unrecognised asset header")),
            None => Err(Error::parse_at_start("empty asset stream")),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            AssetParser::Collada(_) => "COLLADA",
            AssetParser::Gltf(_) => "glTF",
        }
    }

    /// Structural pass: geometry, materials, joints and raw clips.
    pub fn build(&self, bytes: &[u8], req: &ParseRequest<'_>) -> Result<ParsedAsset> {
        match self {
            AssetParser::Collada(p) => p.build(bytes, req),
            AssetParser::Gltf(p) => p.build(bytes, req),
        }
    }
}

/// Runs the whole off-thread pipeline on an in-memory asset: sniff, build,
/// resolve joints and clips, then the texture pass.
pub fn load_model(bytes: &[u8], req: &ParseRequest<'_>) -> Result<ModelData> {
    let parser = AssetParser::sniff(bytes)?;
    log::debug!("Parsing `{}` as {}", req.uri, parser.name());

    let parsed = parser.build(bytes, req)?;
    let mut model = parsed.resolve(req.uri, req.ctx)?;

    if req.settings.resolve_textures {
        populate_textures(&mut model.materials, req.uri, req.resolver);
        req.ctx.checkpoint(Section::Textures)?;
    }
    Ok(model)
}

/// Parses without cancellation, textures resolved against the current directory.
pub fn load_model_from_bytes(uri: &str, bytes: &[u8]) -> Result<ModelData> {
    let resolver = AssetResolver::new();
    let settings = LoadSettings::default();
    let ctx = LoadContext::default();
    load_model(
        bytes,
        &ParseRequest {
            uri,
            resolver: &resolver,
            settings: &settings,
            ctx: &ctx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn sniffing_picks_format_from_header() {
        assert!(matches!(AssetParser::sniff(b"glTF\x02\0\0\0"), Ok(AssetParser::Gltf(_))));
        assert!(matches!(AssetParser::sniff(b"  {\"asset\":{}}"), Ok(AssetParser::Gltf(_))));
        assert!(matches!(
            AssetParser::sniff(b"\xEF\xBB\xBF<?xml version=\"1.0\"?>"),
            Ok(AssetParser::Collada(_))
        ));
        let err = AssetParser::sniff(b"solid cube").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }
}

use std::fmt;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use url::Url;

use crate::assets::context::{CancellationToken, ProgressCell};
use crate::errors::{Error, Result};

/// A readable byte source, optionally with a known length.
pub struct ByteStream {
    reader: Box<dyn Read + Send>,
    len: Option<u64>,
}

impl ByteStream {
    pub fn new(reader: impl Read + Send + 'static, len: Option<u64>) -> Self {
        Self {
            reader: Box::new(reader),
            len,
        }
    }

    pub fn from_bytes(bytes: impl AsRef<[u8]> + Send + 'static) -> Self {
        let len = bytes.as_ref().len() as u64;
        Self::new(Cursor::new(bytes), Some(len))
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> Option<u64> {
        self.len
    }
}

impl Read for ByteStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStream").field("len", &self.len).finish_non_exhaustive()
    }
}

/// Turns the path part of a `scheme://path` identifier into bytes.
pub trait StreamHandler: Send + Sync {
    fn open(&self, path: &str) -> io::Result<ByteStream>;
}

/// Reads files below a root directory.
#[derive(Debug, Clone)]
pub struct FileStreamHandler {
    root_path: PathBuf,
}

impl FileStreamHandler {
    /// Uses `path` as the root, or its parent directory if `path` is a file.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let root_path = if path.is_file() {
            path.parent().unwrap_or(Path::new(".")).to_path_buf()
        } else {
            path.to_path_buf()
        };
        Self { root_path }
    }

    #[inline]
    #[must_use]
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }
}

impl StreamHandler for FileStreamHandler {
    fn open(&self, path: &str) -> io::Result<ByteStream> {
        let file = std::fs::File::open(self.root_path.join(path))?;
        let len = file.metadata().ok().map(|m| m.len());
        Ok(ByteStream::new(io::BufReader::new(file), len))
    }
}

/// Named in-memory blobs (bundled assets, tests).
#[derive(Debug, Default)]
pub struct MemoryStreamHandler {
    entries: RwLock<FxHashMap<String, Arc<[u8]>>>,
}

impl MemoryStreamHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_entry(self, name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        self.insert(name, bytes);
        self
    }

    pub fn insert(&self, name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) {
        self.entries.write().insert(name.into(), bytes.into());
    }

    pub fn remove(&self, name: &str) -> Option<Arc<[u8]>> {
        self.entries.write().remove(name)
    }
}

impl StreamHandler for MemoryStreamHandler {
    fn open(&self, path: &str) -> io::Result<ByteStream> {
        let bytes = self.entries.read().get(path).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no in-memory entry `{path}`"))
        })?;
        Ok(ByteStream::from_bytes(bytes))
    }
}

/// Maps asset identifiers to byte streams.
///
/// Plain paths go to the file root, `data:` URIs are decoded inline and
/// `scheme://path` identifiers are dispatched to the registered handler.
#[derive(Clone)]
pub struct AssetResolver {
    files: FileStreamHandler,
    handlers: FxHashMap<String, Arc<dyn StreamHandler>>,
}

impl Default for AssetResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AssetResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut schemes: Vec<_> = self.handlers.keys().collect();
        schemes.sort();
        f.debug_struct("AssetResolver")
            .field("root", &self.files.root_path())
            .field("schemes", &schemes)
            .finish()
    }
}

impl AssetResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::with_root(".")
    }

    #[must_use]
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self {
            files: FileStreamHandler::new(root),
            handlers: FxHashMap::default(),
        }
    }

    /// Installs `handler` for `scheme://…` identifiers, replacing any previous one.
    pub fn register(&mut self, scheme: impl Into<String>, handler: impl StreamHandler + 'static) -> &mut Self {
        self.handlers.insert(scheme.into().to_ascii_lowercase(), Arc::new(handler));
        self
    }

    #[must_use]
    pub fn with_handler(mut self, scheme: impl Into<String>, handler: impl StreamHandler + 'static) -> Self {
        self.register(scheme, handler);
        self
    }

    pub fn open(&self, uri: &str) -> Result<ByteStream> {
        self.open_io(uri).map_err(|e| Error::stream(uri, e))
    }

    /// Opens `uri` and reads it to the end.
    pub fn read_bytes(&self, uri: &str) -> Result<Vec<u8>> {
        let mut stream = self.open(uri)?;
        let mut bytes = Vec::with_capacity(stream.len().unwrap_or(0) as usize);
        stream
            .read_to_end(&mut bytes)
            .map_err(|e| Error::stream(uri, e))?;
        Ok(bytes)
    }

    fn open_io(&self, uri: &str) -> io::Result<ByteStream> {
        if uri.starts_with("data:") {
            return decode_data_uri(uri).map(ByteStream::from_bytes);
        }
        match split_scheme(uri) {
            Some((scheme, path)) if scheme == "file" => self.files.open(path),
            Some((scheme, path)) => {
                let handler = self.handlers.get(&scheme).ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::Unsupported,
                        format!("no stream handler registered for scheme `{scheme}`"),
                    )
                })?;
                handler.open(path)
            }
            None => self.files.open(uri),
        }
    }
}

/// Resolves `reference` against the directory of `base`.
///
/// `data:` URIs and identifiers with a scheme are returned unchanged.
/// Scheme bases are joined as URLs, so `.` and `..` segments collapse;
/// plain bases are joined as filesystem paths. Everything after `://` is
/// the handler path, so the first segment is a directory, not a host.
pub fn resolve_relative(base: &str, reference: &str) -> Result<String> {
    if reference.starts_with("data:") || split_scheme(reference).is_some() {
        return Ok(reference.to_string());
    }
    if let Some((scheme, path)) = split_scheme(base) {
        // Joined under a placeholder non-special scheme so `http`-like
        // schemes cannot reinterpret the first segment as a host.
        let joined = Url::parse(&format!("asset:///{path}"))
            .and_then(|root| root.join(reference))
            .map_err(|e| Error::stream(reference, io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        return Ok(format!("{scheme}://{}", joined.path().trim_start_matches('/')));
    }
    let reference = reference.strip_prefix("./").unwrap_or(reference);
    let joined = match Path::new(base).parent() {
        Some(dir) => dir.join(reference),
        None => PathBuf::from(reference),
    };
    Ok(joined.to_string_lossy().into_owned())
}

/// Splits `scheme://rest` into the lower-cased scheme and the handler path.
///
/// Query and fragment are not part of the handler path.
fn split_scheme(uri: &str) -> Option<(String, &str)> {
    let (_, rest) = uri.split_once("://")?;
    let url = Url::parse(uri).ok()?;
    let path = rest.split(['?', '#']).next().unwrap_or(rest);
    Some((url.scheme().to_string(), path))
}

/// Decodes a `data:[<mime>][;base64],<payload>` URI.
pub fn decode_data_uri(uri: &str) -> io::Result<Vec<u8>> {
    let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_string());
    let body = uri.strip_prefix("data:").ok_or_else(|| invalid("not a data URI"))?;
    let (header, payload) = body
        .split_once(',')
        .ok_or_else(|| invalid("data URI has no payload separator"))?;
    if header.ends_with(";base64") {
        BASE64
            .decode(payload.trim())
            .map_err(|e| invalid(&e.to_string()))
    } else {
        Ok(payload.as_bytes().to_vec())
    }
}

/// Mime type declared by a data URI, if any.
#[must_use]
pub fn data_uri_mime(uri: &str) -> Option<&str> {
    let header = uri.strip_prefix("data:")?.split(',').next()?;
    let mime = header.split(';').next()?;
    (!mime.is_empty()).then_some(mime)
}

/// Wraps a stream to report read progress and honour cancellation.
///
/// Once the token is set every read fails, which unwinds whatever parser is
/// pulling from the stream.
pub struct MonitoredStream<R> {
    inner: R,
    cancel: CancellationToken,
    progress: Option<(ProgressCell, f32)>,
    total: Option<u64>,
    consumed: u64,
}

impl<R: Read> MonitoredStream<R> {
    pub fn new(inner: R, cancel: CancellationToken, total: Option<u64>) -> Self {
        Self {
            inner,
            cancel,
            progress: None,
            total,
            consumed: 0,
        }
    }

    /// Reports `consumed / total × share` into `progress` as bytes arrive.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressCell, share: f32) -> Self {
        self.progress = Some((progress, share));
        self
    }

    #[inline]
    #[must_use]
    pub fn consumed(&self) -> u64 {
        self.consumed
    }
}

impl<R: Read> Read for MonitoredStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // Not `Interrupted`: std readers retry those forever.
        if self.cancel.is_cancelled() {
            return Err(io::Error::other("load cancelled"));
        }
        let n = self.inner.read(buf)?;
        self.consumed += n as u64;
        if let (Some((progress, share)), Some(total)) = (&self.progress, self.total)
            && total > 0
        {
            progress.set((self.consumed as f64 / total as f64) as f32 * share);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_references_join_base_directory() {
        assert_eq!(resolve_relative("models/cowboy.dae", "tex/skin.png").unwrap(), "models/tex/skin.png");
        assert_eq!(resolve_relative("mem://a/b.gltf", "./c.bin").unwrap(), "mem://a/c.bin");
        assert_eq!(resolve_relative("b.gltf", "c.bin").unwrap(), "c.bin");
        assert_eq!(resolve_relative("a/b.gltf", "mem://x").unwrap(), "mem://x");
    }

    #[test]
    fn scheme_references_collapse_dot_segments() {
        assert_eq!(resolve_relative("mem://a/b/m.gltf", "../tex.png").unwrap(), "mem://a/tex.png");
        assert_eq!(resolve_relative("mem://a/b/m.gltf", "./c/../d.bin").unwrap(), "mem://a/b/d.bin");
        assert_eq!(resolve_relative("mem://a/b/m.gltf", "c.bin?v=2#x").unwrap(), "mem://a/b/c.bin");
    }

    #[test]
    fn top_level_scheme_entries_resolve_to_siblings() {
        assert_eq!(resolve_relative("mem://hero.gltf", "hero.bin").unwrap(), "mem://hero.bin");
        assert_eq!(resolve_relative("MEM://hero.gltf", "../hero.bin").unwrap(), "mem://hero.bin");
    }

    #[test]
    fn split_scheme_strips_query_and_fragment() {
        assert_eq!(split_scheme("MEM://pack/a.bin?v=2#frag"), Some(("mem".to_string(), "pack/a.bin")));
        assert_eq!(split_scheme("models/a.bin"), None);
        assert_eq!(split_scheme("://nothing"), None);
    }

    #[test]
    fn data_uri_base64_decodes() {
        let bytes = decode_data_uri("data:application/octet-stream;base64,AQID").unwrap();
        assert_eq!(bytes, [1, 2, 3]);
        assert_eq!(data_uri_mime("data:image/png;base64,AA=="), Some("image/png"));
    }

    #[test]
    fn monitored_stream_fails_after_cancel() {
        let token = CancellationToken::new();
        let mut stream = MonitoredStream::new(Cursor::new(vec![0u8; 16]), token.clone(), Some(16));
        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).unwrap(), 4);
        token.cancel();
        assert!(stream.read(&mut buf).is_err());
    }
}

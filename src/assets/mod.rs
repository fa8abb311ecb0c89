pub mod context;
pub mod io;
pub mod loaders;
pub mod model;
pub mod server;
pub mod settings;
pub mod storage;

pub use context::{CancellationToken, LoadContext, ProgressCell, Section};
pub use io::{AssetResolver, ByteStream, FileStreamHandler, MemoryStreamHandler, MonitoredStream, StreamHandler};
pub use loaders::{AssetParser, ColladaParser, GltfParser, ParseRequest, load_model, load_model_from_bytes};
pub use model::{
    BoundingBox, MaterialData, MeshData, MeshSkin, ModelData, ParsedAsset, TextureBinding, TextureImage, TextureSource,
};
pub use server::{AssetLoader, Callbacks, LoadListener, LoadTask, Phase, TaskState};
pub use settings::LoadSettings;
pub use storage::{AssetStorage, ModelHandle, ModelStorage};

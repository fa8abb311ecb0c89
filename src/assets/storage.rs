use parking_lot::{RwLock, RwLockReadGuard};
use rustc_hash::FxHashMap;
use slotmap::{Key, SlotMap, new_key_type};
use std::sync::Arc;
use uuid::Uuid;

use crate::assets::model::ModelData;

new_key_type! {
    pub struct ModelHandle;
}

/// Loaded models, shared read-only with renderers and players.
pub type ModelStorage = AssetStorage<ModelHandle, ModelData>;

// Internal data structure, protected by a lock.
pub struct StorageInner<H: Key, T> {
    pub map: SlotMap<H, Arc<T>>,
    pub lookup: FxHashMap<Uuid, H>,
}

impl<H: Key, T> Default for StorageInner<H, T> {
    fn default() -> Self {
        Self {
            map: SlotMap::default(),
            lookup: FxHashMap::default(),
        }
    }
}

// Thread-safe container exposed to external consumers.
pub struct AssetStorage<H: Key, T> {
    inner: RwLock<StorageInner<H, T>>,
}

impl<H: Key, T> Default for AssetStorage<H, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Key, T> AssetStorage<H, T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::default(),
        }
    }

    /// [Write] Adds an asset and returns its handle.
    pub fn add(&self, asset: impl Into<T>) -> H {
        let mut guard = self.inner.write();
        guard.map.insert(Arc::new(asset.into()))
    }

    /// [Write] Adds an asset keyed by UUID; an existing entry wins.
    pub fn add_with_uuid(&self, uuid: Uuid, asset: impl Into<T>) -> H {
        self.add_shared(uuid, Arc::new(asset.into()))
    }

    /// [Write] Same as [`Self::add_with_uuid`] for an already shared asset.
    pub fn add_shared(&self, uuid: Uuid, asset: Arc<T>) -> H {
        let mut guard = self.inner.write();
        if let Some(&handle) = guard.lookup.get(&uuid) {
            return handle;
        }
        let handle = guard.map.insert(asset);
        guard.lookup.insert(uuid, handle);
        handle
    }

    /// [Read] Gets a single asset.
    pub fn get(&self, handle: H) -> Option<Arc<T>> {
        let guard = self.inner.read();
        guard.map.get(handle).cloned()
    }

    pub fn get_by_uuid(&self, uuid: &Uuid) -> Option<Arc<T>> {
        let guard = self.inner.read();
        let handle = guard.lookup.get(uuid)?;
        guard.map.get(*handle).cloned()
    }

    /// [Write] Unloads an asset. Outstanding `Arc`s keep it alive until dropped.
    pub fn remove(&self, handle: H) -> Option<Arc<T>> {
        let mut guard = self.inner.write();
        let removed = guard.map.remove(handle)?;
        guard.lookup.retain(|_, h| *h != handle);
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().map.is_empty()
    }

    /// [Read - Advanced] Acquires a read-lock guard for batch access.
    pub fn read_lock(&self) -> RwLockReadGuard<'_, StorageInner<H, T>> {
        self.inner.read()
    }
}

impl ModelStorage {
    /// Stores a model under its own id.
    pub fn insert_model(&self, model: ModelData) -> ModelHandle {
        self.add_with_uuid(model.id, model)
    }
}

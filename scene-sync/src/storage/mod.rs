//! Durable storage for scenes.
//!
//! Architecture:
//! ```text
//! ┌────────────┐  load (startup)   ┌──────────────────────────────┐
//! │ SceneStore │ ◄──────────────── │ dyn SceneStorage             │
//! │ (memory)   │ ────────────────► │  ├── SceneDb (RocksDB)       │
//! └────────────┘  save (debounced) │  └── MemoryStorage (tests)   │
//!                                  └──────────────────────────────┘
//! ```
//!
//! The storage layer only promises "eventually written": callers wrap
//! `save` in a [`Debouncer`](crate::debounce::Debouncer) and flush it when a
//! room closes. No retries happen here.

pub mod rocks;

pub use rocks::{SceneDb, SceneMetadata, StoreConfig, StoreStats};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::protocol::Scene;

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
    /// The backend refused the write
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::Unavailable(e) => write!(f, "Storage unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Key-value persistence for scenes, one entry per scene id.
pub trait SceneStorage: Send + Sync {
    /// Load a scene, `None` if it was never saved.
    fn load(&self, scene_id: &str) -> Result<Option<Scene>, StoreError>;

    /// Overwrite the stored scene.
    fn save(&self, scene_id: &str, scene: &Scene) -> Result<(), StoreError>;

    /// Ids of every stored scene.
    fn list_scenes(&self) -> Result<Vec<String>, StoreError>;
}

/// In-process storage. Loses everything on restart.
#[derive(Default)]
pub struct MemoryStorage {
    scenes: Mutex<HashMap<String, Scene>>,
    saves: AtomicU64,
    fail_saves: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a scene, bypassing the save counter.
    pub fn insert(&self, scene_id: impl Into<String>, scene: Scene) {
        self.scenes.lock().insert(scene_id.into(), scene);
    }

    /// Peek at what was last saved.
    pub fn get(&self, scene_id: &str) -> Option<Scene> {
        self.scenes.lock().get(scene_id).cloned()
    }

    /// Number of successful `save` calls.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make every following `save` fail with [`StoreError::Unavailable`].
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

impl SceneStorage for MemoryStorage {
    fn load(&self, scene_id: &str) -> Result<Option<Scene>, StoreError> {
        Ok(self.get(scene_id))
    }

    fn save(&self, scene_id: &str, scene: &Scene) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("save of scene {scene_id} rejected")));
        }
        self.scenes.lock().insert(scene_id.to_string(), scene.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn list_scenes(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.scenes.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

//! Backend registry - method name to constructor

use super::{get_or_create_uuid, BlobStorage};
use crate::btree::BTreeStorage;
use crate::config::{load_storage_config, StorageConfig};
use crate::dayfile::DayFileStorage;
use crate::journal::JournalStorage;
use crate::{BlobError, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Opens a backend in its directory
pub type BackendLoader = fn(&Path, &StorageConfig) -> Result<Arc<dyn BlobStorage>>;

/// An opened backend instance
#[derive(Clone)]
pub struct Backend {
    /// Table name in `storage.conf` (also the directory name)
    pub name: String,
    /// Persistent identity, the node component of a blob address
    pub node: Uuid,
    /// The backend itself
    pub storage: Arc<dyn BlobStorage>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("node", &self.node)
            .finish()
    }
}

/// Explicit registry of backend implementations
#[derive(Clone, Default)]
pub struct BackendRegistry {
    loaders: HashMap<String, BackendLoader>,
}

impl BackendRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the three built-in backends and their historical aliases
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("dayfile", load_dayfile);
        registry.register("btree", load_btree);
        registry.register("clldb", load_btree);
        registry.register("journal", load_journal);
        registry.register("basedb", load_journal);
        registry
    }

    /// Register (or replace) a method
    pub fn register(&mut self, method: impl Into<String>, loader: BackendLoader) {
        self.loaders.insert(method.into(), loader);
    }

    /// Whether a method is known
    pub fn contains(&self, method: &str) -> bool {
        self.loaders.contains_key(method)
    }

    /// Open one backend in `dir`, creating the directory and identity if needed
    pub fn open(&self, name: &str, dir: &Path, config: &StorageConfig) -> Result<Backend> {
        let loader = self
            .loaders
            .get(&config.method)
            .ok_or_else(|| BlobError::UnknownMethod(config.method.clone()))?;

        std::fs::create_dir_all(dir)?;
        let node = get_or_create_uuid(dir)?;
        let storage = loader(dir, config)?;

        info!(
            "Opened {} backend {} ({}) in {:?}",
            config.method, name, node, dir
        );

        Ok(Backend {
            name: name.to_string(),
            node,
            storage,
        })
    }
}

/// Open every backend listed in `root/storage.conf`.
///
/// All methods are validated before anything is opened, so a typo in one
/// table does not leave half of the backends initialised.
pub fn open_storages(root: &Path, registry: &BackendRegistry) -> Result<Vec<Backend>> {
    let configs = load_storage_config(root)?;

    if let Some(bad) = configs.values().find(|c| !registry.contains(&c.method)) {
        return Err(BlobError::UnknownMethod(bad.method.clone()));
    }

    configs
        .iter()
        .map(|(name, config)| registry.open(name, &root.join(name), config))
        .collect()
}

fn load_dayfile(dir: &Path, config: &StorageConfig) -> Result<Arc<dyn BlobStorage>> {
    Ok(Arc::new(DayFileStorage::open(dir, config)?))
}

fn load_btree(dir: &Path, config: &StorageConfig) -> Result<Arc<dyn BlobStorage>> {
    Ok(Arc::new(BTreeStorage::open(dir, config)?))
}

fn load_journal(dir: &Path, config: &StorageConfig) -> Result<Arc<dyn BlobStorage>> {
    Ok(Arc::new(JournalStorage::open(dir, config)?))
}

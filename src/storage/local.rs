//! Local filesystem storage backend implementation.

use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::StorageError;

use super::{BackendConfig, StorageProvider};

/// Local filesystem configuration. `path` is absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConfig {
    pub path: String,
}

impl StorageProvider {
    // The store is rooted at `/` and the directory is applied as a key
    // prefix, so the directory itself does not need to exist yet.
    pub(super) fn construct_local(config: LocalConfig) -> Result<Self, StorageError> {
        let object_store: Arc<dyn ObjectStore> = Arc::new(LocalFileSystem::new());
        let canonical_url = format!("file://{}", config.path);

        Ok(Self {
            config: BackendConfig::Local(config),
            object_store,
            canonical_url,
            storage_options: HashMap::new(),
        })
    }
}

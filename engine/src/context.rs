//! Explicit engine handle.

use std::fmt;
use std::sync::Arc;

use crate::config::Config;
use crate::store::{MemoryStore, Store};

/// Shared dependencies of every engine component.
///
/// Cloning is cheap; clones share the same store and configuration.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn Store>,
    pub config: Arc<Config>,
}

impl EngineContext {
    /// Bundles a store backend with a configuration.
    pub fn new(store: Arc<dyn Store>, config: Config) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }

    /// Creates a context over a fresh [`MemoryStore`], returning the
    /// concrete store alongside it for inspection.
    pub fn in_memory(config: Config) -> (Self, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Self::new(store.clone(), config), store)
    }

    /// Name of the registry collection.
    pub fn registry_collection(&self) -> &str {
        &self.config.registry_collection
    }
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

//! Pluggable stores.  Each kind of store has a process-wide registry
//! mapping a name from the config file to a factory; registries are
//! populated once at startup and a duplicate registration is a programming
//! error.

pub mod odp_cache;
pub mod ups;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use once_cell::sync::Lazy;

use crate::config::PluginSpec;
use crate::error::CoreError;

pub use odp_cache::OdpCache;
pub use ups::UserProfileService;

type Creator<T> = fn(&PluginSpec) -> Result<Arc<T>, CoreError>;

pub struct PluginRegistry<T: ?Sized + Send + Sync> {
    entries: RwLock<HashMap<String, Creator<T>>>,
}

impl<T: ?Sized + Send + Sync> PluginRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Panics on a duplicate name.
    pub fn register(&self, name: &str, creator: Creator<T>) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.insert(name.to_string(), creator).is_some() {
            panic!("plugin {name:?} registered twice");
        }
    }

    pub fn create(&self, spec: &PluginSpec) -> Result<Arc<T>, CoreError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let creator = entries.get(&spec.kind).ok_or_else(|| {
            CoreError::malformed(format!("unknown plugin type: {}", spec.kind))
        })?;
        creator(spec)
    }
}

impl<T: ?Sized + Send + Sync> Default for PluginRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub static UPS_REGISTRY: Lazy<PluginRegistry<dyn UserProfileService>> = Lazy::new(|| {
    let registry = PluginRegistry::new();
    registry.register("in-memory", ups::in_memory_creator);
    registry.register("redis", ups::redis_creator);
    registry
});

pub static ODP_CACHE_REGISTRY: Lazy<PluginRegistry<dyn OdpCache>> = Lazy::new(|| {
    let registry = PluginRegistry::new();
    registry.register("in-memory", odp_cache::in_memory_creator);
    registry.register("redis", odp_cache::redis_creator);
    registry
});

/// Connection URL for the redis-backed stores.
pub(crate) fn redis_url(spec: &PluginSpec) -> String {
    let secret = spec.resolve_secret();
    let host = spec.host.trim_start_matches("redis://");
    if secret.is_empty() {
        format!("redis://{}/{}", host, spec.database)
    } else {
        format!("redis://:{}@{}/{}", secret, host, spec.database)
    }
}

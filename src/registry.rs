//! SDK-key to client-handle registry.  At most one live handle per key;
//! concurrent first requests for a key build exactly one handle, and a
//! failed build leaves nothing behind.

use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;
use tokio::sync::Mutex;

use crate::client::ClientHandle;
use crate::config::ClientConfig;
use crate::error::CoreError;
use crate::plugins::{OdpCache, UserProfileService, ODP_CACHE_REGISTRY, UPS_REGISTRY};
use crate::sync::SyncBridge;

pub struct ClientRegistry {
    cfg: ClientConfig,
    clients: DashMap<String, Arc<ClientHandle>>,
    // One permit per key serializes construction without blocking readers.
    permits: DashMap<String, Arc<Mutex<()>>>,
    key_pattern: Regex,
    ups_choice: DashMap<String, String>,
    odp_choice: DashMap<String, String>,
    sync: Option<Arc<SyncBridge>>,
}

impl ClientRegistry {
    pub fn new(cfg: ClientConfig, sync: Option<Arc<SyncBridge>>) -> Result<Self, CoreError> {
        let key_pattern = Regex::new(&cfg.sdk_key_regex)
            .map_err(|e| CoreError::internal(format!("invalid sdkKeyRegex: {e}")))?;
        Ok(Self {
            cfg,
            clients: DashMap::new(),
            permits: DashMap::new(),
            key_pattern,
            ups_choice: DashMap::new(),
            odp_choice: DashMap::new(),
            sync,
        })
    }

    fn validate_key(&self, sdk_key: &str) -> Result<(), CoreError> {
        if self.key_pattern.is_match(sdk_key) {
            Ok(())
        } else {
            Err(CoreError::ValidationFailure)
        }
    }

    fn permit(&self, sdk_key: &str) -> Arc<Mutex<()>> {
        self.permits
            .entry(sdk_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn resolve_ups(
        &self,
        sdk_key: &str,
    ) -> Result<Option<Arc<dyn UserProfileService>>, CoreError> {
        let name = self
            .ups_choice
            .get(sdk_key)
            .map(|n| n.clone())
            .or_else(|| self.cfg.default_user_profile_service.clone());
        match name {
            None => Ok(None),
            Some(name) => {
                let spec = self.cfg.user_profile_services.get(&name).ok_or_else(|| {
                    CoreError::malformed(format!("unknown user profile service: {name}"))
                })?;
                UPS_REGISTRY.create(spec).map(Some)
            }
        }
    }

    fn resolve_odp_cache(&self, sdk_key: &str) -> Result<Option<Arc<dyn OdpCache>>, CoreError> {
        let name = self
            .odp_choice
            .get(sdk_key)
            .map(|n| n.clone())
            .or_else(|| self.cfg.default_odp_cache.clone());
        match name {
            None => Ok(None),
            Some(name) => {
                let spec = self
                    .cfg
                    .odp_caches
                    .get(&name)
                    .ok_or_else(|| CoreError::malformed(format!("unknown odp cache: {name}")))?;
                ODP_CACHE_REGISTRY.create(spec).map(Some)
            }
        }
    }

    async fn build(&self, sdk_key: &str) -> Result<Arc<ClientHandle>, CoreError> {
        let ups = self.resolve_ups(sdk_key)?;
        let odp_cache = self.resolve_odp_cache(sdk_key)?;
        let handle = ClientHandle::build(sdk_key, &self.cfg, ups, odp_cache).await?;
        if let Some(sync) = self.sync.as_ref().filter(|s| s.notification_enabled()) {
            let sync = Arc::clone(sync);
            let bus_handle = Arc::clone(&handle);
            let key = sdk_key.to_string();
            // Republishes this handle's notifications to the bus; ends
            // when the handle's hub closes.
            tokio::spawn(async move {
                let Some(mut sub) = bus_handle.subscribe(Default::default()).await else {
                    return;
                };
                while let Some(notification) = sub.recv().await {
                    sync.publish_notification(&key, &notification).await;
                }
            });
        }
        Ok(handle)
    }

    /// Returns the live handle for a key, building one on first use.  The
    /// optional plugin names record the stores a build resolves; for an
    /// already-live handle they take effect on the next rebuild.
    pub async fn get_client(
        &self,
        sdk_key: &str,
        ups_name: Option<&str>,
        odp_name: Option<&str>,
    ) -> Result<Arc<ClientHandle>, CoreError> {
        self.validate_key(sdk_key)?;
        if let Some(name) = ups_name {
            self.set_user_profile_service(sdk_key, name)?;
        }
        if let Some(name) = odp_name {
            self.set_odp_cache(sdk_key, name)?;
        }
        if let Some(handle) = self.clients.get(sdk_key) {
            return Ok(Arc::clone(&handle));
        }
        let permit = self.permit(sdk_key);
        let _guard = permit.lock().await;
        if let Some(handle) = self.clients.get(sdk_key) {
            return Ok(Arc::clone(&handle));
        }
        let handle = self.build(sdk_key).await?;
        self.clients.insert(sdk_key.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Immediate datafile refetch for an already-live key; a key with no
    /// handle is a no-op.
    pub async fn update_configs(&self, sdk_key: &str) -> Result<(), CoreError> {
        let handle = self.clients.get(sdk_key).map(|h| Arc::clone(&h));
        match handle {
            Some(handle) => handle.update_config().await,
            None => Ok(()),
        }
    }

    /// Builds a fresh handle, swaps it in, and closes the old one;
    /// in-flight requests on the old handle finish against it, and its
    /// notification streams end.
    pub async fn reset_client(&self, sdk_key: &str) -> Result<Arc<ClientHandle>, CoreError> {
        self.validate_key(sdk_key)?;
        let permit = self.permit(sdk_key);
        let _guard = permit.lock().await;
        let fresh = self.build(sdk_key).await?;
        let old = self.clients.insert(sdk_key.to_string(), Arc::clone(&fresh));
        if let Some(old) = old {
            old.close();
        }
        Ok(fresh)
    }

    /// Records the store used when this key's handle is (re)built.  The
    /// name must exist in the config tables.
    pub fn set_user_profile_service(&self, sdk_key: &str, name: &str) -> Result<(), CoreError> {
        if !self.cfg.user_profile_services.contains_key(name) {
            return Err(CoreError::malformed(format!(
                "unknown user profile service: {name}"
            )));
        }
        self.ups_choice.insert(sdk_key.to_string(), name.to_string());
        Ok(())
    }

    pub fn set_odp_cache(&self, sdk_key: &str, name: &str) -> Result<(), CoreError> {
        if !self.cfg.odp_caches.contains_key(name) {
            return Err(CoreError::malformed(format!("unknown odp cache: {name}")));
        }
        self.odp_choice.insert(sdk_key.to_string(), name.to_string());
        Ok(())
    }

    /// Startup warm-up for configured keys; failures are logged, never fatal.
    pub async fn warm(&self, sdk_keys: &[String]) {
        for key in sdk_keys {
            if let Err(e) = self.get_client(key, None, None).await {
                tracing::warn!(sdk_key = %key, error = %e, "warm-up failed");
            }
        }
    }

    pub fn live_keys(&self) -> Vec<String> {
        self.clients.iter().map(|e| e.key().clone()).collect()
    }

    pub fn close_all(&self) {
        for entry in self.clients.iter() {
            entry.value().close();
        }
        self.clients.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginSpec;

    fn registry() -> ClientRegistry {
        ClientRegistry::new(ClientConfig::default(), None).unwrap()
    }

    #[tokio::test]
    async fn malformed_sdk_key_is_rejected() {
        let mut cfg = ClientConfig::default();
        // Unroutable; a fetch attempt fails fast instead of going out.
        cfg.datafile_url_template = "http://127.0.0.1:1/datafiles/{}.json".to_string();
        let reg = ClientRegistry::new(cfg, None).unwrap();
        let err = reg.get_client("bad key!", None, None).await.unwrap_err();
        assert!(matches!(err, CoreError::ValidationFailure));
        // A key with a datafile token passes shape validation (and then
        // fails at fetch, which is not a validation failure).
        let err = reg.get_client("key:token", None, None).await.unwrap_err();
        assert!(!matches!(err, CoreError::ValidationFailure));
    }

    #[test]
    fn plugin_selection_requires_a_configured_name() {
        let mut cfg = ClientConfig::default();
        cfg.user_profile_services.insert(
            "mem".to_string(),
            PluginSpec {
                kind: "in-memory".into(),
                ..PluginSpec::default()
            },
        );
        let reg = ClientRegistry::new(cfg, None).unwrap();
        assert!(reg.set_user_profile_service("k", "mem").is_ok());
        assert!(reg.set_user_profile_service("k", "nope").is_err());
        assert!(reg.set_odp_cache("k", "mem").is_err());
    }

    #[tokio::test]
    async fn update_configs_for_unknown_key_is_a_noop() {
        let reg = registry();
        assert!(reg.update_configs("never-built").await.is_ok());
    }
}

//! Per-SDK-key facade.  One `ClientHandle` owns the evaluator, the
//! forced-variation overrides, the notification hub and the pluggable
//! stores for one tenant; the HTTP layer only ever sees handles.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use crate::config::ClientConfig;
use crate::engine::rollout::RolloutEngine;
use crate::engine::{
    DecideOption, Decision, DecisionClient, ForcedVariations, NotificationType, ProjectConfig,
    SegmentOption, UserContext,
};
use crate::error::CoreError;
use crate::notifier::{HubHandle, Subscription};
use crate::plugins::odp_cache::InMemoryOdpCache;
use crate::plugins::{OdpCache, UserProfileService};

/// Result of applying an override; drives the HTTP status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverrideOutcome {
    /// New or changed mapping.
    Set,
    /// Same mapping already present.
    Unchanged,
    /// Empty variation removed an existing mapping.
    Removed,
    /// Empty variation with nothing to remove.
    Absent,
}

pub struct ClientHandle {
    sdk_key: String,
    engine: Arc<dyn DecisionClient>,
    forced: Arc<ForcedVariations>,
    hub: HubHandle,
    ups: Option<Arc<dyn UserProfileService>>,
    segment_cache: Arc<dyn OdpCache>,
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("sdk_key", &self.sdk_key)
            .finish_non_exhaustive()
    }
}

impl ClientHandle {
    /// Fetches the datafile and starts the background tasks; an error here
    /// means no handle exists for the key.
    pub async fn build(
        sdk_key: &str,
        cfg: &ClientConfig,
        ups: Option<Arc<dyn UserProfileService>>,
        odp_cache: Option<Arc<dyn OdpCache>>,
    ) -> Result<Arc<Self>, CoreError> {
        let forced = ForcedVariations::new();
        let hub = HubHandle::spawn();
        let engine =
            RolloutEngine::start(sdk_key, cfg, Arc::clone(&forced), hub.clone()).await?;
        Ok(Arc::new(Self {
            sdk_key: sdk_key.to_string(),
            engine,
            forced,
            hub,
            ups,
            segment_cache: odp_cache.unwrap_or_else(|| Arc::new(InMemoryOdpCache::default())),
        }))
    }

    pub fn sdk_key(&self) -> &str {
        &self.sdk_key
    }

    pub fn decide(
        &self,
        user: &UserContext,
        flag_key: &str,
        options: &[DecideOption],
    ) -> Result<Decision, CoreError> {
        self.engine.decide(user, flag_key, options)
    }

    pub fn decide_for_keys(
        &self,
        user: &UserContext,
        keys: &[String],
        options: &[DecideOption],
    ) -> Result<Vec<Decision>, CoreError> {
        let enabled_only = options.contains(&DecideOption::EnabledFlagsOnly);
        let mut decisions = Vec::new();
        for key in keys {
            let decision = self.engine.decide(user, key, options)?;
            if enabled_only && !decision.enabled {
                continue;
            }
            decisions.push(decision);
        }
        Ok(decisions)
    }

    pub fn decide_all(&self, user: &UserContext, options: &[DecideOption]) -> Vec<Decision> {
        self.engine.decide_all(user, options)
    }

    pub fn track(
        &self,
        user: &UserContext,
        event_key: &str,
        tags: Option<serde_json::Map<String, Value>>,
    ) -> Result<(), CoreError> {
        self.engine.track(user, event_key, tags)
    }

    pub fn project_config(&self) -> ProjectConfig {
        self.engine.project_config()
    }

    pub fn datafile(&self) -> String {
        self.engine.datafile()
    }

    /// Empty variation removes; setting is idempotent.
    pub fn apply_override(
        &self,
        user_id: &str,
        experiment_key: &str,
        variation: &str,
    ) -> OverrideOutcome {
        if variation.is_empty() {
            if self.forced.remove(user_id, experiment_key) {
                OverrideOutcome::Removed
            } else {
                OverrideOutcome::Absent
            }
        } else if self.forced.set(user_id, experiment_key, variation) {
            OverrideOutcome::Set
        } else {
            OverrideOutcome::Unchanged
        }
    }

    pub fn forced_variation(&self, user_id: &str, experiment_key: &str) -> Option<String> {
        self.forced.get(user_id, experiment_key)
    }

    /// Segment fetch with the per-handle cache.  `RESET_CACHE` empties the
    /// cache first; `IGNORE_CACHE` bypasses both lookup and save.
    pub async fn fetch_segments(
        &self,
        user: &UserContext,
        options: &[SegmentOption],
    ) -> Result<Vec<String>, CoreError> {
        let ignore = options.contains(&SegmentOption::IgnoreCache);
        if options.contains(&SegmentOption::ResetCache) {
            self.segment_cache.reset().await?;
        }
        if !ignore {
            if let Some(hit) = self.segment_cache.lookup(&user.user_id).await? {
                return Ok(hit);
            }
        }
        let segments = self.engine.fetch_segments(user).await?;
        if !ignore {
            self.segment_cache
                .save(&user.user_id, segments.clone())
                .await?;
        }
        Ok(segments)
    }

    pub async fn send_odp_event(&self, payload: Value) -> Result<(), CoreError> {
        self.engine.send_odp_event(payload).await
    }

    fn ups(&self) -> Result<&Arc<dyn UserProfileService>, CoreError> {
        self.ups
            .as_ref()
            .ok_or_else(|| CoreError::internal("no user profile service configured".to_string()))
    }

    pub async fn lookup_profile(&self, user_id: &str) -> Result<Option<Value>, CoreError> {
        self.ups()?.lookup(user_id).await
    }

    pub async fn save_profile(&self, user_id: &str, profile: Value) -> Result<(), CoreError> {
        self.ups()?.save(user_id, profile).await
    }

    pub async fn update_config(&self) -> Result<(), CoreError> {
        self.engine.update_config().await
    }

    pub async fn subscribe(
        &self,
        filter: HashSet<NotificationType>,
    ) -> Option<Subscription> {
        self.hub.subscribe(filter).await
    }

    /// Stops background tasks and ends every notification stream.
    pub fn close(&self) {
        self.engine.close();
        self.hub.close();
    }
}

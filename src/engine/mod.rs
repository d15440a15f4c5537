//! Decision engine seam.  The HTTP layer talks to a [`DecisionClient`]
//! and never to a concrete evaluator; the bundled [`rollout::RolloutEngine`]
//! is the in-tree implementation, driven by a polled datafile.

pub mod datafile;
pub mod rollout;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

/// Identity plus attributes for a single evaluation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UserContext {
    #[serde(rename = "userID", alias = "userId")]
    pub user_id: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, Value>,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            attributes: serde_json::Map::new(),
        }
    }
}

/// One flag decision as rendered on the wire.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub user_context: UserContext,
    pub flag_key: String,
    pub rule_key: String,
    pub enabled: bool,
    pub variation_key: String,
    pub reasons: Vec<String>,
}

/// Decide options form a closed set; an unknown member is a client error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecideOption {
    DisableDecisionEvent,
    EnabledFlagsOnly,
    IgnoreUserProfileService,
    IncludeReasons,
    ExcludeVariables,
}

impl DecideOption {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "DISABLE_DECISION_EVENT" => Some(Self::DisableDecisionEvent),
            "ENABLED_FLAGS_ONLY" => Some(Self::EnabledFlagsOnly),
            "IGNORE_USER_PROFILE_SERVICE" => Some(Self::IgnoreUserProfileService),
            "INCLUDE_REASONS" => Some(Self::IncludeReasons),
            "EXCLUDE_VARIABLES" => Some(Self::ExcludeVariables),
            _ => None,
        }
    }
}

pub fn parse_decide_options(raw: &[String]) -> Result<Vec<DecideOption>, CoreError> {
    raw.iter()
        .map(|s| {
            DecideOption::parse(s)
                .ok_or_else(|| CoreError::malformed(format!("invalid decide option: {s}")))
        })
        .collect()
}

/// Segment-fetch options.  Unlike decide options, unknown members are
/// silently ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentOption {
    IgnoreCache,
    ResetCache,
}

pub fn parse_segment_options(raw: &[String]) -> Vec<SegmentOption> {
    raw.iter()
        .filter_map(|s| match s.as_str() {
            "IGNORE_CACHE" => Some(SegmentOption::IgnoreCache),
            "RESET_CACHE" => Some(SegmentOption::ResetCache),
            _ => None,
        })
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NotificationType {
    Decision,
    Track,
    LogEvent,
    ProjectConfigUpdate,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decision => "decision",
            Self::Track => "track",
            Self::LogEvent => "log_event",
            Self::ProjectConfigUpdate => "project_config_update",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "decision" => Some(Self::Decision),
            "track" => Some(Self::Track),
            "log_event" => Some(Self::LogEvent),
            "project_config_update" => Some(Self::ProjectConfigUpdate),
            _ => None,
        }
    }
}

/// One event on a handle's notification bus.  The stream endpoints frame
/// `payload` only; the sync bridge wraps it in `{"type", "message"}`.
#[derive(Clone, Debug)]
pub struct Notification {
    pub kind: NotificationType,
    pub payload: Value,
}

impl Notification {
    pub fn new(kind: NotificationType, payload: Value) -> Self {
        Self { kind, payload }
    }

    pub fn envelope(&self) -> Value {
        serde_json::json!({
            "type": self.kind.as_str(),
            "message": self.payload,
        })
    }
}

/// Per-handle forced-variation overrides, a map from `(userId,
/// experimentKey)` to a variation.  Shared between the facade (which
/// mutates it) and the engine (which consults it during evaluation).
#[derive(Debug, Default)]
pub struct ForcedVariations {
    map: DashMap<(String, String), String>,
}

impl ForcedVariations {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns true only when the map changed.
    pub fn set(&self, user_id: &str, experiment_key: &str, variation: &str) -> bool {
        let key = (user_id.to_string(), experiment_key.to_string());
        match self.map.insert(key, variation.to_string()) {
            Some(prev) => prev != variation,
            None => true,
        }
    }

    /// Returns true when an override existed and was removed.
    pub fn remove(&self, user_id: &str, experiment_key: &str) -> bool {
        self.map
            .remove(&(user_id.to_string(), experiment_key.to_string()))
            .is_some()
    }

    pub fn get(&self, user_id: &str, experiment_key: &str) -> Option<String> {
        self.map
            .get(&(user_id.to_string(), experiment_key.to_string()))
            .map(|v| v.clone())
    }
}

/// Project config as served by the describe endpoints.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    pub revision: String,
    pub flags: Vec<FlagSummary>,
    pub events: Vec<EventSummary>,
    pub experiments: Vec<ExperimentSummary>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagSummary {
    pub key: String,
    pub enabled: bool,
    pub rule_key: String,
    pub variation_key: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSummary {
    pub key: String,
    pub id: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentSummary {
    pub key: String,
    pub variations: Vec<String>,
}

/// The evaluator seam.  Decide/track/describe are synchronous over in-memory
/// state; segment and ODP traffic is async.
#[async_trait]
pub trait DecisionClient: Send + Sync {
    fn decide(
        &self,
        user: &UserContext,
        flag_key: &str,
        options: &[DecideOption],
    ) -> Result<Decision, CoreError>;

    fn decide_all(&self, user: &UserContext, options: &[DecideOption]) -> Vec<Decision>;

    fn track(
        &self,
        user: &UserContext,
        event_key: &str,
        tags: Option<serde_json::Map<String, Value>>,
    ) -> Result<(), CoreError>;

    fn project_config(&self) -> ProjectConfig;

    /// Raw datafile JSON as last fetched.
    fn datafile(&self) -> String;

    async fn fetch_segments(&self, user: &UserContext) -> Result<Vec<String>, CoreError>;

    async fn send_odp_event(&self, payload: Value) -> Result<(), CoreError>;

    /// Immediate datafile refetch outside the polling schedule.
    async fn update_config(&self) -> Result<(), CoreError>;

    fn close(&self);
}

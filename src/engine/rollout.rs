//! Bundled reference evaluator.  Serves decisions straight from the polled
//! datafile (flags are 100% rollouts), queues impression and conversion
//! events for the outbound sink, and publishes notifications to the
//! handle's hub.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::engine::datafile::{Datafile, DatafileFetcher};
use crate::engine::{
    DecideOption, Decision, DecisionClient, EventSummary, ExperimentSummary, FlagSummary,
    ForcedVariations, Notification, NotificationType, ProjectConfig, UserContext,
};
use crate::error::CoreError;
use crate::notifier::HubHandle;

struct Snapshot {
    raw: String,
    datafile: Datafile,
}

/// Outbound event queue.  Fire-and-forget: a failed flush is logged and
/// the batch dropped.
struct EventSink {
    url: String,
    http: reqwest::Client,
    queue: Mutex<VecDeque<Value>>,
    batch_size: usize,
}

impl EventSink {
    fn new(url: String, batch_size: usize) -> Self {
        Self {
            url,
            http: reqwest::Client::new(),
            queue: Mutex::new(VecDeque::new()),
            batch_size: batch_size.max(1),
        }
    }

    fn enqueue(&self, event: Value) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back(event);
    }

    async fn flush(&self) {
        if self.url.is_empty() {
            return;
        }
        loop {
            let batch: Vec<Value> = {
                let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
                let take = self.batch_size.min(queue.len());
                queue.drain(..take).collect()
            };
            if batch.is_empty() {
                return;
            }
            let result = self
                .http
                .post(&self.url)
                .json(&serde_json::json!({ "events": batch }))
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => {
                    tracing::warn!(status = %resp.status(), dropped = batch.len(), "event flush rejected");
                }
                Err(e) => {
                    tracing::warn!(error = %e, dropped = batch.len(), "event flush failed");
                }
            }
        }
    }
}

pub struct RolloutEngine {
    fetcher: DatafileFetcher,
    state: RwLock<Snapshot>,
    forced: Arc<ForcedVariations>,
    hub: HubHandle,
    sink: Arc<EventSink>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RolloutEngine {
    /// Initial fetch happens here; a failure is a construction error and
    /// nothing is cached.
    pub async fn start(
        sdk_key: &str,
        cfg: &ClientConfig,
        forced: Arc<ForcedVariations>,
        hub: HubHandle,
    ) -> Result<Arc<Self>, CoreError> {
        let fetcher = DatafileFetcher::new(&cfg.datafile_url_template, sdk_key);
        let (raw, datafile) = fetcher.fetch().await?;
        let engine = Arc::new(Self {
            fetcher,
            state: RwLock::new(Snapshot { raw, datafile }),
            forced,
            hub,
            sink: Arc::new(EventSink::new(cfg.event_url.clone(), cfg.batch_size)),
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();
        let poll_every = cfg.polling_interval.as_duration();
        if poll_every > Duration::ZERO {
            let poller = Arc::clone(&engine);
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(poll_every);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    if let Err(e) = poller.update_config().await {
                        tracing::warn!(error = %e, "datafile poll failed");
                    }
                }
            }));
        }
        let flush_every = cfg.flush_interval.as_duration();
        if flush_every > Duration::ZERO {
            let sink = Arc::clone(&engine.sink);
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(flush_every);
                loop {
                    tick.tick().await;
                    sink.flush().await;
                }
            }));
        }
        *engine.tasks.lock().unwrap_or_else(|e| e.into_inner()) = tasks;
        Ok(engine)
    }

    fn evaluate(
        &self,
        user: &UserContext,
        flag_key: &str,
        options: &[DecideOption],
    ) -> Decision {
        let include_reasons = options.contains(&DecideOption::IncludeReasons);
        let mut reasons = Vec::new();

        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let flag = state.datafile.flags.iter().find(|f| f.key == flag_key);

        let (enabled, rule_key, variation_key) = match flag {
            Some(flag) => match self.forced.get(&user.user_id, flag_key) {
                Some(forced) => {
                    if include_reasons {
                        reasons.push(format!(
                            "Variation ({forced}) is mapped to flag ({flag_key}) and user ({}) in the forced decision map.",
                            user.user_id
                        ));
                    }
                    (forced != "off", flag.rule_key.clone(), forced)
                }
                None => {
                    if include_reasons {
                        reasons.push(format!(
                            "User ({}) bucketed into rule ({}).",
                            user.user_id, flag.rule_key
                        ));
                    }
                    (flag.enabled, flag.rule_key.clone(), flag.variation_key.clone())
                }
            },
            None => {
                if include_reasons {
                    reasons.push(format!("No flag was found for key \"{flag_key}\"."));
                }
                (false, String::new(), String::new())
            }
        };

        Decision {
            user_context: user.clone(),
            flag_key: flag_key.to_string(),
            rule_key,
            enabled,
            variation_key,
            reasons,
        }
    }

    fn record_decision(&self, decision: &Decision, options: &[DecideOption]) {
        if !options.contains(&DecideOption::DisableDecisionEvent) {
            self.sink.enqueue(serde_json::json!({
                "type": "impression",
                "userId": decision.user_context.user_id,
                "flagKey": decision.flag_key,
                "variationKey": decision.variation_key,
                "enabled": decision.enabled,
            }));
        }
        self.hub.publish(Notification::new(
            NotificationType::Decision,
            serde_json::json!({
                "type": "flag",
                "userId": decision.user_context.user_id,
                "attributes": decision.user_context.attributes,
                "decisionInfo": {
                    "flagKey": decision.flag_key,
                    "ruleKey": decision.rule_key,
                    "enabled": decision.enabled,
                    "variationKey": decision.variation_key,
                },
            }),
        ));
    }
}

#[async_trait]
impl DecisionClient for RolloutEngine {
    fn decide(
        &self,
        user: &UserContext,
        flag_key: &str,
        options: &[DecideOption],
    ) -> Result<Decision, CoreError> {
        let decision = self.evaluate(user, flag_key, options);
        self.record_decision(&decision, options);
        Ok(decision)
    }

    fn decide_all(&self, user: &UserContext, options: &[DecideOption]) -> Vec<Decision> {
        let keys: Vec<String> = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            state.datafile.flags.iter().map(|f| f.key.clone()).collect()
        };
        let enabled_only = options.contains(&DecideOption::EnabledFlagsOnly);
        let mut decisions = Vec::new();
        for key in keys {
            let decision = self.evaluate(user, &key, options);
            if enabled_only && !decision.enabled {
                continue;
            }
            self.record_decision(&decision, options);
            decisions.push(decision);
        }
        decisions
    }

    fn track(
        &self,
        user: &UserContext,
        event_key: &str,
        tags: Option<serde_json::Map<String, Value>>,
    ) -> Result<(), CoreError> {
        {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            if !state.datafile.events.iter().any(|e| e.key == event_key) {
                // An event the datafile does not carry is dropped, not
                // refused.
                tracing::info!(event_key = %event_key, "track for unknown event ignored");
                return Ok(());
            }
        }
        let tags = tags.unwrap_or_default();
        self.sink.enqueue(serde_json::json!({
            "type": "conversion",
            "userId": user.user_id,
            "eventKey": event_key,
            "eventTags": tags,
        }));
        self.hub.publish(Notification::new(
            NotificationType::Track,
            serde_json::json!({
                "eventKey": event_key,
                "userId": user.user_id,
                "attributes": user.attributes,
                "eventTags": tags,
            }),
        ));
        Ok(())
    }

    fn project_config(&self) -> ProjectConfig {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        ProjectConfig {
            revision: state.datafile.revision.clone(),
            flags: state
                .datafile
                .flags
                .iter()
                .map(|f| FlagSummary {
                    key: f.key.clone(),
                    enabled: f.enabled,
                    rule_key: f.rule_key.clone(),
                    variation_key: f.variation_key.clone(),
                })
                .collect(),
            events: state
                .datafile
                .events
                .iter()
                .map(|e| EventSummary {
                    key: e.key.clone(),
                    id: e.id.clone(),
                })
                .collect(),
            experiments: state
                .datafile
                .experiments
                .iter()
                .map(|x| ExperimentSummary {
                    key: x.key.clone(),
                    variations: x.variations.clone(),
                })
                .collect(),
        }
    }

    fn datafile(&self) -> String {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .raw
            .clone()
    }

    async fn fetch_segments(&self, user: &UserContext) -> Result<Vec<String>, CoreError> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let _ = user;
        Ok(state.datafile.segments.clone())
    }

    async fn send_odp_event(&self, payload: Value) -> Result<(), CoreError> {
        if !payload.is_object() {
            return Err(CoreError::malformed("ODP event must be a JSON object"));
        }
        self.sink.enqueue(serde_json::json!({
            "type": "odp",
            "payload": payload,
        }));
        Ok(())
    }

    async fn update_config(&self) -> Result<(), CoreError> {
        let (raw, datafile) = self.fetcher.fetch().await?;
        let changed = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            let changed = state.datafile.revision != datafile.revision;
            state.raw = raw;
            state.datafile = datafile;
            changed
        };
        if changed {
            let revision = {
                let state = self.state.read().unwrap_or_else(|e| e.into_inner());
                state.datafile.revision.clone()
            };
            self.hub.publish(Notification::new(
                NotificationType::ProjectConfigUpdate,
                serde_json::json!({ "type": "datafile", "revision": revision }),
            ));
        }
        Ok(())
    }

    fn close(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = r#"{
        "revision": "1",
        "flags": [
            {"key": "flag1", "enabled": true, "ruleKey": "rollout-1", "variationKey": "on"}
        ],
        "events": [{"key": "purchase", "id": "e1"}]
    }"#;

    fn engine() -> Arc<RolloutEngine> {
        let datafile = Datafile::parse(RAW).unwrap();
        Arc::new(RolloutEngine {
            fetcher: DatafileFetcher::new("http://127.0.0.1:1/{}.json", "k"),
            state: RwLock::new(Snapshot {
                raw: RAW.to_string(),
                datafile,
            }),
            forced: ForcedVariations::new(),
            hub: HubHandle::spawn(),
            sink: Arc::new(EventSink::new(String::new(), 10)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn queued(engine: &RolloutEngine) -> usize {
        engine.sink.queue.lock().unwrap().len()
    }

    #[tokio::test]
    async fn unknown_event_track_is_a_noop() {
        let engine = engine();
        let user = UserContext::new("u1");
        engine.track(&user, "not-in-datafile", None).unwrap();
        assert_eq!(queued(&engine), 0);
        engine.track(&user, "purchase", None).unwrap();
        assert_eq!(queued(&engine), 1);
    }

    #[tokio::test]
    async fn disable_decision_event_suppresses_impressions() {
        let engine = engine();
        let user = UserContext::new("u1");
        engine
            .decide(&user, "flag1", &[DecideOption::DisableDecisionEvent])
            .unwrap();
        assert_eq!(queued(&engine), 0);
        engine.decide(&user, "flag1", &[]).unwrap();
        assert_eq!(queued(&engine), 1);
    }
}

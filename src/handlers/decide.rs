//! Decision endpoints: decide, activate, qualified segments and outbound
//! ODP events.

use axum::extract::rejection::JsonRejection;
use axum::extract::RawQuery;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::engine::{parse_decide_options, parse_segment_options, DecideOption, UserContext};
use crate::error::CoreError;
use crate::handlers::UserBody;
use crate::middleware::ClientCtx;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecideBody {
    #[serde(flatten)]
    pub user: UserBody,
    #[serde(default)]
    pub decide_options: Vec<String>,
    #[serde(default)]
    pub fetch_segments: bool,
    #[serde(default)]
    pub fetch_segments_options: Vec<String>,
}

pub(crate) fn require_json<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, CoreError> {
    body.map(|Json(inner)| inner)
        .map_err(|e| CoreError::malformed(e.body_text()))
}

pub(crate) fn user_context(user: &UserBody) -> Result<UserContext, CoreError> {
    if user.user_id.is_empty() {
        return Err(CoreError::malformed("userId is required"));
    }
    Ok(UserContext {
        user_id: user.user_id.clone(),
        attributes: user.user_attributes.clone(),
    })
}

/// Values of a repeated query parameter; each value may itself be a
/// comma-separated list.
pub(crate) fn query_values(query: &Option<String>, name: &str) -> Vec<String> {
    let raw = query.as_deref().unwrap_or("");
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(raw).unwrap_or_default();
    pairs
        .into_iter()
        .filter(|(k, _)| k == name)
        .flat_map(|(_, v)| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

/// `POST /v1/decide?keys=...` - one key yields a single decision object,
/// several (or none, meaning all flags) yield an array.
pub async fn decide(
    ctx: ClientCtx,
    RawQuery(query): RawQuery,
    body: Result<Json<DecideBody>, JsonRejection>,
) -> Result<Response, CoreError> {
    let body = require_json(body)?;
    let user = user_context(&body.user)?;
    let options = parse_decide_options(&body.decide_options)?;

    if body.fetch_segments {
        let segment_options = parse_segment_options(&body.fetch_segments_options);
        ctx.client.fetch_segments(&user, &segment_options).await?;
    }

    let keys = query_values(&query, "keys");
    match keys.len() {
        0 => Ok(Json(ctx.client.decide_all(&user, &options)).into_response()),
        1 => {
            let decision = ctx.client.decide(&user, &keys[0], &options)?;
            Ok(Json(decision).into_response())
        }
        _ => {
            let decisions = ctx.client.decide_for_keys(&user, &keys, &options)?;
            Ok(Json(decisions).into_response())
        }
    }
}

/// First value of a boolean query parameter; anything but `true` is false.
pub(crate) fn bool_param(query: &Option<String>, name: &str) -> Option<bool> {
    query_values(query, name).first().map(|v| v == "true")
}

/// `POST /v1/activate?type=feature|experiment&featureKey=...&experimentKey=...`
/// with optional `enabled=true|false` filtering and `disableTracking=true`
/// to suppress impression dispatch.
pub async fn activate(
    ctx: ClientCtx,
    RawQuery(query): RawQuery,
    body: Result<Json<DecideBody>, JsonRejection>,
) -> Result<Response, CoreError> {
    let body = require_json(body)?;
    let user = user_context(&body.user)?;
    let mut options = parse_decide_options(&body.decide_options)?;
    if bool_param(&query, "disableTracking").unwrap_or(false)
        && !options.contains(&DecideOption::DisableDecisionEvent)
    {
        options.push(DecideOption::DisableDecisionEvent);
    }
    let enabled_filter = bool_param(&query, "enabled");

    let kinds = query_values(&query, "type");
    let kind = kinds
        .first()
        .map(String::as_str)
        .ok_or_else(|| CoreError::malformed("type query parameter is required"))?;

    let mut results = Vec::new();
    match kind {
        "feature" => {
            let keys = query_values(&query, "featureKey");
            if keys.is_empty() {
                return Err(CoreError::malformed("featureKey query parameter is required"));
            }
            for key in &keys {
                let decision = ctx.client.decide(&user, key, &options)?;
                if enabled_filter.is_some_and(|want| decision.enabled != want) {
                    continue;
                }
                results.push(serde_json::json!({
                    "type": "feature",
                    "featureKey": key,
                    "enabled": decision.enabled,
                    "variationKey": decision.variation_key,
                    "userId": user.user_id,
                }));
            }
        }
        "experiment" => {
            let keys = query_values(&query, "experimentKey");
            if keys.is_empty() {
                return Err(CoreError::malformed(
                    "experimentKey query parameter is required",
                ));
            }
            let config = ctx.client.project_config();
            for key in &keys {
                let experiment = config
                    .experiments
                    .iter()
                    .find(|x| &x.key == key)
                    .ok_or_else(|| {
                        CoreError::NotFound(format!("experiment with key {key} not found"))
                    })?;
                let variation = ctx
                    .client
                    .forced_variation(&user.user_id, key)
                    .or_else(|| experiment.variations.first().cloned())
                    .unwrap_or_default();
                let enabled = !variation.is_empty();
                if enabled_filter.is_some_and(|want| enabled != want) {
                    continue;
                }
                results.push(serde_json::json!({
                    "type": "experiment",
                    "experimentKey": key,
                    "enabled": enabled,
                    "variationKey": variation,
                    "userId": user.user_id,
                }));
            }
        }
        other => {
            return Err(CoreError::malformed(format!(
                "invalid type query parameter: {other}"
            )))
        }
    }
    Ok(Json(results).into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentsBody {
    #[serde(flatten)]
    pub user: UserBody,
    #[serde(default)]
    pub fetch_segments_options: Vec<String>,
}

/// `POST /v1/fetch-qualified-segments` - qualified segments for a user, honoring the
/// cache options.
pub async fn segments(
    ctx: ClientCtx,
    body: Result<Json<SegmentsBody>, JsonRejection>,
) -> Result<Response, CoreError> {
    let body = require_json(body)?;
    let user = user_context(&body.user)?;
    let options = parse_segment_options(&body.fetch_segments_options);
    let segments = ctx.client.fetch_segments(&user, &options).await?;
    Ok(Json(serde_json::json!({
        "userId": user.user_id,
        "segments": segments,
    }))
    .into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct OdpEventBody {
    #[serde(default)]
    pub action: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub identifiers: serde_json::Map<String, Value>,
    #[serde(default)]
    pub data: serde_json::Map<String, Value>,
}

/// `POST /v1/send-odp-event` - `action` and at least one identifier are
/// required.
pub async fn send_odp_event(
    ctx: ClientCtx,
    body: Result<Json<OdpEventBody>, JsonRejection>,
) -> Result<Response, CoreError> {
    let body = require_json(body)?;
    if body.action.is_empty() {
        return Err(CoreError::malformed("action is required"));
    }
    if body.identifiers.is_empty() {
        return Err(CoreError::malformed("identifiers cannot be empty"));
    }
    ctx.client
        .send_odp_event(serde_json::json!({
            "action": body.action,
            "type": body.kind,
            "identifiers": body.identifiers,
            "data": body.data,
        }))
        .await?;
    Ok(Json(serde_json::json!({"success": true})).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_values_split_repeats_and_commas() {
        let query = Some("keys=a,b&keys=c&other=x".to_string());
        assert_eq!(query_values(&query, "keys"), vec!["a", "b", "c"]);
        assert!(query_values(&None, "keys").is_empty());
    }

    #[test]
    fn bool_params_are_true_only_when_literal_true() {
        let query = Some("disableTracking=true&enabled=false".to_string());
        assert_eq!(bool_param(&query, "disableTracking"), Some(true));
        assert_eq!(bool_param(&query, "enabled"), Some(false));
        assert_eq!(bool_param(&query, "missing"), None);
    }

    #[test]
    fn decide_body_parses_flattened_user() {
        let body: DecideBody = serde_json::from_str(
            r#"{"userId":"u1","userAttributes":{"tier":"gold"},"decideOptions":["INCLUDE_REASONS"]}"#,
        )
        .unwrap();
        assert_eq!(body.user.user_id, "u1");
        assert_eq!(body.user.user_attributes["tier"], "gold");
        assert_eq!(body.decide_options, vec!["INCLUDE_REASONS"]);
        assert!(!body.fetch_segments);
    }
}

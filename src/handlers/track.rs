//! Conversion tracking.

use axum::extract::rejection::JsonRejection;
use axum::extract::RawQuery;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::error::CoreError;
use crate::handlers::decide::{query_values, require_json, user_context};
use crate::handlers::UserBody;
use crate::middleware::ClientCtx;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackBody {
    #[serde(flatten)]
    pub user: UserBody,
    #[serde(default)]
    pub event_tags: Option<serde_json::Map<String, serde_json::Value>>,
}

/// `POST /v1/track?eventKey=...` - 204 on success.  An event key the
/// datafile does not carry is dropped with a log line, still 204.
pub async fn track(
    ctx: ClientCtx,
    RawQuery(query): RawQuery,
    body: Result<Json<TrackBody>, JsonRejection>,
) -> Result<StatusCode, CoreError> {
    let event_keys = query_values(&query, "eventKey");
    let event_key = event_keys
        .first()
        .ok_or_else(|| CoreError::malformed("eventKey query parameter is required"))?;
    let body = require_json(body)?;
    let user = user_context(&body.user)?;
    ctx.client.track(&user, event_key, body.event_tags)?;
    Ok(StatusCode::NO_CONTENT)
}

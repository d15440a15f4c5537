//! User-profile endpoints over the configured profile store.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::error::CoreError;
use crate::handlers::decide::require_json;
use crate::middleware::ClientCtx;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupBody {
    #[serde(default)]
    pub user_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveBody {
    #[serde(default)]
    pub user_id: String,
    /// Opaque profile document; an empty object clears the stored profile.
    #[serde(default)]
    pub experiment_bucket_map: Value,
}

/// `POST /v1/lookup`
pub async fn lookup(
    ctx: ClientCtx,
    body: Result<Json<LookupBody>, JsonRejection>,
) -> Result<Response, CoreError> {
    let body = require_json(body)?;
    if body.user_id.is_empty() {
        return Err(CoreError::malformed("userId is required"));
    }
    let profile = ctx.client.lookup_profile(&body.user_id).await?;
    Ok(Json(serde_json::json!({
        "userId": body.user_id,
        "experimentBucketMap": profile.unwrap_or(Value::Null),
    }))
    .into_response())
}

/// `POST /v1/save`
pub async fn save(
    ctx: ClientCtx,
    body: Result<Json<SaveBody>, JsonRejection>,
) -> Result<StatusCode, CoreError> {
    let body = require_json(body)?;
    if body.user_id.is_empty() {
        return Err(CoreError::malformed("userId is required"));
    }
    ctx.client
        .save_profile(&body.user_id, body.experiment_bucket_map)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

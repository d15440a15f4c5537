//! Forced-variation overrides.  Disabled deployments refuse the endpoint
//! outright.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use crate::client::OverrideOutcome;
use crate::error::CoreError;
use crate::handlers::decide::require_json;
use crate::middleware::ClientCtx;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideBody {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub experiment_key: String,
    /// Empty removes an existing override.
    #[serde(default)]
    pub variation_key: String,
}

/// `POST /v1/override` - 201 when the mapping changed, 204 when it did
/// not (including removals).
pub async fn set_override(
    State(state): State<AppState>,
    ctx: ClientCtx,
    body: Result<Json<OverrideBody>, JsonRejection>,
) -> Result<Response, CoreError> {
    if !state.cfg.api.enable_overrides {
        return Err(CoreError::Forbidden("overrides are disabled".to_string()));
    }
    let body = require_json(body)?;
    if body.user_id.is_empty() {
        return Err(CoreError::malformed("userId is required"));
    }
    if body.experiment_key.is_empty() {
        return Err(CoreError::malformed("experimentKey is required"));
    }

    let outcome =
        ctx.client
            .apply_override(&body.user_id, &body.experiment_key, &body.variation_key);
    match outcome {
        OverrideOutcome::Set => Ok((
            StatusCode::CREATED,
            Json(serde_json::json!({
                "userId": body.user_id,
                "experimentKey": body.experiment_key,
                "variationKey": body.variation_key,
            })),
        )
            .into_response()),
        OverrideOutcome::Unchanged | OverrideOutcome::Removed | OverrideOutcome::Absent => {
            Ok(StatusCode::NO_CONTENT.into_response())
        }
    }
}

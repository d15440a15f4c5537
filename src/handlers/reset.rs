//! Tenant reset: rebuild the handle for one SDK key.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::CoreError;
use crate::middleware::SDK_KEY_HEADER;
use crate::AppState;

/// `POST /v1/reset` - swaps in a freshly built handle; open notification
/// streams on the old handle end.
pub async fn reset(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, CoreError> {
    let sdk_key = headers
        .get(SDK_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CoreError::malformed("missing required X-Optimizely-SDK-Key header"))?;
    state.registry.reset_client(sdk_key).await?;
    Ok(Json(serde_json::json!({"sdkKey": sdk_key, "reset": true})).into_response())
}

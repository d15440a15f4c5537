//! Read-only project views.

use axum::extract::Path;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::CoreError;
use crate::middleware::ClientCtx;

/// `GET /v1/config`
pub async fn project_config(ctx: ClientCtx) -> Result<Response, CoreError> {
    Ok(Json(ctx.client.project_config()).into_response())
}

/// `GET /v1/experiments/:experimentKey` - 404 for a key the project does
/// not carry.
pub async fn experiment(
    ctx: ClientCtx,
    Path(key): Path<String>,
) -> Result<Response, CoreError> {
    let config = ctx.client.project_config();
    let experiment = config
        .experiments
        .iter()
        .find(|x| x.key == key)
        .ok_or_else(|| CoreError::NotFound(format!("experiment with key {key} not found")))?;
    Ok(Json(experiment.clone()).into_response())
}

/// `GET /v1/features/:featureKey`
pub async fn feature(ctx: ClientCtx, Path(key): Path<String>) -> Result<Response, CoreError> {
    let config = ctx.client.project_config();
    let flag = config
        .flags
        .iter()
        .find(|f| f.key == key)
        .ok_or_else(|| CoreError::NotFound(format!("feature with key {key} not found")))?;
    Ok(Json(flag.clone()).into_response())
}

/// `GET /v1/datafile` - the raw datafile as last fetched.
pub async fn datafile(ctx: ClientCtx) -> Result<Response, CoreError> {
    Ok((
        [(header::CONTENT_TYPE, "application/json")],
        ctx.client.datafile(),
    )
        .into_response())
}

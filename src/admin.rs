//! Admin listener: health, build info, redacted config echo and metrics.

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::AppState;

/// Stamps build metadata on every admin response.
pub async fn stamp_headers(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    for (name, value) in [
        ("app-name", state.cfg.admin.name.as_str()),
        ("app-version", state.cfg.admin.version.as_str()),
        ("author", state.cfg.admin.author.as_str()),
    ] {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(name, value);
        }
    }
    resp
}

/// `GET /health`
pub async fn health() -> Response {
    Json(serde_json::json!({"status": "ok"})).into_response()
}

/// `GET /info`
pub async fn info(State(state): State<AppState>) -> Response {
    let uptime = chrono::Utc::now() - state.started_at;
    Json(serde_json::json!({
        "name": state.cfg.admin.name,
        "version": state.cfg.admin.version,
        "author": state.cfg.admin.author,
        "uptime": format!("{}s", uptime.num_seconds()),
        "sdkKeys": state.registry.live_keys(),
    }))
    .into_response()
}

/// `GET /config` - the live configuration with every secret blanked.
pub async fn config(State(state): State<AppState>) -> Response {
    Json(state.cfg.redacted()).into_response()
}

/// `GET /metrics` - Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}

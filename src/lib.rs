//! flagrelay: a multi-tenant sidecar fronting a feature-flag and
//! experimentation engine.  Three listeners share one [`AppState`]: the
//! API surface, the admin surface and the upstream webhook receiver.

pub mod admin;
pub mod auth;
pub mod batch;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod notifier;
pub mod plugins;
pub mod registry;
pub mod sync;
pub mod webhook;

use std::sync::Arc;

use axum::error_handling::HandleErrorLayer;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{BoxError, Json, Router};
use tower::limit::ConcurrencyLimitLayer;
use tower::load_shed::LoadShedLayer;
use tower::timeout::TimeoutLayer;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;

use crate::auth::{TokenIssuer, Verifier};
use crate::batch::BatchService;
use crate::config::AgentConfig;
use crate::error::CoreError;
use crate::metrics::Metrics;
use crate::middleware::overloaded_response;
use crate::registry::ClientRegistry;
use crate::sync::SyncBridge;

const MAX_REQUEST_BODY_BYTES: usize = 1 << 20;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<AgentConfig>,
    pub registry: Arc<ClientRegistry>,
    pub metrics: Arc<Metrics>,
    pub api_verifier: Arc<Verifier>,
    pub admin_verifier: Arc<Verifier>,
    pub api_issuer: Arc<TokenIssuer>,
    pub admin_issuer: Arc<TokenIssuer>,
    pub sync: Option<Arc<SyncBridge>>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Wires the registry, sync bridge and auth material.  Must run inside a
/// tokio runtime (the sync receiver spawns).
pub fn build_state(cfg: AgentConfig) -> Result<AppState, CoreError> {
    let sync = SyncBridge::from_config(&cfg.sync);
    let registry = Arc::new(ClientRegistry::new(cfg.client.clone(), sync.clone())?);
    if let Some(sync) = &sync {
        sync.start_datafile_receiver(Arc::clone(&registry));
    }
    Ok(AppState {
        api_verifier: Arc::new(Verifier::from_config(&cfg.api.auth)),
        admin_verifier: Arc::new(Verifier::from_config(&cfg.admin.auth)),
        api_issuer: Arc::new(TokenIssuer::new(&cfg.api.auth)),
        admin_issuer: Arc::new(TokenIssuer::new(&cfg.admin.auth)),
        cfg: Arc::new(cfg),
        registry,
        metrics: Arc::new(Metrics::default()),
        sync,
        started_at: chrono::Utc::now(),
    })
}

async fn timeout_error(err: BoxError) -> axum::response::Response {
    if err.is::<tower::timeout::error::Elapsed>() {
        (
            StatusCode::REQUEST_TIMEOUT,
            Json(serde_json::json!({"error": "request timed out"})),
        )
            .into_response()
    } else {
        CoreError::internal(err.to_string()).into_response()
    }
}

async fn shed_error(_err: BoxError) -> axum::response::Response {
    overloaded_response()
}

/// The API router.  The batch dispatcher wraps this whole service, so
/// sub-operations re-enter the complete middleware chain.
pub fn api_router(state: AppState) -> Router {
    // Streaming is exempt from the request timeout and carries its own
    // connection cap.
    let mut stream = get(handlers::stream::event_stream);
    if state.cfg.api.max_conns > 0 {
        stream = stream.layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(shed_error))
                .layer(LoadShedLayer::new())
                .layer(ConcurrencyLimitLayer::new(state.cfg.api.max_conns)),
        );
    }

    let timeout = state.cfg.server.write_timeout.as_duration();
    let mut v1 = Router::new()
        .route("/decide", post(handlers::decide::decide))
        .route("/activate", post(handlers::decide::activate))
        .route("/track", post(handlers::track::track))
        .route("/config", get(handlers::describe::project_config))
        .route("/datafile", get(handlers::describe::datafile))
        .route(
            "/experiments/:experimentKey",
            get(handlers::describe::experiment),
        )
        .route("/features/:featureKey", get(handlers::describe::feature))
        .route("/override", post(handlers::overrides::set_override))
        .route("/lookup", post(handlers::profile::lookup))
        .route("/save", post(handlers::profile::save))
        .route("/fetch-qualified-segments", post(handlers::decide::segments))
        .route("/send-odp-event", post(handlers::decide::send_odp_event))
        .route("/reset", post(handlers::reset::reset));
    if timeout > std::time::Duration::ZERO {
        v1 = v1.layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(timeout_error))
                .layer(TimeoutLayer::new(timeout)),
        );
    }
    let v1 = v1
        .route("/notifications/event-stream", stream)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::api_auth,
        ));

    Router::new()
        .route("/oauth/token", post(handlers::api_token))
        .nest("/v1", v1)
        .layer(
            ServiceBuilder::new()
                .layer(CatchPanicLayer::new())
                .layer(axum::middleware::from_fn(middleware::request_id))
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    middleware::allowed_hosts,
                ))
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    middleware::track_metrics,
                ))
                .layer(CorsLayer::permissive())
                .layer(axum::extract::DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES)),
        )
        .with_state(state)
}

/// API router wrapped with the batch dispatcher; this is what the API
/// listener serves.
pub fn api_service(state: AppState) -> BatchService<Router> {
    let limit = state.cfg.api.operations_limit;
    BatchService::new(api_router(state), limit)
}

pub fn admin_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/info", get(admin::info))
        .route("/config", get(admin::config))
        .route("/metrics", get(admin::metrics))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::admin_auth,
        ));

    Router::new()
        .route("/health", get(admin::health))
        .route("/oauth/token", post(handlers::admin_token))
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(CatchPanicLayer::new())
                .layer(axum::middleware::from_fn(middleware::request_id))
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    admin::stamp_headers,
                )),
        )
        .with_state(state)
}

pub fn webhook_router(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/optimizely", post(webhook::handle_webhook))
        .layer(
            ServiceBuilder::new()
                .layer(CatchPanicLayer::new())
                .layer(axum::middleware::from_fn(middleware::request_id)),
        )
        .with_state(state)
}

//! Shared test harness: a stub CDN for datafiles and a fully wired app on
//! ephemeral ports.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use flagrelay::config::AgentConfig;
use flagrelay::{admin_router, api_service, build_state, webhook_router, AppState};

/// Serves datafiles the way the upstream CDN would; bodies and statuses
/// are settable per SDK key.
#[derive(Clone, Default)]
pub struct StubCdn {
    files: Arc<RwLock<HashMap<String, (u16, String)>>>,
    hits: Arc<AtomicU64>,
}

impl StubCdn {
    pub fn set(&self, sdk_key: &str, body: &str) {
        self.files
            .write()
            .unwrap()
            .insert(sdk_key.to_string(), (200, body.to_string()));
    }

    pub fn set_status(&self, sdk_key: &str, status: u16) {
        self.files
            .write()
            .unwrap()
            .insert(sdk_key.to_string(), (status, String::new()));
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::SeqCst)
    }

    async fn serve(State(cdn): State<StubCdn>, Path(file): Path<String>) -> Response {
        cdn.hits.fetch_add(1, Ordering::SeqCst);
        let key = file.trim_end_matches(".json");
        match cdn.files.read().unwrap().get(key) {
            Some((status, body)) => (
                StatusCode::from_u16(*status).unwrap(),
                body.clone(),
            )
                .into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        }
    }
}

/// Starts the stub CDN and returns it with a datafile URL template
/// pointing at it.
pub async fn spawn_cdn() -> (StubCdn, String) {
    let cdn = StubCdn::default();
    let router = Router::new()
        .route("/datafiles/:file", get(StubCdn::serve))
        .with_state(cdn.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router.into_make_service()).await.unwrap();
    });
    let template = format!("http://{addr}/datafiles/{{}}.json");
    (cdn, template)
}

pub fn sample_datafile() -> String {
    serde_json::json!({
        "revision": "1",
        "flags": [
            {"key": "flag1", "enabled": true, "ruleKey": "rollout-1", "variationKey": "on"},
            {"key": "flag2", "enabled": false, "ruleKey": "rollout-2", "variationKey": "off"}
        ],
        "events": [{"key": "purchase", "id": "e1"}],
        "experiments": [{"key": "exp1", "variations": ["variation_a", "variation_b"]}],
        "segments": ["seg-a", "seg-b"]
    })
    .to_string()
}

pub struct TestApp {
    pub http: reqwest::Client,
    pub api: String,
    pub admin: String,
    pub webhook: String,
    pub cdn: StubCdn,
    pub state: AppState,
}

impl TestApp {
    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.api, path)
    }

    pub fn admin_url(&self, path: &str) -> String {
        format!("{}{}", self.admin, path)
    }

    pub fn webhook_url(&self, path: &str) -> String {
        format!("{}{}", self.webhook, path)
    }
}

/// Boots the full app against the stub CDN.  Polling and event flushing
/// are off so tests stay deterministic; `mutate` adjusts the rest.
pub async fn spawn_app(mutate: impl FnOnce(&mut AgentConfig)) -> TestApp {
    let (cdn, template) = spawn_cdn().await;
    cdn.set("key1", &sample_datafile());

    let mut cfg = AgentConfig::default();
    cfg.client.datafile_url_template = template;
    cfg.client.polling_interval = flagrelay::config::ConfigDuration::from_secs(0);
    cfg.client.flush_interval = flagrelay::config::ConfigDuration::from_secs(0);
    cfg.client.event_url = String::new();
    mutate(&mut cfg);

    let state = build_state(cfg).unwrap();

    let api_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let api = format!("http://{}", api_listener.local_addr().unwrap());
    let api_svc = axum::ServiceExt::into_make_service(api_service(state.clone()));
    tokio::spawn(async move {
        axum::serve(api_listener, api_svc).await.unwrap();
    });

    let admin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let admin = format!("http://{}", admin_listener.local_addr().unwrap());
    let admin_svc = admin_router(state.clone()).into_make_service();
    tokio::spawn(async move {
        axum::serve(admin_listener, admin_svc).await.unwrap();
    });

    let webhook_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let webhook = format!("http://{}", webhook_listener.local_addr().unwrap());
    let webhook_svc = webhook_router(state.clone()).into_make_service();
    tokio::spawn(async move {
        axum::serve(webhook_listener, webhook_svc).await.unwrap();
    });

    TestApp {
        http: reqwest::Client::new(),
        api,
        admin,
        webhook,
        cdn,
        state,
    }
}

//! Upstream configuration webhook.  Signature verification happens before
//! any state changes; an unknown project is acknowledged without action so
//! the sender does not retry.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;
use subtle::ConstantTimeEq;

use crate::AppState;

pub const SIGNATURE_HEADER: &str = "x-hub-signature";
const SIGNATURE_PREFIX: &str = "sha1=";

#[derive(Debug, Deserialize)]
struct WebhookMessage {
    project_id: i64,
    #[allow(dead_code)]
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    event: String,
}

/// `sha1=<hex hmac-sha1>` over the raw body.
pub fn compute_signature(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    let mut out = String::with_capacity(SIGNATURE_PREFIX.len() + digest.len() * 2);
    out.push_str(SIGNATURE_PREFIX);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// The header value is trimmed before comparison; compare is constant time
/// over the full `sha1=`-prefixed strings.
pub fn validate_signature(secret: &str, body: &[u8], header_value: &str) -> bool {
    let given = header_value.trim();
    let computed = compute_signature(secret, body);
    computed.as_bytes().ct_eq(given.as_bytes()).into()
}

fn bad_request(msg: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": msg })),
    )
        .into_response()
}

pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let msg: WebhookMessage = match serde_json::from_slice(&body) {
        Ok(msg) => msg,
        Err(_) => return bad_request("unable to parse webhook message"),
    };

    let project = match state.cfg.webhook.projects.get(&msg.project_id) {
        Some(project) => project.clone(),
        None => {
            tracing::warn!(project_id = msg.project_id, "no webhook configured for project");
            return StatusCode::NO_CONTENT.into_response();
        }
    };

    if !project.skip_signature_check {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !validate_signature(&project.secret, &body, signature) {
            tracing::warn!(project_id = msg.project_id, "webhook signature mismatch");
            return bad_request("computed signature does not match signature in request");
        }
    }

    tracing::info!(project_id = msg.project_id, event = %msg.event, "webhook accepted");
    for sdk_key in &project.sdk_keys {
        if let Err(e) = state.registry.update_configs(sdk_key).await {
            tracing::warn!(sdk_key = %sdk_key, error = %e, "config update failed");
        }
        if let Some(sync) = &state.sync {
            sync.publish_datafile_update(sdk_key).await;
        }
    }
    StatusCode::NO_CONTENT.into_response()
}

//! Request pipeline: request ids, host allow-listing, per-route metrics,
//! token checks and the per-request client context.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{FromRequestParts, MatchedPath, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::Instrument;

use crate::auth::{check_admin_access, check_api_access};
use crate::client::ClientHandle;
use crate::error::CoreError;
use crate::AppState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const SDK_KEY_HEADER: &str = "x-optimizely-sdk-key";
pub const UPS_NAME_HEADER: &str = "x-optimizely-ups-name";
pub const ODP_CACHE_NAME_HEADER: &str = "x-optimizely-odp-cache-name";

/// Assigns a request id when the caller did not send one, echoes it on
/// the response, and scopes a span over the rest of the pipeline so every
/// log line carries the id and the SDK key.
pub async fn request_id(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let sdk_key = req
        .headers()
        .get(SDK_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let span = tracing::info_span!(
        "request",
        method = %req.method(),
        path = %req.uri().path(),
        request_id = %id,
        sdk_key = %sdk_key,
    );
    let value = HeaderValue::from_str(&id).ok();
    async move {
        if let Some(value) = value {
            req.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
            let mut resp = next.run(req).await;
            resp.headers_mut().insert(REQUEST_ID_HEADER, value);
            resp
        } else {
            next.run(req).await
        }
    }
    .instrument(span)
    .await
}

/// Rejects requests whose effective host is not allow-listed.  The rule
/// `"."` admits every host; a rule starting with `.` matches the bare
/// domain and any subdomain; anything else is an exact match.  Ports are
/// ignored.
pub async fn allowed_hosts(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let rules = &state.cfg.api.allowed_hosts;
    let host = effective_host(req.headers());
    match host {
        Some(host) if host_allowed(rules, &host) => next.run(req).await,
        _ => CoreError::NotFound("host not allowed".to_string()).into_response(),
    }
}

/// `X-Forwarded-Host` wins, then the `host=` directive of `Forwarded`,
/// then the request's own host.
pub fn effective_host(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers
        .get("x-forwarded-host")
        .and_then(|v| v.to_str().ok())
    {
        let first = value.split(',').next().unwrap_or("").trim();
        if !first.is_empty() {
            return Some(first.to_string());
        }
    }
    if let Some(value) = headers.get("forwarded").and_then(|v| v.to_str().ok()) {
        if let Some(host) = parse_forwarded_host(value) {
            return Some(host);
        }
    }
    headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn parse_forwarded_host(value: &str) -> Option<String> {
    for part in value.split(';').flat_map(|p| p.split(',')) {
        let part = part.trim();
        if let Some(host) = part.strip_prefix("host=") {
            let host = host.trim_matches('"');
            if !host.is_empty() {
                return Some(host.to_string());
            }
        }
    }
    None
}

pub fn host_allowed(rules: &[String], host: &str) -> bool {
    let host = strip_port(host).to_ascii_lowercase();
    if host.is_empty() {
        return false;
    }
    for rule in rules {
        let rule = rule.to_ascii_lowercase();
        if rule == "." {
            return true;
        }
        if let Some(bare) = rule.strip_prefix('.') {
            if host == bare || host.ends_with(&rule) {
                return true;
            }
        } else if host == rule {
            return true;
        }
    }
    false
}

fn strip_port(host: &str) -> &str {
    // Bracketed IPv6 keeps its brackets; a bare colon means host:port.
    if let Some(end) = host.rfind(']') {
        return &host[..=end];
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Counts the request under its matched route pattern.
pub async fn track_metrics(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let start = Instant::now();
    let resp = next.run(req).await;
    state
        .metrics
        .record(&route, resp.status().as_u16(), start.elapsed());
    resp
}

/// API token check: a verified token must be scoped to the SDK key the
/// request presents.
pub async fn api_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let claims = match state.api_verifier.verify(req.headers()) {
        Ok(claims) => claims,
        Err(e) => return e.into_response(),
    };
    if let Some(claims) = claims {
        let sdk_key = req
            .headers()
            .get(SDK_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if let Err(e) = check_api_access(&claims, sdk_key) {
            return e.into_response();
        }
    }
    next.run(req).await
}

pub async fn admin_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let claims = match state.admin_verifier.verify(req.headers()) {
        Ok(claims) => claims,
        Err(e) => return e.into_response(),
    };
    if let Some(claims) = claims {
        if let Err(e) = check_admin_access(&claims) {
            return e.into_response();
        }
    }
    next.run(req).await
}

/// Per-request client context: the SDK key header resolved to its live
/// handle.  The optional plugin-name headers select the stores the handle
/// is built with.
pub struct ClientCtx {
    pub sdk_key: String,
    pub client: Arc<ClientHandle>,
}

fn header_value<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[axum::async_trait]
impl FromRequestParts<AppState> for ClientCtx {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let sdk_key = header_value(parts, SDK_KEY_HEADER).ok_or_else(|| {
            CoreError::malformed("missing required X-Optimizely-SDK-Key header").into_response()
        })?;
        let ups_name = header_value(parts, UPS_NAME_HEADER);
        let odp_name = header_value(parts, ODP_CACHE_NAME_HEADER);
        let client = state
            .registry
            .get_client(sdk_key, ups_name, odp_name)
            .await
            .map_err(IntoResponse::into_response)?;
        Ok(Self {
            sdk_key: sdk_key.to_string(),
            client,
        })
    }
}

/// 503 body for requests shed by the stream concurrency cap.
pub fn overloaded_response() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        axum::Json(serde_json::json!({"error": "too many open connections"})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn port_stripping() {
        assert_eq!(strip_port("example.com:8080"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:8080"), "[::1]");
        assert_eq!(strip_port("localhost"), "localhost");
    }

    #[test]
    fn host_rules() {
        let any = vec![".".to_string()];
        assert!(host_allowed(&any, "anything.example.com"));

        let rules = vec!["api.example.com".to_string(), ".internal.net".to_string()];
        assert!(host_allowed(&rules, "api.example.com"));
        assert!(host_allowed(&rules, "API.EXAMPLE.COM:443"));
        assert!(!host_allowed(&rules, "evil.example.com"));
        // Suffix rule admits the bare domain and subdomains.
        assert!(host_allowed(&rules, "internal.net"));
        assert!(host_allowed(&rules, "a.b.internal.net"));
        assert!(!host_allowed(&rules, "notinternal.net"));

        assert!(!host_allowed(&rules, ""));
    }

    #[test]
    fn forwarded_host_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("direct.example.com"));
        assert_eq!(
            effective_host(&headers).as_deref(),
            Some("direct.example.com")
        );

        headers.insert(
            "forwarded",
            HeaderValue::from_static("for=1.2.3.4;host=fwd.example.com;proto=https"),
        );
        assert_eq!(effective_host(&headers).as_deref(), Some("fwd.example.com"));

        headers.insert(
            "x-forwarded-host",
            HeaderValue::from_static("xfh.example.com"),
        );
        assert_eq!(effective_host(&headers).as_deref(), Some("xfh.example.com"));
    }
}

//! Batch dispatcher.  Wraps the whole API service so a `POST` to any path
//! ending in `/batch` is split into sub-operations and re-entered through
//! the full middleware chain; everything else passes through untouched.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::{to_bytes, Body};
use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower::{Service, ServiceExt};

const MAX_BATCH_BODY_BYTES: usize = 1 << 20;

#[derive(Debug, Deserialize)]
struct BatchRequest {
    #[serde(default)]
    operations: Vec<BatchOperation>,
}

#[derive(Debug, Deserialize)]
struct BatchOperation {
    #[serde(default)]
    method: String,
    #[serde(default)]
    url: String,
    #[serde(default, rename = "operationID")]
    operation_id: String,
    #[serde(default)]
    body: Value,
    #[serde(default)]
    params: HashMap<String, String>,
    #[serde(default)]
    headers: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct ResponseCollector {
    status: u16,
    #[serde(rename = "requestID")]
    request_id: String,
    #[serde(rename = "operationID")]
    operation_id: String,
    method: String,
    url: String,
    body: Value,
    #[serde(rename = "startedAt")]
    started_at: DateTime<Utc>,
    #[serde(rename = "endedAt")]
    ended_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct BatchResponse {
    #[serde(rename = "startedAt")]
    started_at: DateTime<Utc>,
    #[serde(rename = "endedAt")]
    ended_at: DateTime<Utc>,
    #[serde(rename = "errorCount")]
    error_count: usize,
    response: Vec<ResponseCollector>,
}

#[derive(Clone)]
pub struct BatchService<S> {
    inner: S,
    operations_limit: usize,
}

impl<S> BatchService<S> {
    pub fn new(inner: S, operations_limit: usize) -> Self {
        Self {
            inner,
            operations_limit: operations_limit.max(1),
        }
    }
}

impl<S> Service<Request> for BatchService<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let clone = self.inner.clone();
        // The readied service moves into the future; the clone stays behind.
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let limit = self.operations_limit;
        if req.method() == Method::POST
            && req.uri().path().to_ascii_lowercase().ends_with("/batch")
        {
            Box::pin(async move { Ok(handle_batch(inner, limit, req).await) })
        } else {
            Box::pin(async move { inner.call(req).await })
        }
    }
}

async fn handle_batch<S>(inner: S, limit: usize, req: Request) -> Response
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send,
{
    let bytes = match to_bytes(req.into_body(), MAX_BATCH_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return decode_error(),
    };
    let mut batch: BatchRequest = match serde_json::from_slice(&bytes) {
        Ok(batch) => batch,
        Err(_) => return decode_error(),
    };

    if batch.operations.len() > limit {
        tracing::info!(
            limit,
            total = batch.operations.len(),
            "too many operations, keeping the first {limit}"
        );
        batch.operations.truncate(limit);
    }

    let started_at = Utc::now();
    let mut error_count = 0;
    let mut items = Vec::with_capacity(batch.operations.len());
    for op in batch.operations {
        let item = execute_operation(inner.clone(), op).await;
        if item.status != 200 {
            error_count += 1;
        }
        items.push(item);
    }

    let body = BatchResponse {
        started_at,
        ended_at: Utc::now(),
        error_count,
        response: items,
    };
    (StatusCode::OK, Json(body)).into_response()
}

fn decode_error() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"error": "cannot decode the operation body"})),
    )
        .into_response()
}

async fn execute_operation<S>(inner: S, op: BatchOperation) -> ResponseCollector
where
    S: Service<Request, Response = Response, Error = Infallible> + Send + 'static,
    S::Future: Send,
{
    let mut col = ResponseCollector {
        status: 200,
        request_id: String::new(),
        operation_id: op.operation_id.clone(),
        method: op.method.clone(),
        url: op.url.clone(),
        body: Value::Null,
        started_at: Utc::now(),
        ended_at: Utc::now(),
    };

    // Dispatching a batch from inside a batch is refused, not recursed.
    if op.url.to_ascii_lowercase().trim_end_matches('/').ends_with("/batch") {
        col.status = 400;
        col.body = serde_json::json!({"error": "nested batch operations are not allowed"});
        col.ended_at = Utc::now();
        return col;
    }

    let sub_req = match build_request(&op) {
        Ok(req) => req,
        Err(msg) => {
            col.status = 400;
            col.body = serde_json::json!({ "error": msg });
            col.ended_at = Utc::now();
            return col;
        }
    };

    match inner.oneshot(sub_req).await {
        Ok(resp) => {
            col.status = resp.status().as_u16();
            if let Some(id) = resp
                .headers()
                .get("x-request-id")
                .and_then(|v| v.to_str().ok())
            {
                col.request_id = id.to_string();
            }
            if let Ok(bytes) = to_bytes(resp.into_body(), MAX_BATCH_BODY_BYTES).await {
                if let Ok(value) = serde_json::from_slice(&bytes) {
                    col.body = value;
                }
            }
        }
        Err(infallible) => match infallible {},
    }
    col.ended_at = Utc::now();
    col
}

fn build_request(op: &BatchOperation) -> Result<Request, String> {
    let method: Method = op
        .method
        .parse()
        .map_err(|_| format!("invalid method for operation {:?}", op.operation_id))?;

    let mut uri = op.url.clone();
    if !op.params.is_empty() {
        let query = serde_urlencoded::to_string(&op.params)
            .map_err(|_| format!("invalid params for operation {:?}", op.operation_id))?;
        uri.push(if uri.contains('?') { '&' } else { '?' });
        uri.push_str(&query);
    }

    let body = serde_json::to_vec(&op.body)
        .map_err(|_| format!("invalid body for operation {:?}", op.operation_id))?;
    let mut req = Request::builder()
        .method(method)
        .uri(&uri)
        .body(Body::from(body))
        .map_err(|_| format!("invalid url for operation {:?}", op.operation_id))?;

    for (name, value) in &op.headers {
        let name: HeaderName = name
            .parse()
            .map_err(|_| format!("invalid header for operation {:?}", op.operation_id))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| format!("invalid header for operation {:?}", op.operation_id))?;
        req.headers_mut().insert(name, value);
    }
    Ok(req)
}

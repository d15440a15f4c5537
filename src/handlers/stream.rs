//! Notification streaming.  One subscriber per request; cancellation
//! detaches the subscription when the response body is dropped.

use std::convert::Infallible;
use std::pin::Pin;

use axum::body::{Body, Bytes};
use axum::extract::{RawQuery, State};
use axum::http::header;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::{Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;

use crate::engine::Notification;
use crate::error::CoreError;
use crate::middleware::ClientCtx;
use crate::notifier::parse_filter;
use crate::AppState;

fn query_has(query: &Option<String>, name: &str) -> bool {
    let raw = query.as_deref().unwrap_or("");
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(raw).unwrap_or_default();
    pairs.iter().any(|(k, _)| k == name)
}

/// `GET /v1/notifications/event-stream?filter=...&raw`
///
/// With the sync bridge enabled the stream is fed from the bus, so every
/// node serves the same per-key sequence; otherwise it is local.
pub async fn event_stream(
    State(state): State<AppState>,
    ctx: ClientCtx,
    RawQuery(query): RawQuery,
) -> Result<Response, CoreError> {
    if !state.cfg.api.enable_notifications {
        return Err(CoreError::Forbidden(
            "notification streaming is disabled".to_string(),
        ));
    }

    let raw_mode = query_has(&query, "raw");
    let filter_values = crate::handlers::decide::query_values(&query, "filter");
    let filter = parse_filter(filter_values.iter().map(String::as_str));

    let source: Pin<Box<dyn Stream<Item = Notification> + Send>> = match state
        .sync
        .as_ref()
        .filter(|s| s.notification_enabled())
    {
        Some(sync) => {
            let rx = sync.subscribe_notifications(&ctx.sdk_key)?;
            Box::pin(ReceiverStream::new(rx))
        }
        None => {
            let sub = ctx
                .client
                .subscribe(filter.clone())
                .await
                .ok_or_else(|| {
                    CoreError::Unprocessable("notification hub is closed".to_string())
                })?;
            Box::pin(futures::stream::unfold(sub, |mut sub| async move {
                sub.recv().await.map(|n| (n, sub))
            }))
        }
    };

    // The hub applies the filter itself; the bus path needs it here.
    let filtered = source.filter(move |n| {
        futures::future::ready(filter.is_empty() || filter.contains(&n.kind))
    });

    if raw_mode {
        let body = Body::from_stream(
            filtered.map(|n| Ok::<_, Infallible>(Bytes::from(format!("{}\n", n.payload)))),
        );
        Ok((
            [(header::CONTENT_TYPE, "text/event-stream")],
            body,
        )
            .into_response())
    } else {
        let events =
            filtered.map(|n| Ok::<_, Infallible>(Event::default().data(n.payload.to_string())));
        Ok(Sse::new(events)
            .keep_alive(KeepAlive::default())
            .into_response())
    }
}

//! `GET /events/tail`: replay from a cursor, then follow the log.
//!
//! NDJSON by default, one event per line, idle periods marked by
//! `{"type":"keepalive","cursor":n}`. With `Accept: text/event-stream` the same
//! items go out as Server-Sent Events carrying `id: <seq>`, so a reconnecting
//! browser resumes through `Last-Event-ID`.
//!
//! Open tails end when the server begins shutting down; graceful shutdown
//! would otherwise wait on them forever.

use std::sync::Arc;

use axum::Extension;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::http::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde_json::json;
use tokio::sync::watch;
use tracing::debug;
use trellis_core::App;
use trellis_core::app::{TailItem, TailSubscription};
use trellis_core::domain::CollabError;

use super::error::ApiError;
use super::routes::SinceQuery;

pub const NDJSON: &str = "application/x-ndjson";
const LAST_EVENT_ID: &str = "last-event-id";

/// Flips to `true` once the server starts shutting down.
#[derive(Debug, Clone)]
pub struct TailShutdown(watch::Receiver<bool>);

impl TailShutdown {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self(rx)
    }

    async fn wait(mut self) {
        loop {
            let stopping = *self.0.borrow();
            if stopping {
                return;
            }
            if self.0.changed().await.is_err() {
                // Sender gone without a shutdown: tails run until the client leaves.
                futures::future::pending::<()>().await;
            }
        }
    }
}

pub async fn tail_events(
    State(app): State<Arc<App>>,
    Extension(shutdown): Extension<TailShutdown>,
    Query(query): Query<SinceQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let since = last_event_id(&headers)?.unwrap_or(query.since);
    let sse = wants_sse(&headers);
    let subscription = app.journal.subscribe(since).await?;
    debug!(since, sse, "tail subscriber attached");

    Ok(if sse {
        sse_response(subscription, shutdown)
    } else {
        ndjson_response(subscription, shutdown)
    })
}

fn wants_sse(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream"))
}

fn last_event_id(headers: &HeaderMap) -> Result<Option<u64>, ApiError> {
    let Some(value) = headers.get(LAST_EVENT_ID) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .map(Some)
        .ok_or_else(|| CollabError::InvalidArgument("Last-Event-ID must be a seq".into()).into())
}

fn keepalive_json(cursor: u64) -> String {
    json!({"type": "keepalive", "cursor": cursor}).to_string()
}

fn ndjson_response(subscription: TailSubscription, shutdown: TailShutdown) -> Response {
    let lines = subscription
        .into_stream()
        .take_until(shutdown.wait())
        .map(|item| {
            let line = match item? {
                TailItem::Event(event) => serde_json::to_string(&event)?,
                TailItem::KeepAlive { cursor } => keepalive_json(cursor),
            };
            Ok::<_, CollabError>(line + "\n")
        });
    (
        [(CONTENT_TYPE, NDJSON), (CACHE_CONTROL, "no-cache")],
        Body::from_stream(lines),
    )
        .into_response()
}

fn sse_response(subscription: TailSubscription, shutdown: TailShutdown) -> Response {
    let events = subscription
        .into_stream()
        .take_until(shutdown.wait())
        .map(|item| {
            let event = match item? {
                TailItem::Event(event) => SseEvent::default()
                    .id(event.seq.to_string())
                    .data(serde_json::to_string(&event)?),
                TailItem::KeepAlive { cursor } => SseEvent::default()
                    .event("keepalive")
                    .data(keepalive_json(cursor)),
            };
            Ok::<_, CollabError>(event)
        });
    Sse::new(events).into_response()
}

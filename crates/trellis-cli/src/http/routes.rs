use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::header::ETAG;
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::{Value, json};
use trellis_core::App;
use trellis_core::domain::{CollabError, ETag, Kind, LockId, NewEvent, TaskStatus};

use super::body::JsonBody;
use super::caller::{Caller, actor_from, if_match};
use super::error::ApiError;

type AppState = State<Arc<App>>;

fn kind(raw: String) -> Result<Kind, ApiError> {
    Ok(Kind::new(raw)?)
}

fn lock_id(raw: &str) -> Result<LockId, ApiError> {
    raw.parse::<LockId>()
        .map_err(|e| CollabError::InvalidArgument(e.to_string()).into())
}

fn etag_header(etag: &ETag) -> [(HeaderName, String); 1] {
    [(ETAG, format!("\"{etag}\""))]
}

// --- collections ---

pub async fn list_collection(
    State(app): AppState,
    Path(raw_kind): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = app.collections.get(&kind(raw_kind)?).await?;
    Ok((etag_header(&snapshot.etag), Json(snapshot)))
}

pub async fn create_item(
    State(app): AppState,
    Path(raw_kind): Path<String>,
    JsonBody(payload): JsonBody<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let created = app.collections.create(&kind(raw_kind)?, payload).await?;
    Ok((
        StatusCode::CREATED,
        etag_header(&created.etag),
        Json(json!({"ok": true, "id": created.id, "etag": created.etag, "item": created.item})),
    ))
}

pub async fn get_item(
    State(app): AppState,
    Path((raw_kind, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let (item, etag) = app.collections.get_item(&kind(raw_kind)?, &id).await?;
    Ok((etag_header(&etag), Json(json!({"item": item, "etag": etag}))))
}

pub async fn patch_item(
    State(app): AppState,
    Path((raw_kind, id)): Path<(String, String)>,
    headers: HeaderMap,
    JsonBody(patch): JsonBody<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let expected = if_match(&headers)?;
    let patched = app
        .collections
        .patch(&kind(raw_kind)?, &id, &patch, &expected)
        .await?;
    Ok((
        etag_header(&patched.etag),
        Json(json!({"ok": true, "etag": patched.etag, "item": patched.item})),
    ))
}

#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    #[serde(alias = "status")]
    pub to: TaskStatus,
}

pub async fn transition_task(
    State(app): AppState,
    Path((raw_kind, id)): Path<(String, String)>,
    Caller(actor): Caller,
    headers: HeaderMap,
    JsonBody(body): JsonBody<TransitionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if kind(raw_kind)? != Kind::tasks() {
        return Err(CollabError::InvalidArgument("only tasks have transitions".into()).into());
    }
    let expected = if_match(&headers)?;
    let outcome = app.tasks.transition(&id, body.to, &expected, &actor).await?;
    Ok((
        etag_header(&outcome.etag),
        Json(json!({
            "ok": true,
            "task_id": outcome.task_id,
            "old_status": outcome.old_status,
            "new_status": outcome.new_status,
            "owner": outcome.owner,
            "etag": outcome.etag,
            "seq": outcome.seq,
            "lock_id": outcome.lock_id,
        })),
    ))
}

// --- leases ---

#[derive(Debug, Deserialize)]
pub struct AcquireRequest {
    pub resource: String,
    pub ttl_seconds: Option<u64>,
}

pub async fn acquire_lease(
    State(app): AppState,
    Caller(holder): Caller,
    JsonBody(body): JsonBody<AcquireRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let lease = app.leases.acquire(&body.resource, &holder, body.ttl_seconds).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "ok": true,
            "lock_id": lease.lock_id,
            "expires_at": lease.expires_at(),
            "lease": lease,
        })),
    ))
}

pub async fn list_leases(State(app): AppState) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(app.leases.list().await?))
}

pub async fn get_lease(
    State(app): AppState,
    Path(raw): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(app.leases.get(lock_id(&raw)?).await?))
}

pub async fn release_lease(
    State(app): AppState,
    Path(raw): Path<String>,
    Caller(holder): Caller,
) -> Result<impl IntoResponse, ApiError> {
    let lease = app.leases.release(lock_id(&raw)?, &holder).await?;
    Ok(Json(json!({"ok": true, "lock_id": lease.lock_id})))
}

pub async fn heartbeat_lease(
    State(app): AppState,
    Path(raw): Path<String>,
    Caller(holder): Caller,
) -> Result<impl IntoResponse, ApiError> {
    let lease = app.leases.heartbeat(lock_id(&raw)?, &holder).await?;
    Ok(Json(json!({
        "ok": true,
        "heartbeat_at": lease.heartbeat_at,
        "expires_at": lease.expires_at(),
    })))
}

/// One reclaim pass over the dead leases, on top of the periodic one.
pub async fn sweep_leases(State(app): AppState) -> Result<impl IntoResponse, ApiError> {
    let reclaimed = app.reaper().sweep_once().await?;
    Ok(Json(json!({"ok": true, "reclaimed": reclaimed})))
}

pub async fn reclaim_lease(
    State(app): AppState,
    Path(raw): Path<String>,
    Caller(actor): Caller,
) -> Result<impl IntoResponse, ApiError> {
    let lease = app.leases.reclaim(lock_id(&raw)?, &actor).await?;
    Ok(Json(json!({"ok": true, "lock_id": lease.lock_id, "holder": lease.holder})))
}

// --- events ---

#[derive(Debug, Default, Deserialize)]
pub struct SinceQuery {
    #[serde(default)]
    pub since: u64,
}

/// The body's `actor` wins; the identity header fills it in when absent.
pub async fn append_event(
    State(app): AppState,
    headers: HeaderMap,
    JsonBody(mut event): JsonBody<NewEvent>,
) -> Result<impl IntoResponse, ApiError> {
    if event.actor.is_empty()
        && let Some(actor) = actor_from(&headers)
    {
        event.actor = actor;
    }
    let event = app.journal.append(event).await?;
    Ok((StatusCode::CREATED, Json(json!({"ok": true, "seq": event.seq}))))
}

pub async fn read_events(
    State(app): AppState,
    Query(query): Query<SinceQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(app.journal.read_since(query.since).await?))
}

// --- service ---

pub async fn health(State(app): AppState) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(json!({
        "status": "ok",
        "last_seq": app.journal.last_seq().await?,
    })))
}

pub async fn status(State(app): AppState) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(app.status().await?))
}

pub async fn reconcile(State(app): AppState) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(app.reconciler.run().await?))
}

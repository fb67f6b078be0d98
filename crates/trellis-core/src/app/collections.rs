//! Collections - request-layer façade over the document store.
//!
//! - `get`: snapshot of a kind; a never-written kind reads as empty
//! - `create`: id from the payload or generated; typed for `tasks`/`agents`
//! - `patch`: JSON merge patch (RFC 7386) guarded by the caller's etag
//!
//! `leases` are only reachable through [`LeaseManager`](super::LeaseManager)
//! and task status/owner only through the task state machine.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use super::retry::RetryPolicy;
use crate::domain::{Agent, CollabError, ETag, Kind, NewAgent, NewTask, Snapshot, Task};
use crate::ports::{Clock, DocumentStore, IdGenerator};

const MAX_ID_LEN: usize = 128;

/// Task fields that `patch` may not change.
const TASK_IMMUTABLE_FIELDS: [&str; 4] = ["id", "created_at", "status", "owner"];

#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    pub id: String,
    pub etag: ETag,
    pub item: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Patched {
    pub etag: ETag,
    pub item: Value,
}

pub struct Collections {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    retry: RetryPolicy,
}

impl Collections {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            ids,
            retry,
        }
    }

    pub async fn get(&self, kind: &Kind) -> Result<Snapshot, CollabError> {
        self.store.read_or_empty(kind).await
    }

    /// One record plus the etag of its collection.
    pub async fn get_item(&self, kind: &Kind, id: &str) -> Result<(Value, ETag), CollabError> {
        let snapshot = self.get(kind).await?;
        let item = snapshot
            .items
            .get(id)
            .cloned()
            .ok_or_else(|| CollabError::not_found(format!("{kind}/{id}")))?;
        Ok((item, snapshot.etag))
    }

    pub async fn create(&self, kind: &Kind, payload: Value) -> Result<Created, CollabError> {
        let (id, item) = self.build_record(kind, payload)?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.try_insert(kind, &id, &item).await {
                Err(e) if e.is_retryable() && self.retry.should_retry(attempts) => {
                    debug!(%kind, %id, attempts, "create raced another writer, retrying");
                    self.retry.wait(attempts).await;
                }
                Err(e) => return Err(e),
                Ok(etag) => {
                    info!(%kind, %id, %etag, "record created");
                    return Ok(Created { id, etag, item });
                }
            }
        }
    }

    async fn try_insert(&self, kind: &Kind, id: &str, item: &Value) -> Result<ETag, CollabError> {
        let snapshot = self.store.read_or_empty(kind).await?;
        self.store
            .write(
                kind,
                &snapshot.etag,
                Box::new(|items| {
                    if items.contains_key(id) {
                        return Err(CollabError::AlreadyExists {
                            kind: kind.to_string(),
                            id: id.to_string(),
                        });
                    }
                    items.insert(id.to_string(), item.clone());
                    Ok(())
                }),
            )
            .await
    }

    pub async fn patch(
        &self,
        kind: &Kind,
        id: &str,
        patch: &Value,
        if_match: &ETag,
    ) -> Result<Patched, CollabError> {
        reject_leases(kind)?;
        if !patch.is_object() {
            return Err(CollabError::InvalidArgument(
                "patch body must be a JSON object".into(),
            ));
        }

        let now = self.clock.now();
        let mut patched = Value::Null;
        let etag = self
            .store
            .write(
                kind,
                if_match,
                Box::new(|items| {
                    let current = items
                        .get(id)
                        .ok_or_else(|| CollabError::not_found(format!("{kind}/{id}")))?;
                    let mut next = current.clone();
                    merge_patch(&mut next, patch);

                    if next.get("id") != current.get("id") {
                        return Err(CollabError::InvalidArgument("id is immutable".into()));
                    }
                    if kind.as_str() == Kind::TASKS {
                        next = revalidate_task(current, next, now)?;
                    } else if kind.as_str() == Kind::AGENTS {
                        let agent: Agent = decode_record(next)?;
                        next = serde_json::to_value(agent)?;
                    }

                    items.insert(id.to_string(), next.clone());
                    patched = next;
                    Ok(())
                }),
            )
            .await?;

        info!(%kind, %id, %etag, "record patched");
        Ok(Patched {
            etag,
            item: patched,
        })
    }

    /// Resolve the id and produce the stored form of a creation payload.
    fn build_record(&self, kind: &Kind, payload: Value) -> Result<(String, Value), CollabError> {
        reject_leases(kind)?;
        let now = self.clock.now();

        match kind.as_str() {
            Kind::TASKS => {
                let new: NewTask = decode_record(payload)?;
                if new.title.trim().is_empty() {
                    return Err(CollabError::InvalidArgument("task title cannot be empty".into()));
                }
                let id = self.resolve_id(kind, new.id.clone())?;
                if new.dependencies.contains(&id) {
                    return Err(CollabError::InvalidArgument(format!(
                        "task {id} cannot depend on itself"
                    )));
                }
                let task = Task::from_new(id.clone(), new, now);
                Ok((id, serde_json::to_value(task)?))
            }
            Kind::AGENTS => {
                let new: NewAgent = decode_record(payload)?;
                let id = self.resolve_id(kind, new.id.clone())?;
                let agent = Agent::from_new(id.clone(), new, now);
                Ok((id, serde_json::to_value(agent)?))
            }
            _ => {
                let Value::Object(mut fields) = payload else {
                    return Err(CollabError::InvalidArgument(
                        "creation payload must be a JSON object".into(),
                    ));
                };
                let requested = match fields.get("id") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(id)) => Some(id.clone()),
                    Some(_) => {
                        return Err(CollabError::InvalidArgument("id must be a string".into()));
                    }
                };
                let id = self.resolve_id(kind, requested)?;
                fields.insert("id".into(), Value::String(id.clone()));
                Ok((id, Value::Object(fields)))
            }
        }
    }

    fn resolve_id(&self, kind: &Kind, requested: Option<String>) -> Result<String, CollabError> {
        match requested {
            None => Ok(self.ids.generate_item_id(kind)),
            Some(id) => {
                validate_item_id(&id)?;
                Ok(id)
            }
        }
    }
}

fn reject_leases(kind: &Kind) -> Result<(), CollabError> {
    if kind.as_str() == Kind::LEASES {
        return Err(CollabError::InvalidArgument(
            "leases are managed through the lease operations".into(),
        ));
    }
    Ok(())
}

fn validate_item_id(id: &str) -> Result<(), CollabError> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(CollabError::InvalidArgument(format!(
            "id must be 1..={MAX_ID_LEN} characters"
        )));
    }
    if id.chars().any(|c| c.is_whitespace() || c.is_control() || c == '/') {
        return Err(CollabError::InvalidArgument(format!(
            "id {id:?} may not contain whitespace, control characters or '/'"
        )));
    }
    Ok(())
}

fn decode_record<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, CollabError> {
    serde_json::from_value(value).map_err(|e| CollabError::InvalidArgument(e.to_string()))
}

fn revalidate_task(
    current: &Value,
    next: Value,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<Value, CollabError> {
    for field in TASK_IMMUTABLE_FIELDS {
        if next.get(field) != current.get(field) {
            return Err(CollabError::InvalidArgument(format!(
                "task field {field} cannot be patched"
            )));
        }
    }
    let mut task: Task = decode_record(next)?;
    if task.title.trim().is_empty() {
        return Err(CollabError::InvalidArgument("task title cannot be empty".into()));
    }
    if task.dependencies.contains(&task.id) {
        return Err(CollabError::InvalidArgument(format!(
            "task {} cannot depend on itself",
            task.id
        )));
    }
    task.updated_at = now;
    Ok(serde_json::to_value(task)?)
}

/// RFC 7386: objects merge recursively, `null` deletes, anything else
/// replaces.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_fields) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target_fields) = target {
        for (key, value) in patch_fields {
            if value.is_null() {
                target_fields.remove(key);
            } else {
                merge_patch(target_fields.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AgentStatus, TaskStatus};
    use crate::impls::InMemoryDocumentStore;
    use crate::ports::{FixedClock, UlidGenerator};
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    struct Fixture {
        clock: Arc<FixedClock>,
        collections: Collections,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap()));
        let collections = Collections::new(
            Arc::new(InMemoryDocumentStore::new()),
            clock.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
            RetryPolicy::immediate(4),
        );
        Fixture { clock, collections }
    }

    #[test]
    fn merge_patch_follows_rfc7386() {
        let mut doc = json!({"a": "b", "c": {"d": "e", "f": "g"}, "tags": [1, 2]});
        merge_patch(&mut doc, &json!({"a": "z", "c": {"f": null}, "tags": [3], "new": 1}));
        assert_eq!(doc, json!({"a": "z", "c": {"d": "e"}, "tags": [3], "new": 1}));
    }

    #[tokio::test]
    async fn get_of_unwritten_kind_is_empty_with_initial_etag() {
        let fx = fixture();
        let snapshot = fx.collections.get(&Kind::tasks()).await.unwrap();
        assert!(snapshot.items.is_empty());
        assert_eq!(snapshot.etag, ETag::initial());
    }

    #[tokio::test]
    async fn created_task_is_queued_and_unowned() {
        let fx = fixture();
        let created = fx
            .collections
            .create(&Kind::tasks(), json!({"id": "T1", "title": "parse config"}))
            .await
            .unwrap();
        assert_eq!(created.id, "T1");

        let snapshot = fx.collections.get(&Kind::tasks()).await.unwrap();
        assert_eq!(snapshot.etag, created.etag);
        let task: Task = snapshot.get("T1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(!task.has_owner());
        assert_eq!(task.created_at, fx.clock.now());
    }

    #[tokio::test]
    async fn generated_ids_use_kind_prefix() {
        let fx = fixture();
        let task = fx
            .collections
            .create(&Kind::tasks(), json!({"title": "x"}))
            .await
            .unwrap();
        let agent = fx
            .collections
            .create(&Kind::agents(), json!({"role": "builder"}))
            .await
            .unwrap();
        assert!(task.id.starts_with("task-"));
        assert!(agent.id.starts_with("agent-"));
        assert_eq!(agent.item["status"], json!(AgentStatus::Available));
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let fx = fixture();
        let kind = Kind::new("notes").unwrap();
        fx.collections.create(&kind, json!({"id": "n1", "text": "a"})).await.unwrap();
        let err = fx
            .collections
            .create(&kind, json!({"id": "n1", "text": "b"}))
            .await
            .unwrap_err();
        assert!(matches!(err, CollabError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn task_payload_cannot_set_status() {
        let fx = fixture();
        let err = fx
            .collections
            .create(&Kind::tasks(), json!({"title": "x", "status": "done"}))
            .await
            .unwrap_err();
        assert!(matches!(err, CollabError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn leases_kind_is_not_generic() {
        let fx = fixture();
        let err = fx
            .collections
            .create(&Kind::leases(), json!({"resource": "T1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, CollabError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn patch_with_current_etag_merges_and_bumps_updated_at() {
        let fx = fixture();
        let created = fx
            .collections
            .create(
                &Kind::tasks(),
                json!({"id": "T1", "title": "old", "dod_checklist": [{"text": "tests"}]}),
            )
            .await
            .unwrap();
        fx.clock.advance(Duration::seconds(30));

        let patched = fx
            .collections
            .patch(
                &Kind::tasks(),
                "T1",
                &json!({"title": "new", "dod_checklist": [{"text": "tests", "done": true}]}),
                &created.etag,
            )
            .await
            .unwrap();
        assert_ne!(patched.etag, created.etag);

        let task: Task = serde_json::from_value(patched.item).unwrap();
        assert_eq!(task.title, "new");
        assert_eq!(task.dod_progress(), (1, 1));
        assert_eq!(task.updated_at, fx.clock.now());
        assert!(task.created_at < task.updated_at);
    }

    #[tokio::test]
    async fn patch_with_stale_etag_fails() {
        let fx = fixture();
        let first = fx
            .collections
            .create(&Kind::tasks(), json!({"id": "T1", "title": "a"}))
            .await
            .unwrap();
        fx.collections
            .create(&Kind::tasks(), json!({"id": "T2", "title": "b"}))
            .await
            .unwrap();

        let err = fx
            .collections
            .patch(&Kind::tasks(), "T1", &json!({"title": "c"}), &first.etag)
            .await
            .unwrap_err();
        assert!(matches!(err, CollabError::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn patch_cannot_move_status_or_owner() {
        let fx = fixture();
        let created = fx
            .collections
            .create(&Kind::tasks(), json!({"id": "T1", "title": "a"}))
            .await
            .unwrap();
        for body in [json!({"status": "done"}), json!({"owner": "agent-x"}), json!({"id": "T9"})] {
            let err = fx
                .collections
                .patch(&Kind::tasks(), "T1", &body, &created.etag)
                .await
                .unwrap_err();
            assert!(matches!(err, CollabError::InvalidArgument(_)), "{body}");
        }
    }

    #[tokio::test]
    async fn patch_of_missing_record_is_not_found() {
        let fx = fixture();
        let snapshot = fx.collections.get(&Kind::tasks()).await.unwrap();
        let err = fx
            .collections
            .patch(&Kind::tasks(), "T404", &json!({"title": "x"}), &snapshot.etag)
            .await
            .unwrap_err();
        assert!(matches!(err, CollabError::NotFound { .. }));
    }
}

//! Reconciler - backfill transitions the journal missed.
//!
//! A transition whose event append failed leaves the task correct and the
//! log behind. `run` compares each task's status with the last status the
//! log recorded for it and appends a `reconciliation_backfill` event for every
//! task that disagrees. Running it again right away appends nothing.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::info;

use super::journal::Journal;
use crate::domain::events::types;
use crate::domain::{CollabError, Event, Kind, NewEvent, Task, TaskStatus};
use crate::ports::DocumentStore;

pub const RECONCILER_ACTOR: &str = "reconciler";

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub tasks_scanned: usize,
    pub backfilled: Vec<Event>,
}

pub struct Reconciler {
    store: Arc<dyn DocumentStore>,
    journal: Arc<Journal>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn DocumentStore>, journal: Arc<Journal>) -> Self {
        Self { store, journal }
    }

    pub async fn run(&self) -> Result<ReconcileReport, CollabError> {
        let tasks: Vec<Task> = self.store.read_or_empty(&Kind::tasks()).await?.decode_all()?;
        let events = self.journal.read_since(0).await?;
        let logged = last_logged_status(&events);

        let mut report = ReconcileReport {
            tasks_scanned: tasks.len(),
            ..ReconcileReport::default()
        };
        for task in tasks {
            let last = logged.get(task.id.as_str()).copied().unwrap_or(TaskStatus::Queued);
            if last == task.status {
                continue;
            }
            let event = self
                .journal
                .append(NewEvent::new(
                    types::RECONCILIATION_BACKFILL,
                    RECONCILER_ACTOR,
                    task.id.clone(),
                    json!({"old_status": last, "new_status": task.status, "owner": task.owner}),
                ))
                .await?;
            info!(task_id = %task.id, %last, current = %task.status, seq = event.seq, "backfilled missing transition");
            report.backfilled.push(event);
        }
        Ok(report)
    }
}

/// Last `new_status` the log recorded per task.
fn last_logged_status(events: &[Event]) -> HashMap<&str, TaskStatus> {
    let mut last = HashMap::new();
    for event in events {
        if event.event_type != types::TASK_TRANSITIONED
            && event.event_type != types::RECONCILIATION_BACKFILL
        {
            continue;
        }
        if let Some(status) = event
            .details
            .get("new_status")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
        {
            last.insert(event.target.as_str(), status);
        }
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::TailOptions;
    use crate::domain::ETag;
    use crate::impls::{InMemoryDocumentStore, InMemoryEventLog};
    use crate::ports::SystemClock;
    use chrono::Utc;

    async fn put_task(store: &InMemoryDocumentStore, id: &str, status: TaskStatus) {
        let snapshot = store.read_or_empty(&Kind::tasks()).await.unwrap();
        let now = Utc::now();
        let task = Task {
            id: id.to_string(),
            title: id.to_string(),
            status,
            dependencies: Default::default(),
            dod_checklist: Vec::new(),
            owner: "A".to_string(),
            created_at: now,
            updated_at: now,
        };
        let value = serde_json::to_value(task).unwrap();
        let id = id.to_string();
        store
            .write(
                &Kind::tasks(),
                &snapshot.etag,
                Box::new(move |items| {
                    items.insert(id, value);
                    Ok(())
                }),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn backfills_only_tasks_the_log_disagrees_with() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let journal = Arc::new(Journal::new(
            Arc::new(InMemoryEventLog::new(Arc::new(SystemClock))),
            16,
            TailOptions::default(),
        ));

        put_task(&store, "T1", TaskStatus::Claimed).await;
        put_task(&store, "T2", TaskStatus::InProgress).await;
        put_task(&store, "T3", TaskStatus::Queued).await;
        journal
            .append(NewEvent::new(
                types::TASK_TRANSITIONED,
                "A",
                "T1",
                json!({"old_status": "queued", "new_status": "claimed"}),
            ))
            .await
            .unwrap();
        journal
            .append(NewEvent::new(
                types::TASK_TRANSITIONED,
                "A",
                "T2",
                json!({"old_status": "queued", "new_status": "claimed"}),
            ))
            .await
            .unwrap();

        let reconciler = Reconciler::new(store.clone(), Arc::clone(&journal));
        let report = reconciler.run().await.unwrap();
        assert_eq!(report.tasks_scanned, 3);
        assert_eq!(report.backfilled.len(), 1);
        let event = &report.backfilled[0];
        assert_eq!(event.target, "T2");
        assert_eq!(event.details["old_status"], "claimed");
        assert_eq!(event.details["new_status"], "in_progress");

        let again = reconciler.run().await.unwrap();
        assert!(again.backfilled.is_empty());
        assert_ne!(store.read(&Kind::tasks()).await.unwrap().etag, ETag::initial());
    }
}

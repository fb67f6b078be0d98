//! TaskStateMachine - validated task transitions.
//!
//! # Checks, in order
//! 1. `if_match` equals the current `tasks` etag
//! 2. the task exists
//! 3. `(from, to)` is an edge of the transition table
//! 4. leaving `queued`: every dependency exists and is `done`
//! 5. lease rules (below)
//! 6. guarded write of `status`, `owner`, `updated_at`
//! 7. `task_transitioned` appended to the journal
//!
//! # Lease rules
//! - `queued -> claimed`: the actor's live lease on the task id is reused, or
//!   one is acquired with the default TTL. `owner := actor`. If the write in
//!   step 6 fails, a lease acquired here is released again.
//! - `review -> claimed` (rework): owner and lease are kept as they are.
//! - `* -> in_progress`: the owner must hold a live lease on the task id.
//! - `* -> done`: the owner's lease on the task id is released.
//!
//! A journal failure after step 6 does not undo the transition; the outcome
//! then carries no `seq` and [`Reconciler`](super::Reconciler) can backfill it.
//!
//! Transitions run one at a time. Of several claimers presenting the same
//! etag, the first wins and every later one fails step 1 with
//! `PreconditionFailed`, never with the lease error of the winner's claim.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::journal::Journal;
use super::lease_manager::LeaseManager;
use crate::domain::events::types;
use crate::domain::{
    CollabError, ETag, Kind, Lease, LockId, NewEvent, Snapshot, Task, TaskStatus, TransitionTable,
};
use crate::ports::{Clock, DocumentStore};

/// `reason` on the `lease_released` of a claim whose task write failed; its
/// acquisition was never journaled.
pub const CLAIM_ABORTED: &str = "claim_aborted";

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionOutcome {
    pub task_id: String,
    pub old_status: TaskStatus,
    pub new_status: TaskStatus,
    pub owner: String,
    /// Etag of `tasks` after the transition.
    pub etag: ETag,
    /// Seq of the `task_transitioned` event, absent if journaling failed.
    pub seq: Option<u64>,
    /// Lease backing ownership, when the transition claimed the task.
    pub lock_id: Option<LockId>,
}

pub struct TaskStateMachine {
    store: Arc<dyn DocumentStore>,
    leases: Arc<LeaseManager>,
    journal: Arc<Journal>,
    clock: Arc<dyn Clock>,
    table: TransitionTable,
    /// Held from step 1 through step 7.
    serial: Mutex<()>,
}

/// Lease state prepared in step 5.
enum LeaseStep {
    None,
    Reused(Lease),
    Acquired(Lease),
}

impl LeaseStep {
    fn lock_id(&self) -> Option<LockId> {
        match self {
            Self::None => None,
            Self::Reused(lease) | Self::Acquired(lease) => Some(lease.lock_id),
        }
    }
}

impl TaskStateMachine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        leases: Arc<LeaseManager>,
        journal: Arc<Journal>,
        clock: Arc<dyn Clock>,
        table: TransitionTable,
    ) -> Self {
        Self {
            store,
            leases,
            journal,
            clock,
            table,
            serial: Mutex::new(()),
        }
    }

    pub fn table(&self) -> &TransitionTable {
        &self.table
    }

    pub async fn transition(
        &self,
        task_id: &str,
        to: TaskStatus,
        if_match: &ETag,
        actor: &str,
    ) -> Result<TransitionOutcome, CollabError> {
        let _serial = self.serial.lock().await;
        let snapshot = self.store.read_or_empty(&Kind::tasks()).await?;
        if &snapshot.etag != if_match {
            return Err(CollabError::PreconditionFailed {
                expected: if_match.to_string(),
                actual: snapshot.etag.to_string(),
            });
        }

        let task: Task = snapshot
            .get(task_id)?
            .ok_or_else(|| CollabError::not_found(format!("task {task_id}")))?;
        let from = task.status;
        let invalid = |reason: String| CollabError::InvalidTransition {
            task_id: task_id.to_string(),
            from,
            to,
            reason,
        };

        if !self.table.allows(from, to) {
            let allowed: Vec<&str> = self.table.successors(from).iter().map(|s| s.as_str()).collect();
            return Err(invalid(format!(
                "{to} is not a successor of {from} (allowed: [{}])",
                allowed.join(", ")
            )));
        }
        if from == TaskStatus::Queued {
            check_dependencies(&snapshot, &task).map_err(invalid)?;
        }

        let (owner, lease_step) = self.prepare_lease(&task, to, actor, &invalid).await?;

        let now = self.clock.now();
        let new_owner = owner.clone();
        let written = self
            .store
            .write(
                &Kind::tasks(),
                if_match,
                Box::new(move |items| {
                    let value = items
                        .get_mut(task_id)
                        .ok_or_else(|| CollabError::not_found(format!("task {task_id}")))?;
                    let mut task: Task = serde_json::from_value(value.clone())?;
                    task.status = to;
                    task.owner = new_owner;
                    task.updated_at = now;
                    *value = serde_json::to_value(task)?;
                    Ok(())
                }),
            )
            .await;

        let etag = match written {
            Ok(etag) => etag,
            Err(e) => {
                if let LeaseStep::Acquired(lease) = &lease_step {
                    self.compensate(lease).await;
                }
                return Err(e);
            }
        };
        info!(task_id, %from, %to, owner = %owner, actor, "task transitioned");

        if to == TaskStatus::Done && !owner.is_empty() {
            if let Err(e) = self.leases.release_resource(task_id, &owner).await {
                warn!(task_id, owner = %owner, error = %e, "lease not released on done");
            }
        }

        let event = NewEvent::new(
            types::TASK_TRANSITIONED,
            actor,
            task_id,
            json!({"old_status": from, "new_status": to, "owner": owner}),
        );
        let seq = match self.journal.append(event).await {
            Ok(event) => Some(event.seq),
            Err(e) => {
                warn!(task_id, %from, %to, error = %e, "transition applied but not journaled");
                None
            }
        };

        Ok(TransitionOutcome {
            task_id: task_id.to_string(),
            old_status: from,
            new_status: to,
            owner,
            etag,
            seq,
            lock_id: lease_step.lock_id(),
        })
    }

    /// Step 5: returns the owner after the transition and the lease it rests on.
    async fn prepare_lease(
        &self,
        task: &Task,
        to: TaskStatus,
        actor: &str,
        invalid: &impl Fn(String) -> CollabError,
    ) -> Result<(String, LeaseStep), CollabError> {
        match (task.status, to) {
            (TaskStatus::Queued, TaskStatus::Claimed) => {
                if actor.trim().is_empty() {
                    return Err(CollabError::InvalidArgument(
                        "claiming a task requires an actor".into(),
                    ));
                }
                let step = match self.leases.find_live(&task.id).await? {
                    Some(lease) if lease.is_held_by(actor) => LeaseStep::Reused(lease),
                    Some(lease) => {
                        return Err(CollabError::LeaseHeld {
                            resource: task.id.clone(),
                            holder: lease.holder,
                            lock_id: lease.lock_id,
                        });
                    }
                    None => LeaseStep::Acquired(self.leases.acquire(&task.id, actor, None).await?),
                };
                Ok((actor.to_string(), step))
            }
            (_, TaskStatus::InProgress) => {
                let lease = self.leases.find_live(&task.id).await?;
                match lease {
                    Some(lease) if task.has_owner() && lease.is_held_by(&task.owner) => {
                        Ok((task.owner.clone(), LeaseStep::Reused(lease)))
                    }
                    _ => Err(invalid(format!(
                        "in_progress requires a live lease on {} held by owner {:?}",
                        task.id, task.owner
                    ))),
                }
            }
            _ => Ok((task.owner.clone(), LeaseStep::None)),
        }
    }

    async fn compensate(&self, lease: &Lease) {
        match self
            .leases
            .release_with_reason(lease.lock_id, &lease.holder, CLAIM_ABORTED)
            .await
        {
            Ok(_) => info!(lock_id = %lease.lock_id, "released lease acquired by failed claim"),
            Err(e) => warn!(lock_id = %lease.lock_id, error = %e, "could not release lease of failed claim"),
        }
    }
}

fn check_dependencies(snapshot: &Snapshot, task: &Task) -> Result<(), String> {
    for dep in &task.dependencies {
        match snapshot.get::<Task>(dep) {
            Ok(Some(dep_task)) if dep_task.status == TaskStatus::Done => {}
            Ok(Some(dep_task)) => {
                return Err(format!("dependency {dep} is {}, not done", dep_task.status));
            }
            Ok(None) => return Err(format!("dependency {dep} does not exist")),
            Err(e) => return Err(format!("dependency {dep} is unreadable: {e}")),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{Collections, LeasePolicy, RetryPolicy, TailOptions};
    use crate::domain::Event;
    use crate::impls::{InMemoryDocumentStore, InMemoryEventLog};
    use crate::ports::{FixedClock, Mutator, UlidGenerator};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use rstest::rstest;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Fixture {
        clock: Arc<FixedClock>,
        store: Arc<dyn DocumentStore>,
        journal: Arc<Journal>,
        leases: Arc<LeaseManager>,
        collections: Collections,
        machine: TaskStateMachine,
    }

    fn fixture_with(table: TransitionTable) -> Fixture {
        fixture_on(Arc::new(InMemoryDocumentStore::new()), table)
    }

    fn fixture_on(store: Arc<dyn DocumentStore>, table: TransitionTable) -> Fixture {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()));
        let ids = Arc::new(UlidGenerator::new(clock.clone()));
        let journal = Arc::new(Journal::new(
            Arc::new(InMemoryEventLog::new(clock.clone())),
            16,
            TailOptions::default(),
        ));
        let leases = Arc::new(LeaseManager::new(
            Arc::clone(&store),
            Arc::clone(&journal),
            clock.clone(),
            ids.clone(),
            LeasePolicy::default(),
            RetryPolicy::immediate(8),
        ));
        let collections =
            Collections::new(Arc::clone(&store), clock.clone(), ids, RetryPolicy::immediate(8));
        let machine = TaskStateMachine::new(
            Arc::clone(&store),
            Arc::clone(&leases),
            Arc::clone(&journal),
            clock.clone(),
            table,
        );
        Fixture {
            clock,
            store,
            journal,
            leases,
            collections,
            machine,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(TransitionTable::standard())
    }

    /// Fails every `tasks` write once armed.
    #[derive(Default)]
    struct FailingTaskWrites {
        inner: InMemoryDocumentStore,
        armed: AtomicBool,
    }

    #[async_trait]
    impl DocumentStore for FailingTaskWrites {
        async fn read(&self, kind: &Kind) -> Result<Snapshot, CollabError> {
            self.inner.read(kind).await
        }

        async fn write(
            &self,
            kind: &Kind,
            if_match: &ETag,
            mutator: Mutator<'_>,
        ) -> Result<ETag, CollabError> {
            if *kind == Kind::tasks() && self.armed.load(Ordering::SeqCst) {
                return Err(CollabError::StorageUnavailable("disk full".into()));
            }
            self.inner.write(kind, if_match, mutator).await
        }

        async fn kinds(&self) -> Result<Vec<Kind>, CollabError> {
            self.inner.kinds().await
        }
    }

    impl Fixture {
        async fn create(&self, body: serde_json::Value) -> ETag {
            self.collections.create(&Kind::tasks(), body).await.unwrap().etag
        }

        async fn etag(&self) -> ETag {
            self.store.read_or_empty(&Kind::tasks()).await.unwrap().etag
        }

        async fn task(&self, id: &str) -> Task {
            self.store
                .read(&Kind::tasks())
                .await
                .unwrap()
                .get(id)
                .unwrap()
                .unwrap()
        }

        async fn step(&self, id: &str, to: TaskStatus, actor: &str) -> TransitionOutcome {
            let etag = self.etag().await;
            self.machine.transition(id, to, &etag, actor).await.unwrap()
        }

        async fn events(&self) -> Vec<Event> {
            self.journal.read_since(0).await.unwrap()
        }
    }

    #[tokio::test]
    async fn claim_scenario_with_stale_competitor_and_reclaim() {
        let fx = fixture();
        let e0 = fx.create(serde_json::json!({"id": "T1", "title": "t"})).await;

        let lease = fx.leases.acquire("T1", "A", Some(60)).await.unwrap();
        let outcome = fx
            .machine
            .transition("T1", TaskStatus::Claimed, &e0, "A")
            .await
            .unwrap();
        assert_eq!(outcome.old_status, TaskStatus::Queued);
        assert_eq!(outcome.new_status, TaskStatus::Claimed);
        assert_eq!(outcome.seq, Some(1));
        assert_eq!(outcome.lock_id, Some(lease.lock_id));

        let err = fx
            .machine
            .transition("T1", TaskStatus::Claimed, &e0, "B")
            .await
            .unwrap_err();
        assert!(matches!(err, CollabError::PreconditionFailed { .. }));

        fx.clock.advance(Duration::seconds(70));
        fx.leases.reclaim(lease.lock_id, "sweeper").await.unwrap();

        let events = fx.events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, types::TASK_TRANSITIONED);
        assert_eq!(events[0].details["old_status"], "queued");
        assert_eq!(events[0].details["new_status"], "claimed");
        assert_eq!(events[1].event_type, types::LEASE_RECLAIMED);
        assert_eq!(events[1].seq, 2);
    }

    #[tokio::test]
    async fn claim_acquires_a_lease_when_actor_has_none() {
        let fx = fixture();
        fx.create(serde_json::json!({"id": "T1", "title": "t"})).await;

        let outcome = fx.step("T1", TaskStatus::Claimed, "A").await;
        let lease = fx.leases.find_live("T1").await.unwrap().unwrap();
        assert_eq!(outcome.lock_id, Some(lease.lock_id));
        assert_eq!(lease.holder, "A");
        assert_eq!(lease.ttl_seconds, LeasePolicy::default().default_ttl_seconds);
        assert_eq!(fx.task("T1").await.owner, "A");
    }

    #[tokio::test]
    async fn claim_is_refused_while_someone_else_holds_the_lease() {
        let fx = fixture();
        fx.create(serde_json::json!({"id": "T1", "title": "t"})).await;
        fx.leases.acquire("T1", "B", Some(60)).await.unwrap();

        let etag = fx.etag().await;
        let err = fx
            .machine
            .transition("T1", TaskStatus::Claimed, &etag, "A")
            .await
            .unwrap_err();
        assert!(matches!(err, CollabError::LeaseHeld { .. }));
        assert_eq!(fx.task("T1").await.status, TaskStatus::Queued);
    }

    #[rstest]
    #[case::skip_to_in_progress(TaskStatus::InProgress)]
    #[case::skip_to_done(TaskStatus::Done)]
    #[case::self_loop(TaskStatus::Queued)]
    #[tokio::test]
    async fn non_successor_targets_are_invalid(#[case] to: TaskStatus) {
        let fx = fixture();
        fx.create(serde_json::json!({"id": "T1", "title": "t"})).await;
        let etag = fx.etag().await;

        let err = fx.machine.transition("T1", to, &etag, "A").await.unwrap_err();
        assert!(matches!(err, CollabError::InvalidTransition { .. }), "{err}");
        assert!(fx.events().await.is_empty());
    }

    #[tokio::test]
    async fn dependencies_must_be_done_before_leaving_queued() {
        let fx = fixture();
        fx.create(serde_json::json!({"id": "T0", "title": "dep"})).await;
        fx.create(serde_json::json!({"id": "T1", "title": "t", "dependencies": ["T0"]}))
            .await;
        fx.create(serde_json::json!({"id": "T2", "title": "t", "dependencies": ["ghost"]}))
            .await;

        let etag = fx.etag().await;
        let err = fx
            .machine
            .transition("T1", TaskStatus::Claimed, &etag, "A")
            .await
            .unwrap_err();
        let CollabError::InvalidTransition { reason, .. } = err else {
            panic!("expected InvalidTransition");
        };
        assert!(reason.contains("T0"), "{reason}");

        let err = fx
            .machine
            .transition("T2", TaskStatus::Claimed, &etag, "A")
            .await
            .unwrap_err();
        assert!(matches!(err, CollabError::InvalidTransition { .. }));
        assert!(fx.leases.list().await.unwrap().is_empty());

        for to in [
            TaskStatus::Claimed,
            TaskStatus::InProgress,
            TaskStatus::Review,
            TaskStatus::Approved,
            TaskStatus::Merging,
            TaskStatus::Done,
        ] {
            fx.step("T0", to, "B").await;
        }
        fx.step("T1", TaskStatus::Claimed, "A").await;
        assert_eq!(fx.task("T1").await.status, TaskStatus::Claimed);
    }

    #[tokio::test]
    async fn in_progress_requires_owners_live_lease() {
        let fx = fixture();
        fx.create(serde_json::json!({"id": "T1", "title": "t"})).await;
        let claimed = fx.step("T1", TaskStatus::Claimed, "A").await;

        fx.clock.advance(Duration::seconds(61));
        let etag = fx.etag().await;
        let err = fx
            .machine
            .transition("T1", TaskStatus::InProgress, &etag, "A")
            .await
            .unwrap_err();
        assert!(matches!(err, CollabError::InvalidTransition { .. }));

        // Owner re-acquires after the dead lease is reclaimed.
        fx.leases.reclaim(claimed.lock_id.unwrap(), "sweeper").await.unwrap();
        fx.leases.acquire("T1", "A", Some(60)).await.unwrap();
        let outcome = fx.step("T1", TaskStatus::InProgress, "A").await;
        assert_eq!(outcome.new_status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn full_lifecycle_releases_lease_on_done() {
        let fx = fixture();
        fx.create(serde_json::json!({"id": "T1", "title": "t"})).await;

        let mut seqs = Vec::new();
        for to in [
            TaskStatus::Claimed,
            TaskStatus::InProgress,
            TaskStatus::Review,
            TaskStatus::Approved,
            TaskStatus::Merging,
            TaskStatus::Done,
        ] {
            seqs.push(fx.step("T1", to, "A").await.seq.unwrap());
        }

        assert!(fx.leases.find_live("T1").await.unwrap().is_none());
        let released: Vec<Event> = fx
            .events()
            .await
            .into_iter()
            .filter(|e| e.event_type == types::LEASE_RELEASED)
            .collect();
        // The release on done is journaled before the final transition.
        assert_eq!(released.len(), 1);
        assert!(released[0].details.get("reason").is_none());
        assert_eq!(*seqs.last().unwrap(), 7);
        assert_eq!(fx.task("T1").await.owner, "A");
    }

    #[tokio::test]
    async fn rework_keeps_owner_and_lease() {
        let fx = fixture();
        fx.create(serde_json::json!({"id": "T1", "title": "t"})).await;
        for to in [TaskStatus::Claimed, TaskStatus::InProgress, TaskStatus::Review] {
            fx.step("T1", to, "A").await;
        }

        let outcome = fx.step("T1", TaskStatus::Claimed, "reviewer").await;
        assert_eq!(outcome.old_status, TaskStatus::Review);
        assert_eq!(outcome.owner, "A");
        assert!(fx.leases.find_live("T1").await.unwrap().is_some());

        fx.step("T1", TaskStatus::InProgress, "A").await;
    }

    #[tokio::test]
    async fn rework_can_be_disabled() {
        let fx = fixture_with(TransitionTable::without_rework());
        fx.create(serde_json::json!({"id": "T1", "title": "t"})).await;
        for to in [TaskStatus::Claimed, TaskStatus::InProgress, TaskStatus::Review] {
            fx.step("T1", to, "A").await;
        }

        let etag = fx.etag().await;
        let err = fx
            .machine
            .transition("T1", TaskStatus::Claimed, &etag, "reviewer")
            .await
            .unwrap_err();
        assert!(matches!(err, CollabError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let fx = fixture();
        let etag = fx.etag().await;
        let err = fx
            .machine
            .transition("T404", TaskStatus::Claimed, &etag, "A")
            .await
            .unwrap_err();
        assert!(matches!(err, CollabError::NotFound { .. }));
    }

    #[tokio::test]
    async fn concurrent_claims_with_same_etag_have_one_winner() {
        let fx = Arc::new(fixture());
        fx.create(serde_json::json!({"id": "T1", "title": "t"})).await;
        let etag = fx.etag().await;

        let mut joins = Vec::new();
        for n in 0..6 {
            let fx = Arc::clone(&fx);
            let etag = etag.clone();
            joins.push(tokio::spawn(async move {
                fx.machine
                    .transition("T1", TaskStatus::Claimed, &etag, &format!("agent-{n}"))
                    .await
            }));
        }

        let mut winners = Vec::new();
        for join in joins {
            match join.await.unwrap() {
                Ok(outcome) => winners.push(outcome.owner),
                Err(e) => assert_eq!(e.code(), "precondition_failed", "{e}"),
            }
        }
        assert_eq!(winners.len(), 1);
        assert_eq!(fx.task("T1").await.owner, winners[0]);

        let live = fx.leases.find_live("T1").await.unwrap().unwrap();
        assert_eq!(live.holder, winners[0]);
        assert_eq!(fx.leases.list().await.unwrap().len(), 1);
        assert_eq!(fx.events().await.len(), 1);
    }

    #[tokio::test]
    async fn failed_claim_write_releases_its_lease_as_aborted() {
        let store = Arc::new(FailingTaskWrites::default());
        let fx = fixture_on(store.clone(), TransitionTable::standard());
        fx.create(serde_json::json!({"id": "T1", "title": "t"})).await;
        store.armed.store(true, Ordering::SeqCst);

        let etag = fx.etag().await;
        let err = fx
            .machine
            .transition("T1", TaskStatus::Claimed, &etag, "A")
            .await
            .unwrap_err();
        assert!(matches!(err, CollabError::StorageUnavailable(_)));
        assert!(fx.leases.list().await.unwrap().is_empty());
        assert_eq!(fx.task("T1").await.status, TaskStatus::Queued);

        let events = fx.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, types::LEASE_RELEASED);
        assert_eq!(events[0].actor, "A");
        assert_eq!(events[0].details["reason"], CLAIM_ABORTED);
    }
}

//! Status report: what the store currently holds, at a glance.

use std::collections::BTreeMap;

use serde::Serialize;

use super::journal::Journal;
use crate::domain::{Agent, AgentStatus, CollabError, Kind, Lease, Task, TaskStatus};
use crate::ports::{Clock, DocumentStore};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LeaseCounts {
    pub live: usize,
    /// Expired but not yet reclaimed.
    pub dead: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusReport {
    /// Every status is present, zero included.
    pub tasks: BTreeMap<TaskStatus, usize>,
    pub leases: LeaseCounts,
    pub agents: BTreeMap<AgentStatus, usize>,
    pub last_seq: u64,
    pub kinds: Vec<Kind>,
    pub tail_subscribers: usize,
}

impl StatusReport {
    pub async fn collect(
        store: &dyn DocumentStore,
        journal: &Journal,
        clock: &dyn Clock,
    ) -> Result<Self, CollabError> {
        let mut tasks: BTreeMap<TaskStatus, usize> =
            TaskStatus::ALL.into_iter().map(|status| (status, 0)).collect();
        for task in store.read_or_empty(&Kind::tasks()).await?.decode_all::<Task>()? {
            *tasks.entry(task.status).or_default() += 1;
        }

        let now = clock.now();
        let mut leases = LeaseCounts::default();
        for lease in store.read_or_empty(&Kind::leases()).await?.decode_all::<Lease>()? {
            if lease.is_live(now) {
                leases.live += 1;
            } else {
                leases.dead += 1;
            }
        }

        let mut agents = BTreeMap::new();
        for agent in store.read_or_empty(&Kind::agents()).await?.decode_all::<Agent>()? {
            *agents.entry(agent.status).or_default() += 1;
        }

        Ok(Self {
            tasks,
            leases,
            agents,
            last_seq: journal.last_seq().await?,
            kinds: store.kinds().await?,
            tail_subscribers: journal.subscriber_count(),
        })
    }

    pub fn total_tasks(&self) -> usize {
        self.tasks.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::TailOptions;
    use crate::domain::{ETag, LockId, NewEvent};
    use crate::impls::{InMemoryDocumentStore, InMemoryEventLog};
    use crate::ports::FixedClock;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;
    use std::sync::Arc;
    use ulid::Ulid;

    #[tokio::test]
    async fn counts_tasks_leases_and_agents() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(t0));
        let store = InMemoryDocumentStore::new();
        let journal = Journal::new(
            Arc::new(InMemoryEventLog::new(clock.clone())),
            16,
            TailOptions::default(),
        );

        let live = Lease::new(LockId::from_ulid(Ulid::new()), "T1", "a", 600, t0);
        let dead = Lease::new(LockId::from_ulid(Ulid::new()), "T2", "b", 10, t0);
        store
            .write(&Kind::leases(), &ETag::initial(), Box::new(|items| {
                items.insert(live.lock_id.to_string(), serde_json::to_value(&live)?);
                items.insert(dead.lock_id.to_string(), serde_json::to_value(&dead)?);
                Ok(())
            }))
            .await
            .unwrap();
        store
            .write(&Kind::tasks(), &ETag::initial(), Box::new(|items| {
                for (id, status) in [("T1", "claimed"), ("T2", "queued"), ("T3", "queued")] {
                    items.insert(
                        id.into(),
                        json!({"id": id, "title": id, "status": status, "created_at": t0, "updated_at": t0}),
                    );
                }
                Ok(())
            }))
            .await
            .unwrap();
        journal
            .append(NewEvent::new("progress", "a", "T1", json!({})))
            .await
            .unwrap();
        clock.advance(Duration::seconds(60));

        let report = StatusReport::collect(&store, &journal, &*clock).await.unwrap();
        assert_eq!(report.tasks[&TaskStatus::Queued], 2);
        assert_eq!(report.tasks[&TaskStatus::Claimed], 1);
        assert_eq!(report.tasks[&TaskStatus::Done], 0);
        assert_eq!(report.total_tasks(), 3);
        assert_eq!(report.leases, LeaseCounts { live: 1, dead: 1 });
        assert!(report.agents.is_empty());
        assert_eq!(report.last_seq, 1);
        assert_eq!(report.kinds, vec![Kind::leases(), Kind::tasks()]);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["tasks"]["in_progress"], 0);
    }
}

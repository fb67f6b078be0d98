//! LeaseManager - TTL-bounded exclusive holds on named resources.
//!
//! Leases live in the `leases` collection keyed by `lock_id` and are changed
//! only through guarded writes, so two acquirers racing on the same etag
//! cannot both win. Liveness is evaluated inside the mutator against the
//! items being replaced, never against an earlier read.
//!
//! Journaled: `lease_released` (release) and `lease_reclaimed` (reclaim, or a
//! dead lease replaced by acquire). Acquire and heartbeat are not journaled.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use super::journal::Journal;
use super::retry::RetryPolicy;
use crate::domain::events::types;
use crate::domain::{CollabError, Items, Kind, Lease, LeaseView, LockId, NewEvent};
use crate::ports::{Clock, DocumentStore, IdGenerator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    pub default_ttl_seconds: u64,
    pub max_ttl_seconds: u64,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 60,
            max_ttl_seconds: 3600,
        }
    }
}

pub struct LeaseManager {
    store: Arc<dyn DocumentStore>,
    journal: Arc<Journal>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    policy: LeasePolicy,
    retry: RetryPolicy,
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        journal: Arc<Journal>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        policy: LeasePolicy,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            journal,
            clock,
            ids,
            policy,
            retry,
        }
    }

    pub fn policy(&self) -> LeasePolicy {
        self.policy
    }

    /// Acquire `resource` for `holder`. `ttl_seconds` defaults to the policy's
    /// default TTL.
    ///
    /// Fails with `LeaseHeld` while any live lease exists on the resource,
    /// including one held by `holder` itself (heartbeat that one instead).
    pub async fn acquire(
        &self,
        resource: &str,
        holder: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<Lease, CollabError> {
        require_non_empty("resource", resource)?;
        require_non_empty("holder", holder)?;
        let ttl_seconds = ttl_seconds.unwrap_or(self.policy.default_ttl_seconds);
        if ttl_seconds == 0 || ttl_seconds > self.policy.max_ttl_seconds {
            return Err(CollabError::InvalidArgument(format!(
                "ttl_seconds must be in 1..={}",
                self.policy.max_ttl_seconds
            )));
        }

        let (lease, replaced) = self
            .with_retry("acquire", || self.try_acquire(resource, holder, ttl_seconds))
            .await?;

        info!(lock_id = %lease.lock_id, resource, holder, ttl_seconds, "lease acquired");
        for dead in replaced {
            self.record(
                types::LEASE_RECLAIMED,
                holder,
                &dead,
                json!({
                    "lock_id": dead.lock_id,
                    "holder": dead.holder,
                    "expired_at": dead.expires_at(),
                    "replaced_by": lease.lock_id,
                }),
            )
            .await;
        }
        Ok(lease)
    }

    async fn try_acquire(
        &self,
        resource: &str,
        holder: &str,
        ttl_seconds: u64,
    ) -> Result<(Lease, Vec<Lease>), CollabError> {
        let snapshot = self.store.read_or_empty(&Kind::leases()).await?;
        let now = self.clock.now();
        let lease = Lease::new(self.ids.generate_lock_id(), resource, holder, ttl_seconds, now);

        let mut replaced = Vec::new();
        self.store
            .write(
                &Kind::leases(),
                &snapshot.etag,
                Box::new(|items| {
                    for existing in leases_on(items, resource)? {
                        if existing.is_live(now) {
                            return Err(CollabError::LeaseHeld {
                                resource: resource.to_string(),
                                holder: existing.holder,
                                lock_id: existing.lock_id,
                            });
                        }
                        items.remove(&existing.lock_id.to_string());
                        replaced.push(existing);
                    }
                    items.insert(lease.lock_id.to_string(), serde_json::to_value(&lease)?);
                    Ok(())
                }),
            )
            .await?;
        Ok((lease, replaced))
    }

    /// Extend a live lease. Dead leases fail with `LeaseExpired`.
    pub async fn heartbeat(&self, lock_id: LockId, holder: &str) -> Result<Lease, CollabError> {
        let lease = self
            .with_retry("heartbeat", || self.try_heartbeat(lock_id, holder))
            .await?;
        debug!(%lock_id, holder, heartbeat_at = %lease.heartbeat_at, "lease heartbeat");
        Ok(lease)
    }

    async fn try_heartbeat(&self, lock_id: LockId, holder: &str) -> Result<Lease, CollabError> {
        let snapshot = self.store.read_or_empty(&Kind::leases()).await?;
        let now = self.clock.now();

        let mut renewed = None;
        self.store
            .write(
                &Kind::leases(),
                &snapshot.etag,
                Box::new(|items| {
                    let mut lease = lease_in(items, lock_id)?;
                    if !lease.is_held_by(holder) {
                        return Err(CollabError::NotHolder {
                            lock_id,
                            caller: holder.to_string(),
                        });
                    }
                    if !lease.is_live(now) {
                        return Err(CollabError::LeaseExpired { lock_id });
                    }
                    lease.heartbeat_at = now;
                    items.insert(lock_id.to_string(), serde_json::to_value(&lease)?);
                    renewed = Some(lease);
                    Ok(())
                }),
            )
            .await?;
        renewed.ok_or_else(|| CollabError::not_found(format!("lease {lock_id}")))
    }

    /// Holder-only delete, live or dead.
    pub async fn release(&self, lock_id: LockId, holder: &str) -> Result<Lease, CollabError> {
        self.release_logged(lock_id, holder, None).await
    }

    /// [`release`](Self::release), with `reason` added to the event details.
    pub async fn release_with_reason(
        &self,
        lock_id: LockId,
        holder: &str,
        reason: &str,
    ) -> Result<Lease, CollabError> {
        self.release_logged(lock_id, holder, Some(reason)).await
    }

    async fn release_logged(
        &self,
        lock_id: LockId,
        holder: &str,
        reason: Option<&str>,
    ) -> Result<Lease, CollabError> {
        let (lease, was_live) = self
            .with_retry("release", || self.try_remove(lock_id, Removal::Release { holder }))
            .await?;

        info!(%lock_id, resource = %lease.resource, holder, was_live, reason, "lease released");
        let mut details = json!({"lock_id": lock_id, "was_live": was_live});
        if let Some(reason) = reason {
            details["reason"] = json!(reason);
        }
        self.record(types::LEASE_RELEASED, holder, &lease, details).await;
        Ok(lease)
    }

    /// Delete a dead lease. Anyone may call this; live leases fail with
    /// `LeaseStillLive`.
    pub async fn reclaim(&self, lock_id: LockId, actor: &str) -> Result<Lease, CollabError> {
        let (lease, _) = self
            .with_retry("reclaim", || self.try_remove(lock_id, Removal::Reclaim))
            .await?;

        info!(%lock_id, resource = %lease.resource, holder = %lease.holder, actor, "lease reclaimed");
        self.record(
            types::LEASE_RECLAIMED,
            actor,
            &lease,
            json!({
                "lock_id": lock_id,
                "holder": lease.holder,
                "expired_at": lease.expires_at(),
            }),
        )
        .await;
        Ok(lease)
    }

    async fn try_remove(
        &self,
        lock_id: LockId,
        removal: Removal<'_>,
    ) -> Result<(Lease, bool), CollabError> {
        let snapshot = self.store.read_or_empty(&Kind::leases()).await?;
        let now = self.clock.now();

        let mut removed = None;
        self.store
            .write(
                &Kind::leases(),
                &snapshot.etag,
                Box::new(|items| {
                    let lease = lease_in(items, lock_id)?;
                    let live = lease.is_live(now);
                    match removal {
                        Removal::Release { holder } if !lease.is_held_by(holder) => {
                            return Err(CollabError::NotHolder {
                                lock_id,
                                caller: holder.to_string(),
                            });
                        }
                        Removal::Reclaim if live => {
                            return Err(CollabError::LeaseStillLive { lock_id });
                        }
                        _ => {}
                    }
                    items.remove(&lock_id.to_string());
                    removed = Some((lease, live));
                    Ok(())
                }),
            )
            .await?;
        removed.ok_or_else(|| CollabError::not_found(format!("lease {lock_id}")))
    }

    /// Release `holder`'s lease on `resource`, if there is one.
    pub async fn release_resource(
        &self,
        resource: &str,
        holder: &str,
    ) -> Result<Option<Lease>, CollabError> {
        let snapshot = self.store.read_or_empty(&Kind::leases()).await?;
        let held = leases_on(&snapshot.items, resource)?
            .into_iter()
            .find(|lease| lease.is_held_by(holder));
        match held {
            Some(lease) => match self.release(lease.lock_id, holder).await {
                Ok(lease) => Ok(Some(lease)),
                Err(CollabError::NotFound { .. }) => Ok(None),
                Err(e) => Err(e),
            },
            None => Ok(None),
        }
    }

    pub async fn get(&self, lock_id: LockId) -> Result<LeaseView, CollabError> {
        let snapshot = self.store.read_or_empty(&Kind::leases()).await?;
        let lease = lease_in(&snapshot.items, lock_id)?;
        Ok(LeaseView::at(lease, self.clock.now()))
    }

    /// Every stored lease with liveness as of now, oldest first.
    pub async fn list(&self) -> Result<Vec<LeaseView>, CollabError> {
        let snapshot = self.store.read_or_empty(&Kind::leases()).await?;
        let now = self.clock.now();
        let mut views: Vec<LeaseView> = snapshot
            .decode_all::<Lease>()?
            .into_iter()
            .map(|lease| LeaseView::at(lease, now))
            .collect();
        views.sort_by_key(|view| view.lease.acquired_at);
        Ok(views)
    }

    pub async fn find_live(&self, resource: &str) -> Result<Option<Lease>, CollabError> {
        let snapshot = self.store.read_or_empty(&Kind::leases()).await?;
        let now = self.clock.now();
        Ok(leases_on(&snapshot.items, resource)?
            .into_iter()
            .find(|lease| lease.is_live(now)))
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, mut attempt_once: F) -> Result<T, CollabError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CollabError>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match attempt_once().await {
                Err(e) if e.is_retryable() && self.retry.should_retry(attempts) => {
                    debug!(op, attempts, "lease write raced another writer, retrying");
                    self.retry.wait(attempts).await;
                }
                other => return other,
            }
        }
    }

    async fn record(&self, event_type: &str, actor: &str, lease: &Lease, details: serde_json::Value) {
        let event = NewEvent::new(event_type, actor, lease.resource.clone(), details);
        if let Err(e) = self.journal.append(event).await {
            warn!(event_type, lock_id = %lease.lock_id, error = %e, "lease event not journaled");
        }
    }
}

#[derive(Clone, Copy)]
enum Removal<'a> {
    Release { holder: &'a str },
    Reclaim,
}

fn require_non_empty(field: &str, value: &str) -> Result<(), CollabError> {
    if value.trim().is_empty() {
        return Err(CollabError::InvalidArgument(format!("{field} cannot be empty")));
    }
    Ok(())
}

fn lease_in(items: &Items, lock_id: LockId) -> Result<Lease, CollabError> {
    let value = items
        .get(&lock_id.to_string())
        .ok_or_else(|| CollabError::not_found(format!("lease {lock_id}")))?;
    Ok(serde_json::from_value(value.clone())?)
}

fn leases_on(items: &Items, resource: &str) -> Result<Vec<Lease>, CollabError> {
    let mut found = Vec::new();
    for value in items.values() {
        let lease: Lease = serde_json::from_value(value.clone())?;
        if lease.resource == resource {
            found.push(lease);
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::TailOptions;
    use crate::impls::{InMemoryDocumentStore, InMemoryEventLog};
    use crate::ports::{FixedClock, UlidGenerator};
    use chrono::{Duration, TimeZone, Utc};

    struct Fixture {
        clock: Arc<FixedClock>,
        journal: Arc<Journal>,
        leases: Arc<LeaseManager>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()));
        let journal = Arc::new(Journal::new(
            Arc::new(InMemoryEventLog::new(clock.clone())),
            16,
            TailOptions::default(),
        ));
        let leases = Arc::new(LeaseManager::new(
            Arc::new(InMemoryDocumentStore::new()),
            Arc::clone(&journal),
            clock.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
            LeasePolicy::default(),
            RetryPolicy::immediate(16),
        ));
        Fixture {
            clock,
            journal,
            leases,
        }
    }

    #[tokio::test]
    async fn second_holder_is_refused_while_lease_is_live() {
        let fx = fixture();
        let lease = fx.leases.acquire("T1", "agent-a", Some(60)).await.unwrap();

        let err = fx.leases.acquire("T1", "agent-b", Some(60)).await.unwrap_err();
        match err {
            CollabError::LeaseHeld { holder, lock_id, .. } => {
                assert_eq!(holder, "agent-a");
                assert_eq!(lock_id, lease.lock_id);
            }
            other => panic!("expected LeaseHeld, got {other}"),
        }

        // Other resources are independent.
        fx.leases.acquire("T2", "agent-b", Some(60)).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_acquires_have_one_winner() {
        let fx = fixture();
        let mut joins = Vec::new();
        for n in 0..12 {
            let leases = Arc::clone(&fx.leases);
            joins.push(tokio::spawn(async move {
                leases.acquire("T1", &format!("agent-{n}"), Some(60)).await
            }));
        }

        let mut winners = 0;
        for join in joins {
            match join.await.unwrap() {
                Ok(_) => winners += 1,
                Err(CollabError::LeaseHeld { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(fx.leases.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_extends_and_checks_holder() {
        let fx = fixture();
        let lease = fx.leases.acquire("T1", "agent-a", Some(60)).await.unwrap();

        fx.clock.advance(Duration::seconds(50));
        let renewed = fx.leases.heartbeat(lease.lock_id, "agent-a").await.unwrap();
        assert_eq!(renewed.heartbeat_at, fx.clock.now());

        fx.clock.advance(Duration::seconds(50));
        assert!(fx.leases.find_live("T1").await.unwrap().is_some());

        let err = fx.leases.heartbeat(lease.lock_id, "agent-b").await.unwrap_err();
        assert!(matches!(err, CollabError::NotHolder { .. }));
    }

    #[tokio::test]
    async fn heartbeat_on_dead_lease_is_expired() {
        let fx = fixture();
        let lease = fx.leases.acquire("T1", "agent-a", Some(60)).await.unwrap();
        fx.clock.advance(Duration::seconds(61));

        let err = fx.leases.heartbeat(lease.lock_id, "agent-a").await.unwrap_err();
        assert!(matches!(err, CollabError::LeaseExpired { .. }));
    }

    #[tokio::test]
    async fn release_is_holder_only_and_journaled() {
        let fx = fixture();
        let lease = fx.leases.acquire("T1", "agent-a", None).await.unwrap();
        assert_eq!(lease.ttl_seconds, LeasePolicy::default().default_ttl_seconds);

        let err = fx.leases.release(lease.lock_id, "agent-b").await.unwrap_err();
        assert!(matches!(err, CollabError::NotHolder { .. }));

        fx.leases.release(lease.lock_id, "agent-a").await.unwrap();
        let err = fx.leases.release(lease.lock_id, "agent-a").await.unwrap_err();
        assert!(matches!(err, CollabError::NotFound { .. }));

        let events = fx.journal.read_since(0).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, types::LEASE_RELEASED);
        assert_eq!(events[0].target, "T1");
        assert_eq!(events[0].actor, "agent-a");
    }

    #[tokio::test]
    async fn reclaim_requires_a_dead_lease() {
        let fx = fixture();
        let lease = fx.leases.acquire("T1", "agent-a", Some(60)).await.unwrap();

        let err = fx.leases.reclaim(lease.lock_id, "sweeper").await.unwrap_err();
        assert!(matches!(err, CollabError::LeaseStillLive { .. }));

        fx.clock.advance(Duration::seconds(70));
        let reclaimed = fx.leases.reclaim(lease.lock_id, "sweeper").await.unwrap();
        assert_eq!(reclaimed.holder, "agent-a");
        assert!(fx.leases.list().await.unwrap().is_empty());

        let events = fx.journal.read_since(0).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, types::LEASE_RECLAIMED);
        assert_eq!(events[0].details["holder"], "agent-a");

        // The resource is claimable again.
        fx.leases.acquire("T1", "agent-b", Some(60)).await.unwrap();
    }

    #[tokio::test]
    async fn acquire_over_dead_lease_replaces_and_journals_it() {
        let fx = fixture();
        let dead = fx.leases.acquire("T1", "agent-a", Some(10)).await.unwrap();
        fx.clock.advance(Duration::seconds(11));

        let fresh = fx.leases.acquire("T1", "agent-b", Some(60)).await.unwrap();
        let views = fx.leases.list().await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].lease.lock_id, fresh.lock_id);
        assert!(views[0].live);

        let events = fx.journal.read_since(0).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, types::LEASE_RECLAIMED);
        assert_eq!(events[0].details["lock_id"], dead.lock_id.to_string());
    }

    #[tokio::test]
    async fn ttl_outside_policy_is_invalid() {
        let fx = fixture();
        for ttl in [0, 3601] {
            let err = fx.leases.acquire("T1", "agent-a", Some(ttl)).await.unwrap_err();
            assert!(matches!(err, CollabError::InvalidArgument(_)));
        }
    }

    #[tokio::test]
    async fn release_resource_finds_holders_lease() {
        let fx = fixture();
        fx.leases.acquire("T1", "agent-a", Some(60)).await.unwrap();
        assert!(fx.leases.release_resource("T1", "agent-b").await.unwrap().is_none());
        assert!(fx.leases.release_resource("T1", "agent-a").await.unwrap().is_some());
        assert!(fx.leases.find_live("T1").await.unwrap().is_none());
    }
}

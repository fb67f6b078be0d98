//! Lease record (a document of the `leases` kind, keyed by `lock_id`).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::ids::LockId;

/// Time-bounded exclusive hold on `resource`.
///
/// Live iff `now <= heartbeat_at + ttl_seconds`. A dead lease is not removed
/// by the passage of time; it stays on disk until someone reclaims it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub lock_id: LockId,
    pub resource: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub heartbeat_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(
        lock_id: LockId,
        resource: impl Into<String>,
        holder: impl Into<String>,
        ttl_seconds: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            lock_id,
            resource: resource.into(),
            holder: holder.into(),
            acquired_at: now,
            ttl_seconds,
            heartbeat_at: now,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        i64::try_from(self.ttl_seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|ttl| self.heartbeat_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at()
    }

    pub fn is_held_by(&self, holder: &str) -> bool {
        self.holder == holder
    }
}

/// A lease together with its liveness at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseView {
    #[serde(flatten)]
    pub lease: Lease,
    pub live: bool,
    pub expires_at: DateTime<Utc>,
}

impl LeaseView {
    pub fn at(lease: Lease, now: DateTime<Utc>) -> Self {
        Self {
            live: lease.is_live(now),
            expires_at: lease.expires_at(),
            lease,
        }
    }
}

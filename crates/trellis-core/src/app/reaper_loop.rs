//! ReaperLoop - periodic reclaim of dead leases.
//!
//! Each tick lists the leases and reclaims the dead ones, so abandoned work
//! becomes claimable without waiting for another acquirer. A tick is
//! idempotent: races with a concurrent reclaim (`NotFound`) or a last-moment
//! heartbeat (`LeaseStillLive`) are skipped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::lease_manager::LeaseManager;
use crate::domain::{CollabError, ErrorKind, LockId};

pub const REAPER_ACTOR: &str = "reaper";

pub struct ReaperLoop {
    leases: Arc<LeaseManager>,
    actor: String,
}

impl ReaperLoop {
    pub fn new(leases: Arc<LeaseManager>) -> Self {
        Self {
            leases,
            actor: REAPER_ACTOR.to_string(),
        }
    }

    /// Actor recorded on `lease_reclaimed` events.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    /// One sweep. Returns the lock ids reclaimed by this call.
    pub async fn sweep_once(&self) -> Result<Vec<LockId>, CollabError> {
        let mut reclaimed = Vec::new();
        for view in self.leases.list().await? {
            if view.live {
                continue;
            }
            let lock_id = view.lease.lock_id;
            match self.leases.reclaim(lock_id, &self.actor).await {
                Ok(_) => reclaimed.push(lock_id),
                Err(CollabError::NotFound { .. } | CollabError::LeaseStillLive { .. }) => {
                    debug!(%lock_id, "lease changed during sweep, skipping");
                }
                Err(e) if e.kind() == ErrorKind::Infrastructure => return Err(e),
                Err(e) => warn!(%lock_id, error = %e, "reclaim failed"),
            }
        }
        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "sweep reclaimed dead leases");
        }
        Ok(reclaimed)
    }

    /// Run `sweep_once` every `interval` until shutdown is requested.
    pub fn spawn(self, interval: Duration) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        // Handle dropped.
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    _ = ticker.tick() => {}
                }
                if let Err(e) = self.sweep_once().await {
                    warn!(error = %e, "lease sweep failed");
                }
            }
            debug!("reaper stopped");
        });
        ReaperHandle { shutdown_tx, join }
    }
}

/// Handle of a spawned [`ReaperLoop`]. Dropping it stops the loop too.
pub struct ReaperHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperHandle {
    /// An in-flight sweep finishes; no new one starts.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// True once the loop has exited, including by panic.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(e) = self.join.await {
            warn!(error = %e, panicked = e.is_panic(), "reaper task ended abnormally");
        }
    }
}

//! DirLock - one owning process per data directory file set.
//!
//! `acquire` writes the owner record (pid, host, time) to a unique pending
//! file and hard-links it to the lock name. The link fails if a lock already
//! exists, so a second opener never sees a half-written record and never
//! replaces a live one. A record whose pid no longer runs on this host is
//! stale: it is removed and the link retried once.
//!
//! The guard removes the lock file on drop.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::domain::CollabError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockOwner {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            hostname: hostname(),
            acquired_at: Utc::now(),
        }
    }

    /// Owners on another host cannot be probed and count as alive.
    pub fn is_alive(&self) -> bool {
        self.hostname != hostname() || is_process_running(self.pid)
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only checks that the pid exists and may be signalled.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    true
}

#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
}

impl DirLock {
    /// Take `<dir>/<name>`, failing with [`CollabError::DirLocked`] while a
    /// live process holds it.
    pub async fn acquire(dir: &Path, name: &str) -> Result<Self, CollabError> {
        let path = dir.join(name);
        let owner = LockOwner::current();
        let pending = dir.join(format!("{name}.{}.pending", Ulid::new()));

        fs::write(&pending, serde_json::to_vec(&owner)?)
            .await
            .map_err(|e| CollabError::storage(&format!("write {}", pending.display()), e))?;
        let linked = link_exclusive(&pending, &path).await;
        if let Err(e) = fs::remove_file(&pending).await {
            warn!(path = %pending.display(), error = %e, "pending lock file not removed");
        }
        linked?;

        debug!(path = %path.display(), pid = owner.pid, "data directory lock acquired");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn link_exclusive(pending: &Path, path: &Path) -> Result<(), CollabError> {
    for _ in 0..2 {
        match fs::hard_link(pending, path).await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(CollabError::storage(&format!("lock {}", path.display()), e)),
        }

        match fs::read(path).await {
            Ok(bytes) => match serde_json::from_slice::<LockOwner>(&bytes) {
                Ok(owner) if owner.is_alive() => {
                    return Err(CollabError::DirLocked {
                        path: path.display().to_string(),
                        pid: owner.pid,
                    });
                }
                Ok(owner) => {
                    info!(path = %path.display(), stale_pid = owner.pid, "removing stale data directory lock");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "removing unreadable data directory lock");
                }
            },
            // Released between the link attempt and the read.
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(CollabError::storage(&format!("read {}", path.display()), e)),
        }

        match fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(CollabError::storage(&format!("remove {}", path.display()), e)),
        }
    }
    Err(CollabError::StorageUnavailable(format!(
        "{} changed owner while it was being taken",
        path.display()
    )))
}

impl Drop for DirLock {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "data directory lock released"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                if !std::thread::panicking() {
                    warn!(path = %self.path.display(), error = %e, "data directory lock not released");
                }
            }
        }
    }
}

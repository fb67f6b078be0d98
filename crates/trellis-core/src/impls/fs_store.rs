//! FsDocumentStore - one JSON file per kind under a data directory.
//!
//! # Write path
//! 1. take the per-kind mutex
//! 2. re-read `<kind>.json` and compare its etag with `if_match`
//! 3. apply the mutator, bump version, recompute etag
//! 4. write `.<kind>.json.<ulid>.tmp` in the same directory, `sync_all`
//! 5. rename over `<kind>.json`, then fsync the directory
//!
//! The live file is therefore always either the complete old or the complete
//! new collection. Temp files left by a crash between 4 and 5 are ignored by
//! readers and removed on the next `open`.
//!
//! The etag comparison in 2 is only as good as the mutex in 1, so `open` takes
//! `store.lock` and a second process opening the same directory is refused.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use ulid::Ulid;

use super::dir_lock::DirLock;
use super::guarded;
use crate::domain::{CollabError, ETag, Kind, Snapshot};
use crate::ports::{DocumentStore, Mutator};

const COLLECTION_EXT: &str = "json";
const TMP_SUFFIX: &str = ".tmp";
pub const STORE_LOCK_FILE: &str = "store.lock";

pub struct FsDocumentStore {
    root: PathBuf,
    /// Serializes writers of the same kind inside this process.
    write_locks: StdMutex<HashMap<Kind, Arc<Mutex<()>>>>,
    _dir_lock: DirLock,
}

impl FsDocumentStore {
    /// Open (creating if needed) a store rooted at `root`. Fails with
    /// [`CollabError::DirLocked`] while another store has it open.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, CollabError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| CollabError::storage(&format!("create {}", root.display()), e))?;
        let dir_lock = DirLock::acquire(&root, STORE_LOCK_FILE).await?;

        let store = Self {
            root,
            write_locks: StdMutex::new(HashMap::new()),
            _dir_lock: dir_lock,
        };
        store.remove_interrupted_writes().await;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, kind: &Kind) -> PathBuf {
        self.root.join(format!("{kind}.{COLLECTION_EXT}"))
    }

    fn tmp_path_for(&self, kind: &Kind) -> PathBuf {
        self.root
            .join(format!(".{kind}.{COLLECTION_EXT}.{}{TMP_SUFFIX}", Ulid::new()))
    }

    fn write_lock(&self, kind: &Kind) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(kind.clone()).or_default())
    }

    async fn remove_interrupted_writes(&self) {
        let Ok(mut entries) = fs::read_dir(&self.root).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') && name.ends_with(TMP_SUFFIX) {
                debug!(path = %entry.path().display(), "removing interrupted write");
                let _ = fs::remove_file(entry.path()).await;
            }
        }
    }

    async fn load(&self, kind: &Kind) -> Result<Snapshot, CollabError> {
        let path = self.path_for(kind);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CollabError::not_found(format!("collection {kind}")));
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "collection read failed");
                return Err(CollabError::storage(&format!("read {}", path.display()), e));
            }
        };

        let snapshot: Snapshot = serde_json::from_slice(&bytes).map_err(|e| {
            error!(path = %path.display(), error = %e, "collection file is not valid JSON");
            CollabError::storage(&format!("decode {}", path.display()), e)
        })?;

        // The stored etag must match the content; anything else means the file
        // was edited or damaged outside the store.
        let expected = ETag::compute(snapshot.version, &snapshot.items)?;
        if expected != snapshot.etag || &snapshot.kind != kind {
            error!(path = %path.display(), stored = %snapshot.etag, %expected, "collection integrity check failed");
            return Err(CollabError::StorageUnavailable(format!(
                "{} failed its integrity check",
                path.display()
            )));
        }
        Ok(snapshot)
    }

    async fn persist(&self, snapshot: &Snapshot) -> Result<(), CollabError> {
        let path = self.path_for(&snapshot.kind);
        let tmp_path = self.tmp_path_for(&snapshot.kind);
        let bytes = serde_json::to_vec_pretty(snapshot)?;

        if let Err(e) = write_synced(&tmp_path, &bytes).await {
            let _ = fs::remove_file(&tmp_path).await;
            error!(path = %tmp_path.display(), error = %e, "temp write failed");
            return Err(CollabError::storage(&format!("write {}", tmp_path.display()), e));
        }

        if let Err(e) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            error!(path = %path.display(), error = %e, "atomic rename failed");
            return Err(CollabError::storage(&format!("rename {}", path.display()), e));
        }

        // Make the rename itself durable. Not supported on every platform.
        match fs::File::open(&self.root).await {
            Ok(dir) => {
                if let Err(e) = dir.sync_all().await {
                    debug!(error = %e, "directory fsync unsupported");
                }
            }
            Err(e) => warn!(error = %e, "could not open data dir for fsync"),
        }
        Ok(())
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn read(&self, kind: &Kind) -> Result<Snapshot, CollabError> {
        self.load(kind).await
    }

    async fn write(
        &self,
        kind: &Kind,
        if_match: &ETag,
        mutator: Mutator<'_>,
    ) -> Result<ETag, CollabError> {
        let lock = self.write_lock(kind);
        let _guard = lock.lock().await;

        let current = match self.load(kind).await {
            Err(CollabError::NotFound { .. }) => Snapshot::empty(kind.clone()),
            other => other?,
        };
        let next = guarded::apply(&current, if_match, mutator)?;
        self.persist(&next).await?;

        debug!(%kind, version = next.version, etag = %next.etag, "collection replaced");
        Ok(next.etag)
    }

    async fn kinds(&self) -> Result<Vec<Kind>, CollabError> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| CollabError::storage(&format!("list {}", self.root.display()), e))?;

        let mut kinds = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CollabError::storage("list data dir", e))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(&format!(".{COLLECTION_EXT}"))
                && let Ok(kind) = Kind::new(stem)
            {
                kinds.push(kind);
            }
        }
        kinds.sort();
        Ok(kinds)
    }
}

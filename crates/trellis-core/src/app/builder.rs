//! AppBuilder - wiring of ports and services.
//!
//! `build` validates the configuration before it touches storage and fails
//! fast with every problem listed, instead of starting a half-configured
//! service.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use super::collections::Collections;
use super::journal::Journal;
use super::lease_manager::LeaseManager;
use super::reaper_loop::{ReaperHandle, ReaperLoop};
use super::reconcile::Reconciler;
use super::retry::RetryPolicy;
use super::status::StatusReport;
use super::task_machine::TaskStateMachine;
use crate::config::{ConfigError, TrellisConfig};
use crate::domain::CollabError;
use crate::impls::{FsDocumentStore, FsEventLog, InMemoryDocumentStore, InMemoryEventLog};
use crate::ports::{Clock, DocumentStore, EventLog, IdGenerator, SystemClock, UlidGenerator};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// `<kind>.json` files and `events.jsonl` under this directory.
    Filesystem(PathBuf),
    InMemory,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open storage: {0}")]
    Storage(#[from] CollabError),
}

pub struct AppBuilder {
    config: TrellisConfig,
    backend: Option<StorageBackend>,
    clock: Option<Arc<dyn Clock>>,
    retry: RetryPolicy,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            config: TrellisConfig::default(),
            backend: None,
            clock: None,
            retry: RetryPolicy::guarded_write(),
        }
    }

    pub fn config(mut self, config: TrellisConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to the filesystem under `config.data_dir`.
    pub fn backend(mut self, backend: StorageBackend) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn in_memory(self) -> Self {
        self.backend(StorageBackend::InMemory)
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn build(self) -> Result<App, BuildError> {
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let backend = self
            .backend
            .unwrap_or_else(|| StorageBackend::Filesystem(self.config.data_dir.clone()));

        let (store, log): (Arc<dyn DocumentStore>, Arc<dyn EventLog>) = match &backend {
            StorageBackend::Filesystem(dir) => (
                Arc::new(FsDocumentStore::open(dir).await?),
                Arc::new(FsEventLog::open(dir, Arc::clone(&clock)).await?),
            ),
            StorageBackend::InMemory => (
                Arc::new(InMemoryDocumentStore::new()),
                Arc::new(InMemoryEventLog::new(Arc::clone(&clock))),
            ),
        };
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));

        let journal = Arc::new(Journal::new(
            log,
            self.config.tail.subscriber_buffer,
            self.config.tail_options(),
        ));
        let collections = Arc::new(Collections::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&ids),
            self.retry.clone(),
        ));
        let leases = Arc::new(LeaseManager::new(
            Arc::clone(&store),
            Arc::clone(&journal),
            Arc::clone(&clock),
            ids,
            self.config.lease_policy(),
            self.retry,
        ));
        let tasks = Arc::new(TaskStateMachine::new(
            Arc::clone(&store),
            Arc::clone(&leases),
            Arc::clone(&journal),
            Arc::clone(&clock),
            self.config.transition_table(),
        ));
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&store), Arc::clone(&journal)));

        info!(?backend, last_seq = journal.last_seq().await?, "trellis app ready");
        Ok(App {
            config: self.config,
            backend,
            store,
            clock,
            journal,
            collections,
            leases,
            tasks,
            reconciler,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The wired services. Cheap to share behind an `Arc`.
pub struct App {
    pub config: TrellisConfig,
    pub backend: StorageBackend,
    pub store: Arc<dyn DocumentStore>,
    pub clock: Arc<dyn Clock>,
    pub journal: Arc<Journal>,
    pub collections: Arc<Collections>,
    pub leases: Arc<LeaseManager>,
    pub tasks: Arc<TaskStateMachine>,
    pub reconciler: Arc<Reconciler>,
}

impl App {
    pub async fn status(&self) -> Result<StatusReport, CollabError> {
        StatusReport::collect(self.store.as_ref(), &self.journal, self.clock.as_ref()).await
    }

    pub fn reaper(&self) -> ReaperLoop {
        ReaperLoop::new(Arc::clone(&self.leases))
    }

    /// Start the reclaim sweep at the configured interval.
    pub fn spawn_reaper(&self) -> ReaperHandle {
        self.reaper().spawn(self.config.sweep_interval())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Kind, TaskStatus};
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn invalid_config_fails_before_opening_storage() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let mut config = TrellisConfig {
            data_dir: data_dir.clone(),
            ..TrellisConfig::default()
        };
        config.leases.default_ttl_seconds = 0;
        config.tail.keepalive_seconds = 0;

        let err = AppBuilder::new().config(config).build().await.err().unwrap();
        match err {
            BuildError::Config(ConfigError::Invalid(problems)) => assert_eq!(problems.len(), 2),
            other => panic!("expected config error, got {other}"),
        }
        assert!(!data_dir.exists());
    }

    #[tokio::test]
    async fn filesystem_app_persists_across_rebuilds() {
        let dir = tempdir().unwrap();
        let config = TrellisConfig {
            data_dir: dir.path().to_path_buf(),
            ..TrellisConfig::default()
        };

        let app = AppBuilder::new().config(config.clone()).build().await.unwrap();
        let created = app
            .collections
            .create(&Kind::tasks(), json!({"id": "T1", "title": "t"}))
            .await
            .unwrap();
        let outcome = app
            .tasks
            .transition("T1", TaskStatus::Claimed, &created.etag, "A")
            .await
            .unwrap();
        assert_eq!(outcome.seq, Some(1));
        drop(app);

        let app = AppBuilder::new().config(config).build().await.unwrap();
        let status = app.status().await.unwrap();
        assert_eq!(status.tasks[&TaskStatus::Claimed], 1);
        assert_eq!(status.leases.live, 1);
        assert_eq!(status.last_seq, 1);
        assert!(dir.path().join("tasks.json").exists());
        assert!(dir.path().join("events.jsonl").exists());
    }

    #[tokio::test]
    async fn in_memory_backend_ignores_data_dir() {
        let app = AppBuilder::new().in_memory().build().await.unwrap();
        assert_eq!(app.backend, StorageBackend::InMemory);
        assert_eq!(app.status().await.unwrap().total_tasks(), 0);
        assert!(app.reaper().sweep_once().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_app_on_the_same_data_dir_is_refused() {
        let dir = tempdir().unwrap();
        let config = TrellisConfig {
            data_dir: dir.path().to_path_buf(),
            ..TrellisConfig::default()
        };
        let serving = AppBuilder::new().config(config.clone()).build().await.unwrap();

        let err = AppBuilder::new().config(config.clone()).build().await.err().unwrap();
        assert!(
            matches!(err, BuildError::Storage(CollabError::DirLocked { .. })),
            "{err}"
        );

        // The running app keeps appending with gap-free seqs.
        let created = serving
            .collections
            .create(&Kind::tasks(), json!({"id": "T1", "title": "t"}))
            .await
            .unwrap();
        let outcome = serving
            .tasks
            .transition("T1", TaskStatus::Claimed, &created.etag, "A")
            .await
            .unwrap();
        assert_eq!(outcome.seq, Some(1));

        drop(serving);
        let reopened = AppBuilder::new().config(config).build().await.unwrap();
        assert_eq!(reopened.status().await.unwrap().last_seq, 1);
    }
}

//! InMemoryDocumentStore - non-durable store for tests and embedding.
//!
//! Same guarded-write semantics as the filesystem store; one async mutex
//! covers all kinds.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::guarded;
use crate::domain::{CollabError, ETag, Kind, Snapshot};
use crate::ports::{DocumentStore, Mutator};

#[derive(Default)]
pub struct InMemoryDocumentStore {
    collections: Mutex<HashMap<Kind, Snapshot>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn read(&self, kind: &Kind) -> Result<Snapshot, CollabError> {
        self.collections
            .lock()
            .await
            .get(kind)
            .cloned()
            .ok_or_else(|| CollabError::not_found(format!("collection {kind}")))
    }

    async fn write(
        &self,
        kind: &Kind,
        if_match: &ETag,
        mutator: Mutator<'_>,
    ) -> Result<ETag, CollabError> {
        let mut collections = self.collections.lock().await;
        let next = {
            let current = collections
                .get(kind)
                .cloned()
                .unwrap_or_else(|| Snapshot::empty(kind.clone()));
            guarded::apply(&current, if_match, mutator)?
        };
        let etag = next.etag.clone();
        collections.insert(kind.clone(), next);
        Ok(etag)
    }

    async fn kinds(&self) -> Result<Vec<Kind>, CollabError> {
        let mut kinds: Vec<Kind> = self.collections.lock().await.keys().cloned().collect();
        kinds.sort();
        Ok(kinds)
    }
}

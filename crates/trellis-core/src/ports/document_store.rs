//! DocumentStore port: the single guarded-write primitive.
//!
//! # Contract
//! - `read(kind)` returns the current items and etag, or `NotFound` if the
//!   kind was never written.
//! - `write(kind, if_match, mutator)` runs `mutator` on the current items and
//!   atomically replaces the collection, but only if the current etag equals
//!   `if_match`. Of N writers presenting the same etag exactly one succeeds;
//!   the rest get `PreconditionFailed`.
//! - A mutator error aborts the write and leaves the collection untouched.
//! - A never-written kind has etag [`ETag::initial`]; writing against it
//!   with that etag creates the collection.

use async_trait::async_trait;

use crate::domain::{CollabError, ETag, Items, Kind, Snapshot};

/// Candidate-state function applied to the current items.
///
/// Borrowing (`'a`) lets callers capture `&mut` locals to carry results out
/// of the write.
pub type Mutator<'a> = Box<dyn FnOnce(&mut Items) -> Result<(), CollabError> + Send + 'a>;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn read(&self, kind: &Kind) -> Result<Snapshot, CollabError>;

    async fn write(
        &self,
        kind: &Kind,
        if_match: &ETag,
        mutator: Mutator<'_>,
    ) -> Result<ETag, CollabError>;

    /// Kinds that currently have a stored collection.
    async fn kinds(&self) -> Result<Vec<Kind>, CollabError>;

    /// `read`, with a missing kind reported as the empty collection.
    async fn read_or_empty(&self, kind: &Kind) -> Result<Snapshot, CollabError> {
        match self.read(kind).await {
            Err(CollabError::NotFound { .. }) => Ok(Snapshot::empty(kind.clone())),
            other => other,
        }
    }
}

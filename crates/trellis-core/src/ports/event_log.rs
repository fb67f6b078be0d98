//! EventLog port: append-only, gap-free, seq-ordered.
//!
//! Implementations assign `seq` under their own lock so concurrent appenders
//! get a single total order; `ts` is read from the injected clock.

use async_trait::async_trait;

use crate::domain::{CollabError, Event, NewEvent};

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Persist `event` with the next seq and return the stored record.
    async fn append(&self, event: NewEvent) -> Result<Event, CollabError>;

    /// All records with `seq > after`, oldest first.
    async fn read_since(&self, after: u64) -> Result<Vec<Event>, CollabError>;

    /// Seq of the newest record, 0 when empty.
    async fn last_seq(&self) -> Result<u64, CollabError>;
}

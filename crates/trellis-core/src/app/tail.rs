//! Live tail of the event log, resumable by seq.
//!
//! A subscription is registered with the broadcaster before the replay read,
//! so nothing appended in between is missed; anything seen twice is dropped by
//! seq. When the live queue lags, or a live event arrives out of order, the
//! subscription resyncs from the log instead of blocking appenders.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::{CollabError, Event};
use crate::ports::EventLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailOptions {
    /// Idle period after which a keep-alive is yielded.
    pub keepalive: Duration,
    /// End the subscription after this long without events.
    pub idle_timeout: Option<Duration>,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(15),
            idle_timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TailItem {
    Event(Event),
    /// Nothing new; `cursor` is the last seq delivered.
    KeepAlive { cursor: u64 },
}

pub struct TailSubscription {
    log: Arc<dyn EventLog>,
    live: broadcast::Receiver<Event>,
    cursor: u64,
    backlog: VecDeque<Event>,
    options: TailOptions,
    last_event_at: Instant,
    closed: bool,
}

impl TailSubscription {
    pub(crate) async fn open(
        log: Arc<dyn EventLog>,
        live: broadcast::Receiver<Event>,
        since: u64,
        options: TailOptions,
    ) -> Result<Self, CollabError> {
        let backlog = log.read_since(since).await?;
        debug!(since, replay = backlog.len(), "tail subscription opened");
        Ok(Self {
            log,
            live,
            cursor: since,
            backlog: backlog.into(),
            options,
            last_event_at: Instant::now(),
            closed: false,
        })
    }

    /// Seq of the last event yielded (or the starting cursor).
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Next item, or `None` once the subscription ended (idle timeout or the
    /// journal went away).
    pub async fn next(&mut self) -> Option<Result<TailItem, CollabError>> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                if event.seq <= self.cursor {
                    continue;
                }
                return Some(Ok(self.deliver(event)));
            }
            if self.closed {
                return None;
            }

            let idle_remaining = self
                .options
                .idle_timeout
                .map(|limit| limit.saturating_sub(self.last_event_at.elapsed()));
            if idle_remaining == Some(Duration::ZERO) {
                debug!(cursor = self.cursor, "tail idle timeout");
                self.closed = true;
                return None;
            }
            let wait = idle_remaining.map_or(self.options.keepalive, |r| r.min(self.options.keepalive));

            match tokio::time::timeout(wait, self.live.recv()).await {
                Err(_) => {
                    if idle_remaining.is_some_and(|r| r <= wait) {
                        debug!(cursor = self.cursor, "tail idle timeout");
                        self.closed = true;
                        return None;
                    }
                    return Some(Ok(TailItem::KeepAlive { cursor: self.cursor }));
                }
                Ok(Ok(event)) if event.seq <= self.cursor => {}
                Ok(Ok(event)) if event.seq == self.cursor + 1 => {
                    return Some(Ok(self.deliver(event)));
                }
                Ok(Ok(event)) => {
                    debug!(cursor = self.cursor, got = event.seq, "tail gap, resyncing");
                    if let Err(e) = self.resync().await {
                        return Some(Err(e));
                    }
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    warn!(cursor = self.cursor, skipped, "tail subscriber lagged, resyncing from log");
                    if let Err(e) = self.resync().await {
                        return Some(Err(e));
                    }
                }
                Ok(Err(RecvError::Closed)) => {
                    // Drain whatever the log has, then end.
                    self.closed = true;
                    if let Err(e) = self.resync().await {
                        return Some(Err(e));
                    }
                }
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<TailItem, CollabError>> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            let item = sub.next().await?;
            Some((item, sub))
        })
    }

    fn deliver(&mut self, event: Event) -> TailItem {
        self.cursor = event.seq;
        self.last_event_at = Instant::now();
        TailItem::Event(event)
    }

    async fn resync(&mut self) -> Result<(), CollabError> {
        let missed = self.log.read_since(self.cursor).await?;
        self.backlog.extend(missed);
        Ok(())
    }
}

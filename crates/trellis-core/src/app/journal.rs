//! Journal - the event log plus its live-tail broadcaster.
//!
//! `append` writes to the log first and only then broadcasts. A failed or
//! unheard broadcast loses nothing: subscribers recover through `read_since`.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use super::tail::{TailOptions, TailSubscription};
use crate::domain::{CollabError, Event, NewEvent};
use crate::ports::EventLog;

pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

pub struct Journal {
    log: Arc<dyn EventLog>,
    live: broadcast::Sender<Event>,
    tail_options: TailOptions,
}

impl Journal {
    /// `subscriber_buffer` bounds each subscriber's live queue; a slower
    /// subscriber lags and resyncs from the log.
    pub fn new(log: Arc<dyn EventLog>, subscriber_buffer: usize, tail_options: TailOptions) -> Self {
        let (live, _) = broadcast::channel(subscriber_buffer.max(1));
        Self {
            log,
            live,
            tail_options,
        }
    }

    pub async fn append(&self, event: NewEvent) -> Result<Event, CollabError> {
        if event.event_type.trim().is_empty() {
            return Err(CollabError::InvalidArgument("event type cannot be empty".into()));
        }

        let event = self.log.append(event).await?;
        // No receivers is not an error.
        let receivers = self.live.send(event.clone()).unwrap_or(0);
        debug!(seq = event.seq, event_type = %event.event_type, receivers, "event appended");
        Ok(event)
    }

    pub async fn read_since(&self, after: u64) -> Result<Vec<Event>, CollabError> {
        self.log.read_since(after).await
    }

    pub async fn last_seq(&self) -> Result<u64, CollabError> {
        self.log.last_seq().await
    }

    /// Replay everything after `since`, then follow live appends.
    pub async fn subscribe(&self, since: u64) -> Result<TailSubscription, CollabError> {
        self.subscribe_with(since, self.tail_options).await
    }

    pub async fn subscribe_with(
        &self,
        since: u64,
        options: TailOptions,
    ) -> Result<TailSubscription, CollabError> {
        // Register before reading so appends racing the replay are queued.
        let live = self.live.subscribe();
        TailSubscription::open(Arc::clone(&self.log), live, since, options).await
    }

    pub fn subscriber_count(&self) -> usize {
        self.live.receiver_count()
    }

    pub fn tail_options(&self) -> TailOptions {
        self.tail_options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::TailItem;
    use crate::impls::InMemoryEventLog;
    use crate::ports::SystemClock;
    use serde_json::json;
    use std::time::Duration;

    fn journal() -> Arc<Journal> {
        let log = Arc::new(InMemoryEventLog::new(Arc::new(SystemClock)));
        Arc::new(Journal::new(
            log,
            16,
            TailOptions {
                keepalive: Duration::from_millis(50),
                idle_timeout: None,
            },
        ))
    }

    fn progress(n: u64) -> NewEvent {
        NewEvent::new("executor_progress", "agent-a", "T1", json!({"step": n}))
    }

    async fn collect_events(sub: &mut TailSubscription, count: usize) -> Vec<u64> {
        let mut seqs = Vec::new();
        while seqs.len() < count {
            match sub.next().await {
                Some(Ok(TailItem::Event(event))) => seqs.push(event.seq),
                Some(Ok(TailItem::KeepAlive { .. })) => {}
                other => panic!("unexpected tail item: {other:?}"),
            }
        }
        seqs
    }

    #[tokio::test]
    async fn empty_event_type_is_rejected() {
        let journal = journal();
        let err = journal
            .append(NewEvent::new(" ", "a", "T1", json!(null)))
            .await
            .unwrap_err();
        assert!(matches!(err, CollabError::InvalidArgument(_)));
        assert_eq!(journal.last_seq().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn subscriber_gets_replay_then_live_events() {
        let journal = journal();
        for n in 1..=3 {
            journal.append(progress(n)).await.unwrap();
        }

        let mut sub = journal.subscribe(1).await.unwrap();
        assert_eq!(collect_events(&mut sub, 2).await, vec![2, 3]);

        journal.append(progress(4)).await.unwrap();
        assert_eq!(collect_events(&mut sub, 1).await, vec![4]);
    }

    #[tokio::test]
    async fn reconnect_with_cursor_sees_every_missed_event_once() {
        let journal = journal();
        let mut first = journal.subscribe(0).await.unwrap();
        for n in 1..=3 {
            journal.append(progress(n)).await.unwrap();
        }
        assert_eq!(collect_events(&mut first, 2).await, vec![1, 2]);
        let resume_at = first.cursor();
        drop(first);

        for n in 4..=6 {
            journal.append(progress(n)).await.unwrap();
        }

        let mut second = journal.subscribe(resume_at).await.unwrap();
        assert_eq!(collect_events(&mut second, 4).await, vec![3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn appends_racing_subscribe_are_not_lost_or_duplicated() {
        let journal = journal();
        let writer = {
            let journal = Arc::clone(&journal);
            tokio::spawn(async move {
                for n in 1..=50 {
                    journal.append(progress(n)).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut sub = journal.subscribe(0).await.unwrap();
        let seqs = collect_events(&mut sub, 50).await;
        writer.await.unwrap();
        assert_eq!(seqs, (1..=50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn quiet_tail_sends_keepalive_with_cursor() {
        let journal = journal();
        journal.append(progress(1)).await.unwrap();
        let mut sub = journal.subscribe(0).await.unwrap();
        assert_eq!(collect_events(&mut sub, 1).await, vec![1]);

        let item = sub.next().await.unwrap().unwrap();
        assert_eq!(item, TailItem::KeepAlive { cursor: 1 });
    }
}

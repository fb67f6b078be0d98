//! InMemoryEventLog - non-durable log for tests and embedding.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{CollabError, Event, NewEvent};
use crate::ports::{Clock, EventLog};

pub struct InMemoryEventLog {
    clock: Arc<dyn Clock>,
    events: Mutex<Vec<Event>>,
}

impl InMemoryEventLog {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            events: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, event: NewEvent) -> Result<Event, CollabError> {
        let mut events = self.events.lock().await;
        let seq = events.len() as u64 + 1;
        let event = event.into_event(seq, self.clock.now());
        events.push(event.clone());
        Ok(event)
    }

    async fn read_since(&self, after: u64) -> Result<Vec<Event>, CollabError> {
        let events = self.events.lock().await;
        // seq == index + 1, so the tail starts at index `after`.
        let start = usize::try_from(after).unwrap_or(usize::MAX).min(events.len());
        Ok(events[start..].to_vec())
    }

    async fn last_seq(&self) -> Result<u64, CollabError> {
        Ok(self.events.lock().await.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::SystemClock;
    use serde_json::json;

    #[tokio::test]
    async fn appends_are_numbered_from_one() {
        let log = InMemoryEventLog::new(Arc::new(SystemClock));
        for n in 1..=3u64 {
            let event = log
                .append(NewEvent::new("progress", "a", "T1", json!({"step": n})))
                .await
                .unwrap();
            assert_eq!(event.seq, n);
        }
        assert_eq!(log.last_seq().await.unwrap(), 3);

        let tail: Vec<u64> = log.read_since(1).await.unwrap().iter().map(|e| e.seq).collect();
        assert_eq!(tail, vec![2, 3]);
        assert!(log.read_since(u64::MAX).await.unwrap().is_empty());
    }
}

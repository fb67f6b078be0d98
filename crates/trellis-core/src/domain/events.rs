//! Event log records.
//!
//! `seq` is assigned at append time, starts at 1 and increases by exactly one
//! per record. It is the only resume cursor; `ts` is for display.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known event types emitted by the core. Workers may post any other
/// type string (e.g. `executor_succeeded`).
pub mod types {
    pub const TASK_TRANSITIONED: &str = "task_transitioned";
    pub const LEASE_RELEASED: &str = "lease_released";
    pub const LEASE_RECLAIMED: &str = "lease_reclaimed";
    pub const RECONCILIATION_BACKFILL: &str = "reconciliation_backfill";
}

/// An immutable, appended record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub actor: String,
    pub target: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// An event before the log assigns `seq` and `ts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub actor: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl NewEvent {
    pub fn new(
        event_type: impl Into<String>,
        actor: impl Into<String>,
        target: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            actor: actor.into(),
            target: target.into(),
            details,
        }
    }

    pub fn into_event(self, seq: u64, ts: DateTime<Utc>) -> Event {
        Event {
            seq,
            ts,
            event_type: self.event_type,
            actor: self.actor,
            target: self.target,
            details: self.details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_serializes_type_field() {
        let event = NewEvent::new(types::LEASE_RECLAIMED, "sweeper", "T1", json!({"lock_id": "x"}))
            .into_event(2, Utc::now());
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "lease_reclaimed");
        assert_eq!(value["seq"], 2);
        assert!(value.get("event_type").is_none());
    }

    #[test]
    fn new_event_defaults_optional_fields() {
        let new: NewEvent = serde_json::from_value(json!({"type": "executor_succeeded"})).unwrap();
        assert_eq!(new.actor, "");
        assert_eq!(new.target, "");
        assert!(new.details.is_null());
    }
}

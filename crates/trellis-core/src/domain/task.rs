//! Task record (a document of the `tasks` kind).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::state::TaskStatus;

/// One Definition-of-Done checklist entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DodItem {
    pub text: String,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,

    /// Ids of tasks that must be `done` before this one may leave `queued`.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,

    #[serde(default)]
    pub dod_checklist: Vec<DodItem>,

    /// Agent id of the current owner, empty while unclaimed.
    #[serde(default)]
    pub owner: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Creation payload accepted by `POST collection(tasks)`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewTask {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub dod_checklist: Vec<DodItem>,
}

impl Task {
    pub fn from_new(id: String, new: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id,
            title: new.title,
            status: TaskStatus::Queued,
            dependencies: new.dependencies,
            dod_checklist: new.dod_checklist,
            owner: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_owner(&self) -> bool {
        !self.owner.is_empty()
    }

    /// Number of checked DoD entries out of the total.
    pub fn dod_progress(&self) -> (usize, usize) {
        let done = self.dod_checklist.iter().filter(|item| item.done).count();
        (done, self.dod_checklist.len())
    }
}

//! Task status and the transition table.
//!
//! The default table is the forward-only chain
//! `queued -> claimed -> in_progress -> review -> approved -> merging -> done`
//! plus the rework edge `review -> claimed`. The rework edge is a row of the
//! table like any other; [`TransitionTable::without_rework`] drops it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Claimed,
    InProgress,
    Review,
    Approved,
    Merging,
    Done,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Queued,
        TaskStatus::Claimed,
        TaskStatus::InProgress,
        TaskStatus::Review,
        TaskStatus::Approved,
        TaskStatus::Merging,
        TaskStatus::Done,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Claimed => "claimed",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Approved => "approved",
            Self::Merging => "merging",
            Self::Done => "done",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown task status {s:?}"))
    }
}

/// A directed edge of the transition table.
pub type Edge = (TaskStatus, TaskStatus);

const FORWARD_EDGES: [Edge; 6] = [
    (TaskStatus::Queued, TaskStatus::Claimed),
    (TaskStatus::Claimed, TaskStatus::InProgress),
    (TaskStatus::InProgress, TaskStatus::Review),
    (TaskStatus::Review, TaskStatus::Approved),
    (TaskStatus::Approved, TaskStatus::Merging),
    (TaskStatus::Merging, TaskStatus::Done),
];

/// Rework: a reviewer sends the task back to its owner.
pub const REWORK_EDGE: Edge = (TaskStatus::Review, TaskStatus::Claimed);

/// The fixed set of legal `(from, to)` pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionTable {
    edges: Vec<Edge>,
}

impl TransitionTable {
    /// Forward chain plus the rework edge.
    pub fn standard() -> Self {
        let mut edges = FORWARD_EDGES.to_vec();
        edges.push(REWORK_EDGE);
        Self { edges }
    }

    /// Forward chain only.
    pub fn without_rework() -> Self {
        Self {
            edges: FORWARD_EDGES.to_vec(),
        }
    }

    pub fn from_config(allow_rework: bool) -> Self {
        if allow_rework {
            Self::standard()
        } else {
            Self::without_rework()
        }
    }

    pub fn allows(&self, from: TaskStatus, to: TaskStatus) -> bool {
        self.edges.contains(&(from, to))
    }

    pub fn successors(&self, from: TaskStatus) -> Vec<TaskStatus> {
        self.edges
            .iter()
            .filter(|(f, _)| *f == from)
            .map(|(_, t)| *t)
            .collect()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }
}

impl Default for TransitionTable {
    fn default() -> Self {
        Self::standard()
    }
}

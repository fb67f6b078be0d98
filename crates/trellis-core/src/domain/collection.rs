//! Document collections: kinds, items and snapshots.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::errors::CollabError;
use super::etag::ETag;

/// Records of one kind, keyed by id. `BTreeMap` keeps the set ordered and
/// the serialization stable.
pub type Items = BTreeMap<String, serde_json::Value>;

const MAX_KIND_LEN: usize = 64;

/// Name of a document collection (`tasks`, `leases`, `agents`, ...).
///
/// Kinds double as file names, so they are restricted to `[a-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Kind(String);

impl Kind {
    pub const TASKS: &'static str = "tasks";
    pub const LEASES: &'static str = "leases";
    pub const AGENTS: &'static str = "agents";

    pub fn new(value: impl Into<String>) -> Result<Self, CollabError> {
        let value = value.into();
        if value.is_empty() || value.len() > MAX_KIND_LEN {
            return Err(CollabError::InvalidArgument(format!(
                "kind must be 1..={MAX_KIND_LEN} characters"
            )));
        }
        if !value
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
        {
            return Err(CollabError::InvalidArgument(format!(
                "kind {value:?} may only contain [a-z0-9_-]"
            )));
        }
        Ok(Self(value))
    }

    pub fn tasks() -> Self {
        Self(Self::TASKS.to_string())
    }

    pub fn leases() -> Self {
        Self(Self::LEASES.to_string())
    }

    pub fn agents() -> Self {
        Self(Self::AGENTS.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix for generated record ids: `tasks` -> `task-`, `agents` -> `agent-`.
    pub fn id_prefix(&self) -> String {
        let singular = self.0.strip_suffix('s').filter(|s| !s.is_empty());
        format!("{}-", singular.unwrap_or(&self.0))
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<String> for Kind {
    type Error = CollabError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Kind> for String {
    fn from(kind: Kind) -> Self {
        kind.0
    }
}

/// A consistent read of one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub kind: Kind,
    pub version: u64,
    pub etag: ETag,
    pub items: Items,
}

impl Snapshot {
    /// The state of a kind that has never been written.
    pub fn empty(kind: Kind) -> Self {
        let items = Items::new();
        Self {
            etag: ETag::initial(),
            kind,
            version: 0,
            items,
        }
    }

    /// Decode one record as `T`.
    pub fn get<T: serde::de::DeserializeOwned>(&self, id: &str) -> Result<Option<T>, CollabError> {
        self.items
            .get(id)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(CollabError::from)
    }

    /// Decode every record as `T`, in id order.
    pub fn decode_all<T: serde::de::DeserializeOwned>(&self) -> Result<Vec<T>, CollabError> {
        self.items
            .values()
            .map(|value| serde_json::from_value(value.clone()).map_err(CollabError::from))
            .collect()
    }
}

//! ETag engine: content fingerprint of a collection.
//!
//! `etag = "<version>-<sha256(canonical items)[..32 hex]>"`.
//!
//! Canonical form is compact JSON with object keys sorted at every depth, so
//! two processes holding equal items always compute the same hash regardless
//! of how `serde_json` was configured. The version counter makes every write
//! observable even when a mutator leaves the content unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

use super::collection::Items;
use super::errors::CollabError;

const DIGEST_HEX_LEN: usize = 32;

/// Opaque optimistic-concurrency token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ETag(String);

impl ETag {
    /// Wraps a caller-supplied token without validation; unknown tokens just
    /// never match.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Etag of a kind that has never been written.
    pub fn initial() -> Self {
        Self::compute(0, &Items::new()).unwrap_or_else(|_| Self("0-".to_string()))
    }

    pub fn compute(version: u64, items: &Items) -> Result<Self, CollabError> {
        let bytes = canonical_bytes(items)?;
        let digest = hex::encode(Sha256::digest(&bytes));
        Ok(Self(format!("{version}-{}", &digest[..DIGEST_HEX_LEN])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Canonical (sorted-key, compact) serialization of a collection's items.
pub fn canonical_bytes(items: &Items) -> Result<Vec<u8>, CollabError> {
    let value = serde_json::to_value(items)?;
    Ok(serde_json::to_vec(&canonicalize(value))?)
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, canonicalize(value));
            }
            Value::Object(sorted)
        }
        Value::Array(values) => Value::Array(values.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

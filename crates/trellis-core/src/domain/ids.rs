//! Strongly-typed identifiers.
//!
//! Generated ids are ULIDs behind a phantom marker type, so a `LockId` can
//! never be passed where another id is expected. On the wire and on disk they
//! are plain strings of the form `<prefix><ulid>` (e.g. `lock-01HV...`).
//!
//! Record ids inside a collection (task ids, agent ids) are caller-assigned
//! strings and stay `String`; only ids the store mints itself get a type here.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait for each id type.
pub trait IdMarker: Send + Sync + 'static {
    /// Display prefix, e.g. `"lock-"`.
    fn prefix() -> &'static str;
}

/// Generic ULID-backed id.
///
/// `T` is only a compile-time marker and costs nothing at runtime.
#[repr(transparent)]
#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    _marker: PhantomData<T>,
}

// Manual impls: deriving would require `T: Clone`/`T: Copy`.
impl<T: IdMarker> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: IdMarker> Copy for Id<T> {}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Error returned when a string is not a valid id of the expected type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid id {value:?}: expected prefix {prefix:?} followed by a ULID")]
pub struct ParseIdError {
    pub value: String,
    pub prefix: &'static str,
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseIdError {
            value: s.to_string(),
            prefix: T::prefix(),
        };
        let raw = s.strip_prefix(T::prefix()).ok_or_else(err)?;
        let ulid = Ulid::from_string(raw).map_err(|_| err())?;
        Ok(Self::from_ulid(ulid))
    }
}

impl<T: IdMarker> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ========================================
// Markers
// ========================================

/// Marker for lease ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lock {}

impl IdMarker for Lock {
    fn prefix() -> &'static str {
        "lock-"
    }
}

/// Identifier of a lease, minted on `acquire`.
pub type LockId = Id<Lock>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_id_displays_with_prefix() {
        let ulid = Ulid::new();
        let id = LockId::from_ulid(ulid);
        assert_eq!(id.to_string(), format!("lock-{ulid}"));
        assert_eq!(id.as_ulid(), ulid);
    }

    #[test]
    fn lock_id_parses_its_own_display() {
        let id = LockId::from_ulid(Ulid::new());
        let parsed: LockId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn parse_rejects_wrong_prefix_and_garbage() {
        let ulid = Ulid::new();
        assert!(format!("task-{ulid}").parse::<LockId>().is_err());
        assert!("lock-not-a-ulid".parse::<LockId>().is_err());
        assert!(ulid.to_string().parse::<LockId>().is_err());
    }

    #[test]
    fn lock_id_serializes_as_plain_string() {
        let id = LockId::from_ulid(Ulid::new());
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json, serde_json::Value::String(id.to_string()));

        let back: LockId = serde_json::from_value(json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn phantom_marker_is_free() {
        assert_eq!(std::mem::size_of::<LockId>(), std::mem::size_of::<Ulid>());
    }
}

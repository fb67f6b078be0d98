//! Errors and their operational classification.
//!
//! Every failure the core can produce is a variant of [`CollabError`]. Callers
//! branch on [`CollabError::kind`] to decide between "re-read and retry",
//! "pick other work" and "give up", so the variants must stay distinguishable
//! all the way to the request layer.

use thiserror::Error;

use super::ids::LockId;
use super::state::TaskStatus;

/// Operational classification of a [`CollabError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Stale etag, lease not held by caller, lease expired. Re-read and retry.
    Precondition,
    /// Live lease on acquire, illegal transition, duplicate id. Business outcome.
    Conflict,
    /// The addressed record or collection does not exist.
    NotFound,
    /// The request itself is malformed.
    Invalid,
    /// Storage fault. The prior state remains authoritative.
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("{what} not found")]
    NotFound { what: String },

    #[error("precondition failed: expected etag {expected}, current etag is {actual}")]
    PreconditionFailed { expected: String, actual: String },

    #[error("precondition required: an if-match etag must be supplied")]
    PreconditionRequired,

    #[error("resource {resource} is leased by {holder} ({lock_id})")]
    LeaseHeld {
        resource: String,
        holder: String,
        lock_id: LockId,
    },

    #[error("lease {lock_id} is not held by {caller}")]
    NotHolder { lock_id: LockId, caller: String },

    #[error("lease {lock_id} has expired")]
    LeaseExpired { lock_id: LockId },

    #[error("lease {lock_id} is still live and cannot be reclaimed")]
    LeaseStillLive { lock_id: LockId },

    #[error("invalid transition for task {task_id}: {from} -> {to} ({reason})")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
        reason: String,
    },

    #[error("{kind}/{id} already exists")]
    AlreadyExists { kind: String, id: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Another live process owns the data directory.
    #[error("{path} is held by process {pid}")]
    DirLocked { path: String, pid: u32 },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CollabError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn storage(context: &str, err: impl std::fmt::Display) -> Self {
        Self::StorageUnavailable(format!("{context}: {err}"))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PreconditionFailed { .. }
            | Self::PreconditionRequired
            | Self::NotHolder { .. }
            | Self::LeaseExpired { .. } => ErrorKind::Precondition,
            Self::LeaseHeld { .. }
            | Self::LeaseStillLive { .. }
            | Self::InvalidTransition { .. }
            | Self::AlreadyExists { .. } => ErrorKind::Conflict,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidArgument(_) => ErrorKind::Invalid,
            Self::DirLocked { .. } | Self::StorageUnavailable(_) | Self::Serialization(_) => {
                ErrorKind::Infrastructure
            }
        }
    }

    /// Stable machine-readable code, one per variant.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::PreconditionFailed { .. } => "precondition_failed",
            Self::PreconditionRequired => "precondition_required",
            Self::LeaseHeld { .. } => "lease_held",
            Self::NotHolder { .. } => "not_holder",
            Self::LeaseExpired { .. } => "lease_expired",
            Self::LeaseStillLive { .. } => "lease_still_live",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::AlreadyExists { .. } => "already_exists",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::DirLocked { .. } => "dir_locked",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::Serialization(_) => "serialization",
        }
    }

    /// Stale-etag failures are safe to retry after re-reading.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PreconditionFailed { .. })
    }
}

//! Guarded-write step shared by every DocumentStore implementation.

use crate::domain::{CollabError, ETag, Snapshot};
use crate::ports::Mutator;

/// Check `if_match` against `current`, run `mutator` on a copy of the items
/// and return the next snapshot (version + 1, fresh etag).
///
/// `current` is left untouched on any error.
pub(crate) fn apply(
    current: &Snapshot,
    if_match: &ETag,
    mutator: Mutator<'_>,
) -> Result<Snapshot, CollabError> {
    if &current.etag != if_match {
        return Err(CollabError::PreconditionFailed {
            expected: if_match.to_string(),
            actual: current.etag.to_string(),
        });
    }

    let mut items = current.items.clone();
    mutator(&mut items)?;

    let version = current.version + 1;
    let etag = ETag::compute(version, &items)?;
    Ok(Snapshot {
        kind: current.kind.clone(),
        version,
        etag,
        items,
    })
}

//! IdGenerator port.
//!
//! Ids are ULIDs stamped with the injected clock, so they sort by creation
//! time and can be minted by any process without coordination.

use std::sync::Arc;

use ulid::Ulid;

use crate::domain::{Kind, LockId};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    /// Id for a new lease.
    fn generate_lock_id(&self) -> LockId;

    /// Id for a new record of `kind` when the caller did not supply one.
    fn generate_item_id(&self, kind: &Kind) -> String;
}

/// ULID-based generator.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_lock_id(&self) -> LockId {
        LockId::from_ulid(self.next_ulid())
    }

    fn generate_item_id(&self, kind: &Kind) -> String {
        format!("{}{}", kind.id_prefix(), self.next_ulid())
    }
}

impl<G: IdGenerator + ?Sized> IdGenerator for Arc<G> {
    fn generate_lock_id(&self) -> LockId {
        (**self).generate_lock_id()
    }

    fn generate_item_id(&self, kind: &Kind) -> String {
        (**self).generate_item_id(kind)
    }
}

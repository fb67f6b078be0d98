//! Ports: the trait seams between the services in `app` and the storage and
//! time sources they run on.
//!
//! - **DocumentStore**: ETag-guarded collections with atomic replace
//! - **EventLog**: append-only log with seq cursor
//! - **Clock** / **IdGenerator**: injected so tests are deterministic

pub mod clock;
pub mod document_store;
pub mod event_log;
pub mod id_generator;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::document_store::{DocumentStore, Mutator};
pub use self::event_log::EventLog;
pub use self::id_generator::{IdGenerator, UlidGenerator};

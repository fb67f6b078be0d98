//! Impls - port implementations.
//!
//! - **FsDocumentStore** / **FsEventLog**: the durable pair, one data directory
//! - **InMemoryDocumentStore** / **InMemoryEventLog**: tests and embedding
//! - **DirLock**: keeps a second process from opening the durable pair

mod guarded;

pub mod dir_lock;
pub mod fs_log;
pub mod fs_store;
pub mod inmem_log;
pub mod inmem_store;

pub use self::dir_lock::{DirLock, LockOwner};
pub use self::fs_log::{EVENT_LOG_FILE, FsEventLog};
pub use self::fs_store::FsDocumentStore;
pub use self::inmem_log::InMemoryEventLog;
pub use self::inmem_store::InMemoryDocumentStore;

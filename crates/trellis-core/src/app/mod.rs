//! App - services composed from the ports.
//!
//! # Components
//! - **Collections**: get/create/patch of any kind
//! - **LeaseManager**: acquire, heartbeat, release, reclaim
//! - **Journal** / **TailSubscription**: event log with live, resumable tail
//! - **TaskStateMachine**: validated task transitions
//! - **ReaperLoop**: periodic reclaim of dead leases
//! - **Reconciler**: backfills transitions the journal missed
//! - **AppBuilder**: wiring and fail-fast validation

pub mod builder;
pub mod collections;
pub mod journal;
pub mod lease_manager;
pub mod reaper_loop;
pub mod reconcile;
pub mod retry;
pub mod status;
pub mod tail;
pub mod task_machine;

pub use self::builder::{App, AppBuilder, BuildError, StorageBackend};
pub use self::collections::{Collections, Created, Patched, merge_patch};
pub use self::journal::{DEFAULT_SUBSCRIBER_BUFFER, Journal};
pub use self::lease_manager::{LeaseManager, LeasePolicy};
pub use self::reaper_loop::{REAPER_ACTOR, ReaperHandle, ReaperLoop};
pub use self::reconcile::{ReconcileReport, Reconciler};
pub use self::retry::RetryPolicy;
pub use self::status::{LeaseCounts, StatusReport};
pub use self::tail::{TailItem, TailOptions, TailSubscription};
pub use self::task_machine::{TaskStateMachine, TransitionOutcome};

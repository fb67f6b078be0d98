//! Domain model: collections, etags, tasks, leases, events, agents.
//!
//! Nothing in here performs I/O. Records serialize to the exact JSON shape
//! stored on disk and returned over the wire.

pub mod agent;
pub mod collection;
pub mod errors;
pub mod etag;
pub mod events;
pub mod ids;
pub mod lease;
pub mod state;
pub mod task;

pub use agent::{Agent, AgentStatus, NewAgent};
pub use collection::{Items, Kind, Snapshot};
pub use errors::{CollabError, ErrorKind};
pub use etag::ETag;
pub use events::{Event, NewEvent};
pub use ids::{Id, IdMarker, LockId};
pub use lease::{Lease, LeaseView};
pub use state::{TaskStatus, TransitionTable};
pub use task::{DodItem, NewTask, Task};

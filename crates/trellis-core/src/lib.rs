//! trellis-core
//!
//! Collaboration store for agents working a shared task pool.
//!
//! # Modules
//! - **domain**: records and value types (tasks, leases, events, etags, errors)
//! - **ports**: trait seams (DocumentStore, EventLog, Clock, IdGenerator)
//! - **impls**: filesystem and in-memory implementations of the ports
//! - **app**: services (collections, leases, journal/tail, task state machine, reaper)
//! - **config**: `trellis.yaml` model

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

pub use app::{App, AppBuilder};
pub use config::TrellisConfig;
pub use domain::{CollabError, ErrorKind};

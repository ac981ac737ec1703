//! Coordination of immutable workspaces shared by threads and processes.
//!
//! See [`workspace`] for the providers handing out workspace directories, [`coalesce`] for the
//! deduplication of concurrent computations, and [`caching`] for file locks and cleanup.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod history;
pub mod locking;
pub mod logging;
pub mod utils;
pub mod workspace;

pub use error::{SharedError, WorkspaceError, WorkspaceResult};

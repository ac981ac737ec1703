//! # Workspace caching infrastructure
//!
//! Every workspace lives in a directory below a shared base directory, and several threads and
//! processes may ask for the same workspace at the same time. This module contains the
//! file-system side of that: the [`PersistentCache`] guarding a base directory with a file lock,
//! and the mark-and-sweep cleanup reclaiming workspaces nobody uses anymore.
//!
//! ## Layers
//!
//! - An in-process layer which coalesces concurrent requests for the same key, see
//!   [`crate::coalesce`].
//! - A cross-process layer made of file locks. A [`PersistentCache`] either holds its lock from
//!   open to close ([`LockMode::Exclusive`](crate::locking::LockMode::Exclusive)), takes it
//!   around every locked action (the on-demand modes), or not at all.
//! - The workspace directories themselves. They are never locked individually by the file
//!   system, the lock of the owning cache covers them.
//!
//! A request goes through the following steps:
//! - The provider resolves the directory of the key. This never takes a lock.
//! - It resolves or opens the cache owning that directory, one per key or one for all keys.
//! - It takes that cache's lock, creates the directory if needed and clears a pending
//!   soft-delete mark.
//! - It runs the caller's action and releases the lock again. The directory stays.
//!
//! ## Cleanup
//!
//! Cleanup is a two phase mark-and-sweep. A pass first marks every workspace that has not been
//! used for longer than the configured retention with a soft-delete marker, see
//! [`SoftDeleter`]. It then removes every workspace that was already marked *before* that pass,
//! is still marked and is not locked by anyone. A workspace that is requested again in between
//! simply loses its mark.
//!
//! Last use is tracked through the [`AccessJournal`], by default as the directory's `mtime`.
//! Workspaces in use have their `mtime` updated at most once per `touch_every` (an hour by
//! default).
//!
//! ### Metrics
//!
//! - `workspace.cache.opened`: A persistent cache was opened, tagged with its `lock_mode`.
//! - `workspace.lock.wait`: Time spent waiting for a file lock.
//! - `workspace.lock.timeout`: Lock acquisitions that gave up.
//! - `caches.cleanup.marked`: Workspaces newly soft-deleted by a cleanup pass.
//! - `caches.cleanup.removed_dirs` and `caches.cleanup.removed_bytes`: What a sweep removed.
//!
//! ### Configuration
//!
//! Everything is gated by [`Config::cache_dir`](crate::config::Config::cache_dir).
//! [`CleanupConfig`](crate::config::CleanupConfig) holds the retention, how often a closing cache
//! runs the cleanup, and the touch interval. Setting the retention to `null` disables marking.

mod cleanup;
mod journal;
mod layout;
mod persistent;
mod soft_delete;

pub use cleanup::{
    CacheCleanup, CleanupFrequency, CleanupStats, CleanupStrategy, SweepLocking, cleanup,
};
pub use journal::{AccessJournal, DEFAULT_TOUCH_EVERY, ModificationTimeJournal};
pub use layout::CacheLayout;
pub use persistent::{CacheOptions, PersistentCache};
pub use soft_delete::{MarkerFileSoftDeleter, SoftDeleter};

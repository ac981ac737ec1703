use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::caching::{AccessJournal, PersistentCache, SoftDeleter};
use crate::coalesce::InFlightOperations;
use crate::error::{WorkspaceError, WorkspaceResult};
use crate::history::ExecutionHistoryStore;
use crate::locking::LockAccess;

use super::{ProviderContext, WorkspaceKey, resurrect};

/// A workspace whose result is computed once and shared by concurrent requests.
///
/// Obtained from [`CacheBasedWorkspaceProvider::workspace`](super::CacheBasedWorkspaceProvider::workspace)
/// or [`FineGrainedWorkspaceProvider::workspace`](super::FineGrainedWorkspaceProvider::workspace).
/// The usual pattern nests the two kinds of exclusion: the in-process coalescing on the outside,
/// the cross-process file lock inside the computation.
///
/// ```ignore
/// let output = workspace.get_if_running_or_compute(
///     |output: &Output| output.clone(),
///     || workspace.with_file_lock(|| build(workspace.immutable_location())),
/// )?;
/// ```
pub struct LockingWorkspace {
    key: WorkspaceKey,
    location: PathBuf,
    cache: Arc<PersistentCache>,
    in_flight: Arc<InFlightOperations>,
    soft_deleter: Arc<dyn SoftDeleter>,
    journal: Arc<dyn AccessJournal>,
    history: Arc<dyn ExecutionHistoryStore>,
}

impl LockingWorkspace {
    pub(super) fn new(
        key: WorkspaceKey,
        context: &ProviderContext,
        cache: Arc<PersistentCache>,
    ) -> Self {
        Self {
            location: context.layout.workspace_dir(&key),
            key,
            cache,
            in_flight: Arc::clone(&context.in_flight),
            soft_deleter: Arc::clone(&context.soft_deleter),
            journal: Arc::clone(&context.journal),
            history: Arc::clone(&context.history),
        }
    }

    pub fn key(&self) -> &WorkspaceKey {
        &self.key
    }

    pub fn immutable_location(&self) -> &Path {
        &self.location
    }

    /// Runs `action` while holding the workspace's lock exclusively.
    ///
    /// This only excludes other lock holders, concurrent callers in this process are not
    /// deduplicated. The directory is not created.
    pub fn with_file_lock<T, E, F>(&self, action: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<WorkspaceError>,
    {
        self.cache.with_file_lock(LockAccess::Exclusive, action)
    }

    /// Like [`with_file_lock`](Self::with_file_lock), but only asks for shared access.
    ///
    /// Readers share the lock in [`LockMode::OnDemand`](crate::locking::LockMode::OnDemand),
    /// every other mode treats this exactly like `with_file_lock`.
    pub fn with_read_lock<T, E, F>(&self, action: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<WorkspaceError>,
    {
        self.cache.with_file_lock(LockAccess::Shared, action)
    }

    /// Runs `action` unless a computation of this workspace is already running in this process,
    /// in which case its result is passed through `result_mapper` instead.
    ///
    /// See [`InFlightOperations::get_if_running_or_compute`] for the exact protocol.
    pub fn get_if_running_or_compute<T, M, A, E>(
        &self,
        result_mapper: M,
        action: A,
    ) -> WorkspaceResult<T>
    where
        T: Clone + Send + Sync + 'static,
        M: FnOnce(&T) -> T,
        A: FnOnce() -> Result<T, E>,
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        // keyed by location, so providers over different base directories never coalesce
        let in_flight_key = self.location.to_string_lossy();
        self.in_flight
            .get_if_running_or_compute(&in_flight_key, result_mapper, action)
    }

    pub fn is_soft_deleted(&self) -> WorkspaceResult<bool> {
        self.soft_deleter
            .is_soft_deleted(&self.key)
            .map_err(|e| WorkspaceError::io(&self.location, e))
    }

    /// Clears a soft-delete mark, so the next sweep keeps this workspace.
    pub fn ensure_un_soft_deleted(&self) -> WorkspaceResult<()> {
        resurrect(&*self.soft_deleter, &self.key, &self.location)?;
        self.journal.mark_accessed(&self.location);
        Ok(())
    }
}

impl fmt::Debug for LockingWorkspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockingWorkspace")
            .field("key", &self.key)
            .field("location", &self.location)
            .field("cache", &self.cache.name())
            .finish()
    }
}

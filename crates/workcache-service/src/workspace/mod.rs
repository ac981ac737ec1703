//! Mapping workspace keys to locked directories.
//!
//! A [`WorkspaceProvider`] turns a [`WorkspaceKey`] into a directory below its base directory and
//! runs actions in it while holding the right lock. The providers differ in how locks are scoped:
//!
//! - [`CacheBasedWorkspaceProvider`] guards the whole base directory with one lock.
//! - [`FineGrainedWorkspaceProvider`] opens one lock per key, so different keys never wait for
//!   each other.
//! - [`NonLockingWorkspaceProvider`] takes no locks at all, for callers that already made sure
//!   nobody else uses the directory.
//!
//! Each of them is built from [`ProviderOptions`], which also decides whether the execution
//! history is kept inside the base directory or in an externally owned store.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::caching::{
    AccessJournal, CacheCleanup, CacheLayout, CleanupStrategy, MarkerFileSoftDeleter,
    ModificationTimeJournal, SoftDeleter, SweepLocking,
};
use crate::coalesce::InFlightOperations;
use crate::config::Config;
use crate::error::{WorkspaceError, WorkspaceResult};
use crate::history::{ExecutionHistoryStore, FileHistoryStore};
use crate::locking::{DEFAULT_LOCK_TIMEOUT, LockMode};

mod atomic_move;
mod coarse;
mod fine_grained;
mod immutable;
mod key;
mod non_locking;

pub use atomic_move::{AtomicMoveWorkspace, MoveOutcome};
pub use coarse::CacheBasedWorkspaceProvider;
pub use fine_grained::FineGrainedWorkspaceProvider;
pub use immutable::LockingWorkspace;
pub use key::{MAX_KEY_LEN, WorkspaceKey};
pub use non_locking::{MutableWorkspace, NonLockingWorkspaceProvider};

/// The on-disk location of one workspace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Workspace {
    key: WorkspaceKey,
    immutable_location: PathBuf,
}

impl Workspace {
    pub fn key(&self) -> &WorkspaceKey {
        &self.key
    }

    /// The directory of this workspace, a pure function of base directory and key.
    pub fn immutable_location(&self) -> &Path {
        &self.immutable_location
    }
}

/// Hands out workspace directories and runs actions in them under a lock.
pub trait WorkspaceProvider {
    /// Resolves the workspace for `key` and records an access to it.
    ///
    /// This never takes a lock and never creates the directory.
    fn get_workspace(&self, key: &WorkspaceKey) -> Workspace;

    /// Runs `action` in the workspace directory of `key` while holding its lock.
    ///
    /// The directory is created if needed and a pending soft-delete mark is cleared before the
    /// action runs. The lock is released when the action returns, whatever its outcome. An
    /// error of the action is returned as is, the directory is left as the action left it.
    fn with_workspace<T, E, F>(&self, key: &WorkspaceKey, action: F) -> Result<T, E>
    where
        F: FnOnce(&Path, &dyn ExecutionHistoryStore) -> Result<T, E>,
        E: From<WorkspaceError>;

    /// Closes every cache this provider opened.
    ///
    /// Closing twice is fine. Using the provider after closing it is an
    /// [`IllegalState`](WorkspaceError::IllegalState) error.
    fn close(&self) -> WorkspaceResult<()>;
}

/// Settings shared by all workspace providers.
#[derive(Clone, Debug)]
pub struct ProviderOptions {
    pub base_dir: PathBuf,
    pub lock_mode: LockMode,
    pub lock_timeout: Duration,
    pub cleanup: CleanupStrategy,
    pub journal: Arc<dyn AccessJournal>,
    /// Defaults to marker files in `<base>/.soft-deleted`.
    pub soft_deleter: Option<Arc<dyn SoftDeleter>>,
    /// An externally owned history store. Defaults to files in `<base>/.history`.
    pub history: Option<Arc<dyn ExecutionHistoryStore>>,
    pub in_flight: Arc<InFlightOperations>,
}

impl ProviderOptions {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            lock_mode: LockMode::default(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            cleanup: CleanupStrategy::default(),
            journal: Arc::new(ModificationTimeJournal::default()),
            soft_deleter: None,
            history: None,
            in_flight: Arc::new(InFlightOperations::new()),
        }
    }

    /// Options for the configured cache directory, or `None` if caching is disabled.
    pub fn from_config(config: &Config) -> Option<Self> {
        let base_dir = config.cache_dir.clone()?;
        Some(
            Self::new(base_dir)
                .with_lock_mode(config.lock_mode)
                .with_lock_timeout(config.lock_timeout)
                .with_cleanup(CleanupStrategy::from_config(&config.cleanup))
                .with_journal(Arc::new(ModificationTimeJournal::new(
                    config.cleanup.touch_every,
                ))),
        )
    }

    pub fn with_lock_mode(mut self, lock_mode: LockMode) -> Self {
        self.lock_mode = lock_mode;
        self
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn with_cleanup(mut self, cleanup: CleanupStrategy) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn with_journal(mut self, journal: Arc<dyn AccessJournal>) -> Self {
        self.journal = journal;
        self
    }

    pub fn with_soft_deleter(mut self, soft_deleter: Arc<dyn SoftDeleter>) -> Self {
        self.soft_deleter = Some(soft_deleter);
        self
    }

    /// Hands actions an externally owned history store instead of the internal one.
    pub fn with_external_history(mut self, history: Arc<dyn ExecutionHistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    /// Coalesces computations with every other provider sharing `in_flight`.
    pub fn with_in_flight(mut self, in_flight: Arc<InFlightOperations>) -> Self {
        self.in_flight = in_flight;
        self
    }

    fn into_context(self) -> WorkspaceResult<ProviderContext> {
        let layout = CacheLayout::new(self.base_dir);
        std::fs::create_dir_all(layout.base_dir())
            .map_err(|e| WorkspaceError::io(layout.base_dir(), e))?;

        let soft_deleter = self
            .soft_deleter
            .unwrap_or_else(|| Arc::new(MarkerFileSoftDeleter::new(layout.soft_delete_dir())));
        let history = self
            .history
            .unwrap_or_else(|| Arc::new(FileHistoryStore::new(layout.history_dir())));

        Ok(ProviderContext {
            layout,
            lock_mode: self.lock_mode,
            lock_timeout: self.lock_timeout,
            cleanup: self.cleanup,
            journal: self.journal,
            soft_deleter,
            history,
            in_flight: self.in_flight,
        })
    }
}

/// The resolved [`ProviderOptions`] every provider carries.
#[derive(Clone)]
struct ProviderContext {
    layout: CacheLayout,
    lock_mode: LockMode,
    lock_timeout: Duration,
    cleanup: CleanupStrategy,
    journal: Arc<dyn AccessJournal>,
    soft_deleter: Arc<dyn SoftDeleter>,
    history: Arc<dyn ExecutionHistoryStore>,
    in_flight: Arc<InFlightOperations>,
}

impl ProviderContext {
    fn workspace(&self, key: &WorkspaceKey) -> Workspace {
        let immutable_location = self.layout.workspace_dir(key);
        self.journal.mark_accessed(&immutable_location);
        Workspace {
            key: key.clone(),
            immutable_location,
        }
    }

    /// Readies the directory of `key` for an action. Must be called under the workspace's lock.
    fn prepare(&self, key: &WorkspaceKey) -> WorkspaceResult<PathBuf> {
        let location = self.layout.workspace_dir(key);
        std::fs::create_dir_all(&location).map_err(|e| WorkspaceError::io(&location, e))?;
        resurrect(&*self.soft_deleter, key, &location)?;
        self.journal.mark_accessed(&location);
        Ok(location)
    }

    fn cache_cleanup(&self, sweep_locking: SweepLocking) -> CacheCleanup {
        CacheCleanup {
            strategy: self.cleanup.clone(),
            layout: self.layout.clone(),
            journal: self.journal.clone(),
            soft_deleter: self.soft_deleter.clone(),
            sweep_locking,
        }
    }

    fn atomic_move_workspace(&self, key: &WorkspaceKey) -> AtomicMoveWorkspace {
        AtomicMoveWorkspace::new(
            key.clone(),
            self.layout.workspace_dir(key),
            self.layout.tmp_dir(),
            self.journal.clone(),
        )
    }
}

impl fmt::Debug for ProviderContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderContext")
            .field("base_dir", &self.layout.base_dir())
            .field("lock_mode", &self.lock_mode)
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

/// Clears the soft-delete mark of `key`, if there is one.
fn resurrect(soft_deleter: &dyn SoftDeleter, key: &WorkspaceKey, location: &Path) -> WorkspaceResult<()> {
    let resurrected = soft_deleter
        .remove_soft_delete_marker(key)
        .map_err(|e| WorkspaceError::io(location, e))?;
    if resurrected {
        tracing::debug!(%key, "Resurrected soft-deleted workspace");
    }
    Ok(())
}

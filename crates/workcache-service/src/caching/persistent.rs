use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{WorkspaceError, WorkspaceResult};
use crate::locking::{DEFAULT_LOCK_TIMEOUT, FileLockGuard, LockAccess, LockMode};
use crate::utils::defer::defer;

use super::cleanup::{CacheCleanup, CleanupStats};

/// Everything needed to open a [`PersistentCache`].
#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// Display name, used in logs and recorded as the lock owner's operation.
    pub name: String,
    pub base_dir: PathBuf,
    pub lock_file: PathBuf,
    pub lock_mode: LockMode,
    pub lock_timeout: Duration,
    /// Cleanup to run when the cache is closed, if it is due.
    pub cleanup: Option<CacheCleanup>,
}

impl CacheOptions {
    pub fn new(name: impl Into<String>, base_dir: impl Into<PathBuf>, lock_file: PathBuf) -> Self {
        Self {
            name: name.into(),
            base_dir: base_dir.into(),
            lock_file,
            lock_mode: LockMode::default(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            cleanup: None,
        }
    }
}

enum CacheState {
    Open {
        /// The lock held from open to close in [`LockMode::Exclusive`].
        lifetime_lock: Option<FileLockGuard>,
    },
    Closed,
}

/// Ownership of a base directory and the file lock protecting it.
pub struct PersistentCache {
    name: String,
    base_dir: PathBuf,
    lock_file: PathBuf,
    lock_mode: LockMode,
    lock_timeout: Duration,
    cleanup: Option<CacheCleanup>,
    state: Mutex<CacheState>,
    /// Serializes in-process callers while the lifetime lock is held.
    exclusive: Mutex<()>,
    /// Threads currently inside [`with_file_lock`](Self::with_file_lock).
    holders: Mutex<HashSet<ThreadId>>,
}

impl PersistentCache {
    /// Creates the base directory and, in [`LockMode::Exclusive`], takes the lifetime lock.
    pub fn open(options: CacheOptions) -> WorkspaceResult<Arc<Self>> {
        let CacheOptions {
            name,
            base_dir,
            lock_file,
            lock_mode,
            lock_timeout,
            cleanup,
        } = options;

        std::fs::create_dir_all(&base_dir).map_err(|e| WorkspaceError::io(&base_dir, e))?;

        let lifetime_lock = match lock_mode {
            LockMode::Exclusive => Some(FileLockGuard::acquire(
                &lock_file,
                LockAccess::Exclusive,
                lock_timeout,
                &name,
            )?),
            _ => None,
        };

        tracing::debug!(
            cache = %name,
            path = %base_dir.display(),
            ?lock_mode,
            "Opened persistent cache",
        );
        metric!(counter("workspace.cache.opened") += 1, "lock_mode" => lock_mode_tag(lock_mode));

        Ok(Arc::new(Self {
            name,
            base_dir,
            lock_file,
            lock_mode,
            lock_timeout,
            cleanup,
            state: Mutex::new(CacheState::Open { lifetime_lock }),
            exclusive: Mutex::new(()),
            holders: Mutex::new(HashSet::new()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn lock_file(&self) -> &Path {
        &self.lock_file
    }

    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state.lock(), CacheState::Closed)
    }

    /// Runs `action` while holding this cache's lock.
    ///
    /// With [`LockMode::None`] the action runs directly. The on-demand modes acquire the file
    /// lock in the effective access for the duration of the action, waiting at most the lock
    /// timeout. With [`LockMode::Exclusive`] the lifetime lock is already held and in-process
    /// callers are serialized.
    ///
    /// Taking the lock again from within `action` on the same thread is an
    /// [`IllegalState`](WorkspaceError::IllegalState) error rather than a deadlock.
    pub fn with_file_lock<T, E, F>(&self, access: LockAccess, action: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<WorkspaceError>,
    {
        if self.is_closed() {
            return Err(WorkspaceError::illegal_state(format!(
                "cache `{}` has already been closed",
                self.name
            ))
            .into());
        }

        let Some(access) = self.lock_mode.effective_access(access) else {
            return action();
        };

        let thread = thread::current().id();
        if !self.holders.lock().insert(thread) {
            return Err(WorkspaceError::illegal_state(format!(
                "cache `{}` is already locked by this thread",
                self.name
            ))
            .into());
        }
        let _holder = defer(|| {
            self.holders.lock().remove(&thread);
        });

        match self.lock_mode {
            LockMode::Exclusive => {
                let _serialized = self.exclusive.lock();
                // closed while we were waiting
                if self.is_closed() {
                    return Err(WorkspaceError::illegal_state(format!(
                        "cache `{}` has already been closed",
                        self.name
                    ))
                    .into());
                }
                action()
            }
            _ => {
                let _guard =
                    FileLockGuard::acquire(&self.lock_file, access, self.lock_timeout, &self.name)?;
                action()
            }
        }
    }

    /// Closes the cache, running the cleanup if it is due.
    ///
    /// Closing an already closed cache does nothing. Cleanup only runs if the lock can be had
    /// without waiting, so a cache in use by another process is left alone.
    pub fn close(&self) -> WorkspaceResult<Option<CleanupStats>> {
        if self.holders.lock().contains(&thread::current().id()) {
            return Err(WorkspaceError::illegal_state(format!(
                "cache `{}` can not be closed while it is locked by this thread",
                self.name
            )));
        }
        let _serialized = self.exclusive.lock();
        let lifetime_lock = match std::mem::replace(&mut *self.state.lock(), CacheState::Closed) {
            CacheState::Open { lifetime_lock } => lifetime_lock,
            CacheState::Closed => return Ok(None),
        };

        let result = match &self.cleanup {
            Some(cleanup) => self.cleanup_on_close(cleanup),
            None => Ok(None),
        };

        drop(lifetime_lock);
        tracing::debug!(cache = %self.name, "Closed persistent cache");
        result
    }

    fn cleanup_on_close(&self, cleanup: &CacheCleanup) -> WorkspaceResult<Option<CleanupStats>> {
        // the lifetime lock is still held in exclusive mode
        let _guard = match self.lock_mode {
            LockMode::None | LockMode::Exclusive => None,
            LockMode::OnDemand | LockMode::OnDemandExclusive => {
                match FileLockGuard::try_acquire(&self.lock_file, LockAccess::Exclusive, "cleanup")? {
                    Some(guard) => Some(guard),
                    None => {
                        tracing::debug!(cache = %self.name, "Skipping cleanup of cache in use");
                        return Ok(None);
                    }
                }
            }
        };
        cleanup.run_if_due()
    }
}

impl fmt::Debug for PersistentCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentCache")
            .field("name", &self.name)
            .field("base_dir", &self.base_dir)
            .field("lock_mode", &self.lock_mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn lock_mode_tag(mode: LockMode) -> &'static str {
    match mode {
        LockMode::None => "none",
        LockMode::OnDemand => "on_demand",
        LockMode::OnDemandExclusive => "on_demand_exclusive",
        LockMode::Exclusive => "exclusive",
    }
}

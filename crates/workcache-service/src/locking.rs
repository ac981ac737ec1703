//! Cross-process advisory file locks.
//!
//! Locks are taken with `flock` semantics through [`fs2`], so they are bound to an open file
//! description: two handles opened on the same lock file contend with each other even inside a
//! single process, which is what lets two providers over the same directory exclude each other.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::{WorkspaceError, WorkspaceResult};

/// The default time to wait for a lock before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(200);

/// How a persistent cache guards its directory against other processes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// No cross-process locking at all, the caller serializes access some other way.
    None,
    /// The lock is taken for the duration of each locked action, in the requested access.
    OnDemand,
    /// Like [`OnDemand`](Self::OnDemand), but every access is exclusive.
    #[default]
    OnDemandExclusive,
    /// The lock is taken exclusively when the cache is opened and held until it is closed.
    Exclusive,
}

impl LockMode {
    /// The OS-level access a single locked action needs under this mode.
    ///
    /// Returns `None` when no file lock is taken.
    pub fn effective_access(self, requested: LockAccess) -> Option<LockAccess> {
        match self {
            Self::None => None,
            Self::OnDemand => Some(requested),
            Self::OnDemandExclusive | Self::Exclusive => Some(LockAccess::Exclusive),
        }
    }
}

/// The kind of access a locked action asks for.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum LockAccess {
    Shared,
    Exclusive,
}

impl LockAccess {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Exclusive => "exclusive",
        }
    }
}

/// The process holding an exclusive lock, as recorded inside the lock file.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct LockOwner {
    pub pid: u32,
    pub operation: String,
}

impl LockOwner {
    fn current(operation: &str) -> Self {
        Self {
            pid: std::process::id(),
            operation: operation.to_owned(),
        }
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.operation.is_empty() {
            write!(f, "process {}", self.pid)
        } else {
            write!(f, "process {} ({})", self.pid, self.operation)
        }
    }
}

/// A held advisory lock on a lock file.
///
/// The lock is released when the guard is dropped.
pub struct FileLockGuard {
    file: File,
    path: PathBuf,
    access: LockAccess,
}

impl FileLockGuard {
    /// Blocks until the lock at `path` is acquired, or `timeout` has elapsed.
    ///
    /// The lock file and its parent directories are created if they do not exist yet.
    /// `operation` is recorded in the lock file for exclusive locks, so that a contending
    /// process can report who is holding the lock.
    pub fn acquire(
        path: &Path,
        access: LockAccess,
        timeout: Duration,
        operation: &str,
    ) -> WorkspaceResult<Self> {
        let file = open_lock_file(path)?;
        let started = Instant::now();
        let deadline = started + timeout;
        let mut backoff = INITIAL_BACKOFF;

        tracing::debug!(
            path = %path.display(),
            access = access.as_str(),
            "Waiting to acquire lock",
        );

        loop {
            if try_lock(&file, access).map_err(|source| lock_error(path, source))? {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                metric!(counter("workspace.lock.timeout") += 1, "access" => access.as_str());
                return Err(WorkspaceError::LockTimeout {
                    path: path.to_owned(),
                    timeout,
                    owner: read_owner(path),
                });
            }
            sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }

        metric!(
            timer("workspace.lock.wait") = started.elapsed(),
            "access" => access.as_str(),
        );
        Self::locked(file, path, access, operation)
    }

    /// Acquires the lock at `path` if that is possible without waiting.
    pub fn try_acquire(
        path: &Path,
        access: LockAccess,
        operation: &str,
    ) -> WorkspaceResult<Option<Self>> {
        let file = open_lock_file(path)?;
        if !try_lock(&file, access).map_err(|source| lock_error(path, source))? {
            return Ok(None);
        }
        Self::locked(file, path, access, operation).map(Some)
    }

    fn locked(
        mut file: File,
        path: &Path,
        access: LockAccess,
        operation: &str,
    ) -> WorkspaceResult<Self> {
        if access == LockAccess::Exclusive {
            if let Err(source) = write_owner(&mut file, &LockOwner::current(operation)) {
                let _ = FileExt::unlock(&file);
                return Err(lock_error(path, source));
            }
        }
        tracing::debug!(path = %path.display(), access = access.as_str(), "Lock acquired");

        Ok(Self {
            file,
            path: path.to_owned(),
            access,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn access(&self) -> LockAccess {
        self.access
    }
}

impl fmt::Debug for FileLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLockGuard")
            .field("path", &self.path)
            .field("access", &self.access)
            .finish()
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if self.access == LockAccess::Exclusive {
            // a stale owner record would only make timeout messages misleading
            if let Err(e) = self.file.set_len(0) {
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    path = %self.path.display(),
                    "Failed to clear lock owner",
                );
            }
        }
        match FileExt::unlock(&self.file) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Lock released"),
            Err(e) => tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %self.path.display(),
                "Failed to release lock",
            ),
        }
    }
}

/// Reads the owner recorded in the lock file at `path`, if there is one.
pub fn read_owner(path: &Path) -> Option<LockOwner> {
    let mut contents = String::new();
    File::open(path).ok()?.read_to_string(&mut contents).ok()?;
    if contents.trim().is_empty() {
        return None;
    }
    serde_json::from_str(&contents).ok()
}

fn open_lock_file(path: &Path) -> WorkspaceResult<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| lock_error(path, source))?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|source| lock_error(path, source))
}

/// Tries to take the lock, returning `false` if it is contended.
fn try_lock(file: &File, access: LockAccess) -> io::Result<bool> {
    // fully qualified, as `std::fs::File` grew inherent methods of the same names
    let result = match access {
        LockAccess::Shared => FileExt::try_lock_shared(file),
        LockAccess::Exclusive => FileExt::try_lock_exclusive(file),
    };
    match result {
        Ok(()) => Ok(true),
        Err(e) if is_contended(&e) => Ok(false),
        Err(e) => Err(e),
    }
}

fn is_contended(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::WouldBlock
        || error.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn write_owner(file: &mut File, owner: &LockOwner) -> io::Result<()> {
    let record = serde_json::to_vec(owner)?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&record)?;
    file.flush()
}

fn lock_error(path: &Path, source: io::Error) -> WorkspaceError {
    WorkspaceError::Lock {
        path: path.to_owned(),
        source,
    }
}

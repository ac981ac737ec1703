use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::locking::LockOwner;

/// Errors raised while acquiring or using a workspace.
///
/// Every failure in the locking and coalescing paths is propagated as one of these variants,
/// nothing in this crate converts a failure into a sentinel value.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// The key can not be used as a single relative path segment.
    #[error("invalid workspace key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    /// The lock could not be acquired within the configured timeout.
    ///
    /// This usually means another process is holding the cache.
    #[error(
        "timeout waiting {} to lock {}{}",
        humantime::format_duration(*timeout),
        path.display(),
        owner.as_ref().map(|o| format!(", it is currently in use by {o}")).unwrap_or_default()
    )]
    LockTimeout {
        path: PathBuf,
        timeout: Duration,
        owner: Option<LockOwner>,
    },

    /// An I/O error happened while creating, locking or unlocking a lock file.
    #[error("failed to lock {}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A generic I/O error, for example while creating the workspace directory.
    #[error("I/O error on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The action of a coalesced computation failed.
    ///
    /// The executor and every waiter receive the very same underlying error.
    #[error("computation for workspace {key:?} failed")]
    ActionFailed {
        key: String,
        #[source]
        source: SharedError,
    },

    /// A broken bookkeeping invariant. This is a programming error.
    #[error("illegal state: {0}")]
    IllegalState(String),
}

impl WorkspaceError {
    /// Whether this is a lock timeout, as opposed to any other I/O problem.
    ///
    /// Looks through failed actions, as those may have timed out on a lock themselves.
    pub fn is_lock_timeout(&self) -> bool {
        match self {
            Self::LockTimeout { .. } => true,
            Self::ActionFailed { source, .. } => source
                .inner()
                .downcast_ref::<WorkspaceError>()
                .is_some_and(WorkspaceError::is_lock_timeout),
            _ => false,
        }
    }

    #[track_caller]
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        tracing::debug!(
            error = &source as &dyn std::error::Error,
            path = %path.display(),
            "workspace I/O error",
        );
        Self::Io { path, source }
    }

    #[track_caller]
    pub(crate) fn illegal_state(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(%message, "broken workspace invariant");
        Self::IllegalState(message)
    }
}

/// A reference counted error that can be handed to several receivers.
#[derive(Clone)]
pub struct SharedError(Arc<dyn std::error::Error + Send + Sync + 'static>);

impl SharedError {
    pub fn new<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        Self(Arc::from(error.into()))
    }

    /// The wrapped error, which can be downcast to its concrete type.
    pub fn inner(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        &*self.0
    }

    /// Whether both handles refer to the same underlying error.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.0)
    }
}

pub type WorkspaceResult<T> = Result<T, WorkspaceError>;

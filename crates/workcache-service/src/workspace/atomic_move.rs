use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::caching::AccessJournal;
use crate::error::{WorkspaceError, WorkspaceResult};
use crate::utils::fs::copy_dir_all;

use super::WorkspaceKey;

/// The outcome of [`AtomicMoveWorkspace::move_into_place`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveOutcome {
    /// The temporary workspace is now the immutable workspace.
    Moved,
    /// Another producer finished first, its workspace is kept.
    AlreadyPresent,
}

/// Produces a workspace in a temporary directory and atomically renames it into place.
///
/// This needs no lock at all: concurrent producers each fill their own temporary directory and
/// the first rename wins. Readers therefore only ever see a complete workspace or none.
pub struct AtomicMoveWorkspace {
    key: WorkspaceKey,
    location: PathBuf,
    tmp_dir: PathBuf,
    journal: Arc<dyn AccessJournal>,
}

impl AtomicMoveWorkspace {
    pub(super) fn new(
        key: WorkspaceKey,
        location: PathBuf,
        tmp_dir: PathBuf,
        journal: Arc<dyn AccessJournal>,
    ) -> Self {
        Self {
            key,
            location,
            tmp_dir,
            journal,
        }
    }

    pub fn key(&self) -> &WorkspaceKey {
        &self.key
    }

    pub fn immutable_location(&self) -> &Path {
        &self.location
    }

    /// Whether a complete workspace is already in place.
    pub fn is_present(&self) -> bool {
        self.location.is_dir() && !is_empty_dir(&self.location)
    }

    /// Runs `action` with a fresh temporary directory next to the immutable location.
    ///
    /// Whatever is left of the temporary directory when `action` returns is removed, so an
    /// action that did not move it into place leaves nothing behind.
    pub fn with_temporary_workspace<T, E, F>(&self, action: F) -> Result<T, E>
    where
        F: FnOnce(&Path) -> Result<T, E>,
        E: From<WorkspaceError>,
    {
        fs::create_dir_all(&self.tmp_dir).map_err(|e| WorkspaceError::io(&self.tmp_dir, e))?;
        let temp = tempfile::Builder::new()
            .prefix(&format!("{}-", self.key))
            .tempdir_in(&self.tmp_dir)
            .map_err(|e| WorkspaceError::io(&self.tmp_dir, e))?;

        let result = action(temp.path());

        if temp.path().exists() {
            tracing::trace!(path = %temp.path().display(), "Removing temporary workspace");
        }
        drop(temp);
        result
    }

    /// Atomically renames the directory `temp` to the immutable location.
    ///
    /// If a workspace is already in place, a concurrent producer won and its result is kept.
    /// `temp` is then left untouched, inside [`with_temporary_workspace`](Self::with_temporary_workspace)
    /// it is removed afterwards.
    ///
    /// When `temp` cannot be renamed for any other reason, for example because it lives on a
    /// different file system, it is copied next to the immutable location first and that copy
    /// is renamed instead. A regular file at the immutable location is an
    /// [`IllegalState`](WorkspaceError::IllegalState).
    pub fn move_into_place(&self, temp: &Path) -> WorkspaceResult<MoveOutcome> {
        let parent = self.location_parent()?;
        fs::create_dir_all(parent).map_err(|e| WorkspaceError::io(parent, e))?;

        let outcome = match fs::rename(temp, &self.location) {
            Ok(()) => {
                tracing::debug!(key = %self.key, "Moved workspace into place");
                MoveOutcome::Moved
            }
            // renaming onto a non-empty directory fails
            Err(_) if self.is_present() => {
                tracing::debug!(key = %self.key, "Workspace was already produced");
                MoveOutcome::AlreadyPresent
            }
            Err(_) if self.location.is_file() => {
                return Err(self.occupied_by_file());
            }
            Err(e) => {
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    key = %self.key,
                    "Failed to move workspace into place, copying it instead",
                );
                self.copy_into_place(parent, temp)?
            }
        };

        self.journal.mark_accessed(&self.location);
        Ok(outcome)
    }

    fn location_parent(&self) -> WorkspaceResult<&Path> {
        self.location.parent().ok_or_else(|| {
            WorkspaceError::illegal_state(format!(
                "immutable location {} has no parent",
                self.location.display()
            ))
        })
    }

    /// Copies `temp` into a sibling of the immutable location and renames that copy into place.
    fn copy_into_place(&self, parent: &Path, temp: &Path) -> WorkspaceResult<MoveOutcome> {
        // not a valid key, so it is never listed as a workspace
        let copy = tempfile::Builder::new()
            .prefix(&format!(".{}-", self.key))
            .tempdir_in(parent)
            .map_err(|e| WorkspaceError::io(parent, e))?;
        copy_dir_all(temp, copy.path()).map_err(|e| WorkspaceError::io(copy.path(), e))?;

        match fs::rename(copy.path(), &self.location) {
            Ok(()) => {
                tracing::debug!(key = %self.key, "Copied workspace into place");
                Ok(MoveOutcome::Moved)
            }
            Err(_) if self.is_present() => {
                tracing::debug!(key = %self.key, "Workspace was already produced");
                Ok(MoveOutcome::AlreadyPresent)
            }
            Err(_) if self.location.is_file() => Err(self.occupied_by_file()),
            Err(e) => Err(WorkspaceError::io(&self.location, e)),
        }
    }

    fn occupied_by_file(&self) -> WorkspaceError {
        WorkspaceError::illegal_state(format!(
            "immutable location {} is occupied by a file",
            self.location.display()
        ))
    }
}

fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path).is_ok_and(|mut entries| entries.next().is_none())
}

impl fmt::Debug for AtomicMoveWorkspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicMoveWorkspace")
            .field("key", &self.key)
            .field("location", &self.location)
            .finish()
    }
}

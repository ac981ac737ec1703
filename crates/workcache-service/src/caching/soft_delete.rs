use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::utils::fs::{catch_not_found, remove_file_if_exists};
use crate::workspace::WorkspaceKey;

/// Flags cache entries as logically removed until a later sweep reclaims them.
pub trait SoftDeleter: fmt::Debug + Send + Sync {
    fn is_soft_deleted(&self, key: &WorkspaceKey) -> io::Result<bool>;

    /// Marks the entry for `key` as removed.
    fn soft_delete(&self, key: &WorkspaceKey) -> io::Result<()>;

    /// Clears the mark of `key`, returning whether there was one.
    fn remove_soft_delete_marker(&self, key: &WorkspaceKey) -> io::Result<bool>;

    /// When the entry for `key` was marked, if it is.
    fn soft_deleted_at(&self, key: &WorkspaceKey) -> io::Result<Option<SystemTime>>;

    /// All currently marked keys, sorted.
    fn marked_keys(&self) -> io::Result<Vec<WorkspaceKey>>;
}

/// A [`SoftDeleter`] using one empty marker file per key.
///
/// The marker's `mtime` is the time the entry was marked.
#[derive(Clone)]
pub struct MarkerFileSoftDeleter {
    markers_dir: PathBuf,
}

impl MarkerFileSoftDeleter {
    pub fn new(markers_dir: impl Into<PathBuf>) -> Self {
        Self {
            markers_dir: markers_dir.into(),
        }
    }

    pub fn markers_dir(&self) -> &Path {
        &self.markers_dir
    }

    fn marker(&self, key: &WorkspaceKey) -> PathBuf {
        self.markers_dir.join(key.as_str())
    }
}

impl fmt::Debug for MarkerFileSoftDeleter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MarkerFileSoftDeleter")
            .field(&self.markers_dir)
            .finish()
    }
}

impl SoftDeleter for MarkerFileSoftDeleter {
    fn is_soft_deleted(&self, key: &WorkspaceKey) -> io::Result<bool> {
        Ok(catch_not_found(|| self.marker(key).metadata())?.is_some())
    }

    fn soft_delete(&self, key: &WorkspaceKey) -> io::Result<()> {
        fs::create_dir_all(&self.markers_dir)?;
        // truncating an existing marker moves its mtime to now
        fs::write(self.marker(key), b"")?;
        tracing::debug!(%key, "Soft-deleted workspace");
        Ok(())
    }

    fn remove_soft_delete_marker(&self, key: &WorkspaceKey) -> io::Result<bool> {
        let removed = remove_file_if_exists(&self.marker(key))?;
        if removed {
            tracing::debug!(%key, "Removed soft-delete marker");
        }
        Ok(removed)
    }

    fn soft_deleted_at(&self, key: &WorkspaceKey) -> io::Result<Option<SystemTime>> {
        catch_not_found(|| self.marker(key).metadata()?.modified())
    }

    fn marked_keys(&self) -> io::Result<Vec<WorkspaceKey>> {
        let Some(entries) = catch_not_found(|| fs::read_dir(&self.markers_dir))? else {
            return Ok(vec![]);
        };

        let mut keys = vec![];
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            match name.to_str().map(WorkspaceKey::new) {
                Some(Ok(key)) => keys.push(key),
                _ => tracing::warn!(
                    path = %entry.path().display(),
                    "Ignoring unexpected soft-delete marker",
                ),
            }
        }
        keys.sort();
        Ok(keys)
    }
}

use std::io;
use std::path::{Path, PathBuf};

use crate::utils::fs::catch_not_found;
use crate::workspace::WorkspaceKey;

/// Lock file guarding a whole base directory.
const CACHE_LOCK_FILE: &str = ".cache.lock";
/// Directory holding one lock file per key for finer-grained caches.
const LOCKS_DIR: &str = ".locks";
/// Directory holding the soft-delete markers.
const SOFT_DELETED_DIR: &str = ".soft-deleted";
/// Directory for temporary workspaces that are moved into place atomically.
const TMP_DIR: &str = ".tmp";
/// Directory of the internal execution history store.
const HISTORY_DIR: &str = ".history";
/// File whose mtime records the last completed cleanup.
const LAST_CLEANUP_FILE: &str = ".last-cleanup";

/// The on-disk layout below a base directory.
///
/// Every workspace is an immediate subdirectory named after its key. All bookkeeping lives in
/// entries starting with a `.`, which [`WorkspaceKey`] refuses, so the two can never collide.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheLayout {
    base_dir: PathBuf,
}

impl CacheLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// The immutable location of the workspace for `key`.
    pub fn workspace_dir(&self, key: &WorkspaceKey) -> PathBuf {
        self.base_dir.join(key.as_str())
    }

    pub fn cache_lock_file(&self) -> PathBuf {
        self.base_dir.join(CACHE_LOCK_FILE)
    }

    pub fn key_lock_file(&self, key: &WorkspaceKey) -> PathBuf {
        self.base_dir
            .join(LOCKS_DIR)
            .join(format!("{}.lock", key.as_str()))
    }

    pub fn soft_delete_dir(&self) -> PathBuf {
        self.base_dir.join(SOFT_DELETED_DIR)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.base_dir.join(TMP_DIR)
    }

    pub fn history_dir(&self) -> PathBuf {
        self.base_dir.join(HISTORY_DIR)
    }

    pub fn last_cleanup_file(&self) -> PathBuf {
        self.base_dir.join(LAST_CLEANUP_FILE)
    }

    /// Lists the keys of all workspace directories currently present.
    ///
    /// Bookkeeping entries and anything that is not a directory named like a valid key are
    /// skipped. The keys are returned sorted.
    pub fn workspace_keys(&self) -> io::Result<Vec<WorkspaceKey>> {
        let Some(entries) = catch_not_found(|| std::fs::read_dir(&self.base_dir))? else {
            return Ok(vec![]);
        };

        let mut keys = vec![];
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if let Ok(key) = WorkspaceKey::new(name) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

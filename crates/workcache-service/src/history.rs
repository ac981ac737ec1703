use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use tempfile::NamedTempFile;

use crate::utils::fs::{catch_not_found, persist_tempfile, remove_file_if_exists};
use crate::workspace::WorkspaceKey;

/// Stores what is known about previous executions of a workspace's unit of work.
///
/// The contents are opaque to this crate, the store is only handed to workspace actions.
pub trait ExecutionHistoryStore: fmt::Debug + Send + Sync {
    fn load(&self, key: &WorkspaceKey) -> io::Result<Option<Vec<u8>>>;

    fn store(&self, key: &WorkspaceKey, history: &[u8]) -> io::Result<()>;

    fn remove(&self, key: &WorkspaceKey) -> io::Result<()>;
}

/// An [`ExecutionHistoryStore`] keeping one file per key.
///
/// Entries are written to a temporary file first and atomically moved in place, so a reader
/// never sees a partially written entry.
#[derive(Clone, Debug)]
pub struct FileHistoryStore {
    dir: PathBuf,
}

impl FileHistoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn entry(&self, key: &WorkspaceKey) -> PathBuf {
        self.dir.join(format!("{}.bin", key.as_str()))
    }
}

impl ExecutionHistoryStore for FileHistoryStore {
    fn load(&self, key: &WorkspaceKey) -> io::Result<Option<Vec<u8>>> {
        catch_not_found(|| fs::read(self.entry(key)))
    }

    fn store(&self, key: &WorkspaceKey, history: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut temp_file = NamedTempFile::new_in(&self.dir)?;
        temp_file.write_all(history)?;
        temp_file.flush()?;
        persist_tempfile(temp_file, &self.entry(key))?;
        tracing::trace!(%key, bytes = history.len(), "Stored execution history");
        Ok(())
    }

    fn remove(&self, key: &WorkspaceKey) -> io::Result<()> {
        remove_file_if_exists(&self.entry(key))?;
        Ok(())
    }
}

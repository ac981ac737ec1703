use std::fmt;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

use filetime::FileTime;

use crate::utils::fs::catch_not_found;

/// The default debounce interval of [`ModificationTimeJournal`].
pub const DEFAULT_TOUCH_EVERY: Duration = Duration::from_secs(3600);

/// Records when cache entries were last used, so that cleanup can find unused ones.
pub trait AccessJournal: fmt::Debug + Send + Sync {
    /// Records an access to the entry at `path`.
    ///
    /// Accesses are best effort: a failure to record one is logged and otherwise ignored.
    fn mark_accessed(&self, path: &Path);

    /// The last recorded access of the entry at `path`, or `None` if the entry does not exist.
    fn last_accessed(&self, path: &Path) -> io::Result<Option<SystemTime>>;
}

/// An [`AccessJournal`] keeping the last access time in the entry's `mtime`.
///
/// Workspaces use a "time to idle" instead of a "time to live" mode, so they have to be
/// touched regularly to signal that they are still in use. This is debounced to once every
/// `touch_every` to not have to touch them on every single use. The configured retention
/// therefore has to be at least `touch_every`.
#[derive(Clone, Debug)]
pub struct ModificationTimeJournal {
    touch_every: Duration,
}

impl ModificationTimeJournal {
    pub fn new(touch_every: Duration) -> Self {
        Self { touch_every }
    }

    fn touch(&self, path: &Path) -> io::Result<()> {
        let Some(metadata) = catch_not_found(|| path.metadata())? else {
            tracing::trace!(path = %path.display(), "Not touching missing entry");
            return Ok(());
        };

        // an mtime in the future means somebody touched it just now
        let should_touch = metadata
            .modified()?
            .elapsed()
            .is_ok_and(|elapsed| elapsed >= self.touch_every);

        if should_touch {
            tracing::trace!(path = %path.display(), "Touching entry");
            filetime::set_file_mtime(path, FileTime::now())?;
        }
        Ok(())
    }
}

impl Default for ModificationTimeJournal {
    fn default() -> Self {
        Self::new(DEFAULT_TOUCH_EVERY)
    }
}

impl AccessJournal for ModificationTimeJournal {
    fn mark_accessed(&self, path: &Path) {
        if let Err(e) = self.touch(path) {
            tracing::warn!(
                error = &e as &dyn std::error::Error,
                path = %path.display(),
                "Failed to record access",
            );
        }
    }

    fn last_accessed(&self, path: &Path) -> io::Result<Option<SystemTime>> {
        catch_not_found(|| path.metadata()?.modified())
    }
}

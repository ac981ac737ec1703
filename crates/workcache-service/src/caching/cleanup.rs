use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Result, anyhow};
use filetime::FileTime;
use serde::{Deserialize, Deserializer, Serialize, de};

use crate::config::{CleanupConfig, Config, Granularity};
use crate::error::{WorkspaceError, WorkspaceResult};
use crate::locking::{FileLockGuard, LockAccess, LockMode};
use crate::utils::fs::{catch_not_found, directory_size, remove_dir_all_if_exists};
use crate::workspace::WorkspaceKey;

use super::journal::{AccessJournal, ModificationTimeJournal};
use super::layout::CacheLayout;
use super::soft_delete::{MarkerFileSoftDeleter, SoftDeleter};

const DAY: Duration = Duration::from_secs(3600 * 24);

/// Entry function for the cleanup command.
///
/// Runs one mark-and-sweep pass over the configured cache directory, regardless of the
/// configured frequency. If `dry_run` is `true`, nothing is marked or deleted.
pub fn cleanup(config: &Config, dry_run: bool) -> Result<CleanupStats> {
    let cache_dir = config.cache_dir.as_ref().ok_or_else(|| {
        anyhow!("no caching configured! Did you provide a path to your config file?")
    })?;
    let layout = CacheLayout::new(cache_dir);

    let (sweep_locking, _guard) = match config.granularity {
        Granularity::FineGrained => (SweepLocking::PerKey, None),
        Granularity::Coarse => {
            let guard = match config.lock_mode {
                LockMode::None => None,
                _ => Some(FileLockGuard::acquire(
                    &layout.cache_lock_file(),
                    LockAccess::Exclusive,
                    config.lock_timeout,
                    "cleanup",
                )?),
            };
            (SweepLocking::HeldByCaller, guard)
        }
    };

    let cleanup = CacheCleanup {
        strategy: CleanupStrategy::from_config(&config.cleanup),
        journal: Arc::new(ModificationTimeJournal::new(config.cleanup.touch_every)),
        soft_deleter: Arc::new(MarkerFileSoftDeleter::new(layout.soft_delete_dir())),
        layout,
        sweep_locking,
    };
    Ok(cleanup.run(dry_run)?)
}

/// How often a cache runs its cleanup when it is closed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CleanupFrequency {
    Never,
    Always,
    #[default]
    Daily,
    Every(Duration),
}

impl CleanupFrequency {
    /// Whether a cleanup is due, given when the last one finished.
    pub fn should_cleanup(self, last_cleanup: Option<SystemTime>, now: SystemTime) -> bool {
        let interval = match self {
            Self::Never => return false,
            Self::Always => return true,
            Self::Daily => DAY,
            Self::Every(interval) => interval,
        };
        match last_cleanup {
            None => true,
            // a last cleanup in the future means the clock was turned back
            Some(last) => now.duration_since(last).map_or(true, |age| age >= interval),
        }
    }
}

impl<'de> Deserialize<'de> for CleanupFrequency {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(CleanupFrequencyVisitor)
    }
}

struct CleanupFrequencyVisitor;

impl de::Visitor<'_> for CleanupFrequencyVisitor {
    type Value = CleanupFrequency;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(
            formatter,
            r#"one of the strings "never", "always", "daily", or a duration like "6h""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "never" => Ok(CleanupFrequency::Never),
            "always" => Ok(CleanupFrequency::Always),
            "daily" => Ok(CleanupFrequency::Daily),
            _ => humantime::parse_duration(v)
                .map(CleanupFrequency::Every)
                .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(v), &self)),
        }
    }
}

type RetentionSupplier = Arc<dyn Fn() -> Option<Duration> + Send + Sync>;
type FrequencySupplier = Arc<dyn Fn() -> CleanupFrequency + Send + Sync>;

/// Decides when entries are marked and when a cleanup pass runs.
///
/// Both values are read through suppliers every time they are needed, so they can follow
/// settings that change while a cache is open.
#[derive(Clone)]
pub struct CleanupStrategy {
    retention: RetentionSupplier,
    frequency: FrequencySupplier,
}

impl CleanupStrategy {
    pub fn new<R, F>(retention: R, frequency: F) -> Self
    where
        R: Fn() -> Option<Duration> + Send + Sync + 'static,
        F: Fn() -> CleanupFrequency + Send + Sync + 'static,
    {
        Self {
            retention: Arc::new(retention),
            frequency: Arc::new(frequency),
        }
    }

    pub fn from_config(config: &CleanupConfig) -> Self {
        let config = *config;
        Self::new(move || config.retention, move || config.frequency)
    }

    /// A strategy that never runs and never marks anything.
    pub fn never() -> Self {
        Self::new(|| None, || CleanupFrequency::Never)
    }

    /// Entries unused for longer than this are marked. `None` disables marking.
    pub fn retention(&self) -> Option<Duration> {
        (self.retention)()
    }

    pub fn frequency(&self) -> CleanupFrequency {
        (self.frequency)()
    }

    /// Whether a cleanup of `layout` is due according to the recorded last cleanup.
    pub fn is_due(&self, layout: &CacheLayout) -> io::Result<bool> {
        let frequency = self.frequency();
        if frequency == CleanupFrequency::Never {
            return Ok(false);
        }
        let path = layout.last_cleanup_file();
        let last_cleanup = catch_not_found(|| path.metadata()?.modified())?;
        Ok(frequency.should_cleanup(last_cleanup, SystemTime::now()))
    }
}

impl Default for CleanupStrategy {
    fn default() -> Self {
        Self::from_config(&Default::default())
    }
}

impl fmt::Debug for CleanupStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupStrategy")
            .field("retention", &self.retention())
            .field("frequency", &self.frequency())
            .finish()
    }
}

/// How a sweep makes sure no one is using an entry it removes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SweepLocking {
    /// The caller holds a lock covering the whole base directory.
    HeldByCaller,
    /// Each entry's own lock is taken without waiting, contended entries are skipped.
    PerKey,
}

/// Counters of a single cleanup pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct CleanupStats {
    /// Entries newly marked as soft-deleted.
    pub marked: usize,
    /// Marked entries that were used again and got their mark cleared.
    pub resurrected: usize,
    /// Marked entries skipped because someone holds their lock.
    pub locked: usize,
    pub removed_dirs: usize,
    pub removed_bytes: u64,
    /// Leftover temporary workspaces.
    pub removed_tmp_dirs: usize,
    pub retained_dirs: usize,
}

/// Everything needed to run mark-and-sweep over one base directory.
#[derive(Clone, Debug)]
pub struct CacheCleanup {
    pub strategy: CleanupStrategy,
    pub layout: CacheLayout,
    pub journal: Arc<dyn AccessJournal>,
    pub soft_deleter: Arc<dyn SoftDeleter>,
    pub sweep_locking: SweepLocking,
}

impl CacheCleanup {
    /// Runs a cleanup pass if the strategy says one is due.
    pub fn run_if_due(&self) -> WorkspaceResult<Option<CleanupStats>> {
        let base_dir = self.layout.base_dir();
        let due = self
            .strategy
            .is_due(&self.layout)
            .map_err(|e| WorkspaceError::io(base_dir, e))?;
        if !due {
            tracing::trace!(path = %base_dir.display(), "Cleanup not due");
            return Ok(None);
        }
        self.run(false).map(Some)
    }

    /// Runs one mark-and-sweep pass.
    ///
    /// Only entries that were already marked before this pass are swept, so an entry always
    /// survives at least one pass after it was marked. If `dry_run` is `true`, nothing is
    /// marked or deleted and the returned stats describe what would have happened.
    pub fn run(&self, dry_run: bool) -> WorkspaceResult<CleanupStats> {
        let base_dir = self.layout.base_dir();
        tracing::info!(path = %base_dir.display(), dry_run, "Cleaning up workspaces");
        let io_err = |e| WorkspaceError::io(base_dir, e);

        let now = SystemTime::now();
        let mut stats = CleanupStats::default();

        let previously_marked: BTreeSet<_> =
            self.soft_deleter.marked_keys().map_err(io_err)?.into_iter().collect();
        let keys = self.layout.workspace_keys().map_err(io_err)?;

        if let Some(retention) = self.strategy.retention() {
            for key in keys.iter().filter(|key| !previously_marked.contains(*key)) {
                let dir = self.layout.workspace_dir(key);
                let Some(last_accessed) =
                    self.journal.last_accessed(&dir).map_err(|e| WorkspaceError::io(&dir, e))?
                else {
                    continue;
                };
                if now
                    .duration_since(last_accessed)
                    .is_ok_and(|unused_for| unused_for > retention)
                {
                    if !dry_run {
                        self.soft_deleter
                            .soft_delete(key)
                            .map_err(|e| WorkspaceError::io(&dir, e))?;
                    }
                    stats.marked += 1;
                }
            }
        }

        for key in &previously_marked {
            self.sweep(key, dry_run, &mut stats)?;
        }
        stats.retained_dirs = keys.len().saturating_sub(stats.removed_dirs);

        if let Some(retention) = self.strategy.retention() {
            self.remove_stale_tmp_dirs(now, retention, dry_run, &mut stats)?;
        }

        if !dry_run {
            let path = self.layout.last_cleanup_file();
            fs::write(&path, b"")
                .and_then(|_| filetime::set_file_mtime(&path, FileTime::now()))
                .map_err(|e| WorkspaceError::io(&path, e))?;
        }

        tracing::info!(path = %base_dir.display(), "Cleaning up workspaces complete");
        tracing::info!(
            "Marked {} and resurrected {} workspaces, {} marked workspaces are in use",
            stats.marked,
            stats.resurrected,
            stats.locked,
        );
        tracing::info!(
            "Removed {} directories totaling {} bytes, retained {} directories",
            stats.removed_dirs,
            stats.removed_bytes,
            stats.retained_dirs,
        );

        if !dry_run {
            metric!(counter("caches.cleanup.marked") += stats.marked as i64);
            metric!(counter("caches.cleanup.removed_dirs") += stats.removed_dirs as i64);
            metric!(counter("caches.cleanup.removed_bytes") += stats.removed_bytes as i64);
        }

        Ok(stats)
    }

    /// Sweeps a single marked entry.
    fn sweep(
        &self,
        key: &WorkspaceKey,
        dry_run: bool,
        stats: &mut CleanupStats,
    ) -> WorkspaceResult<()> {
        let dir = self.layout.workspace_dir(key);
        let io_err = |e| WorkspaceError::io(&dir, e);

        let _guard = match self.sweep_locking {
            SweepLocking::HeldByCaller => None,
            SweepLocking::PerKey => {
                let lock_file = self.layout.key_lock_file(key);
                match FileLockGuard::try_acquire(&lock_file, LockAccess::Exclusive, "cleanup")? {
                    Some(guard) => Some(guard),
                    None => {
                        tracing::debug!(%key, "Not sweeping workspace in use");
                        stats.locked += 1;
                        return Ok(());
                    }
                }
            }
        };

        // the entry may have been resurrected while we were waiting
        let Some(marked_at) = self.soft_deleter.soft_deleted_at(key).map_err(io_err)? else {
            return Ok(());
        };
        let last_accessed = self.journal.last_accessed(&dir).map_err(io_err)?;
        if last_accessed.is_some_and(|accessed| accessed > marked_at) {
            tracing::debug!(%key, "Workspace was used after it was marked");
            if !dry_run {
                self.soft_deleter
                    .remove_soft_delete_marker(key)
                    .map_err(io_err)?;
            }
            stats.resurrected += 1;
            return Ok(());
        }

        let size = directory_size(&dir).map_err(io_err)?;
        tracing::debug!(%key, size, "Removing workspace");
        if !dry_run {
            if let Err(e) = remove_dir_all_if_exists(&dir) {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %dir.display(),
                    "Failed to remove workspace",
                );
                return Err(io_err(e));
            }
            // the lock file stays, unlinking it would let two processes lock different inodes
            self.soft_deleter
                .remove_soft_delete_marker(key)
                .map_err(io_err)?;
        }
        if last_accessed.is_some() {
            stats.removed_dirs += 1;
            stats.removed_bytes += size;
        }
        Ok(())
    }

    /// Removes temporary workspaces left behind by crashed processes.
    fn remove_stale_tmp_dirs(
        &self,
        now: SystemTime,
        retention: Duration,
        dry_run: bool,
        stats: &mut CleanupStats,
    ) -> WorkspaceResult<()> {
        let tmp_dir = self.layout.tmp_dir();
        let io_err = |e| WorkspaceError::io(&tmp_dir, e);
        let Some(entries) = catch_not_found(|| fs::read_dir(&tmp_dir)).map_err(io_err)? else {
            return Ok(());
        };

        for entry in entries {
            let path = entry.map_err(io_err)?.path();
            let Some(modified) =
                catch_not_found(|| path.metadata()?.modified()).map_err(io_err)?
            else {
                continue;
            };
            if now.duration_since(modified).is_ok_and(|age| age > retention) {
                tracing::debug!(path = %path.display(), "Removing stale temporary workspace");
                if !dry_run {
                    remove_dir_all_if_exists(&path).map_err(|e| WorkspaceError::io(&path, e))?;
                }
                stats.removed_tmp_dirs += 1;
            }
        }
        Ok(())
    }
}

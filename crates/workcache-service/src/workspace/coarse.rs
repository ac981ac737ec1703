use std::path::Path;
use std::sync::Arc;

use crate::caching::{CacheOptions, PersistentCache, SweepLocking};
use crate::error::{WorkspaceError, WorkspaceResult};
use crate::history::ExecutionHistoryStore;
use crate::locking::LockAccess;

use super::{
    AtomicMoveWorkspace, LockingWorkspace, ProviderContext, ProviderOptions, Workspace,
    WorkspaceKey, WorkspaceProvider,
};

/// A provider guarding its whole base directory with a single [`PersistentCache`].
///
/// Every key serializes against every other key, in this and in other processes.
#[derive(Debug)]
pub struct CacheBasedWorkspaceProvider {
    context: ProviderContext,
    cache: Arc<PersistentCache>,
}

impl CacheBasedWorkspaceProvider {
    pub fn open(options: ProviderOptions) -> WorkspaceResult<Self> {
        let context = options.into_context()?;
        let layout = &context.layout;

        let mut cache_options = CacheOptions::new(
            "workspaces",
            layout.base_dir(),
            layout.cache_lock_file(),
        );
        cache_options.lock_mode = context.lock_mode;
        cache_options.lock_timeout = context.lock_timeout;
        cache_options.cleanup = Some(context.cache_cleanup(SweepLocking::HeldByCaller));

        let cache = PersistentCache::open(cache_options)?;
        Ok(Self { context, cache })
    }

    /// The workspace for `key`, with the operations for coalesced computations.
    pub fn workspace(&self, key: &WorkspaceKey) -> LockingWorkspace {
        LockingWorkspace::new(key.clone(), &self.context, Arc::clone(&self.cache))
    }

    pub fn atomic_move_workspace(&self, key: &WorkspaceKey) -> AtomicMoveWorkspace {
        self.context.atomic_move_workspace(key)
    }

    pub fn base_dir(&self) -> &Path {
        self.context.layout.base_dir()
    }
}

impl WorkspaceProvider for CacheBasedWorkspaceProvider {
    fn get_workspace(&self, key: &WorkspaceKey) -> Workspace {
        self.context.workspace(key)
    }

    fn with_workspace<T, E, F>(&self, key: &WorkspaceKey, action: F) -> Result<T, E>
    where
        F: FnOnce(&Path, &dyn ExecutionHistoryStore) -> Result<T, E>,
        E: From<WorkspaceError>,
    {
        self.cache.with_file_lock(LockAccess::Exclusive, || {
            let location = self.context.prepare(key)?;
            action(&location, &*self.context.history)
        })
    }

    fn close(&self) -> WorkspaceResult<()> {
        self.cache.close()?;
        Ok(())
    }
}
